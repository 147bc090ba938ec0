use std::borrow::Cow;
use std::collections::HashSet;

use crate::model::NewsItem;

/// How two titles are compared when deciding whether an item was already
/// published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TitleMatch {
    /// Titles must be identical, byte for byte
    #[default]
    Exact,
    /// Titles are compared after [`normalize_title`]
    Normalized,
}

impl TitleMatch {
    /// Comparison key of `title` under this mode.
    pub fn key(self, title: &str) -> Cow<'_, str> {
        match self {
            TitleMatch::Exact => Cow::Borrowed(title),
            TitleMatch::Normalized => Cow::Owned(normalize_title(title)),
        }
    }
}

/// Normalize a title for lenient comparison.
///
/// Collapses whitespace, strips trailing punctuation and lowercases.
pub fn normalize_title(title: &str) -> String {
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c == '…')
        .trim_end()
        .to_lowercase()
}

/// Candidates whose title is not in `history_titles`, in input order.
pub fn select_new<'h>(
    candidates: Vec<NewsItem>,
    history_titles: impl IntoIterator<Item = &'h str>,
    title_match: TitleMatch,
) -> Vec<NewsItem> {
    let published: HashSet<Cow<'h, str>> = history_titles
        .into_iter()
        .map(|title| title_match.key(title))
        .collect();

    candidates
        .into_iter()
        .filter(|item| !published.contains(&*title_match.key(&item.title)))
        .collect()
}

/// Drop candidates without a usable title and repeated titles within one
/// batch. The first occurrence wins.
pub fn distinct_titles(candidates: Vec<NewsItem>, title_match: TitleMatch) -> Vec<NewsItem> {
    let mut seen = HashSet::new();

    candidates
        .into_iter()
        .filter(|item| {
            if item.title.trim().is_empty() {
                return false;
            }
            seen.insert(title_match.key(&item.title).into_owned())
        })
        .collect()
}
