use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::publisher::ParseMode;

/// Label of the attribution line appended below every generated post.
pub const SOURCE_LABEL: &str = "Джерело";

/// A candidate news item as returned by a source fetcher.
///
/// `title` is the item's identity for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub link: String,
    pub source: String,
    /// Publication date as displayed by the source, not normalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl NewsItem {
    pub fn new(
        title: impl Into<String>,
        link: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            source: source.into(),
            published: None,
            summary: None,
        }
    }

    pub fn with_published(mut self, published: impl Into<String>) -> Self {
        self.published = Some(published.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// One entry of the publish history: an item that was delivered and
/// acknowledged by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub title: String,
    pub link: String,
    #[serde(with = "timestamp")]
    pub published_at: OffsetDateTime,
}

impl HistoryRecord {
    pub fn for_item(item: &NewsItem, published_at: OffsetDateTime) -> Self {
        Self {
            title: item.title.clone(),
            link: item.link.clone(),
            published_at,
        }
    }
}

/// Parse a history timestamp.
///
/// RFC 3339 is what gets written. Timestamps without an offset, as in
/// `2025-06-15T10:30:00.123456`, are accepted too and taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(raw, &Rfc3339).or_else(|_| {
        PrimitiveDateTime::parse(
            raw,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"),
        )
        .map(PrimitiveDateTime::assume_utc)
    })
}

mod timestamp {
    use serde::de::Error;
    use serde::{Deserialize as _, Deserializer, Serializer};
    use time::OffsetDateTime;

    use super::parse_timestamp;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(Error::custom)
    }
}

/// Post text produced for a single item, kept only until it is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub original_title: String,
    pub generated_content: String,
    pub source: String,
    pub link: String,
}

impl GeneratedPost {
    pub fn new(item: &NewsItem, generated_content: String) -> Self {
        Self {
            original_title: item.title.clone(),
            generated_content,
            source: item.source.clone(),
            link: item.link.clone(),
        }
    }

    /// Final message body: generated text followed by the source link.
    ///
    /// The generated text is treated as plain text and escaped for
    /// `parse_mode` like the link.
    pub fn render_message(&self, parse_mode: ParseMode) -> String {
        format!(
            "{}\n\n{SOURCE_LABEL}: {}",
            parse_mode.escape(self.generated_content.trim_end()),
            parse_mode.escape(&self.link)
        )
    }
}
