use std::time::Duration;

use medpost_util_error::FmtCompact as _;
use rand::seq::IndexedRandom as _;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};
use url::Url;

use crate::model::NewsItem;

const LOG_TARGET: &str = "medpost_bot::scraper";

/// User-Agent values a fetch picks from at random.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (iPad; CPU OS 13_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.3 Mobile/15E148 Safari/604.1",
];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGES: &str = "uk-UA,uk;q=0.9,ru;q=0.8,en-US;q=0.7,en;q=0.6";
const REFERER_URL: &str = "https://www.google.com/";

#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("Failed to create HTTP client: {source}"))]
    Client { source: reqwest::Error },
    #[snafu(display("HTTP request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Unexpected HTTP status {status}"))]
    Status { status: StatusCode },
    #[snafu(display("Invalid selector: {selector}"))]
    Selector { selector: &'static str },
    #[snafu(display("Invalid source URL {url}: {source}"))]
    SourceUrl {
        url: String,
        source: url::ParseError,
    },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Site-specific extraction rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRules {
    Who,
    Medscape,
    PubMed,
    MedicalNewsToday,
}

#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Display name attached to every item from this source
    pub name: String,
    pub url: Url,
    pub rules: SiteRules,
    /// Skip TLS certificate validation for this source.
    ///
    /// An operational workaround for sites with broken chains, not
    /// something to enable casually.
    pub insecure_tls: bool,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, url: &str, rules: SiteRules) -> FetchResult<Self> {
        Ok(Self {
            name: name.into(),
            url: Url::parse(url).context(SourceUrlSnafu { url })?,
            rules,
            insecure_tls: false,
        })
    }
}

/// The fixed set of medical news sources.
pub fn default_sources() -> FetchResult<Vec<SourceDescriptor>> {
    Ok(vec![
        SourceDescriptor::new("ВООЗ Новини", "https://www.who.int/news-room", SiteRules::Who)?,
        SourceDescriptor::new(
            "Medscape Headlines",
            "https://www.medscape.com/headlines",
            SiteRules::Medscape,
        )?,
        SourceDescriptor::new(
            "PubMed Medical News",
            "https://pubmed.ncbi.nlm.nih.gov/?term=medical+news&sort=pubdate&size=10",
            SiteRules::PubMed,
        )?,
        SourceDescriptor::new(
            "Medical News Today",
            "https://www.medicalnewstoday.com/news",
            SiteRules::MedicalNewsToday,
        )?,
    ])
}

/// Produces candidate items for a source.
///
/// Never fails: an unreachable or unparseable source yields no items.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceDescriptor) -> Vec<NewsItem>;
}

/// Fetches source pages over HTTP and extracts items with [`parse_items`].
pub struct HtmlFetcher {
    client: Client,
    insecure_client: Client,
}

impl HtmlFetcher {
    pub fn new(timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(ClientSnafu)?;
        let insecure_client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .context(ClientSnafu)?;

        Ok(Self {
            client,
            insecure_client,
        })
    }

    pub async fn try_fetch(&self, source: &SourceDescriptor) -> FetchResult<Vec<NewsItem>> {
        info!(target: LOG_TARGET, source = %source.name, url = %source.url, "Fetching source");

        let client = if source.insecure_tls {
            warn!(target: LOG_TARGET, source = %source.name, "TLS certificate validation disabled for source");
            &self.insecure_client
        } else {
            &self.client
        };

        let response = client
            .get(source.url.clone())
            .header(USER_AGENT, random_user_agent())
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGES)
            .header(REFERER, REFERER_URL)
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        debug!(target: LOG_TARGET, source = %source.name, %status, "Source responded");
        if !status.is_success() {
            return StatusSnafu { status }.fail();
        }

        let html = response.text().await.context(HttpSnafu)?;
        let items = parse_items(source, &html)?;

        info!(target: LOG_TARGET, source = %source.name, count = items.len(), "Fetched items");
        Ok(items)
    }
}

#[async_trait::async_trait]
impl SourceFetcher for HtmlFetcher {
    async fn fetch(&self, source: &SourceDescriptor) -> Vec<NewsItem> {
        match self.try_fetch(source).await {
            Ok(items) => items,
            Err(err) => {
                warn!(target: LOG_TARGET, source = %source.name, err = %err.fmt_compact(), "Failed to fetch source");
                Vec::new()
            }
        }
    }
}

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Collapse runs of whitespace and trim.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(selector: &'static str) -> FetchResult<Selector> {
    Selector::parse(selector).map_err(|_| FetchError::Selector { selector })
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

/// Extract news items from a source page using the source's rules.
pub fn parse_items(source: &SourceDescriptor, html: &str) -> FetchResult<Vec<NewsItem>> {
    let document = Html::parse_document(html);

    let items = match source.rules {
        SiteRules::Who => parse_who(source, &document)?,
        SiteRules::Medscape => parse_medscape(source, &document)?,
        SiteRules::PubMed => parse_pubmed(source, &document)?,
        SiteRules::MedicalNewsToday => parse_medical_news_today(source, &document)?,
    };

    Ok(items)
}

/// Build an item, resolving `href` against the source URL. Returns `None` if
/// the title is blank or the link is unusable.
fn make_item(
    source: &SourceDescriptor,
    title: String,
    href: Option<&str>,
    published: Option<String>,
) -> Option<NewsItem> {
    if title.is_empty() {
        return None;
    }

    let Some(href) = href else {
        debug!(target: LOG_TARGET, source = %source.name, %title, "Item without link, skipping");
        return None;
    };
    let link = match source.url.join(href.trim()) {
        Ok(link) => link,
        Err(err) => {
            debug!(target: LOG_TARGET, source = %source.name, %href, err = %err.fmt_compact(), "Unusable item link, skipping");
            return None;
        }
    };

    let item = NewsItem::new(title, link.as_str(), source.name.clone());
    Some(match published.filter(|p| !p.is_empty()) {
        Some(published) => item.with_published(published),
        None => item,
    })
}

fn parse_who(source: &SourceDescriptor, document: &Html) -> FetchResult<Vec<NewsItem>> {
    let item_selector = selector(".list-view--item")?;
    let title_selector = selector(".heading")?;
    let link_selector = selector("a[href]")?;
    let date_selector = selector(".timestamp")?;

    Ok(document
        .select(&item_selector)
        .filter_map(|element| {
            let title = element_text(element.select(&title_selector).next()?);
            let href = element
                .select(&link_selector)
                .next()
                .and_then(|a| a.value().attr("href"));
            let date = element.select(&date_selector).next().map(element_text);
            make_item(source, title, href, date)
        })
        .collect())
}

fn parse_medscape(source: &SourceDescriptor, document: &Html) -> FetchResult<Vec<NewsItem>> {
    let item_selector = selector(".headline")?;
    let title_selector = selector("a")?;

    Ok(document
        .select(&item_selector)
        .filter_map(|element| {
            let title_element = element.select(&title_selector).next()?;
            make_item(
                source,
                element_text(title_element),
                title_element.value().attr("href"),
                None,
            )
        })
        .collect())
}

fn parse_pubmed(source: &SourceDescriptor, document: &Html) -> FetchResult<Vec<NewsItem>> {
    let item_selector = selector(".docsum-content")?;
    let title_selector = selector(".docsum-title")?;
    let date_selector = selector(".docsum-journal-citation")?;

    Ok(document
        .select(&item_selector)
        .filter_map(|element| {
            let title_element = element.select(&title_selector).next()?;
            let date = element.select(&date_selector).next().map(element_text);
            make_item(
                source,
                element_text(title_element),
                title_element.value().attr("href"),
                date,
            )
        })
        .collect())
}

fn parse_medical_news_today(
    source: &SourceDescriptor,
    document: &Html,
) -> FetchResult<Vec<NewsItem>> {
    let item_selector = selector("article")?;
    let title_selector = selector("h2 a")?;
    let date_selector = selector("time")?;

    Ok(document
        .select(&item_selector)
        .filter_map(|element| {
            let title_element = element.select(&title_selector).next()?;
            let date = element
                .select(&date_selector)
                .next()
                .and_then(|time| time.value().attr("datetime"))
                .map(clean_text);
            make_item(
                source,
                element_text(title_element),
                title_element.value().attr("href"),
                date,
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(rules: SiteRules) -> SourceDescriptor {
        let sources = default_sources().unwrap();
        sources
            .into_iter()
            .find(|s| s.rules == rules)
            .expect("every rule set has a default source")
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  New \n\t guidelines  "), "New guidelines");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn random_user_agent_is_from_pool() {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }

    #[test]
    fn default_sources_are_all_secure() {
        let sources = default_sources().unwrap();
        assert_eq!(sources.len(), 4);
        assert!(sources.iter().all(|s| !s.insecure_tls));
    }

    #[test]
    fn parses_who_newsroom() {
        let html = r#"
            <div class="list-view--item">
              <a href="/news/item/15-06-2025-new-cardiovascular-guidelines">
                <p class="heading">  New cardiovascular
                   guidelines </p>
                <span class="timestamp">15 June 2025</span>
              </a>
            </div>
            <div class="list-view--item"><a href="/x">no heading here</a></div>
        "#;

        let items = parse_items(&source(SiteRules::Who), html).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "New cardiovascular guidelines");
        assert_eq!(
            items[0].link,
            "https://www.who.int/news/item/15-06-2025-new-cardiovascular-guidelines"
        );
        assert_eq!(items[0].published.as_deref(), Some("15 June 2025"));
        assert_eq!(items[0].source, "ВООЗ Новини");
    }

    #[test]
    fn parses_medscape_headlines() {
        let html = r#"
            <div class="headline"><a href="/viewarticle/1001">Drug approved</a></div>
            <div class="headline"><a href="/viewarticle/1002"> </a></div>
        "#;

        let items = parse_items(&source(SiteRules::Medscape), html).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://www.medscape.com/viewarticle/1001");
        assert_eq!(items[0].published, None);
    }

    #[test]
    fn parses_pubmed_results() {
        let html = r#"
            <div class="docsum-content">
              <a class="docsum-title" href="/39000001/">Microplastics and <b>human</b> health</a>
              <span class="docsum-journal-citation">Lancet. 2025 Jun;</span>
            </div>
        "#;

        let items = parse_items(&source(SiteRules::PubMed), html).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Microplastics and human health");
        assert_eq!(items[0].link, "https://pubmed.ncbi.nlm.nih.gov/39000001/");
        assert_eq!(items[0].published.as_deref(), Some("Lancet. 2025 Jun;"));
    }

    #[test]
    fn parses_medical_news_today_articles() {
        let html = r#"
            <article>
              <h2><a href="https://www.medicalnewstoday.com/articles/1">Sleep and memory</a></h2>
              <time datetime="2025-06-15">June 15</time>
            </article>
            <article><h3>Not a news card</h3></article>
        "#;

        let items = parse_items(&source(SiteRules::MedicalNewsToday), html).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://www.medicalnewstoday.com/articles/1");
        assert_eq!(items[0].published.as_deref(), Some("2025-06-15"));
    }

    #[test]
    fn page_without_items_yields_nothing() {
        let items = parse_items(&source(SiteRules::Who), "<html><body></body></html>").unwrap();
        assert!(items.is_empty());
    }
}
