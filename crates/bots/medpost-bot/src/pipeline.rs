//! The deduplicated publish pipeline.
//!
//! One [`PipelineRunner::run`] is a single sequential pass:
//! fetch every source, drop already-published titles, then for at most
//! `max_per_run` items generate a post, publish it and record it in the
//! history. Every per-source and per-item failure is logged and skipped;
//! nothing but startup errors stops the pass.
//!
//! History is written through after each successful publish, so a crash
//! loses at most the item in flight. If the write itself fails the message
//! is already out, and the item will be published again on the next run.

use std::time::Duration;

use medpost_util_error::FmtCompact as _;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::dedup::{self, TitleMatch};
use crate::generator::PostGenerator;
use crate::history::HistoryStore;
use crate::model::{GeneratedPost, HistoryRecord, NewsItem};
use crate::publisher::{ParseMode, Publisher};
use crate::scraper::{SourceDescriptor, SourceFetcher};

const LOG_TARGET: &str = "medpost_bot::pipeline";

pub const DEFAULT_MAX_PER_RUN: usize = 2;
pub const DEFAULT_PACING: Duration = Duration::from_secs(10);
pub const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

/// Blocking pause between pipeline steps.
#[async_trait::async_trait]
pub trait Waiter: Send + Sync {
    async fn wait(&self, duration: Duration);
}

/// [`Waiter`] that actually sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioWaiter;

#[async_trait::async_trait]
impl Waiter for TokioWaiter {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_per_run: usize,
    /// Pause between two processed items
    pub pacing: Duration,
    /// Pause after the generation API reported rate limiting
    pub rate_limit_pause: Duration,
    pub title_match: TitleMatch,
    pub parse_mode: ParseMode,
    /// Generate posts but neither publish nor record them
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_per_run: DEFAULT_MAX_PER_RUN,
            pacing: DEFAULT_PACING,
            rate_limit_pause: DEFAULT_RATE_LIMIT_PAUSE,
            title_match: TitleMatch::default(),
            parse_mode: ParseMode::default(),
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    /// Pause before the next generation request.
    pub fn pause_after(&self, rate_limited: bool) -> Duration {
        if rate_limited {
            self.rate_limit_pause.max(self.pacing)
        } else {
            self.pacing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Filtering,
    Processing(usize),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Delivered and recorded in the history
    Published,
    /// Delivered, but the history write failed
    PublishedNotRecorded,
    GenerationFailed,
    PublishFailed,
    /// Generated only, because of dry-run mode
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub title: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Candidates returned by all sources together
    pub fetched: usize,
    /// Candidates left after deduplication, before the per-run cap
    pub unpublished: usize,
    pub items: Vec<ItemReport>,
}

impl RunReport {
    pub fn count(&self, outcome: ItemOutcome) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome == outcome)
            .count()
    }

    pub fn delivered(&self) -> usize {
        self.count(ItemOutcome::Published) + self.count(ItemOutcome::PublishedNotRecorded)
    }
}

pub struct PipelineRunner {
    config: PipelineConfig,
    sources: Vec<SourceDescriptor>,
    fetcher: Box<dyn SourceFetcher>,
    generator: Box<dyn PostGenerator>,
    publisher: Box<dyn Publisher>,
    waiter: Box<dyn Waiter>,
    history: HistoryStore,
    state: RunState,
}

#[bon::bon]
impl PipelineRunner {
    #[builder]
    pub fn new(
        fetcher: Box<dyn SourceFetcher>,
        generator: Box<dyn PostGenerator>,
        publisher: Box<dyn Publisher>,
        history: HistoryStore,
        sources: Vec<SourceDescriptor>,
        config: Option<PipelineConfig>,
        waiter: Option<Box<dyn Waiter>>,
    ) -> Self {
        Self {
            config: config.unwrap_or_default(),
            sources,
            fetcher,
            generator,
            publisher,
            waiter: waiter.unwrap_or_else(|| Box::new(TokioWaiter)),
            history,
            state: RunState::Idle,
        }
    }
}

impl PipelineRunner {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    fn set_state(&mut self, state: RunState) {
        debug!(target: LOG_TARGET, ?state, "Pipeline state");
        self.state = state;
    }

    /// Run one full pass over all sources.
    pub async fn run(&mut self) -> RunReport {
        info!(
            target: LOG_TARGET,
            sources = self.sources.len(),
            history = self.history.len(),
            max_per_run = self.config.max_per_run,
            dry_run = self.config.dry_run,
            "Starting pipeline run"
        );

        self.set_state(RunState::Fetching);
        let candidates = self.fetch_candidates().await;
        let fetched = candidates.len();

        self.set_state(RunState::Filtering);
        let title_match = self.config.title_match;
        let candidates = dedup::distinct_titles(candidates, title_match);
        let unpublished = dedup::select_new(candidates, self.history.titles(), title_match);
        info!(target: LOG_TARGET, fetched, unpublished = unpublished.len(), "Filtered candidates");

        let mut report = RunReport {
            fetched,
            unpublished: unpublished.len(),
            items: Vec::new(),
        };

        let batch: Vec<NewsItem> = unpublished
            .into_iter()
            .take(self.config.max_per_run)
            .collect();

        for (i, item) in batch.iter().enumerate() {
            self.set_state(RunState::Processing(i));

            let (outcome, rate_limited) = self.process_item(item).await;
            report.items.push(ItemReport {
                title: item.title.clone(),
                outcome,
            });

            if i + 1 < batch.len() {
                let pause = self.config.pause_after(rate_limited);
                debug!(target: LOG_TARGET, pause_secs = pause.as_secs(), "Pausing before next item");
                self.waiter.wait(pause).await;
            }
        }

        self.set_state(RunState::Done);
        info!(
            target: LOG_TARGET,
            processed = report.items.len(),
            published = report.count(ItemOutcome::Published),
            not_recorded = report.count(ItemOutcome::PublishedNotRecorded),
            generation_failed = report.count(ItemOutcome::GenerationFailed),
            publish_failed = report.count(ItemOutcome::PublishFailed),
            "Pipeline run complete"
        );

        report
    }

    async fn fetch_candidates(&self) -> Vec<NewsItem> {
        let mut candidates = Vec::new();

        for source in &self.sources {
            let items = self.fetcher.fetch(source).await;
            if items.is_empty() {
                warn!(target: LOG_TARGET, source = %source.name, "Source returned no items");
            } else {
                debug!(target: LOG_TARGET, source = %source.name, count = items.len(), "Source returned items");
            }
            candidates.extend(items);
        }

        candidates
    }

    /// Returns the outcome and whether the generation API asked us to back
    /// off.
    async fn process_item(&mut self, item: &NewsItem) -> (ItemOutcome, bool) {
        info!(target: LOG_TARGET, title = %item.title, source = %item.source, "Processing item");

        let content = match self.generator.generate(item).await {
            Ok(content) => content,
            Err(err) => {
                warn!(target: LOG_TARGET, title = %item.title, err = %err.fmt_compact(), "Post generation failed, skipping item");
                return (ItemOutcome::GenerationFailed, err.is_rate_limited());
            }
        };

        let body = GeneratedPost::new(item, content).render_message(self.config.parse_mode);

        if self.config.dry_run {
            info!(target: LOG_TARGET, title = %item.title, %body, "Dry run, not publishing");
            return (ItemOutcome::Generated, false);
        }

        if let Err(err) = self.publisher.send(&body).await {
            warn!(target: LOG_TARGET, title = %item.title, err = %err.fmt_compact(), "Publishing failed, will retry next run");
            return (ItemOutcome::PublishFailed, false);
        }

        let record = HistoryRecord::for_item(item, OffsetDateTime::now_utc());
        match self.history.append_and_persist(record) {
            Ok(()) => {
                info!(target: LOG_TARGET, title = %item.title, "Published and recorded");
                (ItemOutcome::Published, false)
            }
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    title = %item.title,
                    path = %self.history.path().display(),
                    err = %err.fmt_compact(),
                    "Published but failed to record in history, item will be published again next run"
                );
                (ItemOutcome::PublishedNotRecorded, false)
            }
        }
    }
}

/// Generate posts for the first `limit` items without publishing or
/// recording anything.
///
/// Items whose generation fails are logged and left out. Requests are paced
/// like a pipeline run.
pub async fn generate_posts(
    generator: &dyn PostGenerator,
    waiter: &dyn Waiter,
    items: &[NewsItem],
    limit: usize,
    config: &PipelineConfig,
) -> Vec<GeneratedPost> {
    let batch = &items[..limit.min(items.len())];
    let mut posts = Vec::with_capacity(batch.len());

    for (i, item) in batch.iter().enumerate() {
        info!(target: LOG_TARGET, n = i + 1, total = batch.len(), title = %item.title, "Generating post");

        let rate_limited = match generator.generate(item).await {
            Ok(content) => {
                posts.push(GeneratedPost::new(item, content));
                false
            }
            Err(err) => {
                warn!(target: LOG_TARGET, title = %item.title, err = %err.fmt_compact(), "Post generation failed, skipping item");
                err.is_rate_limited()
            }
        };

        if i + 1 < batch.len() {
            waiter.wait(config.pause_after(rate_limited)).await;
        }
    }

    posts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_reference_values() {
        let config = PipelineConfig::default();

        assert_eq!(config.max_per_run, 2);
        assert_eq!(config.pacing, Duration::from_secs(10));
        assert_eq!(config.rate_limit_pause, Duration::from_secs(60));
        assert_eq!(config.title_match, TitleMatch::Exact);
        assert!(!config.dry_run);
    }

    #[test]
    fn rate_limit_pause_is_never_shorter_than_pacing() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.pause_after(false), Duration::from_secs(10));
        assert_eq!(config.pause_after(true), Duration::from_secs(60));

        config.pacing = Duration::from_secs(90);
        assert_eq!(config.pause_after(true), Duration::from_secs(90));
    }

    #[test]
    fn report_counts_delivered_items() {
        let report = RunReport {
            fetched: 3,
            unpublished: 3,
            items: vec![
                ItemReport {
                    title: "A".into(),
                    outcome: ItemOutcome::Published,
                },
                ItemReport {
                    title: "B".into(),
                    outcome: ItemOutcome::PublishedNotRecorded,
                },
                ItemReport {
                    title: "C".into(),
                    outcome: ItemOutcome::PublishFailed,
                },
            ],
        };

        assert_eq!(report.delivered(), 2);
        assert_eq!(report.count(ItemOutcome::PublishFailed), 1);
    }
}
