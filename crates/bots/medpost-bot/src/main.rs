use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use medpost_bot::config::{Command, ConfigError, DevCommand, Opts};
use medpost_bot::generator::{ChatCompletionGenerator, GenerationError, PostGenerator as _};
use medpost_bot::history::{HistoryError, HistoryStore};
use medpost_bot::model::{GeneratedPost, NewsItem};
use medpost_bot::pipeline::{self, PipelineRunner, TokioWaiter};
use medpost_bot::publisher::{PublishError, TelegramPublisher};
use medpost_bot::scraper::{
    FetchError, HtmlFetcher, SourceDescriptor, SourceFetcher as _, default_sources,
};
use medpost_bot::{LOG_TARGET, PROJECT_NAME};
use serde::Serialize;
use snafu::{OptionExt as _, ResultExt, Snafu};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
pub enum BotError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("History error: {source}"))]
    History { source: HistoryError },
    #[snafu(display("Scraper error: {source}"))]
    Scraper { source: FetchError },
    #[snafu(display("Generator error: {source}"))]
    Generator { source: GenerationError },
    #[snafu(display("Publisher error: {source}"))]
    Publisher { source: PublishError },
    #[snafu(display("Failed to write {}: {source}", path.display()))]
    Output { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to read {}: {source}", path.display()))]
    Input { path: PathBuf, source: io::Error },
    #[snafu(display("Invalid candidates file {}: {source}", path.display()))]
    Candidates {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to encode output: {source}"))]
    Encode { source: serde_json::Error },
    #[snafu(display("Either --title or --from is required"))]
    NothingToGenerate,
    #[snafu(display("Logging initialization failed"))]
    Logging,
}

pub type BotResult<T> = std::result::Result<T, BotError>;

#[snafu::report]
#[tokio::main(flavor = "current_thread")]
async fn main() -> BotResult<()> {
    init_logging()?;

    let opts = Opts::parse();

    match opts.command {
        Some(Command::Dev { ref dev_command }) => handle_dev_command(&opts, dev_command).await,
        None => run_pipeline(&opts).await,
    }
}

fn sources(opts: &Opts) -> BotResult<Vec<SourceDescriptor>> {
    let mut sources = default_sources().context(ScraperSnafu)?;
    opts.fetch.apply_tls_overrides(&mut sources);
    Ok(sources)
}

async fn run_pipeline(opts: &Opts) -> BotResult<()> {
    info!(target: LOG_TARGET, project = PROJECT_NAME, ?opts, "Starting pipeline run");

    // Credentials and history are the only things allowed to stop a run.
    let generator_config = opts.llm.to_generator_config().context(ConfigSnafu)?;
    let telegram_config = opts.telegram.to_telegram_config().context(ConfigSnafu)?;
    let history = HistoryStore::load(&opts.pipeline.history_file).context(HistorySnafu)?;

    info!(
        target: LOG_TARGET,
        path = %history.path().display(),
        records = history.len(),
        "Loaded publish history"
    );

    let runner_config = opts
        .pipeline
        .to_pipeline_config(telegram_config.parse_mode);

    let mut runner = PipelineRunner::builder()
        .fetcher(Box::new(
            HtmlFetcher::new(opts.fetch.fetch_timeout()).context(ScraperSnafu)?,
        ))
        .generator(Box::new(
            ChatCompletionGenerator::new(generator_config).context(GeneratorSnafu)?,
        ))
        .publisher(Box::new(
            TelegramPublisher::new(telegram_config).context(PublisherSnafu)?,
        ))
        .history(history)
        .sources(sources(opts)?)
        .config(runner_config)
        .build();

    let report = runner.run().await;

    for item in &report.items {
        info!(target: LOG_TARGET, title = %item.title, outcome = ?item.outcome, "Item result");
    }
    info!(
        target: LOG_TARGET,
        fetched = report.fetched,
        unpublished = report.unpublished,
        delivered = report.delivered(),
        "Run finished"
    );

    Ok(())
}

async fn handle_dev_command(opts: &Opts, dev_command: &DevCommand) -> BotResult<()> {
    match dev_command {
        DevCommand::Fetch { out } => {
            let fetcher = HtmlFetcher::new(opts.fetch.fetch_timeout()).context(ScraperSnafu)?;

            let mut items = Vec::new();
            for source in sources(opts)? {
                items.extend(fetcher.fetch(&source).await);
            }

            println!("Fetched {} items:", items.len());
            println!();
            for (i, item) in items.iter().enumerate() {
                println!("{}. [{}] {}", i + 1, item.source, item.title);
                println!("   Link: {}", item.link);
                if let Some(published) = &item.published {
                    println!("   Date: {published}");
                }
            }

            if let Some(path) = out {
                save_json(path, &items)?;
                println!();
                println!("Saved to {}", path.display());
            }

            Ok(())
        }
        DevCommand::Generate {
            title,
            summary,
            from,
            limit,
            out,
        } => {
            let config = opts.llm.to_generator_config().context(ConfigSnafu)?;
            let generator = ChatCompletionGenerator::new(config).context(GeneratorSnafu)?;

            let posts = if let Some(from) = from {
                let items = load_candidates(from)?;
                let pipeline_config = opts.pipeline.to_pipeline_config(opts.telegram.parse_mode);
                pipeline::generate_posts(&generator, &TokioWaiter, &items, *limit, &pipeline_config)
                    .await
            } else {
                let title = title.as_ref().context(NothingToGenerateSnafu)?;
                let mut item = NewsItem::new(title.clone(), "", "dev");
                if let Some(summary) = summary {
                    item = item.with_summary(summary.clone());
                }

                let content = generator.generate(&item).await.context(GeneratorSnafu)?;
                vec![GeneratedPost::new(&item, content)]
            };

            for post in &posts {
                println!("# {}", post.original_title);
                println!();
                println!("{}", post.generated_content);
                println!("---");
            }
            println!("Generated {} posts", posts.len());

            if let Some(path) = out {
                save_json(path, &posts)?;
                println!("Saved to {}", path.display());
            }

            Ok(())
        }
    }
}

fn load_candidates(path: &Path) -> BotResult<Vec<NewsItem>> {
    let content = std::fs::read_to_string(path).context(InputSnafu { path })?;
    serde_json::from_str(&content).context(CandidatesSnafu { path })
}

fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> BotResult<()> {
    let json = serde_json::to_string_pretty(value).context(EncodeSnafu)?;
    std::fs::write(path, json).context(OutputSnafu { path })
}

pub fn init_logging() -> BotResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| BotError::Logging)?;

    Ok(())
}
