use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use url::Url;

use crate::dedup::TitleMatch;
use crate::generator::{DEFAULT_MODEL, GROQ_API_URL, GeneratorConfig};
use crate::pipeline::PipelineConfig;
use crate::publisher::{ParseMode, TELEGRAM_API_URL, TelegramConfig};
use crate::scraper::SourceDescriptor;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Missing required setting {name} (set the {env} environment variable)"))]
    Missing {
        name: &'static str,
        env: &'static str,
    },
    #[snafu(display("Invalid URL for {name}: {source}"))]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Medpost Bot - rewrites medical news with an LLM and posts them to Telegram
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub pipeline: PipelineOpts,

    #[command(flatten)]
    pub fetch: FetchOpts,

    #[command(flatten)]
    pub llm: LlmOpts,

    #[command(flatten)]
    pub telegram: TelegramOpts,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Development commands
    Dev {
        #[command(subcommand)]
        dev_command: DevCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DevCommand {
    /// Fetch all sources and print the candidates
    Fetch {
        /// Also save the candidates as a JSON array
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate posts and print them without publishing
    ///
    /// Either for a single `--title`, or for the first `--limit` candidates
    /// of a file saved with `dev fetch --out`.
    Generate {
        #[arg(long, required_unless_present = "from", conflicts_with = "from")]
        title: Option<String>,

        #[arg(long, requires = "title")]
        summary: Option<String>,

        /// Candidates file written by `dev fetch --out`
        #[arg(long)]
        from: Option<PathBuf>,

        /// Number of candidates to generate posts for
        #[arg(long, default_value = "3")]
        limit: usize,

        /// Also save the generated posts as a JSON array
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct PipelineOpts {
    /// Path of the publish history file
    #[arg(long, env = "MEDPOST_HISTORY_FILE", default_value = "published_history.json")]
    pub history_file: PathBuf,

    /// Maximum items to process per run
    #[arg(long, env = "MEDPOST_MAX_PER_RUN", default_value = "2")]
    pub max_per_run: usize,

    /// Pause between processed items in seconds
    #[arg(long, env = "MEDPOST_PACING_SECS", default_value = "10")]
    pub pacing_secs: u64,

    /// Pause after the generation API reports rate limiting, in seconds
    #[arg(long, env = "MEDPOST_RATE_LIMIT_PAUSE_SECS", default_value = "60")]
    pub rate_limit_pause_secs: u64,

    /// How titles are compared against the history
    #[arg(long, env = "MEDPOST_TITLE_MATCH", value_enum, default_value = "exact")]
    pub title_match: TitleMatch,

    /// Generate posts but do not publish or record them
    #[arg(long, env = "MEDPOST_DRY_RUN")]
    pub dry_run: bool,
}

impl PipelineOpts {
    pub fn to_pipeline_config(&self, parse_mode: ParseMode) -> PipelineConfig {
        PipelineConfig {
            max_per_run: self.max_per_run,
            pacing: Duration::from_secs(self.pacing_secs),
            rate_limit_pause: Duration::from_secs(self.rate_limit_pause_secs),
            title_match: self.title_match,
            parse_mode,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Args)]
pub struct FetchOpts {
    /// Timeout of a single source request in seconds
    #[arg(long, env = "MEDPOST_FETCH_TIMEOUT_SECS", default_value = "15")]
    pub fetch_timeout_secs: u64,

    /// Disable TLS certificate validation for sources on this host (repeatable)
    #[arg(long = "insecure-tls-host", env = "MEDPOST_INSECURE_TLS_HOSTS", value_delimiter = ',')]
    pub insecure_tls_hosts: Vec<String>,
}

impl FetchOpts {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Mark sources whose host was listed with `--insecure-tls-host`.
    pub fn apply_tls_overrides(&self, sources: &mut [SourceDescriptor]) {
        for source in sources {
            let Some(host) = source.url.host_str() else {
                continue;
            };
            if self
                .insecure_tls_hosts
                .iter()
                .any(|h| host == h || host.strip_prefix("www.") == Some(h.as_str()))
            {
                source.insecure_tls = true;
            }
        }
    }
}

#[derive(Args)]
pub struct LlmOpts {
    /// Bearer key of the generation API
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub groq_api_key: Option<String>,

    /// OpenAI-compatible chat completions endpoint
    #[arg(long, env = "MEDPOST_LLM_API_URL", default_value = GROQ_API_URL)]
    pub llm_api_url: String,

    #[arg(long, env = "MEDPOST_LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub llm_model: String,

    /// Upper bound on generated tokens
    #[arg(long, env = "MEDPOST_LLM_MAX_TOKENS", default_value = "250")]
    pub llm_max_tokens: u32,

    #[arg(long, env = "MEDPOST_LLM_TEMPERATURE", default_value = "0.7")]
    pub llm_temperature: f32,

    /// Target post length in sentences, e.g. `3-4`
    #[arg(long, env = "MEDPOST_POST_SENTENCES", default_value = "3-4")]
    pub post_sentences: String,

    /// Timeout of a generation request in seconds
    #[arg(long, env = "MEDPOST_LLM_TIMEOUT_SECS", default_value = "30")]
    pub llm_timeout_secs: u64,
}

impl fmt::Debug for LlmOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmOpts")
            .field("groq_api_key", &self.groq_api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_api_url", &self.llm_api_url)
            .field("llm_model", &self.llm_model)
            .field("llm_max_tokens", &self.llm_max_tokens)
            .field("llm_temperature", &self.llm_temperature)
            .field("post_sentences", &self.post_sentences)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .finish()
    }
}

impl LlmOpts {
    pub fn to_generator_config(&self) -> ConfigResult<GeneratorConfig> {
        let api_key = self.groq_api_key.clone().context(MissingSnafu {
            name: "groq-api-key",
            env: "GROQ_API_KEY",
        })?;
        let api_url = Url::parse(&self.llm_api_url).context(InvalidUrlSnafu {
            name: "llm-api-url",
        })?;

        Ok(GeneratorConfig {
            api_url,
            api_key,
            model: self.llm_model.clone(),
            temperature: self.llm_temperature,
            max_tokens: self.llm_max_tokens,
            post_sentences: self.post_sentences.clone(),
            timeout: Duration::from_secs(self.llm_timeout_secs),
        })
    }
}

#[derive(Args)]
pub struct TelegramOpts {
    /// Bot token of the messaging API
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    /// Destination channel, e.g. `@channel` or a numeric chat id
    #[arg(long, env = "TELEGRAM_CHANNEL")]
    pub telegram_channel: Option<String>,

    #[arg(long, env = "MEDPOST_TELEGRAM_API_URL", default_value = TELEGRAM_API_URL)]
    pub telegram_api_url: String,

    /// Formatting mode of published messages
    #[arg(long, env = "MEDPOST_PARSE_MODE", value_enum, default_value = "html")]
    pub parse_mode: ParseMode,

    /// Timeout of a publish request in seconds
    #[arg(long, env = "MEDPOST_TELEGRAM_TIMEOUT_SECS", default_value = "30")]
    pub telegram_timeout_secs: u64,
}

impl fmt::Debug for TelegramOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramOpts")
            .field(
                "telegram_bot_token",
                &self.telegram_bot_token.as_ref().map(|_| "<redacted>"),
            )
            .field("telegram_channel", &self.telegram_channel)
            .field("telegram_api_url", &self.telegram_api_url)
            .field("parse_mode", &self.parse_mode)
            .field("telegram_timeout_secs", &self.telegram_timeout_secs)
            .finish()
    }
}

impl TelegramOpts {
    pub fn to_telegram_config(&self) -> ConfigResult<TelegramConfig> {
        let bot_token = self.telegram_bot_token.clone().context(MissingSnafu {
            name: "telegram-bot-token",
            env: "TELEGRAM_BOT_TOKEN",
        })?;
        let chat_id = self.telegram_channel.clone().context(MissingSnafu {
            name: "telegram-channel",
            env: "TELEGRAM_CHANNEL",
        })?;
        let api_url = Url::parse(&self.telegram_api_url).context(InvalidUrlSnafu {
            name: "telegram-api-url",
        })?;

        Ok(TelegramConfig {
            api_url,
            bot_token,
            chat_id,
            parse_mode: self.parse_mode,
            timeout: Duration::from_secs(self.telegram_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::default_sources;

    #[test]
    fn explicit_flags_override_defaults() {
        let opts = Opts::try_parse_from([
            "medpost-bot",
            "--max-per-run",
            "5",
            "--pacing-secs",
            "1",
            "--title-match",
            "normalized",
            "--parse-mode",
            "markdown-v2",
            "--dry-run",
        ])
        .unwrap();

        let config = opts.pipeline.to_pipeline_config(opts.telegram.parse_mode);
        assert_eq!(config.max_per_run, 5);
        assert_eq!(config.pacing, Duration::from_secs(1));
        assert_eq!(config.title_match, TitleMatch::Normalized);
        assert_eq!(config.parse_mode, ParseMode::MarkdownV2);
        assert!(config.dry_run);
    }

    #[test]
    fn dev_fetch_subcommand_parses() {
        let opts =
            Opts::try_parse_from(["medpost-bot", "dev", "fetch", "--out", "news.json"]).unwrap();

        assert!(matches!(
            opts.command,
            Some(Command::Dev {
                dev_command: DevCommand::Fetch { out: Some(_) }
            })
        ));
    }

    #[test]
    fn dev_generate_accepts_candidates_file() {
        let opts = Opts::try_parse_from([
            "medpost-bot",
            "dev",
            "generate",
            "--from",
            "news.json",
            "--limit",
            "5",
            "--out",
            "posts.json",
        ])
        .unwrap();

        match opts.command {
            Some(Command::Dev {
                dev_command:
                    DevCommand::Generate {
                        title, from, limit, out, ..
                    },
            }) => {
                assert_eq!(title, None);
                assert_eq!(from, Some(PathBuf::from("news.json")));
                assert_eq!(limit, 5);
                assert_eq!(out, Some(PathBuf::from("posts.json")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn dev_generate_needs_title_or_candidates_file() {
        assert!(Opts::try_parse_from(["medpost-bot", "dev", "generate"]).is_err());
        assert!(
            Opts::try_parse_from([
                "medpost-bot",
                "dev",
                "generate",
                "--title",
                "A",
                "--from",
                "news.json",
            ])
            .is_err()
        );
    }

    #[test]
    fn missing_credentials_are_reported() {
        let telegram = TelegramOpts {
            telegram_bot_token: Some("token".into()),
            telegram_channel: None,
            telegram_api_url: TELEGRAM_API_URL.into(),
            parse_mode: ParseMode::Html,
            telegram_timeout_secs: 30,
        };

        let err = telegram.to_telegram_config().unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_CHANNEL"));
    }

    #[test]
    fn generator_config_carries_llm_settings() {
        let llm = LlmOpts {
            groq_api_key: Some("gsk_test".into()),
            llm_api_url: GROQ_API_URL.into(),
            llm_model: DEFAULT_MODEL.into(),
            llm_max_tokens: 250,
            llm_temperature: 0.7,
            post_sentences: "3-4".into(),
            llm_timeout_secs: 30,
        };

        let config = llm.to_generator_config().unwrap();
        assert_eq!(config.api_key, "gsk_test");
        assert_eq!(config.max_tokens, 250);
        assert_eq!(config.api_url.as_str(), GROQ_API_URL);
        assert!(!format!("{llm:?}").contains("gsk_test"));
    }

    #[test]
    fn tls_overrides_match_host_with_or_without_www() {
        let fetch = FetchOpts {
            fetch_timeout_secs: 15,
            insecure_tls_hosts: vec!["who.int".into()],
        };
        let mut sources = default_sources().unwrap();

        fetch.apply_tls_overrides(&mut sources);

        let insecure: Vec<_> = sources
            .iter()
            .filter(|s| s.insecure_tls)
            .map(|s| s.url.host_str().unwrap_or_default())
            .collect();
        assert_eq!(insecure, ["www.who.int"]);
    }
}
