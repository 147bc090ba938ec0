use std::fmt;
use std::time::Duration;

use medpost_util_error::FmtCompact as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "medpost_bot::publisher";

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Rich-text mode the message body is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ParseMode {
    #[default]
    Html,
    #[value(name = "markdown-v2")]
    MarkdownV2,
    /// No formatting, the body is sent verbatim
    Plain,
}

impl ParseMode {
    fn api_name(self) -> Option<&'static str> {
        match self {
            ParseMode::Html => Some("HTML"),
            ParseMode::MarkdownV2 => Some("MarkdownV2"),
            ParseMode::Plain => None,
        }
    }

    /// Escape `text` so it is shown literally in this mode.
    pub fn escape(self, text: &str) -> String {
        match self {
            ParseMode::Html => text
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;"),
            ParseMode::MarkdownV2 => {
                let mut out = String::with_capacity(text.len());
                for c in text.chars() {
                    if "_*[]()~`>#+-=|{}.!\\".contains(c) {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out
            }
            ParseMode::Plain => text.to_string(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum PublishError {
    #[snafu(display("Failed to create HTTP client: {source}"))]
    Client { source: reqwest::Error },
    #[snafu(display("Failed to send message: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Message rejected ({status}): {description}"))]
    Rejected {
        status: StatusCode,
        description: String,
    },
}

pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Delivers a rendered message to the target channel.
///
/// Delivery failures are returned as errors, never panics, so the caller can
/// skip the item and carry on.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, text: &str) -> PublishResult<()>;
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub api_url: Url,
    pub bot_token: String,
    pub chat_id: String,
    pub parse_mode: ParseMode,
    pub timeout: Duration,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_url", &self.api_url.as_str())
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("parse_mode", &self.parse_mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Publisher posting to a Telegram channel through the Bot API.
#[derive(Debug)]
pub struct TelegramPublisher {
    client: Client,
    config: TelegramConfig,
}

impl TelegramPublisher {
    pub fn new(config: TelegramConfig) -> PublishResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context(ClientSnafu)?;

        Ok(Self { client, config })
    }

    // The token is part of the path, so this must never end up in logs.
    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_url.as_str().trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait::async_trait]
impl Publisher for TelegramPublisher {
    async fn send(&self, text: &str) -> PublishResult<()> {
        let request = SendMessageRequest {
            chat_id: &self.config.chat_id,
            text,
            parse_mode: self.config.parse_mode.api_name(),
        };

        debug!(target: LOG_TARGET, chat_id = %self.config.chat_id, len = text.len(), "Sending message");

        let response = self
            .client
            .post(self.send_message_url())
            .json(&request)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context(HttpSnafu)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .context(HttpSnafu)?;

        let parsed = serde_json::from_str::<TelegramResponse>(&body);
        match parsed {
            Ok(TelegramResponse { ok: true, .. }) if status.is_success() => {
                info!(target: LOG_TARGET, chat_id = %self.config.chat_id, "Message delivered");
                Ok(())
            }
            Ok(TelegramResponse { description, .. }) => {
                let description = description.unwrap_or_else(|| "no description".to_string());
                Err(PublishError::Rejected {
                    status,
                    description,
                })
            }
            Err(err) => {
                warn!(target: LOG_TARGET, %status, err = %err.fmt_compact(), "Unreadable response from messaging API");
                Err(PublishError::Rejected {
                    status,
                    description: "malformed response body".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escape_covers_markup_characters() {
        assert_eq!(
            ParseMode::Html.escape("a < b && c > d"),
            "a &lt; b &amp;&amp; c &gt; d"
        );
    }

    #[test]
    fn markdown_v2_escape_prefixes_reserved_characters() {
        assert_eq!(
            ParseMode::MarkdownV2.escape("https://who.int/a_b.html"),
            "https://who\\.int/a\\_b\\.html"
        );
    }

    #[test]
    fn plain_mode_has_no_api_name() {
        assert_eq!(ParseMode::Plain.api_name(), None);
        assert_eq!(ParseMode::Html.api_name(), Some("HTML"));
    }

    #[test]
    fn config_debug_redacts_token() {
        let config = TelegramConfig {
            api_url: Url::parse(TELEGRAM_API_URL).unwrap(),
            bot_token: "123456:SECRET".into(),
            chat_id: "@medchannel".into(),
            parse_mode: ParseMode::Html,
            timeout: Duration::from_secs(30),
        };

        let debug = format!("{config:?}");
        assert!(!debug.contains("SECRET"));
        assert!(debug.contains("@medchannel"));
    }
}
