use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};
use url::Url;

use crate::model::NewsItem;

const LOG_TARGET: &str = "medpost_bot::generator";

pub const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "llama3-70b-8192";

/// First line of every generated post. Added by code, not by the prompt.
pub const DISCLAIMER: &str = "⚠️ Ця інформація не є медичною консультацією";

const SYSTEM_PROMPT: &str = "Ти професійний медичний журналіст, експерт з медичних новин.";

/// Max bytes of an error response body kept in [`GenerationError::Status`].
const MAX_ERROR_BODY_LEN: usize = 512;

#[derive(Debug, Snafu)]
pub enum GenerationError {
    #[snafu(display("Failed to create HTTP client: {source}"))]
    Client { source: reqwest::Error },
    #[snafu(display("Generation request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("Generation API rate limit reached"))]
    RateLimited,
    #[snafu(display("Generation API error {status}: {body}"))]
    Status { status: StatusCode, body: String },
    #[snafu(display("Malformed generation response: {source}"))]
    Decode { source: reqwest::Error },
    #[snafu(display("Generation response has no choices"))]
    NoChoices,
    #[snafu(display("Generation returned an empty post"))]
    EmptyCompletion,
}

impl GenerationError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GenerationError::RateLimited)
    }
}

pub type GenerationResult<T> = std::result::Result<T, GenerationError>;

/// Rewrites a news item as a short post.
///
/// Implementations must return text that starts with [`DISCLAIMER`].
#[async_trait::async_trait]
pub trait PostGenerator: Send + Sync {
    async fn generate(&self, item: &NewsItem) -> GenerationResult<String>;
}

#[derive(Clone)]
pub struct GeneratorConfig {
    pub api_url: Url,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Target post length, e.g. `3-4`, inserted into the prompt
    pub post_sentences: String,
    pub timeout: Duration,
}

impl fmt::Debug for GeneratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorConfig")
            .field("api_url", &self.api_url.as_str())
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("post_sentences", &self.post_sentences)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Generator backed by an OpenAI-compatible chat completions endpoint.
#[derive(Debug)]
pub struct ChatCompletionGenerator {
    client: Client,
    config: GeneratorConfig,
}

impl ChatCompletionGenerator {
    pub fn new(config: GeneratorConfig) -> GenerationResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context(ClientSnafu)?;

        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl PostGenerator for ChatCompletionGenerator {
    async fn generate(&self, item: &NewsItem) -> GenerationResult<String> {
        let prompt = build_prompt(item, &self.config.post_sentences);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(target: LOG_TARGET, model = %self.config.model, title = %item.title, "Requesting post generation");

        let response = self
            .client
            .post(self.config.api_url.clone())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return RateLimitedSnafu.fail();
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if MAX_ERROR_BODY_LEN < body.len() {
                let mut end = MAX_ERROR_BODY_LEN;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return StatusSnafu { status, body }.fail();
        }

        let response: ChatResponse = response.json().await.context(DecodeSnafu)?;
        let content = response
            .choices
            .into_iter()
            .next()
            .ok_or(GenerationError::NoChoices)?
            .message
            .content
            .unwrap_or_default();

        let content = content.trim();
        if content.is_empty() {
            return EmptyCompletionSnafu.fail();
        }

        info!(target: LOG_TARGET, title = %item.title, len = content.len(), "Generated post");
        Ok(with_disclaimer(content))
    }
}

/// Prompt asking for a short post about `item`.
pub fn build_prompt(item: &NewsItem, post_sentences: &str) -> String {
    let mut news = item.title.clone();
    if let Some(summary) = item.summary.as_deref().map(str::trim) {
        if !summary.is_empty() {
            news.push('\n');
            news.push_str(summary);
        }
    }

    format!(
        "Створи інформативний пост для Telegram на основі цієї новини.

**Вимоги:**
- Мова: українська
- Обсяг: {post_sentences} речення
- Структура:
  1. Заголовок (з емодзі)
  2. Основні факти
  3. Чому це важливо?
- Уникай медичних діагнозів та порад щодо лікування
- Не додавай дисклеймер і посилання на джерело, їх буде додано окремо

**Новина:**
{news}
"
    )
}

/// Put [`DISCLAIMER`] on the first line of `content`, unless it is already
/// there.
pub fn with_disclaimer(content: &str) -> String {
    let content = content.trim();
    let disclaimer_text = DISCLAIMER.trim_start_matches(|c: char| !c.is_alphabetic());

    let first_line = content.lines().next().unwrap_or_default();
    if first_line.contains(disclaimer_text) {
        return content.to_string();
    }

    format!("{DISCLAIMER}\n\n{content}")
}
