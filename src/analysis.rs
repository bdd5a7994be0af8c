use crate::models::ArticleAnalysis;
use crate::utils::truncate_for_log;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Article text beyond this many bytes is not worth the tokens.
const MAX_ARTICLE_CHARS: usize = 24_000;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("llm request failed: {0}")]
    Http(String),
    #[error("llm returned HTTP {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("llm returned no content")]
    Empty,
    #[error("llm output violated the analysis schema: {0}")]
    Schema(String),
    #[error("llm call timed out")]
    Timeout,
}

const SYSTEM_PROMPT: &str = "\
You are a news-wire analyst. Read the article and answer with a single JSON \
object, no prose, matching exactly this shape:
{
  \"language\": two-letter ISO 639-1 code of the article language,
  \"primary_location\": ISO 3166-1 alpha-3 code of the main location, or \"GLOBAL\" or \"N/A\",
  \"completeness\": \"COMPLETE\" | \"PARTIAL_USEFUL\" | \"PARTIAL_USELESS\",
  \"content_quality\": \"OK\" | \"LOW_QUALITY\" | \"JUNK\",
  \"event_summary_points\": array of short factual sentences,
  \"thematic_keywords\": array of strings,
  \"topic_tags\": array of strings,
  \"key_entities\": array of strings,
  \"content_focus\": array of strings
}
When content_quality is JUNK or completeness is PARTIAL_USELESS the arrays \
may be empty. Do not invent facts that are not in the article.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for the structured-extraction LLM endpoint (OpenAI-compatible
/// chat completions, temperature 0).
#[derive(Debug, Clone)]
pub struct AnalysisClient {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl AnalysisClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build llm client"),
        }
    }

    /// Analyze one article into the structured schema. A response that does
    /// not deserialize is a schema violation the caller may retry.
    #[instrument(level = "info", skip_all, fields(title = %truncate_for_log(title, 80)))]
    pub async fn analyze(&self, title: &str, text: &str) -> Result<ArticleAnalysis, AnalysisError> {
        let mut body_text = text;
        if body_text.len() > MAX_ARTICLE_CHARS {
            let mut cut = MAX_ARTICLE_CHARS;
            while !body_text.is_char_boundary(cut) {
                cut -= 1;
            }
            body_text = &body_text[..cut];
        }

        let request = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!("Title: {title}\n\n{body_text}")},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout
                } else {
                    AnalysisError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), detail = %truncate_for_log(&detail, 300), "llm call failed");
            return Err(AnalysisError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Schema(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AnalysisError::Empty)?;

        let analysis: ArticleAnalysis = serde_json::from_str(content.trim())
            .map_err(|e| AnalysisError::Schema(e.to_string()))?;
        debug!(
            language = %analysis.language,
            location = %analysis.primary_location,
            points = analysis.event_summary_points.len(),
            "article analyzed"
        );
        Ok(analysis)
    }
}
