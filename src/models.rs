use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width of the embedding vector column; the embeddings service must agree.
pub const EMBEDDING_DIM: usize = 384;

/// A named publisher feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub category: String,
    pub paywall: bool,
    pub scrape_frequency: i64,
    pub last_checked: Option<DateTime<Utc>>,
    pub do_initialized_at: Option<DateTime<Utc>>,
}

/// Processing status of one discovered article URL.
///
/// `PendingFetch` and `ContentFetched` are the only non-terminal states; an
/// article in any other status is never reprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArticleStatus {
    PendingFetch,
    ContentFetched,
    Processed,
    SkippedPdf,
    FetchFailed,
    RenderFailed,
    AiAnalysisFailed,
    EmbeddingFailed,
    BlobUploadFailed,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::PendingFetch => "PENDING_FETCH",
            ArticleStatus::ContentFetched => "CONTENT_FETCHED",
            ArticleStatus::Processed => "PROCESSED",
            ArticleStatus::SkippedPdf => "SKIPPED_PDF",
            ArticleStatus::FetchFailed => "FETCH_FAILED",
            ArticleStatus::RenderFailed => "RENDER_FAILED",
            ArticleStatus::AiAnalysisFailed => "AI_ANALYSIS_FAILED",
            ArticleStatus::EmbeddingFailed => "EMBEDDING_FAILED",
            ArticleStatus::BlobUploadFailed => "BLOB_UPLOAD_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "PENDING_FETCH" => ArticleStatus::PendingFetch,
            "CONTENT_FETCHED" => ArticleStatus::ContentFetched,
            "PROCESSED" => ArticleStatus::Processed,
            "SKIPPED_PDF" => ArticleStatus::SkippedPdf,
            "FETCH_FAILED" => ArticleStatus::FetchFailed,
            "RENDER_FAILED" => ArticleStatus::RenderFailed,
            "AI_ANALYSIS_FAILED" => ArticleStatus::AiAnalysisFailed,
            "EMBEDDING_FAILED" => ArticleStatus::EmbeddingFailed,
            "BLOB_UPLOAD_FAILED" => ArticleStatus::BlobUploadFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ArticleStatus::PendingFetch | ArticleStatus::ContentFetched
        )
    }
}

/// How much of the article the model judged it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Completeness {
    Complete,
    PartialUseful,
    PartialUseless,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "COMPLETE",
            Completeness::PartialUseful => "PARTIAL_USEFUL",
            Completeness::PartialUseless => "PARTIAL_USELESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMPLETE" => Some(Completeness::Complete),
            "PARTIAL_USEFUL" => Some(Completeness::PartialUseful),
            "PARTIAL_USELESS" => Some(Completeness::PartialUseless),
            _ => None,
        }
    }
}

/// Editorial quality of the extracted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentQuality {
    Ok,
    LowQuality,
    Junk,
}

impl ContentQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentQuality::Ok => "OK",
            ContentQuality::LowQuality => "LOW_QUALITY",
            ContentQuality::Junk => "JUNK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ContentQuality::Ok),
            "LOW_QUALITY" => Some(ContentQuality::LowQuality),
            "JUNK" => Some(ContentQuality::Junk),
            _ => None,
        }
    }
}

/// Structured output of the LLM analysis step.
///
/// When `content_quality` is JUNK or `completeness` is PARTIAL_USELESS the
/// arrays may be empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleAnalysis {
    /// ISO 639-1 code.
    pub language: String,
    /// ISO 3166-1 alpha-3, or GLOBAL / N/A.
    pub primary_location: String,
    pub completeness: Completeness,
    pub content_quality: ContentQuality,
    #[serde(default)]
    pub event_summary_points: Vec<String>,
    #[serde(default)]
    pub thematic_keywords: Vec<String>,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub key_entities: Vec<String>,
    #[serde(default)]
    pub content_focus: Vec<String>,
}

/// One article row as stored.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub publish_date: Option<DateTime<Utc>>,
    pub source_id: i64,
    pub status: ArticleStatus,
    pub used_browser: bool,
    pub analysis: Option<ArticleAnalysis>,
    pub embedding: Option<Vec<f32>>,
    pub content_file_key: Option<String>,
    pub fail_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Durable control block for one source scraper. Shape-validated on every
/// read; a scraper that cannot validate its state must refuse to act.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: i64,
    pub url: String,
    pub scrape_frequency: i64,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Wire shape of a queue message between the scraper and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub articles_id: Vec<i64>,
}
