use crate::analysis::{AnalysisClient, AnalysisError};
use crate::blob::{BlobError, BlobStore, blob_key};
use crate::db::{Database, DbError, EnrichableArticle};
use crate::extract::{ExtractError, ParsedArticle, parse_article};
use crate::fetch::{FetchError, Renderer, fetch_plain};
use crate::limiter::{DomainRateLimiter, RateItem, RateLimitConfig};
use crate::models::{ArticleAnalysis, ArticleStatus};
use crate::retry::{RetryPolicy, with_backoff};
use crate::search_text::build_search_text;
use crate::sleep::Sleeper;
use crate::embeddings::{EmbeddingsClient, EmbeddingsError};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use futures::stream;
use rand::{Rng, rng};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Concurrency for the per-article LLM and embed/upload stages.
const ANALYSIS_CONCURRENCY: usize = 4;

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(120);
const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(60);
const EMBED_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Per-attempt failure inside the scrape step; classified into an article
/// status only after retries are exhausted.
#[derive(Debug, Error)]
enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("scrape timed out")]
    Timeout,
}

#[derive(Debug, Error)]
enum StepError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Inner(#[from] E),
    #[error("step timed out")]
    Timeout,
}

/// Counters for one worker invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub received: usize,
    pub selected: usize,
    pub scraped: usize,
    pub analyzed: usize,
    pub processed: usize,
}

struct ScrapedArticle {
    article: EnrichableArticle,
    text: String,
}

struct AnalyzedArticle {
    article: EnrichableArticle,
    text: String,
    analysis: ArticleAnalysis,
}

/// Drives a batch of article ids through scrape → analyze → embed/upload →
/// commit. Every step is idempotent against the articles table, so
/// re-delivery of the same ids is safe.
pub struct EnrichmentWorker {
    db: Database,
    blob: BlobStore,
    renderer: Renderer,
    analysis: AnalysisClient,
    embeddings: EmbeddingsClient,
    sleeper: Arc<dyn Sleeper>,
    tricky_domains: Vec<String>,
    rate_limits: RateLimitConfig,
    freshness_hours: i64,
}

impl EnrichmentWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        blob: BlobStore,
        renderer: Renderer,
        analysis: AnalysisClient,
        embeddings: EmbeddingsClient,
        sleeper: Arc<dyn Sleeper>,
        tricky_domains: Vec<String>,
        rate_limits: RateLimitConfig,
        freshness_hours: i64,
    ) -> Self {
        Self {
            db,
            blob,
            renderer,
            analysis,
            embeddings,
            sleeper,
            tricky_domains,
            rate_limits,
            freshness_hours,
        }
    }

    fn is_tricky(&self, host: &str) -> bool {
        self.tricky_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }

    /// Process one batch of article ids through the full pipeline.
    #[instrument(level = "info", skip_all, fields(ids = ids.len()))]
    pub async fn process(&self, ids: Vec<i64>) -> Result<WorkSummary, WorkerError> {
        let mut summary = WorkSummary {
            received: ids.len(),
            ..WorkSummary::default()
        };

        // Step 0: keep unprocessed, unfailed, fresh articles; skip the rest
        // silently. This is what makes redelivery a no-op.
        let fresh_after = Utc::now() - ChronoDuration::hours(self.freshness_hours);
        let selected = self.db.select_enrichable(&ids, fresh_after)?;
        summary.selected = selected.len();
        if selected.is_empty() {
            info!(received = summary.received, "nothing to enrich");
            return Ok(summary);
        }

        // Step 1: rate-limited scrape across the batch.
        let scraped = self.scrape_batch(selected).await?;
        summary.scraped = scraped.len();

        // Step 2: LLM analysis, in parallel across the batch.
        let analyzed: Vec<AnalyzedArticle> = stream::iter(scraped)
            .map(|s| self.analyze_one(s))
            .buffer_unordered(ANALYSIS_CONCURRENCY)
            .filter_map(|r| async move { r })
            .collect()
            .await;
        summary.analyzed = analyzed.len();

        // Steps 3 and 4: embed + upload in parallel, then commit.
        let processed: Vec<i64> = stream::iter(analyzed)
            .map(|a| self.finalize_one(a))
            .buffer_unordered(ANALYSIS_CONCURRENCY)
            .filter_map(|r| async move { r })
            .collect()
            .await;
        summary.processed = processed.len();

        info!(
            received = summary.received,
            selected = summary.selected,
            scraped = summary.scraped,
            analyzed = summary.analyzed,
            processed = summary.processed,
            "enrichment batch complete"
        );
        Ok(summary)
    }

    // ---- step 1: scrape ---------------------------------------------------

    async fn scrape_batch(
        &self,
        selected: Vec<EnrichableArticle>,
    ) -> Result<Vec<ScrapedArticle>, WorkerError> {
        let by_id: std::collections::HashMap<i64, EnrichableArticle> =
            selected.iter().map(|a| (a.id, a.clone())).collect();
        let items: Vec<RateItem> = selected
            .iter()
            .map(|a| RateItem {
                id: a.id,
                url: a.url.clone(),
            })
            .collect();

        let mut limiter = DomainRateLimiter::new(self.rate_limits);
        let outcomes: Vec<ScrapedArticle> = limiter
            .process_batch(items, self.sleeper.as_ref(), |item, host| {
                let article = by_id.get(&item.id).cloned();
                async move {
                    let article = article.ok_or(())?;
                    self.scrape_one(article, &host).await
                }
            })
            .await;
        Ok(outcomes)
    }

    /// Scrape one article under the limiter. Terminal failures are written
    /// to the row here; `Err` only tells the limiter to discard the item.
    async fn scrape_one(
        &self,
        article: EnrichableArticle,
        host: &str,
    ) -> Result<ScrapedArticle, ()> {
        let now = Utc::now();

        // PDFs cannot be processed; skip without touching the network.
        if article.url.to_ascii_lowercase().ends_with(".pdf") {
            let write = self.db.mark_failed(
                article.id,
                ArticleStatus::SkippedPdf,
                "PDF article - cannot process",
                now,
            );
            if let Err(e) = write {
                warn!(article_id = article.id, error = %e, "could not record PDF skip");
            }
            return Err(());
        }

        let tricky = self.is_tricky(host);
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let attempt = with_backoff(&policy, self.sleeper.as_ref(), "scrape article", || {
            let url = article.url.clone();
            async move {
                match tokio::time::timeout(SCRAPE_TIMEOUT, self.scrape_attempt(&url, tricky)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ScrapeError::Timeout),
                }
            }
        })
        .await;

        match attempt {
            Ok((parsed, used_browser)) => {
                if let Err(e) = self.db.mark_content_fetched(article.id, used_browser) {
                    warn!(article_id = article.id, error = %e, "could not record fetched content");
                    return Err(());
                }
                Ok(ScrapedArticle {
                    article,
                    text: parsed.text,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let status = if message.contains("render") {
                    ArticleStatus::RenderFailed
                } else {
                    ArticleStatus::FetchFailed
                };
                if let Err(db_err) = self.db.mark_failed(article.id, status, &message, now) {
                    warn!(article_id = article.id, error = %db_err, "could not record scrape failure");
                }
                Err(())
            }
        }
    }

    /// One fetch-and-extract attempt: tricky hosts go straight to the
    /// renderer, everything else tries plain HTTP first and falls back
    /// after a short jitter.
    async fn scrape_attempt(
        &self,
        url: &str,
        tricky: bool,
    ) -> Result<(ParsedArticle, bool), ScrapeError> {
        let (html, used_browser) = if tricky {
            (self.renderer.fetch_rendered(url).await?, true)
        } else {
            match fetch_plain(url).await {
                Ok(html) => (html, false),
                Err(e) => {
                    warn!(%url, error = %e, "plain fetch failed; falling back to renderer");
                    let jitter = Duration::from_millis(rng().random_range(500..=3000));
                    self.sleeper.sleep("render fallback jitter", jitter).await;
                    (self.renderer.fetch_rendered(url).await?, true)
                }
            }
        };

        let parsed = parse_article(&html)?;
        Ok((parsed, used_browser))
    }

    // ---- step 2: analyze --------------------------------------------------

    async fn analyze_one(&self, scraped: ScrapedArticle) -> Option<AnalyzedArticle> {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let title = &scraped.article.title;
        let text = &scraped.text;

        let result: Result<ArticleAnalysis, StepError<AnalysisError>> =
            with_backoff(&policy, self.sleeper.as_ref(), "llm analysis", || async {
                match tokio::time::timeout(ANALYSIS_TIMEOUT, self.analysis.analyze(title, text))
                    .await
                {
                    Ok(result) => result.map_err(StepError::Inner),
                    Err(_) => Err(StepError::Timeout),
                }
            })
            .await;

        match result {
            Ok(analysis) => Some(AnalyzedArticle {
                article: scraped.article,
                text: scraped.text,
                analysis,
            }),
            Err(e) => {
                let write = self.db.mark_failed(
                    scraped.article.id,
                    ArticleStatus::AiAnalysisFailed,
                    &e.to_string(),
                    Utc::now(),
                );
                if let Err(db_err) = write {
                    warn!(article_id = scraped.article.id, error = %db_err, "could not record analysis failure");
                }
                None
            }
        }
    }

    // ---- steps 3 & 4: embed + upload, then commit -------------------------

    async fn finalize_one(&self, analyzed: AnalyzedArticle) -> Option<i64> {
        let article_id = analyzed.article.id;
        let now = Utc::now();
        let key = blob_key(article_id, analyzed.article.publish_date, now);
        let search_text = build_search_text(&analyzed.article.title, &analyzed.analysis);
        let policy = RetryPolicy::new(3, Duration::from_secs(2));

        let embed_fut = with_backoff(&policy, self.sleeper.as_ref(), "embed search text", || {
            let search_text = &search_text;
            async move {
                match tokio::time::timeout(EMBED_UPLOAD_TIMEOUT, self.embeddings.embed(search_text))
                    .await
                {
                    Ok(result) => result.map_err(StepError::<EmbeddingsError>::Inner),
                    Err(_) => Err(StepError::Timeout),
                }
            }
        });
        let upload_fut = with_backoff(&policy, self.sleeper.as_ref(), "upload article text", || {
            let key = &key;
            let text = &analyzed.text;
            async move {
                match tokio::time::timeout(EMBED_UPLOAD_TIMEOUT, self.blob.put(key, text.as_bytes()))
                    .await
                {
                    Ok(result) => result.map_err(StepError::<BlobError>::Inner),
                    Err(_) => Err(StepError::Timeout),
                }
            }
        });

        let (embedded, uploaded) = tokio::join!(embed_fut, upload_fut);

        // Either failure is terminal and the embedding must not be written.
        let embedding = match embedded {
            Ok(embedding) => embedding,
            Err(e) => {
                self.record_failure(article_id, ArticleStatus::EmbeddingFailed, &e.to_string());
                return None;
            }
        };
        if let Err(e) = uploaded {
            self.record_failure(article_id, ArticleStatus::BlobUploadFailed, &e.to_string());
            return None;
        }

        // Step 4: single commit update.
        match self
            .db
            .commit_processed(article_id, &analyzed.analysis, &embedding, &key, now)
        {
            Ok(()) => Some(article_id),
            Err(e) => {
                warn!(article_id, error = %e, "commit failed; batch redelivery will retry");
                None
            }
        }
    }

    fn record_failure(&self, article_id: i64, status: ArticleStatus, reason: &str) {
        if let Err(e) = self.db.mark_failed(article_id, status, reason, Utc::now()) {
            warn!(article_id, error = %e, "could not record step failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceSeed;
    use crate::db::NewArticle;
    use crate::models::EMBEDDING_DIM;
    use crate::sleep::testing::NoopSleeper;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARTICLE_HTML: &str = r#"<html><head><title>Page</title></head><body>
        <h1>Big headline</h1>
        <article>
          <p>The first paragraph of the story, long enough to matter.</p>
          <p>The second paragraph of the story, also long enough.</p>
        </article></body></html>"#;

    fn analysis_body() -> serde_json::Value {
        let analysis = serde_json::json!({
            "language": "en",
            "primary_location": "USA",
            "completeness": "COMPLETE",
            "content_quality": "OK",
            "event_summary_points": ["Something happened."],
            "thematic_keywords": ["events"],
            "topic_tags": ["news"],
            "key_entities": ["Someone"],
            "content_focus": ["reporting"]
        });
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": analysis.to_string()}}]
        })
    }

    struct Harness {
        db: Database,
        blob_dir: tempfile::TempDir,
        content: MockServer,
        renderer: MockServer,
        llm: MockServer,
        embeddings: MockServer,
        tricky: Vec<String>,
        blob_root_override: Option<std::path::PathBuf>,
    }

    impl Harness {
        async fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                blob_dir: tempfile::tempdir().unwrap(),
                content: MockServer::start().await,
                renderer: MockServer::start().await,
                llm: MockServer::start().await,
                embeddings: MockServer::start().await,
                tricky: Vec::new(),
                blob_root_override: None,
            }
        }

        async fn with_default_services(self) -> Self {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(200).set_body_json(analysis_body()))
                .mount(&self.llm)
                .await;
            Mock::given(method("POST"))
                .and(path("/embeddings"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "embeddings": [vec![0.1f32; EMBEDDING_DIM]]
                })))
                .mount(&self.embeddings)
                .await;
            self
        }

        fn worker(&self) -> EnrichmentWorker {
            let blob_root = self
                .blob_root_override
                .clone()
                .unwrap_or_else(|| self.blob_dir.path().to_path_buf());
            EnrichmentWorker::new(
                self.db.clone(),
                BlobStore::new(blob_root),
                Renderer::new(&self.renderer.uri(), "acct1", "token"),
                AnalysisClient::new(&self.llm.uri(), "key", "test-model"),
                EmbeddingsClient::new(&self.embeddings.uri(), "secret", EMBEDDING_DIM),
                Arc::new(NoopSleeper),
                self.tricky.clone(),
                RateLimitConfig {
                    max_concurrent: 8,
                    global_cooldown: Duration::from_millis(1),
                    domain_cooldown: Duration::from_millis(1),
                },
                48,
            )
        }

        /// Insert one fresh PENDING_FETCH article at the given URL.
        fn seed_article(&self, url: &str) -> i64 {
            self.db
                .sync_sources(&[SourceSeed {
                    url: "https://example.com/rss".to_string(),
                    name: "Example Wire".to_string(),
                    category: String::new(),
                    paywall: false,
                    scrape_frequency: 2,
                }])
                .unwrap();
            let source_id = self.db.list_sources().unwrap()[0].id;
            let ids = self
                .db
                .insert_articles(&[NewArticle {
                    source_id,
                    url: url.to_string(),
                    title: "Big headline".to_string(),
                    publish_date: Some(Utc::now() - ChronoDuration::hours(1)),
                }])
                .unwrap();
            ids[0]
        }
    }

    #[tokio::test]
    async fn test_happy_path_plain_fetch() {
        let h = Harness::new().await.with_default_services().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .mount(&h.content)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(
            summary,
            WorkSummary {
                received: 1,
                selected: 1,
                scraped: 1,
                analyzed: 1,
                processed: 1,
            }
        );

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Processed);
        assert!(!article.used_browser);
        assert_eq!(article.embedding.unwrap().len(), EMBEDDING_DIM);
        assert!(article.processed_at.is_some());
        assert!(article.fail_reason.is_none());

        let key = article.content_file_key.unwrap();
        assert!(key.ends_with(&format!("/{id}.txt")));
        let stored = BlobStore::new(h.blob_dir.path()).get(&key).await.unwrap();
        assert!(
            String::from_utf8(stored)
                .unwrap()
                .contains("first paragraph")
        );
    }

    #[tokio::test]
    async fn test_pdf_is_skipped_without_fetching() {
        let h = Harness::new().await.with_default_services().await;
        // Uppercase extension counts as PDF too. The URL is unroutable on
        // purpose: the skip must never touch the network.
        let id = h.seed_article("https://example.invalid/report.PDF");

        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.scraped, 0);

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::SkippedPdf);
        assert_eq!(
            article.fail_reason.as_deref(),
            Some("PDF article - cannot process")
        );
        assert!(article.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_tricky_host_uses_renderer_only() {
        let mut h = Harness::new().await.with_default_services().await;
        h.tricky = vec!["127.0.0.1".to_string()];

        // Plain fetch must never be attempted against the content server.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .expect(0)
            .mount(&h.content)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct1/browser-rendering/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "result": ARTICLE_HTML
            })))
            .expect(1)
            .mount(&h.renderer)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(summary.processed, 1);

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Processed);
        assert!(article.used_browser);
    }

    #[tokio::test]
    async fn test_plain_failure_falls_back_to_renderer() {
        let h = Harness::new().await.with_default_services().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&h.content)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct1/browser-rendering/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "result": ARTICLE_HTML
            })))
            .mount(&h.renderer)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        h.worker().process(vec![id]).await.unwrap();

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Processed);
        assert!(article.used_browser);
    }

    #[tokio::test]
    async fn test_render_failure_is_render_failed() {
        let mut h = Harness::new().await.with_default_services().await;
        h.tricky = vec!["127.0.0.1".to_string()];
        Mock::given(method("POST"))
            .and(path("/accounts/acct1/browser-rendering/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false,
                "errors": [{"code": 1, "message": "browser crashed"}]
            })))
            .mount(&h.renderer)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(summary.scraped, 0);

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::RenderFailed);
        assert!(article.fail_reason.unwrap().contains("render"));
    }

    #[tokio::test]
    async fn test_no_article_found_is_fetch_failed() {
        let h = Harness::new().await.with_default_services().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body><h1>Headline only</h1></body></html>"),
            )
            .mount(&h.content)
            .await;
        // The renderer fallback cannot do better for this page.
        Mock::given(method("POST"))
            .and(path("/accounts/acct1/browser-rendering/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "result": "<html><body><h1>Headline only</h1></body></html>"
            })))
            .mount(&h.renderer)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        h.worker().process(vec![id]).await.unwrap();

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::FetchFailed);
        assert!(article.fail_reason.unwrap().contains("no article found"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_ai_analysis_failed() {
        let h = Harness::new().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .mount(&h.content)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&h.llm)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(summary.scraped, 1);
        assert_eq!(summary.analyzed, 0);

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::AiAnalysisFailed);
        assert!(article.fail_reason.unwrap().contains("rate limited"));
        assert!(article.embedding.is_none());
        assert!(article.content_file_key.is_none());
    }

    #[tokio::test]
    async fn test_upload_failure_does_not_persist_embedding() {
        let mut h = Harness::new().await.with_default_services().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .mount(&h.content)
            .await;
        // Point the blob root at a regular file so every upload fails.
        let blocker = h.blob_dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        h.blob_root_override = Some(blocker);

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let summary = h.worker().process(vec![id]).await.unwrap();
        assert_eq!(summary.analyzed, 1);
        assert_eq!(summary.processed, 0);

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::BlobUploadFailed);
        assert!(article.embedding.is_none(), "embedding must not be written");
    }

    #[tokio::test]
    async fn test_embedding_failure_is_embedding_failed() {
        let h = Harness::new().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .mount(&h.content)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(analysis_body()))
            .mount(&h.llm)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&h.embeddings)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        h.worker().process(vec![id]).await.unwrap();

        let article = h.db.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::EmbeddingFailed);
        assert!(article.embedding.is_none());
    }

    #[tokio::test]
    async fn test_redelivery_is_a_no_op() {
        let h = Harness::new().await.with_default_services().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_HTML))
            .mount(&h.content)
            .await;

        let id = h.seed_article(&format!("{}/story", h.content.uri()));
        let worker = h.worker();
        let first = worker.process(vec![id]).await.unwrap();
        assert_eq!(first.processed, 1);

        let second = worker.process(vec![id]).await.unwrap();
        assert_eq!(second.selected, 0);
        assert_eq!(second.processed, 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_skipped_silently() {
        let h = Harness::new().await.with_default_services().await;
        let summary = h.worker().process(vec![9999]).await.unwrap();
        assert_eq!(summary.received, 1);
        assert_eq!(summary.selected, 0);
    }
}
