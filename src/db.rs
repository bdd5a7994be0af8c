use crate::config::SourceSeed;
use crate::models::{Article, ArticleAnalysis, ArticleStatus, EMBEDDING_DIM, Source};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS sources (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    url               TEXT NOT NULL UNIQUE,
    name              TEXT NOT NULL,
    category          TEXT NOT NULL DEFAULT '',
    paywall           INTEGER NOT NULL DEFAULT 0,
    scrape_frequency  INTEGER NOT NULL DEFAULT 2,
    last_checked      TEXT,
    do_initialized_at TEXT
);

CREATE TABLE IF NOT EXISTS articles (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    url                  TEXT NOT NULL UNIQUE,
    title                TEXT NOT NULL DEFAULT '',
    publish_date         TEXT,
    source_id            INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    status               TEXT NOT NULL DEFAULT 'PENDING_FETCH',
    used_browser         INTEGER NOT NULL DEFAULT 0,
    language             TEXT,
    primary_location     TEXT,
    completeness         TEXT,
    content_quality      TEXT,
    event_summary_points TEXT,
    thematic_keywords    TEXT,
    topic_tags           TEXT,
    key_entities         TEXT,
    content_focus        TEXT,
    embedding            BLOB,
    content_file_key     TEXT,
    fail_reason          TEXT,
    processed_at         TEXT,
    created_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
);

CREATE INDEX IF NOT EXISTS idx_articles_source_id ON articles(source_id);
CREATE INDEX IF NOT EXISTS idx_articles_status ON articles(status);

CREATE TABLE IF NOT EXISTS reports (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
);

CREATE TABLE IF NOT EXISTS scraper_state (
    scraper_id TEXT PRIMARY KEY,
    state      TEXT NOT NULL,
    alarm      TEXT
);
";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding has wrong dimension: {0} (expected {EMBEDDING_DIM})")]
    EmbeddingDimension(usize),
}

/// A row to insert for a newly-observed feed entry.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub publish_date: Option<DateTime<Utc>>,
}

/// The slice of an article the enrichment worker needs up front.
#[derive(Debug, Clone)]
pub struct EnrichableArticle {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub publish_date: Option<DateTime<Utc>>,
}

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn format_dt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(|d| d.to_rfc3339())
}

/// Embedding vectors are stored as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn json_vec(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn vec_json(s: Option<String>) -> Vec<String> {
    s.and_then(|v| serde_json::from_str(&v).ok()).unwrap_or_default()
}

/// Handle to the relational store. Cheap to clone; all access serializes on
/// an internal mutex, which SQLite wants anyway.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ---- sources ----------------------------------------------------------

    /// Reconcile the sources table with the configured seeds. New sources
    /// are inserted; existing rows keep their scheduler timestamps.
    pub fn sync_sources(&self, seeds: &[SourceSeed]) -> Result<usize, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "INSERT INTO sources (url, name, category, paywall, scrape_frequency)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO UPDATE SET
               name = excluded.name,
               category = excluded.category,
               paywall = excluded.paywall,
               scrape_frequency = excluded.scrape_frequency",
        )?;

        let mut touched = 0usize;
        for seed in seeds {
            touched += stmt.execute(params![
                seed.url,
                seed.name,
                seed.category,
                seed.paywall as i64,
                seed.scrape_frequency,
            ])?;
        }
        info!(count = touched, "synced sources from config");
        Ok(touched)
    }

    pub fn get_source(&self, id: i64) -> Result<Option<Source>, DbError> {
        let conn = self.lock();
        let source = conn
            .query_row(
                "SELECT id, url, name, category, paywall, scrape_frequency,
                        last_checked, do_initialized_at
                 FROM sources WHERE id = ?1",
                params![id],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, name, category, paywall, scrape_frequency,
                    last_checked, do_initialized_at
             FROM sources ORDER BY id",
        )?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    pub fn delete_source(&self, id: i64) -> Result<(), DbError> {
        self.lock()
            .execute("DELETE FROM sources WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_source_initialized(
        &self,
        id: i64,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        self.lock().execute(
            "UPDATE sources SET do_initialized_at = ?2 WHERE id = ?1",
            params![id, format_dt(&at)],
        )?;
        Ok(())
    }

    pub fn set_source_last_checked(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        self.lock().execute(
            "UPDATE sources SET last_checked = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- articles ---------------------------------------------------------

    /// Insert newly-observed articles, deduping on URL. Returns the ids of
    /// the rows that were truly inserted; re-observed URLs are no-ops.
    pub fn insert_articles(&self, rows: &[NewArticle]) -> Result<Vec<i64>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "INSERT INTO articles (source_id, url, title, publish_date)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(url) DO NOTHING
             RETURNING id",
        )?;

        let mut inserted = Vec::new();
        for row in rows {
            let id: Option<i64> = stmt
                .query_row(
                    params![
                        row.source_id,
                        row.url,
                        row.title,
                        format_dt(&row.publish_date)
                    ],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                inserted.push(id);
            }
        }
        Ok(inserted)
    }

    /// Step-0 filter: keep ids that are unprocessed, unfailed, and fresh.
    pub fn select_enrichable(
        &self,
        ids: &[i64],
        fresh_after: DateTime<Utc>,
    ) -> Result<Vec<EnrichableArticle>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, title, publish_date FROM articles
             WHERE id = ?1
               AND processed_at IS NULL
               AND fail_reason IS NULL
               AND publish_date IS NOT NULL
               AND publish_date > ?2",
        )?;

        let cutoff = fresh_after.to_rfc3339();
        let mut selected = Vec::new();
        for id in ids {
            let row = stmt
                .query_row(params![id, cutoff], |r| {
                    Ok(EnrichableArticle {
                        id: r.get(0)?,
                        url: r.get(1)?,
                        title: r.get(2)?,
                        publish_date: parse_dt(r.get(3)?),
                    })
                })
                .optional()?;
            if let Some(row) = row {
                selected.push(row);
            }
        }
        Ok(selected)
    }

    /// Record a terminal failure (or skip) for one article.
    pub fn mark_failed(
        &self,
        id: i64,
        status: ArticleStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let changed = self.lock().execute(
            "UPDATE articles
             SET status = ?2, fail_reason = ?3, processed_at = ?4
             WHERE id = ?1 AND processed_at IS NULL",
            params![id, status.as_str(), reason, now.to_rfc3339()],
        )?;
        if changed == 0 {
            warn!(article_id = id, status = status.as_str(), "failure update was a no-op");
        }
        Ok(())
    }

    pub fn mark_content_fetched(&self, id: i64, used_browser: bool) -> Result<(), DbError> {
        self.lock().execute(
            "UPDATE articles SET status = ?2, used_browser = ?3
             WHERE id = ?1 AND processed_at IS NULL",
            params![
                id,
                ArticleStatus::ContentFetched.as_str(),
                used_browser as i64
            ],
        )?;
        Ok(())
    }

    /// Final commit for one article: analysis fields, embedding, blob key,
    /// PROCESSED status, and processed_at in a single update.
    pub fn commit_processed(
        &self,
        id: i64,
        analysis: &ArticleAnalysis,
        embedding: &[f32],
        content_file_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(DbError::EmbeddingDimension(embedding.len()));
        }
        self.lock().execute(
            "UPDATE articles SET
                status = ?2,
                language = ?3,
                primary_location = ?4,
                completeness = ?5,
                content_quality = ?6,
                event_summary_points = ?7,
                thematic_keywords = ?8,
                topic_tags = ?9,
                key_entities = ?10,
                content_focus = ?11,
                embedding = ?12,
                content_file_key = ?13,
                processed_at = ?14
             WHERE id = ?1 AND processed_at IS NULL",
            params![
                id,
                ArticleStatus::Processed.as_str(),
                analysis.language,
                analysis.primary_location,
                analysis.completeness.as_str(),
                analysis.content_quality.as_str(),
                json_vec(&analysis.event_summary_points),
                json_vec(&analysis.thematic_keywords),
                json_vec(&analysis.topic_tags),
                json_vec(&analysis.key_entities),
                json_vec(&analysis.content_focus),
                embedding_to_bytes(embedding),
                content_file_key,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_article(&self, id: i64) -> Result<Option<Article>, DbError> {
        let conn = self.lock();
        let article = conn
            .query_row(
                "SELECT id, url, title, publish_date, source_id, status, used_browser,
                        language, primary_location, completeness, content_quality,
                        event_summary_points, thematic_keywords, topic_tags,
                        key_entities, content_focus, embedding, content_file_key,
                        fail_reason, processed_at, created_at
                 FROM articles WHERE id = ?1",
                params![id],
                row_to_article,
            )
            .optional()?;
        Ok(article)
    }

    /// Housekeeping: drop terminally-failed rows older than the horizon.
    /// PROCESSED rows are kept for downstream report generation.
    pub fn prune_failed_older_than(&self, days: i64, now: DateTime<Utc>) -> Result<usize, DbError> {
        let horizon = (now - chrono::Duration::days(days)).to_rfc3339();
        let pruned = self.lock().execute(
            "DELETE FROM articles
             WHERE processed_at IS NOT NULL
               AND processed_at < ?1
               AND status NOT IN ('PROCESSED', 'PENDING_FETCH', 'CONTENT_FETCHED')",
            params![horizon],
        )?;
        Ok(pruned)
    }

    // ---- scraper state ----------------------------------------------------

    pub fn get_scraper_state(&self, scraper_id: &str) -> Result<Option<String>, DbError> {
        let conn = self.lock();
        let state = conn
            .query_row(
                "SELECT state FROM scraper_state WHERE scraper_id = ?1",
                params![scraper_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(state)
    }

    pub fn put_scraper_state(&self, scraper_id: &str, state_json: &str) -> Result<(), DbError> {
        self.lock().execute(
            "INSERT INTO scraper_state (scraper_id, state)
             VALUES (?1, ?2)
             ON CONFLICT(scraper_id) DO UPDATE SET state = excluded.state",
            params![scraper_id, state_json],
        )?;
        Ok(())
    }

    pub fn delete_scraper_state(&self, scraper_id: &str) -> Result<(), DbError> {
        self.lock().execute(
            "DELETE FROM scraper_state WHERE scraper_id = ?1",
            params![scraper_id],
        )?;
        Ok(())
    }

    pub fn get_alarm(&self, scraper_id: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.lock();
        let alarm: Option<Option<String>> = conn
            .query_row(
                "SELECT alarm FROM scraper_state WHERE scraper_id = ?1",
                params![scraper_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(alarm.flatten().and_then(|s| parse_dt(Some(s))))
    }

    pub fn set_alarm(
        &self,
        scraper_id: &str,
        alarm: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        self.lock().execute(
            "UPDATE scraper_state SET alarm = ?2 WHERE scraper_id = ?1",
            params![scraper_id, format_dt(&alarm)],
        )?;
        Ok(())
    }
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        category: row.get(3)?,
        paywall: row.get::<_, i64>(4)? != 0,
        scrape_frequency: row.get(5)?,
        last_checked: parse_dt(row.get(6)?),
        do_initialized_at: parse_dt(row.get(7)?),
    })
}

fn row_to_article(row: &rusqlite::Row<'_>) -> rusqlite::Result<Article> {
    let status: String = row.get(5)?;
    let language: Option<String> = row.get(7)?;
    let completeness: Option<String> = row.get(9)?;
    let quality: Option<String> = row.get(10)?;

    let analysis = match (&language, &completeness, &quality) {
        (Some(language), Some(completeness), Some(quality)) => Some(ArticleAnalysis {
            language: language.clone(),
            primary_location: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            completeness: crate::models::Completeness::parse(completeness)
                .unwrap_or(crate::models::Completeness::PartialUseless),
            content_quality: crate::models::ContentQuality::parse(quality)
                .unwrap_or(crate::models::ContentQuality::Junk),
            event_summary_points: vec_json(row.get(11)?),
            thematic_keywords: vec_json(row.get(12)?),
            topic_tags: vec_json(row.get(13)?),
            key_entities: vec_json(row.get(14)?),
            content_focus: vec_json(row.get(15)?),
        }),
        _ => None,
    };

    let embedding: Option<Vec<u8>> = row.get(16)?;

    Ok(Article {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        publish_date: parse_dt(row.get(3)?),
        source_id: row.get(4)?,
        status: ArticleStatus::parse(&status).unwrap_or(ArticleStatus::PendingFetch),
        used_browser: row.get::<_, i64>(6)? != 0,
        analysis,
        embedding: embedding.map(|b| embedding_from_bytes(&b)),
        content_file_key: row.get(17)?,
        fail_reason: row.get(18)?,
        processed_at: parse_dt(row.get(19)?),
        created_at: parse_dt(row.get(20)?).unwrap_or_else(Utc::now),
    })
}
