use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob io error at {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key for an article body: `YYYY/M/D/{articleId}.txt`, month and day
/// unpadded, from the publish date (UTC) or the given fallback instant.
pub fn blob_key(article_id: i64, publish_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let date = publish_date.unwrap_or(now);
    format!(
        "{}/{}/{}/{}.txt",
        date.year(),
        date.month(),
        date.day(),
        article_id
    )
}

/// Filesystem-backed object store for article text.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(Path::new(key))
    }

    /// Write bytes under `key`, creating intermediate directories.
    /// Re-uploads overwrite, which keeps retries idempotent.
    #[instrument(level = "debug", skip_all, fields(key))]
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| BlobError::Io {
                key: key.to_string(),
                source: e,
            })?;
        }
        fs::write(&path, bytes).await.map_err(|e| BlobError::Io {
            key: key.to_string(),
            source: e,
        })?;
        debug!(key, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        fs::read(self.path_for(key)).await.map_err(|e| BlobError::Io {
            key: key.to_string(),
            source: e,
        })
    }
}
