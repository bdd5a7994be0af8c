use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One publisher feed as declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSeed {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub paywall: bool,
    #[serde(default = "default_frequency")]
    pub scrape_frequency: i64,
}

fn default_frequency() -> i64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

fn default_dimension() -> usize {
    crate::models::EMBEDDING_DIM
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    pub base_url: String,
    pub account_id: String,
    #[serde(default)]
    pub api_token: String,
}

/// Worker tunables; the defaults are the production values.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_global_cooldown_ms")]
    pub global_cooldown_ms: u64,
    #[serde(default = "default_domain_cooldown_ms")]
    pub domain_cooldown_ms: u64,
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: i64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_max_concurrent() -> usize {
    8
}
fn default_global_cooldown_ms() -> u64 {
    1_000
}
fn default_domain_cooldown_ms() -> u64 {
    5_000
}
fn default_freshness_hours() -> i64 {
    48
}
fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            global_cooldown_ms: default_global_cooldown_ms(),
            domain_cooldown_ms: default_domain_cooldown_ms(),
            freshness_hours: default_freshness_hours(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

/// Hosts known to need browser rendering from the start.
fn default_tricky_domains() -> Vec<String> {
    [
        "reuters.com",
        "nytimes.com",
        "politico.com",
        "wsj.com",
        "ft.com",
        "bloomberg.com",
        "economist.com",
        "washingtonpost.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_database_path() -> String {
    "./data/wirebrief.db".to_string()
}

fn default_blob_root() -> String {
    "./data/blobs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_blob_root")]
    pub blob_root: String,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub renderer: RendererConfig,
    #[serde(default = "default_tricky_domains")]
    pub tricky_domains: Vec<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sources: Vec<SourceSeed>,
}

/// Load and parse the YAML pipeline config.
pub fn load_config(path: &str) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(Path::new(path)).map_err(|e| ConfigError::Io {
        path: path.to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_string(),
        source: e,
    })
}
