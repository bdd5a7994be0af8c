pub mod analysis;
pub mod blob;
pub mod bus;
pub mod cli;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod embeddings;
pub mod extract;
pub mod feed;
pub mod fetch;
pub mod limiter;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod search_text;
pub mod sleep;
pub mod utils;
pub mod worker;

// Re-export the types the binary wires together.
pub use config::PipelineConfig;
pub use models::{Article, ArticleStatus, Source};
