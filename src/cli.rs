use clap::{Parser, Subcommand};

/// Harvest RSS sources on a schedule and enrich each newly-discovered
/// article: scrape, analyze with an LLM, embed, store.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML pipeline config
    #[arg(short, long, default_value = "wirebrief.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full pipeline: schedulers, dispatcher, housekeeping (default)
    Run,
    /// Run one feed tick for a single source, then exit
    Tick {
        /// Source id as listed by `sources`
        source_id: i64,
    },
    /// Enrich specific article ids once, then exit
    Enrich {
        /// Article ids to process
        ids: Vec<i64>,
    },
    /// List configured sources and their scheduler state
    Sources,
}
