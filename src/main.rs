use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wirebrief::analysis::AnalysisClient;
use wirebrief::blob::BlobStore;
use wirebrief::bus::ArticleQueue;
use wirebrief::cli::{Cli, Command};
use wirebrief::config::{PipelineConfig, load_config};
use wirebrief::db::Database;
use wirebrief::dispatcher::JobDispatcher;
use wirebrief::embeddings::EmbeddingsClient;
use wirebrief::fetch::Renderer;
use wirebrief::limiter::RateLimitConfig;
use wirebrief::scheduler::{ScraperRegistry, SourceScraper};
use wirebrief::sleep::TokioSleeper;
use wirebrief::worker::EnrichmentWorker;

/// How often the daemon logs queue depth and prunes old failures.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(600);
/// Terminally-failed rows older than this many days are pruned.
const FAILURE_RETENTION_DAYS: i64 = 14;

fn build_worker(
    config: &PipelineConfig,
    db: Database,
    sleeper: Arc<dyn wirebrief::sleep::Sleeper>,
) -> EnrichmentWorker {
    EnrichmentWorker::new(
        db,
        BlobStore::new(config.blob_root.clone()),
        Renderer::new(
            &config.renderer.base_url,
            &config.renderer.account_id,
            &config.renderer.api_token,
        ),
        AnalysisClient::new(&config.llm.base_url, &config.llm.api_key, &config.llm.model),
        EmbeddingsClient::new(
            &config.embeddings.base_url,
            &config.embeddings.api_token,
            config.embeddings.dimension,
        ),
        sleeper,
        config.tricky_domains.clone(),
        RateLimitConfig {
            max_concurrent: config.worker.max_concurrent,
            global_cooldown: Duration::from_millis(config.worker.global_cooldown_ms),
            domain_cooldown: Duration::from_millis(config.worker.domain_cooldown_ms),
        },
        config.worker.freshness_hours,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let config = load_config(&args.config)?;

    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&config.database_path)?;
    db.sync_sources(&config.sources)?;

    let sleeper: Arc<dyn wirebrief::sleep::Sleeper> = Arc::new(TokioSleeper);
    let bus = ArticleQueue::new(config.worker.max_delivery_attempts);

    match args.command.unwrap_or(Command::Run) {
        Command::Sources => {
            for source in db.list_sources()? {
                println!(
                    "{:>4}  tier {}  {:<40}  last_checked={}  initialized={}",
                    source.id,
                    source.scrape_frequency,
                    source.url,
                    source
                        .last_checked
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    source.do_initialized_at.is_some(),
                );
            }
        }

        Command::Tick { source_id } => {
            let Some(source) = db.get_source(source_id)? else {
                return Err(format!("no source with id {source_id}").into());
            };
            let scraper = SourceScraper::new(
                &source.url,
                db.clone(),
                bus.clone(),
                Arc::clone(&sleeper),
            );
            scraper.initialize(&source)?;
            let report = scraper.tick().await?;
            info!(
                entries = report.entries,
                inserted = report.inserted,
                batches = report.published_batches,
                "manual tick complete"
            );
            // Drain what the tick just enqueued so the articles are
            // enriched before exit.
            let worker = build_worker(&config, db.clone(), Arc::clone(&sleeper));
            for delivery in bus.try_pull_batch(usize::MAX) {
                let summary = worker.process(delivery.message.articles_id).await?;
                bus.ack(&[delivery.delivery_id]);
                info!(processed = summary.processed, "manual enrichment complete");
            }
        }

        Command::Enrich { ids } => {
            let worker = build_worker(&config, db.clone(), Arc::clone(&sleeper));
            let summary = worker.process(ids).await?;
            info!(
                selected = summary.selected,
                processed = summary.processed,
                "enrichment complete"
            );
        }

        Command::Run => {
            let registry = ScraperRegistry::new(db.clone(), bus.clone(), Arc::clone(&sleeper));
            let mut started = 0usize;
            for source in db.list_sources()? {
                match registry.initialize_source(&source) {
                    Ok(_) => started += 1,
                    Err(e) => error!(source_id = source.id, error = %e, "scraper failed to start"),
                }
            }
            info!(scrapers = started, "source schedulers started");

            let worker = Arc::new(build_worker(&config, db.clone(), Arc::clone(&sleeper)));
            let dispatcher =
                JobDispatcher::new(bus.clone(), Arc::clone(&worker), Arc::clone(&sleeper));
            tokio::spawn(async move { dispatcher.run().await });

            let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            housekeeping.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                    _ = housekeeping.tick() => {
                        match db.prune_failed_older_than(FAILURE_RETENTION_DAYS, chrono::Utc::now()) {
                            Ok(pruned) if pruned > 0 => info!(pruned, "pruned old failed articles"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "prune failed"),
                        }
                        info!(
                            queue_depth = bus.depth(),
                            dead_letters = bus.dead_letter_count(),
                            "housekeeping"
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
