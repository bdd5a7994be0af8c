use crate::bus::{ArticleQueue, BusError, MAX_BATCH_IDS};
use crate::db::{Database, DbError, NewArticle};
use crate::feed::{FeedError, parse_feed};
use crate::fetch::{FetchError, fetch_feed_body};
use crate::models::{Source, SourceState};
use crate::retry::{RetryPolicy, with_backoff};
use crate::sleep::Sleeper;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

/// Stable per-source identity: repeated `initialize` calls for the same URL
/// converge on the same scraper instance.
pub fn scraper_id_for(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Scrape-frequency tier to tick interval. Unknown tiers fall back to
/// tier 2 with a warning.
pub fn tier_interval(tier: i64) -> ChronoDuration {
    match tier {
        1 => ChronoDuration::hours(1),
        2 => ChronoDuration::hours(4),
        3 => ChronoDuration::hours(6),
        4 => ChronoDuration::hours(24),
        other => {
            warn!(tier = other, "unknown scrape frequency tier; using tier 2");
            ChronoDuration::hours(4)
        }
    }
}

/// Delay before a freshly-initialized scraper's first tick.
const FIRST_TICK_DELAY_SECS: i64 = 5;
/// Re-arm distance after a corrupt-state read.
const CORRUPT_STATE_BACKOFF_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScraperPhase {
    Uninitialized,
    Scheduled,
    Running,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct ScraperStatus {
    pub state: ScraperPhase,
    pub next_tick_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub entries: usize,
    pub inserted: usize,
    pub published_batches: usize,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("scraper state failed validation; re-armed far in the future")]
    CorruptState,
    #[error("feed fetch failed: {0}")]
    FeedFetch(#[from] FetchError),
    #[error("feed parse failed: {0}")]
    FeedParse(#[from] FeedError),
    #[error("bus publish failed: {0}")]
    Bus(#[from] BusError),
}

/// One durable scraper instance per source URL.
///
/// Ticks for the same source are serial: only the driver task (or a test)
/// calls `tick`. The persisted alarm makes the schedule survive restarts.
pub struct SourceScraper {
    id: String,
    db: Database,
    bus: ArticleQueue,
    sleeper: Arc<dyn Sleeper>,
    phase: Mutex<ScraperPhase>,
    wakeup: Notify,
}

impl SourceScraper {
    pub fn new(url: &str, db: Database, bus: ArticleQueue, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            id: scraper_id_for(url),
            db,
            bus,
            sleeper,
            phase: Mutex::new(ScraperPhase::Uninitialized),
            wakeup: Notify::new(),
        }
    }

    pub fn scraper_id(&self) -> &str {
        &self.id
    }

    fn set_phase(&self, phase: ScraperPhase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
    }

    fn phase(&self) -> ScraperPhase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    fn arm(&self, at: DateTime<Utc>) -> Result<(), DbError> {
        self.db.set_alarm(&self.id, Some(at))?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Create (or converge on) persisted state for this source and arm the
    /// first tick. Racing against a concurrent delete is safe: a source
    /// that no longer exists is ignored silently.
    #[instrument(level = "info", skip_all, fields(source_id = source.id, url = %source.url))]
    pub fn initialize(&self, source: &Source) -> Result<(), SchedulerError> {
        let Some(current) = self.db.get_source(source.id)? else {
            info!("source vanished before initialization; ignoring");
            return Ok(());
        };

        let state = SourceState {
            source_id: current.id,
            url: current.url.clone(),
            scrape_frequency: current.scrape_frequency,
            last_checked: None,
        };
        let state_json = serde_json::to_string(&state).expect("source state serializes");
        self.db.put_scraper_state(&self.id, &state_json)?;
        self.arm(Utc::now() + ChronoDuration::seconds(FIRST_TICK_DELAY_SECS))?;
        self.set_phase(ScraperPhase::Scheduled);

        // Only now is the instance fully initialized; a crash before this
        // point leaves the source re-initializable.
        self.db
            .set_source_initialized(current.id, Some(Utc::now()))?;
        info!("scraper initialized; first tick armed");
        Ok(())
    }

    /// Arm an immediate tick.
    pub fn trigger(&self) -> Result<(), SchedulerError> {
        self.arm(Utc::now())?;
        Ok(())
    }

    pub fn status(&self) -> Result<ScraperStatus, SchedulerError> {
        Ok(ScraperStatus {
            state: self.phase(),
            next_tick_at: self.db.get_alarm(&self.id)?,
        })
    }

    /// Remove persisted state and mark the source uninitialized.
    #[instrument(level = "info", skip_all, fields(scraper_id = %self.id))]
    pub fn destroy(&self, source_id: i64) -> Result<(), SchedulerError> {
        self.db.delete_scraper_state(&self.id)?;
        self.db.set_source_initialized(source_id, None)?;
        self.set_phase(ScraperPhase::Destroyed);
        self.wakeup.notify_one();
        info!("scraper destroyed");
        Ok(())
    }

    /// One scheduled tick: feed → diff → enqueue.
    ///
    /// The next regular tick is armed before any fallible work so a failing
    /// remainder can never stall the schedule; `last_checked` advances only
    /// after every step succeeded.
    #[instrument(level = "info", skip_all, fields(scraper_id = %self.id))]
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        self.set_phase(ScraperPhase::Running);
        let result = self.tick_inner().await;
        if self.phase() != ScraperPhase::Destroyed {
            self.set_phase(ScraperPhase::Scheduled);
        }
        result
    }

    async fn tick_inner(&self) -> Result<TickReport, SchedulerError> {
        let now = Utc::now();

        // Step 1: load and schema-validate persisted state. Corruption must
        // not turn into a tight failure loop.
        let raw = self.db.get_scraper_state(&self.id)?;
        let mut state: SourceState = match raw.as_deref().map(serde_json::from_str::<SourceState>) {
            Some(Ok(state)) => state,
            invalid => {
                warn!(
                    valid_json = matches!(invalid, Some(_)),
                    "scraper state missing or invalid"
                );
                self.arm(now + ChronoDuration::hours(CORRUPT_STATE_BACKOFF_HOURS))?;
                return Err(SchedulerError::CorruptState);
            }
        };

        // Step 2: arm the next regular tick first, whatever happens below.
        let interval = tier_interval(state.scrape_frequency);
        self.arm(now + interval)?;

        let policy = RetryPolicy::new(3, Duration::from_millis(500));

        // Step 3: fetch the feed.
        let body = with_backoff(&policy, self.sleeper.as_ref(), "fetch feed", || {
            fetch_feed_body(&state.url)
        })
        .await?;

        // Step 4: parse it.
        let entries = with_backoff(&policy, self.sleeper.as_ref(), "parse feed", || {
            let body = &body;
            async move { parse_feed(body) }
        })
        .await?;

        // Step 5: build insert rows in feed order.
        let rows: Vec<NewArticle> = entries
            .iter()
            .map(|entry| NewArticle {
                source_id: state.source_id,
                url: entry.link.clone(),
                title: entry.title.clone(),
                publish_date: entry.pub_date,
            })
            .collect();

        // Step 6: dedup insert; only truly-new rows come back.
        let inserted = with_backoff(&policy, self.sleeper.as_ref(), "insert articles", || {
            let rows = &rows;
            async move { self.db.insert_articles(rows) }
        })
        .await?;

        // Step 7: announce new work in sub-batches.
        let mut published_batches = 0usize;
        for chunk in inserted.chunks(MAX_BATCH_IDS) {
            self.bus.publish(chunk.to_vec())?;
            published_batches += 1;
        }

        // Step 8: full success; advance last_checked.
        state.last_checked = Some(now);
        let state_json = serde_json::to_string(&state).expect("source state serializes");
        self.db.put_scraper_state(&self.id, &state_json)?;
        self.db.set_source_last_checked(state.source_id, now)?;

        let report = TickReport {
            entries: entries.len(),
            inserted: inserted.len(),
            published_batches,
        };
        info!(
            entries = report.entries,
            inserted = report.inserted,
            batches = report.published_batches,
            "tick complete"
        );
        Ok(report)
    }

    /// Driver loop: sleep until the persisted alarm, run the tick, repeat.
    /// `trigger` and `destroy` interrupt the wait.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.phase() == ScraperPhase::Destroyed {
                return;
            }
            let alarm = match self.db.get_alarm(&self.id) {
                Ok(alarm) => alarm,
                Err(e) => {
                    warn!(error = %e, "could not read alarm; backing off");
                    self.sleeper
                        .sleep("alarm read backoff", Duration::from_secs(30))
                        .await;
                    continue;
                }
            };

            match alarm {
                None => self.wakeup.notified().await,
                Some(at) => {
                    let now = Utc::now();
                    if at <= now {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "tick failed; armed tick will retry");
                        }
                    } else {
                        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = self.wakeup.notified() => {}
                            _ = self.sleeper.sleep("next tick", wait) => {}
                        }
                    }
                }
            }
        }
    }
}

/// Owns one scraper instance (and its driver task) per source URL.
pub struct ScraperRegistry {
    db: Database,
    bus: ArticleQueue,
    sleeper: Arc<dyn Sleeper>,
    scrapers: Mutex<HashMap<String, Arc<SourceScraper>>>,
}

impl ScraperRegistry {
    pub fn new(db: Database, bus: ArticleQueue, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            db,
            bus,
            sleeper,
            scrapers: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize a scraper for the source, spawning its driver on first
    /// sight. Converges: the same URL always maps to the same instance.
    pub fn initialize_source(&self, source: &Source) -> Result<Arc<SourceScraper>, SchedulerError> {
        let id = scraper_id_for(&source.url);
        let (scraper, fresh) = {
            let mut scrapers = self.scrapers.lock().expect("registry mutex poisoned");
            match scrapers.get(&id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let scraper = Arc::new(SourceScraper::new(
                        &source.url,
                        self.db.clone(),
                        self.bus.clone(),
                        Arc::clone(&self.sleeper),
                    ));
                    scrapers.insert(id, Arc::clone(&scraper));
                    (scraper, true)
                }
            }
        };

        scraper.initialize(source)?;
        if fresh {
            tokio::spawn(Arc::clone(&scraper).run());
        }
        Ok(scraper)
    }

    pub fn get(&self, url: &str) -> Option<Arc<SourceScraper>> {
        self.scrapers
            .lock()
            .expect("registry mutex poisoned")
            .get(&scraper_id_for(url))
            .cloned()
    }

    /// Destroy the scraper for a source and forget the instance.
    pub fn destroy_source(&self, source: &Source) -> Result<(), SchedulerError> {
        let id = scraper_id_for(&source.url);
        let scraper = self
            .scrapers
            .lock()
            .expect("registry mutex poisoned")
            .remove(&id);
        if let Some(scraper) = scraper {
            scraper.destroy(source.id)?;
        }
        Ok(())
    }
}
