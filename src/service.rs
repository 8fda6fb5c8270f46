use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::alerts::{self, LogAlertSink};
use crate::config::TrackerConfig;
use crate::database::Database;
use crate::feed::JsonDirFeed;
use crate::matcher::TokenSimilarity;
use crate::models::PriceObservation;
use crate::tracker::{IngestReport, PriceTracker};
use crate::traits::{AlertSink, ObservationFeed};

/// One scheduled ingestion pipeline: feed in, catalog and history persisted,
/// alerts out.
#[derive(Clone)]
pub struct PriceWatch {
    feed: Arc<dyn ObservationFeed>,
    database: Database,
    state: Arc<Mutex<WatchState>>,
    sink: Arc<dyn AlertSink>,
}

/// The tracker plus whatever it holds that SQLite does not have yet.
struct WatchState {
    tracker: PriceTracker,
    unsaved: Vec<PriceObservation>,
    catalog_dirty: bool,
}

impl WatchState {
    /// Write the catalog and every unsaved observation. On failure nothing
    /// is forgotten; the next pass retries.
    async fn persist(&mut self, database: &Database) -> Result<u64> {
        if self.catalog_dirty {
            database.save_catalog(self.tracker.catalog()).await?;
            self.catalog_dirty = false;
        }
        if self.unsaved.is_empty() {
            return Ok(0);
        }
        let stored = database.append_observations(&self.unsaved).await?;
        self.unsaved.clear();
        Ok(stored)
    }
}

impl PriceWatch {
    /// Connect to the configured database and resume from its state.
    pub async fn new(config: &TrackerConfig) -> Result<Self> {
        let database = Database::connect(&config.database.url).await?;
        let feed = Arc::new(JsonDirFeed::new(&config.feed.dir));
        Self::with_parts(config, database, feed, Arc::new(LogAlertSink)).await
    }

    pub async fn with_parts(
        config: &TrackerConfig,
        database: Database,
        feed: Arc<dyn ObservationFeed>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let (catalog, ledger) = database
            .load_state(config.ledger.change_threshold_pct)
            .await?;
        let tracker = PriceTracker::from_parts(
            config,
            Box::new(TokenSimilarity::default()),
            catalog,
            ledger,
        );

        Ok(Self {
            feed,
            database,
            state: Arc::new(Mutex::new(WatchState {
                tracker,
                unsaved: Vec::new(),
                catalog_dirty: false,
            })),
            sink,
        })
    }

    /// Poll the feed once and run whatever arrived through the pipeline.
    ///
    /// Writes left over from a failed pass are retried along with this one's.
    pub async fn run_pass(&self) -> Result<IngestReport> {
        let observations = self.feed.poll().await?;

        // Held across the writes so passes persist in ingestion order
        let mut state = self.state.lock().await;

        if observations.is_empty() {
            let retried = state.persist(&self.database).await?;
            if retried > 0 {
                info!("Stored {} observations left over from an earlier pass", retried);
            }
            info!("No new observations from {}", self.feed.name());
            return Ok(IngestReport::default());
        }

        info!("Ingesting {} observations from {}", observations.len(), self.feed.name());

        let report = state.tracker.ingest(&observations);
        state.catalog_dirty = true;
        state.unsaved.extend(report.new_observations().iter().cloned());

        if let Err(e) = state.persist(&self.database).await {
            warn!("Keeping {} observations for the next pass", state.unsaved.len());
            return Err(e);
        }
        drop(state);

        for rejected in &report.rejected_records {
            warn!("Rejected {} ({}): {}", rejected.url, rejected.title, rejected.error);
        }
        for uncertain in &report.low_confidence {
            warn!(
                "Low-confidence match {} -> {} (score {:.3}, runner-up {:?})",
                uncertain.listing, uncertain.product, uncertain.score, uncertain.runner_up
            );
        }

        let delivered = alerts::dispatch(self.sink.as_ref(), &report.significant_changes).await;

        info!("Pass complete: {}; {} alerts sent", report.summary(), delivered);
        Ok(report)
    }
}
