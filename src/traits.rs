//! Collaborator interfaces: where observations come from and where
//! significant price changes go

use anyhow::Result;
use async_trait::async_trait;

use crate::models::RawObservation;
use crate::tracker::SignificantChange;

/// Source of scraped observations.
///
/// Implementations hand over complete batches: every observation of a
/// listing's scrape pass must arrive in the same `poll` result.
#[async_trait]
pub trait ObservationFeed: Send + Sync {
    /// Display name for logs
    fn name(&self) -> &str;

    /// Collect the observations that arrived since the last poll
    ///
    /// # Returns
    /// * `Result<Vec<RawObservation>>` - Pending observations, possibly empty
    async fn poll(&self) -> Result<Vec<RawObservation>>;
}

/// Receiver of significant price changes
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, change: &SignificantChange) -> Result<()>;
}
