//! # Price change alerts
//!
//! The ledger flags price moves beyond the configured threshold; this module
//! hands those flags to an [`AlertSink`]. Delivery to chat, mail or webhooks
//! lives outside this crate; [`LogAlertSink`] records each change in the log
//! so the flags are visible even with no sink configured.
//!
//! A failing sink never fails the ingestion pass: errors are logged and the
//! remaining changes are still delivered.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, warn};

use crate::traits::AlertSink;
use crate::tracker::SignificantChange;

/// Alert sink that writes every significant change as a `warn` log line.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, change: &SignificantChange) -> Result<()> {
        let percent = change
            .change
            .percent
            .map_or_else(|| "n/a".to_string(), |p| format!("{p:+.1}%"));

        warn!(
            "Price change on {} {:?} (product {}): {} -> {} ({})",
            change.listing,
            change.axes,
            change.product,
            change.change.previous.price,
            change.change.current.price,
            percent
        );
        Ok(())
    }
}

/// Send every change to `sink`, returning how many were delivered.
pub async fn dispatch(sink: &dyn AlertSink, changes: &[SignificantChange]) -> usize {
    let mut delivered = 0;
    for change in changes {
        match sink.notify(change).await {
            Ok(()) => delivered += 1,
            Err(e) => error!("Failed to deliver alert for {}: {}", change.listing, e),
        }
    }
    delivered
}
