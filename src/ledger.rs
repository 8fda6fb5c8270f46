//! Append-only price history per variant.
//!
//! Observations are kept in append order, which is also timestamp order: an
//! observation older than the latest one for its variant is skipped rather
//! than inserted out of place. Nothing is ever rewritten or removed.

use std::collections::HashMap;
use std::ops::{Bound, RangeBounds};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::LedgerError;
use crate::models::{PriceObservation, VariantId};

/// What `append` did with an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Identical to the latest entry (a replayed scrape)
    Duplicate,
    /// Older than the latest entry
    Stale,
}

/// Comparison of the two most recent observations of a variant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub variant: VariantId,
    pub previous: PriceObservation,
    pub current: PriceObservation,
    /// `current - previous` in minor units
    pub delta_minor: i64,
    /// Signed percentage change; `None` when the previous price was zero
    pub percent: Option<f64>,
    pub significant: bool,
}

#[derive(Debug, Clone)]
pub struct PriceLedger {
    entries: HashMap<VariantId, Vec<PriceObservation>>,
    change_threshold_pct: f64,
}

impl PriceLedger {
    pub fn new(change_threshold_pct: f64) -> Self {
        Self {
            entries: HashMap::new(),
            change_threshold_pct,
        }
    }

    /// Make a variant known to the ledger. Idempotent.
    pub fn register(&mut self, variant: &VariantId) {
        self.entries.entry(variant.clone()).or_default();
    }

    pub fn is_registered(&self, variant: &VariantId) -> bool {
        self.entries.contains_key(variant)
    }

    pub fn append(&mut self, observation: PriceObservation) -> Result<AppendOutcome, LedgerError> {
        let history = self
            .entries
            .get_mut(&observation.variant)
            .ok_or_else(|| LedgerError::UnknownVariant(observation.variant.clone()))?;

        // Several rows may share the latest timestamp; any of them can be replayed
        let replayed = history
            .iter()
            .rev()
            .take_while(|entry| entry.observed_at == observation.observed_at)
            .any(|entry| *entry == observation);
        if replayed {
            return Ok(AppendOutcome::Duplicate);
        }

        if let Some(latest) = history.last()
            && observation.observed_at < latest.observed_at
        {
            debug!(
                "Skipping stale observation for {} ({} < {})",
                observation.variant, observation.observed_at, latest.observed_at
            );
            return Ok(AppendOutcome::Stale);
        }

        history.push(observation);
        Ok(AppendOutcome::Appended)
    }

    pub fn latest(&self, variant: &VariantId) -> Result<&PriceObservation, LedgerError> {
        self.observations(variant)?
            .last()
            .ok_or_else(|| LedgerError::NoData(variant.clone()))
    }

    /// Observations of `variant` whose timestamp falls in `range`, oldest first.
    pub fn history<R>(&self, variant: &VariantId, range: R) -> Result<History<'_>, LedgerError>
    where
        R: RangeBounds<DateTime<Utc>>,
    {
        let all = self.observations(variant)?;

        let start = match range.start_bound() {
            Bound::Included(t) => all.partition_point(|o| o.observed_at < *t),
            Bound::Excluded(t) => all.partition_point(|o| o.observed_at <= *t),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(t) => all.partition_point(|o| o.observed_at <= *t),
            Bound::Excluded(t) => all.partition_point(|o| o.observed_at < *t),
            Bound::Unbounded => all.len(),
        };

        Ok(History {
            entries: &all[start..end.max(start)],
            pos: 0,
        })
    }

    pub fn detect_change(&self, variant: &VariantId) -> Result<PriceChange, LedgerError> {
        let all = self.observations(variant)?;
        let [.., previous, current] = all else {
            return Err(LedgerError::NoData(variant.clone()));
        };

        if previous.price.currency != current.price.currency {
            return Err(LedgerError::CurrencyMismatch {
                variant: variant.clone(),
                previous: previous.price.currency.clone(),
                current: current.price.currency.clone(),
            });
        }

        let delta_minor = current.price.minor - previous.price.minor;
        let percent = (previous.price.minor != 0)
            .then(|| delta_minor as f64 * 100.0 / previous.price.minor as f64);
        let significant = percent.map_or(delta_minor != 0, |p| p.abs() > self.change_threshold_pct);

        Ok(PriceChange {
            variant: variant.clone(),
            previous: previous.clone(),
            current: current.clone(),
            delta_minor,
            percent,
            significant,
        })
    }

    pub fn len(&self, variant: &VariantId) -> usize {
        self.entries.get(variant).map_or(0, Vec::len)
    }

    pub fn total_observations(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn observations(&self, variant: &VariantId) -> Result<&[PriceObservation], LedgerError> {
        self.entries
            .get(variant)
            .map(Vec::as_slice)
            .ok_or_else(|| LedgerError::UnknownVariant(variant.clone()))
    }
}

/// Lazy, restartable view over a slice of a variant's history
#[derive(Debug, Clone)]
pub struct History<'a> {
    entries: &'a [PriceObservation],
    pos: usize,
}

impl History<'_> {
    /// Start iterating from the first entry again.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl<'a> Iterator for History<'a> {
    type Item = &'a PriceObservation;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.entries.get(self.pos)?;
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for History<'_> {}
