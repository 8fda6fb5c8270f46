//! Variant resolution for one listing's scrape batch.
//!
//! Records are grouped by their canonical axis mapping; each mapping is one
//! variant. Priced records become ledger observations, unpriced ones still
//! register the variant as enumerated but unavailable. A batch whose axis-name
//! set was never seen on the listing opens a new schema generation; variants
//! of older generations are kept as they are.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{CatalogError, LedgerError};
use crate::ledger::{AppendOutcome, PriceLedger};
use crate::models::{ListingId, PriceObservation, VariantAxes, VariantId};
use crate::normalizer::NormalizedRecord;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Counts and new observations from resolving one or more listing batches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveOutcome {
    pub variants_created: usize,
    pub variants_updated: usize,
    /// Variants seen without any price in the batch
    pub enumerated_only: usize,
    pub observations_appended: usize,
    /// Replayed or out-of-order observations the ledger ignored
    pub observations_skipped: usize,
    pub new_generations: usize,
    pub appended: Vec<PriceObservation>,
    /// Variants that received at least one new observation
    pub touched: BTreeSet<VariantId>,
}

impl AddAssign for ResolveOutcome {
    fn add_assign(&mut self, other: Self) {
        self.variants_created += other.variants_created;
        self.variants_updated += other.variants_updated;
        self.enumerated_only += other.enumerated_only;
        self.observations_appended += other.observations_appended;
        self.observations_skipped += other.observations_skipped;
        self.new_generations += other.new_generations;
        self.appended.extend(other.appended);
        self.touched.extend(other.touched);
    }
}

/// Resolve a complete scrape batch of one listing into variants and price
/// observations. `records` must all belong to `listing`.
pub fn resolve_listing(
    catalog: &mut Catalog,
    ledger: &mut PriceLedger,
    listing: &ListingId,
    records: &[NormalizedRecord],
) -> Result<ResolveOutcome, ResolveError> {
    if catalog.listing(listing).is_none() {
        return Err(CatalogError::UnknownListing(listing.clone()).into());
    }

    let mut groups: BTreeMap<&VariantAxes, Vec<&NormalizedRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(&record.axes).or_default().push(record);
    }

    let mut outcome = ResolveOutcome::default();

    for (axes, mut group) in groups {
        group.sort_by_key(|r| r.observed_at);

        let axis_names: BTreeSet<String> = axes.keys().cloned().collect();
        let (generation, new_generation) = catalog.schema_generation(listing, &axis_names)?;
        if new_generation {
            outcome.new_generations += 1;
        }

        let priced: Vec<&NormalizedRecord> =
            group.iter().copied().filter(|r| r.price.is_some()).collect();
        let available = priced.last().is_some_and(|r| r.available);
        let sku = group.iter().find_map(|r| r.sku.as_deref());

        let (variant, created) = catalog.upsert_variant(listing, axes, sku, generation, available)?;
        ledger.register(&variant);

        if created {
            outcome.variants_created += 1;
        }
        if priced.is_empty() {
            debug!("Variant {} {:?} enumerated without a price", variant, axes);
            outcome.enumerated_only += 1;
            continue;
        }

        let mut appended_any = false;
        for record in priced {
            let Some(price) = record.price.clone() else {
                continue;
            };
            let observation = PriceObservation {
                variant: variant.clone(),
                price,
                available: record.available,
                observed_at: record.observed_at,
            };
            match ledger.append(observation.clone())? {
                AppendOutcome::Appended => {
                    outcome.observations_appended += 1;
                    outcome.appended.push(observation);
                    appended_any = true;
                }
                AppendOutcome::Duplicate | AppendOutcome::Stale => {
                    outcome.observations_skipped += 1;
                }
            }
        }

        if appended_any {
            outcome.touched.insert(variant);
            if !created {
                outcome.variants_updated += 1;
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{ListingCandidate, MatchDecision};
    use crate::models::{ListingKey, Money};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn record(axes: &[(&str, &str)], price: Option<i64>, hour: u32) -> NormalizedRecord {
        NormalizedRecord {
            listing: ListingKey::new("a", "shirt"),
            url: "https://a.example/shirt".to_string(),
            title: "shirt".to_string(),
            title_tokens: BTreeSet::from(["shirt".to_string()]),
            stripped_tokens: BTreeSet::new(),
            brand: None,
            category: None,
            axes: axes
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            sku: None,
            price: price.map(|minor| Money {
                minor,
                currency: "USD".to_string(),
            }),
            available: true,
            observed_at: at(hour),
        }
    }

    fn setup(records: &[NormalizedRecord]) -> (Catalog, PriceLedger, ListingId) {
        let mut catalog = Catalog::new();
        let candidate = ListingCandidate::from_records(records).unwrap();
        let listing = catalog
            .apply_decision(&MatchDecision::New, &candidate, Utc::now())
            .unwrap();
        (catalog, PriceLedger::new(10.0), listing)
    }

    #[test]
    fn one_variant_per_distinct_mapping() {
        let batch = vec![
            record(&[("color", "red")], Some(1000), 1),
            record(&[("color", "blue")], Some(1100), 1),
            record(&[("color", "red")], Some(900), 2),
        ];
        let (mut catalog, mut ledger, listing) = setup(&batch);

        let outcome = resolve_listing(&mut catalog, &mut ledger, &listing, &batch).unwrap();
        assert_eq!(outcome.variants_created, 2);
        assert_eq!(outcome.observations_appended, 3);
        assert_eq!(outcome.new_generations, 1);

        let red = VariantId::derive(&listing, &batch[0].axes);
        assert_eq!(ledger.len(&red), 2);
        assert_eq!(ledger.latest(&red).unwrap().price.minor, 900);
    }

    #[test]
    fn axis_less_records_share_default_variant() {
        let batch = vec![record(&[], Some(500), 1), record(&[], Some(450), 2)];
        let (mut catalog, mut ledger, listing) = setup(&batch);

        let outcome = resolve_listing(&mut catalog, &mut ledger, &listing, &batch).unwrap();
        assert_eq!(outcome.variants_created, 1);
        let variant = catalog.variants_of(&listing).next().unwrap();
        assert!(variant.axes.is_empty());
        assert_eq!(ledger.len(&variant.id), 2);
    }

    #[test]
    fn unpriced_mapping_is_enumerated_but_unavailable() {
        let batch = vec![
            record(&[("size", "s")], Some(2000), 1),
            record(&[("size", "xl")], None, 1),
        ];
        let (mut catalog, mut ledger, listing) = setup(&batch);

        let outcome = resolve_listing(&mut catalog, &mut ledger, &listing, &batch).unwrap();
        assert_eq!(outcome.variants_created, 2);
        assert_eq!(outcome.enumerated_only, 1);

        let xl = VariantId::derive(&listing, &batch[1].axes);
        assert!(!catalog.variant(&xl).unwrap().available);
        assert_eq!(ledger.latest(&xl), Err(LedgerError::NoData(xl.clone())));
    }

    #[test]
    fn replaying_a_batch_adds_nothing() {
        let batch = vec![
            record(&[("color", "red")], Some(1000), 1),
            record(&[("color", "red")], Some(1200), 2),
        ];
        let (mut catalog, mut ledger, listing) = setup(&batch);

        resolve_listing(&mut catalog, &mut ledger, &listing, &batch).unwrap();
        let replay = resolve_listing(&mut catalog, &mut ledger, &listing, &batch).unwrap();

        assert_eq!(replay.variants_created, 0);
        assert_eq!(replay.observations_appended, 0);
        assert_eq!(replay.observations_skipped, 2);
        assert!(replay.touched.is_empty());
        assert_eq!(catalog.variants().count(), 1);
    }

    #[test]
    fn new_axis_set_opens_generation_and_keeps_old_variants() {
        let first = vec![record(&[("color", "red")], Some(1000), 1)];
        let (mut catalog, mut ledger, listing) = setup(&first);
        resolve_listing(&mut catalog, &mut ledger, &listing, &first).unwrap();
        let old = VariantId::derive(&listing, &first[0].axes);

        let second = vec![
            record(&[("color", "red"), ("size", "m")], Some(1100), 2),
            record(&[("color", "red"), ("size", "l")], Some(1150), 2),
        ];
        let outcome = resolve_listing(&mut catalog, &mut ledger, &listing, &second).unwrap();

        assert_eq!(outcome.new_generations, 1);
        assert_eq!(outcome.variants_created, 2);
        assert_eq!(catalog.variants_of(&listing).count(), 3);
        assert_eq!(catalog.variant(&old).unwrap().generation, 0);
        assert_eq!(ledger.len(&old), 1);
        assert!(catalog.variants_of(&listing).filter(|v| v.id != old).all(|v| v.generation == 1));
    }

    #[test]
    fn unknown_listing_is_an_error() {
        let mut catalog = Catalog::new();
        let mut ledger = PriceLedger::new(10.0);
        let listing = ListingKey::new("x", "y").id();
        let err = resolve_listing(&mut catalog, &mut ledger, &listing, &[]).unwrap_err();
        assert!(matches!(err, ResolveError::Catalog(CatalogError::UnknownListing(_))));
    }
}
