use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, MergeOutcome};
use crate::config::TrackerConfig;
use crate::error::CatalogError;
use crate::ledger::{PriceChange, PriceLedger};
use crate::matcher::{ListingCandidate, MatchDecision, Matcher, SimilarityScorer, TokenSimilarity};
use crate::models::{ListingId, ListingKey, PriceObservation, ProductId, RawObservation, VariantAxes};
use crate::normalizer::{NormalizedRecord, Normalizer, Rejected};
use crate::resolver::{self, ResolveOutcome};

/// A match accepted below the confidence margin, kept for human review
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LowConfidenceMatch {
    pub listing: ListingKey,
    pub product: ProductId,
    pub score: f64,
    pub runner_up: Option<(ProductId, f64)>,
}

/// Price move beyond the configured threshold, for the alerting collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignificantChange {
    pub product: ProductId,
    pub listing: ListingKey,
    pub axes: VariantAxes,
    pub change: PriceChange,
}

/// Audit summary of one ingestion call
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub normalized: usize,
    pub rejected: usize,
    pub new_products: usize,
    pub matched: usize,
    pub merges: usize,
    /// Listings already known before this batch
    pub listings_refreshed: usize,
    pub rejected_records: Vec<Rejected>,
    pub low_confidence: Vec<LowConfidenceMatch>,
    pub significant_changes: Vec<SignificantChange>,
    /// Listings whose records could not be ingested, with the reason
    pub failed: Vec<(ListingKey, String)>,
    pub resolve: ResolveOutcome,
}

impl IngestReport {
    /// Observations appended to the ledger by this batch
    pub fn new_observations(&self) -> &[PriceObservation] {
        &self.resolve.appended
    }

    pub fn summary(&self) -> String {
        format!(
            "normalized {}, rejected {}, new products {}, matched {}, merges {}, \
             refreshed listings {}, new variants {}, observations {}, significant changes {}, \
             failed listings {}",
            self.normalized,
            self.rejected,
            self.new_products,
            self.matched,
            self.merges,
            self.listings_refreshed,
            self.resolve.variants_created,
            self.resolve.observations_appended,
            self.significant_changes.len(),
            self.failed.len()
        )
    }
}

/// The matching and pricing pipeline over one catalog and ledger.
///
/// Every mutating call takes `&mut self`; callers sharing a tracker across
/// tasks wrap it in a mutex, which serialises catalog membership changes.
pub struct PriceTracker {
    normalizer: Normalizer,
    matcher: Matcher,
    catalog: Catalog,
    ledger: PriceLedger,
}

impl PriceTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self::with_scorer(config, Box::new(TokenSimilarity::default()))
    }

    pub fn with_scorer(config: &TrackerConfig, scorer: Box<dyn SimilarityScorer>) -> Self {
        Self::from_parts(
            config,
            scorer,
            Catalog::new(),
            PriceLedger::new(config.ledger.change_threshold_pct),
        )
    }

    /// Resume from a restored catalog and ledger.
    pub fn from_parts(
        config: &TrackerConfig,
        scorer: Box<dyn SimilarityScorer>,
        catalog: Catalog,
        ledger: PriceLedger,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(&config.normalizer),
            matcher: Matcher::new(config.matching.clone(), scorer),
            catalog,
            ledger,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &PriceLedger {
        &self.ledger
    }

    /// Ingest a batch of observations, possibly spanning several listings.
    ///
    /// Observations are grouped per listing and each listing's group is
    /// resolved as a whole. Rejected records and uncertain matches are
    /// reported, never fatal.
    pub fn ingest(&mut self, observations: &[RawObservation]) -> IngestReport {
        self.ingest_at(observations, Utc::now())
    }

    pub fn ingest_at(&mut self, observations: &[RawObservation], now: DateTime<Utc>) -> IngestReport {
        let (records, rejected_records) = self.normalizer.normalize_batch(observations);

        let mut report = IngestReport {
            normalized: records.len(),
            rejected: rejected_records.len(),
            rejected_records,
            ..IngestReport::default()
        };

        for (key, group) in group_by_listing(records) {
            if let Err(e) = self.ingest_listing(&key, &group, now, &mut report) {
                // Only reachable on an internal inconsistency; keep the rest of the batch going
                warn!("Failed to ingest listing {}: {}", key, e);
                report.failed.push((key, e.to_string()));
            }
        }

        info!("Ingested batch: {}", report.summary());
        report
    }

    fn ingest_listing(
        &mut self,
        key: &ListingKey,
        records: &[NormalizedRecord],
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> anyhow::Result<()> {
        let Some(candidate) = ListingCandidate::from_records(records) else {
            return Ok(());
        };

        let known = self
            .catalog
            .listing_by_key(key)
            .map(|l| (l.id.clone(), l.product));

        let listing = match known {
            Some((id, owner)) => {
                report.listings_refreshed += 1;
                if let Some(pinned) = self.catalog.pinned(key)
                    && pinned != owner
                {
                    self.catalog.reassign_listing(&id, pinned, now)?;
                }
                id
            }
            None => {
                let decision = self.matcher.match_listing(&self.catalog, &candidate);
                let listing = self.catalog.apply_decision(&decision, &candidate, now)?;
                match &decision {
                    MatchDecision::New => report.new_products += 1,
                    _ => report.matched += 1,
                }
                if let MatchDecision::Similar {
                    product,
                    score,
                    runner_up,
                    low_confidence: true,
                } = &decision
                {
                    warn!(
                        "Low-confidence match of {} to {} (score {:.3})",
                        key, product, score
                    );
                    report.low_confidence.push(LowConfidenceMatch {
                        listing: key.clone(),
                        product: *product,
                        score: *score,
                        runner_up: *runner_up,
                    });
                }
                listing
            }
        };

        let outcome = resolver::resolve_listing(&mut self.catalog, &mut self.ledger, &listing, records)?;

        if self.matcher.config().merge_on_shared_sku {
            report.merges += self.merge_on_shared_skus(&candidate.skus, &listing, now)?;
        }

        for variant in &outcome.touched {
            let Ok(change) = self.ledger.detect_change(variant) else {
                continue;
            };
            if !change.significant {
                continue;
            }
            let Some(v) = self.catalog.variant(variant) else {
                continue;
            };
            let product = self.owner_of(&listing)?;
            report.significant_changes.push(SignificantChange {
                product,
                listing: key.clone(),
                axes: v.axes.clone(),
                change,
            });
        }

        report.resolve += outcome;
        Ok(())
    }

    /// Merge products that share a SKU with this listing, provided their
    /// brands do not conflict. The more recently updated product survives.
    fn merge_on_shared_skus(
        &mut self,
        skus: &BTreeSet<String>,
        listing: &ListingId,
        now: DateTime<Utc>,
    ) -> Result<usize, CatalogError> {
        let mut merges = 0;

        for sku in skus {
            let others = self.catalog.products_with_sku(sku, self.owner_of(listing)?);

            for other in others {
                // Earlier merges in this loop may have moved either side
                let owner = self.owner_of(listing)?;
                let Some(other) = self.catalog.resolve(other).filter(|p| *p != owner) else {
                    continue;
                };
                let (Some(a), Some(b)) = (self.catalog.product(owner), self.catalog.product(other))
                else {
                    continue;
                };
                if let (Some(x), Some(y)) = (&a.brand, &b.brand)
                    && x != y
                {
                    continue;
                }
                let (survivor, absorbed) = if a.revision >= b.revision {
                    (owner, other)
                } else {
                    (other, owner)
                };
                info!("Shared SKU {} links {} and {}", sku, owner, other);
                self.catalog.merge(survivor, absorbed, now)?;
                merges += 1;
            }
        }

        Ok(merges)
    }

    fn owner_of(&self, listing: &ListingId) -> Result<ProductId, CatalogError> {
        self.catalog
            .listing(listing)
            .map(|l| l.product)
            .ok_or_else(|| CatalogError::UnknownListing(listing.clone()))
    }

    /// Manual override: route a listing key to a product. Applies to the
    /// listing immediately if it is already known.
    pub fn pin_listing(&mut self, key: ListingKey, product: ProductId) -> Result<(), CatalogError> {
        self.catalog.pin(key.clone(), product)?;
        if let Some(listing) = self.catalog.listing_by_key(&key).map(|l| l.id.clone()) {
            self.catalog.reassign_listing(&listing, product, Utc::now())?;
        }
        Ok(())
    }

    /// Manual override: two products are the same.
    pub fn merge_products(
        &mut self,
        survivor: ProductId,
        absorbed: ProductId,
    ) -> Result<MergeOutcome, CatalogError> {
        self.catalog.merge(survivor, absorbed, Utc::now())
    }
}

/// Group records by listing, keeping first-seen listing order.
fn group_by_listing(records: Vec<NormalizedRecord>) -> Vec<(ListingKey, Vec<NormalizedRecord>)> {
    let mut index: HashMap<ListingKey, usize> = HashMap::new();
    let mut groups: Vec<(ListingKey, Vec<NormalizedRecord>)> = Vec::new();

    for record in records {
        let slot = *index.entry(record.listing.clone()).or_insert_with(|| {
            groups.push((record.listing.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    groups
}
