//! Cross-site product matching.
//!
//! Decides which [`CanonicalProduct`](crate::models::CanonicalProduct) a new
//! listing belongs to. Runs read-only against a catalog snapshot; the
//! membership change itself is applied by
//! [`Catalog::apply_decision`](crate::catalog::Catalog::apply_decision).
//!
//! The cascade, first confident answer wins:
//!
//! 1. manual pin of the listing key
//! 2. exact `(brand, title tokens)` match against an existing listing
//! 3. best similarity score at or above the threshold
//! 4. otherwise a new product
//!
//! Uncertain listings always fall through to a new product: a missed match
//! can be merged later, a wrong merge cannot be cleanly undone.

pub mod similarity;

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::catalog::Catalog;
use crate::config::MatchingConfig;
use crate::models::{ListingKey, ProductId};
use crate::normalizer::NormalizedRecord;

pub use similarity::{SimilarityScorer, TokenSimilarity};

/// Exact-match identity of a listing title
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub brand: Option<String>,
    pub tokens: BTreeSet<String>,
}

/// Listing-level view of one listing's scrape batch, as seen by the matcher
#[derive(Debug, Clone, PartialEq)]
pub struct ListingCandidate {
    pub key: ListingKey,
    pub url: String,
    pub title: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub title_tokens: BTreeSet<String>,
    pub skus: BTreeSet<String>,
}

impl ListingCandidate {
    /// Build the candidate from a listing's normalized records. The first
    /// record supplies the title; brand and category come from the first
    /// record that has one.
    pub fn from_records(records: &[NormalizedRecord]) -> Option<Self> {
        let first = records.first()?;
        Some(Self {
            key: first.listing.clone(),
            url: first.url.clone(),
            title: first.title.clone(),
            brand: records.iter().find_map(|r| r.brand.clone()),
            category: records.iter().find_map(|r| r.category.clone()),
            title_tokens: first.title_tokens.clone(),
            skus: records.iter().filter_map(|r| r.sku.clone()).collect(),
        })
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            brand: self.brand.clone(),
            tokens: self.title_tokens.clone(),
        }
    }
}

/// Outcome of the matching cascade
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchDecision {
    Pinned {
        product: ProductId,
    },
    Exact {
        product: ProductId,
    },
    Similar {
        product: ProductId,
        score: f64,
        /// Another product that also cleared the threshold
        runner_up: Option<(ProductId, f64)>,
        low_confidence: bool,
    },
    New,
}

impl MatchDecision {
    pub fn product(&self) -> Option<ProductId> {
        match self {
            Self::Pinned { product } | Self::Exact { product } | Self::Similar { product, .. } => {
                Some(*product)
            }
            Self::New => None,
        }
    }

    pub fn is_low_confidence(&self) -> bool {
        matches!(self, Self::Similar { low_confidence: true, .. })
    }
}

pub struct Matcher {
    config: MatchingConfig,
    scorer: Box<dyn SimilarityScorer>,
}

impl Matcher {
    pub fn new(config: MatchingConfig, scorer: Box<dyn SimilarityScorer>) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn match_listing(&self, catalog: &Catalog, candidate: &ListingCandidate) -> MatchDecision {
        if let Some(product) = catalog.pinned(&candidate.key) {
            debug!("{} pinned to {}", candidate.key, product);
            return MatchDecision::Pinned { product };
        }

        if let Some(product) = catalog.exact_owner(&candidate.match_key()) {
            debug!("{} exactly matches {}", candidate.key, product);
            return MatchDecision::Exact { product };
        }

        if candidate.title_tokens.is_empty() {
            return MatchDecision::New;
        }

        self.best_similar(catalog, candidate)
            .unwrap_or(MatchDecision::New)
    }

    fn best_similar(&self, catalog: &Catalog, candidate: &ListingCandidate) -> Option<MatchDecision> {
        // (score, revision, product), best first
        let mut accepted: Vec<(f64, u64, ProductId)> = catalog
            .live_products()
            // A product whose listings were all pinned away has nothing left to match
            .filter(|p| !p.members.is_empty())
            .filter(|p| compatible(candidate.category.as_ref(), p.category.as_ref()))
            .filter(|p| compatible(candidate.brand.as_ref(), p.brand.as_ref()))
            .filter_map(|p| {
                let score = self.scorer.score(&candidate.title_tokens, &p.title_tokens);
                (score >= self.config.threshold).then_some((score, p.revision, p.id))
            })
            .collect();

        accepted.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        let mut ranked = accepted.into_iter();
        let (score, _, product) = ranked.next()?;
        let runner_up = ranked.next().map(|(s, _, p)| (p, s));
        let low_confidence =
            runner_up.is_some() || score < self.config.threshold + self.config.ambiguity_margin;

        debug!(
            "{} similar to {} (score {:.3}, low confidence: {})",
            candidate.key, product, score, low_confidence
        );

        Some(MatchDecision::Similar {
            product,
            score,
            runner_up,
            low_confidence,
        })
    }
}

/// Unknown on either side is compatible; known values must agree.
fn compatible(a: Option<&String>, b: Option<&String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FixedScore(f64);

    impl SimilarityScorer for FixedScore {
        fn score(&self, _: &BTreeSet<String>, _: &BTreeSet<String>) -> f64 {
            self.0
        }
    }

    fn candidate(site: &str, id: &str, tokens: &[&str], brand: Option<&str>) -> ListingCandidate {
        ListingCandidate {
            key: ListingKey::new(site, id),
            url: format!("https://{site}.example/{id}"),
            title: tokens.join(" "),
            brand: brand.map(str::to_string),
            category: None,
            title_tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
            skus: BTreeSet::new(),
        }
    }

    fn matcher(scorer: impl SimilarityScorer + 'static) -> Matcher {
        Matcher::new(MatchingConfig::default(), Box::new(scorer))
    }

    fn add(catalog: &mut Catalog, matcher: &Matcher, c: &ListingCandidate) -> ProductId {
        let decision = matcher.match_listing(catalog, c);
        let listing = catalog.apply_decision(&decision, c, Utc::now()).unwrap();
        catalog.listing(&listing).unwrap().product
    }

    #[test]
    fn empty_catalog_creates_new() {
        let catalog = Catalog::new();
        let m = matcher(TokenSimilarity::default());
        let c = candidate("a", "1", &["widget"], None);
        assert_eq!(m.match_listing(&catalog, &c), MatchDecision::New);
    }

    #[test]
    fn exact_key_matches_across_sites() {
        let mut catalog = Catalog::new();
        let m = matcher(FixedScore(0.0));
        let first = add(&mut catalog, &m, &candidate("a", "1", &["widget", "pro"], Some("acme")));
        let decision = m.match_listing(&catalog, &candidate("b", "9", &["widget", "pro"], Some("acme")));
        assert_eq!(decision, MatchDecision::Exact { product: first });
    }

    #[test]
    fn score_at_threshold_is_accepted() {
        let mut catalog = Catalog::new();
        let m = matcher(FixedScore(0.85));
        let first = add(&mut catalog, &m, &candidate("a", "1", &["widget"], None));
        let decision = m.match_listing(&catalog, &candidate("b", "1", &["gadget"], None));
        assert_eq!(decision.product(), Some(first));
        assert!(decision.is_low_confidence());
    }

    #[test]
    fn score_below_threshold_creates_new() {
        let mut catalog = Catalog::new();
        let m = matcher(FixedScore(0.84));
        add(&mut catalog, &m, &candidate("a", "1", &["widget"], None));
        let decision = m.match_listing(&catalog, &candidate("b", "1", &["gadget"], None));
        assert_eq!(decision, MatchDecision::New);
    }

    #[test]
    fn known_brands_must_agree() {
        let mut catalog = Catalog::new();
        let m = matcher(FixedScore(1.0));
        add(&mut catalog, &m, &candidate("a", "1", &["widget"], Some("acme")));
        let decision = m.match_listing(&catalog, &candidate("b", "1", &["gadget"], Some("globex")));
        assert_eq!(decision, MatchDecision::New);
    }

    #[test]
    fn ties_go_to_most_recently_updated_product() {
        let mut catalog = Catalog::new();
        let exact_only = matcher(FixedScore(0.0));
        let older = add(&mut catalog, &exact_only, &candidate("a", "1", &["widget"], None));
        let newer = add(&mut catalog, &exact_only, &candidate("a", "2", &["gadget"], None));
        assert_ne!(older, newer);

        let m = matcher(FixedScore(0.95));
        let decision = m.match_listing(&catalog, &candidate("b", "1", &["gizmo"], None));
        match decision {
            MatchDecision::Similar {
                product,
                runner_up,
                low_confidence,
                ..
            } => {
                assert_eq!(product, newer);
                assert_eq!(runner_up.map(|(p, _)| p), Some(older));
                assert!(low_confidence);
            }
            other => panic!("expected similar match, got {other:?}"),
        }
    }

    #[test]
    fn pin_short_circuits_exact_match() {
        let mut catalog = Catalog::new();
        let m = matcher(FixedScore(0.0));
        let widget = add(&mut catalog, &m, &candidate("a", "1", &["widget"], None));
        let gadget = add(&mut catalog, &m, &candidate("a", "2", &["gadget"], None));
        assert_ne!(widget, gadget);

        let c = candidate("b", "1", &["widget"], None);
        catalog.pin(c.key.clone(), gadget).unwrap();
        assert_eq!(
            m.match_listing(&catalog, &c),
            MatchDecision::Pinned { product: gadget }
        );
    }

    #[test]
    fn products_emptied_by_reassignment_are_not_candidates() {
        let mut catalog = Catalog::new();
        let exact_only = matcher(FixedScore(0.0));
        let emptied = add(&mut catalog, &exact_only, &candidate("a", "1", &["widget"], None));
        let kept = add(&mut catalog, &exact_only, &candidate("a", "2", &["gadget"], None));

        let moved = ListingKey::new("a", "1").id();
        catalog.reassign_listing(&moved, kept, Utc::now()).unwrap();
        assert!(catalog.product(emptied).unwrap().members.is_empty());

        let m = matcher(FixedScore(0.95));
        let decision = m.match_listing(&catalog, &candidate("b", "1", &["gizmo"], None));
        assert_eq!(
            decision,
            MatchDecision::Similar {
                product: kept,
                score: 0.95,
                runner_up: None,
                low_confidence: false,
            }
        );
    }
}
