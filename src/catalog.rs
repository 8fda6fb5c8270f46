//! The catalog of canonical products, listings and variants.
//!
//! A `Catalog` is plain owned state handed to the matcher and resolver
//! explicitly, so every test can start from a fresh one. Products form a
//! disjoint-set forest over listings: a merge moves the absorbed product's
//! listings to the survivor and leaves the absorbed product behind as a
//! tombstone pointing at it, so external references by id keep resolving.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::CatalogError;
use crate::matcher::{ListingCandidate, MatchDecision, MatchKey};
use crate::models::{
    CanonicalProduct, Listing, ListingId, ListingKey, ProductId, Variant, VariantAxes, VariantId,
};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    products: BTreeMap<ProductId, CanonicalProduct>,
    listings: BTreeMap<ListingId, Listing>,
    variants: BTreeMap<VariantId, Variant>,
    listing_keys: HashMap<ListingKey, ListingId>,
    /// First listing seen with each exact-match key
    exact_index: HashMap<MatchKey, ListingId>,
    sku_index: HashMap<String, BTreeSet<VariantId>>,
    pins: HashMap<ListingKey, ProductId>,
    next_product: u64,
    clock: u64,
}

/// Result of merging two products
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub survivor: ProductId,
    pub absorbed: ProductId,
    pub listings_moved: usize,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a catalog from persisted rows.
    pub fn restore(
        products: Vec<CanonicalProduct>,
        listings: Vec<Listing>,
        variants: Vec<Variant>,
        pins: Vec<(ListingKey, ProductId)>,
    ) -> Self {
        let mut catalog = Self::new();

        for product in products {
            catalog.next_product = catalog.next_product.max(product.id.0 + 1);
            catalog.clock = catalog.clock.max(product.revision);
            catalog.products.insert(product.id, product);
        }

        for listing in listings {
            catalog.listing_keys.insert(listing.key.clone(), listing.id.clone());
            let key = MatchKey {
                brand: listing.brand.clone(),
                tokens: listing.title_tokens.clone(),
            };
            catalog.exact_index.entry(key).or_insert_with(|| listing.id.clone());
            if let Some(product) = catalog.products.get_mut(&listing.product) {
                product.members.insert(listing.id.clone());
            }
            catalog.listings.insert(listing.id.clone(), listing);
        }

        for variant in variants {
            if let Some(sku) = &variant.sku {
                catalog
                    .sku_index
                    .entry(sku.clone())
                    .or_default()
                    .insert(variant.id.clone());
            }
            if let Some(listing) = catalog.listings.get_mut(&variant.listing) {
                listing.variants.insert(variant.id.clone());
            }
            catalog.variants.insert(variant.id.clone(), variant);
        }

        catalog.pins.extend(pins);
        catalog
    }

    pub fn product(&self, id: ProductId) -> Option<&CanonicalProduct> {
        self.products.get(&id)
    }

    /// Follow tombstones to the live product currently standing for `id`.
    pub fn resolve(&self, id: ProductId) -> Option<ProductId> {
        let mut current = self.products.get(&id)?;
        while let Some(next) = current.merged_into {
            current = self.products.get(&next)?;
        }
        Some(current.id)
    }

    pub fn products(&self) -> impl Iterator<Item = &CanonicalProduct> {
        self.products.values()
    }

    pub fn live_products(&self) -> impl Iterator<Item = &CanonicalProduct> {
        self.products.values().filter(|p| !p.is_tombstoned())
    }

    pub fn listing(&self, id: &ListingId) -> Option<&Listing> {
        self.listings.get(id)
    }

    pub fn listing_by_key(&self, key: &ListingKey) -> Option<&Listing> {
        self.listing_keys.get(key).and_then(|id| self.listings.get(id))
    }

    pub fn listings(&self) -> impl Iterator<Item = &Listing> {
        self.listings.values()
    }

    pub fn variant(&self, id: &VariantId) -> Option<&Variant> {
        self.variants.get(id)
    }

    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values()
    }

    pub fn variants_of<'a>(&'a self, listing: &ListingId) -> impl Iterator<Item = &'a Variant> + 'a {
        self.listings
            .get(listing)
            .into_iter()
            .flat_map(|l| l.variants.iter())
            .filter_map(|id| self.variants.get(id))
    }

    pub fn pins(&self) -> impl Iterator<Item = (&ListingKey, &ProductId)> {
        self.pins.iter()
    }

    /// Owner of the listing that first carried this exact key.
    pub fn exact_owner(&self, key: &MatchKey) -> Option<ProductId> {
        let listing = self.exact_index.get(key)?;
        self.listings.get(listing).map(|l| l.product)
    }

    /// Pinned product for a listing key, resolved through merges.
    pub fn pinned(&self, key: &ListingKey) -> Option<ProductId> {
        self.pins.get(key).and_then(|id| self.resolve(*id))
    }

    /// Live products other than `exclude` owning a variant with this SKU.
    pub fn products_with_sku(&self, sku: &str, exclude: ProductId) -> BTreeSet<ProductId> {
        self.sku_index
            .get(sku)
            .into_iter()
            .flatten()
            .filter_map(|v| self.variants.get(v))
            .filter_map(|v| self.listings.get(&v.listing))
            .filter_map(|l| self.resolve(l.product))
            .filter(|p| *p != exclude)
            .collect()
    }

    /// Record a manual match override for a listing key.
    pub fn pin(&mut self, key: ListingKey, product: ProductId) -> Result<(), CatalogError> {
        let live = self
            .resolve(product)
            .ok_or(CatalogError::UnknownProduct(product))?;
        info!("Pinned {} to {}", key, live);
        self.pins.insert(key, live);
        Ok(())
    }

    /// Apply a matcher decision, creating the product if needed, and attach
    /// the candidate as a new listing. Returns the listing id.
    pub fn apply_decision(
        &mut self,
        decision: &MatchDecision,
        candidate: &ListingCandidate,
        at: DateTime<Utc>,
    ) -> Result<ListingId, CatalogError> {
        let product = match decision.product() {
            Some(id) => self.resolve(id).ok_or(CatalogError::UnknownProduct(id))?,
            None => self.create_product(candidate, at),
        };

        let listing_id = candidate.key.id();
        let listing = Listing {
            id: listing_id.clone(),
            key: candidate.key.clone(),
            url: candidate.url.clone(),
            product,
            brand: candidate.brand.clone(),
            category: candidate.category.clone(),
            title_tokens: candidate.title_tokens.clone(),
            schema_generations: Vec::new(),
            variants: BTreeSet::new(),
        };

        self.listing_keys.insert(candidate.key.clone(), listing_id.clone());
        self.exact_index
            .entry(candidate.match_key())
            .or_insert_with(|| listing_id.clone());
        self.listings.insert(listing_id.clone(), listing);
        self.add_member(product, &listing_id, candidate, at);

        Ok(listing_id)
    }

    /// Move an existing listing to another product.
    pub fn reassign_listing(
        &mut self,
        listing: &ListingId,
        product: ProductId,
        at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let target = self
            .resolve(product)
            .ok_or(CatalogError::UnknownProduct(product))?;
        let entry = self
            .listings
            .get_mut(listing)
            .ok_or_else(|| CatalogError::UnknownListing(listing.clone()))?;
        let previous = std::mem::replace(&mut entry.product, target);
        if previous == target {
            return Ok(());
        }

        let revision = self.tick();
        if let Some(old) = self.products.get_mut(&previous) {
            old.members.remove(listing);
            old.revision = revision;
            old.updated_at = at;
        }
        if let Some(new) = self.products.get_mut(&target) {
            new.members.insert(listing.clone());
            new.revision = revision;
            new.updated_at = at;
        }
        info!("Reassigned listing {} from {} to {}", listing, previous, target);
        Ok(())
    }

    /// Merge `absorbed` into `survivor`. Every listing moves to the survivor
    /// and `absorbed` becomes a tombstone; nothing is deleted.
    pub fn merge(
        &mut self,
        survivor: ProductId,
        absorbed: ProductId,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome, CatalogError> {
        let survivor = self.live(survivor)?;
        let absorbed = self.live(absorbed)?;
        if survivor == absorbed {
            return Err(CatalogError::SelfMerge(survivor));
        }

        let revision = self.tick();
        let (moved, brand, category) = {
            let gone = self
                .products
                .get_mut(&absorbed)
                .ok_or(CatalogError::UnknownProduct(absorbed))?;
            gone.merged_into = Some(survivor);
            gone.revision = revision;
            gone.updated_at = at;
            (
                std::mem::take(&mut gone.members),
                gone.brand.clone(),
                gone.category.clone(),
            )
        };

        for listing in &moved {
            if let Some(l) = self.listings.get_mut(listing) {
                l.product = survivor;
            }
        }

        // Keep tombstone chains one hop long
        for product in self.products.values_mut() {
            if product.merged_into == Some(absorbed) {
                product.merged_into = Some(survivor);
            }
        }

        let keeper = self
            .products
            .get_mut(&survivor)
            .ok_or(CatalogError::UnknownProduct(survivor))?;
        let listings_moved = moved.len();
        keeper.members.extend(moved);
        keeper.brand = keeper.brand.take().or(brand);
        keeper.category = keeper.category.take().or(category);
        keeper.revision = revision;
        keeper.updated_at = at;

        info!(
            "Merged product {} into {} ({} listings moved)",
            absorbed, survivor, listings_moved
        );

        Ok(MergeOutcome {
            survivor,
            absorbed,
            listings_moved,
        })
    }

    /// Schema generation index for an axis-name set on a listing, opening a
    /// new generation when the set has not been seen. Returns `(index, new)`.
    pub fn schema_generation(
        &mut self,
        listing: &ListingId,
        axis_names: &BTreeSet<String>,
    ) -> Result<(u32, bool), CatalogError> {
        let entry = self
            .listings
            .get_mut(listing)
            .ok_or_else(|| CatalogError::UnknownListing(listing.clone()))?;

        if let Some(idx) = entry.schema_generations.iter().position(|g| g == axis_names) {
            return Ok((idx as u32, false));
        }

        entry.schema_generations.push(axis_names.clone());
        let idx = entry.schema_generations.len() - 1;
        if idx > 0 {
            info!(
                "Listing {} opened variant schema generation {} with axes {:?}",
                entry.key, idx, axis_names
            );
        }
        Ok((idx as u32, true))
    }

    /// Insert the variant if new, otherwise refresh its availability and SKU.
    /// Returns `(id, created)`.
    pub fn upsert_variant(
        &mut self,
        listing: &ListingId,
        axes: &VariantAxes,
        sku: Option<&str>,
        generation: u32,
        available: bool,
    ) -> Result<(VariantId, bool), CatalogError> {
        let entry = self
            .listings
            .get_mut(listing)
            .ok_or_else(|| CatalogError::UnknownListing(listing.clone()))?;
        let id = VariantId::derive(listing, axes);

        let created = !self.variants.contains_key(&id);
        let variant = self.variants.entry(id.clone()).or_insert_with(|| Variant {
            id: id.clone(),
            listing: listing.clone(),
            axes: axes.clone(),
            sku: None,
            generation,
            available,
        });
        variant.available = available;
        if variant.sku.is_none()
            && let Some(sku) = sku
        {
            variant.sku = Some(sku.to_string());
            self.sku_index
                .entry(sku.to_string())
                .or_default()
                .insert(id.clone());
        }
        entry.variants.insert(id.clone());

        if created {
            debug!("New variant {} {:?} on listing {}", id, axes, listing);
        }
        Ok((id, created))
    }

    fn live(&self, id: ProductId) -> Result<ProductId, CatalogError> {
        let product = self
            .products
            .get(&id)
            .ok_or(CatalogError::UnknownProduct(id))?;
        match product.merged_into {
            Some(into) => Err(CatalogError::Tombstoned(id, into)),
            None => Ok(id),
        }
    }

    fn create_product(&mut self, candidate: &ListingCandidate, at: DateTime<Utc>) -> ProductId {
        let id = ProductId(self.next_product);
        self.next_product += 1;
        let revision = self.tick();

        self.products.insert(
            id,
            CanonicalProduct {
                id,
                name: candidate.title.clone(),
                brand: candidate.brand.clone(),
                category: candidate.category.clone(),
                title_tokens: candidate.title_tokens.clone(),
                members: BTreeSet::new(),
                merged_into: None,
                revision,
                updated_at: at,
            },
        );
        info!("Created canonical product {} \"{}\"", id, candidate.title);
        id
    }

    fn add_member(
        &mut self,
        product: ProductId,
        listing: &ListingId,
        candidate: &ListingCandidate,
        at: DateTime<Utc>,
    ) {
        let revision = self.tick();
        if let Some(p) = self.products.get_mut(&product) {
            p.members.insert(listing.clone());
            if p.brand.is_none() {
                p.brand = candidate.brand.clone();
            }
            if p.category.is_none() {
                p.category = candidate.category.clone();
            }
            p.revision = revision;
            p.updated_at = at;
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
