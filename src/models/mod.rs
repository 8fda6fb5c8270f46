//! Data models for scraped observations, the catalog read model and price history

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scrape result handed over by a scraping collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
    pub site: String,
    pub url: String,
    /// Site-native product identifier, derived from `url` when absent
    #[serde(default)]
    pub product_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// One label per variant axis, e.g. `["Color:Red", "Size:M"]`
    #[serde(default)]
    pub variant_labels: Vec<String>,
    #[serde(default)]
    pub sku: Option<String>,
    /// `None` when the variant is listed on the page without a price
    #[serde(default)]
    pub price: Option<String>,
    pub currency: String,
    #[serde(default = "default_available")]
    pub available: bool,
    pub observed_at: DateTime<Utc>,
}

fn default_available() -> bool {
    true
}

impl RawObservation {
    /// The (site, native id) pair this observation belongs to
    pub fn listing_key(&self) -> ListingKey {
        let native_id = self
            .product_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| native_id_from_url(&self.url), str::to_string);

        ListingKey {
            site: self.site.trim().to_lowercase(),
            native_id,
        }
    }
}

/// Strip query string, fragment and trailing slash so repeated scrapes of the
/// same product page collapse onto one listing.
fn native_id_from_url(url: &str) -> String {
    let mut id = url.trim().to_string();
    if let Some(pos) = id.find(['?', '#']) {
        id.truncate(pos);
    }
    while id.ends_with('/') {
        id.pop();
    }
    id
}

/// Amount of money in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub minor: i64,
    pub currency: String,
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exponent = crate::normalizer::currency_exponent(&self.currency);
        if exponent == 0 {
            return write!(f, "{} {}", self.minor, self.currency);
        }
        let scale = 10_i64.pow(exponent);
        write!(
            f,
            "{}.{:0width$} {}",
            self.minor / scale,
            self.minor % scale,
            self.currency,
            width = exponent as usize
        )
    }
}

/// Identity of a listing on its source site
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub site: String,
    pub native_id: String,
}

impl ListingKey {
    pub fn new(site: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            native_id: native_id.into(),
        }
    }

    pub fn id(&self) -> ListingId {
        ListingId(format!(
            "{:x}",
            md5::compute(format!("{}:{}", self.site, self.native_id))
        ))
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site, self.native_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub String);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantId(pub String);

impl VariantId {
    /// Derive the stable id of a variant from its listing and normalized axes.
    ///
    /// `VariantAxes` iterates in key order, so the id does not depend on the
    /// order the site listed its axes in.
    pub fn derive(listing: &ListingId, axes: &VariantAxes) -> Self {
        let mut material = format!("{}|", listing.0);
        if axes.is_empty() {
            material.push_str("default");
        } else {
            for (axis, value) in axes {
                material.push_str(axis);
                material.push('=');
                material.push_str(value);
                material.push(';');
            }
        }
        Self(format!("{:x}", md5::compute(material)))
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub u64);

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Normalized axis name to normalized value, in canonical order
pub type VariantAxes = BTreeMap<String, String>;

/// A deduplicated logical product spanning one or more listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: ProductId,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    /// Tokens of `name` used for similarity scoring
    pub title_tokens: BTreeSet<String>,
    pub members: BTreeSet<ListingId>,
    /// Set once the product has been absorbed by a merge
    pub merged_into: Option<ProductId>,
    /// Logical clock bumped on every membership change
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalProduct {
    pub fn is_tombstoned(&self) -> bool {
        self.merged_into.is_some()
    }
}

/// One (site, product) pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub key: ListingKey,
    pub url: String,
    pub product: ProductId,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub title_tokens: BTreeSet<String>,
    /// Every distinct axis-name set seen on this listing, oldest first
    pub schema_generations: Vec<BTreeSet<String>>,
    pub variants: BTreeSet<VariantId>,
}

/// One distinct purchasable configuration within a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub listing: ListingId,
    pub axes: VariantAxes,
    pub sku: Option<String>,
    /// Index into the owning listing's `schema_generations`
    pub generation: u32,
    pub available: bool,
}

/// Immutable price fact for one variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub variant: VariantId,
    pub price: Money,
    pub available: bool,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(url: &str, product_id: Option<&str>) -> RawObservation {
        RawObservation {
            site: " ShopA ".to_string(),
            url: url.to_string(),
            product_id: product_id.map(str::to_string),
            title: "Widget".to_string(),
            brand: None,
            category: None,
            variant_labels: Vec::new(),
            sku: None,
            price: Some("1.00".to_string()),
            currency: "USD".to_string(),
            available: true,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn listing_key_strips_query_and_trailing_slash() {
        let a = observation("https://shop.example/p/widget/?utm=1", None).listing_key();
        let b = observation("https://shop.example/p/widget#reviews", None).listing_key();
        assert_eq!(a, b);
        assert_eq!(a.site, "shopa");
        assert_eq!(a.native_id, "https://shop.example/p/widget");
    }

    #[test]
    fn explicit_product_id_wins_over_url() {
        let key = observation("https://shop.example/p/widget", Some(" 123 ")).listing_key();
        assert_eq!(key.native_id, "123");
    }

    #[test]
    fn variant_id_ignores_insertion_order() {
        let listing = ListingKey::new("a", "1").id();
        let mut first = VariantAxes::new();
        first.insert("size".to_string(), "m".to_string());
        first.insert("color".to_string(), "red".to_string());
        let mut second = VariantAxes::new();
        second.insert("color".to_string(), "red".to_string());
        second.insert("size".to_string(), "m".to_string());
        assert_eq!(
            VariantId::derive(&listing, &first),
            VariantId::derive(&listing, &second)
        );
        assert_ne!(
            VariantId::derive(&listing, &first),
            VariantId::derive(&listing, &VariantAxes::new())
        );
    }

    #[test]
    fn money_display_uses_currency_exponent() {
        let usd = Money { minor: 1999, currency: "USD".to_string() };
        let jpy = Money { minor: 1999, currency: "JPY".to_string() };
        assert_eq!(usd.to_string(), "19.99 USD");
        assert_eq!(jpy.to_string(), "1999 JPY");
    }
}
