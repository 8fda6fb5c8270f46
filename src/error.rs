//! Typed errors for the matching and pricing core.
//!
//! Glue code (config, database, feed, binary) uses `anyhow`; the core stages
//! return these so callers can tell per-record rejections from programming
//! errors.

use thiserror::Error;

use crate::models::{ListingId, ProductId, VariantId};

/// Per-record normalization failures. Never abort a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed price {raw:?}: {reason}")]
    MalformedPrice { raw: String, reason: String },

    #[error("title is empty")]
    MissingTitle,
}

/// Price ledger failures. Propagated to the immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("unknown variant: {0}")]
    UnknownVariant(VariantId),

    #[error("no price data for variant: {0}")]
    NoData(VariantId),

    #[error("currency changed from {previous} to {current} for variant {variant}")]
    CurrencyMismatch {
        variant: VariantId,
        previous: String,
        current: String,
    },
}

/// Catalog mutations that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error("unknown listing: {0}")]
    UnknownListing(ListingId),

    #[error("product {0} has been merged into {1}")]
    Tombstoned(ProductId, ProductId),

    #[error("cannot merge product {0} into itself")]
    SelfMerge(ProductId),
}
