use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, migrate::MigrateDatabase};
use tracing::info;

use crate::catalog::Catalog;
use crate::ledger::PriceLedger;
use crate::models::{
    CanonicalProduct, Listing, ListingId, ListingKey, Money, PriceObservation, ProductId, Variant,
    VariantId,
};

/// SQLite store for the catalog read model and the price history
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let in_memory = db_url.contains(":memory:");

        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            if let Some(parent) = db_url
                .strip_prefix("sqlite:")
                .map(|p| p.trim_start_matches("//"))
                .and_then(|p| Path::new(p).parent())
                .filter(|p| !p.as_os_str().is_empty())
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            info!("Creating database file");
            Sqlite::create_database(db_url).await?;
        }

        // Every connection to :memory: is a separate database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .with_context(|| format!("Failed to connect to {db_url}"))?;

        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    /// Upsert every product, listing, variant and pin in one transaction.
    pub async fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for product in catalog.products() {
            sqlx::query(
                r"
                INSERT INTO canonical_products
                    (id, name, brand, category, title_tokens, merged_into, revision, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    brand = excluded.brand,
                    category = excluded.category,
                    title_tokens = excluded.title_tokens,
                    merged_into = excluded.merged_into,
                    revision = excluded.revision,
                    updated_at = excluded.updated_at
                ",
            )
            .bind(product.id.0 as i64)
            .bind(&product.name)
            .bind(&product.brand)
            .bind(&product.category)
            .bind(serde_json::to_string(&product.title_tokens)?)
            .bind(product.merged_into.map(|p| p.0 as i64))
            .bind(product.revision as i64)
            .bind(product.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for listing in catalog.listings() {
            sqlx::query(
                r"
                INSERT INTO listings
                    (id, site, native_id, url, product_id, brand, category, title_tokens, schema_generations)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    product_id = excluded.product_id,
                    schema_generations = excluded.schema_generations
                ",
            )
            .bind(&listing.id.0)
            .bind(&listing.key.site)
            .bind(&listing.key.native_id)
            .bind(&listing.url)
            .bind(listing.product.0 as i64)
            .bind(&listing.brand)
            .bind(&listing.category)
            .bind(serde_json::to_string(&listing.title_tokens)?)
            .bind(serde_json::to_string(&listing.schema_generations)?)
            .execute(&mut *tx)
            .await?;
        }

        for variant in catalog.variants() {
            sqlx::query(
                r"
                INSERT INTO variants (id, listing_id, axes, sku, generation, available)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    sku = excluded.sku,
                    available = excluded.available
                ",
            )
            .bind(&variant.id.0)
            .bind(&variant.listing.0)
            .bind(serde_json::to_string(&variant.axes)?)
            .bind(&variant.sku)
            .bind(i64::from(variant.generation))
            .bind(variant.available)
            .execute(&mut *tx)
            .await?;
        }

        for (key, product) in catalog.pins() {
            sqlx::query(
                r"
                INSERT INTO listing_pins (site, native_id, product_id)
                VALUES (?, ?, ?)
                ON CONFLICT(site, native_id) DO UPDATE SET product_id = excluded.product_id
                ",
            )
            .bind(&key.site)
            .bind(&key.native_id)
            .bind(product.0 as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert observations, ignoring any already stored.
    pub async fn append_observations(&self, observations: &[PriceObservation]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for observation in observations {
            let result = sqlx::query(
                r"
                INSERT OR IGNORE INTO price_observations
                    (variant_id, price_minor, currency, available, observed_at)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(&observation.variant.0)
            .bind(observation.price.minor)
            .bind(&observation.price.currency)
            .bind(observation.available)
            .bind(observation.observed_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Rebuild the catalog and ledger from stored rows.
    pub async fn load_state(&self, change_threshold_pct: f64) -> Result<(Catalog, PriceLedger)> {
        let products = sqlx::query(
            "SELECT id, name, brand, category, title_tokens, merged_into, revision, updated_at
             FROM canonical_products ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<CanonicalProduct> {
            Ok(CanonicalProduct {
                id: ProductId(row.get::<i64, _>("id") as u64),
                name: row.get("name"),
                brand: row.get("brand"),
                category: row.get("category"),
                title_tokens: serde_json::from_str(row.get::<&str, _>("title_tokens"))?,
                members: Default::default(),
                merged_into: row
                    .get::<Option<i64>, _>("merged_into")
                    .map(|p| ProductId(p as u64)),
                revision: row.get::<i64, _>("revision") as u64,
                updated_at: row.get("updated_at"),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let listings = sqlx::query(
            "SELECT id, site, native_id, url, product_id, brand, category, title_tokens, schema_generations
             FROM listings ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<Listing> {
            Ok(Listing {
                id: ListingId(row.get("id")),
                key: ListingKey::new(row.get::<String, _>("site"), row.get::<String, _>("native_id")),
                url: row.get("url"),
                product: ProductId(row.get::<i64, _>("product_id") as u64),
                brand: row.get("brand"),
                category: row.get("category"),
                title_tokens: serde_json::from_str(row.get::<&str, _>("title_tokens"))?,
                schema_generations: serde_json::from_str(row.get::<&str, _>("schema_generations"))?,
                variants: Default::default(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let variants = sqlx::query(
            "SELECT id, listing_id, axes, sku, generation, available FROM variants ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<Variant> {
            Ok(Variant {
                id: VariantId(row.get("id")),
                listing: ListingId(row.get("listing_id")),
                axes: serde_json::from_str(row.get::<&str, _>("axes"))?,
                sku: row.get("sku"),
                generation: u32::try_from(row.get::<i64, _>("generation"))?,
                available: row.get("available"),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let pins = sqlx::query("SELECT site, native_id, product_id FROM listing_pins")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| {
                (
                    ListingKey::new(row.get::<String, _>("site"), row.get::<String, _>("native_id")),
                    ProductId(row.get::<i64, _>("product_id") as u64),
                )
            })
            .collect();

        let mut ledger = PriceLedger::new(change_threshold_pct);
        for variant in &variants {
            ledger.register(&variant.id);
        }

        let rows = sqlx::query(
            "SELECT variant_id, price_minor, currency, available, observed_at
             FROM price_observations ORDER BY variant_id, observed_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let observation_count = rows.len();

        for row in rows {
            let variant = VariantId(row.get("variant_id"));
            ledger.register(&variant);
            ledger.append(PriceObservation {
                variant,
                price: Money {
                    minor: row.get("price_minor"),
                    currency: row.get("currency"),
                },
                available: row.get("available"),
                observed_at: row.get("observed_at"),
            })?;
        }

        info!(
            "Loaded {} products, {} listings, {} variants, {} observations",
            products.len(),
            listings.len(),
            variants.len(),
            observation_count
        );

        Ok((Catalog::restore(products, listings, variants, pins), ledger))
    }
}

impl Database {
    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}
