use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "TRACKER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/tracker.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrackerConfig {
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_stopwords")]
    pub stopwords: Vec<String>,
    /// Brands recognised as the leading title token when a record has no brand
    #[serde(default)]
    pub known_brands: Vec<String>,
    /// Extra axis-name synonyms, merged over the built-in table
    #[serde(default)]
    pub axis_synonyms: HashMap<String, String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            stopwords: default_stopwords(),
            known_brands: Vec::new(),
            axis_synonyms: HashMap::new(),
        }
    }
}

fn default_stopwords() -> Vec<String> {
    ["the", "a", "an", "and", "for", "with", "new"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    #[serde(default = "default_true")]
    pub merge_on_shared_sku: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            ambiguity_margin: default_ambiguity_margin(),
            merge_on_shared_sku: true,
        }
    }
}

fn default_threshold() -> f64 {
    0.85
}
fn default_ambiguity_margin() -> f64 {
    0.05
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_change_threshold_pct")]
    pub change_threshold_pct: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            change_threshold_pct: default_change_threshold_pct(),
        }
    }
}

fn default_change_threshold_pct() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:database/prices.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_feed_dir")]
    pub dir: PathBuf,
    /// Cron expression (with seconds) for ingestion passes
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            dir: default_feed_dir(),
            schedule: default_schedule(),
        }
    }
}

fn default_feed_dir() -> PathBuf {
    PathBuf::from("feed")
}
fn default_schedule() -> String {
    "0 */5 * * * *".to_string()
}

/// Load the config from `$TRACKER_CONFIG`, falling back to
/// `config/tracker.toml`. A missing file yields the defaults.
pub fn load_from_env() -> Result<TrackerConfig> {
    let path = std::env::var(CONFIG_ENV).map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    if path.exists() {
        load_config(&path)
    } else {
        info!("No config file at {} - using defaults", path.display());
        let config = TrackerConfig::default();
        validate(&config)?;
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<TrackerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<TrackerConfig> {
    let config: TrackerConfig =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &TrackerConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&config.matching.threshold) {
        anyhow::bail!("matching.threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.matching.ambiguity_margin) {
        anyhow::bail!("matching.ambiguity_margin must be in [0.0, 1.0]");
    }

    if !config.ledger.change_threshold_pct.is_finite() || config.ledger.change_threshold_pct < 0.0 {
        anyhow::bail!("ledger.change_threshold_pct must be >= 0");
    }

    if config.database.url.trim().is_empty() {
        anyhow::bail!("database.url must not be empty");
    }

    if config.feed.schedule.trim().is_empty() {
        anyhow::bail!("feed.schedule must not be empty");
    }

    Ok(())
}
