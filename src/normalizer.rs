//! Record normalization: turns a scraped [`RawObservation`] into a comparable
//! [`NormalizedRecord`].
//!
//! Titles become lower-cased token sets with brand and stopword tokens split
//! off, prices become integer minor units, and variant labels become a
//! canonical axis → value map.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, warn};

use crate::config::NormalizerConfig;
use crate::error::NormalizeError;
use crate::models::{ListingKey, Money, RawObservation, VariantAxes};

/// Built-in axis-name synonyms. Config entries are merged over these.
const AXIS_SYNONYMS: &[(&str, &str)] = &[
    ("colour", "color"),
    ("colours", "color"),
    ("colors", "color"),
    ("clr", "color"),
    ("col", "color"),
    ("farbe", "color"),
    ("couleur", "color"),
    ("sz", "size"),
    ("sizes", "size"),
    ("taille", "size"),
    ("größe", "size"),
    ("mat", "material"),
    ("fabric", "material"),
    ("qty", "quantity"),
    ("pack", "quantity"),
    ("pack size", "quantity"),
    ("cap", "capacity"),
    ("storage", "capacity"),
    ("len", "length"),
    ("wt", "weight"),
];

/// Axis name given to labels that carry a value but no axis
const BARE_AXIS: &str = "option";

/// A raw observation in comparable form
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub listing: ListingKey,
    pub url: String,
    /// Lower-cased, whitespace-collapsed title
    pub title: String,
    /// Title tokens minus brand and stopword tokens
    pub title_tokens: BTreeSet<String>,
    /// Brand and stopword tokens removed from the title
    pub stripped_tokens: BTreeSet<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub axes: VariantAxes,
    pub sku: Option<String>,
    /// `None` for variants enumerated without a price
    pub price: Option<Money>,
    pub available: bool,
    pub observed_at: DateTime<Utc>,
}

/// A record excluded from its batch, reported back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub listing: ListingKey,
    pub url: String,
    pub title: String,
    pub error: NormalizeError,
}

pub struct Normalizer {
    stopwords: HashSet<String>,
    /// Known brands, each as its token sequence
    known_brands: Vec<Vec<String>>,
    synonyms: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        let stopwords = config
            .stopwords
            .iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        let mut known_brands: Vec<Vec<String>> = config
            .known_brands
            .iter()
            .map(|b| tokenize(b))
            .filter(|tokens| !tokens.is_empty())
            .collect();
        // Longest brand first so "acme pro" wins over "acme"
        known_brands.sort_by_key(|tokens| std::cmp::Reverse(tokens.len()));

        let mut synonyms: HashMap<String, String> = AXIS_SYNONYMS
            .iter()
            .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
            .collect();
        for (from, to) in &config.axis_synonyms {
            synonyms.insert(collapse(from), collapse(to));
        }

        Self {
            stopwords,
            known_brands,
            synonyms,
        }
    }

    pub fn normalize(&self, raw: &RawObservation) -> Result<NormalizedRecord, NormalizeError> {
        let title = collapse(&raw.title);
        if title.is_empty() {
            return Err(NormalizeError::MissingTitle);
        }

        let tokens = tokenize(&title);
        let (brand, brand_tokens) = self.detect_brand(raw.brand.as_deref(), &tokens);

        let mut title_tokens = BTreeSet::new();
        let mut stripped_tokens = BTreeSet::new();
        for token in tokens {
            if brand_tokens.contains(&token) || self.stopwords.contains(&token) {
                stripped_tokens.insert(token);
            } else {
                title_tokens.insert(token);
            }
        }

        let price = match raw.price.as_deref() {
            Some(amount) => {
                let currency = normalize_currency(&raw.currency).ok_or_else(|| {
                    NormalizeError::MalformedPrice {
                        raw: amount.to_string(),
                        reason: format!("invalid currency code {:?}", raw.currency),
                    }
                })?;
                let minor = parse_minor_units(amount, currency_exponent(&currency)).map_err(
                    |reason| NormalizeError::MalformedPrice {
                        raw: amount.to_string(),
                        reason,
                    },
                )?;
                Some(Money { minor, currency })
            }
            None => None,
        };

        let category = raw
            .category
            .as_deref()
            .map(collapse)
            .filter(|c| !c.is_empty());

        let sku = raw
            .sku
            .as_deref()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());

        Ok(NormalizedRecord {
            listing: raw.listing_key(),
            url: raw.url.trim().to_string(),
            title,
            title_tokens,
            stripped_tokens,
            brand,
            category,
            axes: self.normalize_axes(&raw.variant_labels),
            sku,
            price,
            available: raw.available,
            observed_at: raw.observed_at,
        })
    }

    /// Normalize every observation, collecting failures instead of aborting.
    pub fn normalize_batch(
        &self,
        observations: &[RawObservation],
    ) -> (Vec<NormalizedRecord>, Vec<Rejected>) {
        let mut records = Vec::with_capacity(observations.len());
        let mut rejected = Vec::new();

        for raw in observations {
            match self.normalize(raw) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!("Rejected record from {} ({}): {}", raw.site, raw.url, error);
                    rejected.push(Rejected {
                        listing: raw.listing_key(),
                        url: raw.url.clone(),
                        title: raw.title.clone(),
                        error,
                    });
                }
            }
        }

        (records, rejected)
    }

    fn detect_brand(
        &self,
        explicit: Option<&str>,
        title_tokens: &[String],
    ) -> (Option<String>, HashSet<String>) {
        if let Some(brand) = explicit {
            let tokens = tokenize(brand);
            if !tokens.is_empty() {
                let name = tokens.join(" ");
                return (Some(name), tokens.into_iter().collect());
            }
        }

        self.known_brands
            .iter()
            .find(|brand| title_tokens.starts_with(brand.as_slice()))
            .map_or_else(
                || (None, HashSet::new()),
                |brand| (Some(brand.join(" ")), brand.iter().cloned().collect()),
            )
    }

    fn normalize_axes(&self, labels: &[String]) -> VariantAxes {
        let mut axes = VariantAxes::new();
        let mut bare_values = BTreeSet::new();

        for label in labels {
            let split = label.split_once([':', '=']);
            let (axis, value) = match split {
                Some((axis, value)) => (collapse(axis), collapse(value)),
                None => (String::new(), collapse(label)),
            };
            if value.is_empty() {
                continue;
            }
            if axis.is_empty() {
                bare_values.insert(value);
                continue;
            }

            let axis = self.synonyms.get(&axis).cloned().unwrap_or(axis);
            match axes.get(&axis) {
                // Keep the smaller value on collision so label order never matters
                Some(existing) if *existing <= value => {
                    debug!("Ignoring duplicate axis {} = {}", axis, value);
                }
                _ => {
                    axes.insert(axis, value);
                }
            }
        }

        let mut slot = 1;
        for value in bare_values {
            loop {
                let axis = if slot == 1 {
                    BARE_AXIS.to_string()
                } else {
                    format!("{BARE_AXIS}{slot}")
                };
                slot += 1;
                if !axes.contains_key(&axis) {
                    axes.insert(axis, value);
                    break;
                }
            }
        }

        axes
    }
}

/// Lower-case and collapse runs of whitespace to single spaces.
fn collapse(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split into lower-cased tokens with punctuation trimmed from token edges.
pub fn tokenize(s: &str) -> Vec<String> {
    s.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn normalize_currency(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    (code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())).then_some(code)
}

/// Number of minor-unit digits for an ISO 4217 currency.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "PYG" | "UGX" | "XAF" | "XOF" | "XPF" | "RWF"
        | "GNF" | "KMF" | "DJF" | "BIF" | "VUV" => 0,
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" | "IQD" | "LYD" => 3,
        _ => 2,
    }
}

/// Characters allowed between the first and last digit of an amount
fn is_amount_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, ',' | '.' | ' ' | '\'' | '\u{a0}' | '\u{202f}')
}

/// Parse a scraped price string into integer minor units.
///
/// Text around the amount (currency symbols, "from", codes) is ignored. Both
/// `1,299.99` and `1.299,99` are understood; a lone separator followed by
/// exactly three digits is read as a thousands separator unless the currency
/// itself has three minor digits. Excess fractional digits round half away
/// from zero.
pub fn parse_minor_units(raw: &str, exponent: u32) -> Result<i64, String> {
    if raw.contains('-') || raw.contains('\u{2212}') {
        return Err("negative or ranged amount".to_string());
    }

    let first = raw.find(|c: char| c.is_ascii_digit()).ok_or("no digits")?;
    let last = raw
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or("no digits")?;
    let amount = &raw[first..=last];

    if let Some(bad) = amount.chars().find(|c| !is_amount_char(*c)) {
        return Err(format!("unexpected character {bad:?} in amount"));
    }

    let amount: String = amount
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.'))
        .collect();

    let decimal_sep = decimal_separator(&amount, exponent);
    let (int_part, frac_part) = match decimal_sep {
        Some(pos) => (&amount[..pos], &amount[pos + 1..]),
        None => (amount.as_str(), ""),
    };
    if frac_part.contains([',', '.']) {
        return Err("separator after decimal point".to_string());
    }
    if let Some(pos) = decimal_sep
        && int_part.contains(&amount[pos..=pos])
    {
        return Err("more than one decimal separator".to_string());
    }
    let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    let frac_digits: String = frac_part.chars().filter(char::is_ascii_digit).collect();
    let canonical = match (int_digits.is_empty(), frac_digits.is_empty()) {
        (_, true) => int_digits,
        (true, false) => format!("0.{frac_digits}"),
        (false, false) => format!("{int_digits}.{frac_digits}"),
    };

    let mut amount = Decimal::from_str(&canonical)
        .map_err(|_| "amount too large".to_string())?
        .round_dp_with_strategy(exponent, RoundingStrategy::MidpointAwayFromZero);
    amount.rescale(exponent);

    i64::try_from(amount.mantissa()).map_err(|_| "amount too large".to_string())
}

/// Byte offset of the decimal separator in a digits-and-separators string.
fn decimal_separator(amount: &str, exponent: u32) -> Option<usize> {
    let last_dot = amount.rfind('.');
    let last_comma = amount.rfind(',');

    let (pos, sep) = match (last_dot, last_comma) {
        (Some(d), Some(c)) => return Some(d.max(c)),
        (Some(d), None) => (d, '.'),
        (None, Some(c)) => (c, ','),
        (None, None) => return None,
    };

    if amount.matches(sep).count() > 1 {
        return None;
    }
    let trailing = amount.len() - pos - 1;
    if trailing == 3 && exponent != 3 {
        return None;
    }
    Some(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(title: &str, price: Option<&str>, labels: &[&str]) -> RawObservation {
        RawObservation {
            site: "A".to_string(),
            url: "https://a.example/p/1".to_string(),
            product_id: None,
            title: title.to_string(),
            brand: None,
            category: Some(" Tools ".to_string()),
            variant_labels: labels.iter().map(|l| (*l).to_string()).collect(),
            sku: None,
            price: price.map(str::to_string),
            currency: " usd".to_string(),
            available: true,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig {
            known_brands: vec!["Acme".to_string()],
            ..NormalizerConfig::default()
        })
    }

    #[test]
    fn title_is_lowercased_and_collapsed() {
        let record = normalizer()
            .normalize(&raw("  The   ACME Widget,  Pro ", Some("19.99"), &[]))
            .unwrap();
        assert_eq!(record.title, "the acme widget, pro");
        assert_eq!(
            record.title_tokens,
            ["widget", "pro"].iter().map(|s| s.to_string()).collect()
        );
        assert!(record.stripped_tokens.contains("the"));
        assert_eq!(record.category.as_deref(), Some("tools"));
    }

    #[test]
    fn leading_known_brand_is_split_off() {
        let record = normalizer()
            .normalize(&raw("Acme Widget Pro", Some("1"), &[]))
            .unwrap();
        assert_eq!(record.brand.as_deref(), Some("acme"));
        assert!(record.stripped_tokens.contains("acme"));
        assert!(!record.title_tokens.contains("acme"));
    }

    #[test]
    fn explicit_brand_takes_precedence() {
        let mut observation = raw("Widget by Globex", Some("1"), &[]);
        observation.brand = Some(" GLOBEX ".to_string());
        let record = normalizer().normalize(&observation).unwrap();
        assert_eq!(record.brand.as_deref(), Some("globex"));
        assert!(!record.title_tokens.contains("globex"));
    }

    #[test]
    fn empty_title_is_missing() {
        let err = normalizer().normalize(&raw("   ", Some("1.00"), &[])).unwrap_err();
        assert_eq!(err, NormalizeError::MissingTitle);
    }

    #[test]
    fn price_becomes_minor_units() {
        let record = normalizer()
            .normalize(&raw("Widget", Some("$19.99"), &[]))
            .unwrap();
        assert_eq!(
            record.price,
            Some(Money { minor: 1999, currency: "USD".to_string() })
        );
    }

    #[test]
    fn parses_common_price_shapes() {
        assert_eq!(parse_minor_units("18.50", 2), Ok(1850));
        assert_eq!(parse_minor_units("USD 1,299.99", 2), Ok(129_999));
        assert_eq!(parse_minor_units("1.299,99 €", 2), Ok(129_999));
        assert_eq!(parse_minor_units("1 299", 2), Ok(129_900));
        assert_eq!(parse_minor_units("1,299", 2), Ok(129_900));
        assert_eq!(parse_minor_units("19,9", 2), Ok(1990));
        assert_eq!(parse_minor_units("¥1,200", 0), Ok(1200));
        assert_eq!(parse_minor_units("1.299", 3), Ok(1299));
        assert_eq!(parse_minor_units("0", 2), Ok(0));
    }

    #[test]
    fn excess_fraction_rounds_half_up() {
        assert_eq!(parse_minor_units("0.125", 3), Ok(125));
        assert_eq!(parse_minor_units("0.1250", 2), Ok(13));
        assert_eq!(parse_minor_units("0.1249", 2), Ok(12));
        assert_eq!(parse_minor_units("2.5", 0), Ok(3));
        assert_eq!(parse_minor_units("9.9950", 2), Ok(1000));
    }

    #[test]
    fn amounts_beyond_i64_minor_units_are_rejected() {
        assert_eq!(
            parse_minor_units("999999999999999999999", 2),
            Err("amount too large".to_string())
        );
    }

    #[test]
    fn malformed_prices_are_rejected() {
        for bad in ["", "free", "-5.00", "10 - 20", "1.2.3,4,5x", "12/3"] {
            assert!(parse_minor_units(bad, 2).is_err(), "{bad:?} should fail");
        }

        let err = normalizer()
            .normalize(&raw("Widget", Some("call us"), &[]))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedPrice { .. }));
    }

    #[test]
    fn invalid_currency_is_malformed_price() {
        let mut observation = raw("Widget", Some("5"), &[]);
        observation.currency = "$".to_string();
        assert!(matches!(
            normalizer().normalize(&observation),
            Err(NormalizeError::MalformedPrice { .. })
        ));
    }

    #[test]
    fn unpriced_record_is_not_an_error() {
        let record = normalizer().normalize(&raw("Widget", None, &[])).unwrap();
        assert_eq!(record.price, None);
    }

    #[test]
    fn axis_synonyms_and_values_are_normalized() {
        let record = normalizer()
            .normalize(&raw("Widget", Some("1"), &["Colour: Red ", "SZ=M"]))
            .unwrap();
        assert_eq!(record.axes.get("color").map(String::as_str), Some("red"));
        assert_eq!(record.axes.get("size").map(String::as_str), Some("m"));
    }

    #[test]
    fn configured_synonyms_extend_builtins() {
        let normalizer = Normalizer::new(&NormalizerConfig {
            axis_synonyms: [("Tint".to_string(), "Color".to_string())].into(),
            ..NormalizerConfig::default()
        });
        let record = normalizer
            .normalize(&raw("Widget", Some("1"), &["tint:Blue"]))
            .unwrap();
        assert_eq!(record.axes.get("color").map(String::as_str), Some("blue"));
    }

    #[test]
    fn label_order_does_not_change_axes() {
        let n = normalizer();
        let a = n
            .normalize(&raw("Widget", Some("1"), &["Size:M", "Color:Red", "XL", "Matte"]))
            .unwrap();
        let b = n
            .normalize(&raw("Widget", Some("1"), &["Matte", "Color:Red", "XL", "Size:M"]))
            .unwrap();
        assert_eq!(a.axes, b.axes);
        assert_eq!(a.axes.get("option").map(String::as_str), Some("matte"));
        assert_eq!(a.axes.get("option2").map(String::as_str), Some("xl"));
    }

    #[test]
    fn batch_collects_rejections_without_aborting() {
        let batch = vec![
            raw("Widget", Some("1.00"), &[]),
            raw("", Some("1.00"), &[]),
            raw("Gadget", Some("n/a"), &[]),
        ];
        let (records, rejected) = normalizer().normalize_batch(&batch);
        assert_eq!(records.len(), 1);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].error, NormalizeError::MissingTitle);
    }
}
