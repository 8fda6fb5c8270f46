//! Title similarity scoring used by the matcher's fuzzy step

use std::collections::BTreeSet;

/// Scores how alike two title token sets are, in `[0.0, 1.0]`
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64;
}

/// Soft Jaccard similarity over title tokens.
///
/// Two tokens count as the same when they are equal, or when both are longer
/// than `min_fuzzy_len` characters and their normalized edit similarity is at
/// least `token_threshold` (catches "colour"/"color", "wireless"/"wirless").
#[derive(Debug, Clone)]
pub struct TokenSimilarity {
    pub token_threshold: f64,
    pub min_fuzzy_len: usize,
}

impl Default for TokenSimilarity {
    fn default() -> Self {
        Self {
            token_threshold: 0.8,
            min_fuzzy_len: 3,
        }
    }
}

impl TokenSimilarity {
    fn tokens_match(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let (len_a, len_b) = (a.chars().count(), b.chars().count());
        if len_a <= self.min_fuzzy_len || len_b <= self.min_fuzzy_len {
            return false;
        }
        // Digits carry model numbers; "v2" vs "v3" must never fuzzy-match
        if a.chars().any(|c| c.is_ascii_digit()) || b.chars().any(|c| c.is_ascii_digit()) {
            return false;
        }
        strsim::normalized_levenshtein(a, b) >= self.token_threshold
    }
}

impl SimilarityScorer for TokenSimilarity {
    fn score(&self, a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }

        let mut unmatched: Vec<&String> = b.iter().collect();
        let mut matched = 0usize;

        for token in a {
            let hit = unmatched
                .iter()
                .position(|other| *other == token)
                .or_else(|| unmatched.iter().position(|other| self.tokens_match(token, other)));
            if let Some(idx) = hit {
                unmatched.swap_remove(idx);
                matched += 1;
            }
        }

        let union = a.len() + b.len() - matched;
        matched as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[&str]) -> BTreeSet<String> {
        tokens.iter().map(|t| (*t).to_string()).collect()
    }

    #[test]
    fn identical_sets_score_one() {
        let scorer = TokenSimilarity::default();
        assert!((scorer.score(&set(&["widget", "pro"]), &set(&["widget", "pro"])) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_sets_score_zero() {
        let scorer = TokenSimilarity::default();
        assert_eq!(scorer.score(&set(&["widget"]), &set(&["gadget", "max"])), 0.0);
    }

    #[test]
    fn partial_overlap_is_jaccard() {
        let scorer = TokenSimilarity::default();
        let score = scorer.score(&set(&["widget", "pro", "black"]), &set(&["widget", "pro"]));
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn misspellings_count_as_matches() {
        let scorer = TokenSimilarity::default();
        let score = scorer.score(
            &set(&["wireless", "headphones"]),
            &set(&["wirless", "headphones"]),
        );
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn model_numbers_never_fuzzy_match() {
        let scorer = TokenSimilarity::default();
        let score = scorer.score(&set(&["router", "ax3000"]), &set(&["router", "ax5000"]));
        assert!((score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn short_tokens_need_exact_match() {
        let scorer = TokenSimilarity::default();
        assert_eq!(scorer.score(&set(&["pro"]), &set(&["pr0"])), 0.0);
    }

    #[test]
    fn token_threshold_bounds_fuzzy_matches() {
        let scorer = TokenSimilarity::default();
        // colour/color: one edit over six chars
        assert!(scorer.tokens_match("color", "colour"));
        assert!(!scorer.tokens_match("kettle", "kettel"));
        assert!(!scorer.tokens_match("kitten", "sitting"));

        let strict = TokenSimilarity {
            token_threshold: 0.9,
            ..TokenSimilarity::default()
        };
        assert!(!strict.tokens_match("color", "colour"));
    }
}
