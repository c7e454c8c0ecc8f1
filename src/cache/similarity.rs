//! Similarity scoring between normalized queries.
//!
//! Text pairs score by token overlap (intersection over union), a
//! symmetric, order-independent coefficient in `[0, 1]`. Tokens of three
//! characters or fewer are ignored so that articles and prepositions do
//! not inflate the score. Structured pairs score by the share of equal
//! fields across an identical key set; a mismatched key set or a mixed
//! text/structured pair scores zero.

use ahash::AHashSet;
use serde_json::Value;

use super::normalize::NormalizedQuery;

/// Tokens shorter than this never participate in overlap scoring.
const MIN_TOKEN_CHARS: usize = 4;

pub(crate) fn score(candidate: &NormalizedQuery, cached: &NormalizedQuery) -> f64 {
    match (candidate, cached) {
        (NormalizedQuery::Text(a), NormalizedQuery::Text(b)) => token_overlap(a, b),
        (NormalizedQuery::Structured(a), NormalizedQuery::Structured(b)) => field_overlap(a, b),
        _ => 0.0,
    }
}

/// Intersection-over-union ratio of the significant tokens of two
/// normalized texts. Two texts with no significant tokens score zero.
pub(crate) fn token_overlap(a: &str, b: &str) -> f64 {
    let a_tokens: AHashSet<&str> = significant_tokens(a).collect();
    let b_tokens: AHashSet<&str> = significant_tokens(b).collect();
    let union = a_tokens.union(&b_tokens).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a_tokens.intersection(&b_tokens).count();
    intersection as f64 / union as f64
}

fn significant_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
}

/// Share of equal fields between two canonical objects with identical
/// key sets. Non-object values fall back to plain equality.
fn field_overlap(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Object(a_fields), Value::Object(b_fields)) => {
            if a_fields.len() != b_fields.len()
                || a_fields.keys().any(|key| !b_fields.contains_key(key))
            {
                return 0.0;
            }
            if a_fields.is_empty() {
                return 1.0;
            }
            let matching = a_fields
                .iter()
                .filter(|&(key, value)| b_fields.get(key.as_str()) == Some(value))
                .count();
            matching as f64 / a_fields.len() as f64
        }
        (a, b) => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
    }
}
