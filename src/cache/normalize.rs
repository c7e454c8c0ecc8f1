//! Query normalization and fingerprinting.
//!
//! Two queries that normalize identically always hash to the same
//! fingerprint. Text is lowercased, diacritics folded, date-like tokens
//! rewritten to `YYYY-MM-DD`, and whitespace collapsed, in that order.
//! Structured values serialize with sorted object keys and sorted arrays
//! so that field order never affects equality.

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{CacheQuery, Fingerprint};

/// A query after normalization, ready for hashing or scoring.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NormalizedQuery {
    Text(String),
    Structured(Value),
}

impl NormalizedQuery {
    pub fn of(query: &CacheQuery) -> Self {
        match query {
            CacheQuery::Text(text) => Self::Text(normalize(text)),
            CacheQuery::Structured(value) => Self::Structured(canonical_value(value)),
        }
    }

    fn canonical_form(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

/// Stable key for one normalized query within one category.
///
/// The category is part of the hashed material, so identical queries in
/// different categories never collide into a shared entry.
pub(crate) fn fingerprint(category: &str, query: &NormalizedQuery) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update([0u8]);
    hasher.update(query.canonical_form().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Normalizes free text for fingerprinting and token comparison.
pub(crate) fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let folded = fold_diacritics(&lowered);
    let dated = canonicalize_dates(&folded);
    collapse_whitespace(&dated)
}

/// Normalizes a structured value: string fields go through text
/// normalization, arrays sort by their serialized form, object keys are
/// left intact (`serde_json` already serializes them sorted).
pub(crate) fn canonical_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(normalize(text)),
        Value::Array(items) => {
            let mut canonical: Vec<Value> = items.iter().map(canonical_value).collect();
            canonical.sort_by_key(std::string::ToString::to_string);
            Value::Array(canonical)
        }
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), canonical_value(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Maps accented Latin letters to their base form. Input is already
/// lowercased.
fn fold_diacritics(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            'ý' | 'ÿ' => 'y',
            other => other,
        })
        .collect()
}

/// Rewrites date-like tokens to `YYYY-MM-DD`.
///
/// Year-first forms are handled before day-first forms so that an
/// already-canonical date is never reinterpreted. Ambiguous day-first
/// dates read as day/month/year. Tokens that do not survive calendar
/// validation are left untouched.
fn canonicalize_dates(text: &str) -> String {
    static YMD_PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"\b(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})\b").unwrap()
    });
    static DMY_PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"\b(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})\b").unwrap()
    });

    let year_first = YMD_PATTERN.replace_all(text, |caps: &regex::Captures<'_>| {
        calendar_date(&caps[1], &caps[2], &caps[3]).unwrap_or_else(|| caps[0].to_string())
    });
    DMY_PATTERN
        .replace_all(&year_first, |caps: &regex::Captures<'_>| {
            calendar_date(&caps[3], &caps[2], &caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn calendar_date(year: &str, month: &str, day: &str) -> Option<String> {
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.format("%Y-%m-%d").to_string())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
