//! Entry bookkeeping: recency order, lazy expiry, running counters.
//!
//! All state lives behind the facade's mutex, so nothing here is aware
//! of concurrency. The recency list is the eviction order; expiry is
//! checked lazily on every encounter and takes priority over recency, so
//! an expired entry disappears even if it was just promoted.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::normalize::{self, NormalizedQuery};
use super::snapshot::{CacheSnapshot, PersistedEntry};
use super::{CacheQuery, CacheStats, CategoryStats, Fingerprint, similarity};

/// One cached result.
pub(crate) struct CacheEntry {
    /// Original query, kept for similarity comparison against future
    /// queries.
    pub query: CacheQuery,
    /// Normalized form, computed once at insertion.
    pub normalized: NormalizedQuery,
    /// Cached result payload.
    pub data: Value,
    /// Selects the TTL policy.
    pub category: String,
    /// Resolved from the category when the entry was inserted.
    pub ttl: Duration,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hit_count: u64,
    /// Work units one hit on this entry saves.
    pub saved_units: u64,
}

impl CacheEntry {
    /// Entries past their TTL are absent regardless of recency.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.ttl).is_ok_and(|ttl| now - self.created_at > ttl)
    }
}

/// Running counters, persisted with the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub exact_hits: u64,
    pub similarity_hits: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub saved_units: u64,
    #[serde(default)]
    pub by_category: HashMap<String, CategoryCounters>,
}

/// Per-category slice of the running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CategoryCounters {
    pub hits: u64,
    pub saved_units: u64,
}

impl CacheCounters {
    fn record_hit(&mut self, category: &str, saved: u64, exact: bool) {
        self.hits += 1;
        if exact {
            self.exact_hits += 1;
        } else {
            self.similarity_hits += 1;
        }
        self.saved_units += saved;
        let slot = self.by_category.entry(category.to_string()).or_default();
        slot.hits += 1;
        slot.saved_units += saved;
    }
}

/// The store proper: entries in recency order plus counters.
pub(crate) struct CacheState {
    entries: LruCache<Fingerprint, CacheEntry>,
    counters: CacheCounters,
}

impl CacheState {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            counters: CacheCounters::default(),
        }
    }

    /// Exact fingerprint match first; otherwise the best-scoring
    /// same-category entry at or above `threshold`.
    ///
    /// The scan walks most-recent-first and only a strictly better score
    /// displaces the running best, so ties resolve to the more recently
    /// used entry. Expired entries are dropped on encounter.
    pub fn lookup(
        &mut self,
        query: &CacheQuery,
        category: &str,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<Value> {
        let normalized = NormalizedQuery::of(query);
        let key = normalize::fingerprint(category, &normalized);

        let expired_exact = match self.entries.get_mut(&key) {
            Some(entry) if entry.is_expired_at(now) => true,
            Some(entry) => {
                entry.last_access = now;
                entry.hit_count += 1;
                let data = entry.data.clone();
                let saved = entry.saved_units;
                self.counters.record_hit(category, saved, true);
                trace!(%key, category, "exact cache hit");
                return Some(data);
            }
            None => false,
        };
        if expired_exact {
            self.remove_expired(&key);
        }

        let mut best: Option<(Fingerprint, f64)> = None;
        let mut stale: Vec<Fingerprint> = Vec::new();
        for (key, entry) in self.entries.iter() {
            if entry.category != category {
                continue;
            }
            if entry.is_expired_at(now) {
                stale.push(key.clone());
                continue;
            }
            let score = similarity::score(&normalized, &entry.normalized);
            if score >= threshold
                && best.as_ref().is_none_or(|(_, best_score)| score > *best_score)
            {
                best = Some((key.clone(), score));
            }
        }
        for key in &stale {
            self.remove_expired(key);
        }

        if let Some((key, score)) = best
            && let Some(entry) = self.entries.get_mut(&key)
        {
            entry.last_access = now;
            entry.hit_count += 1;
            let data = entry.data.clone();
            let saved = entry.saved_units;
            self.counters.record_hit(category, saved, false);
            debug!(%key, category, score, "similarity cache hit");
            return Some(data);
        }

        self.counters.misses += 1;
        trace!(category, "cache miss");
        None
    }

    /// Inserts an entry, evicting the least recently used one when the
    /// store is at capacity. Re-inserting an existing key replaces the
    /// entry in place without an eviction.
    pub fn insert(
        &mut self,
        query: CacheQuery,
        data: Value,
        category: String,
        ttl: Duration,
        saved_units: u64,
        now: DateTime<Utc>,
    ) {
        let normalized = NormalizedQuery::of(&query);
        let key = normalize::fingerprint(&category, &normalized);
        let entry = CacheEntry {
            query,
            normalized,
            data,
            category,
            ttl,
            created_at: now,
            last_access: now,
            hit_count: 0,
            saved_units,
        };
        self.counters.insertions += 1;
        if let Some((displaced, _)) = self.entries.push(key.clone(), entry) {
            if displaced == key {
                trace!(%key, "cache entry replaced");
            } else {
                self.counters.evictions += 1;
                debug!(evicted = %displaced, "cache entry evicted");
            }
        }
    }

    /// Drops every entry and starts the counters over.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.counters = CacheCounters::default();
        dropped
    }

    /// Drops every entry of one category; counters keep running.
    pub fn clear_category(&mut self, category: &str) -> usize {
        let doomed: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.category == category)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.entries.pop(key);
        }
        doomed.len()
    }

    /// Removes every expired entry; the periodic sweep calls this.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let stale: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.remove_expired(key);
        }
        stale.len()
    }

    pub fn statistics(&self) -> CacheStats {
        let counters = &self.counters;
        let mut by_category: HashMap<String, CategoryStats> = counters
            .by_category
            .iter()
            .map(|(category, slice)| {
                (
                    category.clone(),
                    CategoryStats {
                        entries: 0,
                        hits: slice.hits,
                        saved_units: slice.saved_units,
                    },
                )
            })
            .collect();
        for (_, entry) in self.entries.iter() {
            by_category.entry(entry.category.clone()).or_default().entries += 1;
        }

        let gets = counters.hits + counters.misses;
        CacheStats {
            size: self.entries.len(),
            max_size: self.entries.cap().get(),
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: if gets == 0 {
                0.0
            } else {
                counters.hits as f64 / gets as f64
            },
            exact_hits: counters.exact_hits,
            similarity_hits: counters.similarity_hits,
            insertions: counters.insertions,
            evictions: counters.evictions,
            expirations: counters.expirations,
            saved_units: counters.saved_units,
            by_category,
        }
    }

    /// Serializable image of the store: entries plus the recency order,
    /// least recently used first.
    pub fn to_snapshot(&self, saved_at: DateTime<Utc>) -> CacheSnapshot {
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut access_order = Vec::with_capacity(self.entries.len());
        for (key, entry) in self.entries.iter() {
            entries.push(PersistedEntry {
                key: key.clone(),
                query: entry.query.clone(),
                data: entry.data.clone(),
                category: entry.category.clone(),
                ttl_ms: entry.ttl,
                created_at: entry.created_at,
                last_access: entry.last_access,
                hit_count: entry.hit_count,
                saved_units: entry.saved_units,
            });
            access_order.push(key.clone());
        }
        access_order.reverse();
        CacheSnapshot {
            entries,
            access_order,
            stats: self.counters.clone(),
            saved_at,
        }
    }

    /// Rebuilds the store from a snapshot, skipping entries that expired
    /// since it was written. Returns how many entries came back.
    ///
    /// Entries re-insert in persisted recency order (least recent first)
    /// so the rebuilt eviction order matches the saved one. Normalized
    /// forms are recomputed rather than trusted from disk.
    pub fn restore(&mut self, snapshot: CacheSnapshot, now: DateTime<Utc>) -> usize {
        let mut by_key: AHashMap<Fingerprint, PersistedEntry> = snapshot
            .entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        self.counters = snapshot.stats;
        let mut restored = 0;
        for key in snapshot.access_order {
            let Some(persisted) = by_key.remove(&key) else {
                continue;
            };
            let normalized = NormalizedQuery::of(&persisted.query);
            let entry = CacheEntry {
                query: persisted.query,
                normalized,
                data: persisted.data,
                category: persisted.category,
                ttl: persisted.ttl_ms,
                created_at: persisted.created_at,
                last_access: persisted.last_access,
                hit_count: persisted.hit_count,
                saved_units: persisted.saved_units,
            };
            if entry.is_expired_at(now) {
                self.counters.expirations += 1;
                continue;
            }
            if self.entries.push(key, entry).is_some() {
                // Only possible when the configured capacity shrank
                // since the snapshot was written.
                self.counters.evictions += 1;
            }
            restored += 1;
        }
        restored
    }

    fn remove_expired(&mut self, key: &Fingerprint) {
        if self.entries.pop(key).is_some() {
            self.counters.expirations += 1;
            debug!(%key, "expired cache entry removed");
        }
    }

    #[cfg(test)]
    pub fn backdate(&mut self, query: &CacheQuery, category: &str, age: chrono::Duration) {
        let normalized = NormalizedQuery::of(query);
        let key = normalize::fingerprint(category, &normalized);
        if let Some(entry) = self.entries.peek_mut(&key) {
            entry.created_at -= age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn state(capacity: usize) -> CacheState {
        CacheState::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn set(state: &mut CacheState, query: &str, category: &str) {
        state.insert(
            CacheQuery::Text(query.into()),
            json!({"answer": query}),
            category.into(),
            Duration::from_secs(3600),
            100,
            Utc::now(),
        );
    }

    #[test]
    fn test_replacement_is_not_an_eviction() {
        let mut state = state(2);
        set(&mut state, "alpha query", "analysis");
        set(&mut state, "alpha query", "analysis");
        let stats = state.statistics();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_capacity_overflow_evicts_least_recent() {
        let mut state = state(2);
        set(&mut state, "primero", "analysis");
        set(&mut state, "segundo", "analysis");
        set(&mut state, "tercero", "analysis");
        let stats = state.statistics();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert!(
            state
                .lookup(&CacheQuery::Text("primero".into()), "analysis", 0.85, Utc::now())
                .is_none()
        );
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let mut state = state(10);
        set(&mut state, "fresca consulta", "analysis");
        set(&mut state, "vieja consulta", "analysis");
        state.backdate(
            &CacheQuery::Text("vieja consulta".into()),
            "analysis",
            chrono::Duration::hours(2),
        );

        assert_eq!(state.sweep(Utc::now()), 1);
        let stats = state.statistics();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut state = state(10);
        set(&mut state, "consulta", "analysis");
        let _ = state.lookup(&CacheQuery::Text("consulta".into()), "analysis", 0.85, Utc::now());
        assert_eq!(state.clear(), 1);
        let stats = state.statistics();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.insertions, 0);
    }

    #[test]
    fn test_clear_category_leaves_other_categories() {
        let mut state = state(10);
        set(&mut state, "consulta a", "extraction");
        set(&mut state, "consulta b", "extraction");
        set(&mut state, "consulta c", "validation");
        assert_eq!(state.clear_category("extraction"), 2);
        let stats = state.statistics();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.by_category["validation"].entries, 1);
    }
}
