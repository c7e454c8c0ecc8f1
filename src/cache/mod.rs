//! Adaptive result cache.
//!
//! Lookups try an exact fingerprint match first, then fall back to a
//! similarity scan over same-category entries, so a query phrased
//! slightly differently still reuses an expensive earlier result.
//! Eviction is strict least-recently-used; expiry is per-category TTL,
//! checked lazily on read and by an optional background sweep. The whole
//! store can be written to and restored from a flat JSON snapshot.
//!
//! All state sits behind one mutex that is never held across an await,
//! so a [`ResultCache`] can be shared freely across tasks.

mod normalize;
mod similarity;
mod snapshot;
mod store;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, ConfigError};

/// A cache lookup key, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheQuery {
    /// Free text, matched by token overlap.
    Text(String),
    /// Structured fields, matched field by field.
    Structured(Value),
}

impl From<&str> for CacheQuery {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for CacheQuery {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for CacheQuery {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

/// Stable hash of a normalized query within its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Fingerprint(pub(crate) String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Live entries.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lookups that returned data.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup.
    pub hit_rate: f64,
    /// Hits resolved on the fingerprint alone.
    pub exact_hits: u64,
    /// Hits resolved by the similarity scan.
    pub similarity_hits: u64,
    /// Entries inserted since the last reset.
    pub insertions: u64,
    /// Entries displaced by capacity pressure.
    pub evictions: u64,
    /// Entries dropped past their TTL.
    pub expirations: u64,
    /// Cumulative estimated work units saved by hits.
    pub saved_units: u64,
    /// Breakdown per category.
    pub by_category: HashMap<String, CategoryStats>,
}

/// Per-category slice of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    /// Live entries in this category.
    pub entries: usize,
    /// Hits served from this category.
    pub hits: u64,
    /// Estimated work units saved by this category's hits.
    pub saved_units: u64,
}

/// Result cache with exact and similarity matching.
///
/// Construction is cheap and synchronous. Background maintenance (expiry
/// sweep, periodic snapshot) starts only when
/// [`start_maintenance`](Self::start_maintenance) is called from within
/// a runtime, and stops when the cache is dropped.
pub struct ResultCache {
    state: Arc<Mutex<store::CacheState>>,
    config: CacheConfig,
    shutdown: CancellationToken,
    maintenance_started: AtomicBool,
}

impl ResultCache {
    /// Creates an empty cache with the given policy.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity =
            NonZeroUsize::new(config.max_size).ok_or(ConfigError::ZeroCacheCapacity)?;
        Ok(Self {
            state: Arc::new(Mutex::new(store::CacheState::new(capacity))),
            config,
            shutdown: CancellationToken::new(),
            maintenance_started: AtomicBool::new(false),
        })
    }

    /// Looks up a result using the configured similarity threshold.
    #[must_use]
    pub fn get(&self, query: &CacheQuery, category: &str) -> Option<Value> {
        self.get_with_threshold(query, category, self.config.similarity_threshold)
    }

    /// Looks up a result with an explicit similarity threshold.
    ///
    /// Exact fingerprint match wins; otherwise the best-scoring
    /// same-category entry at or above `threshold` is returned, ties
    /// going to the most recently used entry. Expired entries are
    /// removed on the way.
    #[must_use]
    pub fn get_with_threshold(
        &self,
        query: &CacheQuery,
        category: &str,
        threshold: f64,
    ) -> Option<Value> {
        self.state.lock().lookup(query, category, threshold, Utc::now())
    }

    /// Stores a result under the query's fingerprint.
    ///
    /// The TTL comes from the category's policy (default TTL for unknown
    /// categories). At capacity the least recently used entry is evicted
    /// first. `saved_units` estimates the work one future hit avoids.
    pub fn set(&self, query: CacheQuery, data: Value, category: &str, saved_units: u64) {
        let ttl = self.config.ttl_for(category);
        self.state
            .lock()
            .insert(query, data, category.to_string(), ttl, saved_units, Utc::now());
    }

    /// Drops every entry and resets the statistics. Returns how many
    /// entries were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.state.lock().clear();
        info!(dropped, "cache cleared");
        dropped
    }

    /// Drops every entry of one category, leaving the statistics
    /// running. Returns how many entries were dropped.
    pub fn clear_category(&self, category: &str) -> usize {
        let dropped = self.state.lock().clear_category(category);
        info!(category, dropped, "cache category cleared");
        dropped
    }

    /// Returns a point-in-time statistics snapshot.
    #[must_use]
    pub fn statistics(&self) -> CacheStats {
        self.state.lock().statistics()
    }

    /// Writes the whole store to the configured snapshot path.
    ///
    /// The write is staged and renamed, so a crash never leaves a
    /// truncated snapshot. Fails with
    /// [`CacheError::SnapshotPathMissing`] when no path is configured.
    pub async fn save(&self) -> Result<(), CacheError> {
        let Some(path) = &self.config.snapshot_path else {
            return Err(CacheError::SnapshotPathMissing);
        };
        let image = self.state.lock().to_snapshot(Utc::now());
        snapshot::write(path, &image).await?;
        debug!(path = %path.display(), entries = image.entries.len(), "cache snapshot saved");
        Ok(())
    }

    /// Restores the store from the configured snapshot path.
    ///
    /// Entries that expired while on disk are purged during the restore.
    /// A missing file is a cold start and restores nothing. Returns how
    /// many entries came back.
    pub async fn load(&self) -> Result<usize, CacheError> {
        let Some(path) = &self.config.snapshot_path else {
            return Err(CacheError::SnapshotPathMissing);
        };
        match snapshot::read(path).await? {
            Some(image) => {
                let restored = self.state.lock().restore(image, Utc::now());
                info!(restored, path = %path.display(), "cache snapshot loaded");
                Ok(restored)
            }
            None => {
                debug!(path = %path.display(), "no cache snapshot found; starting cold");
                Ok(0)
            }
        }
    }

    /// Removes every expired entry immediately. The background sweep
    /// runs this on its cadence; callers can also trigger it directly.
    /// Returns how many entries were dropped.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().sweep(Utc::now())
    }

    /// Starts the background expiry sweep and periodic snapshot, as
    /// configured. Idempotent; must be called from within a runtime.
    pub fn start_maintenance(&self) {
        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(every) = self.config.sweep_interval {
            tokio::spawn(sweep_loop(
                Arc::clone(&self.state),
                every,
                self.shutdown.clone(),
            ));
        }
        if let (Some(every), Some(path)) =
            (self.config.autosave_interval, self.config.snapshot_path.clone())
        {
            tokio::spawn(autosave_loop(
                Arc::clone(&self.state),
                path,
                every,
                self.shutdown.clone(),
            ));
        }
    }

    /// Stops the background maintenance tasks.
    pub fn stop_maintenance(&self) {
        self.shutdown.cancel();
    }

    #[cfg(test)]
    fn backdate(&self, query: &CacheQuery, category: &str, age: chrono::Duration) {
        self.state.lock().backdate(query, category, age);
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_loop(
    state: Arc<Mutex<store::CacheState>>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = state.lock().sweep(Utc::now());
                if removed > 0 {
                    debug!(removed, "expiry sweep dropped entries");
                }
            }
        }
    }
}

async fn autosave_loop(
    state: Arc<Mutex<store::CacheState>>,
    path: PathBuf,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let image = state.lock().to_snapshot(Utc::now());
                if let Err(err) = snapshot::write(&path, &image).await {
                    // Skipping a periodic write is preferable to taking
                    // the caller path down with it.
                    warn!(error = %err, "cache autosave failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn config(max_size: usize) -> CacheConfig {
        CacheConfig {
            max_size,
            sweep_interval: None,
            autosave_interval: None,
            ..CacheConfig::default()
        }
    }

    fn cache(max_size: usize) -> ResultCache {
        ResultCache::new(config(max_size)).unwrap()
    }

    fn q(text: &str) -> CacheQuery {
        CacheQuery::Text(text.into())
    }

    #[test]
    fn test_exact_hit_round_trip() {
        let cache = cache(10);
        cache.set(q("contrato de arrendamiento 2023"), json!({"ok": 1}), "analysis", 500);

        assert_eq!(
            cache.get(&q("contrato de arrendamiento 2023"), "analysis"),
            Some(json!({"ok": 1}))
        );
        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.exact_hits, 1);
        assert_eq!(stats.saved_units, 500);
    }

    #[test]
    fn test_normalization_unifies_spelling_variants() {
        let cache = cache(10);
        cache.set(
            q("Cláusula  ABUSIVA   07/05/2023"),
            json!({"nula": true}),
            "analysis",
            0,
        );

        assert!(cache.get(&q("clausula abusiva 2023-05-07"), "analysis").is_some());
        assert_eq!(cache.statistics().exact_hits, 1);
    }

    #[test]
    fn test_lru_eviction_follows_access_order() {
        let cache = cache(2);
        cache.set(q("consulta alfa"), json!("A"), "analysis", 0);
        cache.set(q("consulta beta"), json!("B"), "analysis", 0);
        // Touch the oldest so it stops being the eviction candidate.
        assert!(cache.get(&q("consulta alfa"), "analysis").is_some());
        cache.set(q("consulta gamma"), json!("C"), "analysis", 0);

        let stats = cache.statistics();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert!(cache.get(&q("consulta beta"), "analysis").is_none());
        assert!(cache.get(&q("consulta alfa"), "analysis").is_some());
        assert!(cache.get(&q("consulta gamma"), "analysis").is_some());
    }

    #[test]
    fn test_ttl_hit_before_expiry_miss_after() {
        let cache = cache(10);
        cache.set(q("campos del formulario"), json!({"valid": true}), "validation", 0);

        // Default validation TTL is one day.
        cache.backdate(&q("campos del formulario"), "validation", chrono::Duration::hours(23));
        assert!(cache.get(&q("campos del formulario"), "validation").is_some());

        cache.backdate(&q("campos del formulario"), "validation", chrono::Duration::hours(2));
        assert!(cache.get(&q("campos del formulario"), "validation").is_none());

        let stats = cache.statistics();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_unknown_category_uses_default_ttl() {
        let cache = cache(10);
        cache.set(q("consulta sin categoria"), json!(1), "misc", 0);

        cache.backdate(&q("consulta sin categoria"), "misc", chrono::Duration::hours(2));
        assert!(cache.get(&q("consulta sin categoria"), "misc").is_none());
    }

    #[test]
    fn test_purge_expired_drops_only_stale_entries() {
        let cache = cache(10);
        cache.set(q("dictamen vigente"), json!(1), "analysis", 0);
        cache.set(q("dictamen caducado"), json!(2), "analysis", 0);
        cache.backdate(&q("dictamen caducado"), "analysis", chrono::Duration::hours(7));

        assert_eq!(cache.purge_expired(), 1);
        let stats = cache.statistics();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_categories_are_isolated() {
        let cache = cache(10);
        cache.set(q("plazo de apelacion"), json!(1), "extraction", 0);

        assert!(cache.get(&q("plazo de apelacion"), "jurisprudence").is_none());
        assert!(cache.get(&q("plazo de apelacion"), "extraction").is_some());
    }

    #[test]
    fn test_similarity_hit_reuses_close_query() {
        let cache = cache(10);
        cache.set(
            q("clausula abusiva hipoteca multidivisa banco popular demanda"),
            json!({"resumen": "nulidad"}),
            "jurisprudence",
            2500,
        );

        // Six of seven significant tokens shared: 0.857, above 0.85.
        let close = q("clausula abusiva hipoteca multidivisa banco demanda");
        assert_eq!(
            cache.get(&close, "jurisprudence"),
            Some(json!({"resumen": "nulidad"}))
        );
        let stats = cache.statistics();
        assert_eq!(stats.similarity_hits, 1);
        assert_eq!(stats.saved_units, 2500);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let cache = cache(10);
        cache.set(q("contrato arrendamiento vivienda madrid"), json!(1), "analysis", 0);

        // Three of five distinct significant tokens: exactly 0.6.
        let candidate = q("contrato arrendamiento vivienda barcelona");
        assert!(cache.get_with_threshold(&candidate, "analysis", 0.6).is_some());
        assert!(cache.get_with_threshold(&candidate, "analysis", 0.601).is_none());
    }

    #[test]
    fn test_similarity_tie_prefers_most_recent() {
        let cache = cache(10);
        cache.set(q("demanda desahucio precario madrid"), json!("A"), "analysis", 0);
        cache.set(q("demanda desahucio precario valencia"), json!("B"), "analysis", 0);

        // Both entries score 0.75 against the candidate.
        let candidate = q("demanda desahucio precario");
        assert_eq!(
            cache.get_with_threshold(&candidate, "analysis", 0.75),
            Some(json!("B"))
        );

        // Touching the other entry flips the tie.
        assert!(cache.get(&q("demanda desahucio precario madrid"), "analysis").is_some());
        assert_eq!(
            cache.get_with_threshold(&candidate, "analysis", 0.75),
            Some(json!("A"))
        );
    }

    #[test]
    fn test_structured_queries_hit_on_reordered_fields() {
        let cache = cache(10);
        cache.set(
            CacheQuery::Structured(json!({"tipo": "desahucio", "ciudad": "Madrid"})),
            json!({"valido": true}),
            "validation",
            300,
        );

        let reordered = CacheQuery::Structured(json!({"ciudad": "madrid", "tipo": "DESAHUCIO"}));
        assert!(cache.get(&reordered, "validation").is_some());
        assert_eq!(cache.statistics().exact_hits, 1);
    }

    #[test]
    fn test_statistics_account_for_every_lookup() {
        let cache = cache(10);
        cache.set(q("consulta conocida"), json!(1), "analysis", 0);

        assert!(cache.get(&q("consulta conocida"), "analysis").is_some());
        assert!(cache.get(&q("consulta desconocida"), "analysis").is_none());
        assert!(cache.get(&q("otra consulta ignota"), "analysis").is_none());

        let stats = cache.statistics();
        assert_eq!(stats.hits + stats.misses, 3);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_category["analysis"].hits, 1);
        assert_eq!(stats.by_category["analysis"].entries, 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_preserves_entries_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2);
        cfg.snapshot_path = Some(dir.path().join("cache.json"));

        let original = ResultCache::new(cfg.clone()).unwrap();
        original.set(q("expediente alfa"), json!("X"), "extraction", 0);
        original.set(q("expediente bravo"), json!("Y"), "extraction", 0);
        // Promote "alfa" so "bravo" is the eviction candidate at save time.
        assert!(original.get(&q("expediente alfa"), "extraction").is_some());
        original.save().await.unwrap();

        let restored = ResultCache::new(cfg).unwrap();
        assert_eq!(restored.load().await.unwrap(), 2);
        let stats = restored.statistics();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hits, 1);

        restored.set(q("expediente delta"), json!("Z"), "extraction", 0);
        assert!(restored.get(&q("expediente bravo"), "extraction").is_none());
        assert!(restored.get(&q("expediente alfa"), "extraction").is_some());
    }

    #[tokio::test]
    async fn test_load_purges_entries_that_expired_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(10);
        cfg.snapshot_path = Some(dir.path().join("cache.json"));

        let original = ResultCache::new(cfg.clone()).unwrap();
        original.set(q("dictamen vigente"), json!(1), "analysis", 0);
        original.set(q("dictamen caducado"), json!(2), "analysis", 0);
        // Default analysis TTL is six hours.
        original.backdate(&q("dictamen caducado"), "analysis", chrono::Duration::hours(7));
        original.save().await.unwrap();

        let restored = ResultCache::new(cfg).unwrap();
        assert_eq!(restored.load().await.unwrap(), 1);
        assert!(restored.get(&q("dictamen caducado"), "analysis").is_none());
        assert!(restored.get(&q("dictamen vigente"), "analysis").is_some());
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(10);
        cfg.snapshot_path = Some(dir.path().join("never-written.json"));

        let cache = ResultCache::new(cfg).unwrap();
        assert_eq!(cache.load().await.unwrap(), 0);
        assert_eq!(cache.statistics().size, 0);
    }

    #[tokio::test]
    async fn test_save_without_path_is_an_error() {
        let cache = cache(4);
        assert!(matches!(
            cache.save().await.unwrap_err(),
            CacheError::SnapshotPathMissing
        ));
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_entries() {
        let mut cfg = config(10);
        cfg.sweep_interval = Some(Duration::from_millis(20));
        let cache = ResultCache::new(cfg).unwrap();

        cache.set(q("consulta caducada"), json!(1), "analysis", 0);
        cache.backdate(&q("consulta caducada"), "analysis", chrono::Duration::hours(7));
        cache.start_maintenance();

        for _ in 0..200 {
            if cache.statistics().size == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = cache.statistics();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_background_autosave_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(10);
        let path = dir.path().join("cache.json");
        cfg.snapshot_path = Some(path.clone());
        cfg.autosave_interval = Some(Duration::from_millis(20));
        let cache = ResultCache::new(cfg).unwrap();

        cache.set(q("consulta persistida"), json!(1), "analysis", 0);
        cache.start_maintenance();
        cache.start_maintenance();

        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let image = snapshot::read(&path).await.unwrap().unwrap();
        assert_eq!(image.entries.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_capacity_is_never_exceeded(
            operations in proptest::collection::vec((any::<u16>(), 0usize..4), 1..64)
        ) {
            let cache = cache(8);
            let categories = ["extraction", "jurisprudence", "analysis", "validation"];
            for (token, category) in operations {
                cache.set(
                    CacheQuery::Text(format!("consulta numero {token}")),
                    json!(token),
                    categories[category],
                    0,
                );
                prop_assert!(cache.statistics().size <= 8);
            }
        }
    }
}
