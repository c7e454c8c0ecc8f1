//! The orchestration layer: cache-aware execution of legal operations.
//!
//! An [`Engine`] owns one worker pool and one result cache. Every
//! operation first consults the cache under its category; only misses
//! are submitted to the pool, and their results are stored on the way
//! back so later equivalent (or merely similar) operations skip the
//! work entirely.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cache::{CacheQuery, CacheStats, ResultCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::TaskExecutor;
use crate::pool::{PoolStats, WorkerPool};

/// One unit of work the engine knows how to route.
///
/// The pool never inspects these; only the engine maps them to cache
/// categories, priorities and savings estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Pull structured data out of a filed document.
    ExtractDocument {
        /// Stable identifier of the stored document.
        document_id: String,
        /// Page count, used for progress estimation downstream.
        pages: u32,
    },
    /// Search case law for a free-text question.
    JurisprudenceSearch {
        /// The question as the user typed it.
        query: String,
        /// Jurisdiction the search is scoped to.
        jurisdiction: String,
    },
    /// Ask the language model for an analysis or draft.
    ModelCompletion {
        /// Full prompt text.
        prompt: String,
        /// Model the prompt is addressed to.
        model: String,
    },
    /// Check a filing's fields against its case type's rules.
    ValidateFiling {
        /// Case type selecting the rule set.
        case_type: String,
        /// The fields as submitted.
        fields: Value,
    },
}

impl Operation {
    /// Cache category, which also selects the TTL policy.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ExtractDocument { .. } => "extraction",
            Self::JurisprudenceSearch { .. } => "jurisprudence",
            Self::ModelCompletion { .. } => "analysis",
            Self::ValidateFiling { .. } => "validation",
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtractDocument { .. } => "extract_document",
            Self::JurisprudenceSearch { .. } => "jurisprudence_search",
            Self::ModelCompletion { .. } => "model_completion",
            Self::ValidateFiling { .. } => "validate_filing",
        }
    }

    /// Queue priority. Interactive validations go first, bulk document
    /// extraction yields to everything else.
    #[must_use]
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::ExtractDocument { .. } => 0,
            Self::JurisprudenceSearch { .. } | Self::ModelCompletion { .. } => 5,
            Self::ValidateFiling { .. } => 10,
        }
    }

    /// Estimated work units one cache hit on this operation saves.
    #[must_use]
    pub fn saved_units(&self) -> u64 {
        match self {
            Self::ExtractDocument { .. } => 8000,
            Self::JurisprudenceSearch { .. } => 2500,
            Self::ModelCompletion { .. } => 4000,
            Self::ValidateFiling { .. } => 300,
        }
    }

    /// The cache key material for this operation.
    ///
    /// Text forms include the scoping field (jurisdiction, model) so
    /// that equal questions under different scopes stay distinct.
    /// Structured forms compare field by field, which in practice makes
    /// extraction and validation exact-match only.
    #[must_use]
    pub fn cache_query(&self) -> CacheQuery {
        match self {
            Self::ExtractDocument { document_id, pages } => {
                CacheQuery::Structured(json!({ "document_id": document_id, "pages": pages }))
            }
            Self::JurisprudenceSearch { query, jurisdiction } => {
                CacheQuery::Text(format!("{jurisdiction} {query}"))
            }
            Self::ModelCompletion { prompt, model } => {
                CacheQuery::Text(format!("{model} {prompt}"))
            }
            Self::ValidateFiling { case_type, fields } => {
                CacheQuery::Structured(json!({ "case_type": case_type, "fields": fields }))
            }
        }
    }
}

/// Combined engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Worker pool side.
    pub pool: PoolStats,
    /// Result cache side.
    pub cache: CacheStats,
}

/// Cache-aware front end over a worker pool.
pub struct Engine<E: TaskExecutor<Payload = Operation, Output = Value>> {
    pool: WorkerPool<E>,
    cache: ResultCache,
    config: EngineConfig,
}

impl<E: TaskExecutor<Payload = Operation, Output = Value>> Engine<E> {
    /// Builds the pool and cache, restores the cache snapshot if one is
    /// configured, and starts background maintenance.
    ///
    /// A snapshot that fails to load is logged and skipped; the engine
    /// starts with a cold cache rather than refusing to start.
    pub async fn new(executor: E, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = ResultCache::new(config.cache.clone())?;
        let pool = WorkerPool::new(executor, config.pool.clone())?;
        let workers = pool.initialize().await?;

        if config.cache.snapshot_path.is_some()
            && let Err(err) = cache.load().await
        {
            warn!(error = %err, "cache snapshot load failed; starting cold");
        }
        cache.start_maintenance();

        info!(workers, cache_capacity = config.cache.max_size, "engine ready");
        Ok(Self { pool, cache, config })
    }

    /// Runs one operation, serving it from the cache when possible.
    pub async fn run(&self, operation: Operation) -> Result<Value, EngineError> {
        let kind = operation.kind();
        let category = operation.category();
        let query = operation.cache_query();

        if let Some(data) = self.cache.get(&query, category) {
            debug!(kind, category, "served from cache");
            return Ok(data);
        }

        let priority = operation.default_priority();
        let saved_units = operation.saved_units();
        let handle = self.pool.submit(operation, priority).await?;
        debug!(task = %handle.id(), kind, priority, "operation submitted");

        let data = handle.wait().await?;
        self.cache.set(query, data.clone(), category, saved_units);
        Ok(data)
    }

    /// Runs a batch concurrently and returns results in input order.
    ///
    /// Cached operations resolve without touching the pool. After each
    /// completion, `on_progress` runs with `(completed, total)`; a
    /// rejected submission counts as completed.
    pub async fn run_batch<F>(
        &self,
        operations: Vec<Operation>,
        mut on_progress: F,
    ) -> Vec<Result<Value, EngineError>>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = operations.len();
        let mut results: Vec<Option<Result<Value, EngineError>>> = Vec::with_capacity(total);
        results.resize_with(total, || None);

        let mut completed = 0usize;
        let mut runs = FuturesUnordered::new();
        for (index, operation) in operations.into_iter().enumerate() {
            runs.push(async move { (index, self.run(operation).await) });
        }
        while let Some((index, outcome)) = runs.next().await {
            results[index] = Some(outcome);
            completed += 1;
            on_progress(completed, total);
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(EngineError::Pool(crate::error::PoolError::Closed))))
            .collect()
    }

    /// Returns combined pool and cache statistics.
    pub async fn statistics(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            pool: self.pool.statistics().await?,
            cache: self.cache.statistics(),
        })
    }

    /// The underlying pool handle.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool<E> {
        &self.pool
    }

    /// The underlying result cache.
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Drains the pool, writes a final cache snapshot if a path is
    /// configured, and stops cache maintenance.
    pub async fn shutdown(&self) {
        if let Err(err) = self.pool.shutdown().await {
            warn!(error = %err, "pool shutdown reported an error");
        }
        if self.config.cache.snapshot_path.is_some()
            && let Err(err) = self.cache.save().await
        {
            warn!(error = %err, "final cache snapshot failed");
        }
        self.cache.stop_maintenance();
        info!("engine stopped");
    }
}
