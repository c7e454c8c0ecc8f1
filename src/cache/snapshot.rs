//! Flat JSON image of the store on disk.
//!
//! Writes go to a sibling `.tmp` file first and rename into place, so a
//! crash mid-write never leaves a truncated snapshot behind. A missing
//! file on read is a cold start, not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::trace;

use super::store::CacheCounters;
use super::{CacheQuery, Fingerprint};
use crate::config::duration_ms;
use crate::error::CacheError;

/// One entry as stored on disk. The normalized form is deliberately not
/// persisted; it is recomputed on load so normalization changes take
/// effect across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub key: Fingerprint,
    pub query: CacheQuery,
    pub data: Value,
    pub category: String,
    #[serde(with = "duration_ms")]
    pub ttl_ms: Duration,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hit_count: u64,
    #[serde(default)]
    pub saved_units: u64,
}

/// The whole store: entries, recency order (least recent first), and
/// the running counters.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CacheSnapshot {
    pub entries: Vec<PersistedEntry>,
    pub access_order: Vec<Fingerprint>,
    pub stats: CacheCounters,
    pub saved_at: DateTime<Utc>,
}

pub(crate) async fn write(path: &Path, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
    let payload = serde_json::to_vec_pretty(snapshot).map_err(CacheError::SnapshotSerialize)?;

    let mut staging = path.as_os_str().to_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    fs::write(&staging, &payload)
        .await
        .map_err(|source| CacheError::SnapshotWrite {
            path: staging.clone(),
            source,
        })?;
    fs::rename(&staging, path)
        .await
        .map_err(|source| CacheError::SnapshotWrite {
            path: path.to_path_buf(),
            source,
        })?;
    trace!(path = %path.display(), bytes = payload.len(), "cache snapshot written");
    Ok(())
}

pub(crate) async fn read(path: &Path) -> Result<Option<CacheSnapshot>, CacheError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::SnapshotRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let snapshot =
        serde_json::from_slice(&raw).map_err(|source| CacheError::SnapshotParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(snapshot))
}
