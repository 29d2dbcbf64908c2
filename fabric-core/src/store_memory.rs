//! In-memory [`MethodStateStorage`].
//!
//! Single-process only and not durable. Used by tests, the demo binary and as
//! the reference for what a backend must guarantee.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{FabricError, Result};
use crate::intent::PersistedMethodId;
use crate::store::{MethodExecutionState, MethodStateStorage, RoutineKey, VersionedState};
use crate::types::{ETag, TaskResult};

#[derive(Debug)]
struct StoredRecord {
    version: u64,
    etag: ETag,
    state: MethodExecutionState,
}

#[derive(Debug)]
struct StoredResult {
    result: TaskResult,
    expires_at: Option<Instant>,
}

impl StoredResult {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    records: RwLock<HashMap<RoutineKey, StoredRecord>>,
    results: RwLock<HashMap<RoutineKey, StoredResult>>,
}

fn poison_err<T>(_: PoisonError<T>) -> FabricError {
    FabricError::transient("state storage lock poisoned")
}

/// Version first so ETags order by write; the digest ties the tag to content.
fn make_etag(version: u64, state: &MethodExecutionState) -> Result<ETag> {
    let bytes = serde_json::to_vec(state)?;
    let digest = Sha256::digest(&bytes);
    Ok(ETag::new(format!(
        "{version:016x}-{}",
        hex::encode(&digest[..4])
    )))
}

impl InMemoryStateStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poison_err)?.len())
    }

    /// Number of successful writes to `key`.
    pub fn version(&self, key: &RoutineKey) -> Result<Option<u64>> {
        Ok(self
            .records
            .read()
            .map_err(poison_err)?
            .get(key)
            .map(|r| r.version))
    }
}

#[async_trait]
impl MethodStateStorage for InMemoryStateStorage {
    async fn write_state(
        &self,
        id: &PersistedMethodId,
        state: MethodExecutionState,
    ) -> Result<ETag> {
        let key = RoutineKey::from(id);
        let mut records = self.records.write().map_err(poison_err)?;
        let current = records.get(&key);

        let actual = current.map(|r| r.etag.clone());
        if actual != id.etag {
            tracing::debug!(
                key = %key,
                expected = ?id.etag,
                actual = ?actual,
                "State write rejected: stale precondition"
            );
            return Err(FabricError::ETagMismatch {
                key: key.to_string(),
                expected: id.etag.clone(),
                actual,
            });
        }

        let version = current.map_or(1, |r| r.version + 1);
        let etag = make_etag(version, &state)?;
        records.insert(
            key,
            StoredRecord {
                version,
                etag: etag.clone(),
                state,
            },
        );
        Ok(etag)
    }

    async fn read_state(&self, key: &RoutineKey) -> Result<VersionedState> {
        match self.try_read_state(key).await? {
            Some(v) if v.state.is_paused() => Ok(v),
            _ => Err(FabricError::StateNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn try_read_state(&self, key: &RoutineKey) -> Result<Option<VersionedState>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.get(key).map(|r| VersionedState {
            state: r.state.clone(),
            etag: r.etag.clone(),
        }))
    }

    async fn write_result(
        &self,
        key: &RoutineKey,
        result: TaskResult,
        ttl: Option<Duration>,
    ) -> Result<TaskResult> {
        let now = Instant::now();
        let mut results = self.results.write().map_err(poison_err)?;
        // Expired results stay behind as tombstones.
        if let Some(existing) = results.get(key) {
            return Ok(existing.result.clone());
        }
        results.insert(
            key.clone(),
            StoredResult {
                result: result.clone(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(result)
    }

    async fn try_read_result(&self, key: &RoutineKey) -> Result<Option<TaskResult>> {
        let now = Instant::now();
        let results = self.results.read().map_err(poison_err)?;
        Ok(results
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.result.clone()))
    }

    async fn acknowledge_outbox(&self, key: &RoutineKey, etag: &ETag) -> Result<bool> {
        let mut records = self.records.write().map_err(poison_err)?;
        match records.get_mut(key) {
            Some(record) if &record.etag == etag => {
                record.state.outbox.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
