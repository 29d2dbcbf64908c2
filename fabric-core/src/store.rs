use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::intent::{Intent, PersistedMethodId, SaveStateIntent};
use crate::monitor::RoutineSnapshot;
use crate::types::{
    routine_key, CallerDescriptor, ContinuationDescriptor, ETag, FlowContext, IntentId, MethodId,
    RoutineStatus, ServiceId, TaskResult,
};

/// Address of one persisted routine record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutineKey {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
}

impl RoutineKey {
    pub fn new(service: ServiceId, method: MethodId, intent_id: IntentId) -> Self {
        Self {
            service,
            method,
            intent_id,
        }
    }
}

impl From<&PersistedMethodId> for RoutineKey {
    fn from(id: &PersistedMethodId) -> Self {
        Self::new(id.service.clone(), id.method.clone(), id.intent_id)
    }
}

impl fmt::Display for RoutineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&routine_key(&self.service, &self.method, &self.intent_id))
    }
}

/// Everything persisted for one routine at a suspension point.
///
/// `outbox` holds the dispatchable intents of the transition that produced
/// this record. It is cleared once they have all been delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodExecutionState {
    pub status: RoutineStatus,
    #[serde(default)]
    pub service_state: Option<Value>,
    #[serde(default)]
    pub routine: Option<RoutineSnapshot>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub caller: Option<CallerDescriptor>,
    #[serde(default)]
    pub continuation: Option<ContinuationDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
    #[serde(default)]
    pub outbox: Vec<Intent>,
}

impl MethodExecutionState {
    pub fn from_save(save: &SaveStateIntent, outbox: Vec<Intent>) -> Self {
        Self {
            status: save.status,
            service_state: save.service_state.clone(),
            routine: save.routine.clone(),
            result: save.result.clone(),
            caller: save.caller.clone(),
            continuation: save.continuation.clone(),
            flow_context: save.flow_context.clone(),
            outbox,
        }
    }

    /// Awaiting a continuation. Only paused records can be resumed.
    pub fn is_paused(&self) -> bool {
        self.status == RoutineStatus::Awaiting
    }
}

/// A record together with the ETag it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedState {
    pub state: MethodExecutionState,
    pub etag: ETag,
}

/// State storage contract.
///
/// Writes are conditional on an ETag. A successful write yields a new ETag
/// that orders strictly after every earlier one for the same key. A write
/// with a stale precondition changes nothing.
#[async_trait]
pub trait MethodStateStorage: Send + Sync {
    /// Conditionally replace the record. `id.etag == None` requires that no
    /// record exists yet.
    async fn write_state(&self, id: &PersistedMethodId, state: MethodExecutionState)
        -> Result<ETag>;

    /// Read a paused record. Fails with `StateNotFound` when the record is
    /// absent or not awaiting.
    async fn read_state(&self, key: &RoutineKey) -> Result<VersionedState>;

    /// Read the record in any status.
    async fn try_read_state(&self, key: &RoutineKey) -> Result<Option<VersionedState>>;

    /// Store the terminal result. The first write wins, also once its TTL
    /// has elapsed; later writes return the stored result unchanged.
    async fn write_result(
        &self,
        key: &RoutineKey,
        result: TaskResult,
        ttl: Option<Duration>,
    ) -> Result<TaskResult>;

    /// The terminal result, or `None` while the routine is running or after
    /// its TTL has elapsed.
    async fn try_read_result(&self, key: &RoutineKey) -> Result<Option<TaskResult>>;

    /// Clear the outbox written together with `etag`. Returns `false` when a
    /// later write has replaced that record. The ETag is not changed.
    async fn acknowledge_outbox(&self, key: &RoutineKey, etag: &ETag) -> Result<bool>;
}
