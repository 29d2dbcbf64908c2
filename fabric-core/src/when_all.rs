//! Built-in fan-out/fan-in aggregator.
//!
//! A routine awaiting N calls at once produces one synthetic execute intent
//! addressed at [`WHEN_ALL_SERVICE`]. Its first checkpoint persists N empty
//! slots and dispatches the children; each child continues back at its own
//! position. Marks are serialized per aggregation and applied with an ETag
//! compare-and-swap, so duplicate and out-of-order completions are harmless.
//! The last mark composes one result and continues the parent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::committer::{CommitOptions, CommitReport, TransitionCommitter};
use crate::error::{FabricError, Result};
use crate::intent::{
    ContinueRoutineIntent, ExecuteRoutineIntent, PersistedMethodId, SaveStateIntent,
    ScheduledActions,
};
use crate::store::{MethodStateStorage, RoutineKey, VersionedState};
use crate::types::{
    ContinuationDescriptor, ExceptionInfo, IntentId, MethodId, RoutineStatus, ServiceId,
    TaskResult, CANCELED_FAULT,
};

pub const WHEN_ALL_SERVICE: &str = "fabric.when_all";
pub const WHEN_ALL_METHOD: &str = "WhenAll";

/// Parameters of the synthetic aggregator intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WhenAllRequest {
    pub children: Vec<ExecuteRoutineIntent>,
}

/// One slot per child, filled by position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationState {
    pub results: Vec<Option<TaskResult>>,
}

impl AggregationState {
    pub fn new(count: usize) -> Self {
        Self {
            results: vec![None; count],
        }
    }

    /// Record the result at `index`. Returns `false` if the slot was already
    /// filled or does not exist.
    pub fn mark(&mut self, index: usize, result: TaskResult) -> bool {
        match self.results.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(result);
                true
            }
            _ => false,
        }
    }

    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Positions of children that reported cancellation.
    pub fn canceled_positions(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().is_some_and(TaskResult::is_canceled))
            .map(|(position, _)| position)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    /// The composed result once every slot is filled.
    pub fn compose(&self) -> Option<TaskResult> {
        let results: Option<Vec<TaskResult>> = self.results.iter().cloned().collect();
        results.map(|r| compose_results(&r))
    }
}

/// Ordered array of values when all succeeded. Otherwise an aggregate fault
/// listing every faulted or canceled child by position, or plain
/// cancellation when nothing faulted. [`AggregationState::canceled_positions`]
/// names the children behind a plain cancellation.
pub fn compose_results(results: &[TaskResult]) -> TaskResult {
    if results.iter().all(TaskResult::is_succeeded) {
        let values = results
            .iter()
            .filter_map(|r| r.value().cloned())
            .collect();
        return TaskResult::Succeeded(Value::Array(values));
    }
    if !results.iter().any(TaskResult::is_faulted) {
        return TaskResult::Canceled;
    }

    let inner: Vec<ExceptionInfo> = results
        .iter()
        .enumerate()
        .filter_map(|(position, result)| match result {
            TaskResult::Succeeded(_) => None,
            TaskResult::Faulted(e) => Some(e.clone().at_position(position)),
            TaskResult::Canceled => {
                Some(ExceptionInfo::new(CANCELED_FAULT, "call was canceled").at_position(position))
            }
        })
        .collect();
    TaskResult::Faulted(ExceptionInfo::aggregate(
        format!("{} of {} calls failed", inner.len(), results.len()),
        inner,
    ))
}

pub struct WhenAllAggregator {
    storage: Arc<dyn MethodStateStorage>,
    committer: Arc<TransitionCommitter>,
    locks: Mutex<HashMap<IntentId, Arc<tokio::sync::Mutex<()>>>>,
    conflict_retry_limit: u32,
}

fn poison_err<T>(_: PoisonError<T>) -> FabricError {
    FabricError::transient("aggregation lock table poisoned")
}

fn aggregation_key(id: IntentId) -> RoutineKey {
    RoutineKey::new(
        ServiceId::new(WHEN_ALL_SERVICE),
        MethodId::new(WHEN_ALL_METHOD),
        id,
    )
}

impl WhenAllAggregator {
    pub fn new(
        storage: Arc<dyn MethodStateStorage>,
        committer: Arc<TransitionCommitter>,
        conflict_retry_limit: u32,
    ) -> Self {
        Self {
            storage,
            committer,
            locks: Mutex::new(HashMap::new()),
            conflict_retry_limit: conflict_retry_limit.max(1),
        }
    }

    pub fn is_aggregator(service: &ServiceId) -> bool {
        service.name == WHEN_ALL_SERVICE
    }

    fn lock_for(&self, id: IntentId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(poison_err)?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    fn forget_lock(&self, id: &IntentId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(id);
        }
    }

    /// First checkpoint: persist empty slots and dispatch every child. A
    /// redelivered start re-dispatches the persisted outbox instead.
    pub async fn start(&self, intent: &ExecuteRoutineIntent) -> Result<CommitReport> {
        let key = aggregation_key(intent.id);
        if self.storage.try_read_state(&key).await?.is_some() {
            tracing::debug!(aggregation = %intent.id, "Aggregation already started");
            return self.committer.redeliver_outbox(&key).await;
        }

        let request: WhenAllRequest = serde_json::from_value(intent.parameters.clone())?;
        let state = AggregationState::new(request.children.len());
        // Only an empty fan-out is complete before any child ran.
        let result = state.compose();

        let mut actions = ScheduledActions::default();
        if let Some(result) = &result {
            self.push_parent_continuation(&mut actions, intent.id, intent.continuation.clone(), result);
        }
        actions.save_state = Some(SaveStateIntent {
            target: PersistedMethodId {
                service: key.service.clone(),
                method: key.method.clone(),
                intent_id: intent.id,
                etag: None,
            },
            status: if result.is_some() {
                RoutineStatus::Complete
            } else {
                RoutineStatus::Awaiting
            },
            service_state: Some(serde_json::to_value(&state)?),
            routine: None,
            result,
            caller: intent.caller.clone(),
            continuation: intent.continuation.clone(),
            flow_context: intent.flow_context.clone(),
        });
        actions.execute_routines = request.children;

        tracing::info!(
            aggregation = %intent.id,
            children = state.results.len(),
            "Fan-out started"
        );
        match self.committer.commit(actions, CommitOptions::default()).await {
            Err(e) if e.is_conflict() => self.committer.redeliver_outbox(&key).await,
            other => other,
        }
    }

    /// Mark one child done. Returns `None` when the continuation names an
    /// unknown aggregation or a position it does not have.
    pub async fn on_child(&self, intent: &ContinueRoutineIntent) -> Result<Option<CommitReport>> {
        let aggregation = intent.continuation.routine.intent_id;
        let key = aggregation_key(aggregation);
        let index = intent.continuation.task_id as usize;

        let lock = self.lock_for(aggregation)?;
        let _guard = lock.lock().await;

        for attempt in 0..self.conflict_retry_limit {
            let Some(versioned) = self.storage.try_read_state(&key).await? else {
                tracing::warn!(aggregation = %aggregation, index, "Completion for unknown aggregation dropped");
                return Ok(None);
            };
            if versioned.state.status == RoutineStatus::Complete {
                tracing::debug!(aggregation = %aggregation, index, "Aggregation already complete");
                return self.committer.redeliver_outbox(&key).await.map(Some);
            }

            let mut state = Self::decode(&key, &versioned)?;
            if index >= state.results.len() {
                tracing::warn!(
                    aggregation = %aggregation,
                    index,
                    children = state.results.len(),
                    "Completion position out of range; dropped"
                );
                return Ok(None);
            }
            if !state.mark(index, intent.result.clone()) {
                tracing::debug!(aggregation = %aggregation, index, "Duplicate child completion");
                return self.committer.redeliver_outbox(&key).await.map(Some);
            }

            let result = state.compose();
            let mut actions = ScheduledActions::default();
            if let Some(result) = &result {
                self.push_parent_continuation(
                    &mut actions,
                    aggregation,
                    versioned.state.continuation.clone(),
                    result,
                );
            }
            let record = versioned.state;
            actions.save_state = Some(SaveStateIntent {
                target: PersistedMethodId {
                    service: key.service.clone(),
                    method: key.method.clone(),
                    intent_id: aggregation,
                    etag: Some(versioned.etag),
                },
                status: if result.is_some() {
                    RoutineStatus::Complete
                } else {
                    RoutineStatus::Awaiting
                },
                service_state: Some(serde_json::to_value(&state)?),
                routine: None,
                result: result.clone(),
                caller: record.caller,
                continuation: record.continuation,
                flow_context: record.flow_context,
            });

            match self.committer.commit(actions, CommitOptions::default()).await {
                Ok(report) => {
                    tracing::debug!(
                        aggregation = %aggregation,
                        index,
                        completed = state.completed(),
                        children = state.results.len(),
                        "Child completion recorded"
                    );
                    if let Some(result) = &result {
                        tracing::info!(
                            aggregation = %aggregation,
                            succeeded = result.is_succeeded(),
                            canceled = ?state.canceled_positions(),
                            "Fan-in complete"
                        );
                        self.forget_lock(&aggregation);
                    }
                    return Ok(Some(report));
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(aggregation = %aggregation, index, attempt, "Aggregation write conflicted; re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(FabricError::transient(format!(
            "aggregation {aggregation} still conflicting after {} attempts",
            self.conflict_retry_limit
        )))
    }

    fn decode(key: &RoutineKey, versioned: &VersionedState) -> Result<AggregationState> {
        let raw = versioned
            .state
            .service_state
            .clone()
            .ok_or_else(|| FabricError::configuration(format!("aggregation {key} has no slots")))?;
        Ok(serde_json::from_value(raw)?)
    }

    fn push_parent_continuation(
        &self,
        actions: &mut ScheduledActions,
        aggregation: IntentId,
        continuation: Option<ContinuationDescriptor>,
        result: &TaskResult,
    ) {
        let Some(continuation) = continuation else {
            return;
        };
        actions.continue_routines.push(ContinueRoutineIntent {
            id: IntentId::derive_named(&aggregation, "completion"),
            continuation,
            result: result.clone(),
            caller: None,
            delay_ms: None,
        });
    }
}
