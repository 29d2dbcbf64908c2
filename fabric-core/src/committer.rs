//! Transition committer.
//!
//! Applies one [`ScheduledActions`] batch:
//!
//! 1. `StateSaving`: write the state together with the outbox under the
//!    ETag precondition. A mismatch aborts the whole batch (`ConflictRetry`).
//! 2. Write the terminal result, if any, and push it to waiting callers.
//! 3. Register completion sinks requested by the caller, for the routine
//!    itself when it is still running and for every routine it invokes.
//! 4. `Dispatching`: deliver event subscriptions and trigger registrations,
//!    then every other intent concurrently. Failures are reported, never
//!    rolled back; the outbox stays for redelivery.
//! 5. `Committed`: all delivered, outbox acknowledged.

use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::IntentDispatcher;
use crate::error::{FabricError, Result};
use crate::intent::{stamp_outbox, Intent, ScheduledActions};
use crate::notifier::{CompletionSink, RoutineCompletionNotifier};
use crate::store::{MethodExecutionState, MethodStateStorage, RoutineKey};
use crate::types::{ETag, IntentId, TaskResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    StateSaving,
    Dispatching,
    Committed,
    ConflictRetry,
}

impl CommitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::StateSaving => "state_saving",
            Self::Dispatching => "dispatching",
            Self::Committed => "committed",
            Self::ConflictRetry => "conflict_retry",
        }
    }
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommitOptions {
    /// Before anything is dispatched, register a completion sink for the
    /// saved routine if it has not finished, then one per invoked routine.
    pub notify_on_completion: bool,
}

#[derive(Debug)]
pub struct DispatchFailure {
    pub kind: &'static str,
    pub intent_id: Option<IntentId>,
    pub error: FabricError,
}

#[derive(Debug)]
pub struct CommitReport {
    /// `Committed` when everything was delivered, `Dispatching` when some
    /// intents are still owed.
    pub phase: CommitPhase,
    pub etag: Option<ETag>,
    pub result: Option<TaskResult>,
    pub dispatched: usize,
    pub failures: Vec<DispatchFailure>,
    pub sinks: Vec<CompletionSink>,
}

impl CommitReport {
    fn empty() -> Self {
        Self {
            phase: CommitPhase::Idle,
            etag: None,
            result: None,
            dispatched: 0,
            failures: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.phase == CommitPhase::Committed
    }

    /// Turn undelivered intents into a retryable error so the triggering
    /// message is redelivered (and with it, the outbox).
    pub fn require_delivery(self) -> Result<Self> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(FabricError::transient(format!(
                "{} of {} intents undelivered; first: {} ({})",
                self.failures.len(),
                self.failures.len() + self.dispatched,
                first.kind,
                first.error
            ))),
        }
    }
}

pub struct TransitionCommitter {
    storage: Arc<dyn MethodStateStorage>,
    dispatcher: Arc<IntentDispatcher>,
    notifier: Arc<RoutineCompletionNotifier>,
    result_ttl: Option<Duration>,
}

impl TransitionCommitter {
    pub fn new(
        storage: Arc<dyn MethodStateStorage>,
        dispatcher: Arc<IntentDispatcher>,
        notifier: Arc<RoutineCompletionNotifier>,
        result_ttl: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            notifier,
            result_ttl,
        }
    }

    pub fn storage(&self) -> &Arc<dyn MethodStateStorage> {
        &self.storage
    }

    pub async fn commit(
        &self,
        mut actions: ScheduledActions,
        options: CommitOptions,
    ) -> Result<CommitReport> {
        let mut report = CommitReport::empty();
        let mut saved: Option<(RoutineKey, ETag)> = None;
        let mut unfinished: Option<IntentId> = None;

        if let Some(save) = actions.save_state.take() {
            report.phase = CommitPhase::StateSaving;
            let key = RoutineKey::from(&save.target);
            let record = MethodExecutionState::from_save(&save, actions.dispatchable());

            let etag = match self.storage.write_state(&save.target, record).await {
                Ok(etag) => etag,
                Err(e) if e.is_conflict() => {
                    tracing::warn!(
                        key = %key,
                        phase = %CommitPhase::ConflictRetry,
                        "State save conflicted; transition discarded"
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            tracing::debug!(key = %key, etag = %etag, status = %save.status, "State saved");

            actions.stamp_continuation_etag(&save.target.service, &save.target.intent_id, &etag);

            match save.result {
                Some(result) => report.result = Some(self.publish_result(&key, result).await?),
                None => unfinished = Some(save.target.intent_id),
            }
            report.etag = Some(etag.clone());
            saved = Some((key, etag));
        }

        if options.notify_on_completion {
            let invoked = actions.execute_routines.iter().map(|i| i.id);
            for intent_id in unfinished.into_iter().chain(invoked) {
                report.sinks.push(self.notifier.register(intent_id)?);
            }
        }

        let outbox = actions.dispatchable();
        self.deliver(outbox, saved, &mut report).await?;
        Ok(report)
    }

    /// Re-dispatch the outbox persisted with the record at `key`, and re-push
    /// its result if it has one. Used when a triggering intent is redelivered
    /// after its transition was already saved.
    pub async fn redeliver_outbox(&self, key: &RoutineKey) -> Result<CommitReport> {
        let mut report = CommitReport::empty();
        let Some(versioned) = self.storage.try_read_state(key).await? else {
            return Err(FabricError::StateNotFound {
                key: key.to_string(),
            });
        };
        if let Some(result) = versioned.state.result.clone() {
            report.result = Some(self.publish_result(key, result).await?);
        }
        report.etag = Some(versioned.etag.clone());

        let mut outbox = versioned.state.outbox;
        if outbox.is_empty() {
            report.phase = CommitPhase::Committed;
            return Ok(report);
        }
        tracing::info!(
            key = %key,
            etag = %versioned.etag,
            intents = outbox.len(),
            "Redelivering persisted outbox"
        );
        stamp_outbox(&mut outbox, &key.service, &key.intent_id, &versioned.etag);
        self.deliver(outbox, Some((key.clone(), versioned.etag)), &mut report)
            .await?;
        Ok(report)
    }

    async fn publish_result(&self, key: &RoutineKey, result: TaskResult) -> Result<TaskResult> {
        let stored = self
            .storage
            .write_result(key, result, self.result_ttl)
            .await?;
        self.notifier.notify(&key.intent_id, &stored);
        Ok(stored)
    }

    async fn deliver(
        &self,
        outbox: Vec<Intent>,
        saved: Option<(RoutineKey, ETag)>,
        report: &mut CommitReport,
    ) -> Result<()> {
        report.phase = CommitPhase::Dispatching;
        let (registrations, rest): (Vec<&Intent>, Vec<&Intent>) = outbox
            .iter()
            .partition(|i| matches!(i, Intent::SubscribeToEvent(_) | Intent::RegisterTrigger(_)));
        let mut outcomes =
            join_all(registrations.iter().map(|i| self.dispatcher.dispatch(i))).await;
        outcomes.extend(join_all(rest.iter().map(|i| self.dispatcher.dispatch(i))).await);

        for (intent, outcome) in registrations.iter().chain(&rest).zip(outcomes) {
            match outcome {
                Ok(()) => report.dispatched += 1,
                Err(error) => {
                    tracing::warn!(
                        kind = intent.kind(),
                        intent_id = ?intent.intent_id(),
                        error = %error,
                        "Intent dispatch failed; left in outbox"
                    );
                    report.failures.push(DispatchFailure {
                        kind: intent.kind(),
                        intent_id: intent.intent_id(),
                        error,
                    });
                }
            }
        }

        if report.failures.is_empty() {
            if let Some((key, etag)) = saved {
                if !outbox.is_empty() {
                    self.storage.acknowledge_outbox(&key, &etag).await?;
                }
            }
            report.phase = CommitPhase::Committed;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::FabricCommunicator;
    use crate::connector::{
        ActiveRoutineInfo, ConnectorCapabilities, FabricConnector, ScheduledRoutine,
    };
    use crate::events::EventDispatcher;
    use crate::intent::{
        ContinueRoutineIntent, ExecuteRoutineIntent, PersistedMethodId, RegisterTriggerIntent,
        SaveStateIntent,
    };
    use crate::registry::CommunicatorRegistry;
    use crate::retry::RetryPolicy;
    use crate::store_memory::InMemoryStateStorage;
    use crate::types::{FlowContext, MethodId, RoutineStatus, ServiceId, TriggerId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Schedules into a list, or refuses everything while `down`. Trigger
    /// registration yields before it lands.
    #[derive(Default)]
    struct Outage {
        down: AtomicBool,
        scheduled: Mutex<Vec<IntentId>>,
        order: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl FabricConnector for Outage {
        fn name(&self) -> &str {
            "outage"
        }

        fn capabilities(&self) -> ConnectorCapabilities {
            ConnectorCapabilities::default()
        }

        async fn schedule_routine(&self, intent: &ExecuteRoutineIntent) -> Result<ScheduledRoutine> {
            if self.down.load(Ordering::SeqCst) {
                return Err(FabricError::transient("broker unreachable"));
            }
            self.scheduled.lock().unwrap().push(intent.id);
            self.order.lock().unwrap().push("execute");
            Ok(ScheduledRoutine {
                routine_id: intent.id.to_string(),
                etag: None,
                deduplicated: false,
            })
        }

        async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
            Ok(info.clone())
        }

        async fn schedule_continuation(&self, _intent: &ContinueRoutineIntent) -> Result<()> {
            Ok(())
        }

        async fn register_trigger(&self, _intent: &RegisterTriggerIntent) -> Result<()> {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.order.lock().unwrap().push("register_trigger");
            Ok(())
        }
    }

    struct Fixture {
        storage: Arc<InMemoryStateStorage>,
        connector: Arc<Outage>,
        notifier: Arc<RoutineCompletionNotifier>,
        committer: TransitionCommitter,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStateStorage::new());
        let connector = Arc::new(Outage::default());
        let communicators = CommunicatorRegistry::builder()
            .communicator(
                FabricCommunicator::NAME,
                Arc::new(FabricCommunicator::new(connector.clone())),
            )
            .default_route(FabricCommunicator::NAME)
            .build()
            .unwrap();
        let events = Arc::new(EventDispatcher::new(connector.clone(), RetryPolicy::no_retry()));
        let dispatcher = Arc::new(IntentDispatcher::new(
            Arc::new(communicators),
            connector.clone(),
            events,
            RetryPolicy::no_retry(),
        ));
        let notifier = Arc::new(RoutineCompletionNotifier::default());
        Fixture {
            storage: storage.clone(),
            connector,
            notifier: notifier.clone(),
            committer: TransitionCommitter::new(storage, dispatcher, notifier, None),
        }
    }

    fn order_key(id: IntentId) -> RoutineKey {
        RoutineKey::new(ServiceId::new("shop"), MethodId::new("Checkout"), id)
    }

    fn quote(n: u64) -> ExecuteRoutineIntent {
        ExecuteRoutineIntent {
            id: IntentId::generate(),
            service: ServiceId::new("pricing"),
            method: MethodId::new("Quote"),
            parameters: json!({ "sku": n }),
            caller: None,
            continuation: None,
            flow_context: FlowContext::new(),
        }
    }

    fn checkpoint(id: IntentId, etag: Option<ETag>, result: Option<TaskResult>) -> ScheduledActions {
        ScheduledActions {
            save_state: Some(SaveStateIntent {
                target: PersistedMethodId {
                    service: ServiceId::new("shop"),
                    method: MethodId::new("Checkout"),
                    intent_id: id,
                    etag,
                },
                status: if result.is_some() {
                    RoutineStatus::Complete
                } else {
                    RoutineStatus::Awaiting
                },
                service_state: None,
                routine: None,
                result,
                caller: None,
                continuation: None,
                flow_context: FlowContext::new(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivered_batch_is_committed_and_outbox_cleared() {
        let f = fixture();
        let id = IntentId::generate();
        let mut actions = checkpoint(id, None, None);
        actions.execute_routines = vec![quote(1), quote(2)];

        let report = f.committer.commit(actions, CommitOptions::default()).await.unwrap();
        assert_eq!(report.phase, CommitPhase::Committed);
        assert_eq!(report.dispatched, 2);
        assert!(report.failures.is_empty());
        assert!(report.sinks.is_empty());

        let stored = f.storage.try_read_state(&order_key(id)).await.unwrap().unwrap();
        assert_eq!(Some(stored.etag), report.etag);
        assert!(stored.state.outbox.is_empty());
        assert_eq!(f.connector.scheduled.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_etag_dispatches_nothing() {
        let f = fixture();
        let id = IntentId::generate();
        f.committer
            .commit(checkpoint(id, None, None), CommitOptions::default())
            .await
            .unwrap();

        let mut stale = checkpoint(id, None, None);
        stale.execute_routines = vec![quote(3)];
        let err = f.committer.commit(stale, CommitOptions::default()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(f.connector.scheduled.lock().unwrap().is_empty());
        assert_eq!(f.storage.version(&order_key(id)).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn undelivered_intents_wait_in_the_outbox() {
        let f = fixture();
        f.connector.down.store(true, Ordering::SeqCst);
        let id = IntentId::generate();
        let mut actions = checkpoint(id, None, None);
        actions.execute_routines = vec![quote(4)];

        let report = f.committer.commit(actions, CommitOptions::default()).await.unwrap();
        assert_eq!(report.phase, CommitPhase::Dispatching);
        assert_eq!(report.failures.len(), 1);
        let stored = f.storage.try_read_state(&order_key(id)).await.unwrap().unwrap();
        assert_eq!(stored.state.outbox.len(), 1);
        assert!(report.require_delivery().unwrap_err().is_retryable());

        f.connector.down.store(false, Ordering::SeqCst);
        let replay = f.committer.redeliver_outbox(&order_key(id)).await.unwrap();
        assert!(replay.is_committed());
        assert_eq!(replay.dispatched, 1);
        let stored = f.storage.try_read_state(&order_key(id)).await.unwrap().unwrap();
        assert!(stored.state.outbox.is_empty());
        assert_eq!(f.connector.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sinks_cover_the_unfinished_routine_and_its_calls() {
        let f = fixture();
        let id = IntentId::generate();
        let child = quote(5);
        let mut actions = checkpoint(id, None, None);
        actions.execute_routines = vec![child.clone()];

        let report = f
            .committer
            .commit(actions, CommitOptions { notify_on_completion: true })
            .await
            .unwrap();
        let ids: Vec<IntentId> = report.sinks.iter().map(CompletionSink::intent_id).collect();
        assert_eq!(ids, vec![id, child.id]);
        assert_eq!(f.notifier.pending(), 2);

        let finished = f
            .committer
            .commit(
                checkpoint(id, report.etag.clone(), Some(TaskResult::success(json!("ok")))),
                CommitOptions { notify_on_completion: true },
            )
            .await
            .unwrap();
        assert!(finished.sinks.is_empty());
        assert_eq!(finished.result, Some(TaskResult::success(json!("ok"))));
        // The earlier sink for the routine was resolved by the result.
        assert_eq!(f.notifier.pending(), 1);
    }

    #[tokio::test]
    async fn registrations_land_before_the_rest_of_the_batch() {
        let f = fixture();
        let mut actions = checkpoint(IntentId::generate(), None, None);
        actions.execute_routines = vec![quote(6)];
        actions.register_triggers = vec![RegisterTriggerIntent {
            trigger_id: TriggerId("stock-ready".into()),
        }];

        let report = f.committer.commit(actions, CommitOptions::default()).await.unwrap();
        assert!(report.is_committed());
        assert_eq!(
            *f.connector.order.lock().unwrap(),
            vec!["register_trigger", "execute"]
        );
    }
}
