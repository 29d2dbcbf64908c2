//! Routine engine: the process-level glue.
//!
//! Callers enter through [`RoutineEngine::invoke`], which picks a run mode
//! per call. Backends deliver work through [`MessageHandler::handle`]; every
//! delivery runs at most one transition and commits it. A delivery that
//! finds its work already persisted re-dispatches the stored outbox and is
//! acknowledged without running the routine again.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::committer::{CommitOptions, CommitReport, TransitionCommitter};
use crate::communicator::{
    Communicator, FabricCommunicator, InvokeOutcome, InvokePreferences,
};
use crate::config::FabricConfig;
use crate::connector::{ActiveRoutineInfo, FabricConnector, FabricMessage, MessageHandler};
use crate::dispatcher::IntentDispatcher;
use crate::error::{FabricError, Result};
use crate::events::{EventDispatcher, LocalRoutineHost};
use crate::intent::{ContinueRoutineIntent, ExecuteRoutineIntent, RaiseEventIntent, SubscribeToEventIntent};
use crate::monitor::{TransitionEntry, TransitionMonitor, TransitionRequest};
use crate::notifier::{RoutineCompletionNotifier, WaitOutcome};
use crate::registry::{CommunicatorRegistry, ServiceRegistry};
use crate::routine::{ErasedRoutine, RoutineRegistry};
use crate::run_mode::{decide_run_mode, RunMode, RunModeInput};
use crate::settings::SettingsResolver;
use crate::store::{MethodStateStorage, RoutineKey, VersionedState};
use crate::types::{
    routine_key, CallerDescriptor, EventDescriptor, EventSubscriberDescriptor, FlowContext,
    IntentId, MethodId, RoutineStatus, ServiceCategory, ServiceId,
};
use crate::when_all::{WhenAllAggregator, WHEN_ALL_SERVICE};

// ─── Invocation options ───────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct InvokeOptions {
    /// Derive the intent id from this key so retried calls collapse into one.
    pub idempotency_key: Option<String>,
    pub caller: Option<CallerDescriptor>,
    /// Block for the result where the run mode allows it.
    pub prefer_sync: bool,
    pub flow_context: FlowContext,
    /// Wait this long for a dispatched call. Capped by the long-poll maximum.
    pub wait: Option<Duration>,
}

impl InvokeOptions {
    pub fn idempotent(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn sync() -> Self {
        Self {
            prefer_sync: true,
            ..Self::default()
        }
    }
}

// ─── Builder ──────────────────────────────────────────────────

pub struct EngineBuilder {
    config: FabricConfig,
    services: Option<ServiceRegistry>,
    routines: RoutineRegistry,
    storage: Option<Arc<dyn MethodStateStorage>>,
    connector: Option<Arc<dyn FabricConnector>>,
    communicators: Vec<(String, Arc<dyn Communicator>)>,
}

impl EngineBuilder {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            config,
            services: None,
            routines: RoutineRegistry::new(),
            storage: None,
            connector: None,
            communicators: Vec::new(),
        }
    }

    /// Use this registry instead of the one described by the configuration.
    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = Some(services);
        self
    }

    pub fn routines(mut self, routines: RoutineRegistry) -> Self {
        self.routines = routines;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn MethodStateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn FabricConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn communicator(mut self, name: impl Into<String>, communicator: Arc<dyn Communicator>) -> Self {
        self.communicators.push((name.into(), communicator));
        self
    }

    pub fn build(self) -> Result<Arc<RoutineEngine>> {
        let storage = self
            .storage
            .ok_or_else(|| FabricError::configuration("engine needs a state storage"))?;
        let connector = self
            .connector
            .ok_or_else(|| FabricError::configuration("engine needs a fabric connector"))?;
        let mut services = match self.services {
            Some(services) => services,
            None => self
                .config
                .service_registry()
                .map_err(|e| FabricError::configuration(format!("{e:#}")))?,
        };

        for service in self.routines.services() {
            if services.category(&service).ok() == Some(ServiceCategory::External) {
                return Err(FabricError::configuration(format!(
                    "service {service} hosts routines here but is defined external"
                )));
            }
            services.ensure_local(&service);
        }
        services.ensure_local(&ServiceId::new(WHEN_ALL_SERVICE));

        let mut registry = CommunicatorRegistry::builder().communicator(
            FabricCommunicator::NAME,
            Arc::new(FabricCommunicator::new(Arc::clone(&connector))),
        );
        for (name, communicator) in self.communicators {
            registry = registry.communicator(name, communicator);
        }
        let communicators = Arc::new(
            registry
                .routes_from(&services)
                .default_route(FabricCommunicator::NAME)
                .build()?,
        );

        let runtime = &self.config.runtime;
        let dispatch_retry = runtime.dispatch_retry.policy();
        let notifier = Arc::new(RoutineCompletionNotifier::new(
            runtime.long_poll_max(),
            runtime.poll_interval(),
        ));
        // Deliveries outlive the acknowledged outbox, so they retry until done.
        let events = Arc::new(EventDispatcher::new(
            Arc::clone(&connector),
            runtime.redelivery.policy(),
        ));
        let dispatcher = Arc::new(IntentDispatcher::new(
            Arc::clone(&communicators),
            Arc::clone(&connector),
            Arc::clone(&events),
            dispatch_retry,
        ));
        let committer = Arc::new(TransitionCommitter::new(
            Arc::clone(&storage),
            dispatcher,
            Arc::clone(&notifier),
            runtime.result_ttl(),
        ));
        let aggregator = WhenAllAggregator::new(
            Arc::clone(&storage),
            Arc::clone(&committer),
            runtime.conflict_retry_limit,
        );

        tracing::info!(
            routines = self.routines.len(),
            services = services.definitions().count(),
            connector = connector.name(),
            "Routine engine built"
        );

        let engine = Arc::new(RoutineEngine {
            settings: SettingsResolver::new(self.config.communication.clone()),
            conflict_retry_limit: runtime.conflict_retry_limit.max(1),
            services,
            routines: self.routines,
            communicators,
            storage,
            events: Arc::clone(&events),
            committer,
            notifier,
            aggregator,
        });
        let host: Weak<dyn LocalRoutineHost> = Arc::downgrade(&engine) as Weak<dyn LocalRoutineHost>;
        events.bind_host(host)?;
        Ok(engine)
    }
}

// ─── Engine ───────────────────────────────────────────────────

pub struct RoutineEngine {
    services: ServiceRegistry,
    routines: RoutineRegistry,
    settings: SettingsResolver,
    communicators: Arc<CommunicatorRegistry>,
    storage: Arc<dyn MethodStateStorage>,
    events: Arc<EventDispatcher>,
    committer: Arc<TransitionCommitter>,
    notifier: Arc<RoutineCompletionNotifier>,
    aggregator: WhenAllAggregator,
    conflict_retry_limit: u32,
}

impl RoutineEngine {
    pub fn builder(config: FabricConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Delivery target to bind to the connector after construction.
    pub fn message_handler(self: &Arc<Self>) -> Weak<dyn MessageHandler> {
        Arc::downgrade(self) as Weak<dyn MessageHandler>
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn storage(&self) -> &Arc<dyn MethodStateStorage> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn notifier(&self) -> &Arc<RoutineCompletionNotifier> {
        &self.notifier
    }

    /// The run mode `invoke` would choose for this call.
    pub fn run_mode(
        &self,
        service: &ServiceId,
        method: &MethodId,
        prefer_sync: bool,
    ) -> Result<(RunMode, Arc<dyn Communicator>)> {
        let category = self.services.category(service)?;
        let kind = self.services.kind_of(service, method)?;
        let settings = self.settings.method_settings(service, category, kind, method);
        let communicator = self.communicators.resolve(service, method)?;
        let mode = decide_run_mode(RunModeInput {
            settings: &settings,
            category,
            hosted_locally: self.routines.contains(service, method),
            traits: communicator.traits(),
            prefer_sync,
        });
        Ok((mode, communicator))
    }

    /// Call `service.method`. Depending on configuration the routine runs in
    /// this process, is dispatched and awaited, or is dispatched and reported
    /// as scheduled.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        parameters: Value,
        options: InvokeOptions,
    ) -> Result<InvokeOutcome> {
        let service = ServiceId::new(service);
        let method = MethodId::new(method);
        let id = match &options.idempotency_key {
            Some(key) => IntentId::from_idempotency_key(&service, &method, key),
            None => IntentId::generate(),
        };
        let intent = ExecuteRoutineIntent {
            id,
            service,
            method,
            parameters,
            caller: options.caller.clone(),
            continuation: None,
            flow_context: options.flow_context.clone(),
        };

        let (mode, communicator) =
            self.run_mode(&intent.service, &intent.method, options.prefer_sync)?;
        tracing::debug!(
            intent_id = %intent.id,
            service = %intent.service,
            method = %intent.method,
            mode = mode.as_str(),
            communicator = communicator.name(),
            "Invoking routine"
        );

        match mode {
            RunMode::InPlace { lease } => {
                self.invoke_in_place(&intent, lease, communicator, &options)
                    .await
            }
            RunMode::DispatchSync => {
                communicator
                    .invoke(&intent, &InvokePreferences { synchronous: true })
                    .await
            }
            RunMode::DispatchScheduled => {
                let wait = self.wait_for(&options);
                let sink = match wait {
                    Some(_) => Some(self.notifier.register(intent.id)?),
                    None => None,
                };
                let outcome = communicator
                    .invoke(&intent, &InvokePreferences::default())
                    .await?;
                match (sink, wait, outcome.info().cloned()) {
                    (Some(sink), Some(wait), Some(info)) => {
                        self.await_outcome(sink, wait, info, communicator, outcome)
                            .await
                    }
                    _ => Ok(outcome),
                }
            }
        }
    }

    fn wait_for(&self, options: &InvokeOptions) -> Option<Duration> {
        match options.wait {
            Some(wait) => Some(wait),
            None if options.prefer_sync => Some(self.notifier.max_wait()),
            None => None,
        }
    }

    async fn await_outcome(
        &self,
        sink: crate::notifier::CompletionSink,
        wait: Duration,
        info: ActiveRoutineInfo,
        communicator: Arc<dyn Communicator>,
        pending: InvokeOutcome,
    ) -> Result<InvokeOutcome> {
        let poll = || {
            let info = info.clone();
            let communicator = Arc::clone(&communicator);
            async move { Ok(communicator.poll(&info).await?.result) }
        };
        match self.notifier.wait(sink, wait, poll).await? {
            WaitOutcome::Completed(result) => Ok(InvokeOutcome::Completed(result)),
            WaitOutcome::StillRunning => Ok(pending),
        }
    }

    async fn invoke_in_place(
        &self,
        intent: &ExecuteRoutineIntent,
        lease: bool,
        communicator: Arc<dyn Communicator>,
        options: &InvokeOptions,
    ) -> Result<InvokeOutcome> {
        let lease = match lease {
            true => Some(communicator.lock_on_publish(intent).await?),
            false => None,
        };
        let wait = self.wait_for(options);
        let executed = self
            .execute(
                intent,
                CommitOptions {
                    notify_on_completion: wait.is_some(),
                },
            )
            .await
            .and_then(CommitReport::require_delivery);

        if let Some(lease) = &lease {
            let settled = match &executed {
                Ok(_) => communicator.complete_lease(lease).await,
                Err(e) => {
                    tracing::warn!(
                        intent_id = %intent.id,
                        lease_id = %lease.lease_id,
                        error = %e,
                        "In-place run failed; releasing lease for redelivery"
                    );
                    communicator.release_lease(lease).await
                }
            };
            if let Err(e) = settled {
                tracing::warn!(intent_id = %intent.id, error = %e, "Lease settlement failed");
            }
        }

        let mut report = executed?;
        if let Some(result) = report.result {
            return Ok(InvokeOutcome::Completed(result));
        }

        let info = ActiveRoutineInfo::for_intent(
            intent,
            routine_key(&intent.service, &intent.method, &intent.id),
        );
        let pending = InvokeOutcome::Scheduled(info.clone());
        let Some(wait) = wait else {
            return Ok(pending);
        };
        // Registered before the outbox went out, unless this was a replay.
        let own = report.sinks.iter().position(|s| s.intent_id() == intent.id);
        let sink = match own {
            Some(index) => report.sinks.swap_remove(index),
            None => self.notifier.register(intent.id)?,
        };
        self.await_outcome(sink, wait, info, communicator, pending)
            .await
    }

    /// Current view of a routine started through `invoke`.
    pub async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
        self.communicators
            .resolve(&info.service, &info.method)?
            .poll(info)
            .await
    }

    /// Register an event subscription outside of any routine.
    pub async fn subscribe(&self, intent: &SubscribeToEventIntent) -> Result<bool> {
        self.events.subscribe(intent).await
    }

    fn routine(&self, service: &ServiceId, method: &MethodId) -> Result<Arc<dyn ErasedRoutine>> {
        self.routines.get(service, method).ok_or_else(|| {
            FabricError::configuration(format!("no routine registered for {service}.{method}"))
        })
    }

    // ─── Delivery handling ────────────────────────────────────

    /// Run the first transition of `intent`, or re-dispatch the outbox if it
    /// already ran.
    pub async fn execute(
        &self,
        intent: &ExecuteRoutineIntent,
        options: CommitOptions,
    ) -> Result<CommitReport> {
        if WhenAllAggregator::is_aggregator(&intent.service) {
            return self.aggregator.start(intent).await;
        }
        let key = RoutineKey::new(intent.service.clone(), intent.method.clone(), intent.id);
        let routine = self.routine(&intent.service, &intent.method)?;

        for attempt in 0..self.conflict_retry_limit {
            if self.storage.try_read_state(&key).await?.is_some() {
                tracing::debug!(key = %key, "Execute redelivered; replaying outbox");
                return self.committer.redeliver_outbox(&key).await;
            }
            let outcome = TransitionMonitor::new(Arc::clone(&routine)).run(TransitionRequest::start(intent))?;
            match self.committer.commit(outcome.actions, options).await {
                Err(e) if e.is_conflict() => {
                    tracing::debug!(key = %key, attempt, "Start raced another delivery");
                }
                other => return other,
            }
        }
        Err(FabricError::transient(format!(
            "{key} still conflicting after {} attempts",
            self.conflict_retry_limit
        )))
    }

    /// Resume a paused routine. Returns `None` when the continuation targets
    /// nothing that exists.
    pub async fn handle_continue(&self, intent: &ContinueRoutineIntent) -> Result<Option<CommitReport>> {
        let target = &intent.continuation;
        if WhenAllAggregator::is_aggregator(&target.service) {
            return self.aggregator.on_child(intent).await;
        }
        let key = RoutineKey::new(
            target.service.clone(),
            target.routine.method.clone(),
            target.routine.intent_id,
        );
        let routine = self.routine(&key.service, &key.method)?;

        for attempt in 0..self.conflict_retry_limit {
            let Some(record) = self.storage.try_read_state(&key).await? else {
                tracing::warn!(key = %key, intent_id = %intent.id, "Continuation for unknown routine dropped");
                return Ok(None);
            };
            if let Some(reason) = stale_reason(intent, &record) {
                tracing::debug!(
                    key = %key,
                    intent_id = %intent.id,
                    task_id = target.task_id,
                    reason,
                    "Stale continuation; replaying outbox and dropping"
                );
                return self.committer.redeliver_outbox(&key).await.map(Some);
            }

            let VersionedState { state, etag } = record;
            let Some(snapshot) = state.routine else {
                return Err(FabricError::Routine {
                    routine: key.to_string(),
                    message: "paused record has no snapshot".to_string(),
                });
            };
            let request = TransitionRequest {
                service: key.service.clone(),
                method: key.method.clone(),
                intent_id: key.intent_id,
                etag: Some(etag),
                entry: TransitionEntry::Resume {
                    snapshot,
                    result: intent.result.clone(),
                },
                caller: state.caller,
                continuation: state.continuation,
                flow_context: state.flow_context,
                service_state: state.service_state,
            };
            let outcome = TransitionMonitor::new(Arc::clone(&routine)).run(request)?;
            match self.committer.commit(outcome.actions, CommitOptions::default()).await {
                Err(e) if e.is_conflict() => {
                    tracing::debug!(key = %key, attempt, "Resume lost an ETag race; re-reading");
                }
                other => return other.map(Some),
            }
        }
        Err(FabricError::transient(format!(
            "{key} still conflicting after {} attempts",
            self.conflict_retry_limit
        )))
    }

    /// Start the subscriber's handler routine for one published event.
    pub async fn handle_event(
        &self,
        intent: RaiseEventIntent,
        subscriber: EventSubscriberDescriptor,
    ) -> Result<CommitReport> {
        let name = format!("{}.{}", subscriber.service, subscriber.method);
        let execute = ExecuteRoutineIntent {
            id: IntentId::derive_named(&intent.id, &name),
            service: subscriber.service,
            method: subscriber.method,
            parameters: intent.payload,
            caller: intent.caller,
            continuation: None,
            flow_context: intent.flow_context,
        };
        self.execute(&execute, CommitOptions::default()).await
    }
}

fn stale_reason(intent: &ContinueRoutineIntent, record: &VersionedState) -> Option<&'static str> {
    if record.state.status == RoutineStatus::Complete {
        return Some("routine complete");
    }
    if !record.state.is_paused() {
        return Some("routine not paused");
    }
    if intent.target_etag().is_some_and(|etag| etag != &record.etag) {
        return Some("etag moved on");
    }
    let awaiting = record.state.routine.as_ref().and_then(|s| s.awaiting.task_id());
    if awaiting != Some(intent.continuation.task_id) {
        return Some("task id not awaited");
    }
    None
}

#[async_trait]
impl MessageHandler for RoutineEngine {
    async fn handle(&self, message: FabricMessage) -> Result<()> {
        let report = match message {
            FabricMessage::Execute(intent) => {
                Some(self.execute(&intent, CommitOptions::default()).await?)
            }
            FabricMessage::Continue(intent) => self.handle_continue(&intent).await?,
            FabricMessage::Event { intent, subscriber } => {
                Some(self.handle_event(intent, subscriber).await?)
            }
        };
        // Undelivered intents fail the message so the backend redelivers it.
        match report {
            Some(report) => report.require_delivery().map(|_| ()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LocalRoutineHost for RoutineEngine {
    fn runs_in_place(&self, event: &EventDescriptor, subscriber: &EventSubscriberDescriptor) -> bool {
        if !self.routines.contains(&subscriber.service, &subscriber.method) {
            return false;
        }
        let category = self
            .services
            .category(&event.service)
            .unwrap_or(ServiceCategory::External);
        self.settings
            .event_settings(&event.service, category, &event.event)
            .run_in_place
    }

    async fn run_event(
        &self,
        intent: RaiseEventIntent,
        subscriber: EventSubscriberDescriptor,
    ) -> Result<()> {
        self.handle_event(intent, subscriber)
            .await?
            .require_delivery()
            .map(|_| ())
    }
}
