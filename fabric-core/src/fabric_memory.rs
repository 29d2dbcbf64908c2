//! In-memory reference connector.
//!
//! All queues share one channel drained by a worker loop that spawns one task
//! per in-flight message, bounded by a semaphore. Delayed messages sleep
//! before entering the channel. A message whose handler fails with a
//! retryable error is redelivered with backoff; anything else is
//! dead-lettered.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connector::{
    ActiveRoutineInfo, ConnectorCapabilities, FabricConnector, FabricMessage, MessageHandler,
    MessageLease, ScheduledRoutine,
};
use crate::error::{FabricError, Result};
use crate::intent::{
    ActivateTriggerIntent, ContinueRoutineIntent, ExecuteRoutineIntent, RaiseEventIntent,
    RegisterTriggerIntent, SubscribeToEventIntent, SubscribeToTriggerIntent,
};
use crate::retry::RetryPolicy;
use crate::store::MethodStateStorage;
use crate::types::{
    routine_key, ContinuationDescriptor, EventDescriptor, EventSubscriberDescriptor, IntentId,
    ServiceId, TaskResult, TriggerId,
};

/// Default number of messages processed concurrently.
pub const DEFAULT_WORKERS: usize = 16;

/// Published events and dead letters kept for inspection; older entries
/// are dropped first.
pub const DIAGNOSTIC_HISTORY: usize = 1024;

const CONNECTOR_NAME: &str = "memory";

#[derive(Debug)]
struct Envelope {
    queue: String,
    message: FabricMessage,
    attempt: u32,
}

#[derive(Debug, Default)]
struct TriggerState {
    value: Option<TaskResult>,
    waiting: Vec<ContinuationDescriptor>,
}

#[derive(Debug, Default)]
struct FabricState {
    queues: HashSet<String>,
    /// Deduplication index: intent id to routine id.
    scheduled: HashMap<IntentId, String>,
    subscriptions: HashMap<EventDescriptor, BTreeSet<EventSubscriberDescriptor>>,
    triggers: HashMap<TriggerId, TriggerState>,
    leases: HashMap<Uuid, Envelope>,
    published: VecDeque<(IntentId, EventSubscriberDescriptor)>,
    dead_letters: VecDeque<FabricMessage>,
}

fn remember<T>(history: &mut VecDeque<T>, entry: T) {
    if history.len() == DIAGNOSTIC_HISTORY {
        history.pop_front();
    }
    history.push_back(entry);
}

pub struct InMemoryFabric {
    storage: Arc<dyn MethodStateStorage>,
    state: Mutex<FabricState>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    handler: OnceLock<Weak<dyn MessageHandler>>,
    redelivery: RetryPolicy,
    workers: usize,
    in_flight: Arc<InFlight>,
}

/// Messages queued, delayed or being handled.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn poison_err<T>(_: PoisonError<T>) -> FabricError {
    FabricError::transient("in-memory fabric lock poisoned")
}

/// Physical queue for messages addressed to `service`.
pub fn queue_for(service: &ServiceId) -> String {
    format!("fabric-{}", service.name.to_lowercase())
}

impl InMemoryFabric {
    pub fn new(storage: Arc<dyn MethodStateStorage>) -> Self {
        Self::with_options(storage, DEFAULT_WORKERS, RetryPolicy::background())
    }

    pub fn with_options(
        storage: Arc<dyn MethodStateStorage>,
        workers: usize,
        redelivery: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            storage,
            state: Mutex::new(FabricState::default()),
            tx,
            rx: Mutex::new(Some(rx)),
            handler: OnceLock::new(),
            redelivery,
            workers: workers.max(1),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Second phase of construction: the handler usually owns this fabric
    /// through the engine, so it is bound after both exist.
    pub fn bind_handler(&self, handler: Weak<dyn MessageHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| FabricError::configuration("fabric message handler bound twice"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, FabricState>> {
        self.state.lock().map_err(poison_err)
    }

    /// Start the delivery loop. It runs until `shutdown` flips to `true` or
    /// every sender is gone.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .map_err(poison_err)?
            .take()
            .ok_or_else(|| FabricError::configuration("in-memory fabric already started"))?;
        let fabric = Arc::clone(self);
        let permits = Arc::new(Semaphore::new(self.workers));

        Ok(tokio::spawn(async move {
            tracing::info!(workers = fabric.workers, "In-memory fabric started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    envelope = rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                        tokio::spawn(Arc::clone(&fabric).process(envelope, permit));
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("In-memory fabric shutting down");
                        break;
                    }
                }
            }
            tracing::info!("In-memory fabric stopped");
        }))
    }

    async fn process(self: Arc<Self>, mut envelope: Envelope, _permit: OwnedSemaphorePermit) {
        let outcome = match self.handler.get().and_then(Weak::upgrade) {
            Some(handler) => handler.handle(envelope.message.clone()).await,
            None => Err(FabricError::transient("no message handler bound")),
        };

        if let Err(e) = outcome {
            envelope.attempt += 1;
            if e.is_retryable() && self.redelivery.allows(envelope.attempt) {
                let delay = self.redelivery.backoff.next(envelope.attempt - 1);
                tracing::warn!(
                    queue = %envelope.queue,
                    kind = envelope.message.kind(),
                    intent_id = %envelope.message.intent_id(),
                    attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Message handling failed; redelivering"
                );
                self.push(envelope, Some(delay));
            } else {
                tracing::error!(
                    queue = %envelope.queue,
                    kind = envelope.message.kind(),
                    intent_id = %envelope.message.intent_id(),
                    attempts = envelope.attempt,
                    error = %e,
                    "Message dead-lettered"
                );
                if let Ok(mut state) = self.lock() {
                    remember(&mut state.dead_letters, envelope.message);
                }
            }
        }
        self.in_flight.finish();
    }

    /// Count and send. Delayed envelopes stay counted while they sleep.
    fn push(&self, envelope: Envelope, delay: Option<Duration>) {
        self.in_flight.begin();
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let tx = self.tx.clone();
                let in_flight = Arc::clone(&self.in_flight);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(mpsc::error::SendError(envelope)) = tx.send(envelope) {
                        tracing::warn!(
                            queue = %envelope.queue,
                            intent_id = %envelope.message.intent_id(),
                            "Fabric stopped; delayed message dropped"
                        );
                        in_flight.finish();
                    }
                });
            }
            None => {
                if self.tx.send(envelope).is_err() {
                    self.in_flight.finish();
                }
            }
        }
    }

    fn try_enqueue(&self, envelope: Envelope, delay: Option<Duration>) -> std::result::Result<(), (FabricError, Envelope)> {
        let exists = match self.lock() {
            Ok(state) => state.queues.contains(&envelope.queue),
            Err(e) => return Err((e, envelope)),
        };
        if !exists {
            let queue = envelope.queue.clone();
            return Err((FabricError::ResourceMissing(queue), envelope));
        }
        self.push(envelope, delay);
        Ok(())
    }

    fn create_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.queues.insert(queue.to_string()) {
            tracing::info!(queue, "Created queue");
        }
        Ok(())
    }

    /// Enqueue, creating the queue on first use.
    fn enqueue(&self, service: &ServiceId, message: FabricMessage, delay: Option<Duration>) -> Result<()> {
        let envelope = Envelope {
            queue: queue_for(service),
            message,
            attempt: 0,
        };
        match self.try_enqueue(envelope, delay) {
            Ok(()) => Ok(()),
            Err((FabricError::ResourceMissing(queue), envelope)) => {
                self.create_queue(&queue)?;
                self.try_enqueue(envelope, delay).map_err(|(e, _)| e)
            }
            Err((e, _)) => Err(e),
        }
    }

    /// Wait until no message is queued, delayed or being handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|s| s.queues.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn scheduled_count(&self) -> usize {
        self.lock().map(|s| s.scheduled.len()).unwrap_or(0)
    }

    pub fn published_events(&self) -> Vec<(IntentId, EventSubscriberDescriptor)> {
        self.lock()
            .map(|s| s.published.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<FabricMessage> {
        self.lock()
            .map(|s| s.dead_letters.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn trigger_continuation(
        trigger_id: &TriggerId,
        continuation: ContinuationDescriptor,
        value: TaskResult,
    ) -> ContinueRoutineIntent {
        let name = format!("trigger:{}:{}", trigger_id, continuation.task_id);
        ContinueRoutineIntent {
            id: IntentId::derive_named(&continuation.routine.intent_id, &name),
            continuation,
            result: value,
            caller: None,
            delay_ms: None,
        }
    }
}

#[async_trait]
impl FabricConnector for InMemoryFabric {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::all()
    }

    async fn schedule_routine(&self, intent: &ExecuteRoutineIntent) -> Result<ScheduledRoutine> {
        let routine_id = routine_key(&intent.service, &intent.method, &intent.id);
        {
            let mut state = self.lock()?;
            if let Some(existing) = state.scheduled.get(&intent.id) {
                return Ok(ScheduledRoutine {
                    routine_id: existing.clone(),
                    etag: None,
                    deduplicated: true,
                });
            }
            state.scheduled.insert(intent.id, routine_id.clone());
        }

        if let Err(e) = self.enqueue(&intent.service, FabricMessage::Execute(intent.clone()), None) {
            if let Ok(mut state) = self.lock() {
                state.scheduled.remove(&intent.id);
            }
            return Err(e);
        }
        tracing::debug!(
            intent_id = %intent.id,
            service = %intent.service,
            method = %intent.method,
            "Routine scheduled"
        );
        Ok(ScheduledRoutine {
            routine_id,
            etag: None,
            deduplicated: false,
        })
    }

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
        let key = info.key();
        let mut polled = info.clone();
        polled.result = self.storage.try_read_result(&key).await?;
        if let Some(record) = self.storage.try_read_state(&key).await? {
            polled.etag = Some(record.etag);
        }
        Ok(polled)
    }

    async fn schedule_continuation(&self, intent: &ContinueRoutineIntent) -> Result<()> {
        self.enqueue(
            &intent.continuation.service,
            FabricMessage::Continue(intent.clone()),
            intent.delay(),
        )
    }

    async fn subscribe_for_event(&self, intent: &SubscribeToEventIntent) -> Result<()> {
        let mut state = self.lock()?;
        state
            .subscriptions
            .entry(intent.event.clone())
            .or_default()
            .insert(intent.subscriber.clone());
        Ok(())
    }

    async fn event_subscribers(
        &self,
        event: &EventDescriptor,
    ) -> Result<Vec<EventSubscriberDescriptor>> {
        Ok(self
            .lock()?
            .subscriptions
            .get(event)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn on_event_subscriber_added(
        &self,
        _event: &EventDescriptor,
        subscriber: &EventSubscriberDescriptor,
    ) -> Result<()> {
        self.create_queue(&queue_for(&subscriber.service))
    }

    async fn publish_event(
        &self,
        intent: &RaiseEventIntent,
        subscriber: &EventSubscriberDescriptor,
    ) -> Result<()> {
        self.lock()?
            .published
            .push_back((intent.id, subscriber.clone()));
        self.enqueue(
            &subscriber.service,
            FabricMessage::Event {
                intent: intent.clone(),
                subscriber: subscriber.clone(),
            },
            None,
        )
    }

    async fn register_trigger(&self, intent: &RegisterTriggerIntent) -> Result<()> {
        self.lock()?
            .triggers
            .entry(intent.trigger_id.clone())
            .or_default();
        Ok(())
    }

    async fn activate_trigger(&self, intent: &ActivateTriggerIntent) -> Result<()> {
        let waiting = {
            let mut state = self.lock()?;
            let trigger = state.triggers.entry(intent.trigger_id.clone()).or_default();
            if trigger.value.is_some() {
                tracing::debug!(trigger = %intent.trigger_id, "Trigger already active");
                return Ok(());
            }
            trigger.value = Some(intent.value.clone());
            std::mem::take(&mut trigger.waiting)
        };
        tracing::info!(
            trigger = %intent.trigger_id,
            waiting = waiting.len(),
            "Trigger activated"
        );
        for continuation in waiting {
            let service = continuation.service.clone();
            let resume =
                Self::trigger_continuation(&intent.trigger_id, continuation, intent.value.clone());
            self.enqueue(&service, FabricMessage::Continue(resume), None)?;
        }
        Ok(())
    }

    async fn subscribe_to_trigger(&self, intent: &SubscribeToTriggerIntent) -> Result<()> {
        let active = {
            let mut state = self.lock()?;
            let trigger = state.triggers.entry(intent.trigger_id.clone()).or_default();
            match &trigger.value {
                Some(value) => Some(value.clone()),
                None => {
                    if !trigger.waiting.contains(&intent.continuation) {
                        trigger.waiting.push(intent.continuation.clone());
                    }
                    None
                }
            }
        };
        // Level-triggered: an already active trigger resumes the subscriber now.
        if let Some(value) = active {
            let resume = Self::trigger_continuation(
                &intent.trigger_id,
                intent.continuation.clone(),
                value,
            );
            self.enqueue(&intent.continuation.service, FabricMessage::Continue(resume), None)?;
        }
        Ok(())
    }

    async fn publish_leased(&self, intent: &ExecuteRoutineIntent) -> Result<MessageLease> {
        let queue = queue_for(&intent.service);
        self.create_queue(&queue)?;
        let lease = MessageLease {
            lease_id: Uuid::now_v7(),
            intent_id: intent.id,
        };
        let mut state = self.lock()?;
        state.scheduled.insert(
            intent.id,
            routine_key(&intent.service, &intent.method, &intent.id),
        );
        state.leases.insert(
            lease.lease_id,
            Envelope {
                queue,
                message: FabricMessage::Execute(intent.clone()),
                attempt: 0,
            },
        );
        tracing::debug!(lease_id = %lease.lease_id, intent_id = %intent.id, "Message leased");
        Ok(lease)
    }

    async fn complete_lease(&self, lease: &MessageLease) -> Result<()> {
        match self.lock()?.leases.remove(&lease.lease_id) {
            Some(_) => Ok(()),
            None => Err(FabricError::ResourceMissing(format!("lease {}", lease.lease_id))),
        }
    }

    async fn release_lease(&self, lease: &MessageLease) -> Result<()> {
        let envelope = self
            .lock()?
            .leases
            .remove(&lease.lease_id)
            .ok_or_else(|| FabricError::ResourceMissing(format!("lease {}", lease.lease_id)))?;
        tracing::debug!(lease_id = %lease.lease_id, "Lease released; message requeued");
        self.push(envelope, None);
        Ok(())
    }
}
