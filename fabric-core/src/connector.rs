//! Connector contract: the durable scheduling, polling, eventing and trigger
//! primitives a storage+messaging backend provides to the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::intent::{
    ActivateTriggerIntent, ContinueRoutineIntent, ExecuteRoutineIntent, RaiseEventIntent,
    RegisterTriggerIntent, SubscribeToEventIntent, SubscribeToTriggerIntent,
};
use crate::store::RoutineKey;
use crate::types::{
    ETag, EventDescriptor, EventSubscriberDescriptor, IntentId, MethodId, ServiceId, TaskResult,
};

/// A routine that has been handed to a backend. `result` is populated once
/// it completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveRoutineInfo {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
    pub routine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl ActiveRoutineInfo {
    pub fn for_intent(intent: &ExecuteRoutineIntent, routine_id: impl Into<String>) -> Self {
        Self {
            service: intent.service.clone(),
            method: intent.method.clone(),
            intent_id: intent.id,
            routine_id: routine_id.into(),
            etag: None,
            result: None,
        }
    }

    pub fn key(&self) -> RoutineKey {
        RoutineKey::new(self.service.clone(), self.method.clone(), self.intent_id)
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledRoutine {
    pub routine_id: String,
    pub etag: Option<ETag>,
    /// The intent id had already been scheduled; nothing new was created.
    pub deduplicated: bool,
}

/// What a connector can do beyond scheduling, polling and continuation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectorCapabilities {
    pub deduplication: bool,
    pub delayed_messages: bool,
    pub leases: bool,
    pub events: bool,
    pub triggers: bool,
}

impl ConnectorCapabilities {
    pub fn all() -> Self {
        Self {
            deduplication: true,
            delayed_messages: true,
            leases: true,
            events: true,
            triggers: true,
        }
    }
}

/// A queued call held invisible on behalf of an in-place execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageLease {
    pub lease_id: Uuid,
    pub intent_id: IntentId,
}

/// A unit of work delivered by a backend to the process hosting its target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FabricMessage {
    Execute(ExecuteRoutineIntent),
    Continue(ContinueRoutineIntent),
    Event {
        intent: RaiseEventIntent,
        subscriber: EventSubscriberDescriptor,
    },
}

impl FabricMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::Continue(_) => "continue",
            Self::Event { .. } => "event",
        }
    }

    pub fn intent_id(&self) -> IntentId {
        match self {
            Self::Execute(i) => i.id,
            Self::Continue(i) => i.id,
            Self::Event { intent, .. } => intent.id,
        }
    }

    /// Service the message is delivered to.
    pub fn target(&self) -> &ServiceId {
        match self {
            Self::Execute(i) => &i.service,
            Self::Continue(i) => &i.continuation.service,
            Self::Event { subscriber, .. } => &subscriber.service,
        }
    }
}

/// Receives messages from a connector. Implemented by the engine.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// An `Err` asks the connector to redeliver later.
    async fn handle(&self, message: FabricMessage) -> Result<()>;
}

/// Storage+messaging backend contract.
///
/// Implementations create missing physical resources (queues, tables) lazily
/// on first use. Optional operations default to `Unsupported`; callers check
/// [`FabricConnector::capabilities`] first.
#[async_trait]
pub trait FabricConnector: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ConnectorCapabilities;

    async fn schedule_routine(&self, intent: &ExecuteRoutineIntent) -> Result<ScheduledRoutine>;

    async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo>;

    async fn schedule_continuation(&self, intent: &ContinueRoutineIntent) -> Result<()>;

    async fn subscribe_for_event(&self, _intent: &SubscribeToEventIntent) -> Result<()> {
        Err(self.unsupported("subscribe_for_event"))
    }

    async fn on_event_subscriber_added(
        &self,
        _event: &EventDescriptor,
        _subscriber: &EventSubscriberDescriptor,
    ) -> Result<()> {
        Ok(())
    }

    /// Subscribers the backend has recorded for `event`. This is the
    /// authoritative set; a process only caches it.
    async fn event_subscribers(
        &self,
        _event: &EventDescriptor,
    ) -> Result<Vec<EventSubscriberDescriptor>> {
        Err(self.unsupported("event_subscribers"))
    }

    /// Deliver one event to one subscriber.
    async fn publish_event(
        &self,
        _intent: &RaiseEventIntent,
        _subscriber: &EventSubscriberDescriptor,
    ) -> Result<()> {
        Err(self.unsupported("publish_event"))
    }

    async fn register_trigger(&self, _intent: &RegisterTriggerIntent) -> Result<()> {
        Err(self.unsupported("register_trigger"))
    }

    async fn activate_trigger(&self, _intent: &ActivateTriggerIntent) -> Result<()> {
        Err(self.unsupported("activate_trigger"))
    }

    async fn subscribe_to_trigger(&self, _intent: &SubscribeToTriggerIntent) -> Result<()> {
        Err(self.unsupported("subscribe_to_trigger"))
    }

    /// Enqueue `intent` but keep it invisible until the lease is released.
    async fn publish_leased(&self, _intent: &ExecuteRoutineIntent) -> Result<MessageLease> {
        Err(self.unsupported("publish_leased"))
    }

    /// Drop the leased message: it has been processed.
    async fn complete_lease(&self, _lease: &MessageLease) -> Result<()> {
        Err(self.unsupported("complete_lease"))
    }

    /// Return the leased message to the queue.
    async fn release_lease(&self, _lease: &MessageLease) -> Result<()> {
        Err(self.unsupported("release_lease"))
    }

    fn unsupported(&self, operation: &'static str) -> FabricError {
        FabricError::Unsupported {
            connector: self.name().to_string(),
            operation,
        }
    }
}
