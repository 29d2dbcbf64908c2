use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Identity ─────────────────────────────────────────────────

/// Name of an addressable service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
}

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Name of a method (routine entry point) on a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId {
    pub name: String,
}

impl MethodId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Name of an event published by a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub name: String,
}

impl EventId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of a level-triggered signal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId(pub String);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed namespace for idempotency-key derived intent ids.
const INTENT_NAMESPACE: Uuid = Uuid::from_u128(0x3b8e_51c4_7d0a_4f52_9a61_c2d7_0e94_1f3a);

/// Stable identity of an intent, assigned when the intent is created and
/// never by a backend. Redelivery of the same intent reuses it, which is what
/// lets dedup-capable connectors recognise retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub Uuid);

impl IntentId {
    /// A fresh, time-ordered id for externally originated calls.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// The id of the call a routine makes at `task_id`. Replaying the same
    /// transition yields the same child id.
    pub fn derive_child(parent: &IntentId, task_id: u64) -> Self {
        Self(Uuid::new_v5(&parent.0, format!("task:{task_id}").as_bytes()))
    }

    /// A named, deterministic satellite of `parent` (completion notices,
    /// per-subscriber event deliveries).
    pub fn derive_named(parent: &IntentId, name: &str) -> Self {
        Self(Uuid::new_v5(&parent.0, format!("name:{name}").as_bytes()))
    }

    /// Derives the id from a caller-supplied idempotency key, e.g. `tx=42`.
    pub fn from_idempotency_key(service: &ServiceId, method: &MethodId, key: &str) -> Self {
        let seed = format!("{}/{}/{}", service.name, method.name, key);
        Self(Uuid::new_v5(&INTENT_NAMESPACE, seed.as_bytes()))
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque version token used for optimistic concurrency.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(pub String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage key of one routine instance.
pub fn routine_key(service: &ServiceId, method: &MethodId, intent_id: &IntentId) -> String {
    format!("{service}/{method}/{intent_id}")
}

// ─── Routine lifecycle ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineStatus {
    Allocated,
    Scheduled,
    Transitioning,
    Awaiting,
    Complete,
}

impl RoutineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Scheduled => "scheduled",
            Self::Transitioning => "transitioning",
            Self::Awaiting => "awaiting",
            Self::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for RoutineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable execution of a routine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutineInstance {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
    pub etag: Option<ETag>,
    pub status: RoutineStatus,
}

// ─── Outcomes ─────────────────────────────────────────────────

/// Serializable description of an application-level fault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Argument position for faults collected by a fan-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inner: Vec<ExceptionInfo>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            position: None,
            inner: Vec::new(),
        }
    }

    pub fn aggregate(message: impl Into<String>, inner: Vec<ExceptionInfo>) -> Self {
        Self {
            type_name: AGGREGATE_FAULT.to_string(),
            message: message.into(),
            position: None,
            inner,
        }
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Type name of faults composed from several children.
pub const AGGREGATE_FAULT: &str = "AggregateFault";

/// Type name recorded for a canceled child inside an aggregate fault.
pub const CANCELED_FAULT: &str = "Canceled";

/// Terminal outcome of a routine. Exactly one variant, never more.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded(Value),
    Faulted(ExceptionInfo),
    Canceled,
}

impl TaskResult {
    pub fn success(value: Value) -> Self {
        Self::Succeeded(value)
    }

    pub fn fault(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Faulted(ExceptionInfo::new(type_name, message))
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        match self {
            Self::Faulted(e) => Some(e),
            _ => None,
        }
    }
}

// ─── Descriptors ──────────────────────────────────────────────

/// The routine that initiated a call, propagated for tracing and dedup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerDescriptor {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    pub method: MethodId,
    pub intent_id: IntentId,
    /// Backend-assigned key, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine_id: Option<String>,
    /// State version the awaiting routine was saved with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,
}

/// Links an awaited call back to the awaiting routine and position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationDescriptor {
    pub service: ServiceId,
    pub routine: RoutineDescriptor,
    pub task_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub service: ServiceId,
    pub event: EventId,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventSubscriberDescriptor {
    pub service: ServiceId,
    pub method: MethodId,
}

// ─── Classification ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    Local,
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    Command,
    Query,
    Event,
}

/// Flow-context keys carried from caller to callee across suspensions.
pub type FlowContext = BTreeMap<String, String>;
