//! Communicator abstraction: invoke/continue/poll for one transport.

use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::connector::{ActiveRoutineInfo, FabricConnector, MessageLease};
use crate::error::{FabricError, Result};
use crate::intent::{ContinueRoutineIntent, ExecuteRoutineIntent};
use crate::types::TaskResult;

/// Capability flags a communicator declares.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommunicationTraits(u8);

impl CommunicationTraits {
    /// No delivery guarantee.
    pub const VOLATILE: Self = Self(0b001);
    /// The caller may block for an immediate reply.
    pub const SYNC_REPLIES: Self = Self(0b010);
    /// An outbound message can be leased and released back on failure.
    pub const MESSAGE_LOCK_ON_PUBLISH: Self = Self(0b100);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for CommunicationTraits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CommunicationTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::VOLATILE) {
            names.push("VOLATILE");
        }
        if self.contains(Self::SYNC_REPLIES) {
            names.push("SYNC_REPLIES");
        }
        if self.contains(Self::MESSAGE_LOCK_ON_PUBLISH) {
            names.push("MESSAGE_LOCK_ON_PUBLISH");
        }
        write!(f, "CommunicationTraits({})", names.join(" | "))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvokePreferences {
    /// Block for the reply when the transport allows it.
    pub synchronous: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InvokeOutcome {
    Completed(TaskResult),
    Scheduled(ActiveRoutineInfo),
    /// The intent id was already known; nothing new was started.
    Deduplicated(ActiveRoutineInfo),
}

impl InvokeOutcome {
    pub fn info(&self) -> Option<&ActiveRoutineInfo> {
        match self {
            Self::Completed(_) => None,
            Self::Scheduled(info) | Self::Deduplicated(info) => Some(info),
        }
    }

    pub fn result(&self) -> Option<&TaskResult> {
        match self {
            Self::Completed(r) => Some(r),
            Self::Scheduled(info) | Self::Deduplicated(info) => info.result.as_ref(),
        }
    }
}

#[async_trait]
pub trait Communicator: Send + Sync {
    fn name(&self) -> &str;

    fn traits(&self) -> CommunicationTraits;

    async fn invoke(
        &self,
        intent: &ExecuteRoutineIntent,
        prefs: &InvokePreferences,
    ) -> Result<InvokeOutcome>;

    async fn continue_routine(&self, intent: &ContinueRoutineIntent) -> Result<()>;

    /// Refresh `info`; `result` is set once the routine has completed.
    async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo>;

    async fn lock_on_publish(&self, _intent: &ExecuteRoutineIntent) -> Result<MessageLease> {
        Err(self.unsupported("lock_on_publish"))
    }

    async fn complete_lease(&self, _lease: &MessageLease) -> Result<()> {
        Err(self.unsupported("complete_lease"))
    }

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

// ─── Connector-backed communicator ────────────────────────────

/// Sends calls through the active [`FabricConnector`]. Replies arrive as
/// continuations, so it never offers `SYNC_REPLIES`.
pub struct FabricCommunicator {
    connector: Arc<dyn FabricConnector>,
}

impl FabricCommunicator {
    pub const NAME: &'static str = "fabric";

    pub fn new(connector: Arc<dyn FabricConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Communicator for FabricCommunicator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn traits(&self) -> CommunicationTraits {
        if self.connector.capabilities().leases {
            CommunicationTraits::MESSAGE_LOCK_ON_PUBLISH
        } else {
            CommunicationTraits::empty()
        }
    }

    async fn invoke(
        &self,
        intent: &ExecuteRoutineIntent,
        _prefs: &InvokePreferences,
    ) -> Result<InvokeOutcome> {
        let scheduled = self.connector.schedule_routine(intent).await?;
        let mut info = ActiveRoutineInfo::for_intent(intent, scheduled.routine_id);
        info.etag = scheduled.etag;
        if scheduled.deduplicated {
            tracing::debug!(
                intent_id = %intent.id,
                service = %intent.service,
                method = %intent.method,
                "Invoke deduplicated by connector"
            );
            Ok(InvokeOutcome::Deduplicated(info))
        } else {
            Ok(InvokeOutcome::Scheduled(info))
        }
    }

    async fn continue_routine(&self, intent: &ContinueRoutineIntent) -> Result<()> {
        self.connector.schedule_continuation(intent).await
    }

    async fn poll(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
        self.connector.poll_routine_result(info).await
    }

    async fn lock_on_publish(&self, intent: &ExecuteRoutineIntent) -> Result<MessageLease> {
        self.connector.publish_leased(intent).await
    }

    async fn complete_lease(&self, lease: &MessageLease) -> Result<()> {
        self.connector.complete_lease(lease).await
    }

    async fn release_lease(&self, lease: &MessageLease) -> Result<()> {
        self.connector.release_lease(lease).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_flags_compose() {
        let t = CommunicationTraits::SYNC_REPLIES | CommunicationTraits::VOLATILE;
        assert!(t.contains(CommunicationTraits::SYNC_REPLIES));
        assert!(t.contains(CommunicationTraits::VOLATILE));
        assert!(!t.contains(CommunicationTraits::MESSAGE_LOCK_ON_PUBLISH));
        assert!(t.contains(CommunicationTraits::empty()));
        assert_eq!(format!("{t:?}"), "CommunicationTraits(VOLATILE | SYNC_REPLIES)");
    }

    #[test]
    fn outcome_accessors() {
        let done = InvokeOutcome::Completed(TaskResult::Canceled);
        assert_eq!(done.result(), Some(&TaskResult::Canceled));
        assert!(done.info().is_none());
    }
}
