//! Intent model: the closed set of side effects a transition may request.
//!
//! A transition never performs effects directly. It returns one
//! [`ScheduledActions`] batch which the committer applies: state first,
//! then everything else.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::monitor::RoutineSnapshot;
use crate::types::{
    CallerDescriptor, ContinuationDescriptor, ETag, EventDescriptor, EventSubscriberDescriptor,
    FlowContext, IntentId, MethodId, RoutineStatus, ServiceId, TaskResult, TriggerId,
};

// ─── Intents ──────────────────────────────────────────────────

/// Invoke a routine. `id` is assigned at creation and stays stable across
/// every redelivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRoutineIntent {
    pub id: IntentId,
    pub service: ServiceId,
    pub method: MethodId,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    /// Where to send the result. `None` for fire-and-forget calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
}

/// Resume an awaiting routine with a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinueRoutineIntent {
    pub id: IntentId,
    pub continuation: ContinuationDescriptor,
    pub result: TaskResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    /// Deliver no earlier than this long after dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl ContinueRoutineIntent {
    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }

    /// ETag of the awaiting routine this continuation targets.
    pub fn target_etag(&self) -> Option<&ETag> {
        self.continuation.routine.etag.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaiseEventIntent {
    pub id: IntentId,
    pub event: EventDescriptor,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeToEventIntent {
    pub event: EventDescriptor,
    pub subscriber: EventSubscriberDescriptor,
}

/// Identity of a persisted routine record plus the write precondition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMethodId {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
    /// ETag read when the transition began. `None` means the record must not
    /// exist yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,
}

/// Persist service state, the routine continuation and an optional result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveStateIntent {
    pub target: PersistedMethodId,
    pub status: RoutineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine: Option<RoutineSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    #[serde(default)]
    pub flow_context: FlowContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTriggerIntent {
    pub trigger_id: TriggerId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivateTriggerIntent {
    pub trigger_id: TriggerId,
    pub value: TaskResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeToTriggerIntent {
    pub trigger_id: TriggerId,
    pub continuation: ContinuationDescriptor,
}

/// Tagged union over every intent kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    ExecuteRoutine(ExecuteRoutineIntent),
    ContinueRoutine(ContinueRoutineIntent),
    RaiseEvent(RaiseEventIntent),
    SubscribeToEvent(SubscribeToEventIntent),
    SaveState(SaveStateIntent),
    RegisterTrigger(RegisterTriggerIntent),
    ActivateTrigger(ActivateTriggerIntent),
    SubscribeToTrigger(SubscribeToTriggerIntent),
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteRoutine(_) => "execute_routine",
            Self::ContinueRoutine(_) => "continue_routine",
            Self::RaiseEvent(_) => "raise_event",
            Self::SubscribeToEvent(_) => "subscribe_to_event",
            Self::SaveState(_) => "save_state",
            Self::RegisterTrigger(_) => "register_trigger",
            Self::ActivateTrigger(_) => "activate_trigger",
            Self::SubscribeToTrigger(_) => "subscribe_to_trigger",
        }
    }

    /// Stable identity, for intents that carry one.
    pub fn intent_id(&self) -> Option<IntentId> {
        match self {
            Self::ExecuteRoutine(i) => Some(i.id),
            Self::ContinueRoutine(i) => Some(i.id),
            Self::RaiseEvent(i) => Some(i.id),
            Self::SaveState(i) => Some(i.target.intent_id),
            _ => None,
        }
    }
}

// ─── ScheduledActions ─────────────────────────────────────────

/// Everything one transition asked for. Applied as a unit by the committer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_state: Option<SaveStateIntent>,
    #[serde(default)]
    pub execute_routines: Vec<ExecuteRoutineIntent>,
    #[serde(default)]
    pub continue_routines: Vec<ContinueRoutineIntent>,
    #[serde(default)]
    pub raise_events: Vec<RaiseEventIntent>,
    #[serde(default)]
    pub subscribe_to_events: Vec<SubscribeToEventIntent>,
    #[serde(default)]
    pub register_triggers: Vec<RegisterTriggerIntent>,
    #[serde(default)]
    pub activate_triggers: Vec<ActivateTriggerIntent>,
    #[serde(default)]
    pub subscribe_to_triggers: Vec<SubscribeToTriggerIntent>,
}

impl ScheduledActions {
    /// Sort loose intents into a batch. A second `SaveState` replaces the first.
    pub fn from_intents(intents: impl IntoIterator<Item = Intent>) -> Self {
        let mut actions = Self::default();
        for intent in intents {
            actions.push(intent);
        }
        actions
    }

    pub fn push(&mut self, intent: Intent) {
        match intent {
            Intent::ExecuteRoutine(i) => self.execute_routines.push(i),
            Intent::ContinueRoutine(i) => self.continue_routines.push(i),
            Intent::RaiseEvent(i) => self.raise_events.push(i),
            Intent::SubscribeToEvent(i) => self.subscribe_to_events.push(i),
            Intent::SaveState(i) => self.save_state = Some(i),
            Intent::RegisterTrigger(i) => self.register_triggers.push(i),
            Intent::ActivateTrigger(i) => self.activate_triggers.push(i),
            Intent::SubscribeToTrigger(i) => self.subscribe_to_triggers.push(i),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.save_state.is_none() && self.dispatchable_len() == 0
    }

    pub fn dispatchable_len(&self) -> usize {
        self.execute_routines.len()
            + self.continue_routines.len()
            + self.raise_events.len()
            + self.subscribe_to_events.len()
            + self.register_triggers.len()
            + self.activate_triggers.len()
            + self.subscribe_to_triggers.len()
    }

    /// Every intent except the state save, registrations first. This is
    /// what the outbox persists alongside the state.
    pub fn dispatchable(&self) -> Vec<Intent> {
        let mut out = Vec::with_capacity(self.dispatchable_len());
        // Registrations lead; the committer delivers them before the rest of
        // the batch, which then goes out concurrently.
        out.extend(self.subscribe_to_events.iter().cloned().map(Intent::SubscribeToEvent));
        out.extend(self.register_triggers.iter().cloned().map(Intent::RegisterTrigger));
        out.extend(self.execute_routines.iter().cloned().map(Intent::ExecuteRoutine));
        out.extend(self.continue_routines.iter().cloned().map(Intent::ContinueRoutine));
        out.extend(self.raise_events.iter().cloned().map(Intent::RaiseEvent));
        out.extend(self.activate_triggers.iter().cloned().map(Intent::ActivateTrigger));
        out.extend(self.subscribe_to_triggers.iter().cloned().map(Intent::SubscribeToTrigger));
        out
    }

    /// Stamp continuations that point back at `(service, intent_id)` with the
    /// ETag produced by its state save. Returns how many were stamped.
    pub fn stamp_continuation_etag(
        &mut self,
        service: &ServiceId,
        intent_id: &IntentId,
        etag: &ETag,
    ) -> usize {
        let mut stamped = 0;
        let continuations = self
            .execute_routines
            .iter_mut()
            .filter_map(|i| i.continuation.as_mut())
            .chain(self.subscribe_to_triggers.iter_mut().map(|i| &mut i.continuation))
            .chain(self.continue_routines.iter_mut().map(|i| &mut i.continuation));
        for continuation in continuations {
            if stamp(continuation, service, intent_id, etag) {
                stamped += 1;
            }
        }
        stamped
    }
}

/// Same stamping rule applied to an already flattened outbox.
pub fn stamp_outbox(intents: &mut [Intent], service: &ServiceId, intent_id: &IntentId, etag: &ETag) {
    for intent in intents.iter_mut() {
        let continuation = match intent {
            Intent::ExecuteRoutine(i) => i.continuation.as_mut(),
            Intent::ContinueRoutine(i) => Some(&mut i.continuation),
            Intent::SubscribeToTrigger(i) => Some(&mut i.continuation),
            _ => None,
        };
        if let Some(c) = continuation {
            stamp(c, service, intent_id, etag);
        }
    }
}

fn stamp(
    continuation: &mut ContinuationDescriptor,
    service: &ServiceId,
    intent_id: &IntentId,
    etag: &ETag,
) -> bool {
    if &continuation.service == service && &continuation.routine.intent_id == intent_id {
        continuation.routine.etag = Some(etag.clone());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoutineDescriptor;
    use serde_json::json;

    fn continuation_to(service: &str, intent_id: IntentId, task_id: u64) -> ContinuationDescriptor {
        ContinuationDescriptor {
            service: ServiceId::new(service),
            routine: RoutineDescriptor {
                method: MethodId::new("Checkout"),
                intent_id,
                routine_id: None,
                etag: None,
            },
            task_id,
        }
    }

    fn execute(continuation: Option<ContinuationDescriptor>) -> ExecuteRoutineIntent {
        ExecuteRoutineIntent {
            id: IntentId::generate(),
            service: ServiceId::new("billing"),
            method: MethodId::new("Debit"),
            parameters: json!({"amount": 10}),
            caller: None,
            continuation,
            flow_context: FlowContext::new(),
        }
    }

    #[test]
    fn stamping_only_touches_own_continuations() {
        let me = IntentId::generate();
        let other = IntentId::generate();
        let mut actions = ScheduledActions::default();
        actions.execute_routines.push(execute(Some(continuation_to("shop", me, 1))));
        actions.execute_routines.push(execute(Some(continuation_to("shop", other, 1))));
        actions.execute_routines.push(execute(None));

        let etag = ETag::new("0000000000000002");
        let stamped = actions.stamp_continuation_etag(&ServiceId::new("shop"), &me, &etag);
        assert_eq!(stamped, 1);
        assert_eq!(
            actions.execute_routines[0].continuation.as_ref().unwrap().routine.etag,
            Some(etag)
        );
        assert_eq!(
            actions.execute_routines[1].continuation.as_ref().unwrap().routine.etag,
            None
        );
    }

    #[test]
    fn dispatchable_excludes_state_save() {
        let me = IntentId::generate();
        let mut actions = ScheduledActions::default();
        assert!(actions.is_empty());
        actions.save_state = Some(SaveStateIntent {
            target: PersistedMethodId {
                service: ServiceId::new("shop"),
                method: MethodId::new("Checkout"),
                intent_id: me,
                etag: None,
            },
            status: RoutineStatus::Awaiting,
            service_state: None,
            routine: None,
            result: None,
            caller: None,
            continuation: None,
            flow_context: FlowContext::new(),
        });
        actions.execute_routines.push(execute(None));
        actions.register_triggers.push(RegisterTriggerIntent {
            trigger_id: TriggerId("ready".into()),
        });

        let outbox = actions.dispatchable();
        assert_eq!(outbox.len(), 2);
        assert!(outbox.iter().all(|i| !matches!(i, Intent::SaveState(_))));
        assert_eq!(outbox[0].kind(), "register_trigger");
        assert!(!actions.is_empty());
    }

    #[test]
    fn intents_round_trip_through_batch() {
        let intents = vec![
            Intent::ExecuteRoutine(execute(None)),
            Intent::SubscribeToEvent(SubscribeToEventIntent {
                event: EventDescriptor {
                    service: ServiceId::new("billing"),
                    event: crate::types::EventId::new("Debited"),
                },
                subscriber: EventSubscriberDescriptor {
                    service: ServiceId::new("audit"),
                    method: MethodId::new("Record"),
                },
            }),
        ];
        let actions = ScheduledActions::from_intents(intents);
        assert_eq!(actions.dispatchable_len(), 2);
        assert_eq!(actions.subscribe_to_events.len(), 1);
    }

    #[test]
    fn outbox_stamping_matches_batch_stamping() {
        let me = IntentId::generate();
        let mut outbox = vec![
            Intent::ExecuteRoutine(execute(Some(continuation_to("shop", me, 3)))),
            Intent::SubscribeToTrigger(SubscribeToTriggerIntent {
                trigger_id: TriggerId("t".into()),
                continuation: continuation_to("shop", me, 4),
            }),
        ];
        let etag = ETag::new("7");
        stamp_outbox(&mut outbox, &ServiceId::new("shop"), &me, &etag);
        for intent in &outbox {
            let etag_seen = match intent {
                Intent::ExecuteRoutine(i) => i.continuation.as_ref().unwrap().routine.etag.clone(),
                Intent::SubscribeToTrigger(i) => i.continuation.routine.etag.clone(),
                _ => None,
            };
            assert_eq!(etag_seen, Some(etag.clone()));
        }
    }
}
