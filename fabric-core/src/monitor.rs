//! Transition monitor: drives one routine from a resume point to its next
//! suspension and turns that suspension into a [`ScheduledActions`] batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::intent::{
    ContinueRoutineIntent, ExecuteRoutineIntent, PersistedMethodId, SaveStateIntent,
    ScheduledActions, SubscribeToTriggerIntent,
};
use crate::routine::{ErasedRoutine, Resume, RoutineCall, Suspension, TransitionContext};
use crate::types::{
    CallerDescriptor, ContinuationDescriptor, ETag, FlowContext, IntentId, MethodId,
    RoutineDescriptor, RoutineStatus, ServiceId, TaskResult, TriggerId,
};
use crate::when_all::{WhenAllRequest, WHEN_ALL_METHOD, WHEN_ALL_SERVICE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Running,
    SuspendedAwaitingSubcall,
    SuspendedDelay,
    SuspendedFanIn,
    SuspendedVoluntaryCheckpoint,
    SuspendedTrigger,
    Complete,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::SuspendedAwaitingSubcall => "suspended_awaiting_subcall",
            Self::SuspendedDelay => "suspended_delay",
            Self::SuspendedFanIn => "suspended_fan_in",
            Self::SuspendedVoluntaryCheckpoint => "suspended_voluntary_checkpoint",
            Self::SuspendedTrigger => "suspended_trigger",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The position a suspended routine is waiting at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Awaiting {
    Nothing,
    Call { task_id: u64 },
    FanIn { task_id: u64, count: usize },
    Delay { task_id: u64 },
    Checkpoint { task_id: u64 },
    Trigger { task_id: u64, trigger_id: TriggerId },
}

impl Awaiting {
    pub fn task_id(&self) -> Option<u64> {
        match self {
            Self::Nothing => None,
            Self::Call { task_id }
            | Self::FanIn { task_id, .. }
            | Self::Delay { task_id }
            | Self::Checkpoint { task_id }
            | Self::Trigger { task_id, .. } => Some(*task_id),
        }
    }

    pub fn monitor_state(&self) -> MonitorState {
        match self {
            Self::Nothing => MonitorState::Running,
            Self::Call { .. } => MonitorState::SuspendedAwaitingSubcall,
            Self::FanIn { .. } => MonitorState::SuspendedFanIn,
            Self::Delay { .. } => MonitorState::SuspendedDelay,
            Self::Checkpoint { .. } => MonitorState::SuspendedVoluntaryCheckpoint,
            Self::Trigger { .. } => MonitorState::SuspendedTrigger,
        }
    }

    fn resume_with(&self, result: TaskResult) -> Resume {
        match self {
            Self::Delay { .. } | Self::Checkpoint { .. } => Resume::Wakeup,
            _ => Resume::Completed(result),
        }
    }
}

/// Continuation snapshot persisted at a suspension point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutineSnapshot {
    pub state: Value,
    pub awaiting: Awaiting,
    pub next_task_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransitionEntry {
    Start { parameters: Value },
    Resume { snapshot: RoutineSnapshot, result: TaskResult },
}

/// Everything needed to run one transition.
#[derive(Clone, Debug)]
pub struct TransitionRequest {
    pub service: ServiceId,
    pub method: MethodId,
    pub intent_id: IntentId,
    /// Precondition for the state save.
    pub etag: Option<ETag>,
    pub entry: TransitionEntry,
    pub caller: Option<CallerDescriptor>,
    pub continuation: Option<ContinuationDescriptor>,
    pub flow_context: FlowContext,
    pub service_state: Option<Value>,
}

impl TransitionRequest {
    pub fn start(intent: &ExecuteRoutineIntent) -> Self {
        Self {
            service: intent.service.clone(),
            method: intent.method.clone(),
            intent_id: intent.id,
            etag: None,
            entry: TransitionEntry::Start {
                parameters: intent.parameters.clone(),
            },
            caller: intent.caller.clone(),
            continuation: intent.continuation.clone(),
            flow_context: intent.flow_context.clone(),
            service_state: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransitionOutcome {
    pub actions: ScheduledActions,
    pub state: MonitorState,
}

pub struct TransitionMonitor {
    routine: Arc<dyn ErasedRoutine>,
}

impl TransitionMonitor {
    pub fn new(routine: Arc<dyn ErasedRoutine>) -> Self {
        Self { routine }
    }

    /// Run the routine to its next suspension and emit exactly one batch.
    pub fn run(&self, request: TransitionRequest) -> Result<TransitionOutcome> {
        let identity = CallerDescriptor {
            service: request.service.clone(),
            method: request.method.clone(),
            intent_id: request.intent_id,
        };
        let next_task_id = match &request.entry {
            TransitionEntry::Start { .. } => 1,
            TransitionEntry::Resume { snapshot, .. } => snapshot.next_task_id,
        };
        let mut ctx = TransitionContext::new(
            identity.clone(),
            next_task_id,
            request.service_state.clone(),
            request.flow_context.clone(),
        );

        let mut transition = match request.entry {
            TransitionEntry::Start { parameters } => self.routine.start(parameters, &mut ctx)?,
            TransitionEntry::Resume { snapshot, result } => {
                let resume = snapshot.awaiting.resume_with(result);
                self.routine.resume(snapshot.state, resume, &mut ctx)?
            }
        };

        // A fan-in over nothing resolves without leaving the transition.
        while matches!(&transition.suspension, Suspension::WhenAll(calls) if calls.is_empty()) {
            transition = self.routine.resume(
                transition.state,
                Resume::Completed(TaskResult::Succeeded(Value::Array(Vec::new()))),
                &mut ctx,
            )?;
        }

        let mut actions = ScheduledActions::default();
        let flow = ctx.flow_context().clone();
        let self_continuation = |task_id: u64| ContinuationDescriptor {
            service: identity.service.clone(),
            routine: RoutineDescriptor {
                method: identity.method.clone(),
                intent_id: identity.intent_id,
                routine_id: None,
                etag: None,
            },
            task_id,
        };

        let (awaiting, result) = match transition.suspension {
            Suspension::Call(call) => {
                let task_id = ctx.allocate_task_id();
                actions.execute_routines.push(child_intent(
                    &identity,
                    call,
                    identity.intent_id,
                    task_id,
                    self_continuation(task_id),
                    &flow,
                ));
                (Awaiting::Call { task_id }, None)
            }
            Suspension::WhenAll(calls) => {
                let task_id = ctx.allocate_task_id();
                let aggregation_id = IntentId::derive_child(&identity.intent_id, task_id);
                let count = calls.len();
                let children = calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, call)| {
                        child_intent(
                            &identity,
                            call,
                            aggregation_id,
                            index as u64,
                            aggregation_continuation(aggregation_id, index as u64),
                            &flow,
                        )
                    })
                    .collect();
                actions.execute_routines.push(ExecuteRoutineIntent {
                    id: aggregation_id,
                    service: ServiceId::new(WHEN_ALL_SERVICE),
                    method: MethodId::new(WHEN_ALL_METHOD),
                    parameters: serde_json::to_value(WhenAllRequest { children })?,
                    caller: Some(identity.clone()),
                    continuation: Some(self_continuation(task_id)),
                    flow_context: flow.clone(),
                });
                (Awaiting::FanIn { task_id, count }, None)
            }
            Suspension::Delay(delay) => {
                let task_id = ctx.allocate_task_id();
                actions.continue_routines.push(ContinueRoutineIntent {
                    id: IntentId::derive_child(&identity.intent_id, task_id),
                    continuation: self_continuation(task_id),
                    result: TaskResult::Succeeded(Value::Null),
                    caller: Some(identity.clone()),
                    delay_ms: Some(delay.as_millis() as u64),
                });
                (Awaiting::Delay { task_id }, None)
            }
            Suspension::Checkpoint => {
                let task_id = ctx.allocate_task_id();
                actions.continue_routines.push(ContinueRoutineIntent {
                    id: IntentId::derive_child(&identity.intent_id, task_id),
                    continuation: self_continuation(task_id),
                    result: TaskResult::Succeeded(Value::Null),
                    caller: Some(identity.clone()),
                    delay_ms: None,
                });
                (Awaiting::Checkpoint { task_id }, None)
            }
            Suspension::WaitTrigger(trigger_id) => {
                let task_id = ctx.allocate_task_id();
                actions.subscribe_to_triggers.push(SubscribeToTriggerIntent {
                    trigger_id: trigger_id.clone(),
                    continuation: self_continuation(task_id),
                });
                (Awaiting::Trigger { task_id, trigger_id }, None)
            }
            Suspension::Complete(result) => {
                if let Some(continuation) = &request.continuation {
                    actions.continue_routines.push(ContinueRoutineIntent {
                        id: IntentId::derive_named(&identity.intent_id, "completion"),
                        continuation: continuation.clone(),
                        result: result.clone(),
                        caller: Some(identity.clone()),
                        delay_ms: None,
                    });
                }
                (Awaiting::Nothing, Some(result))
            }
        };

        let (intents, service_state, flow_context, next_task_id) = ctx.into_parts();
        for intent in intents {
            actions.push(intent);
        }

        let (state, status, snapshot) = match result {
            Some(_) => (MonitorState::Complete, RoutineStatus::Complete, None),
            None => (
                awaiting.monitor_state(),
                RoutineStatus::Awaiting,
                Some(RoutineSnapshot {
                    state: transition.state,
                    awaiting,
                    next_task_id,
                }),
            ),
        };

        actions.save_state = Some(SaveStateIntent {
            target: PersistedMethodId {
                service: request.service,
                method: request.method,
                intent_id: request.intent_id,
                etag: request.etag,
            },
            status,
            service_state,
            routine: snapshot,
            result,
            caller: request.caller,
            continuation: request.continuation,
            flow_context,
        });

        tracing::debug!(
            service = %identity.service,
            method = %identity.method,
            intent_id = %identity.intent_id,
            state = %state,
            intents = actions.dispatchable_len(),
            "Transition reached suspension point"
        );

        Ok(TransitionOutcome { actions, state })
    }
}

fn child_intent(
    identity: &CallerDescriptor,
    call: RoutineCall,
    id_base: IntentId,
    position: u64,
    continuation: ContinuationDescriptor,
    flow: &FlowContext,
) -> ExecuteRoutineIntent {
    ExecuteRoutineIntent {
        id: call.intent_id(&id_base, position),
        service: call.service,
        method: call.method,
        parameters: call.parameters,
        caller: Some(identity.clone()),
        continuation: Some(continuation),
        flow_context: flow.clone(),
    }
}

fn aggregation_continuation(aggregation_id: IntentId, index: u64) -> ContinuationDescriptor {
    ContinuationDescriptor {
        service: ServiceId::new(WHEN_ALL_SERVICE),
        routine: RoutineDescriptor {
            method: MethodId::new(WHEN_ALL_METHOD),
            intent_id: aggregation_id,
            routine_id: None,
            etag: None,
        },
        task_id: index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{Routine, RoutineAdapter, Transition};
    use crate::types::ExceptionInfo;
    use serde_json::json;
    use std::time::Duration;

    /// Walks through every suspension kind in a fixed order.
    struct Tour;

    impl Routine for Tour {
        type State = u32;

        fn start(
            &self,
            _parameters: Value,
            ctx: &mut TransitionContext,
        ) -> std::result::Result<Transition<u32>, ExceptionInfo> {
            ctx.raise_event("Started", json!({}));
            Ok(Transition::call(1, RoutineCall::new("numbers", "Next", json!({}))))
        }

        fn resume(
            &self,
            step: u32,
            _resume: Resume,
            _ctx: &mut TransitionContext,
        ) -> std::result::Result<Transition<u32>, ExceptionInfo> {
            let suspension = match step {
                1 => Suspension::WhenAll(vec![]),
                2 => Suspension::WhenAll(vec![
                    RoutineCall::new("numbers", "Next", json!({})),
                    RoutineCall::new("numbers", "Next", json!({})),
                ]),
                3 => Suspension::Delay(Duration::from_secs(5)),
                4 => Suspension::Checkpoint,
                5 => Suspension::WaitTrigger(TriggerId("go".into())),
                _ => Suspension::Complete(TaskResult::success(json!("done"))),
            };
            Ok(Transition::suspend(step + 1, suspension))
        }
    }

    fn monitor() -> TransitionMonitor {
        TransitionMonitor::new(Arc::new(RoutineAdapter::new("tour.Run", Tour)))
    }

    fn start_request(continuation: Option<ContinuationDescriptor>) -> TransitionRequest {
        TransitionRequest::start(&ExecuteRoutineIntent {
            id: IntentId::generate(),
            service: ServiceId::new("tour"),
            method: MethodId::new("Run"),
            parameters: json!({}),
            caller: None,
            continuation,
            flow_context: FlowContext::new(),
        })
    }

    fn resume(request: &TransitionRequest, outcome: &TransitionOutcome) -> TransitionRequest {
        let save = outcome.actions.save_state.clone().unwrap();
        let mut next = request.clone();
        next.etag = Some(ETag::new("x"));
        next.entry = TransitionEntry::Resume {
            snapshot: save.routine.unwrap(),
            result: TaskResult::success(json!(1)),
        };
        next
    }

    #[test]
    fn subcall_emits_child_with_self_continuation() {
        let m = monitor();
        let request = start_request(None);
        let outcome = m.run(request.clone()).unwrap();
        assert_eq!(outcome.state, MonitorState::SuspendedAwaitingSubcall);
        assert_eq!(outcome.actions.raise_events.len(), 1);

        let child = &outcome.actions.execute_routines[0];
        let continuation = child.continuation.as_ref().unwrap();
        assert_eq!(continuation.routine.intent_id, request.intent_id);
        // Task 1 went to the event, task 2 to the call.
        assert_eq!(continuation.task_id, 2);
        assert_eq!(child.id, IntentId::derive_child(&request.intent_id, 2));

        let save = outcome.actions.save_state.as_ref().unwrap();
        assert_eq!(save.status, RoutineStatus::Awaiting);
        assert_eq!(save.target.etag, None);
        assert_eq!(
            save.routine.as_ref().unwrap().awaiting,
            Awaiting::Call { task_id: 2 }
        );
    }

    #[test]
    fn suspensions_map_to_their_monitor_states() {
        let m = monitor();
        let mut request = start_request(None);
        let mut outcome = m.run(request.clone()).unwrap();
        let expected = [
            MonitorState::SuspendedFanIn,
            MonitorState::SuspendedDelay,
            MonitorState::SuspendedVoluntaryCheckpoint,
            MonitorState::SuspendedTrigger,
            MonitorState::Complete,
        ];
        for state in expected {
            request = resume(&request, &outcome);
            outcome = m.run(request.clone()).unwrap();
            assert_eq!(outcome.state, state);
        }
    }

    #[test]
    fn fan_in_materialises_one_aggregator_intent() {
        let m = monitor();
        let request = start_request(None);
        let first = m.run(request.clone()).unwrap();
        let request = resume(&request, &first);
        // Step 1 yields an empty WhenAll which resolves inline, then step 2 fans out.
        let outcome = m.run(request).unwrap();
        assert_eq!(outcome.actions.execute_routines.len(), 1);
        let aggregate = &outcome.actions.execute_routines[0];
        assert_eq!(aggregate.service.name, WHEN_ALL_SERVICE);
        let req: WhenAllRequest = serde_json::from_value(aggregate.parameters.clone()).unwrap();
        assert_eq!(req.children.len(), 2);
        for (index, child) in req.children.iter().enumerate() {
            let c = child.continuation.as_ref().unwrap();
            assert_eq!(c.routine.intent_id, aggregate.id);
            assert_eq!(c.task_id, index as u64);
        }
    }

    #[test]
    fn delay_becomes_delayed_self_continuation() {
        let m = monitor();
        let mut request = start_request(None);
        let mut outcome = m.run(request.clone()).unwrap();
        for _ in 0..2 {
            request = resume(&request, &outcome);
            outcome = m.run(request.clone()).unwrap();
        }
        assert_eq!(outcome.state, MonitorState::SuspendedDelay);
        let wake = &outcome.actions.continue_routines[0];
        assert_eq!(wake.delay(), Some(Duration::from_secs(5)));
        assert_eq!(wake.continuation.routine.intent_id, request.intent_id);
    }

    #[test]
    fn completion_continues_the_caller() {
        let caller_id = IntentId::generate();
        let caller_continuation = ContinuationDescriptor {
            service: ServiceId::new("shop"),
            routine: RoutineDescriptor {
                method: MethodId::new("Checkout"),
                intent_id: caller_id,
                routine_id: None,
                etag: Some(ETag::new("3")),
            },
            task_id: 7,
        };
        let m = monitor();
        let mut request = start_request(Some(caller_continuation.clone()));
        let mut outcome = m.run(request.clone()).unwrap();
        while outcome.state != MonitorState::Complete {
            request = resume(&request, &outcome);
            outcome = m.run(request.clone()).unwrap();
        }
        let notice = outcome.actions.continue_routines.last().unwrap();
        assert_eq!(notice.continuation, caller_continuation);
        assert_eq!(notice.result, TaskResult::success(json!("done")));
        let save = outcome.actions.save_state.unwrap();
        assert_eq!(save.status, RoutineStatus::Complete);
        assert!(save.routine.is_none());
        assert_eq!(save.result, Some(TaskResult::success(json!("done"))));
    }
}
