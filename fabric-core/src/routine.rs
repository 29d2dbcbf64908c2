//! Routines as explicit resumable state machines.
//!
//! A routine owns a serializable state enum. Each call to [`Routine::start`]
//! or [`Routine::resume`] runs one segment and returns the next state plus the
//! [`Suspension`] it stopped at. Suspensions are the only points where a
//! routine can be torn down and resumed elsewhere.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FabricError, Result};
use crate::intent::{
    ActivateTriggerIntent, ExecuteRoutineIntent, Intent, RaiseEventIntent, RegisterTriggerIntent,
    SubscribeToEventIntent,
};
use crate::types::{
    CallerDescriptor, EventDescriptor, EventId, EventSubscriberDescriptor, ExceptionInfo,
    FlowContext, IntentId, MethodId, ServiceId, TaskResult, TriggerId,
};

// ─── Suspension points ────────────────────────────────────────

/// A call to another routine.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutineCall {
    pub service: ServiceId,
    pub method: MethodId,
    pub parameters: Value,
    /// Derive the callee's intent id from this key instead of the call
    /// position.
    pub idempotency_key: Option<String>,
}

impl RoutineCall {
    pub fn new(service: impl Into<String>, method: impl Into<String>, parameters: Value) -> Self {
        Self {
            service: ServiceId::new(service),
            method: MethodId::new(method),
            parameters,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The callee's intent id when made by `caller` at `task_id`.
    pub fn intent_id(&self, caller: &IntentId, task_id: u64) -> IntentId {
        match &self.idempotency_key {
            Some(key) => IntentId::from_idempotency_key(&self.service, &self.method, key),
            None => IntentId::derive_child(caller, task_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Suspension {
    /// Await one sub-call.
    Call(RoutineCall),
    /// Await every call; resumes with an ordered array or an aggregate fault.
    WhenAll(Vec<RoutineCall>),
    /// Resume after a delay, via a time-delayed message.
    Delay(Duration),
    /// Persist and resume as soon as possible.
    Checkpoint,
    /// Resume when the trigger is activated.
    WaitTrigger(TriggerId),
    Complete(TaskResult),
}

/// What a suspended routine is resumed with.
#[derive(Clone, Debug, PartialEq)]
pub enum Resume {
    /// Result of a call, fan-in or trigger.
    Completed(TaskResult),
    /// End of a delay or checkpoint.
    Wakeup,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition<S> {
    pub state: S,
    pub suspension: Suspension,
}

impl<S> Transition<S> {
    pub fn suspend(state: S, suspension: Suspension) -> Self {
        Self { state, suspension }
    }

    pub fn call(state: S, call: RoutineCall) -> Self {
        Self::suspend(state, Suspension::Call(call))
    }

    pub fn complete(state: S, result: TaskResult) -> Self {
        Self::suspend(state, Suspension::Complete(result))
    }

    pub fn succeed(state: S, value: Value) -> Self {
        Self::complete(state, TaskResult::Succeeded(value))
    }
}

// ─── Transition context ───────────────────────────────────────

/// Side channel available to a running segment: service state, flow context
/// and fire-and-forget effects. Every effect consumes a task id so replays
/// regenerate identical intent ids.
#[derive(Debug)]
pub struct TransitionContext {
    identity: CallerDescriptor,
    next_task_id: u64,
    service_state: Option<Value>,
    flow_context: FlowContext,
    intents: Vec<Intent>,
}

impl TransitionContext {
    pub fn new(
        identity: CallerDescriptor,
        next_task_id: u64,
        service_state: Option<Value>,
        flow_context: FlowContext,
    ) -> Self {
        Self {
            identity,
            next_task_id,
            service_state,
            flow_context,
            intents: Vec::new(),
        }
    }

    pub fn identity(&self) -> &CallerDescriptor {
        &self.identity
    }

    pub fn intent_id(&self) -> IntentId {
        self.identity.intent_id
    }

    pub fn service_state(&self) -> Option<&Value> {
        self.service_state.as_ref()
    }

    pub fn set_service_state(&mut self, state: Value) {
        self.service_state = Some(state);
    }

    pub fn flow_context(&self) -> &FlowContext {
        &self.flow_context
    }

    pub fn set_flow(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.flow_context.insert(key.into(), value.into());
    }

    pub(crate) fn allocate_task_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Publish `event` from this routine's service once the transition commits.
    pub fn raise_event(&mut self, event: impl Into<String>, payload: Value) {
        let task_id = self.allocate_task_id();
        self.intents.push(Intent::RaiseEvent(RaiseEventIntent {
            id: IntentId::derive_child(&self.identity.intent_id, task_id),
            event: EventDescriptor {
                service: self.identity.service.clone(),
                event: EventId::new(event),
            },
            payload,
            caller: Some(self.identity.clone()),
            flow_context: self.flow_context.clone(),
        }));
    }

    /// Subscribe `handler` on this routine's service to another service's event.
    pub fn subscribe(
        &mut self,
        publisher: impl Into<String>,
        event: impl Into<String>,
        handler: impl Into<String>,
    ) {
        self.allocate_task_id();
        self.intents.push(Intent::SubscribeToEvent(SubscribeToEventIntent {
            event: EventDescriptor {
                service: ServiceId::new(publisher),
                event: EventId::new(event),
            },
            subscriber: EventSubscriberDescriptor {
                service: self.identity.service.clone(),
                method: MethodId::new(handler),
            },
        }));
    }

    /// Invoke a routine without awaiting its result.
    pub fn call_detached(&mut self, call: RoutineCall) {
        let task_id = self.allocate_task_id();
        self.intents.push(Intent::ExecuteRoutine(ExecuteRoutineIntent {
            id: call.intent_id(&self.identity.intent_id, task_id),
            service: call.service,
            method: call.method,
            parameters: call.parameters,
            caller: Some(self.identity.clone()),
            continuation: None,
            flow_context: self.flow_context.clone(),
        }));
    }

    pub fn register_trigger(&mut self, trigger_id: TriggerId) {
        self.allocate_task_id();
        self.intents
            .push(Intent::RegisterTrigger(RegisterTriggerIntent { trigger_id }));
    }

    pub fn activate_trigger(&mut self, trigger_id: TriggerId, value: TaskResult) {
        self.allocate_task_id();
        self.intents
            .push(Intent::ActivateTrigger(ActivateTriggerIntent { trigger_id, value }));
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id
    }

    pub(crate) fn into_parts(self) -> (Vec<Intent>, Option<Value>, FlowContext, u64) {
        (
            self.intents,
            self.service_state,
            self.flow_context,
            self.next_task_id,
        )
    }
}

// ─── Routine trait ────────────────────────────────────────────

/// A resumable unit of work.
///
/// Faults returned as `Err(ExceptionInfo)` complete the routine with
/// [`TaskResult::Faulted`]; they are not infrastructure errors.
pub trait Routine: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send;

    fn start(
        &self,
        parameters: Value,
        ctx: &mut TransitionContext,
    ) -> std::result::Result<Transition<Self::State>, ExceptionInfo>;

    fn resume(
        &self,
        state: Self::State,
        resume: Resume,
        ctx: &mut TransitionContext,
    ) -> std::result::Result<Transition<Self::State>, ExceptionInfo>;
}

/// Routine state after erasing its concrete type.
#[derive(Clone, Debug, PartialEq)]
pub struct ErasedTransition {
    pub state: Value,
    pub suspension: Suspension,
}

/// Object-safe view of a [`Routine`].
pub trait ErasedRoutine: Send + Sync {
    fn start(&self, parameters: Value, ctx: &mut TransitionContext) -> Result<ErasedTransition>;

    fn resume(
        &self,
        state: Value,
        resume: Resume,
        ctx: &mut TransitionContext,
    ) -> Result<ErasedTransition>;
}

pub struct RoutineAdapter<R> {
    name: String,
    routine: R,
}

impl<R: Routine> RoutineAdapter<R> {
    pub fn new(name: impl Into<String>, routine: R) -> Self {
        Self {
            name: name.into(),
            routine,
        }
    }

    fn erase(
        &self,
        outcome: std::result::Result<Transition<R::State>, ExceptionInfo>,
    ) -> Result<ErasedTransition> {
        match outcome {
            Ok(t) => {
                let state = serde_json::to_value(&t.state).map_err(|e| FabricError::Routine {
                    routine: self.name.clone(),
                    message: format!("capturing state: {e}"),
                })?;
                Ok(ErasedTransition {
                    state,
                    suspension: t.suspension,
                })
            }
            Err(fault) => Ok(ErasedTransition {
                state: Value::Null,
                suspension: Suspension::Complete(TaskResult::Faulted(fault)),
            }),
        }
    }
}

impl<R: Routine> ErasedRoutine for RoutineAdapter<R> {
    fn start(&self, parameters: Value, ctx: &mut TransitionContext) -> Result<ErasedTransition> {
        let outcome = self.routine.start(parameters, ctx);
        self.erase(outcome)
    }

    fn resume(
        &self,
        state: Value,
        resume: Resume,
        ctx: &mut TransitionContext,
    ) -> Result<ErasedTransition> {
        let state: R::State = serde_json::from_value(state).map_err(|e| FabricError::Routine {
            routine: self.name.clone(),
            message: format!("restoring state: {e}"),
        })?;
        let outcome = self.routine.resume(state, resume, ctx);
        self.erase(outcome)
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// Routines hosted by this process, keyed by (service, method). Built once at
/// startup.
#[derive(Default, Clone)]
pub struct RoutineRegistry {
    routines: HashMap<(ServiceId, MethodId), Arc<dyn ErasedRoutine>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a routine. Registering the same (service, method) twice is a
    /// configuration error.
    pub fn register<R: Routine>(
        &mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        routine: R,
    ) -> Result<&mut Self> {
        let service = ServiceId::new(service);
        let method = MethodId::new(method);
        let key = (service.clone(), method.clone());
        if self.routines.contains_key(&key) {
            return Err(FabricError::configuration(format!(
                "routine {service}.{method} registered twice"
            )));
        }
        let adapter = RoutineAdapter::new(format!("{service}.{method}"), routine);
        self.routines.insert(key, Arc::new(adapter));
        Ok(self)
    }

    pub fn get(&self, service: &ServiceId, method: &MethodId) -> Option<Arc<dyn ErasedRoutine>> {
        self.routines
            .get(&(service.clone(), method.clone()))
            .cloned()
    }

    pub fn contains(&self, service: &ServiceId, method: &MethodId) -> bool {
        self.routines.contains_key(&(service.clone(), method.clone()))
    }

    pub fn hosts_service(&self, service: &ServiceId) -> bool {
        self.routines.keys().any(|(s, _)| s == service)
    }

    pub fn services(&self) -> Vec<ServiceId> {
        let mut services: Vec<ServiceId> = self.routines.keys().map(|(s, _)| s.clone()).collect();
        services.sort();
        services.dedup();
        services
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    enum AddState {
        Fetching { base: i64 },
        Done,
    }

    struct AddRemote;

    impl Routine for AddRemote {
        type State = AddState;

        fn start(
            &self,
            parameters: Value,
            _ctx: &mut TransitionContext,
        ) -> std::result::Result<Transition<AddState>, ExceptionInfo> {
            let base = parameters["base"]
                .as_i64()
                .ok_or_else(|| ExceptionInfo::new("InvalidArgument", "base missing"))?;
            Ok(Transition::call(
                AddState::Fetching { base },
                RoutineCall::new("numbers", "Next", json!({})),
            ))
        }

        fn resume(
            &self,
            state: AddState,
            resume: Resume,
            _ctx: &mut TransitionContext,
        ) -> std::result::Result<Transition<AddState>, ExceptionInfo> {
            match (state, resume) {
                (AddState::Fetching { base }, Resume::Completed(TaskResult::Succeeded(v))) => {
                    Ok(Transition::succeed(AddState::Done, json!(base + v.as_i64().unwrap_or(0))))
                }
                _ => Err(ExceptionInfo::new("UnexpectedResume", "bad resume")),
            }
        }
    }

    fn ctx() -> TransitionContext {
        TransitionContext::new(
            CallerDescriptor {
                service: ServiceId::new("calc"),
                method: MethodId::new("Add"),
                intent_id: IntentId::generate(),
            },
            1,
            None,
            FlowContext::new(),
        )
    }

    #[test]
    fn adapter_round_trips_state() {
        let adapter = RoutineAdapter::new("calc.Add", AddRemote);
        let mut c = ctx();
        let t = adapter.start(json!({"base": 2}), &mut c).unwrap();
        assert!(matches!(t.suspension, Suspension::Call(_)));

        let t = adapter
            .resume(t.state, Resume::Completed(TaskResult::success(json!(5))), &mut c)
            .unwrap();
        assert_eq!(t.suspension, Suspension::Complete(TaskResult::success(json!(7))));
    }

    #[test]
    fn faults_complete_the_routine() {
        let adapter = RoutineAdapter::new("calc.Add", AddRemote);
        let t = adapter.start(json!({}), &mut ctx()).unwrap();
        match t.suspension {
            Suspension::Complete(TaskResult::Faulted(e)) => assert_eq!(e.type_name, "InvalidArgument"),
            other => panic!("unexpected suspension {other:?}"),
        }
    }

    #[test]
    fn corrupt_state_is_a_routine_error() {
        let adapter = RoutineAdapter::new("calc.Add", AddRemote);
        let err = adapter
            .resume(json!("garbage"), Resume::Wakeup, &mut ctx())
            .unwrap_err();
        assert!(matches!(err, FabricError::Routine { .. }));
    }

    #[test]
    fn context_effects_consume_task_ids() {
        let mut c = ctx();
        c.raise_event("Added", json!({}));
        c.call_detached(RoutineCall::new("audit", "Record", json!({})));
        c.register_trigger(TriggerId("t".into()));
        assert_eq!(c.next_task_id(), 4);
        let (intents, _, _, next) = c.into_parts();
        assert_eq!(intents.len(), 3);
        assert_eq!(next, 4);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = RoutineRegistry::new();
        registry.register("calc", "Add", AddRemote).unwrap();
        let err = registry.register("calc", "Add", AddRemote).err().unwrap();
        assert!(matches!(err, FabricError::Configuration(_)));
        assert!(registry.contains(&ServiceId::new("calc"), &MethodId::new("Add")));
        assert_eq!(registry.services(), vec![ServiceId::new("calc")]);
    }

    #[test]
    fn idempotency_key_overrides_position() {
        let caller = IntentId::generate();
        let call = RoutineCall::new("billing", "Debit", json!({})).with_idempotency_key("tx=42");
        assert_eq!(call.intent_id(&caller, 1), call.intent_id(&caller, 9));
        let plain = RoutineCall::new("billing", "Debit", json!({}));
        assert_ne!(plain.intent_id(&caller, 1), plain.intent_id(&caller, 2));
    }
}
