//! Runs a checkout against the in-memory fabric: an idempotent debit, a
//! fan-out over inventory and shipping, and an audit event subscriber.
//!
//! ```text
//! RUST_LOG=fabric_core=debug cargo run --bin fabric-demo -- [config.yaml]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use fabric_core::intent::SubscribeToEventIntent;
use fabric_core::types::{EventDescriptor, EventId, EventSubscriberDescriptor};
use fabric_core::{
    ExceptionInfo, FabricConfig, InMemoryFabric, InMemoryStateStorage, InvokeOptions,
    InvokeOutcome, MethodId, Resume, Routine, RoutineCall, RoutineEngine, RoutineRegistry,
    ServiceId, Suspension, TaskResult, Transition, TransitionContext,
};

type Step<S> = std::result::Result<Transition<S>, ExceptionInfo>;

#[derive(Serialize, Deserialize)]
enum CheckoutState {
    Debiting { order: String },
    Fulfilling { order: String, debited: Value },
}

struct Checkout;

impl Routine for Checkout {
    type State = CheckoutState;

    fn start(&self, parameters: Value, ctx: &mut TransitionContext) -> Step<CheckoutState> {
        let order = parameters["order"].as_str().unwrap_or("unknown").to_string();
        let amount = parameters["amount"].as_i64().unwrap_or(0);
        ctx.set_flow("order", order.clone());
        let debit = RoutineCall::new("billing", "Debit", json!({ "tx": order, "amount": amount }))
            .with_idempotency_key(format!("tx={order}"));
        Ok(Transition::call(CheckoutState::Debiting { order }, debit))
    }

    fn resume(
        &self,
        state: CheckoutState,
        resume: Resume,
        ctx: &mut TransitionContext,
    ) -> Step<CheckoutState> {
        let Resume::Completed(result) = resume else {
            return Err(ExceptionInfo::new("UnexpectedWakeup", "checkout never sleeps"));
        };
        match (state, result) {
            (CheckoutState::Debiting { order }, TaskResult::Succeeded(debited)) => {
                let calls = vec![
                    RoutineCall::new("inventory", "Reserve", json!({ "order": order })),
                    RoutineCall::new("shipping", "Quote", json!({ "order": order })),
                ];
                Ok(Transition::suspend(
                    CheckoutState::Fulfilling { order, debited },
                    Suspension::WhenAll(calls),
                ))
            }
            (CheckoutState::Fulfilling { order, debited }, TaskResult::Succeeded(parts)) => {
                ctx.raise_event("CheckedOut", json!({ "order": order }));
                Ok(Transition::succeed(
                    CheckoutState::Fulfilling {
                        order: order.clone(),
                        debited: debited.clone(),
                    },
                    json!({ "order": order, "debit": debited, "fulfilment": parts }),
                ))
            }
            (_, failed) => Ok(Transition::complete(
                CheckoutState::Debiting {
                    order: String::new(),
                },
                failed,
            )),
        }
    }
}

/// A routine that finishes in its first transition.
struct Immediate<F>(F);

impl<F> Routine for Immediate<F>
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    type State = ();

    fn start(&self, parameters: Value, _ctx: &mut TransitionContext) -> Step<()> {
        Ok(Transition::succeed((), (self.0)(parameters)))
    }

    fn resume(&self, _: (), _: Resume, _: &mut TransitionContext) -> Step<()> {
        Err(ExceptionInfo::new("UnexpectedResume", "immediate routines never suspend"))
    }
}

fn routines() -> Result<RoutineRegistry> {
    let mut routines = RoutineRegistry::new();
    routines
        .register("shop", "Checkout", Checkout)?
        .register(
            "billing",
            "Debit",
            Immediate(|p: Value| json!({ "tx": p["tx"], "debited": p["amount"] })),
        )?
        .register("inventory", "Reserve", Immediate(|_: Value| json!("reserved")))?
        .register("shipping", "Quote", Immediate(|_: Value| json!({ "carrier": "post", "price": 5 })))?
        .register(
            "audit",
            "OnCheckedOut",
            Immediate(|p: Value| {
                tracing::info!(order = %p["order"], "Audit saw checkout");
                Value::Null
            }),
        )?;
    Ok(routines)
}

#[tokio::main]
async fn main() -> Result<()> {
    fabric_core::telemetry::init_tracing("fabric_core=info,fabric_demo=info");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => FabricConfig::load_from_file(&path)?,
        None => FabricConfig::default(),
    };

    let storage = Arc::new(InMemoryStateStorage::new());
    let fabric = Arc::new(InMemoryFabric::with_options(
        storage.clone(),
        config.runtime.worker_pool_size,
        config.runtime.redelivery.policy(),
    ));
    let engine = RoutineEngine::builder(config)
        .routines(routines()?)
        .storage(storage)
        .connector(fabric.clone())
        .build()
        .context("Building routine engine")?;
    fabric.bind_handler(engine.message_handler())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = fabric.start(shutdown_rx)?;

    engine
        .subscribe(&SubscribeToEventIntent {
            event: EventDescriptor {
                service: ServiceId::new("shop"),
                event: EventId::new("CheckedOut"),
            },
            subscriber: EventSubscriberDescriptor {
                service: ServiceId::new("audit"),
                method: MethodId::new("OnCheckedOut"),
            },
        })
        .await?;

    let params = json!({ "order": "42", "amount": 10 });
    let options = InvokeOptions {
        prefer_sync: true,
        wait: Some(Duration::from_secs(10)),
        ..InvokeOptions::idempotent("order-42")
    };
    for attempt in 1..=2 {
        match engine
            .invoke("shop", "Checkout", params.clone(), options.clone())
            .await?
        {
            InvokeOutcome::Completed(result) => {
                tracing::info!(attempt, result = %serde_json::to_string(&result)?, "Checkout finished")
            }
            other => tracing::warn!(attempt, outcome = ?other, "Checkout still running"),
        }
    }

    fabric.wait_idle().await;
    engine.events().drain().await;
    tracing::info!(
        scheduled = fabric.scheduled_count(),
        published = fabric.published_events().len(),
        dead_letters = fabric.dead_letters().len(),
        "Demo complete"
    );

    shutdown_tx.send(true).context("Signalling shutdown")?;
    worker.await.context("Joining fabric worker")?;
    Ok(())
}
