//! fabric-core: transition engine for durable, resumable routines.
//!
//! A routine runs as a sequence of transitions. Each transition ends at a
//! suspension point and produces one batch of intents, which is committed
//! under an ETag precondition and then dispatched. Redelivered work replays
//! the persisted outbox instead of running twice.

pub mod committer;
pub mod communicator;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod fabric_memory;
pub mod intent;
pub mod monitor;
pub mod notifier;
pub mod registry;
pub mod retry;
pub mod routine;
pub mod run_mode;
pub mod settings;
pub mod store;
pub mod store_memory;
pub mod telemetry;
pub mod types;
pub mod when_all;

pub use committer::{CommitOptions, CommitPhase, CommitReport, TransitionCommitter};
pub use communicator::{
    CommunicationTraits, Communicator, FabricCommunicator, InvokeOutcome, InvokePreferences,
};
pub use config::FabricConfig;
pub use connector::{
    ActiveRoutineInfo, ConnectorCapabilities, FabricConnector, FabricMessage, MessageHandler,
    MessageLease,
};
pub use engine::{EngineBuilder, InvokeOptions, RoutineEngine};
pub use error::{FabricError, Result};
pub use fabric_memory::InMemoryFabric;
pub use intent::{Intent, ScheduledActions};
pub use routine::{Resume, Routine, RoutineCall, RoutineRegistry, Suspension, Transition, TransitionContext};
pub use run_mode::RunMode;
pub use store::{MethodStateStorage, RoutineKey};
pub use store_memory::InMemoryStateStorage;
pub use types::{ETag, ExceptionInfo, IntentId, MethodId, ServiceId, TaskResult};
