//! Intent dispatch: routes each committed intent to the communicator,
//! connector or event dispatcher responsible for it.

use std::sync::Arc;

use crate::communicator::{InvokeOutcome, InvokePreferences};
use crate::connector::FabricConnector;
use crate::error::{FabricError, Result};
use crate::events::EventDispatcher;
use crate::intent::Intent;
use crate::registry::CommunicatorRegistry;
use crate::retry::RetryPolicy;

pub struct IntentDispatcher {
    communicators: Arc<CommunicatorRegistry>,
    connector: Arc<dyn FabricConnector>,
    events: Arc<EventDispatcher>,
    retry: RetryPolicy,
}

impl IntentDispatcher {
    pub fn new(
        communicators: Arc<CommunicatorRegistry>,
        connector: Arc<dyn FabricConnector>,
        events: Arc<EventDispatcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            communicators,
            connector,
            events,
            retry,
        }
    }

    /// Deliver one intent, retrying retryable failures per the dispatch
    /// policy. Configuration errors surface immediately.
    pub async fn dispatch(&self, intent: &Intent) -> Result<()> {
        self.retry
            .run(intent.kind(), move || self.dispatch_once(intent))
            .await
    }

    async fn dispatch_once(&self, intent: &Intent) -> Result<()> {
        match intent {
            Intent::ExecuteRoutine(i) => {
                let communicator = self.communicators.resolve(&i.service, &i.method)?;
                let outcome = communicator
                    .invoke(i, &InvokePreferences::default())
                    .await?;
                tracing::debug!(
                    intent_id = %i.id,
                    service = %i.service,
                    method = %i.method,
                    communicator = communicator.name(),
                    deduplicated = matches!(outcome, InvokeOutcome::Deduplicated(_)),
                    "Dispatched execute intent"
                );
                Ok(())
            }
            Intent::ContinueRoutine(i) => {
                let target = &i.continuation;
                let communicator = self
                    .communicators
                    .resolve(&target.service, &target.routine.method)?;
                communicator.continue_routine(i).await?;
                tracing::debug!(
                    intent_id = %i.id,
                    service = %target.service,
                    target = %target.routine.intent_id,
                    task_id = target.task_id,
                    "Dispatched continuation"
                );
                Ok(())
            }
            Intent::RaiseEvent(i) => self.events.publish(i).await.map(|_| ()),
            Intent::SubscribeToEvent(i) => self.events.subscribe(i).await.map(|_| ()),
            Intent::RegisterTrigger(i) => self.connector.register_trigger(i).await,
            Intent::ActivateTrigger(i) => self.connector.activate_trigger(i).await,
            Intent::SubscribeToTrigger(i) => self.connector.subscribe_to_trigger(i).await,
            Intent::SaveState(_) => Err(FabricError::configuration(
                "state saves are applied by the committer, not dispatched",
            )),
        }
    }
}
