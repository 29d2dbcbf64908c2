//! Event subscription and fan-out publish.
//!
//! Subscriptions arrive as committed intents and are recorded by the
//! connector. A publish resolves the subscriber set through the connector,
//! using the process-local table only as a cache, and starts one independent
//! delivery per subscriber; the publishing transition never waits on them.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use tokio::task::JoinSet;

use crate::connector::FabricConnector;
use crate::error::{FabricError, Result};
use crate::intent::{RaiseEventIntent, SubscribeToEventIntent};
use crate::retry::RetryPolicy;
use crate::types::{EventDescriptor, EventSubscriberDescriptor};

/// The process-local side of event delivery. Implemented by the engine and
/// bound after construction.
#[async_trait]
pub trait LocalRoutineHost: Send + Sync {
    /// Whether `subscriber` should run in this process for `event`.
    fn runs_in_place(&self, event: &EventDescriptor, subscriber: &EventSubscriberDescriptor)
        -> bool;

    async fn run_event(
        &self,
        intent: RaiseEventIntent,
        subscriber: EventSubscriberDescriptor,
    ) -> Result<()>;
}

pub struct EventDispatcher {
    subscribers: RwLock<HashMap<EventDescriptor, BTreeSet<EventSubscriberDescriptor>>>,
    connector: Arc<dyn FabricConnector>,
    host: OnceLock<Weak<dyn LocalRoutineHost>>,
    retry: RetryPolicy,
    deliveries: Mutex<JoinSet<()>>,
}

fn poison_err<T>(_: PoisonError<T>) -> FabricError {
    FabricError::transient("event dispatcher lock poisoned")
}

impl EventDispatcher {
    pub fn new(connector: Arc<dyn FabricConnector>, retry: RetryPolicy) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            connector,
            host: OnceLock::new(),
            retry,
            deliveries: Mutex::new(JoinSet::new()),
        }
    }

    pub fn bind_host(&self, host: Weak<dyn LocalRoutineHost>) -> Result<()> {
        self.host
            .set(host)
            .map_err(|_| FabricError::configuration("event dispatcher host bound twice"))
    }

    fn host(&self) -> Option<Arc<dyn LocalRoutineHost>> {
        self.host.get().and_then(Weak::upgrade)
    }

    /// Add a subscriber. Returns `false` when it was already subscribed.
    pub async fn subscribe(&self, intent: &SubscribeToEventIntent) -> Result<bool> {
        let added = {
            let mut table = self.subscribers.write().map_err(poison_err)?;
            table
                .entry(intent.event.clone())
                .or_default()
                .insert(intent.subscriber.clone())
        };
        if self.connector.capabilities().events {
            // Repeated on duplicates so a lost backend registration heals.
            self.connector.subscribe_for_event(intent).await?;
            if added {
                self.connector
                    .on_event_subscriber_added(&intent.event, &intent.subscriber)
                    .await?;
            }
        }
        if added {
            tracing::info!(
                event = %intent.event.event,
                publisher = %intent.event.service,
                subscriber = %intent.subscriber.service,
                handler = %intent.subscriber.method,
                "Event subscriber added"
            );
        }
        Ok(added)
    }

    /// Subscribers known to this process without asking the connector.
    pub fn cached_subscribers(
        &self,
        event: &EventDescriptor,
    ) -> Result<Vec<EventSubscriberDescriptor>> {
        let table = self.subscribers.read().map_err(poison_err)?;
        Ok(table
            .get(event)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Current subscribers of `event`: the connector's record merged into the
    /// local cache. Without connector event support only the cache is known.
    pub async fn subscribers(
        &self,
        event: &EventDescriptor,
    ) -> Result<Vec<EventSubscriberDescriptor>> {
        if !self.connector.capabilities().events {
            return self.cached_subscribers(event);
        }
        let recorded = match self.connector.event_subscribers(event).await {
            Ok(recorded) => recorded,
            Err(FabricError::Unsupported { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut table = self.subscribers.write().map_err(poison_err)?;
        let known = table.entry(event.clone()).or_default();
        known.extend(recorded);
        Ok(known.iter().cloned().collect())
    }

    /// Start one delivery per current subscriber and return how many were
    /// started.
    pub async fn publish(&self, intent: &RaiseEventIntent) -> Result<usize> {
        let subscribers = self.subscribers(&intent.event).await?;
        let host = self.host();
        let started = {
            let mut deliveries = self.deliveries.lock().map_err(poison_err)?;
            while let Some(finished) = deliveries.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "Event delivery task failed");
                }
            }
            let mut started = 0;
            for subscriber in subscribers {
                let local = host
                    .as_ref()
                    .filter(|h| h.runs_in_place(&intent.event, &subscriber))
                    .cloned();
                if local.is_none() && !self.connector.capabilities().events {
                    tracing::warn!(
                        event = %intent.event.event,
                        subscriber = %subscriber.service,
                        "Remote subscriber but connector has no event support; skipped"
                    );
                    continue;
                }
                deliveries.spawn(deliver(
                    intent.clone(),
                    subscriber,
                    local,
                    Arc::clone(&self.connector),
                    self.retry,
                ));
                started += 1;
            }
            started
        };

        tracing::debug!(
            event = %intent.event.event,
            publisher = %intent.event.service,
            deliveries = started,
            "Event published"
        );
        Ok(started)
    }

    /// Deliveries started and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.deliveries.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Wait for every delivery started so far.
    pub async fn drain(&self) {
        let mut deliveries = match self.deliveries.lock() {
            Ok(mut d) => std::mem::take(&mut *d),
            Err(_) => return,
        };
        while deliveries.join_next().await.is_some() {}
    }
}

impl Drop for EventDispatcher {
    /// Deliveries in flight keep running after the dispatcher is gone.
    fn drop(&mut self) {
        if let Ok(deliveries) = self.deliveries.get_mut() {
            deliveries.detach_all();
        }
    }
}

async fn deliver(
    intent: RaiseEventIntent,
    subscriber: EventSubscriberDescriptor,
    local: Option<Arc<dyn LocalRoutineHost>>,
    connector: Arc<dyn FabricConnector>,
    retry: RetryPolicy,
) {
    let operation = if local.is_some() {
        "deliver_event_local"
    } else {
        "deliver_event_remote"
    };
    let outcome = retry
        .run(operation, || {
            let intent = intent.clone();
            let subscriber = subscriber.clone();
            let local = local.clone();
            let connector = Arc::clone(&connector);
            async move {
                match local {
                    Some(host) => host.run_event(intent, subscriber).await,
                    None => connector.publish_event(&intent, &subscriber).await,
                }
            }
        })
        .await;
    if let Err(e) = outcome {
        tracing::error!(
            event = %intent.event.event,
            subscriber = %subscriber.service,
            handler = %subscriber.method,
            error = %e,
            "Event delivery abandoned"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ActiveRoutineInfo, ConnectorCapabilities, ScheduledRoutine};
    use crate::fabric_memory::InMemoryFabric;
    use crate::intent::{ContinueRoutineIntent, ExecuteRoutineIntent};
    use crate::store_memory::InMemoryStateStorage;
    use crate::types::{EventId, IntentId, MethodId, ServiceId};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct CountingHost {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl LocalRoutineHost for CountingHost {
        fn runs_in_place(&self, _e: &EventDescriptor, s: &EventSubscriberDescriptor) -> bool {
            s.service.name == "audit"
        }

        async fn run_event(
            &self,
            _intent: RaiseEventIntent,
            _subscriber: EventSubscriberDescriptor,
        ) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Records subscriptions and rejects the first `failures` publishes.
    struct UnsteadyBroker {
        table: Mutex<Vec<EventSubscriberDescriptor>>,
        failures: AtomicU32,
        delivered: AtomicU32,
    }

    impl UnsteadyBroker {
        fn failing(failures: u32) -> Self {
            Self {
                table: Mutex::new(Vec::new()),
                failures: AtomicU32::new(failures),
                delivered: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl FabricConnector for UnsteadyBroker {
        fn name(&self) -> &str {
            "unsteady"
        }

        fn capabilities(&self) -> ConnectorCapabilities {
            ConnectorCapabilities {
                events: true,
                ..Default::default()
            }
        }

        async fn schedule_routine(&self, intent: &ExecuteRoutineIntent) -> Result<ScheduledRoutine> {
            Ok(ScheduledRoutine {
                routine_id: intent.id.to_string(),
                etag: None,
                deduplicated: false,
            })
        }

        async fn poll_routine_result(&self, info: &ActiveRoutineInfo) -> Result<ActiveRoutineInfo> {
            Ok(info.clone())
        }

        async fn schedule_continuation(&self, _intent: &ContinueRoutineIntent) -> Result<()> {
            Ok(())
        }

        async fn subscribe_for_event(&self, intent: &SubscribeToEventIntent) -> Result<()> {
            self.table.lock().unwrap().push(intent.subscriber.clone());
            Ok(())
        }

        async fn event_subscribers(
            &self,
            _event: &EventDescriptor,
        ) -> Result<Vec<EventSubscriberDescriptor>> {
            Ok(self.table.lock().unwrap().clone())
        }

        async fn publish_event(
            &self,
            _intent: &RaiseEventIntent,
            _subscriber: &EventSubscriberDescriptor,
        ) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(FabricError::transient("broker unavailable"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn raised(payload: serde_json::Value) -> RaiseEventIntent {
        RaiseEventIntent {
            id: IntentId::generate(),
            event: debited(),
            payload,
            caller: None,
            flow_context: Default::default(),
        }
    }

    fn debited() -> EventDescriptor {
        EventDescriptor {
            service: ServiceId::new("billing"),
            event: EventId::new("Debited"),
        }
    }

    fn subscription(service: &str) -> SubscribeToEventIntent {
        SubscribeToEventIntent {
            event: debited(),
            subscriber: EventSubscriberDescriptor {
                service: ServiceId::new(service),
                method: MethodId::new("OnDebited"),
            },
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_local_and_remote() {
        let fabric = Arc::new(InMemoryFabric::new(Arc::new(InMemoryStateStorage::new())));
        let dispatcher = EventDispatcher::new(fabric.clone(), RetryPolicy::interactive());
        let host = Arc::new(CountingHost {
            runs: AtomicUsize::new(0),
        });
        let weak: Weak<dyn LocalRoutineHost> = Arc::downgrade(&(host.clone() as Arc<dyn LocalRoutineHost>));
        dispatcher.bind_host(weak).unwrap();

        assert!(dispatcher.subscribe(&subscription("audit")).await.unwrap());
        assert!(!dispatcher.subscribe(&subscription("audit")).await.unwrap());
        assert!(dispatcher.subscribe(&subscription("crm")).await.unwrap());
        assert_eq!(dispatcher.subscribers(&debited()).await.unwrap().len(), 2);

        let started = dispatcher
            .publish(&RaiseEventIntent {
                id: IntentId::generate(),
                event: debited(),
                payload: json!({"amount": 10}),
                caller: None,
                flow_context: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(started, 2);
        dispatcher.drain().await;

        assert_eq!(host.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fabric.published_events().len(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_empty() {
        let fabric = Arc::new(InMemoryFabric::new(Arc::new(InMemoryStateStorage::new())));
        let dispatcher = EventDispatcher::new(fabric, RetryPolicy::interactive());
        let started = dispatcher
            .publish(&RaiseEventIntent {
                id: IntentId::generate(),
                event: debited(),
                payload: json!(null),
                caller: None,
                flow_context: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(started, 0);
    }

    #[tokio::test]
    async fn subscribers_recorded_by_the_fabric_reach_every_dispatcher() {
        let fabric = Arc::new(InMemoryFabric::new(Arc::new(InMemoryStateStorage::new())));
        let subscribing = EventDispatcher::new(fabric.clone(), RetryPolicy::interactive());
        let publishing = EventDispatcher::new(fabric.clone(), RetryPolicy::interactive());

        assert!(subscribing.subscribe(&subscription("crm")).await.unwrap());
        assert!(publishing.cached_subscribers(&debited()).unwrap().is_empty());

        let started = publishing.publish(&raised(json!({"amount": 4}))).await.unwrap();
        assert_eq!(started, 1);
        publishing.drain().await;

        let published = fabric.published_events();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.service, ServiceId::new("crm"));
        assert_eq!(publishing.cached_subscribers(&debited()).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_policy_outlasts_a_long_broker_outage() {
        let broker = Arc::new(UnsteadyBroker::failing(8));
        let dispatcher = EventDispatcher::new(broker.clone(), RetryPolicy::background());
        dispatcher.subscribe(&subscription("crm")).await.unwrap();

        assert_eq!(dispatcher.publish(&raised(json!(1))).await.unwrap(), 1);
        dispatcher.drain().await;

        assert_eq!(broker.failures.load(Ordering::SeqCst), 0);
        assert_eq!(broker.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_deliveries_are_reaped_on_publish() {
        let broker = Arc::new(UnsteadyBroker::failing(0));
        let dispatcher = EventDispatcher::new(broker.clone(), RetryPolicy::no_retry());
        dispatcher.subscribe(&subscription("crm")).await.unwrap();

        for _ in 0..10 {
            dispatcher.publish(&raised(json!(null))).await.unwrap();
            // Let the spawned delivery run to completion.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        assert!(dispatcher.in_flight() <= 1);
        dispatcher.drain().await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(broker.delivered.load(Ordering::SeqCst), 10);
    }
}
