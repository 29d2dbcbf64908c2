//! Routine completion notifier.
//!
//! Bridges dispatched execution with callers that want to block: a sink is
//! registered before dispatch, and the wait races a push (the committer saw
//! the result) against periodic polling. Waits are capped; running past the
//! cap reports "still running", not an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{FabricError, Result};
use crate::types::{IntentId, TaskResult};

/// Upper bound on any single long-poll wait.
pub const DEFAULT_MAX_LONG_POLL: Duration = Duration::from_secs(60);

/// Interval between polls while waiting for a push.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Completed(TaskResult),
    StillRunning,
}

/// Receives the result of one routine.
#[derive(Debug)]
pub struct CompletionSink {
    intent_id: IntentId,
    rx: oneshot::Receiver<TaskResult>,
}

impl CompletionSink {
    pub fn intent_id(&self) -> IntentId {
        self.intent_id
    }
}

#[derive(Debug)]
pub struct RoutineCompletionNotifier {
    sinks: Mutex<HashMap<IntentId, Vec<oneshot::Sender<TaskResult>>>>,
    max_wait: Duration,
    poll_interval: Duration,
}

impl Default for RoutineCompletionNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LONG_POLL, DEFAULT_POLL_INTERVAL)
    }
}

fn poison_err<T>(_: PoisonError<T>) -> FabricError {
    FabricError::transient("completion notifier lock poisoned")
}

impl RoutineCompletionNotifier {
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            max_wait,
            poll_interval,
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Sinks abandoned without a wait are swept here.
    pub fn register(&self, intent_id: IntentId) -> Result<CompletionSink> {
        let (tx, rx) = oneshot::channel();
        let mut sinks = self.sinks.lock().map_err(poison_err)?;
        sinks.retain(|_, waiting| {
            waiting.retain(|s| !s.is_closed());
            !waiting.is_empty()
        });
        sinks.entry(intent_id).or_default().push(tx);
        Ok(CompletionSink { intent_id, rx })
    }

    fn release(&self, intent_id: &IntentId) {
        let Ok(mut sinks) = self.sinks.lock() else {
            return;
        };
        if let Some(waiting) = sinks.get_mut(intent_id) {
            waiting.retain(|s| !s.is_closed());
            if waiting.is_empty() {
                sinks.remove(intent_id);
            }
        }
    }

    /// Resolve every sink registered for `intent_id`. Returns how many
    /// waiters were reached.
    pub fn notify(&self, intent_id: &IntentId, result: &TaskResult) -> usize {
        let waiting = match self.sinks.lock() {
            Ok(mut sinks) => sinks.remove(intent_id).unwrap_or_default(),
            Err(_) => return 0,
        };
        let reached = waiting
            .into_iter()
            .filter_map(|tx| tx.send(result.clone()).ok())
            .count();
        if reached > 0 {
            tracing::debug!(intent_id = %intent_id, waiters = reached, "Completion pushed");
        }
        reached
    }

    pub fn pending(&self) -> usize {
        self.sinks
            .lock()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Wait for the result, polling with `poll` in between pushes. The wait
    /// ends after `wait` or the configured maximum, whichever is shorter.
    pub async fn wait<P, Fut>(
        &self,
        sink: CompletionSink,
        wait: Duration,
        mut poll: P,
    ) -> Result<WaitOutcome>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<TaskResult>>>,
    {
        let intent_id = sink.intent_id;
        let mut waiter = Waiter {
            notifier: self,
            sink,
        };
        let rx = &mut waiter.sink.rx;
        let deadline = tokio::time::Instant::now() + wait.min(self.max_wait);

        if let Some(result) = poll().await? {
            return Ok(WaitOutcome::Completed(result));
        }

        let mut push_open = true;
        loop {
            let next_poll = tokio::time::Instant::now() + self.poll_interval;
            tokio::select! {
                biased;
                pushed = &mut *rx, if push_open => {
                    match pushed {
                        Ok(result) => return Ok(WaitOutcome::Completed(result)),
                        // Sender dropped without a result; fall back to polling.
                        Err(_) => push_open = false,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(intent_id = %intent_id, "Long poll window elapsed; still running");
                    return Ok(WaitOutcome::StillRunning);
                }
                _ = tokio::time::sleep_until(next_poll.min(deadline)) => {
                    if let Some(result) = poll().await? {
                        return Ok(WaitOutcome::Completed(result));
                    }
                }
            }
        }
    }
}

/// Closes the receiver and drops its sender from the notifier however the
/// wait ends.
struct Waiter<'a> {
    notifier: &'a RoutineCompletionNotifier,
    sink: CompletionSink,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.sink.rx.close();
        self.notifier.release(&self.sink.intent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn never() -> Result<Option<TaskResult>> {
        Ok(None)
    }

    #[tokio::test(start_paused = true)]
    async fn push_resolves_the_wait() {
        let notifier = Arc::new(RoutineCompletionNotifier::default());
        let id = IntentId::generate();
        let sink = notifier.register(id).unwrap();

        let pusher = Arc::clone(&notifier);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            pusher.notify(&id, &TaskResult::success(json!(3)));
        });

        let outcome = notifier.wait(sink, Duration::from_secs(10), never).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(TaskResult::success(json!(3))));
        assert_eq!(notifier.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_resolves_the_wait() {
        let notifier = RoutineCompletionNotifier::default();
        let sink = notifier.register(IntentId::generate()).unwrap();
        let counter = AtomicU32::new(0);
        let polls = &counter;
        let outcome = notifier
            .wait(sink, Duration::from_secs(10), move || async move {
                if polls.fetch_add(1, Ordering::SeqCst) >= 3 {
                    Ok(Some(TaskResult::Canceled))
                } else {
                    Ok(None)
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(TaskResult::Canceled));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_capped_by_max_long_poll() {
        let notifier = RoutineCompletionNotifier::new(Duration::from_secs(5), Duration::from_secs(1));
        let sink = notifier.register(IntentId::generate()).unwrap();
        let started = tokio::time::Instant::now();
        let outcome = notifier
            .wait(sink, Duration::from_secs(3600), never)
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::StillRunning);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_waits_leave_no_sinks_behind() {
        let notifier = RoutineCompletionNotifier::new(Duration::from_secs(2), Duration::from_millis(100));
        for n in 0..3 {
            let sink = notifier.register(IntentId::generate()).unwrap();
            let outcome = notifier
                .wait(sink, Duration::from_secs(1), move || async move {
                    Ok(Some(TaskResult::success(json!(n))))
                })
                .await
                .unwrap();
            assert_eq!(outcome, WaitOutcome::Completed(TaskResult::success(json!(n))));
        }
        let sink = notifier.register(IntentId::generate()).unwrap();
        let outcome = notifier.wait(sink, Duration::from_secs(1), never).await.unwrap();
        assert_eq!(outcome, WaitOutcome::StillRunning);

        assert_eq!(notifier.pending(), 0);
    }

    #[test]
    fn abandoned_sinks_are_swept_on_register() {
        let notifier = RoutineCompletionNotifier::default();
        for _ in 0..3 {
            drop(notifier.register(IntentId::generate()).unwrap());
        }
        let _live = notifier.register(IntentId::generate()).unwrap();
        assert_eq!(notifier.pending(), 1);
    }

    #[test]
    fn notify_without_waiters_is_a_no_op() {
        let notifier = RoutineCompletionNotifier::default();
        assert_eq!(notifier.notify(&IntentId::generate(), &TaskResult::Canceled), 0);
    }
}
