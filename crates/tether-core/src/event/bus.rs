//! Broadcast event bus for distributing `RunEvent` to subscribers and observers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! Observers registered for a [`RunEventKind`] are called synchronously on
//! every matching publish.

use std::sync::Arc;

use dashmap::DashMap;
use tether_types::event::{RunEvent, RunEventKind};
use tokio::sync::broadcast;

/// Lifecycle hook invoked for events of the kinds it was registered for.
///
/// Called inline from the publishing task, so implementations should return
/// quickly and spawn any slow work.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Blanket implementation so plain closures can be registered as observers.
impl<F> RunObserver for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        self(event)
    }
}

/// Multi-consumer event bus for run lifecycle events.
///
/// Cloning the bus clones the sender and shares the observer registry.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    observers: Arc<DashMap<RunEventKind, Vec<Arc<dyn RunObserver>>>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: Arc::new(DashMap::new()),
        }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Register an observer for one event kind.
    pub fn register(&self, kind: RunEventKind, observer: Arc<dyn RunObserver>) {
        self.observers.entry(kind).or_default().push(observer);
    }

    /// Publish an event to all current subscribers and matching observers.
    pub fn publish(&self, event: RunEvent) {
        let observers: Vec<Arc<dyn RunObserver>> = self
            .observers
            .get(&event.kind())
            .map(|list| list.clone())
            .unwrap_or_default();
        for observer in observers {
            observer.on_event(&event);
        }
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            observers: Arc::clone(&self.observers),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .field("observer_kinds", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_types::step::ErrorInfo;
    use uuid::Uuid;

    fn failed_event() -> RunEvent {
        RunEvent::RunFailed {
            run_id: Uuid::now_v7(),
            job_id: "invoke-example-1".to_string(),
            error: ErrorInfo::new("TaskError", "Forced error"),
        }
    }

    fn succeeded_event() -> RunEvent {
        RunEvent::RunSucceeded {
            run_id: Uuid::now_v7(),
            job_id: "invoke-example-1".to_string(),
            output: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(failed_event());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), RunEventKind::RunFailed);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(failed_event());
        bus.publish(succeeded_event());
    }

    #[test]
    fn observers_only_see_their_kind() {
        let bus = EventBus::new(16);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        bus.register(
            RunEventKind::RunFailed,
            Arc::new(move |_: &RunEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(succeeded_event());
        bus.publish(failed_event());
        bus.publish(failed_event());

        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clone_shares_channel_and_observers() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus2.register(
            RunEventKind::RunSucceeded,
            Arc::new(move |_: &RunEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(succeeded_event());

        assert!(rx.try_recv().is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lagged_receiver_handles_gracefully() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(failed_event());
        }
        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
