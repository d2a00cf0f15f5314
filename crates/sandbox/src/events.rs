//! Page-originated events and their fan-out
//!
//! The page driver pushes every event through an [`EventHub`]. Synchronous
//! observers run first, in registration order, inside [`EventHub::emit`];
//! only then are the async subscribers woken. Session bookkeeping (clearing
//! buffers on navigation) therefore always lands before any waiter sees the
//! same event.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

/// Something the page told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// The top-level frame finished a navigation
    Navigated { url: String },
    /// The hot-update consumer reported a successful update
    HotUpdateApplied,
    /// The hot-update consumer reported an error
    HotUpdateError { message: String },
    /// A console message from the page
    Console { text: String },
}

type Observer = Arc<dyn Fn(&PageEvent) + Send + Sync>;

/// Fan-out point for page events. Clones share observers and channels.
#[derive(Clone)]
pub struct EventHub {
    observers: Arc<Mutex<Vec<Observer>>>,
    navigations: broadcast::Sender<String>,
    hot_updates: broadcast::Sender<()>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (navigations, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (hot_updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            observers: Arc::new(Mutex::new(Vec::new())),
            navigations,
            hot_updates,
        }
    }

    /// Register an observer that runs synchronously for every event.
    pub fn observe<F>(&self, observer: F)
    where
        F: Fn(&PageEvent) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    /// Listener for main-frame navigations. Dropping it detaches it.
    pub fn subscribe_navigations(&self) -> broadcast::Receiver<String> {
        self.navigations.subscribe()
    }

    /// Listener for hot-update success notifications. Dropping it detaches it.
    pub fn subscribe_hot_updates(&self) -> broadcast::Receiver<()> {
        self.hot_updates.subscribe()
    }

    pub fn emit(&self, event: PageEvent) {
        trace!(?event, "Page event");

        let observers: Vec<Observer> = self.observers.lock().clone();
        for observer in &observers {
            observer(&event);
        }

        // No receivers is the normal case outside of a patch.
        match event {
            PageEvent::Navigated { url } => {
                let _ = self.navigations.send(url);
            }
            PageEvent::HotUpdateApplied => {
                let _ = self.hot_updates.send(());
            }
            PageEvent::HotUpdateError { .. } | PageEvent::Console { .. } => {}
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observers.lock().len())
            .field("navigation_listeners", &self.navigations.receiver_count())
            .field("hot_update_listeners", &self.hot_updates.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observers_run_before_subscribers_wake() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        hub.observe(move |event| log.lock().push(format!("{:?}", event)));

        let mut rx = hub.subscribe_navigations();
        hub.emit(PageEvent::Navigated { url: "http://localhost/".into() });

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(rx.recv().await.unwrap(), "http://localhost/");
    }

    #[tokio::test]
    async fn test_dropped_listener_is_detached() {
        let hub = EventHub::new();
        let rx = hub.subscribe_hot_updates();
        assert_eq!(hub.hot_updates.receiver_count(), 1);
        drop(rx);
        assert_eq!(hub.hot_updates.receiver_count(), 0);

        // Emitting with nobody listening is fine.
        hub.emit(PageEvent::HotUpdateApplied);
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let hub = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            hub.observe(move |_| order.lock().push(i));
        }
        hub.emit(PageEvent::Console { text: "hi".into() });
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
