//! Bounded, multi-subscriber event bus, grounded in `event_bus.h`'s
//! subscribe/publish/receive/dispatch API but rebuilt on
//! `std::sync::{Mutex, Condvar}` in place of FreeRTOS queues, the same
//! primitives `main.rs`/`http_server.rs` share state with.

pub mod events;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub use events::{AlarmCode, AlarmRaised, ConfigUpdated, CvlState, CvlStateChanged, Event, EventSource, Severity, StatusMessage};

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    not_empty: Condvar,
    not_full: Condvar,
    dropped_events: AtomicU64,
    callback: Option<Callback>,
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it does not
/// unsubscribe; call [`EventBus::unsubscribe`] explicitly, mirroring the
/// original API's explicit `event_bus_unsubscribe`.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<Subscription>,
}

/// Point-in-time view of one subscriber's queue, for diagnostics surfacing.
#[derive(Debug, Clone)]
pub struct SubscriptionMetrics {
    pub name: String,
    pub queue_capacity: usize,
    pub messages_waiting: usize,
    pub dropped_events: u64,
}

/// Thread-safe pub/sub bus. Cheap to share via `Arc<EventBus>` across the
/// serial-poll, can-publish and cvl-compute tasks.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a subscription with its own bounded receive queue, identified
    /// by `name` in [`EventBus::get_all_metrics`].
    pub fn subscribe(&self, name: &str, queue_length: usize) -> SubscriptionHandle {
        self.subscribe_with_callback(name, queue_length, None)
    }

    /// Creates a subscription with a callback usable through [`EventBus::dispatch`].
    pub fn subscribe_with_callback(
        &self,
        name: &str,
        queue_length: usize,
        callback: Option<Callback>,
    ) -> SubscriptionHandle {
        let sub = Arc::new(Subscription {
            name: name.to_string(),
            capacity: queue_length.max(1),
            queue: Mutex::new(VecDeque::with_capacity(queue_length.max(1))),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            dropped_events: AtomicU64::new(0),
            callback,
        });
        self.subscriptions.lock().unwrap().push(sub.clone());
        SubscriptionHandle { inner: sub }
    }

    /// Removes a subscription; pending events in its queue are discarded.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, &handle.inner));
    }

    /// Publishes to every current subscriber, applying `timeout` to each
    /// full queue in turn. Returns true iff every subscriber accepted the
    /// event.
    pub fn publish(&self, event: Event, timeout: Duration) -> bool {
        let subscribers = self.subscriptions.lock().unwrap().clone();
        let mut all_accepted = true;

        for sub in subscribers {
            let deadline = Instant::now() + timeout;
            let mut queue = sub.queue.lock().unwrap();
            loop {
                if queue.len() < sub.capacity {
                    queue.push_back(event.clone());
                    sub.not_empty.notify_one();
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    sub.dropped_events.fetch_add(1, Ordering::Relaxed);
                    all_accepted = false;
                    break;
                }
                let (guard, result) = sub.not_full.wait_timeout(queue, remaining).unwrap();
                queue = guard;
                if result.timed_out() && queue.len() >= sub.capacity {
                    sub.dropped_events.fetch_add(1, Ordering::Relaxed);
                    all_accepted = false;
                    break;
                }
            }
        }

        all_accepted
    }

    /// Receives the next event for `handle`, waiting up to `timeout`.
    pub fn receive(&self, handle: &SubscriptionHandle, timeout: Duration) -> Option<Event> {
        let sub = &handle.inner;
        let deadline = Instant::now() + timeout;
        let mut queue = sub.queue.lock().unwrap();

        while queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = sub.not_empty.wait_timeout(queue, remaining).unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }

        let event = queue.pop_front();
        sub.not_full.notify_one();
        event
    }

    /// Receives the next event and invokes the subscription's callback.
    /// Returns false on timeout or when no callback was registered.
    pub fn dispatch(&self, handle: &SubscriptionHandle, timeout: Duration) -> bool {
        match self.receive(handle, timeout) {
            Some(event) => match &handle.inner.callback {
                Some(cb) => {
                    cb(&event);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Snapshot of every active subscription's queue depth and drop count.
    pub fn get_all_metrics(&self) -> Vec<SubscriptionMetrics> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|sub| SubscriptionMetrics {
                name: sub.name.clone(),
                queue_capacity: sub.capacity,
                messages_waiting: sub.queue.lock().unwrap().len(),
                dropped_events: sub.dropped_events.load(Ordering::Relaxed),
            })
            .collect()
    }
}
