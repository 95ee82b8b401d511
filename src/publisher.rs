//! Fan-out of prayer-times state changes to interested consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::models::PrayerTimesResult;

/// Listener invoked with `(data, loading, error)` on every state transition.
pub type SubscriberCallback =
    Arc<dyn Fn(Option<&PrayerTimesResult>, bool, Option<&str>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, SubscriberCallback>,
}

/// Registered-callback list. Callbacks run synchronously, in no particular order.
#[derive(Clone, Default)]
pub struct Publisher {
    registry: Arc<Mutex<Registry>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It stays registered until the returned guard is
    /// dropped or `unsubscribe` is called on it.
    pub fn subscribe(&self, callback: SubscriberCallback) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, callback);

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every registered callback.
    pub fn notify(&self, data: Option<&PrayerTimesResult>, loading: bool, error: Option<&str>) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking
        let callbacks: Vec<SubscriberCallback> =
            lock(&self.registry).subscribers.values().cloned().collect();

        for callback in callbacks {
            callback(data, loading, error);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by `Publisher::subscribe`.
#[must_use = "dropping a Subscription unsubscribes the callback"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
    }
}

/// What a consumer shows: the last data it received plus the current
/// loading and error flags.
///
/// A loading or error notification carries no data, but it never wipes data
/// that was already shown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrayerTimesState {
    pub data: Option<PrayerTimesResult>,
    pub loading: bool,
    pub error: Option<String>,
}

impl PrayerTimesState {
    pub fn apply(&mut self, data: Option<&PrayerTimesResult>, loading: bool, error: Option<&str>) {
        if let Some(data) = data {
            self.data = Some(data.clone());
        }
        self.loading = loading;
        self.error = error.map(str::to_string);
    }

    /// No data and an error present: the consumer should offer a retry.
    pub fn needs_retry(&self) -> bool {
        self.data.is_none() && self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::{PrayerDate, PrayerTiming};

    fn sample_result() -> PrayerTimesResult {
        PrayerTimesResult {
            timings: PrayerTiming {
                fajr: "04:00".into(),
                sunrise: "05:30".into(),
                dhuhr: "12:00".into(),
                asr: "15:30".into(),
                maghrib: "18:30".into(),
                isha: "20:00".into(),
            },
            timezone: "UTC".into(),
            date: PrayerDate::default(),
            method: None,
        }
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> SubscriberCallback {
        let counter = counter.clone();
        Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_reaches_every_subscriber() {
        let publisher = Publisher::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let _sa = publisher.subscribe(counting_callback(&a));
        let _sb = publisher.subscribe(counting_callback(&b));

        publisher.notify(None, true, None);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let publisher = Publisher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let subscription = publisher.subscribe(counting_callback(&count));

        publisher.notify(None, true, None);
        subscription.unsubscribe();
        publisher.notify(None, false, None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_guard_unsubscribes() {
        let publisher = Publisher::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let _subscription = publisher.subscribe(counting_callback(&count));
            assert_eq!(publisher.subscriber_count(), 1);
        }
        publisher.notify(None, false, Some("offline"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscription_outliving_publisher_is_harmless() {
        let publisher = Publisher::new();
        let subscription = publisher.subscribe(Arc::new(|_, _, _| {}));
        drop(publisher);
        drop(subscription);
    }

    #[test]
    fn test_state_keeps_data_through_loading_and_error() {
        let mut state = PrayerTimesState::default();
        let result = sample_result();

        state.apply(Some(&result), false, None);
        state.apply(None, true, None);
        assert!(state.loading);
        assert_eq!(state.data.as_ref(), Some(&result));

        state.apply(None, false, Some("Network down"));
        assert!(!state.loading);
        assert_eq!(state.error.as_deref(), Some("Network down"));
        assert_eq!(state.data.as_ref(), Some(&result));
        assert!(!state.needs_retry());
    }

    #[test]
    fn test_state_without_data_needs_retry() {
        let mut state = PrayerTimesState::default();
        state.apply(None, false, Some("Location permission not granted"));
        assert!(state.needs_retry());
    }
}
