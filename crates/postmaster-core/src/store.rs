//! Bounded event store with pause, exclusion filtering and subscribers.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{ActiveFilter, CapturedEvent, event::validate};

/// Default number of events kept before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of buffered events. Values below 1 are treated as 1.
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

/// Immutable view of the store at one point in time.
///
/// The store never mutates a published state; every change produces a new
/// one, so a snapshot obtained earlier stays valid.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    /// Buffered events, oldest first.
    pub events: VecDeque<Arc<CapturedEvent>>,
    /// While set, new traffic is dropped.
    pub paused: bool,
    /// Events matching this filter are dropped on ingest.
    pub exclusion_filter: ActiveFilter,
}

impl StoreState {
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate buffered events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CapturedEvent> {
        self.events.iter().map(AsRef::as_ref)
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    entries: Vec<(u64, Listener)>,
    next_id: u64,
}

/// Handle returned by [`EventStore::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove exactly the listener this handle was created for.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Bounded in-memory event log.
///
/// All operations are synchronous. Subscribers are invoked on the caller's
/// thread after the state swap, with no lock held, so a listener may read
/// [`EventStore::snapshot`] freely.
pub struct EventStore {
    capacity: usize,
    state: Mutex<Arc<StoreState>>,
    listeners: Arc<Mutex<Listeners>>,
    sender: watch::Sender<Arc<StoreState>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EventStore {
    /// Create an empty, running store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let initial = Arc::new(StoreState::default());
        let (sender, _) = watch::channel(Arc::clone(&initial));
        Self {
            capacity: config.capacity.max(1),
            state: Mutex::new(initial),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            sender,
        }
    }

    /// Create a store with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(StoreConfig::new(capacity))
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Validate and buffer an inbound payload.
    ///
    /// Malformed payloads, traffic while paused and events matching the
    /// exclusion filter are dropped without notifying anyone. Returns whether
    /// the event was buffered.
    pub fn ingest(&self, raw: &Value) -> bool {
        validate(raw).is_some_and(|event| self.ingest_event(event))
    }

    /// Buffer an already validated event.
    pub fn ingest_event(&self, event: CapturedEvent) -> bool {
        let capacity = self.capacity;
        self.commit(|current| {
            if current.paused {
                tracing::trace!("Store paused, dropping event");
                return None;
            }
            if current.exclusion_filter.excludes(&event) {
                tracing::trace!(origin = %event.origin, "Event excluded by filter");
                return None;
            }

            let mut next = current.clone();
            next.events.push_back(Arc::new(event));
            if next.events.len() > capacity {
                next.events.pop_front();
            }
            Some(next)
        })
    }

    /// Register a callback run after every state change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreState> {
        Arc::clone(&lock(&self.state))
    }

    /// Flip between paused and running. Buffered events are kept.
    pub fn toggle_pause(&self) {
        self.commit(|current| {
            Some(StoreState {
                paused: !current.paused,
                ..current.clone()
            })
        });
    }

    /// Drop every buffered event. Pause and filter state are kept.
    pub fn clear(&self) {
        self.commit(|current| {
            Some(StoreState {
                events: VecDeque::new(),
                paused: current.paused,
                exclusion_filter: current.exclusion_filter.clone(),
            })
        });
    }

    /// Replace the exclusion filter.
    ///
    /// Setting the filter that is already active does nothing. Events already
    /// buffered are not re-filtered.
    pub fn set_exclusion_filter(&self, filter: ActiveFilter) {
        self.commit(|current| {
            if current.exclusion_filter == filter {
                return None;
            }
            Some(StoreState {
                exclusion_filter: filter,
                ..current.clone()
            })
        });
    }

    /// Receiver that observes every committed state.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<StoreState>> {
        self.sender.subscribe()
    }

    /// Stream of states, starting with the current one.
    #[must_use]
    pub fn snapshot_stream(&self) -> futures::stream::BoxStream<'static, Arc<StoreState>> {
        WatchStream::new(self.watch()).boxed()
    }

    /// Feed a stream of raw payloads into this store.
    pub fn spawn_forwarder<S>(self: Arc<Self>, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: futures::Stream<Item = Value> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);

            while let Some(raw) = stream.next().await {
                self.ingest(&raw);
            }
            tracing::debug!("Inbound stream ended");
        })
    }

    /// Swap in the state built by `next` and notify every subscriber once.
    ///
    /// `next` returning `None` leaves the state untouched and notifies nobody.
    fn commit(&self, next: impl FnOnce(&StoreState) -> Option<StoreState>) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(next) = next(&state) else {
                return false;
            };
            let next = Arc::new(next);
            *state = Arc::clone(&next);
            self.sender.send_replace(next);
        }

        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener();
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{Field, FieldPattern, FilterInput};

    fn raw(origin: &str, n: u64) -> Value {
        json!({
            "origin": origin,
            "destination": "https://host.example/",
            "data": { "n": n },
            "timestamp": n,
            "datetime": 1_700_000_000_000_u64 + n,
        })
    }

    fn counter(store: &EventStore) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = store.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    fn ns(state: &StoreState) -> Vec<u64> {
        state
            .iter()
            .map(|e| e.data["n"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let store = EventStore::with_capacity(3);
        for n in 1..=4 {
            assert!(store.ingest(&raw("a", n)));
        }
        assert_eq!(ns(&store.snapshot()), vec![2, 3, 4]);
    }

    #[test]
    fn test_length_tracks_min_of_accepted_and_capacity() {
        let store = EventStore::with_capacity(5);
        for n in 1..=12_u64 {
            store.ingest(&raw("a", n));
            let snapshot = store.snapshot();
            let expected = usize::try_from(n).unwrap().min(5);
            assert_eq!(snapshot.len(), expected);
            let first = n.saturating_sub(4).max(1);
            assert_eq!(ns(&snapshot), (first..=n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(EventStore::default().capacity(), DEFAULT_CAPACITY);
        assert_eq!(EventStore::with_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_rejected_payload_changes_nothing() {
        let store = EventStore::default();
        let (count, _sub) = counter(&store);

        let mut missing = raw("a", 1);
        missing.as_object_mut().unwrap().remove("timestamp");
        let mut stringly = raw("a", 2);
        stringly["timestamp"] = json!("2");

        assert!(!store.ingest(&missing));
        assert!(!store.ingest(&stringly));
        assert!(store.snapshot().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_drops_new_traffic() {
        let store = EventStore::default();
        store.ingest(&raw("a", 1));
        store.toggle_pause();
        assert!(store.snapshot().paused);

        for n in 2..10 {
            assert!(!store.ingest(&raw("a", n)));
        }
        assert_eq!(ns(&store.snapshot()), vec![1]);

        store.toggle_pause();
        assert!(store.ingest(&raw("a", 10)));
        assert_eq!(ns(&store.snapshot()), vec![1, 10]);
    }

    #[test]
    fn test_toggle_pause_twice_restores() {
        let store = EventStore::default();
        let before = store.snapshot().paused;
        store.toggle_pause();
        store.toggle_pause();
        assert_eq!(store.snapshot().paused, before);
    }

    #[test]
    fn test_clear_is_idempotent_and_keeps_settings() {
        let store = EventStore::with_capacity(7);
        store.ingest(&raw("a", 1));
        store.toggle_pause();

        store.clear();
        assert!(store.snapshot().is_empty());
        store.clear();
        let state = store.snapshot();
        assert!(state.is_empty());
        assert!(state.paused);
        assert_eq!(store.capacity(), 7);
    }

    #[test]
    fn test_exclusion_filter_drops_matches() {
        let store = EventStore::default();
        let filter = FilterInput::new()
            .with(Field::Origin, FieldPattern::new("evil"))
            .compile()
            .unwrap();
        store.set_exclusion_filter(filter);

        assert!(!store.ingest(&raw("https://evil.com", 1)));
        assert!(store.ingest(&raw("https://ok.com", 2)));
        assert_eq!(ns(&store.snapshot()), vec![2]);
    }

    #[test]
    fn test_exclusion_filter_is_not_retroactive() {
        let store = EventStore::default();
        store.ingest(&raw("https://evil.com", 1));
        store.set_exclusion_filter(
            FilterInput::new()
                .with(Field::Origin, FieldPattern::new("evil"))
                .compile()
                .unwrap(),
        );
        assert_eq!(ns(&store.snapshot()), vec![1]);
    }

    #[test]
    fn test_same_filter_does_not_notify() {
        let store = EventStore::default();
        let (count, _sub) = counter(&store);
        let filter = FilterInput::new()
            .with(Field::Data, FieldPattern::new("x"))
            .compile()
            .unwrap();

        store.set_exclusion_filter(filter.clone());
        store.set_exclusion_filter(filter);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        store.set_exclusion_filter(ActiveFilter::Off);
        store.set_exclusion_filter(ActiveFilter::Off);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_one_notification_per_mutation() {
        let store = EventStore::default();
        let (count, _sub) = counter(&store);

        store.ingest(&raw("a", 1));
        store.toggle_pause();
        store.ingest(&raw("a", 2));
        store.toggle_pause();
        store.clear();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_listener() {
        let store = EventStore::default();
        let (first, first_sub) = counter(&store);
        let (second, _second_sub) = counter(&store);

        store.ingest(&raw("a", 1));
        first_sub.unsubscribe();
        store.ingest(&raw("a", 2));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_same_closure_subscribed_twice_is_independent() {
        let store = EventStore::default();
        let count = Arc::new(AtomicUsize::new(0));
        let make = || {
            let c = Arc::clone(&count);
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            }
        };
        let a = store.subscribe(make());
        let _b = store.subscribe(make());

        store.clear();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        a.unsubscribe();
        store.clear();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_snapshot_is_stable_across_ingests() {
        let store = EventStore::default();
        store.ingest(&raw("a", 1));
        let earlier = store.snapshot();
        store.ingest(&raw("a", 2));
        store.clear();

        assert_eq!(ns(&earlier), vec![1]);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_listener_can_read_snapshot() {
        let store = Arc::new(EventStore::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let (s, weak) = (Arc::clone(&seen), Arc::downgrade(&store));
        store.subscribe(move || {
            if let Some(store) = weak.upgrade() {
                s.store(store.snapshot().len(), Ordering::SeqCst);
            }
        });

        store.ingest(&raw("a", 1));
        store.ingest(&raw("a", 2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watch_observes_commits() {
        let store = EventStore::default();
        let mut rx = store.watch();

        store.ingest(&raw("a", 1));
        tokio_test::assert_ok!(rx.changed().await);
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_forwarder_ingests_stream() {
        let store = Arc::new(EventStore::default());
        let inbound = futures::stream::iter(vec![
            raw("a", 1),
            json!({ "type": "PONG" }),
            raw("b", 2),
        ]);

        let handle = Arc::clone(&store).spawn_forwarder(inbound);
        tokio_test::assert_ok!(handle.await);
        assert_eq!(ns(&store.snapshot()), vec![1, 2]);
    }
}
