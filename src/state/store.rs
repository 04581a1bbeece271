//! Runtime state store with debounced durable persistence.
//!
//! All four categories sit behind one mutex. Mutations mark the snapshot
//! dirty and wake the persister task; the persister waits out the quiet
//! window and then writes whatever the snapshot looks like at that moment,
//! so a burst of mutations produces exactly one write.
//!
//! Writes are serialized by a separate async gate so a debounced flush and
//! [`RuntimeStateStore::save_now`] can never land out of order.

use crate::error::PersistenceError;
use crate::state::persist::StatePersistence;
use crate::state::{RuntimeStateSnapshot, StateCategory};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default quiet window between the first mutation of a burst and the write.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct StoreState {
    snapshot: RuntimeStateSnapshot,
    initialized: bool,
    /// Unsaved mutations exist.
    dirty: bool,
    /// Bumped on every effective mutation.
    generation: u64,
    /// Generation whose debounced write last failed.
    failed_generation: Option<u64>,
}

impl StoreState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Single owner of the [`RuntimeStateSnapshot`].
///
/// Construct one per process and share it as `Arc<RuntimeStateStore>`.
pub struct RuntimeStateStore {
    state: Mutex<StoreState>,
    persistence: Arc<dyn StatePersistence>,
    debounce: Duration,
    flush_signal: Notify,
    write_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RuntimeStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeStateStore")
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl RuntimeStateStore {
    pub fn new(persistence: Arc<dyn StatePersistence>, debounce: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            persistence,
            debounce,
            flush_signal: Notify::new(),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the last durable snapshot.
    ///
    /// A load failure is logged and treated as "nothing saved yet". A second
    /// call only logs a warning and leaves the current state untouched.
    pub async fn initialize(&self) {
        let _gate = self.write_gate.lock().await;
        if self.lock().initialized {
            warn!("runtime state store already initialized; ignoring repeated initialize");
            return;
        }

        let loaded = match self.persistence.load().await {
            Ok(Some(snapshot)) => {
                info!(
                    entries = snapshot.entry_count(),
                    last_saved = ?snapshot.last_saved,
                    "loaded runtime state"
                );
                snapshot
            }
            Ok(None) => {
                info!("no saved runtime state; starting empty");
                RuntimeStateSnapshot::default()
            }
            Err(e) => {
                warn!(error = %e, "cannot load runtime state; starting empty");
                RuntimeStateSnapshot::default()
            }
        };

        let mut state = self.lock();
        state.snapshot = loaded;
        state.initialized = true;
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Whether mutations exist that have not been durably written.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Copy of one category.
    pub fn get<C: StateCategory>(&self) -> HashMap<u64, C::Value> {
        C::entries(&self.lock().snapshot).clone()
    }

    /// Copy of a single entry.
    pub fn get_entry<C: StateCategory>(&self, key: u64) -> Option<C::Value> {
        C::entries(&self.lock().snapshot).get(&key).cloned()
    }

    /// Copy of the whole snapshot.
    pub fn snapshot(&self) -> RuntimeStateSnapshot {
        self.lock().snapshot.clone()
    }

    /// Time of the last successful durable write.
    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.lock().snapshot.last_saved
    }

    /// Insert or overwrite an entry. Always schedules a debounced save.
    pub fn upsert<C: StateCategory>(&self, key: u64, value: C::Value) {
        {
            let mut state = self.lock();
            C::entries_mut(&mut state.snapshot).insert(key, value);
            state.mark_dirty();
        }
        debug!(category = C::NAME, key, "upserted runtime state entry");
        self.save_debounced();
    }

    /// Remove an entry, returning it.
    ///
    /// Removing an absent key changes nothing and schedules no write.
    pub fn remove<C: StateCategory>(&self, key: u64) -> Option<C::Value> {
        self.remove_if::<C, _>(key, |_| true)
    }

    /// Remove an entry only if `predicate` accepts its current value.
    ///
    /// Check and removal happen atomically, so an entry replaced by another
    /// caller in between is left alone.
    pub fn remove_if<C, P>(&self, key: u64, predicate: P) -> Option<C::Value>
    where
        C: StateCategory,
        P: FnOnce(&C::Value) -> bool,
    {
        let removed = {
            let mut state = self.lock();
            let entries = C::entries_mut(&mut state.snapshot);
            let matches = entries.get(&key).is_some_and(predicate);
            let removed = if matches { entries.remove(&key) } else { None };
            if removed.is_some() {
                state.mark_dirty();
            }
            removed
        };

        if removed.is_some() {
            debug!(category = C::NAME, key, "removed runtime state entry");
            self.save_debounced();
        }
        removed
    }

    /// Atomically read-modify-write one entry.
    ///
    /// `f` receives the current value (if any) and returns the new value;
    /// `None` removes the entry. A debounced save is scheduled only when the
    /// entry actually changed. Returns the new value.
    pub fn update<C, F>(&self, key: u64, f: F) -> Option<C::Value>
    where
        C: StateCategory,
        F: FnOnce(Option<C::Value>) -> Option<C::Value>,
    {
        let (changed, updated) = {
            let mut state = self.lock();
            let entries = C::entries_mut(&mut state.snapshot);
            let current = entries.get(&key).cloned();
            let updated = f(current.clone());
            let changed = current != updated;
            if changed {
                match &updated {
                    Some(value) => {
                        entries.insert(key, value.clone());
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
                state.mark_dirty();
            }
            (changed, updated)
        };

        if changed {
            debug!(category = C::NAME, key, "updated runtime state entry");
            self.save_debounced();
        }
        updated
    }

    /// Swap an entire category's contents.
    pub fn replace<C: StateCategory>(&self, entries: HashMap<u64, C::Value>) {
        let len = entries.len();
        {
            let mut state = self.lock();
            *C::entries_mut(&mut state.snapshot) = entries;
            state.mark_dirty();
        }
        debug!(category = C::NAME, entries = len, "replaced runtime state category");
        self.save_debounced();
    }

    /// Write the current snapshot immediately.
    ///
    /// Used at orderly shutdown; unlike debounced writes the error is
    /// returned to the caller.
    pub async fn save_now(&self) -> Result<DateTime<Utc>, PersistenceError> {
        let _gate = self.write_gate.lock().await;
        let (snapshot, generation) = self.capture();
        let saved_at = snapshot.last_saved.unwrap_or_else(Utc::now);
        self.persistence.save(&snapshot).await?;
        self.commit(saved_at, generation);
        info!(entries = snapshot.entry_count(), "runtime state saved");
        Ok(saved_at)
    }

    /// Schedule a write after the quiet window.
    ///
    /// Repeated calls inside one window coalesce into a single write.
    fn save_debounced(&self) {
        self.flush_signal.notify_one();
    }

    /// Clone the snapshot for writing, stamped with the save time.
    fn capture(&self) -> (RuntimeStateSnapshot, u64) {
        let state = self.lock();
        let mut snapshot = state.snapshot.clone();
        snapshot.last_saved = Some(Utc::now());
        (snapshot, state.generation)
    }

    fn commit(&self, saved_at: DateTime<Utc>, generation: u64) {
        let mut state = self.lock();
        state.snapshot.last_saved = Some(saved_at);
        state.failed_generation = None;
        if state.generation == generation {
            state.dirty = false;
        }
    }

    /// Write the snapshot if it is dirty. Returns whether a write happened.
    ///
    /// A snapshot whose write already failed is not retried until another
    /// mutation arrives; `save_now` always writes.
    async fn flush_pending(&self) -> Result<bool, PersistenceError> {
        let _gate = self.write_gate.lock().await;
        {
            let state = self.lock();
            if !state.dirty || state.failed_generation == Some(state.generation) {
                return Ok(false);
            }
        }
        let (snapshot, generation) = self.capture();
        let saved_at = snapshot.last_saved.unwrap_or_else(Utc::now);

        match self.persistence.save(&snapshot).await {
            Ok(()) => {
                self.commit(saved_at, generation);
                Ok(true)
            }
            Err(e) => {
                self.lock().failed_generation = Some(generation);
                Err(e)
            }
        }
    }

    /// Spawn the debounced persister. It exits when `cancel` fires without
    /// writing; the final write belongs to [`save_now`](Self::save_now).
    pub fn spawn_persister(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move { store.run_persister(cancel).await })
    }

    async fn run_persister(&self, cancel: CancellationToken) {
        debug!(debounce_ms = self.debounce.as_millis() as u64, "state persister started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.flush_signal.notified() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }

            match self.flush_pending().await {
                Ok(true) => debug!("runtime state flushed"),
                Ok(false) => {}
                Err(e) => error!(error = %e, "cannot persist runtime state"),
            }
        }
        debug!("state persister stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::state::persist::MemoryPersistence;
    use crate::state::{ActivitySessions, CreatedChildren, SessionDescriptor, Timers, TimerDescriptor};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_secs(5);

    fn session(detail: &str) -> SessionDescriptor {
        SessionDescriptor {
            started_at: Utc::now(),
            channel_id: None,
            detail: Some(detail.to_owned()),
        }
    }

    fn timer(owner_id: u64) -> TimerDescriptor {
        TimerDescriptor {
            owner_id,
            label: String::new(),
            started_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    async fn initialized_store() -> (Arc<RuntimeStateStore>, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = Arc::new(RuntimeStateStore::new(persistence.clone(), WINDOW));
        store.initialize().await;
        (store, persistence)
    }

    /// Persistence that fails while `failing` is set.
    #[derive(Default)]
    struct FlakyPersistence {
        failing: AtomicBool,
        attempts: AtomicUsize,
        inner: MemoryPersistence,
    }

    #[async_trait]
    impl StatePersistence for FlakyPersistence {
        async fn load(&self) -> Result<Option<RuntimeStateSnapshot>, PersistenceError> {
            Err(PersistenceError::Unavailable("disk on fire".to_owned()))
        }

        async fn save(&self, snapshot: &RuntimeStateSnapshot) -> Result<(), PersistenceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("disk on fire".to_owned()));
            }
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test]
    async fn initialize_loads_saved_snapshot() {
        let mut saved = RuntimeStateSnapshot::default();
        saved.timers.insert(9, timer(1));
        let persistence = Arc::new(MemoryPersistence::with_snapshot(saved));
        let store = RuntimeStateStore::new(persistence, WINDOW);

        store.initialize().await;

        assert!(store.is_initialized());
        assert!(store.get::<Timers>().contains_key(&9));
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn second_initialize_keeps_mutations() {
        let (store, _) = initialized_store().await;
        store.upsert::<ActivitySessions>(1, session("chess"));

        store.initialize().await;

        assert_eq!(store.get::<ActivitySessions>().len(), 1);
    }

    #[tokio::test]
    async fn load_failure_starts_empty() {
        let store = RuntimeStateStore::new(Arc::new(FlakyPersistence::default()), WINDOW);
        store.initialize().await;
        assert!(store.is_initialized());
        assert_eq!(store.snapshot().entry_count(), 0);
    }

    #[tokio::test]
    async fn get_returns_a_detached_copy() {
        let (store, _) = initialized_store().await;
        store.upsert::<Timers>(1, timer(1));

        let mut copy = store.get::<Timers>();
        copy.clear();

        assert_eq!(store.get::<Timers>().len(), 1);
    }

    #[tokio::test]
    async fn upsert_same_value_twice_keeps_one_entry() {
        let (store, _) = initialized_store().await;
        let value = session("go");

        store.upsert::<ActivitySessions>(5, value.clone());
        let first = store.get::<ActivitySessions>();
        store.upsert::<ActivitySessions>(5, value.clone());
        let second = store.get::<ActivitySessions>();

        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
        assert_eq!(second.get(&5), Some(&value));
    }

    #[tokio::test]
    async fn remove_absent_key_does_not_mark_dirty() {
        let (store, _) = initialized_store().await;
        assert!(store.remove::<Timers>(404).is_none());
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn remove_if_skips_replaced_entry() {
        let (store, _) = initialized_store().await;
        let original = timer(1);
        store.upsert::<Timers>(3, original.clone());
        store.upsert::<Timers>(3, timer(2));

        let removed = store.remove_if::<Timers, _>(3, |current| *current == original);

        assert!(removed.is_none());
        assert_eq!(store.get_entry::<Timers>(3).map(|t| t.owner_id), Some(2));
    }

    #[tokio::test]
    async fn update_without_change_does_not_mark_dirty() {
        let (store, _) = initialized_store().await;
        let unchanged = store.update::<CreatedChildren, _>(1, |current| current);
        assert!(unchanged.is_none());
        assert!(!store.is_dirty());

        store.update::<CreatedChildren, _>(1, |current| {
            let mut children = current.unwrap_or_default();
            children.insert(10);
            Some(children)
        });
        assert!(store.is_dirty());
        assert_eq!(
            store.get_entry::<CreatedChildren>(1),
            Some(HashSet::from([10]))
        );
    }

    #[tokio::test]
    async fn replace_swaps_only_the_target_category() {
        let (store, _) = initialized_store().await;
        store.upsert::<Timers>(1, timer(1));
        store.upsert::<ActivitySessions>(1, session("a"));

        store.replace::<ActivitySessions>(HashMap::from([(2, session("b")), (3, session("c"))]));

        let sessions = store.get::<ActivitySessions>();
        assert_eq!(sessions.len(), 2);
        assert!(!sessions.contains_key(&1));
        assert_eq!(store.get::<Timers>().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_on_distinct_keys_are_all_applied() {
        let (store, _) = initialized_store().await;
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..50u64 {
                    let key = worker * 1_000 + i;
                    store.upsert::<Timers>(key, timer(worker));
                    if i % 2 == 1 {
                        store.remove::<Timers>(key);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let timers = store.get::<Timers>();
        assert_eq!(timers.len(), 8 * 25);
        assert!(timers.keys().all(|key| (key % 1_000) % 2 == 0));
    }

    #[tokio::test]
    async fn concurrent_updates_on_one_key_lose_nothing() {
        let (store, _) = initialized_store().await;
        let mut handles = Vec::new();
        for child in 0..64u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.update::<CreatedChildren, _>(1, |current| {
                    let mut children = current.unwrap_or_default();
                    children.insert(child);
                    Some(children)
                });
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_entry::<CreatedChildren>(1).unwrap().len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_produces_one_write_with_all_changes() {
        let (store, persistence) = initialized_store().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.upsert::<Timers>(1, timer(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.upsert::<Timers>(2, timer(2));
        assert_eq!(persistence.save_count(), 0);

        tokio::time::sleep(WINDOW * 3).await;

        assert_eq!(persistence.save_count(), 1);
        let saved = persistence.last_saved().unwrap();
        assert!(saved.timers.contains_key(&1));
        assert!(saved.timers.contains_key(&2));
        assert!(saved.last_saved.is_some());
        assert!(!store.is_dirty());

        cancel.cancel();
        persister.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn absent_removal_schedules_no_write() {
        let (store, persistence) = initialized_store().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.remove::<Timers>(77);
        tokio::time::sleep(WINDOW * 3).await;

        assert_eq!(persistence.save_count(), 0);
        cancel.cancel();
        persister.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_produce_separate_writes() {
        let (store, persistence) = initialized_store().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.upsert::<Timers>(1, timer(1));
        tokio::time::sleep(WINDOW * 2).await;
        store.upsert::<Timers>(2, timer(2));
        tokio::time::sleep(WINDOW * 2).await;

        assert_eq!(persistence.save_count(), 2);
        cancel.cancel();
        persister.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_is_retried_by_next_mutation() {
        let persistence = Arc::new(FlakyPersistence::default());
        persistence.failing.store(true, Ordering::SeqCst);
        let store = Arc::new(RuntimeStateStore::new(persistence.clone(), WINDOW));
        store.initialize().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.upsert::<Timers>(1, timer(1));
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(persistence.attempts.load(Ordering::SeqCst), 1);
        assert!(store.is_dirty());

        // No immediate retry without a new mutation.
        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(persistence.attempts.load(Ordering::SeqCst), 1);

        persistence.failing.store(false, Ordering::SeqCst);
        store.upsert::<Timers>(2, timer(2));
        tokio::time::sleep(WINDOW * 2).await;

        assert_eq!(persistence.attempts.load(Ordering::SeqCst), 2);
        let saved = persistence.inner.last_saved().unwrap();
        assert_eq!(saved.timers.len(), 2);
        assert!(!store.is_dirty());

        cancel.cancel();
        persister.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_before_failed_flush_does_not_retry_on_its_own() {
        let persistence = Arc::new(FlakyPersistence::default());
        persistence.failing.store(true, Ordering::SeqCst);
        let store = Arc::new(RuntimeStateStore::new(persistence.clone(), WINDOW));
        store.initialize().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.upsert::<Timers>(1, timer(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.upsert::<Timers>(2, timer(2));
        tokio::time::sleep(WINDOW * 5).await;

        assert_eq!(persistence.attempts.load(Ordering::SeqCst), 1);
        assert!(store.is_dirty());

        cancel.cancel();
        persister.await.unwrap();
    }

    /// Persistence whose writes wait until released.
    #[derive(Default)]
    struct GatedPersistence {
        release: Notify,
        inner: MemoryPersistence,
    }

    #[async_trait]
    impl StatePersistence for GatedPersistence {
        async fn load(&self) -> Result<Option<RuntimeStateSnapshot>, PersistenceError> {
            Ok(None)
        }

        async fn save(&self, snapshot: &RuntimeStateSnapshot) -> Result<(), PersistenceError> {
            self.release.notified().await;
            self.inner.save(snapshot).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_stays_dirty_while_debounced_write_is_in_flight() {
        let persistence = Arc::new(GatedPersistence::default());
        let store = Arc::new(RuntimeStateStore::new(persistence.clone(), WINDOW));
        store.initialize().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        store.upsert::<Timers>(1, timer(1));
        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(persistence.inner.save_count(), 0);
        assert!(store.is_dirty());

        persistence.release.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(persistence.inner.save_count(), 1);
        assert!(!store.is_dirty());

        cancel.cancel();
        persister.await.unwrap();
    }

    #[tokio::test]
    async fn save_now_writes_immediately_and_stamps_last_saved() {
        let (store, persistence) = initialized_store().await;
        store.upsert::<Timers>(1, timer(1));

        let saved_at = store.save_now().await.unwrap();

        assert_eq!(persistence.save_count(), 1);
        assert_eq!(store.last_saved(), Some(saved_at));
        assert_eq!(persistence.last_saved().unwrap().last_saved, Some(saved_at));
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn save_now_surfaces_errors() {
        let persistence = Arc::new(FlakyPersistence::default());
        persistence.failing.store(true, Ordering::SeqCst);
        let store = RuntimeStateStore::new(persistence, WINDOW);
        store.initialize().await;
        store.upsert::<Timers>(1, timer(1));

        assert!(store.save_now().await.is_err());
        assert!(store.is_dirty());
        assert!(store.last_saved().is_none());
    }

    #[tokio::test]
    async fn persister_stops_on_cancel() {
        let (store, _) = initialized_store().await;
        let cancel = CancellationToken::new();
        let persister = store.spawn_persister(cancel.clone());

        cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(2), persister).await;
        assert!(joined.is_ok(), "persister should stop after cancel");
    }
}
