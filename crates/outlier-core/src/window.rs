//! Per-Entity Window Store with TTL Eviction
//!
//! Keeps the recent events of every active entity in memory so a hot entity
//! never needs a storage round-trip. The store is a pure cache: it never talks
//! to durable storage, backfilling on a miss is the caller's job.
//!
//! Locking: a sharded map (`DashMap`) holds one `Arc<Mutex<Slot>>` per
//! entity. The shard lock is held only long enough to find or insert the slot
//! `Arc`; merge, prune and snapshot then run under the per-entity mutex, so
//! unrelated entities never wait on each other. Eviction marks a slot as
//! evicted under that same mutex, and a writer that lands on an evicted slot
//! retries against a fresh one.

use crate::event::Event;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Configuration for the window store
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Trailing interval kept per entity
    pub window_length: Duration,
    /// Extra idle time before an entity is evicted
    pub grace_period: Duration,
    /// Maximum number of entities to keep
    pub max_entities: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::minutes(5),
            grace_period: Duration::seconds(60),
            max_entities: 10_000,
        }
    }
}

impl WindowConfig {
    /// Idle time after which an entity is evicted.
    pub fn ttl(&self) -> Duration {
        self.window_length + self.grace_period
    }
}

/// Recent events of one entity, sorted ascending and de-duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowState {
    pub entity_key: String,
    pub events: Vec<Event>,
    pub last_access: DateTime<Utc>,
}

impl WindowState {
    pub fn new(entity_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            entity_key: entity_key.into(),
            events: Vec::new(),
            last_access: now,
        }
    }

    /// Sorted insert. Returns false if the event was already present.
    pub fn insert(&mut self, event: Event) -> bool {
        match self.events.binary_search(&event) {
            Ok(_) => false,
            Err(pos) => {
                self.events.insert(pos, event);
                true
            }
        }
    }

    /// Drop everything stamped before `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale = self.events.partition_point(|e| e.timestamp < cutoff);
        self.events.drain(..stale);
        stale
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Statistics about the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub active: usize,
    pub creations: u64,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct Slot {
    state: WindowState,
    evicted: bool,
}

type SlotGuard = ArcMutexGuard<RawMutex, Slot>;

#[derive(Debug, Default)]
struct Counters {
    creations: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Concurrent per-entity window cache
pub struct WindowStore {
    entries: DashMap<String, Arc<Mutex<Slot>>>,
    config: WindowConfig,
    counters: Counters,
}

impl WindowStore {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            active: self.entries.len(),
            creations: self.counters.creations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Pruned snapshot of an entity's window, or `None` on a miss.
    pub fn get(&self, entity_key: &str, now: DateTime<Utc>) -> Option<WindowState> {
        let result = self.update_existing(entity_key, now, |_| {});
        self.record_lookup(result.is_some());
        result
    }

    /// Insert `event` (creating the window if needed), prune, and return the
    /// post-prune state.
    pub fn merge(&self, entity_key: &str, event: Event, now: DateTime<Utc>) -> WindowState {
        self.update_or_create(entity_key, now, |state| {
            state.insert(event);
        })
    }

    /// Like `merge`, but only if the entity is already cached.
    pub fn merge_existing(
        &self,
        entity_key: &str,
        event: Event,
        now: DateTime<Utc>,
    ) -> Option<WindowState> {
        let result = self.update_existing(entity_key, now, |state| {
            state.insert(event);
        });
        self.record_lookup(result.is_some());
        result
    }

    /// Merge a backfilled batch into the entity's window.
    ///
    /// Existing events are kept, so concurrent backfills for the same entity
    /// converge on the union of what each of them saw.
    pub fn seed(
        &self,
        entity_key: &str,
        events: impl IntoIterator<Item = Event>,
        now: DateTime<Utc>,
    ) -> WindowState {
        self.update_or_create(entity_key, now, |state| {
            for event in events {
                if event.entity_key == state.entity_key {
                    state.insert(event);
                }
            }
        })
    }

    /// Remove entities idle for longer than the TTL. Entities whose lock is
    /// currently held are in use and skipped.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let mut evicted = 0;

        self.entries.retain(|_, slot| match slot.try_lock() {
            Some(mut guard) => {
                if now - guard.state.last_access > ttl {
                    guard.evicted = true;
                    evicted += 1;
                    false
                } else {
                    true
                }
            }
            None => true,
        });

        if evicted > 0 {
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = self.entries.len(), "Evicted stale windows");
        }
        evicted
    }

    /// Drop one entity's window.
    pub fn remove(&self, entity_key: &str) -> Option<WindowState> {
        let (_, slot) = self.entries.remove(entity_key)?;
        let mut guard = slot.lock();
        guard.evicted = true;
        Some(guard.state.clone())
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn update_existing<F>(&self, entity_key: &str, now: DateTime<Utc>, apply: F) -> Option<WindowState>
    where
        F: FnOnce(&mut WindowState),
    {
        let slot = self.entries.get(entity_key).map(|entry| Arc::clone(entry.value()))?;
        let mut guard = slot.lock_arc();
        if guard.evicted {
            return None;
        }
        Some(self.apply_locked(&mut guard, now, apply))
    }

    fn update_or_create<F>(&self, entity_key: &str, now: DateTime<Utc>, apply: F) -> WindowState
    where
        F: FnOnce(&mut WindowState),
    {
        let mut guard = self.live_slot(entity_key, now);
        self.apply_locked(&mut guard, now, apply)
    }

    /// Lock the entity's slot, creating it if absent and skipping tombstones
    /// left behind by a concurrent eviction.
    fn live_slot(&self, entity_key: &str, now: DateTime<Utc>) -> SlotGuard {
        loop {
            if !self.entries.contains_key(entity_key) && self.entries.len() >= self.config.max_entities {
                self.evict_least_recent();
            }

            let slot = Arc::clone(
                self.entries
                    .entry(entity_key.to_string())
                    .or_insert_with(|| {
                        self.counters.creations.fetch_add(1, Ordering::Relaxed);
                        Arc::new(Mutex::new(Slot {
                            state: WindowState::new(entity_key, now),
                            evicted: false,
                        }))
                    })
                    .value(),
            );

            let guard = slot.lock_arc();
            if !guard.evicted {
                return guard;
            }
        }
    }

    fn apply_locked<F>(&self, guard: &mut SlotGuard, now: DateTime<Utc>, apply: F) -> WindowState
    where
        F: FnOnce(&mut WindowState),
    {
        let state = &mut guard.state;
        apply(state);
        state.prune(now - self.config.window_length);
        if now > state.last_access {
            state.last_access = now;
        }
        state.clone()
    }

    /// Capacity eviction: drop the idle entity with the oldest access.
    fn evict_least_recent(&self) {
        let candidate = self
            .entries
            .iter()
            .filter_map(|entry| {
                let last_access = entry.value().try_lock()?.state.last_access;
                Some((entry.key().clone(), last_access))
            })
            .min_by_key(|(_, last_access)| *last_access)
            .map(|(key, _)| key);

        if let Some(key) = candidate {
            if self.remove(&key).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(entity = %key, "Evicted least recently used window at capacity");
            }
        }
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}
