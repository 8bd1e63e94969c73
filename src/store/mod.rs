// src/store/mod.rs - Two-level key -> subkey -> value store with timing-wheel expiry

use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod ordered;
pub mod wheel;

pub use ordered::OrderedMap;
pub use wheel::{DriverHandle, Task, Tick, TimingWheel, WheelDriver};

/// Bounds shared by store keys and subkeys
pub trait StoreKey: Hash + Eq + Clone + Send + Sync + Debug + 'static {}

impl<T: Hash + Eq + Clone + Send + Sync + Debug + 'static> StoreKey for T {}

/// Store-wide expiration regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireMode {
    /// Fixed deadline counted from the last write
    AfterWrite,
    /// Deadline renewed by every read
    AfterAccess,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Subkey lifetime
    pub ttl: Duration,
    /// Key container lifetime; follows `ttl` when unset
    pub key_ttl: Option<Duration>,
    /// Max subkeys per key, oldest evicted first; 0 means unbounded
    pub capacity: usize,
    /// Max keys, least recently written key evicted first; 0 means unbounded
    pub max_keys: usize,
    pub mode: ExpireMode,
    pub tick: Duration,
    pub slots: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            key_ttl: None,
            capacity: 0,
            max_keys: 0,
            mode: ExpireMode::AfterWrite,
            tick: Duration::from_millis(100),
            slots: 600,
        }
    }
}

impl StoreOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_mode(mut self, mode: ExpireMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_wheel(mut self, tick: Duration, slots: usize) -> Self {
        self.tick = tick;
        self.slots = slots;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey<K, S> {
    Key(K),
    Sub(K, S),
}

struct Slot<V> {
    value: V,
    /// Wheel tick of the last write (or read, under `AfterAccess`)
    touched: u64,
    /// Per-entry lifetime override, in ticks
    ttl: Option<u64>,
}

struct KeyEntry<S, V> {
    items: OrderedMap<S, Slot<V>>,
    touched: u64,
    /// Set once the entry has been unlinked from the key map; writers retry
    dead: bool,
}

type SharedEntry<S, V> = Arc<Mutex<KeyEntry<S, V>>>;

fn lock<S, V>(entry: &SharedEntry<S, V>) -> MutexGuard<'_, KeyEntry<S, V>> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner<K, S, V> {
    keys: DashMap<K, SharedEntry<S, V>>,
    wheel: Arc<TimingWheel<TimerKey<K, S>>>,
    ttl: AtomicU64,
    /// 0 follows `ttl`
    key_ttl: AtomicU64,
    capacity: AtomicUsize,
    max_keys: AtomicUsize,
    mode: ExpireMode,
}

impl<K: StoreKey, S: StoreKey, V: Send + 'static> Inner<K, S, V> {
    fn ttl_ticks(&self) -> u64 {
        self.ttl.load(Ordering::Acquire).max(1)
    }

    fn key_ttl_ticks(&self) -> u64 {
        match self.key_ttl.load(Ordering::Acquire) {
            0 => self.ttl_ticks(),
            ticks => ticks,
        }
    }

    fn schedule(self: &Arc<Self>, id: TimerKey<K, S>, ticks: u64) {
        let weak = Arc::downgrade(self);
        let fired = id.clone();
        self.wheel.add_ticks(
            id,
            ticks,
            false,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&fired);
                }
            }),
        );
    }

    fn entry(&self, key: &K) -> Option<SharedEntry<S, V>> {
        self.keys.get(key).map(|e| e.value().clone())
    }

    /// Current entry for `key`, created (with its key timer) when missing
    fn live_entry(self: &Arc<Self>, key: &K) -> SharedEntry<S, V> {
        loop {
            let mut created = false;
            let entry = self
                .keys
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Mutex::new(KeyEntry {
                        items: OrderedMap::new(),
                        touched: self.wheel.now(),
                        dead: false,
                    }))
                })
                .value()
                .clone();
            if created {
                self.schedule(TimerKey::Key(key.clone()), self.key_ttl_ticks());
                let max_keys = self.max_keys.load(Ordering::Acquire);
                if max_keys > 0 && self.keys.len() > max_keys {
                    self.evict_oldest_key(Some(key));
                }
                return entry;
            }
            if !lock(&entry).dead {
                return entry;
            }
            self.keys.remove_if(key, |_, e| Arc::ptr_eq(e, &entry));
        }
    }

    /// Unlink an entry already marked dead. Stale key timers fire as no-ops.
    fn drop_key(&self, key: &K, entry: &SharedEntry<S, V>) {
        self.keys.remove_if(key, |_, e| Arc::ptr_eq(e, entry));
    }

    /// Mark dead, cancel subkey timers and unlink
    fn kill(&self, key: &K, entry: &SharedEntry<S, V>) -> usize {
        let mut guard = lock(entry);
        if guard.dead {
            return 0;
        }
        let subs: Vec<S> = guard.items.keys().cloned().collect();
        for sub in &subs {
            self.wheel.remove(&TimerKey::Sub(key.clone(), sub.clone()));
        }
        guard.items.clear();
        guard.dead = true;
        drop(guard);
        self.drop_key(key, entry);
        subs.len()
    }

    /// Drop the key written least recently, never `keep`
    fn evict_oldest_key(&self, keep: Option<&K>) -> bool {
        let entries: Vec<(K, SharedEntry<S, V>)> = self
            .keys
            .iter()
            .filter(|e| Some(e.key()) != keep)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let oldest = entries
            .into_iter()
            .map(|(key, entry)| {
                let touched = lock(&entry).touched;
                (touched, key, entry)
            })
            .min_by_key(|(touched, _, _)| *touched);
        let Some((_, key, entry)) = oldest else {
            return false;
        };
        let evicted = self.kill(&key, &entry);
        debug!("Key limit reached, evicted {:?} ({} entries)", key, evicted);
        true
    }

    fn trim(&self, key: &K, entry: &mut KeyEntry<S, V>, capacity: usize) -> usize {
        if capacity == 0 {
            return 0;
        }
        let mut evicted = 0;
        while entry.items.len() > capacity {
            let Some((sub, _)) = entry.items.pop_front() else {
                break;
            };
            self.wheel.remove(&TimerKey::Sub(key.clone(), sub));
            evicted += 1;
        }
        evicted
    }

    fn expire(self: &Arc<Self>, id: &TimerKey<K, S>) {
        let now = self.wheel.now();
        match id {
            TimerKey::Sub(key, sub) => {
                let Some(entry) = self.entry(key) else {
                    return;
                };
                let mut guard = lock(&entry);
                if guard.dead {
                    return;
                }
                let Some(slot) = guard.items.get(sub) else {
                    return;
                };
                let deadline = slot
                    .touched
                    .saturating_add(slot.ttl.unwrap_or_else(|| self.ttl_ticks()));
                if now < deadline {
                    self.schedule(id.clone(), deadline - now);
                    return;
                }
                guard.items.remove(sub);
                debug!("Expired {:?} -> {:?}", key, sub);
                if guard.items.is_empty() {
                    guard.dead = true;
                    drop(guard);
                    self.drop_key(key, &entry);
                }
            }
            TimerKey::Key(key) => {
                let Some(entry) = self.entry(key) else {
                    return;
                };
                let mut guard = lock(&entry);
                if guard.dead {
                    return;
                }
                // subkeys with their own lifetime keep the key alive
                let deadline = guard
                    .items
                    .iter()
                    .filter_map(|(_, slot)| slot.ttl.map(|t| slot.touched.saturating_add(t)))
                    .fold(
                        guard.touched.saturating_add(self.key_ttl_ticks()),
                        u64::max,
                    );
                if now < deadline {
                    self.schedule(id.clone(), deadline - now);
                    return;
                }
                let subs: Vec<S> = guard.items.keys().cloned().collect();
                for sub in subs {
                    self.wheel.remove(&TimerKey::Sub(key.clone(), sub));
                }
                guard.items.clear();
                guard.dead = true;
                drop(guard);
                self.drop_key(key, &entry);
                debug!("Expired key {:?}", key);
            }
        }
    }
}

/// Concurrent two-level TTL store. Independent keys never contend; a key's
/// subkeys keep insertion order (or access order under `AfterAccess`).
pub struct TtlStore<K, S, V> {
    inner: Arc<Inner<K, S, V>>,
}

impl<K, S, V> Clone for TtlStore<K, S, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: StoreKey, S: StoreKey, V: Clone + Send + 'static> TtlStore<K, S, V> {
    pub fn new(options: StoreOptions) -> Self {
        let wheel = Arc::new(TimingWheel::new(options.tick, options.slots));
        let ttl = wheel.ticks_for(options.ttl);
        let key_ttl = options.key_ttl.map_or(0, |d| wheel.ticks_for(d));
        Self {
            inner: Arc::new(Inner {
                keys: DashMap::new(),
                wheel,
                ttl: AtomicU64::new(ttl),
                key_ttl: AtomicU64::new(key_ttl),
                capacity: AtomicUsize::new(options.capacity),
                max_keys: AtomicUsize::new(options.max_keys),
                mode: options.mode,
            }),
        }
    }

    /// Wheel to register with a [`WheelDriver`]
    pub fn wheel(&self) -> Arc<TimingWheel<TimerKey<K, S>>> {
        self.inner.wheel.clone()
    }

    pub fn mode(&self) -> ExpireMode {
        self.inner.mode
    }

    pub fn push(&self, key: K, sub: S, value: V) {
        self.push_with_ttl(key, sub, value, None);
    }

    /// Upsert `sub` at the back of `key`'s order, evicting the oldest
    /// subkeys beyond capacity
    pub fn push_with_ttl(&self, key: K, sub: S, value: V, ttl: Option<Duration>) {
        let inner = &self.inner;
        let ttl = ttl.map(|d| inner.wheel.ticks_for(d));
        loop {
            let entry = inner.live_entry(&key);
            let mut guard = lock(&entry);
            if guard.dead {
                continue;
            }
            let now = inner.wheel.now();
            guard.touched = now;
            guard.items.insert_back(
                sub.clone(),
                Slot {
                    value,
                    touched: now,
                    ttl,
                },
            );
            inner.schedule(
                TimerKey::Sub(key.clone(), sub),
                ttl.unwrap_or_else(|| inner.ttl_ticks()),
            );
            let evicted = inner.trim(&key, &mut guard, inner.capacity.load(Ordering::Acquire));
            if evicted > 0 {
                debug!("Evicted {} oldest entries under {:?}", evicted, key);
            }
            return;
        }
    }

    pub fn update<F>(&self, key: K, sub: S, f: F) -> Option<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        self.update_with_ttl(key, sub, None, f)
    }

    /// Read-modify-write. Returning `None` deletes the subkey; any other
    /// result restarts the subkey's expiration timer.
    pub fn update_with_ttl<F>(&self, key: K, sub: S, ttl: Option<Duration>, f: F) -> Option<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let inner = &self.inner;
        let ttl = ttl.map(|d| inner.wheel.ticks_for(d));
        loop {
            let entry = inner.live_entry(&key);
            let mut guard = lock(&entry);
            if guard.dead {
                continue;
            }
            let now = inner.wheel.now();
            let next = f(guard.items.get(&sub).map(|slot| &slot.value));
            let Some(value) = next else {
                if guard.items.remove(&sub).is_some() {
                    inner.wheel.remove(&TimerKey::Sub(key.clone(), sub));
                }
                if guard.items.is_empty() {
                    guard.dead = true;
                    drop(guard);
                    inner.drop_key(&key, &entry);
                }
                return None;
            };
            guard.touched = now;
            let lifetime = match guard.items.get_mut(&sub) {
                Some(slot) => {
                    slot.value = value.clone();
                    slot.touched = now;
                    if ttl.is_some() {
                        slot.ttl = ttl;
                    }
                    slot.ttl
                }
                None => {
                    guard.items.insert_back(
                        sub.clone(),
                        Slot {
                            value: value.clone(),
                            touched: now,
                            ttl,
                        },
                    );
                    ttl
                }
            };
            inner.schedule(
                TimerKey::Sub(key.clone(), sub),
                lifetime.unwrap_or_else(|| inner.ttl_ticks()),
            );
            inner.trim(&key, &mut guard, inner.capacity.load(Ordering::Acquire));
            return Some(value);
        }
    }

    /// Run `f` over a key's entry, renewing access times under `AfterAccess`
    fn read<R>(&self, key: &K, f: impl FnOnce(&OrderedMap<S, Slot<V>>) -> R) -> Option<R> {
        let entry = self.inner.entry(key)?;
        let mut guard = lock(&entry);
        if guard.dead {
            return None;
        }
        if self.inner.mode == ExpireMode::AfterAccess {
            let now = self.inner.wheel.now();
            guard.touched = now;
            let subs: Vec<S> = guard.items.keys().cloned().collect();
            for sub in subs {
                if let Some(slot) = guard.items.get_mut(&sub) {
                    slot.touched = now;
                }
            }
        }
        Some(f(&guard.items))
    }

    pub fn get(&self, key: &K, sub: &S) -> Option<V> {
        let entry = self.inner.entry(key)?;
        let mut guard = lock(&entry);
        if guard.dead {
            return None;
        }
        if self.inner.mode == ExpireMode::AfterAccess {
            let now = self.inner.wheel.now();
            let slot = guard.items.get_mut(sub)?;
            slot.touched = now;
            guard.touched = now;
            guard.items.move_to_back(sub);
        }
        guard.items.get(sub).map(|slot| slot.value.clone())
    }

    pub fn get_all(&self, key: &K) -> HashMap<S, V> {
        self.read(key, |items| {
            items
                .iter()
                .map(|(sub, slot)| (sub.clone(), slot.value.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Ordered copy, oldest first
    pub fn snapshot(&self, key: &K) -> Vec<(S, V)> {
        self.read(key, |items| {
            items
                .iter()
                .map(|(sub, slot)| (sub.clone(), slot.value.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Visit subkeys oldest first while holding the key's lock
    pub fn for_each<F>(&self, key: &K, mut f: F)
    where
        F: FnMut(&S, &V),
    {
        self.read(key, |items| {
            for (sub, slot) in items.iter() {
                f(sub, &slot.value);
            }
        });
    }

    pub fn len(&self, key: &K) -> usize {
        self.inner
            .entry(key)
            .map_or(0, |entry| lock(&entry).items.len())
    }

    pub fn contains(&self, key: &K, sub: &S) -> bool {
        self.inner
            .entry(key)
            .is_some_and(|entry| lock(&entry).items.contains(sub))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.keys.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.inner.keys.len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, key: &K, sub: &S) -> Option<V> {
        let entry = self.inner.entry(key)?;
        let mut guard = lock(&entry);
        if guard.dead {
            return None;
        }
        let removed = guard.items.remove(sub)?;
        self.inner.wheel.remove(&TimerKey::Sub(key.clone(), sub.clone()));
        if guard.items.is_empty() {
            guard.dead = true;
            drop(guard);
            self.inner.drop_key(key, &entry);
        }
        Some(removed.value)
    }

    /// Drop every subkey under `key`; returns how many were removed
    pub fn clear_key(&self, key: &K) -> usize {
        match self.inner.entry(key) {
            Some(entry) => self.inner.kill(key, &entry),
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    /// New capacity applies to future pushes and is trimmed into existing keys
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.capacity.store(capacity, Ordering::Release);
        if capacity == 0 {
            return;
        }
        let entries: Vec<(K, SharedEntry<S, V>)> = self
            .inner
            .keys
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut evicted = 0;
        for (key, entry) in entries {
            let mut guard = lock(&entry);
            if !guard.dead {
                evicted += self.inner.trim(&key, &mut guard, capacity);
            }
        }
        info!("Store capacity set to {} ({} entries evicted)", capacity, evicted);
    }

    pub fn ttl(&self) -> Duration {
        self.inner.wheel.tick_duration() * self.inner.ttl.load(Ordering::Acquire) as u32
    }

    /// Change the subkey lifetime and move outstanding timers by the difference
    pub fn set_ttl(&self, ttl: Duration) {
        let inner = &self.inner;
        let new = inner.wheel.ticks_for(ttl);
        let old = inner.ttl.swap(new, Ordering::AcqRel);
        let delta = new as i64 - old as i64;
        let keys_follow = inner.key_ttl.load(Ordering::Acquire) == 0;
        // subkeys with their own lifetime keep their deadline
        let mut pinned = HashSet::new();
        let entries: Vec<(K, SharedEntry<S, V>)> = inner
            .keys
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, entry) in entries {
            let guard = lock(&entry);
            for (sub, slot) in guard.items.iter() {
                if slot.ttl.is_some() {
                    pinned.insert(TimerKey::Sub(key.clone(), sub.clone()));
                }
            }
        }
        let moved = inner.wheel.shift(
            |id| match id {
                TimerKey::Sub(..) => !pinned.contains(id),
                TimerKey::Key(_) => keys_follow,
            },
            delta,
        );
        info!("Store ttl set to {:?} ({} timers shifted by {} ticks)", ttl, moved, delta);
    }

    pub fn set_key_ttl(&self, ttl: Option<Duration>) {
        let ticks = ttl.map_or(0, |d| self.inner.wheel.ticks_for(d));
        self.inner.key_ttl.store(ticks, Ordering::Release);
    }

    pub fn max_keys(&self) -> usize {
        self.inner.max_keys.load(Ordering::Acquire)
    }

    /// New key limit; existing keys beyond it are evicted oldest first
    pub fn set_max_keys(&self, max_keys: usize) {
        self.inner.max_keys.store(max_keys, Ordering::Release);
        if max_keys == 0 {
            return;
        }
        let mut evicted = 0;
        while self.inner.keys.len() > max_keys && self.inner.evict_oldest_key(None) {
            evicted += 1;
        }
        info!("Store key limit set to {} ({} keys evicted)", max_keys, evicted);
    }

    /// Run `f` on `key`'s subkeys under the key's lock, creating the key if
    /// needed. Reads, decisions and writes made through the window are atomic
    /// with respect to every other operation on the same key.
    pub fn with_key<R, F>(&self, key: K, f: F) -> R
    where
        F: FnOnce(&mut KeyWindow<'_, K, S, V>) -> R,
    {
        let inner = &self.inner;
        loop {
            let entry = inner.live_entry(&key);
            let mut guard = lock(&entry);
            if guard.dead {
                continue;
            }
            let result = f(&mut KeyWindow {
                inner,
                key: &key,
                entry: &mut *guard,
            });
            if guard.items.is_empty() {
                guard.dead = true;
                drop(guard);
                inner.drop_key(&key, &entry);
            }
            return result;
        }
    }
}

/// One key's subkeys, borrowed under the key's lock by [`TtlStore::with_key`]
pub struct KeyWindow<'a, K, S, V> {
    inner: &'a Arc<Inner<K, S, V>>,
    key: &'a K,
    entry: &'a mut KeyEntry<S, V>,
}

impl<K: StoreKey, S: StoreKey, V: Send + 'static> KeyWindow<'_, K, S, V> {
    pub fn len(&self) -> usize {
        self.entry.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.items.is_empty()
    }

    pub fn newest_first(&self) -> impl Iterator<Item = (&S, &V)> + '_ {
        self.entry.items.iter_rev().map(|(sub, slot)| (sub, &slot.value))
    }

    /// Same as [`TtlStore::push`], inside the lock
    pub fn push(&mut self, sub: S, value: V) {
        let inner = self.inner;
        let now = inner.wheel.now();
        self.entry.touched = now;
        self.entry.items.insert_back(
            sub.clone(),
            Slot {
                value,
                touched: now,
                ttl: None,
            },
        );
        inner.schedule(TimerKey::Sub(self.key.clone(), sub), inner.ttl_ticks());
        inner.trim(self.key, &mut *self.entry, inner.capacity.load(Ordering::Acquire));
    }

    /// Drop every subkey; the key goes away when the window is released
    pub fn clear(&mut self) -> usize {
        let subs: Vec<S> = self.entry.items.keys().cloned().collect();
        for sub in &subs {
            self.inner
                .wheel
                .remove(&TimerKey::Sub(self.key.clone(), sub.clone()));
        }
        self.entry.items.clear();
        subs.len()
    }
}
