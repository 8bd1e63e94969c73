// src/store/wheel.rs - Hashed timing wheel and the background task that drives it

use log::{debug, info, warn};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timer callback
pub type Task = Arc<dyn Fn() + Send + Sync>;

struct Timer {
    rounds: u64,
    interval: u64,
    repeat: bool,
    task: Task,
}

struct WheelState<I> {
    slots: Vec<HashMap<I, Timer>>,
    index: HashMap<I, usize>,
    cursor: usize,
}

impl<I: Hash + Eq + Clone> WheelState<I> {
    fn place(&mut self, id: I, mut timer: Timer, ticks: u64) {
        let n = self.slots.len() as u64;
        let ticks = ticks.max(1);
        let slot = ((self.cursor as u64 + ticks) % n) as usize;
        timer.rounds = (ticks - 1) / n;
        if let Some(old) = self.index.insert(id.clone(), slot) {
            self.slots[old].remove(&id);
        }
        self.slots[slot].insert(id, timer);
    }

    fn remaining(&self, id: &I) -> Option<u64> {
        let slot = *self.index.get(id)?;
        let timer = self.slots[slot].get(id)?;
        let n = self.slots.len();
        let mut dist = (slot + n - self.cursor) % n;
        if dist == 0 {
            dist = n;
        }
        Some(dist as u64 + timer.rounds * n as u64)
    }
}

/// Fixed ring of slots advanced one slot per tick. Delays longer than one
/// lap are carried as a rounds counter. One timer per id; re-adding an id
/// replaces its timer. Due timers leave the wheel before their callback runs.
pub struct TimingWheel<I> {
    tick: Duration,
    state: Mutex<WheelState<I>>,
    elapsed: AtomicU64,
}

impl<I> std::fmt::Debug for TimingWheel<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick", &self.tick)
            .field("elapsed", &self.elapsed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<I: Hash + Eq + Clone + Send + 'static> TimingWheel<I> {
    pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
    pub const DEFAULT_SLOTS: usize = 600;

    pub fn new(tick: Duration, slots: usize) -> Self {
        let tick = if tick.is_zero() { Self::DEFAULT_TICK } else {
            tick
        };
        let slots = slots.max(1);
        Self {
            tick,
            state: Mutex::new(WheelState {
                slots: (0..slots).map(|_| HashMap::new()).collect(),
                index: HashMap::new(),
                cursor: 0,
            }),
            elapsed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WheelState<I>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    /// Ticks advanced since creation; the wheel's logical clock
    pub fn now(&self) -> u64 {
        self.elapsed.load(Ordering::Acquire)
    }

    /// Whole ticks covering `d`, at least one
    pub fn ticks_for(&self, d: Duration) -> u64 {
        let tick = self.tick.as_nanos().max(1);
        let ticks = d.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    pub fn add(&self, id: I, delay: Duration, repeat: bool, task: Task) {
        let ticks = self.ticks_for(delay);
        self.add_ticks(id, ticks, repeat, task);
    }

    pub fn add_ticks(&self, id: I, ticks: u64, repeat: bool, task: Task) {
        let timer = Timer {
            rounds: 0,
            interval: ticks.max(1),
            repeat,
            task,
        };
        self.lock().place(id, timer, ticks);
    }

    pub fn remove(&self, id: &I) -> bool {
        let mut state = self.lock();
        match state.index.remove(id) {
            Some(slot) => state.slots[slot].remove(id).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &I) -> bool {
        self.lock().index.contains_key(id)
    }

    /// Ticks until the timer fires
    pub fn remaining(&self, id: &I) -> Option<u64> {
        self.lock().remaining(id)
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every timer selected by `filter` by `delta` ticks (never below one tick)
    pub fn shift<F>(&self, filter: F, delta: i64) -> usize
    where
        F: Fn(&I) -> bool,
    {
        if delta == 0 {
            return 0;
        }
        let mut state = self.lock();
        let selected: Vec<(I, u64)> = state
            .index
            .keys()
            .filter(|id| filter(id))
            .filter_map(|id| state.remaining(id).map(|left| (id.clone(), left)))
            .collect();
        for (id, left) in &selected {
            let Some(slot) = state.index.get(id).copied() else {
                continue;
            };
            let Some(timer) = state.slots[slot].remove(id) else {
                continue;
            };
            let moved = if delta.is_negative() {
                left.saturating_sub(delta.unsigned_abs())
            } else {
                left.saturating_add(delta as u64)
            };
            state.place(id.clone(), timer, moved.max(1));
        }
        selected.len()
    }

    /// Advance one slot and detach the callbacks that are due
    pub fn collect_due(&self) -> Vec<Task> {
        let mut state = self.lock();
        let n = state.slots.len();
        state.cursor = (state.cursor + 1) % n;
        let cursor = state.cursor;
        let slot = std::mem::take(&mut state.slots[cursor]);
        let mut due = Vec::new();
        let mut repeats = Vec::new();
        for (id, mut timer) in slot {
            if timer.rounds > 0 {
                timer.rounds -= 1;
                state.slots[cursor].insert(id, timer);
                continue;
            }
            state.index.remove(&id);
            due.push(timer.task.clone());
            if timer.repeat {
                repeats.push((id, timer));
            }
        }
        for (id, timer) in repeats {
            let interval = timer.interval;
            state.place(id, timer, interval);
        }
        self.elapsed.fetch_add(1, Ordering::AcqRel);
        due
    }

    /// Advance one slot and run the due callbacks on the calling thread
    pub fn advance(&self) -> usize {
        let due = self.collect_due();
        for task in &due {
            task();
        }
        due.len()
    }

    pub fn advance_by(&self, ticks: u64) -> usize {
        (0..ticks).map(|_| self.advance()).sum()
    }
}

/// Object-safe view of a wheel for the driver
pub trait Tick: Send + Sync {
    fn collect_due(&self) -> Vec<Task>;
}

impl<I: Hash + Eq + Clone + Send + 'static> Tick for TimingWheel<I> {
    fn collect_due(&self) -> Vec<Task> {
        TimingWheel::collect_due(self)
    }
}

/// Ticks every registered wheel at a fixed interval. Due callbacks are sent
/// over a bounded channel to one executor task, which runs them in order.
pub struct WheelDriver {
    interval: Duration,
    wheels: Vec<Arc<dyn Tick>>,
    queue_depth: usize,
}

impl WheelDriver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            wheels: Vec::new(),
            queue_depth: 1024,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn register(&mut self, wheel: Arc<dyn Tick>) {
        self.wheels.push(wheel);
    }

    /// Start the ticker and executor on the current tokio runtime
    pub fn spawn(self) -> DriverHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel::<Task>(self.queue_depth);

        let executor = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            debug!("Timer executor drained");
        });

        let stop = shutdown.clone();
        let wheels = self.wheels;
        let interval = self.interval;
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Timer driver started: {} wheel(s), tick {:?}", wheels.len(), interval);
            loop {
                ticks.tick().await;
                if stop.load(Ordering::Acquire) {
                    break;
                }
                for wheel in &wheels {
                    for task in wheel.collect_due() {
                        if tx.send(task).await.is_err() {
                            warn!("Timer executor gone, stopping driver");
                            return;
                        }
                    }
                }
            }
            info!("Timer driver stopped");
        });

        DriverHandle {
            shutdown,
            ticker,
            executor,
        }
    }
}

pub struct DriverHandle {
    shutdown: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
    executor: JoinHandle<()>,
}

impl DriverHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop ticking and wait for queued callbacks to finish
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.ticker.await {
            warn!("Timer driver task failed: {}", e);
        }
        if let Err(e) = self.executor.await {
            warn!("Timer executor task failed: {}", e);
        }
    }
}
