//! Tick signal abstraction
//!
//! A host wires "one tick elapsed" into a [`TickSignal`]; statistics and the
//! auto sampler subscribe to it. Dispatch walks a snapshot of the callback
//! list, so callbacks may subscribe or unsubscribe while being called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type TickCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Token returned by [`TickSignal::add_callback`], used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Source of per-tick callbacks
pub trait TickSignal: Send + Sync {
    fn add_callback(&self, callback: TickCallback) -> Subscription;

    /// Returns false if the subscription was already gone
    fn remove_callback(&self, subscription: Subscription) -> bool;

    /// Begin dispatching. Starting a stopped signal counts from tick 0 again.
    fn start(&self);

    fn close(&self);

    fn current_tick(&self) -> u64;
}

/// Tick signal the host drives by calling [`TickCounter::tick`] once per tick
#[derive(Default)]
pub struct TickCounter {
    callbacks: Mutex<Vec<(Subscription, TickCallback)>>,
    next_id: AtomicU64,
    tick: AtomicU64,
    running: AtomicBool,
}

impl TickCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify every subscriber of the current tick, then advance the counter.
    /// Ignored unless the signal has been started.
    pub fn tick(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let current = self.tick.load(Ordering::Acquire);
        let snapshot: Vec<TickCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(current);
        }
        self.tick.fetch_add(1, Ordering::AcqRel);
    }

    pub fn subscribers(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl TickSignal for TickCounter {
    fn add_callback(&self, callback: TickCallback) -> Subscription {
        let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((subscription, callback));
        subscription
    }

    fn remove_callback(&self, subscription: Subscription) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(s, _)| *s != subscription);
        callbacks.len() < before
    }

    fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            self.tick.store(0, Ordering::Release);
        }
    }

    fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }
}
