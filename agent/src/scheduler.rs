//! Deferred background tasks
//!
//! Cancelling a [`ScheduledTask`] is advisory: a task that has already
//! started runs to completion, so task bodies must re-check whatever state
//! they act on.

use crate::clock::{Clock, ManualClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the tick thread after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;
}

/// Handle to a scheduled task
#[derive(Debug)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl ScheduledTask {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Prevent the task from running if it has not started yet
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // No await points past this check: once started, the task finishes.
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });
        ScheduledTask::new(cancelled, Some(join.abort_handle()))
    }
}

struct PendingTask {
    due: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

/// Scheduler driven explicitly against a [`ManualClock`]
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    pending: Mutex<Vec<PendingTask>>,
    next_seq: Mutex<u64>,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(Vec::new()),
            next_seq: Mutex::new(0),
        }
    }

    /// Number of tasks waiting, cancelled ones included
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run every task due at the current clock reading, including tasks those
    /// tasks schedule with no delay. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                let now = self.clock.now();
                let idx = pending
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= now)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(i, _)| i);
                idx.map(|i| pending.remove(i))
            };
            let Some(next) = next else {
                return ran;
            };
            if next.cancelled.load(Ordering::Acquire) {
                continue;
            }
            (next.task)();
            ran += 1;
        }
    }

    /// Advance the clock by `by` and run whatever became due
    pub fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.run_due()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = {
            let mut next = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingTask {
                due: self.clock.now() + delay,
                seq,
                cancelled: cancelled.clone(),
                task,
            });
        ScheduledTask::new(cancelled, None)
    }
}
