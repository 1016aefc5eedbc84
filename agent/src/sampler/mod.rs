//! Sampling sessions
//!
//! A [`Sampler`] is one bounded profiling run. The auto sampler only relies
//! on the contract here: starting never blocks, completion fires exactly
//! once, cancelling is idempotent, and a session always ends by itself after
//! its maximum duration.

pub mod stack;

pub use stack::{StackSampler, StackSamplerFactory, StackSource, ThreadDump, ThreadState};

use crate::config::ThreadGrouping;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickscope_shared::types::profile::Profile;

/// Global session id counter
static NEXT_SAMPLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerId(u64);

impl SamplerId {
    pub fn next() -> Self {
        Self(NEXT_SAMPLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SamplerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerOutcome {
    /// Ran for its full maximum duration
    Completed,
    /// Stopped early by `cancel()`
    Cancelled,
    Failed(String),
}

/// Parameters of one session
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Time between two stack captures
    pub interval: Duration,
    /// The session completes on its own after this long
    pub max_duration: Duration,
    pub thread_grouping: ThreadGrouping,
    pub ignore_sleeping: bool,
}

pub type CompletionCallback = Box<dyn FnOnce(SamplerOutcome) + Send + 'static>;

/// One profiling run
pub trait Sampler: Send + Sync {
    fn id(&self) -> SamplerId;

    /// Start time, milliseconds since UNIX epoch
    fn start_time_ms(&self) -> u64;

    /// Force completion with [`SamplerOutcome::Cancelled`]. No-op once complete.
    fn cancel(&self);

    /// Run `callback` exactly once when the session completes; immediately if
    /// it already has.
    fn on_complete(&self, callback: CompletionCallback);

    /// Outcome, if the session has completed
    fn outcome(&self) -> Option<SamplerOutcome>;

    /// Merged result so far (the full result once complete)
    fn profile(&self) -> Profile;
}

/// Starts sessions
pub trait SamplerFactory: Send + Sync {
    fn start(&self, settings: SamplerSettings) -> Result<Arc<dyn Sampler>>;
}

enum CompletionState {
    Pending(Vec<CompletionCallback>),
    Done(SamplerOutcome),
}

/// Single-fire completion signal with late subscription
pub struct Completion {
    state: Mutex<CompletionState>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::Pending(Vec::new())),
        }
    }

    /// Resolve with `outcome`. Only the first call has any effect; returns
    /// whether this call was it.
    pub fn complete(&self, outcome: SamplerOutcome) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous =
                std::mem::replace(&mut *state, CompletionState::Done(outcome.clone()));
            match previous {
                CompletionState::Pending(callbacks) => callbacks,
                CompletionState::Done(first) => {
                    *state = CompletionState::Done(first);
                    return false;
                }
            }
        };
        // Callbacks run outside the lock so they may query this session.
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }

    pub fn subscribe(&self, callback: CompletionCallback) {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                CompletionState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                CompletionState::Done(outcome) => outcome.clone(),
            }
        };
        callback(outcome);
    }

    pub fn outcome(&self) -> Option<SamplerOutcome> {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            CompletionState::Pending(_) => None,
            CompletionState::Done(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome().is_some()
    }
}

/// The process-wide "currently running sampler" slot
///
/// Shared between the auto sampler and anything else that starts or
/// inspects sessions. Clearing is compare-and-clear by session id so a stale
/// actor can never clear a newer session.
#[derive(Default)]
pub struct ActiveSampler {
    slot: Mutex<Option<Arc<dyn Sampler>>>,
}

impl ActiveSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn Sampler>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Publish `sampler` if the slot is empty
    pub fn try_set(&self, sampler: Arc<dyn Sampler>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(sampler);
        true
    }

    /// Clear the slot if and only if it holds session `id`
    pub fn compare_and_clear(&self, id: SamplerId) -> Option<Arc<dyn Sampler>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(current) if current.id() == id => slot.take(),
            _ => None,
        }
    }

    pub fn take(&self) -> Option<Arc<dyn Sampler>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
