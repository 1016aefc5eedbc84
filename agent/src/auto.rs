//! Automatic profiling controller
//!
//! Watches every tick and starts a sampling session when the host degrades:
//! either the short-term tick rate drops under a threshold, or a single tick
//! runs longer than the late-tick limit. The session is stopped and reported
//! once ticks are stable again and the average has recovered, or it ends by
//! itself after its maximum duration.
//!
//! At most one session exists at a time. The shared [`ActiveSampler`] slot is
//! only ever cleared by session id, so a stop racing a natural completion
//! produces exactly one report.

use crate::clock::Clock;
use crate::config::AutoSamplerConfig;
use crate::error::{AgentError, Result};
use crate::report::{ReportSink, SessionReport};
use crate::sampler::{
    ActiveSampler, Sampler, SamplerFactory, SamplerId, SamplerOutcome, SamplerSettings,
};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::stats::TpsSource;
use crate::tick::{Subscription, TickSignal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tickscope_shared::types::profile::NodeOrder;
use tickscope_shared::utils::time::system_time_millis;
use tracing::{debug, info, warn};

/// Why a session was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    /// Short-term average under the threshold
    AverageTps,
    /// A tick has been running longer than the late-tick limit
    LateTick,
}

impl StartReason {
    pub fn message(&self) -> &'static str {
        match self {
            StartReason::AverageTps => "average tick rate degraded",
            StartReason::LateTick => "a tick is taking abnormally long",
        }
    }
}

impl std::fmt::Display for StartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Everything the controller talks to besides the tick signal
#[derive(Clone)]
pub struct AutoSamplerContext {
    pub tps: Arc<dyn TpsSource>,
    pub active: Arc<ActiveSampler>,
    pub factory: Arc<dyn SamplerFactory>,
    pub reporter: Arc<dyn ReportSink>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct AutoSamplerState {
    consecutive_stable_ticks: u32,
    last_tick: Option<Duration>,
    last_profile_end: Option<Duration>,
    sampler: Option<Arc<dyn Sampler>>,
    late_tick_check: Option<ScheduledTask>,
}

struct Inner {
    config: AutoSamplerConfig,
    ctx: AutoSamplerContext,
    state: Mutex<AutoSamplerState>,
    this: Weak<Inner>,
}

/// Tick-driven controller that starts and stops sampling sessions
pub struct AutoSampler {
    inner: Arc<Inner>,
    signal: Arc<dyn TickSignal>,
    subscription: Subscription,
    closed: AtomicBool,
}

impl AutoSampler {
    /// Subscribe a new controller to `signal`.
    ///
    /// Fails with [`AgentError::Unsupported`] when the host has no tick
    /// signal; the caller should report that and carry on without it.
    pub fn new(
        config: AutoSamplerConfig,
        signal: Option<Arc<dyn TickSignal>>,
        ctx: AutoSamplerContext,
    ) -> Result<Self> {
        let signal = signal.ok_or(AgentError::Unsupported("tick signal unavailable"))?;

        let inner = Arc::new_cyclic(|this| Inner {
            config,
            ctx,
            state: Mutex::new(AutoSamplerState::default()),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = signal.add_callback(Arc::new(move |tick| {
            if let Some(inner) = weak.upgrade() {
                inner.on_tick(tick);
            }
        }));

        info!(
            warmup_ticks = inner.config.warmup_ticks,
            late_tick_ms = inner.config.late_tick_ms,
            threshold = inner.config.avg_tps_threshold,
            "auto sampler enabled"
        );

        Ok(Self {
            inner,
            signal,
            subscription,
            closed: AtomicBool::new(false),
        })
    }

    /// Feed one tick. Normally called by the tick signal.
    pub fn on_tick(&self, tick: u64) {
        self.inner.on_tick(tick);
    }

    /// Stop and report the running session, if this controller started it
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        self.inner.stop_profiling(&mut state);
    }

    /// Id of the session this controller is running
    pub fn current_session(&self) -> Option<SamplerId> {
        self.inner.lock().sampler.as_ref().map(|s| s.id())
    }

    pub fn is_profiling(&self) -> bool {
        self.current_session().is_some()
    }

    /// Cancel the pending late-tick check and unsubscribe. A running session
    /// is left to finish on its own; its completion still clears the shared
    /// slot and publishes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(check) = self.inner.lock().late_tick_check.take() {
            check.cancel();
        }
        self.signal.remove_callback(self.subscription);
        debug!("auto sampler closed");
    }
}

impl Drop for AutoSampler {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, AutoSamplerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_tick(&self, tick: u64) {
        if tick < self.config.warmup_ticks {
            return;
        }

        let now = self.ctx.clock.now();
        let mut state = self.lock();

        if let Some(check) = state.late_tick_check.take() {
            check.cancel();
        }

        if let Some(last) = state.last_tick {
            if now.saturating_sub(last) < self.config.late_tick() {
                state.consecutive_stable_ticks = state.consecutive_stable_ticks.saturating_add(1);
            } else {
                state.consecutive_stable_ticks = 0;
            }
        }

        let average = self.ctx.tps.short_term_tps();

        if state.sampler.is_some()
            && state.consecutive_stable_ticks == self.config.stable_ticks_threshold
            && average > self.config.avg_tps_threshold
        {
            info!(tps = average, "tick rate recovered, stopping auto sampler");
            self.stop_profiling(&mut state);
        }

        let weak = self.this.clone();
        state.late_tick_check = Some(self.ctx.scheduler.schedule(
            self.config.late_tick(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_late_tick();
                }
            }),
        ));

        if average < self.config.avg_tps_threshold {
            self.start_profiling(&mut state, StartReason::AverageTps);
        }

        state.last_tick = Some(now);
    }

    /// Deferred check: the tick that scheduled it has not been followed by
    /// another one in time
    fn handle_late_tick(&self) {
        let mut state = self.lock();
        // The check may run after being cancelled.
        if state.sampler.is_some() || self.ctx.active.is_active() {
            return;
        }
        self.start_profiling(&mut state, StartReason::LateTick);
    }

    fn start_profiling(&self, state: &mut AutoSamplerState, reason: StartReason) {
        let now = self.ctx.clock.now();
        if let Some(end) = state.last_profile_end {
            if now.saturating_sub(end) < self.config.backoff() {
                return;
            }
        }
        if state.sampler.is_some() || self.ctx.active.is_active() {
            return;
        }

        let settings = SamplerSettings {
            interval: self.config.sampling_interval(),
            max_duration: self.config.max_duration(),
            thread_grouping: self.config.thread_grouping,
            ignore_sleeping: self.config.ignore_sleeping,
        };
        let sampler = match self.ctx.factory.start(settings) {
            Ok(sampler) => sampler,
            Err(e) => {
                warn!("Failed to start auto sampler: {}", e);
                return;
            }
        };

        if !self.ctx.active.try_set(sampler.clone()) {
            debug!(sampler = %sampler.id(), "another session became active, discarding");
            sampler.cancel();
            return;
        }
        state.sampler = Some(sampler.clone());

        let id = sampler.id();
        info!(sampler = %id, %reason, "auto sampler started");
        self.ctx
            .reporter
            .session_started(id, sampler.start_time_ms(), reason.message());

        // The continuation may fire right here on an already-finished
        // session, while the state lock is held: hop through the scheduler.
        // Strong: the slot must still be released after close.
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        sampler.on_complete(Box::new(move |outcome| {
            let scheduler = inner.ctx.scheduler.clone();
            scheduler.schedule(
                Duration::ZERO,
                Box::new(move || inner.on_sampler_complete(id, outcome)),
            );
        }));
    }

    fn on_sampler_complete(&self, id: SamplerId, outcome: SamplerOutcome) {
        let mut state = self.lock();
        let was_local = state.sampler.as_ref().is_some_and(|s| s.id() == id);
        if was_local {
            state.sampler = None;
        }
        let cleared = self.ctx.active.compare_and_clear(id);
        if was_local || cleared.is_some() {
            state.last_profile_end = Some(self.ctx.clock.now());
        }
        drop(state);

        let Some(sampler) = cleared else {
            if was_local {
                debug!(sampler = %id, "active session was replaced, discarding");
                self.discard(id, "replaced by another session");
            } else {
                debug!(sampler = %id, "session already stopped");
            }
            return;
        };
        match outcome {
            SamplerOutcome::Completed => {
                info!(sampler = %id, "auto sampler reached its maximum duration");
                self.publish(sampler);
            }
            SamplerOutcome::Cancelled => {
                info!(sampler = %id, "auto sampler cancelled");
                self.discard(id, "cancelled");
            }
            SamplerOutcome::Failed(e) => {
                warn!(sampler = %id, "auto sampler failed: {}", e);
                self.discard(id, &format!("failed: {}", e));
            }
        }
    }

    /// The session ended without a report
    fn discard(&self, id: SamplerId, reason: &str) {
        self.ctx
            .reporter
            .session_discarded(id, system_time_millis(), reason);
    }

    fn stop_profiling(&self, state: &mut AutoSamplerState) {
        let Some(local) = state.sampler.clone() else {
            return;
        };
        let Some(sampler) = self.ctx.active.compare_and_clear(local.id()) else {
            debug!(sampler = %local.id(), "active session was replaced, not stopping");
            return;
        };
        state.sampler = None;
        sampler.cancel();
        state.last_profile_end = Some(self.ctx.clock.now());
        self.publish(sampler);
    }

    /// Merge and hand the session to the reporter, off the tick thread
    fn publish(&self, sampler: Arc<dyn Sampler>) {
        let reporter = self.ctx.reporter.clone();
        let comment = self.config.comment.clone();
        self.ctx.scheduler.schedule(
            Duration::ZERO,
            Box::new(move || {
                reporter.publish(SessionReport {
                    sampler: sampler.id(),
                    profile: sampler.profile(),
                    comment,
                    order: NodeOrder::ByTime,
                });
            }),
        );
    }
}
