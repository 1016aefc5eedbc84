//! Tick-rate diagnostics agent
//!
//! Embeds in a host that runs a fixed-cadence main loop ("ticks"). It keeps
//! rolling tick-rate averages over several horizons and, when the host
//! degrades, captures a bounded stack-sampling session and publishes it as a
//! shareable report.
//!
//! A host wires its services into [`HostServices`] and drives everything
//! through [`Diagnostics`].

pub mod auto;
pub mod clock;
pub mod config;
pub mod error;
pub mod report;
pub mod retry;
pub mod sampler;
pub mod scheduler;
pub mod stats;
pub mod tick;

pub use auto::{AutoSampler, AutoSamplerContext, StartReason};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use stats::TickStatistics;

use clock::Clock;
use report::{MessageSink, ReportSink};
use sampler::{ActiveSampler, SamplerFactory};
use scheduler::Scheduler;
use std::sync::Arc;
use tick::{Subscription, TickSignal};
use tickscope_shared::types::tps::TpsSnapshot;
use tracing::{info, warn};

/// What a host provides to the agent
#[derive(Clone)]
pub struct HostServices {
    /// `None` on hosts without a main-loop hook
    pub tick_signal: Option<Arc<dyn TickSignal>>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    pub sampler_factory: Arc<dyn SamplerFactory>,
    pub reporter: Arc<dyn ReportSink>,
    pub sink: Arc<dyn MessageSink>,
}

/// The agent as seen by a host: enable on startup, disable on shutdown
pub struct Diagnostics {
    config: AgentConfig,
    services: HostServices,
    active: Arc<ActiveSampler>,
    statistics: Option<Arc<TickStatistics>>,
    statistics_subscription: Option<Subscription>,
    auto_sampler: Option<AutoSampler>,
    enabled: bool,
}

impl Diagnostics {
    pub fn new(config: AgentConfig, services: HostServices) -> Self {
        Self {
            config,
            services,
            active: Arc::new(ActiveSampler::new()),
            statistics: None,
            statistics_subscription: None,
            auto_sampler: None,
            enabled: false,
        }
    }

    /// Start statistics and, if configured, the auto sampler
    pub fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;

        let tick_signal = self.services.tick_signal.clone();
        match &tick_signal {
            Some(signal) => {
                let statistics = Arc::new(TickStatistics::new(
                    &self.config.statistics,
                    self.services.clock.clone(),
                ));
                let stats = statistics.clone();
                self.statistics_subscription =
                    Some(signal.add_callback(Arc::new(move |tick| stats.on_tick(tick))));
                self.statistics = Some(statistics);
                signal.start();
                info!(windows = ?self.config.statistics.windows_secs, "tick statistics enabled");
            }
            None => {
                warn!("host has no tick signal, tick statistics disabled");
                self.services
                    .sink
                    .send("Tick statistics are not supported on this platform");
            }
        }

        if !self.config.auto_sampler.enabled {
            return;
        }

        // The controller reads the short-term average, so it needs statistics.
        let Some(statistics) = self.statistics.clone() else {
            let e = AgentError::Unsupported("tick signal unavailable");
            warn!("auto sampler unavailable: {}", e);
            self.services.sink.send(&format!("Auto sampler {}", e));
            return;
        };
        let ctx = AutoSamplerContext {
            tps: statistics,
            active: self.active.clone(),
            factory: self.services.sampler_factory.clone(),
            reporter: self.services.reporter.clone(),
            scheduler: self.services.scheduler.clone(),
            clock: self.services.clock.clone(),
        };
        match AutoSampler::new(self.config.auto_sampler.clone(), tick_signal, ctx) {
            Ok(auto_sampler) => self.auto_sampler = Some(auto_sampler),
            Err(e) => {
                warn!("auto sampler unavailable: {}", e);
                self.services.sink.send(&format!("Auto sampler {}", e));
            }
        }
    }

    /// Stop the auto sampler and detach from the tick signal. A session that
    /// is still running finishes on its own.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;

        if let Some(auto_sampler) = self.auto_sampler.take() {
            auto_sampler.close();
        }
        if let Some(signal) = &self.services.tick_signal {
            if let Some(subscription) = self.statistics_subscription.take() {
                signal.remove_callback(subscription);
            }
            signal.close();
        }
        self.statistics = None;
        info!("diagnostics disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current rolling averages, if statistics are running
    pub fn tps(&self) -> Option<TpsSnapshot> {
        self.statistics.as_ref().map(|s| s.snapshot())
    }

    pub fn statistics(&self) -> Option<&Arc<TickStatistics>> {
        self.statistics.as_ref()
    }

    pub fn auto_sampler(&self) -> Option<&AutoSampler> {
        self.auto_sampler.as_ref()
    }

    /// The process-wide active session slot
    pub fn active_sampler(&self) -> &Arc<ActiveSampler> {
        &self.active
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        self.disable();
    }
}
