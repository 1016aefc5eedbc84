//! Tickscope demonstration host
//!
//! Runs a simulated 20 tick/s server loop with periodic lag spikes and the
//! diagnostics agent attached, so the auto sampler can be watched end to end.

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tickscope_agent::clock::SystemClock;
use tickscope_agent::report::{LogSink, MessageSink, ReportSink, ReportingPipeline, SessionReport};
use tickscope_agent::sampler::{
    SamplerId, StackSamplerFactory, StackSource, ThreadDump, ThreadState,
};
use tickscope_agent::scheduler::TokioScheduler;
use tickscope_agent::tick::{TickCounter, TickSignal};
use tickscope_agent::{AgentConfig, Diagnostics, HostServices};
use tickscope_shared::types::profile::Stack;
use tickscope_shared::utils::parse_duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "tickscope-agent")]
#[command(about = "Tick-rate diagnostics demo host", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML); TICKSCOPE__* environment variables override it
    #[arg(short, long, env = "TICKSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to run (e.g., "30s", "5m", "1h")
    #[arg(short, long, default_value = "2m")]
    duration: String,

    /// Inject a lag spike every N ticks (0 disables)
    #[arg(long, default_value = "600")]
    lag_every: u64,

    /// Length of each lag spike in milliseconds
    #[arg(long, default_value = "400")]
    lag_ms: u64,

    /// Log reports locally instead of uploading them
    #[arg(long)]
    offline: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_tracing(args.verbose)?;

    let duration = parse_duration(&args.duration)
        .map_err(|e| eyre!("{:#}", e))
        .wrap_err("Failed to parse duration")?;
    let config =
        AgentConfig::load(args.config.as_deref()).wrap_err("Failed to load configuration")?;

    info!("Starting tickscope demo host");
    info!(
        "Running for {}s, lag spike of {}ms every {} ticks",
        duration.as_secs(),
        args.lag_ms,
        args.lag_every
    );

    let handle = tokio::runtime::Handle::current();
    let sink: Arc<dyn MessageSink> = Arc::new(LogSink);
    let pipeline = if args.offline {
        None
    } else {
        Some(
            ReportingPipeline::from_config(&config.reporting, handle.clone(), sink.clone())
                .map_err(|e| eyre!("{:#}", e))?,
        )
    };
    let reporter: Arc<dyn ReportSink> = match &pipeline {
        Some(pipeline) => Arc::new(pipeline.clone()),
        None => Arc::new(LocalReport),
    };

    let phase = Arc::new(Mutex::new("idle"));
    let ticks = Arc::new(TickCounter::new());
    let tick_signal: Arc<dyn TickSignal> = ticks.clone();

    let mut diagnostics = Diagnostics::new(
        config,
        HostServices {
            tick_signal: Some(tick_signal),
            clock: Arc::new(SystemClock::new()),
            scheduler: Arc::new(TokioScheduler::new(handle.clone())),
            sampler_factory: Arc::new(StackSamplerFactory::new(
                handle.clone(),
                Arc::new(PhaseStackSource {
                    phase: phase.clone(),
                }),
            )),
            reporter,
            sink,
        },
    );
    diagnostics.enable();

    let running = Arc::new(AtomicBool::new(true));
    let server = {
        let running = running.clone();
        let lag = LagSpikes {
            every: args.lag_every,
            length: Duration::from_millis(args.lag_ms),
        };
        std::thread::Builder::new()
            .name("Server thread".to_string())
            .spawn(move || server_loop(&ticks, &phase, lag, &running))
            .wrap_err("Failed to spawn server thread")?
    };

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut status = tokio::time::interval(Duration::from_secs(10));
    status.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = status.tick() => {
                if let Some(stats) = diagnostics.statistics() {
                    info!("TPS from last 5s, 10s, 1m, 5m, 15m: {}", stats.describe());
                }
                if let Some(session) = diagnostics.active_sampler().get() {
                    info!("Sampler {} active", session.id());
                }
            }
        }
    }

    running.store(false, Ordering::Release);
    if server.join().is_err() {
        warn!("Server thread panicked");
    }
    diagnostics.disable();

    if let Some(pipeline) = pipeline {
        info!("Waiting for pending uploads");
        pipeline.drain().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct LagSpikes {
    every: u64,
    length: Duration,
}

/// Fixed-cadence loop: each tick does some "work" then sleeps off the rest
/// of its 50ms budget. Every `lag.every` ticks one tick overruns.
fn server_loop(ticks: &TickCounter, phase: &Mutex<&'static str>, lag: LagSpikes, running: &AtomicBool) {
    let set_phase = |name: &'static str| {
        *phase.lock().unwrap_or_else(|e| e.into_inner()) = name;
    };

    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        let tick = ticks.current_tick();
        ticks.tick();

        set_phase("entity_tick");
        std::thread::sleep(Duration::from_millis(5));

        if lag.every > 0 && tick > 0 && tick % lag.every == 0 {
            set_phase("chunk_generation");
            std::thread::sleep(lag.length);
        }

        set_phase("idle");
        if let Some(rest) = TICK_INTERVAL.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}

/// Reports the server thread's current phase as its stack
struct PhaseStackSource {
    phase: Arc<Mutex<&'static str>>,
}

impl StackSource for PhaseStackSource {
    fn capture(&self) -> anyhow::Result<Vec<ThreadDump>> {
        let phase = *self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let state = if phase == "idle" {
            ThreadState::Sleeping
        } else {
            ThreadState::Running
        };
        let mut threads = vec![ThreadDump {
            name: "Server thread".to_string(),
            state,
            stack: Stack::from_names(&["main", "server_loop", phase]),
        }];
        for worker in 1..=2 {
            threads.push(ThreadDump {
                name: format!("Worker-{}", worker),
                state: ThreadState::Sleeping,
                stack: Stack::from_names(&["worker_main", "park"]),
            });
        }
        Ok(threads)
    }
}

/// Logs a summary of each report instead of uploading it
struct LocalReport;

impl ReportSink for LocalReport {
    fn publish(&self, mut report: SessionReport) {
        report.profile.sort_threads(report.order);
        info!(
            "Report {} ({}): {} samples over {}ms",
            report.sampler,
            report.comment,
            report.profile.total_samples(),
            report.profile.duration_ms()
        );
        for thread in &report.profile.threads {
            for stack in thread.stacks.iter().take(3) {
                info!("  {} {} {}", thread.name, stack.samples, stack.stack.folded());
            }
        }
    }

    fn session_discarded(&self, sampler: SamplerId, _end_time_ms: u64, reason: &str) {
        info!("Session {} produced no report: {}", sampler, reason);
    }
}
