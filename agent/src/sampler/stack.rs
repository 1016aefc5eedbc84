//! Stack-sampling session
//!
//! Periodically asks a [`StackSource`] for a thread dump and counts how often
//! each distinct stack is seen, per thread group.

use super::{
    Completion, CompletionCallback, Sampler, SamplerFactory, SamplerId, SamplerOutcome,
    SamplerSettings,
};
use crate::config::ThreadGrouping;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tickscope_shared::types::profile::{Profile, Stack, StackCount, ThreadProfile};
use tickscope_shared::utils::time::system_time_millis;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Sleeping,
}

/// One thread's stack at the instant of a capture
#[derive(Debug, Clone)]
pub struct ThreadDump {
    pub name: String,
    pub state: ThreadState,
    pub stack: Stack,
}

/// Captures the host's thread stacks
pub trait StackSource: Send + Sync {
    fn capture(&self) -> anyhow::Result<Vec<ThreadDump>>;
}

/// Counts identical stacks per thread group
#[derive(Debug, Default)]
struct ProfileBuilder {
    threads: HashMap<String, HashMap<Stack, u64>>,
}

impl ProfileBuilder {
    fn record(&mut self, dump: Vec<ThreadDump>, grouping: ThreadGrouping, ignore_sleeping: bool) {
        for thread in dump {
            if ignore_sleeping && thread.state == ThreadState::Sleeping {
                continue;
            }
            let group = group_name(&thread.name, grouping);
            *self
                .threads
                .entry(group)
                .or_default()
                .entry(thread.stack)
                .or_insert(0) += 1;
        }
    }

    fn build(&self, start_time_ms: u64, end_time_ms: u64, interval_us: u64) -> Profile {
        let mut profile = Profile::new(start_time_ms, end_time_ms, interval_us);
        for (name, stacks) in &self.threads {
            let mut stacks: Vec<StackCount> = stacks
                .iter()
                .map(|(stack, &samples)| StackCount {
                    stack: stack.clone(),
                    samples,
                })
                .collect();
            stacks.sort_by(|a, b| {
                b.samples
                    .cmp(&a.samples)
                    .then_with(|| a.stack.folded().cmp(&b.stack.folded()))
            });
            profile.threads.push(ThreadProfile {
                name: name.clone(),
                total_samples: stacks.iter().map(|s| s.samples).sum(),
                stacks,
            });
        }
        profile
    }
}

/// Node name a thread is merged under
pub fn group_name(thread: &str, grouping: ThreadGrouping) -> String {
    match grouping {
        ThreadGrouping::ByName => thread.to_string(),
        ThreadGrouping::AsOne => "All".to_string(),
        ThreadGrouping::ByPool => {
            let digits = thread.trim_end_matches(|c: char| c.is_ascii_digit());
            if digits.len() == thread.len() {
                return thread.to_string();
            }
            match digits.strip_suffix(|c: char| c == '-' || c == '#') {
                Some(pool) if !pool.is_empty() => format!("{} (combined)", pool),
                _ => thread.to_string(),
            }
        }
    }
}

/// A running stack-sampling session
pub struct StackSampler {
    id: SamplerId,
    start_time_ms: u64,
    end_time_ms: Mutex<Option<u64>>,
    settings: SamplerSettings,
    source: Arc<dyn StackSource>,
    data: Mutex<ProfileBuilder>,
    completion: Completion,
    cancel: CancellationToken,
}

impl StackSampler {
    /// Spawn a session on `handle`. Returns immediately.
    pub fn start(
        handle: &tokio::runtime::Handle,
        source: Arc<dyn StackSource>,
        settings: SamplerSettings,
    ) -> Arc<Self> {
        let sampler = Arc::new(Self {
            id: SamplerId::next(),
            start_time_ms: system_time_millis(),
            end_time_ms: Mutex::new(None),
            settings,
            source,
            data: Mutex::new(ProfileBuilder::default()),
            completion: Completion::new(),
            cancel: CancellationToken::new(),
        });
        info!(
            sampler = %sampler.id,
            interval_us = sampler.settings.interval.as_micros() as u64,
            max_secs = sampler.settings.max_duration.as_secs(),
            "sampler started"
        );
        handle.spawn(sampler.clone().run());
        sampler
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(self.settings.max_duration);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SamplerOutcome::Cancelled,
                _ = &mut deadline => break SamplerOutcome::Completed,
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once() {
                        warn!(sampler = %self.id, "stack capture failed: {:#}", e);
                        break SamplerOutcome::Failed(e.to_string());
                    }
                }
            }
        };
        self.finish(outcome);
    }

    fn sample_once(&self) -> anyhow::Result<()> {
        let dump = self.source.capture()?;
        debug!(sampler = %self.id, threads = dump.len(), "captured thread dump");
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(dump, self.settings.thread_grouping, self.settings.ignore_sleeping);
        Ok(())
    }

    fn finish(&self, outcome: SamplerOutcome) {
        {
            let mut end = self.end_time_ms.lock().unwrap_or_else(|e| e.into_inner());
            if end.is_none() {
                *end = Some(system_time_millis());
            }
        }
        if self.completion.complete(outcome.clone()) {
            info!(sampler = %self.id, ?outcome, "sampler finished");
        }
    }
}

impl Sampler for StackSampler {
    fn id(&self) -> SamplerId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    fn cancel(&self) {
        if self.completion.is_done() {
            return;
        }
        self.cancel.cancel();
        self.finish(SamplerOutcome::Cancelled);
    }

    fn on_complete(&self, callback: CompletionCallback) {
        self.completion.subscribe(callback);
    }

    fn outcome(&self) -> Option<SamplerOutcome> {
        self.completion.outcome()
    }

    fn profile(&self) -> Profile {
        let end = self
            .end_time_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(system_time_millis);
        self.data.lock().unwrap_or_else(|e| e.into_inner()).build(
            self.start_time_ms,
            end,
            self.settings.interval.as_micros() as u64,
        )
    }
}

/// Starts [`StackSampler`] sessions on a tokio runtime
pub struct StackSamplerFactory {
    handle: tokio::runtime::Handle,
    source: Arc<dyn StackSource>,
}

impl StackSamplerFactory {
    pub fn new(handle: tokio::runtime::Handle, source: Arc<dyn StackSource>) -> Self {
        Self { handle, source }
    }
}

impl SamplerFactory for StackSamplerFactory {
    fn start(&self, settings: SamplerSettings) -> Result<Arc<dyn Sampler>> {
        let sampler: Arc<dyn Sampler> = StackSampler::start(&self.handle, self.source.clone(), settings);
        Ok(sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FixedSource;

    impl StackSource for FixedSource {
        fn capture(&self) -> anyhow::Result<Vec<ThreadDump>> {
            Ok(vec![
                ThreadDump {
                    name: "Server thread".into(),
                    state: ThreadState::Running,
                    stack: Stack::from_names(&["tickEntities", "tick", "run"]),
                },
                ThreadDump {
                    name: "Worker-3".into(),
                    state: ThreadState::Sleeping,
                    stack: Stack::from_names(&["park", "run"]),
                },
            ])
        }
    }

    struct BrokenSource;

    impl StackSource for BrokenSource {
        fn capture(&self) -> anyhow::Result<Vec<ThreadDump>> {
            anyhow::bail!("thread dump unavailable")
        }
    }

    fn settings(max: Duration) -> SamplerSettings {
        SamplerSettings {
            interval: Duration::from_millis(10),
            max_duration: max,
            thread_grouping: ThreadGrouping::ByPool,
            ignore_sleeping: false,
        }
    }

    fn counter(sampler: &Arc<StackSampler>) -> Arc<AtomicU32> {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        sampler.on_complete(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        hits
    }

    #[test]
    fn test_group_names() {
        assert_eq!(group_name("Worker-12", ThreadGrouping::ByPool), "Worker (combined)");
        assert_eq!(group_name("pool#3", ThreadGrouping::ByPool), "pool (combined)");
        assert_eq!(group_name("Server thread", ThreadGrouping::ByPool), "Server thread");
        assert_eq!(group_name("tick2", ThreadGrouping::ByPool), "tick2");
        assert_eq!(group_name("-7", ThreadGrouping::ByPool), "-7");
        assert_eq!(group_name("Worker-12", ThreadGrouping::ByName), "Worker-12");
        assert_eq!(group_name("Worker-12", ThreadGrouping::AsOne), "All");
    }

    #[test]
    fn test_builder_counts_identical_stacks() {
        let mut builder = ProfileBuilder::default();
        for _ in 0..3 {
            builder.record(FixedSource.capture().unwrap(), ThreadGrouping::ByName, false);
        }
        builder.record(FixedSource.capture().unwrap(), ThreadGrouping::ByName, true);

        let profile = builder.build(0, 10, 4000);
        assert_eq!(profile.thread("Server thread").unwrap().total_samples, 4);
        assert_eq!(profile.thread("Worker-3").unwrap().total_samples, 3);
        assert_eq!(profile.thread("Server thread").unwrap().stacks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_completes_at_max_duration() {
        let handle = tokio::runtime::Handle::current();
        let sampler = StackSampler::start(&handle, Arc::new(FixedSource), settings(Duration::from_millis(100)));
        let hits = counter(&sampler);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sampler.outcome().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sampler.outcome(), Some(SamplerOutcome::Completed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let profile = sampler.profile();
        let main = profile.thread("Server thread").unwrap();
        assert!(main.total_samples >= 5, "only {} samples", main.total_samples);
        assert!(profile.thread("Worker (combined)").is_some());

        // late cancel is a no-op
        sampler.cancel();
        assert_eq!(sampler.outcome(), Some(SamplerOutcome::Completed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_completes_immediately_once() {
        let handle = tokio::runtime::Handle::current();
        let sampler = StackSampler::start(&handle, Arc::new(FixedSource), settings(Duration::from_secs(60)));
        let hits = counter(&sampler);

        tokio::time::sleep(Duration::from_millis(35)).await;
        sampler.cancel();
        assert_eq!(sampler.outcome(), Some(SamplerOutcome::Cancelled));
        sampler.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let partial = sampler.profile();
        assert!(partial.total_samples() > 0);
        let frozen = partial.total_samples();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sampler.profile().total_samples(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_fails_session() {
        let handle = tokio::runtime::Handle::current();
        let sampler = StackSampler::start(&handle, Arc::new(BrokenSource), settings(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(sampler.outcome(), Some(SamplerOutcome::Failed(_))));
    }
}
