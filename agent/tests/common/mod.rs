#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tickscope_agent::error::Result;
use tickscope_agent::report::{MessageSink, ReportSink, SessionReport};
use tickscope_agent::sampler::{
    Completion, CompletionCallback, Sampler, SamplerFactory, SamplerId, SamplerOutcome,
    SamplerSettings,
};
use tickscope_agent::stats::TpsSource;
use tickscope_shared::types::profile::{Profile, Stack, StackCount, ThreadProfile};

/// Session that only ends when told to
pub struct FakeSampler {
    id: SamplerId,
    pub settings: SamplerSettings,
    completion: Completion,
    pub cancels: AtomicU32,
}

impl FakeSampler {
    pub fn new(settings: SamplerSettings) -> Self {
        Self {
            id: SamplerId::next(),
            settings,
            completion: Completion::new(),
            cancels: AtomicU32::new(0),
        }
    }

    /// Reach the maximum duration
    pub fn finish(&self) {
        self.completion.complete(SamplerOutcome::Completed);
    }

    /// End with a capture failure
    pub fn fail(&self, reason: &str) {
        self.completion
            .complete(SamplerOutcome::Failed(reason.to_string()));
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}

impl Sampler for FakeSampler {
    fn id(&self) -> SamplerId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        1_000
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.completion.complete(SamplerOutcome::Cancelled);
    }

    fn on_complete(&self, callback: CompletionCallback) {
        self.completion.subscribe(callback);
    }

    fn outcome(&self) -> Option<SamplerOutcome> {
        self.completion.outcome()
    }

    fn profile(&self) -> Profile {
        let mut profile = Profile::new(1_000, 2_000, 4_000);
        profile.threads.push(ThreadProfile {
            name: "Server thread".to_string(),
            total_samples: 10,
            stacks: vec![StackCount {
                stack: Stack::from_names(&["main", "tick"]),
                samples: 10,
            }],
        });
        profile
    }
}

/// Factory that records every session and checks none overlap
#[derive(Default)]
pub struct FakeFactory {
    pub started: Mutex<Vec<Arc<FakeSampler>>>,
}

impl FakeFactory {
    pub fn count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeSampler> {
        self.started.lock().unwrap().last().cloned().expect("no session started")
    }

    pub fn running(&self) -> usize {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_done())
            .count()
    }
}

impl SamplerFactory for FakeFactory {
    fn start(&self, settings: SamplerSettings) -> Result<Arc<dyn Sampler>> {
        let mut started = self.started.lock().unwrap();
        assert!(
            started.iter().all(|s| s.is_done()),
            "a session was started while another is running"
        );
        let sampler = Arc::new(FakeSampler::new(settings));
        started.push(sampler.clone());
        Ok(sampler)
    }
}

/// Tick rate the test sets directly
pub struct SettableTps(Mutex<f64>);

impl SettableTps {
    pub fn new(tps: f64) -> Self {
        Self(Mutex::new(tps))
    }

    pub fn set(&self, tps: f64) {
        *self.0.lock().unwrap() = tps;
    }
}

impl TpsSource for SettableTps {
    fn short_term_tps(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct CountingReporter {
    pub started: Mutex<Vec<(SamplerId, String)>>,
    pub published: Mutex<Vec<SessionReport>>,
    pub discarded: Mutex<Vec<(SamplerId, String)>>,
}

impl CountingReporter {
    pub fn reasons(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn published(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn discarded(&self) -> Vec<(SamplerId, String)> {
        self.discarded.lock().unwrap().clone()
    }
}

impl ReportSink for CountingReporter {
    fn session_started(&self, sampler: SamplerId, _start_time_ms: u64, reason: &str) {
        self.started.lock().unwrap().push((sampler, reason.to_string()));
    }

    fn publish(&self, report: SessionReport) {
        self.published.lock().unwrap().push(report);
    }

    fn session_discarded(&self, sampler: SamplerId, _end_time_ms: u64, reason: &str) {
        self.discarded
            .lock()
            .unwrap()
            .push((sampler, reason.to_string()));
    }
}

#[derive(Default)]
pub struct CollectingSink(pub Mutex<Vec<String>>);

impl MessageSink for CollectingSink {
    fn send(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}
