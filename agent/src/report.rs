//! Reporting pipeline
//!
//! Turns a finished session into a shareable link: the merged profile is
//! uploaded to a content store, and when a dashboard is configured the
//! session is marked with an annotation that is created when sampling starts
//! and closed with the link once the upload is done.
//!
//! Nothing here ever returns an error to the tick thread. Failures are
//! logged and sent to the operator through a [`MessageSink`].

use crate::config::ReportingConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::sampler::SamplerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickscope_shared::types::annotation::{Annotation, AnnotationResponse};
use tickscope_shared::types::profile::{NodeOrder, Profile};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where operator-facing messages go (a console, a chat channel, ...)
pub trait MessageSink: Send + Sync {
    fn send(&self, message: &str);
}

/// Sink that writes messages to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn send(&self, message: &str) {
        info!(target: "tickscope::console", "{}", message);
    }
}

/// A finished session handed over for publishing
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub sampler: SamplerId,
    pub profile: Profile,
    pub comment: String,
    pub order: NodeOrder,
}

/// Receives session lifecycle events from the auto sampler
pub trait ReportSink: Send + Sync {
    /// A session just started; `reason` is human readable
    fn session_started(&self, _sampler: SamplerId, _start_time_ms: u64, _reason: &str) {}

    /// Publish a finished session. Must not block.
    fn publish(&self, report: SessionReport);

    /// A started session ended without a report (cancelled elsewhere,
    /// failed, or displaced). Must not block.
    fn session_discarded(&self, _sampler: SamplerId, _end_time_ms: u64, _reason: &str) {}
}

/// Stores an uploaded payload and returns its key
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upload(&self, body: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Dashboard annotation API
#[async_trait]
pub trait AnnotationClient: Send + Sync {
    /// Create an annotation starting at `start_ms`; returns its id
    async fn create_annotation(&self, text: &str, start_ms: u64) -> Result<i64>;

    /// Close annotation `id` at `end_ms` with a link to the report
    async fn update_annotation(&self, id: i64, url: &str, end_ms: u64) -> Result<()>;

    /// Close annotation `id` at `end_ms` with plain text, when there is no report
    async fn close_annotation(&self, id: i64, text: &str, end_ms: u64) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    key: String,
}

/// Content store client for a bytebin-style paste service
#[derive(Debug, Clone)]
pub struct BytebinClient {
    http: reqwest::Client,
    url: String,
    user_agent: String,
}

impl BytebinClient {
    pub fn new(http: reqwest::Client, url: &str, user_agent: &str) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    pub fn post_url(&self) -> String {
        format!("{}/post", self.url)
    }
}

#[async_trait]
impl ContentStore for BytebinClient {
    async fn upload(&self, body: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .http
            .post(self.post_url())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .body(body)
            .send()
            .await
            .context("Failed to reach content store")?
            .error_for_status()
            .context("Content store rejected upload")?;

        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(location.trim_start_matches('/').to_string());
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .context("Content store returned no key")?;
        Ok(parsed.key)
    }
}

/// Grafana annotations client
#[derive(Debug, Clone)]
pub struct GrafanaClient {
    http: reqwest::Client,
    url: String,
    auth_email: String,
    server_id: String,
}

impl GrafanaClient {
    pub fn new(http: reqwest::Client, url: &str, auth_email: &str, server_id: &str) -> Self {
        let url = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        };
        Self {
            http,
            url,
            auth_email: auth_email.to_string(),
            server_id: server_id.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.url
    }

    pub fn tags(&self) -> Vec<String> {
        vec![
            "tickscope".to_string(),
            format!("server_id:{}", self.server_id),
        ]
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.url, path))
            .header("X-Auth-Request-Email", &self.auth_email)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn patch(&self, id: i64, annotation: &Annotation) -> Result<()> {
        self.request(reqwest::Method::PATCH, &format!("api/annotations/{}", id))
            .json(annotation)
            .send()
            .await
            .context("Failed to reach Grafana")?
            .error_for_status()
            .context("Grafana rejected annotation update")?;
        Ok(())
    }
}

#[async_trait]
impl AnnotationClient for GrafanaClient {
    async fn create_annotation(&self, text: &str, start_ms: u64) -> Result<i64> {
        let annotation = Annotation::starting(text, start_ms, self.tags());
        let response: AnnotationResponse = self
            .request(reqwest::Method::POST, "api/annotations")
            .json(&annotation)
            .send()
            .await
            .context("Failed to reach Grafana")?
            .error_for_status()
            .context("Grafana rejected annotation")?
            .json()
            .await
            .context("Invalid annotation response")?;
        debug!(id = response.id, message = %response.message, "annotation created");
        Ok(response.id)
    }

    async fn update_annotation(&self, id: i64, url: &str, end_ms: u64) -> Result<()> {
        self.patch(id, &Annotation::finished(url, end_ms, self.tags()))
            .await
    }

    async fn close_annotation(&self, id: i64, text: &str, end_ms: u64) -> Result<()> {
        self.patch(id, &Annotation::closed(text, end_ms, self.tags()))
            .await
    }
}

#[derive(Serialize)]
struct UploadPayload<'a> {
    comment: &'a str,
    profile: &'a Profile,
}

struct PipelineInner {
    runtime: tokio::runtime::Handle,
    store: Arc<dyn ContentStore>,
    annotations: Option<Arc<dyn AnnotationClient>>,
    viewer_url: String,
    sink: Arc<dyn MessageSink>,
    retry: RetryPolicy,
    pending_annotations: Mutex<HashMap<SamplerId, JoinHandle<Option<i64>>>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// Upload + annotate, on a background runtime
#[derive(Clone)]
pub struct ReportingPipeline {
    inner: Arc<PipelineInner>,
}

impl ReportingPipeline {
    pub fn new(
        runtime: tokio::runtime::Handle,
        store: Arc<dyn ContentStore>,
        annotations: Option<Arc<dyn AnnotationClient>>,
        viewer_url: &str,
        sink: Arc<dyn MessageSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                runtime,
                store,
                annotations,
                viewer_url: viewer_url.to_string(),
                sink,
                retry,
                pending_annotations: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build the HTTP-backed pipeline described by `config`
    pub fn from_config(
        config: &ReportingConfig,
        runtime: tokio::runtime::Handle,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let store = Arc::new(BytebinClient::new(
            http.clone(),
            &config.content_store_url,
            &config.user_agent,
        ));

        let annotations = config.grafana.as_ref().map(|grafana| {
            let server_id = grafana.server_id.clone().unwrap_or_else(host_id);
            info!(url = %grafana.url, %server_id, "dashboard annotations enabled");
            Arc::new(GrafanaClient::new(
                http.clone(),
                &grafana.url,
                &grafana.auth_email,
                &server_id,
            )) as Arc<dyn AnnotationClient>
        });

        Ok(Self::new(
            runtime,
            store,
            annotations,
            &config.viewer_url,
            sink,
            RetryPolicy::with_attempts(config.upload_attempts),
        ))
    }

    /// Upload one report and close its annotation. Returns the viewer link.
    pub async fn upload(&self, report: SessionReport) -> Result<String> {
        let inner = &self.inner;
        let annotation = self.annotation_for(&report).await;

        let mut profile = report.profile;
        profile.sort_threads(report.order);
        let body = serde_json::to_vec(&UploadPayload {
            comment: &report.comment,
            profile: &profile,
        })
        .context("Failed to serialize profile")?;

        let store = inner.store.clone();
        let key = retry_with_backoff("profile upload", inner.retry, || {
            let store = store.clone();
            let body = body.clone();
            async move { store.upload(body, "application/json").await }
        })
        .await
        .context("Failed to upload profile")?;

        let url = format!("{}{}", inner.viewer_url, key);

        if let (Some(client), Some(id)) = (&inner.annotations, annotation) {
            if let Err(e) = client.update_annotation(id, &url, profile.end_time_ms).await {
                warn!("Failed to update annotation {}: {:#}", id, e);
                inner
                    .sink
                    .send(&format!("Failed to update dashboard annotation: {:#}", e));
            }
        }

        Ok(url)
    }

    /// Wait for every publish started so far
    pub async fn drain(&self) {
        let handles: Vec<_> = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Sessions whose start annotation is still open
    pub fn open_sessions(&self) -> usize {
        self.inner
            .pending_annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Annotation id for this session: the one created at start, or a new one
    async fn annotation_for(&self, report: &SessionReport) -> Option<i64> {
        let client = self.inner.annotations.as_ref()?;
        let pending = self
            .inner
            .pending_annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&report.sampler);

        match pending {
            Some(handle) => handle.await.ok().flatten(),
            None => create_annotation(
                client.as_ref(),
                self.inner.sink.as_ref(),
                &report.comment,
                report.profile.start_time_ms,
            )
            .await,
        }
    }
}

async fn create_annotation(
    client: &dyn AnnotationClient,
    sink: &dyn MessageSink,
    text: &str,
    start_ms: u64,
) -> Option<i64> {
    match client.create_annotation(text, start_ms).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Failed to create annotation: {:#}", e);
            sink.send(&format!("Failed to create dashboard annotation: {:#}", e));
            None
        }
    }
}

impl ReportSink for ReportingPipeline {
    fn session_started(&self, sampler: SamplerId, start_time_ms: u64, reason: &str) {
        let Some(client) = self.inner.annotations.clone() else {
            return;
        };
        let sink = self.inner.sink.clone();
        let text = reason.to_string();
        let handle = self.inner.runtime.spawn(async move {
            create_annotation(client.as_ref(), sink.as_ref(), &text, start_time_ms).await
        });
        self.inner
            .pending_annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sampler, handle);
    }

    fn publish(&self, report: SessionReport) {
        let this = self.clone();
        let handle = self.inner.runtime.spawn(async move {
            let comment = report.comment.clone();
            let sampler = report.sampler;
            match this.upload(report).await {
                Ok(url) => {
                    info!(%sampler, %url, "profile uploaded");
                    this.inner
                        .sink
                        .send(&format!("Profiler results ({}): {}", comment, url));
                }
                Err(e) => {
                    warn!(%sampler, "Failed to publish profile: {:#}", e);
                    this.inner.sink.send(&format!(
                        "An error occurred whilst uploading the results: {:#}",
                        e
                    ));
                }
            }
        });
        self.track(handle);
    }

    fn session_discarded(&self, sampler: SamplerId, end_time_ms: u64, reason: &str) {
        let pending = self
            .inner
            .pending_annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sampler);
        let (Some(pending), Some(client)) = (pending, self.inner.annotations.clone()) else {
            return;
        };
        let sink = self.inner.sink.clone();
        let text = format!("No report: session {}", reason);
        let handle = self.inner.runtime.spawn(async move {
            let Ok(Some(id)) = pending.await else {
                return;
            };
            if let Err(e) = client.close_annotation(id, &text, end_time_ms).await {
                warn!("Failed to close annotation {}: {:#}", id, e);
                sink.send(&format!("Failed to update dashboard annotation: {:#}", e));
            }
        });
        self.track(handle);
    }
}

/// Host name, or a pid-based fallback
fn host_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("host-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tickscope_shared::types::profile::{Stack, StackCount, ThreadProfile};

    #[derive(Default)]
    struct MemoryStore {
        uploads: Mutex<Vec<serde_json::Value>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ContentStore for MemoryStore {
        async fn upload(&self, body: Vec<u8>, content_type: &str) -> Result<String> {
            assert_eq!(content_type, "application/json");
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("store unavailable");
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push(serde_json::from_slice(&body)?);
            Ok(format!("key{}", uploads.len()))
        }
    }

    #[derive(Default)]
    struct RecordingAnnotations {
        created: Mutex<Vec<(String, u64)>>,
        updated: Mutex<Vec<(i64, String, u64)>>,
        closed: Mutex<Vec<(i64, String, u64)>>,
        fail_create: bool,
    }

    #[async_trait]
    impl AnnotationClient for RecordingAnnotations {
        async fn create_annotation(&self, text: &str, start_ms: u64) -> Result<i64> {
            if self.fail_create {
                anyhow::bail!("grafana down");
            }
            let mut created = self.created.lock().unwrap();
            created.push((text.to_string(), start_ms));
            Ok(100 + created.len() as i64)
        }

        async fn update_annotation(&self, id: i64, url: &str, end_ms: u64) -> Result<()> {
            self.updated.lock().unwrap().push((id, url.to_string(), end_ms));
            Ok(())
        }

        async fn close_annotation(&self, id: i64, text: &str, end_ms: u64) -> Result<()> {
            self.closed.lock().unwrap().push((id, text.to_string(), end_ms));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<String>>);

    impl MessageSink for CollectingSink {
        fn send(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    impl CollectingSink {
        async fn wait_for(&self, count: usize) -> Vec<String> {
            for _ in 0..200 {
                if self.0.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.0.lock().unwrap().clone()
        }
    }

    fn report(sampler: SamplerId) -> SessionReport {
        let mut profile = Profile::new(1_000, 61_000, 4_000);
        for (name, samples) in [("Async", 2), ("Server thread", 40)] {
            profile.threads.push(ThreadProfile {
                name: name.to_string(),
                total_samples: samples,
                stacks: vec![StackCount {
                    stack: Stack::from_names(&["tick"]),
                    samples,
                }],
            });
        }
        SessionReport {
            sampler,
            profile,
            comment: "AutoSampler".to_string(),
            order: NodeOrder::ByTime,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        annotations: Option<Arc<RecordingAnnotations>>,
        sink: Arc<CollectingSink>,
    ) -> ReportingPipeline {
        ReportingPipeline::new(
            tokio::runtime::Handle::current(),
            store,
            annotations.map(|a| a as Arc<dyn AnnotationClient>),
            "https://viewer.local/#",
            sink,
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn test_upload_returns_viewer_link_and_orders_threads() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store.clone(), None, sink.clone());

        let url = pipeline.upload(report(SamplerId::next())).await.unwrap();
        assert_eq!(url, "https://viewer.local/#key1");

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads[0]["comment"], "AutoSampler");
        assert_eq!(uploads[0]["profile"]["threads"][0]["name"], "Server thread");
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let store = Arc::new(MemoryStore::default());
        store.failures_left.store(2, Ordering::SeqCst);
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store.clone(), None, sink);

        let url = pipeline.upload(report(SamplerId::next())).await.unwrap();
        assert_eq!(url, "https://viewer.local/#key1");
    }

    #[tokio::test]
    async fn test_annotation_created_at_start_and_closed_with_link() {
        let store = Arc::new(MemoryStore::default());
        let annotations = Arc::new(RecordingAnnotations::default());
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store, Some(annotations.clone()), sink.clone());

        let id = SamplerId::next();
        pipeline.session_started(id, 1_000, "tick took more than 200ms");
        pipeline.publish(report(id));

        let messages = sink.wait_for(1).await;
        assert_eq!(messages, vec!["Profiler results (AutoSampler): https://viewer.local/#key1"]);

        let created = annotations.created.lock().unwrap().clone();
        assert_eq!(created, vec![("tick took more than 200ms".to_string(), 1_000)]);
        let updated = annotations.updated.lock().unwrap().clone();
        assert_eq!(updated, vec![(101, "https://viewer.local/#key1".to_string(), 61_000)]);
    }

    #[tokio::test]
    async fn test_discarded_session_closes_its_annotation() {
        let store = Arc::new(MemoryStore::default());
        let annotations = Arc::new(RecordingAnnotations::default());
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store.clone(), Some(annotations.clone()), sink.clone());

        let id = SamplerId::next();
        pipeline.session_started(id, 1_000, "average tick rate degraded");
        assert_eq!(pipeline.open_sessions(), 1);

        pipeline.session_discarded(id, 5_000, "failed: no thread dump");
        assert_eq!(pipeline.open_sessions(), 0);
        pipeline.drain().await;

        let closed = annotations.closed.lock().unwrap().clone();
        assert_eq!(
            closed,
            vec![(101, "No report: session failed: no thread dump".to_string(), 5_000)]
        );
        assert!(annotations.updated.lock().unwrap().is_empty());
        assert!(store.uploads.lock().unwrap().is_empty());
        assert!(sink.0.lock().unwrap().is_empty());

        // Unknown sessions are ignored
        pipeline.session_discarded(SamplerId::next(), 6_000, "cancelled");
        pipeline.drain().await;
        assert_eq!(annotations.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_annotation_created_on_publish_when_start_was_missed() {
        let store = Arc::new(MemoryStore::default());
        let annotations = Arc::new(RecordingAnnotations::default());
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store, Some(annotations.clone()), sink);

        pipeline.upload(report(SamplerId::next())).await.unwrap();
        let created = annotations.created.lock().unwrap().clone();
        assert_eq!(created, vec![("AutoSampler".to_string(), 1_000)]);
        assert_eq!(annotations.updated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_annotation_failure_does_not_block_upload() {
        let store = Arc::new(MemoryStore::default());
        let annotations = Arc::new(RecordingAnnotations {
            fail_create: true,
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store, Some(annotations.clone()), sink.clone());

        let url = pipeline.upload(report(SamplerId::next())).await.unwrap();
        assert_eq!(url, "https://viewer.local/#key1");
        assert!(annotations.updated.lock().unwrap().is_empty());
        let messages = sink.0.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Failed to create dashboard annotation"));
    }

    #[tokio::test]
    async fn test_publish_reports_upload_failure_to_sink() {
        let store = Arc::new(MemoryStore::default());
        store.failures_left.store(10, Ordering::SeqCst);
        let sink = Arc::new(CollectingSink::default());
        let pipeline = pipeline(store, None, sink.clone());

        pipeline.publish(report(SamplerId::next()));
        pipeline.drain().await;
        let messages = sink.wait_for(1).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("An error occurred whilst uploading the results"));
        assert!(messages[0].contains("store unavailable"));
    }

    #[test]
    fn test_grafana_client_normalizes_url_and_tags() {
        let client = GrafanaClient::new(reqwest::Client::new(), "http://grafana.local", "ops", "lobby-1");
        assert_eq!(client.base_url(), "http://grafana.local/");
        assert_eq!(client.tags(), vec!["tickscope", "server_id:lobby-1"]);

        let client = GrafanaClient::new(reqwest::Client::new(), "http://grafana.local/", "ops", "x");
        assert_eq!(client.base_url(), "http://grafana.local/");
    }

    #[test]
    fn test_bytebin_post_url() {
        let client = BytebinClient::new(reqwest::Client::new(), "https://bytebin.local/", "tickscope/test");
        assert_eq!(client.post_url(), "https://bytebin.local/post");
    }
}
