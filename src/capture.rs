//! Turns the browser's response stream into persisted resources.
//!
//! One task owns the event receiver. Every accepted response is read and stored in its
//! own task so that large writes do not hold up the stream.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::Instrument as _;

use crate::{
    browser::{BodyReadError, BrowserEvent, ResponseBodyReader, ResponseReceived},
    logging::recording_span,
    router::StorageRouter,
    session::{DEFAULT_CONTENT_TYPE, ResourceMeta},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub captured: usize,
    pub redirects: usize,
    pub preflights: usize,
    pub main_document_duplicates: usize,
    pub evicted: usize,
    pub failed: usize,
    /// Resource tasks still running when the drain timeout elapsed.
    pub detached: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Captured,
    Evicted,
    Failed,
}

/// Running capture task of one recording.
#[derive(Debug)]
pub struct CaptureHandle {
    shutdown: Option<oneshot::Sender<Duration>>,
    task: JoinHandle<CaptureStats>,
}

impl CaptureHandle {
    /// Stops reading new events, processes the ones the browser already delivered and
    /// waits up to `drain_timeout` for in-flight resources to be stored.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> CaptureStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(drain_timeout);
        }
        match (&mut self.task).await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!("capture task ended abnormally: {err}");
                CaptureStats::default()
            }
        }
    }
}

pub fn spawn_capture(
    events: mpsc::Receiver<BrowserEvent>,
    reader: Arc<dyn ResponseBodyReader>,
    router: Arc<StorageRouter>,
) -> CaptureHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let span = recording_span(&router.target().id, router.target().target_url.as_str());
    let task = tokio::spawn(run_capture(events, reader, router, shutdown_rx).instrument(span));
    CaptureHandle {
        shutdown: Some(shutdown_tx),
        task,
    }
}

struct Interceptor {
    reader: Arc<dyn ResponseBodyReader>,
    router: Arc<StorageRouter>,
    methods: HashMap<String, String>,
    tasks: JoinSet<Outcome>,
    stats: CaptureStats,
}

async fn run_capture(
    mut events: mpsc::Receiver<BrowserEvent>,
    reader: Arc<dyn ResponseBodyReader>,
    router: Arc<StorageRouter>,
    mut shutdown: oneshot::Receiver<Duration>,
) -> CaptureStats {
    let mut interceptor = Interceptor::new(reader, router);
    let mut events_open = true;

    let drain_timeout = loop {
        tokio::select! {
            drain = &mut shutdown => break drain.unwrap_or(Duration::ZERO),
            event = events.recv(), if events_open => match event {
                Some(event) => interceptor.handle(event),
                None => events_open = false,
            },
            Some(joined) = interceptor.tasks.join_next(), if !interceptor.tasks.is_empty() => {
                interceptor.record(joined);
            }
        }
    };

    events.close();
    while let Ok(event) = events.try_recv() {
        interceptor.handle(event);
    }
    interceptor.drain(drain_timeout).await;

    let stats = interceptor.stats;
    tracing::info!(
        session_id = %interceptor.router.target().id,
        captured = stats.captured,
        evicted = stats.evicted,
        failed = stats.failed,
        detached = stats.detached,
        "capture stopped"
    );
    stats
}

impl Interceptor {
    fn new(reader: Arc<dyn ResponseBodyReader>, router: Arc<StorageRouter>) -> Self {
        Self {
            reader,
            router,
            methods: HashMap::new(),
            tasks: JoinSet::new(),
            stats: CaptureStats::default(),
        }
    }

    fn handle(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::RequestIssued(request) => {
                self.methods.insert(request.request_id, request.method);
            }
            BrowserEvent::ResponseReceived(response) => self.accept(response),
            BrowserEvent::RequestFailed { request_id } => {
                self.methods.remove(&request_id);
            }
        }
    }

    fn accept(&mut self, response: ResponseReceived) {
        let method = self.methods.remove(&response.request_id);
        if (300..400).contains(&response.status) {
            self.stats.redirects += 1;
            return;
        }
        if method
            .as_deref()
            .is_some_and(|method| method.eq_ignore_ascii_case("OPTIONS"))
        {
            self.stats.preflights += 1;
            return;
        }

        let content_type = response
            .content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());
        if self
            .router
            .target()
            .is_main_document(&response.url, &content_type)
        {
            self.stats.main_document_duplicates += 1;
            return;
        }

        let meta = ResourceMeta {
            url: response.url,
            status: response.status,
            content_type,
            captured_at_unix_ms: response.received_at_unix_ms,
        };
        let reader = Arc::clone(&self.reader);
        let router = Arc::clone(&self.router);
        self.tasks.spawn(
            capture_resource(reader, router, response.request_id, meta).in_current_span(),
        );
    }

    fn record(&mut self, joined: Result<Outcome, tokio::task::JoinError>) {
        match joined {
            Ok(Outcome::Captured) => self.stats.captured += 1,
            Ok(Outcome::Evicted) => self.stats.evicted += 1,
            Ok(Outcome::Failed) => self.stats.failed += 1,
            Err(err) => {
                tracing::warn!(
                    session_id = %self.router.target().id,
                    "resource capture task failed: {err}"
                );
                self.stats.failed += 1;
            }
        }
    }

    async fn drain(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.record(joined),
                Ok(None) => break,
                Err(_) => {
                    self.stats.detached += self.tasks.len();
                    tracing::warn!(
                        session_id = %self.router.target().id,
                        pending = self.tasks.len(),
                        timeout_ms = timeout.as_millis() as u64,
                        "capture drain timed out; leaving resource writes running"
                    );
                    self.tasks.detach_all();
                    break;
                }
            }
        }
    }
}

async fn capture_resource(
    reader: Arc<dyn ResponseBodyReader>,
    router: Arc<StorageRouter>,
    request_id: String,
    meta: ResourceMeta,
) -> Outcome {
    let session_id = &router.target().id;
    let payload = match reader.read_body(&request_id).await {
        Ok(payload) => payload,
        Err(BodyReadError::Evicted) => {
            tracing::debug!(session_id = %session_id, url = %meta.url, "response body evicted");
            return Outcome::Evicted;
        }
        Err(err) => {
            tracing::warn!(session_id = %session_id, url = %meta.url, "skipping resource: {err}");
            return Outcome::Failed;
        }
    };

    match router.route(meta, payload).await {
        Ok(_) => Outcome::Captured,
        Err(err) => {
            tracing::warn!(session_id = %session_id, "skipping resource: {err}");
            Outcome::Failed
        }
    }
}
