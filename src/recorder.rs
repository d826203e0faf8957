//! The single recording slot: start, stop and status of the one active session.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::task::JoinHandle;
use url::Url;

use crate::{
    browser::{BrowserError, BrowserLauncher, BrowserSession, LaunchOptions},
    capture::{CaptureHandle, CaptureStats, spawn_capture},
    resource_store::ResourceStore,
    router::{RoutingPolicy, SessionTarget, StorageRouter},
    session::{
        HTML_CONTENT_TYPE, NewSession, ResourceId, ResourceMeta, SessionId, SessionStatus,
        ValidationError, normalize_target_url, now_unix_ms,
    },
    storage::StoreError,
};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    pub navigation_timeout: Duration,
    /// Extra wait after navigation before the document is snapshotted.
    pub settle_delay: Duration,
    pub stop_drain_timeout: Duration,
    pub launch: LaunchOptions,
    pub routing: RoutingPolicy,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            settle_delay: Duration::ZERO,
            stop_drain_timeout: DEFAULT_STOP_DRAIN_TIMEOUT,
            launch: LaunchOptions::default(),
            routing: RoutingPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    Validation(ValidationError),
    NotFound(String),
    Conflict { active: SessionId },
    Browser(BrowserError),
    Storage(String),
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(what) => write!(f, "{what} was not found"),
            Self::Conflict { active } => {
                write!(f, "a recording is already in progress (session `{active}`)")
            }
            Self::Browser(err) => write!(f, "{err}"),
            Self::Storage(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for RecorderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Browser(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for RecorderError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<BrowserError> for RecorderError {
    fn from(err: BrowserError) -> Self {
        Self::Browser(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHandle {
    pub session_id: SessionId,
    pub url: String,
    pub started_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub session_id: SessionId,
    pub url: String,
    pub status: SessionStatus,
    pub started_at_unix_ms: i64,
    pub completed_at_unix_ms: i64,
    pub resource_count: u64,
    pub capture: CaptureStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Starting,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub state: RecorderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

struct ActiveRecording {
    handle: RecordingHandle,
    browser: Box<dyn BrowserSession>,
    capture: CaptureHandle,
}

enum Slot {
    Idle,
    Starting(SessionId),
    Recording(ActiveRecording),
    Stopping(SessionId),
}

impl Slot {
    fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Idle => None,
            Self::Starting(id) | Self::Stopping(id) => Some(id),
            Self::Recording(active) => Some(&active.handle.session_id),
        }
    }
}

/// Resets the slot to idle when a stop finishes or is abandoned midway.
struct IdleOnDrop {
    slot: Arc<Mutex<Slot>>,
}

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        *lock_slot(&self.slot) = Slot::Idle;
    }
}

type SessionWrite = JoinHandle<Result<Vec<ResourceId>, StoreError>>;

/// What a start has acquired so far. Dropping it before `into_browser` resets the slot,
/// then closes the browser and removes the session record in the background once any
/// pending write has settled.
struct PendingStart {
    slot: Arc<Mutex<Slot>>,
    store: ResourceStore,
    session_id: SessionId,
    browser: Option<Box<dyn BrowserSession>>,
    write: Option<SessionWrite>,
    armed: bool,
}

impl PendingStart {
    fn into_browser(mut self) -> Option<Box<dyn BrowserSession>> {
        self.armed = false;
        self.browser.take()
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *lock_slot(&self.slot) = Slot::Idle;
        let browser = self.browser.take();
        let write = self.write.take();
        if browser.is_none() && write.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                session_id = %self.session_id,
                "no runtime left to clean up an abandoned start"
            );
            return;
        };
        runtime.spawn(discard_abandoned_start(
            self.store.clone(),
            self.session_id.clone(),
            browser,
            write,
        ));
    }
}

async fn discard_abandoned_start(
    store: ResourceStore,
    session_id: SessionId,
    browser: Option<Box<dyn BrowserSession>>,
    write: Option<SessionWrite>,
) {
    if let Some(mut browser) = browser {
        if let Err(err) = browser.close().await {
            tracing::warn!(session_id = %session_id, "closing browser of abandoned start: {err}");
        }
    }
    let Some(write) = write else {
        return;
    };
    if !matches!(write.await, Ok(Ok(_))) {
        return;
    }
    match store.delete_session(&session_id).await {
        Ok(_) => tracing::info!(session_id = %session_id, "removed session of abandoned start"),
        Err(err) => {
            tracing::warn!(session_id = %session_id, "removing session of abandoned start: {err}")
        }
    }
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns at most one active recording.
#[derive(Clone)]
pub struct Recorder {
    launcher: Arc<dyn BrowserLauncher>,
    store: ResourceStore,
    settings: RecorderSettings,
    slot: Arc<Mutex<Slot>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        store: ResourceStore,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            launcher,
            store,
            settings,
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn status(&self) -> RecorderStatus {
        let slot = lock_slot(&self.slot);
        let state = match &*slot {
            Slot::Idle => RecorderState::Idle,
            Slot::Starting(_) => RecorderState::Starting,
            Slot::Recording(_) => RecorderState::Recording,
            Slot::Stopping(_) => RecorderState::Stopping,
        };
        let url = match &*slot {
            Slot::Recording(active) => Some(active.handle.url.clone()),
            _ => None,
        };
        RecorderStatus {
            state,
            session_id: slot.session_id().cloned(),
            url,
        }
    }

    /// Whether `id` is the session currently being started, recorded or stopped.
    pub fn is_active(&self, id: &SessionId) -> bool {
        lock_slot(&self.slot).session_id() == Some(id)
    }

    pub async fn start(&self, raw_url: &str) -> Result<RecordingHandle, RecorderError> {
        let url = normalize_target_url(raw_url)?;
        let session_id = SessionId::generate();
        {
            let mut slot = lock_slot(&self.slot);
            if let Some(active) = slot.session_id() {
                return Err(RecorderError::Conflict {
                    active: active.clone(),
                });
            }
            *slot = Slot::Starting(session_id.clone());
        }
        let mut pending = PendingStart {
            slot: Arc::clone(&self.slot),
            store: self.store.clone(),
            session_id: session_id.clone(),
            browser: None,
            write: None,
            armed: true,
        };

        tracing::info!(session_id = %session_id, url = %url, "starting recording");
        let launched = self.launcher.launch(&self.settings.launch).await?;
        let browser = pending.browser.insert(launched);
        let started = self.begin(&mut **browser, &mut pending.write, &session_id, &url).await;
        let (handle, capture) = match started {
            Ok(started) => started,
            Err(err) => {
                if let Some(mut browser) = pending.browser.take() {
                    if let Err(close_err) = browser.close().await {
                        tracing::warn!(
                            session_id = %session_id,
                            "closing browser after failed start: {close_err}"
                        );
                    }
                }
                tracing::warn!(
                    session_id = %session_id,
                    url = %url,
                    "recording did not start: {err}"
                );
                return Err(err);
            }
        };

        let Some(browser) = pending.into_browser() else {
            let released = "browser session released during start".to_owned();
            return Err(BrowserError::Protocol(released).into());
        };
        *lock_slot(&self.slot) = Slot::Recording(ActiveRecording {
            handle: handle.clone(),
            browser,
            capture,
        });
        tracing::info!(session_id = %session_id, url = %url, "recording started");
        Ok(handle)
    }

    /// Navigates, snapshots the settled document and creates the session record with it.
    /// Nothing is persisted unless every step succeeds. The record is written on its own
    /// task held in `write`, so an abandoned start can still see it settle.
    async fn begin(
        &self,
        browser: &mut dyn BrowserSession,
        write: &mut Option<SessionWrite>,
        session_id: &SessionId,
        url: &Url,
    ) -> Result<(RecordingHandle, CaptureHandle), RecorderError> {
        let events = browser.take_events().ok_or_else(|| {
            BrowserError::Protocol("browser session has no event stream".to_owned())
        })?;

        let timeout = self.settings.navigation_timeout;
        tokio::time::timeout(timeout, browser.navigate(url))
            .await
            .map_err(|_| BrowserError::NavigationTimeout(timeout))??;
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        let document = browser.document().await?;

        let started_at_unix_ms = now_unix_ms();
        let router = StorageRouter::new(
            SessionTarget {
                id: session_id.clone(),
                target_url: url.clone(),
            },
            self.settings.routing,
            self.store.clone(),
        );
        let (_, main_document) = router
            .place(
                ResourceMeta {
                    url: url.to_string(),
                    status: 200,
                    content_type: HTML_CONTENT_TYPE.to_owned(),
                    captured_at_unix_ms: started_at_unix_ms,
                },
                document.into(),
            )
            .await
            .map_err(|err| RecorderError::Storage(format!("session `{session_id}`: {err}")))?;

        let new_session = NewSession {
            id: session_id.clone(),
            url: url.to_string(),
            started_at_unix_ms,
            resources: vec![main_document],
        };
        let sessions = Arc::clone(self.store.sessions());
        let written = write
            .insert(tokio::spawn(async move { sessions.create_session(new_session).await }))
            .await;
        *write = None;
        let storage_error =
            |err: String| RecorderError::Storage(format!("create session `{session_id}`: {err}"));
        written
            .map_err(|err| storage_error(err.to_string()))?
            .map_err(|err| storage_error(err.to_string()))?;

        let capture = spawn_capture(events, browser.body_reader(), Arc::new(router));
        Ok((
            RecordingHandle {
                session_id: session_id.clone(),
                url: url.to_string(),
                started_at_unix_ms,
            },
            capture,
        ))
    }

    pub async fn stop(&self, session_id: &SessionId) -> Result<StopOutcome, RecorderError> {
        let active = {
            let mut slot = lock_slot(&self.slot);
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Recording(active) if active.handle.session_id == *session_id => {
                    *slot = Slot::Stopping(session_id.clone());
                    active
                }
                other => {
                    *slot = other;
                    return Err(RecorderError::NotFound(format!(
                        "active recording `{session_id}`"
                    )));
                }
            }
        };
        let _guard = IdleOnDrop {
            slot: Arc::clone(&self.slot),
        };

        let ActiveRecording {
            handle,
            mut browser,
            capture,
        } = active;
        tracing::info!(session_id = %session_id, "stopping recording");

        let stats = capture.shutdown(self.settings.stop_drain_timeout).await;
        if let Err(err) = browser.close().await {
            tracing::warn!(session_id = %session_id, "closing browser: {err}");
        }

        let completed_at_unix_ms = now_unix_ms();
        let storage_error = |err: StoreError| {
            RecorderError::Storage(format!("finalize session `{session_id}`: {err}"))
        };
        if !self
            .store
            .sessions()
            .mark_completed(session_id, completed_at_unix_ms)
            .await
            .map_err(storage_error)?
        {
            return Err(RecorderError::NotFound(format!("session `{session_id}`")));
        }
        let resource_count = self
            .store
            .sessions()
            .resource_count(session_id)
            .await
            .map_err(storage_error)?;

        tracing::info!(
            session_id = %session_id,
            resource_count,
            captured = stats.captured,
            "recording stopped"
        );
        Ok(StopOutcome {
            session_id: handle.session_id,
            url: handle.url,
            status: SessionStatus::Completed,
            started_at_unix_ms: handle.started_at_unix_ms,
            completed_at_unix_ms,
            resource_count,
            capture: stats,
        })
    }

    /// Stops whatever recording is active. Used on shutdown.
    pub async fn stop_active(&self) -> Option<Result<StopOutcome, RecorderError>> {
        let session_id = match &*lock_slot(&self.slot) {
            Slot::Recording(active) => active.handle.session_id.clone(),
            _ => return None,
        };
        Some(self.stop(&session_id).await)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Notify;

    use super::{Recorder, RecorderError, RecorderSettings, RecorderState};
    use crate::{
        blob::FsBlobStore,
        browser::{
            BrowserError,
            scripted::{ScriptedBody, ScriptedBrowser, ScriptedResponse},
        },
        resource_store::ResourceStore,
        session::{
            NewResource, NewSession, Resource, ResourceId, SessionDetail, SessionId,
            SessionStatus, SessionSummary,
        },
        storage::{SessionStore, SqliteSessionStore, StoreError},
    };

    /// Holds `create_session` until released and counts committed deletes.
    struct GatedSessions {
        inner: SqliteSessionStore,
        entered: Notify,
        release: Notify,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for GatedSessions {
        async fn create_session(&self, session: NewSession) -> Result<Vec<ResourceId>, StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.create_session(session).await
        }

        async fn get_session(&self, id: &SessionId) -> Result<Option<SessionDetail>, StoreError> {
            self.inner.get_session(id).await
        }

        async fn list_sessions(
            &self,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<SessionSummary>, StoreError> {
            self.inner.list_sessions(offset, limit).await
        }

        async fn count_sessions(&self) -> Result<u64, StoreError> {
            self.inner.count_sessions().await
        }

        async fn get_resource(
            &self,
            session: &SessionId,
            resource: ResourceId,
        ) -> Result<Option<Resource>, StoreError> {
            self.inner.get_resource(session, resource).await
        }

        async fn append_resource(
            &self,
            session: &SessionId,
            resource: NewResource,
        ) -> Result<ResourceId, StoreError> {
            self.inner.append_resource(session, resource).await
        }

        async fn mark_completed(
            &self,
            session: &SessionId,
            completed_at_unix_ms: i64,
        ) -> Result<bool, StoreError> {
            self.inner.mark_completed(session, completed_at_unix_ms).await
        }

        async fn resource_count(&self, session: &SessionId) -> Result<u64, StoreError> {
            self.inner.resource_count(session).await
        }

        async fn blob_keys(&self, session: &SessionId) -> Result<Vec<String>, StoreError> {
            self.inner.blob_keys(session).await
        }

        async fn delete_session(&self, session: &SessionId) -> Result<bool, StoreError> {
            let deleted = self.inner.delete_session(session).await?;
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(deleted)
        }
    }

    fn recorder(dir: &std::path::Path, browser: &ScriptedBrowser) -> Recorder {
        recorder_with(dir, browser, RecorderSettings::default())
    }

    fn recorder_with(
        dir: &std::path::Path,
        browser: &ScriptedBrowser,
        settings: RecorderSettings,
    ) -> Recorder {
        let store = ResourceStore::new(
            Arc::new(SqliteSessionStore::open_in_dir(dir).unwrap()),
            Arc::new(FsBlobStore::open_in_dir(dir).unwrap()),
        );
        Recorder::new(Arc::new(browser.clone()), store, settings)
    }

    #[tokio::test]
    async fn start_and_stop_persist_the_main_document_once() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html><head></head><body>hi</body></html>")
            .with_response(ScriptedResponse::ok(
                "https://example.test/",
                "text/html",
                "<html>network copy</html>",
            ))
            .with_response(ScriptedResponse::ok(
                "https://example.test/app.js",
                "text/javascript",
                "console.log(1)",
            ))
            .with_response(
                ScriptedResponse::ok("https://example.test/gone.png", "image/png", "")
                    .with_body(ScriptedBody::Evicted),
            );
        let recorder = recorder(dir.path(), &browser);

        let handle = recorder.start("example.test").await.unwrap();
        assert_eq!(handle.url, "https://example.test/");
        assert_eq!(recorder.status().state, RecorderState::Recording);

        let outcome = recorder.stop(&handle.session_id).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.resource_count, 2);
        assert_eq!(outcome.capture.main_document_duplicates, 1);
        assert_eq!(outcome.capture.evicted, 1);
        assert_eq!(recorder.status().state, RecorderState::Idle);
        assert_eq!(browser.closed(), 1);

        let detail = recorder.store().session(&handle.session_id).await.unwrap();
        assert_eq!(detail.session.status, SessionStatus::Completed);
        assert!(detail.session.completed_at_unix_ms.is_some());
        let main: Vec<_> = detail
            .resources
            .iter()
            .filter(|r| r.url == "https://example.test/")
            .collect();
        assert_eq!(main.len(), 1);
        assert!(main[0].blob_key.is_none());
        let stored = recorder
            .store()
            .resource(&handle.session_id, main[0].id)
            .await
            .unwrap();
        assert_eq!(
            recorder.store().load_payload(&stored).await.unwrap(),
            Bytes::from_static(b"<html><head></head><body>hi</body></html>")
        );
    }

    #[tokio::test]
    async fn second_start_conflicts_and_leaves_active_session_alone() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html></html>");
        let recorder = recorder(dir.path(), &browser);

        let first = recorder.start("https://example.test/").await.unwrap();
        let err = recorder.start("https://other.test/").await.unwrap_err();
        assert_eq!(
            err,
            RecorderError::Conflict {
                active: first.session_id.clone()
            }
        );
        let status = recorder.status();
        assert_eq!(status.state, RecorderState::Recording);
        assert_eq!(status.session_id.as_ref(), Some(&first.session_id));
        assert_eq!(browser.launched(), 1);

        recorder.stop(&first.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_with_other_id_is_not_found_and_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html></html>");
        let recorder = recorder(dir.path(), &browser);

        let active = recorder.start("https://example.test/").await.unwrap();
        let other = SessionId::parse("someone-else").unwrap();
        assert!(matches!(
            recorder.stop(&other).await.unwrap_err(),
            RecorderError::NotFound(_)
        ));
        assert_eq!(recorder.status().state, RecorderState::Recording);
        assert_eq!(browser.closed(), 0);
        let detail = recorder.store().session(&active.session_id).await.unwrap();
        assert_eq!(detail.session.status, SessionStatus::Recording);

        recorder.stop(&active.session_id).await.unwrap();
        assert!(matches!(
            recorder.stop(&active.session_id).await.unwrap_err(),
            RecorderError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_launching() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html></html>");
        let recorder = recorder(dir.path(), &browser);

        assert!(matches!(
            recorder.start("   ").await.unwrap_err(),
            RecorderError::Validation(_)
        ));
        assert_eq!(browser.launched(), 0);
        assert_eq!(recorder.status().state, RecorderState::Idle);
    }

    #[tokio::test]
    async fn navigation_timeout_rolls_back_without_writing_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let browser =
            ScriptedBrowser::new("<html></html>").with_navigation_delay(Duration::from_secs(5));
        let settings = RecorderSettings {
            navigation_timeout: Duration::from_millis(50),
            ..RecorderSettings::default()
        };
        let recorder = recorder_with(dir.path(), &browser, settings);

        let err = recorder.start("https://slow.test/").await.unwrap_err();
        assert_eq!(
            err,
            RecorderError::Browser(BrowserError::NavigationTimeout(Duration::from_millis(50)))
        );
        assert_eq!(recorder.status().state, RecorderState::Idle);
        assert_eq!(browser.closed(), 1);
        assert_eq!(
            recorder.store().sessions().count_sessions().await.unwrap(),
            0
        );

        // The slot is usable again.
        let retry = ScriptedBrowser::new("<html></html>");
        let recorder = recorder_with(dir.path(), &retry, RecorderSettings::default());
        let handle = recorder.start("https://slow.test/").await.unwrap();
        recorder.stop(&handle.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn navigation_error_rolls_back_and_closes_the_browser() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html></html>")
            .with_navigation_error("net::ERR_NAME_NOT_RESOLVED");
        let recorder = recorder(dir.path(), &browser);

        let err = recorder.start("https://nowhere.test/").await.unwrap_err();
        assert_eq!(
            err,
            RecorderError::Browser(BrowserError::Navigation(
                "https://nowhere.test/: net::ERR_NAME_NOT_RESOLVED".to_owned()
            ))
        );
        assert_eq!(recorder.status().state, RecorderState::Idle);
        assert_eq!(browser.launched(), 1);
        assert_eq!(browser.closed(), 1);
        assert_eq!(
            recorder.store().sessions().count_sessions().await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn abandoned_start_closes_browser_and_removes_written_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(GatedSessions {
            inner: SqliteSessionStore::open_in_dir(dir.path()).unwrap(),
            entered: Notify::new(),
            release: Notify::new(),
            deleted: AtomicUsize::new(0),
        });
        let store = ResourceStore::new(
            sessions.clone(),
            Arc::new(FsBlobStore::open_in_dir(dir.path()).unwrap()),
        );
        let browser = ScriptedBrowser::new("<html></html>");
        let recorder = Recorder::new(
            Arc::new(browser.clone()),
            store,
            RecorderSettings::default(),
        );

        let starting = tokio::spawn({
            let recorder = recorder.clone();
            async move { recorder.start("https://example.test/").await }
        });
        sessions.entered.notified().await;
        assert_eq!(recorder.status().state, RecorderState::Starting);

        starting.abort();
        assert!(starting.await.unwrap_err().is_cancelled());
        assert_eq!(recorder.status().state, RecorderState::Idle);

        sessions.release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while sessions.deleted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("abandoned session should be removed");
        assert_eq!(browser.closed(), 1);
        assert_eq!(sessions.inner.count_sessions().await.unwrap(), 0);

        // A fresh start goes through once the gate is open.
        sessions.release.notify_one();
        let handle = recorder.start("https://example.test/").await.unwrap();
        recorder.stop(&handle.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn launch_failure_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("").with_launch_error("no display");
        let recorder = recorder(dir.path(), &browser);

        assert!(matches!(
            recorder.start("https://example.test/").await.unwrap_err(),
            RecorderError::Browser(BrowserError::Launch(_))
        ));
        assert_eq!(recorder.status().state, RecorderState::Idle);
    }

    #[tokio::test]
    async fn responses_emitted_during_recording_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let browser = ScriptedBrowser::new("<html></html>");
        let recorder = recorder(dir.path(), &browser);

        let handle = recorder.start("https://example.test/").await.unwrap();
        assert!(
            browser
                .emit(ScriptedResponse::ok(
                    "https://example.test/late.json",
                    "application/json",
                    "{}"
                ))
                .await
        );
        let outcome = recorder.stop(&handle.session_id).await.unwrap();
        assert_eq!(outcome.resource_count, 2);
        assert!(
            !browser
                .emit(ScriptedResponse::ok("https://example.test/after", "text/plain", "x"))
                .await
        );
    }
}
