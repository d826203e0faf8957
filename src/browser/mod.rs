//! Boundary to the browser-automation driver.
//!
//! A driver launches a browser session that navigates on request and streams the
//! request/response events it observes into a bounded channel. Response bodies are read
//! lazily through a [`ResponseBodyReader`], because the browser may have evicted a body
//! from its cache by the time the event is processed.

#[cfg(feature = "chrome")]
pub mod chrome;
pub mod scripted;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    RequestIssued(RequestIssued),
    ResponseReceived(ResponseReceived),
    /// The load was aborted or failed before a response body arrived.
    RequestFailed { request_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIssued {
    pub request_id: String,
    pub url: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseReceived {
    pub request_id: String,
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub received_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyReadError {
    /// The browser no longer holds the body. Expected in long-running sessions.
    Evicted,
    Failed(String),
}

impl std::fmt::Display for BodyReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evicted => f.write_str("response body was evicted from the browser cache"),
            Self::Failed(message) => write!(f, "read response body: {message}"),
        }
    }
}

impl std::error::Error for BodyReadError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    Unavailable(String),
    Launch(String),
    Navigation(String),
    NavigationTimeout(Duration),
    Closed,
    Protocol(String),
}

impl std::fmt::Display for BrowserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "browser unavailable: {message}"),
            Self::Launch(message) => write!(f, "launch browser: {message}"),
            Self::Navigation(message) => write!(f, "navigate: {message}"),
            Self::NavigationTimeout(timeout) => {
                write!(f, "navigation did not finish within {}ms", timeout.as_millis())
            }
            Self::Closed => f.write_str("browser session is closed"),
            Self::Protocol(message) => write!(f, "browser protocol error: {message}"),
        }
    }
}

impl std::error::Error for BrowserError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub event_buffer: usize,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            event_buffer: 1024,
        }
    }
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync + 'static {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[async_trait]
pub trait ResponseBodyReader: Send + Sync + 'static {
    async fn read_body(&self, request_id: &str) -> Result<Bytes, BodyReadError>;
}

/// One launched browser with a single page.
#[async_trait]
pub trait BrowserSession: Send + 'static {
    /// Hands out the event stream. Returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<BrowserEvent>>;

    fn body_reader(&self) -> Arc<dyn ResponseBodyReader>;

    /// Navigates the page and resolves once the load settled. Callers bound this with a
    /// timeout.
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError>;

    /// Serialized DOM of the current page.
    async fn document(&mut self) -> Result<String, BrowserError>;

    /// Releases the browser. Calling it again, or after the browser went away on its
    /// own, succeeds.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Launcher used when the binary carries no browser driver.
#[derive(Debug, Clone, Default)]
pub struct UnavailableBrowser;

#[async_trait]
impl BrowserLauncher for UnavailableBrowser {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        Err(BrowserError::Unavailable(
            "this build has no browser driver; rebuild with `--features chrome`".to_owned(),
        ))
    }
}

/// The driver this build records with.
pub fn default_launcher() -> Arc<dyn BrowserLauncher> {
    #[cfg(feature = "chrome")]
    {
        Arc::new(chrome::ChromeLauncher)
    }
    #[cfg(not(feature = "chrome"))]
    {
        Arc::new(UnavailableBrowser)
    }
}
