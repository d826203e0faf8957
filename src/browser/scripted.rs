//! A deterministic driver that replays a fixed list of responses on navigation.
//!
//! Used for fixtures and tests; further responses can be emitted while a recording is
//! running through [`ScriptedBrowser::emit`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use super::{
    BodyReadError, BrowserError, BrowserEvent, BrowserLauncher, BrowserSession, LaunchOptions,
    RequestIssued, ResponseBodyReader, ResponseReceived,
};
use crate::session::now_unix_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedBody {
    Bytes(Bytes),
    Evicted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ScriptedBody,
}

impl ScriptedResponse {
    pub fn ok(url: &str, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.to_owned(),
            method: "GET".to_owned(),
            status: 200,
            content_type: Some(content_type.to_owned()),
            body: ScriptedBody::Bytes(body.into()),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_owned();
        self
    }

    pub fn with_body(mut self, body: ScriptedBody) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Default)]
struct Shared {
    bodies: Mutex<HashMap<String, ScriptedBody>>,
    sender: Mutex<Option<mpsc::Sender<BrowserEvent>>>,
    next_request: AtomicUsize,
    launched: AtomicUsize,
    closed: AtomicUsize,
}

impl Shared {
    fn register(&self, response: ScriptedResponse) -> [BrowserEvent; 2] {
        let request_id = format!(
            "req-{}",
            self.next_request.fetch_add(1, Ordering::Relaxed)
        );
        self.bodies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request_id.clone(), response.body);
        [
            BrowserEvent::RequestIssued(RequestIssued {
                request_id: request_id.clone(),
                url: response.url.clone(),
                method: response.method,
            }),
            BrowserEvent::ResponseReceived(ResponseReceived {
                request_id,
                url: response.url,
                status: response.status,
                content_type: response.content_type,
                received_at_unix_ms: now_unix_ms(),
            }),
        ]
    }

    fn sender(&self) -> Option<mpsc::Sender<BrowserEvent>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedBrowser {
    document: String,
    responses: Vec<ScriptedResponse>,
    navigation_delay: Option<Duration>,
    navigation_error: Option<String>,
    launch_error: Option<String>,
    shared: Arc<Shared>,
}

impl ScriptedBrowser {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            responses: Vec::new(),
            navigation_delay: None,
            navigation_error: None,
            launch_error: None,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_response(mut self, response: ScriptedResponse) -> Self {
        self.responses.push(response);
        self
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = Some(delay);
        self
    }

    pub fn with_navigation_error(mut self, message: &str) -> Self {
        self.navigation_error = Some(message.to_owned());
        self
    }

    pub fn with_launch_error(mut self, message: &str) -> Self {
        self.launch_error = Some(message.to_owned());
        self
    }

    pub fn launched(&self) -> usize {
        self.shared.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Emits one more response into the running session. Returns `false` when no
    /// session is open.
    pub async fn emit(&self, response: ScriptedResponse) -> bool {
        let Some(sender) = self.shared.sender() else {
            return false;
        };
        for event in self.shared.register(response) {
            if sender.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedBrowser {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        if let Some(message) = &self.launch_error {
            return Err(BrowserError::Launch(message.clone()));
        }
        self.shared.launched.fetch_add(1, Ordering::SeqCst);

        let (sender, receiver) = mpsc::channel(options.event_buffer.max(1));
        *self
            .shared
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);

        Ok(Box::new(ScriptedSession {
            browser: self.clone(),
            events: Some(receiver),
            open: true,
        }))
    }
}

struct ScriptedSession {
    browser: ScriptedBrowser,
    events: Option<mpsc::Receiver<BrowserEvent>>,
    open: bool,
}

struct ScriptedBodyReader {
    shared: Arc<Shared>,
}

#[async_trait]
impl ResponseBodyReader for ScriptedBodyReader {
    async fn read_body(&self, request_id: &str) -> Result<Bytes, BodyReadError> {
        let body = self
            .shared
            .bodies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(request_id)
            .cloned();
        match body {
            Some(ScriptedBody::Bytes(bytes)) => Ok(bytes),
            Some(ScriptedBody::Evicted) => Err(BodyReadError::Evicted),
            Some(ScriptedBody::Failed(message)) => Err(BodyReadError::Failed(message)),
            None => Err(BodyReadError::Failed(format!(
                "no resource with request id `{request_id}`"
            ))),
        }
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    fn take_events(&mut self) -> Option<mpsc::Receiver<BrowserEvent>> {
        self.events.take()
    }

    fn body_reader(&self) -> Arc<dyn ResponseBodyReader> {
        Arc::new(ScriptedBodyReader {
            shared: Arc::clone(&self.browser.shared),
        })
    }

    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError> {
        if !self.open {
            return Err(BrowserError::Closed);
        }
        if let Some(delay) = self.browser.navigation_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.browser.navigation_error {
            return Err(BrowserError::Navigation(format!("{url}: {message}")));
        }

        let Some(sender) = self.browser.shared.sender() else {
            return Err(BrowserError::Closed);
        };
        let mut events = self
            .browser
            .responses
            .iter()
            .cloned()
            .flat_map(|response| self.browser.shared.register(response))
            .collect::<std::collections::VecDeque<_>>();

        // Deliver synchronously while the buffer has room so events are queued before
        // navigation resolves; overflow is fed by a background task.
        while let Some(event) = events.pop_front() {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    events.push_front(event);
                    tokio::spawn(async move {
                        for event in events {
                            if sender.send(event).await.is_err() {
                                break;
                            }
                        }
                    });
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        Ok(())
    }

    async fn document(&mut self) -> Result<String, BrowserError> {
        if !self.open {
            return Err(BrowserError::Closed);
        }
        Ok(self.browser.document.clone())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.open {
            self.open = false;
            self.browser
                .shared
                .sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            self.browser.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use url::Url;

    use super::{ScriptedBody, ScriptedBrowser, ScriptedResponse};
    use crate::browser::{BodyReadError, BrowserEvent, BrowserLauncher, LaunchOptions};

    #[tokio::test]
    async fn navigation_streams_request_then_response_events() {
        let browser = ScriptedBrowser::new("<html></html>")
            .with_response(ScriptedResponse::ok("https://example.test/a.css", "text/css", "a{}"))
            .with_response(
                ScriptedResponse::ok("https://example.test/gone.js", "text/javascript", "")
                    .with_body(ScriptedBody::Evicted),
            );
        let mut session = browser.launch(&LaunchOptions::default()).await.unwrap();
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        session
            .navigate(&Url::parse("https://example.test/").unwrap())
            .await
            .unwrap();
        assert_eq!(session.document().await.unwrap(), "<html></html>");

        let reader = session.body_reader();
        let mut response_ids = Vec::new();
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                BrowserEvent::RequestIssued(request) => assert_eq!(request.method, "GET"),
                BrowserEvent::ResponseReceived(response) => response_ids.push(response.request_id),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            reader.read_body(&response_ids[0]).await.unwrap(),
            Bytes::from_static(b"a{}")
        );
        assert_eq!(
            reader.read_body(&response_ids[1]).await.unwrap_err(),
            BodyReadError::Evicted
        );

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(browser.closed(), 1);
        assert!(events.recv().await.is_none());
    }
}
