//! Chromium driver over the DevTools protocol.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::network::{
        EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
        EventResponseReceived, GetResponseBodyParams, RequestId,
    },
};
use futures::StreamExt as _;
use tokio::{sync::mpsc, task::JoinHandle};
use url::Url;

use super::{
    BodyReadError, BrowserError, BrowserEvent, BrowserLauncher, BrowserSession, LaunchOptions,
    RequestIssued, ResponseBodyReader, ResponseReceived,
};
use crate::session::now_unix_ms;

/// Messages Chromium returns once a body left its network cache.
const EVICTED_BODY_MARKERS: [&str; 2] = ["No resource with given identifier", "evicted"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeLauncher;

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut builder = BrowserConfig::builder();
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &options.executable {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::debug!("chromium handler error: {err}");
                }
            }
        });

        let mut session = ChromeSession {
            browser: Some(browser),
            handler_task: Some(handler_task),
            forwarder_task: None,
            page: None,
            events: None,
        };
        if let Err(err) = session.open_page(options.event_buffer).await {
            let _ = session.close().await;
            return Err(err);
        }
        tracing::debug!(headless = options.headless, "launched chromium");
        Ok(Box::new(session))
    }
}

struct ChromeSession {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    forwarder_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    events: Option<mpsc::Receiver<BrowserEvent>>,
}

impl ChromeSession {
    async fn open_page(&mut self, event_buffer: usize) -> Result<(), BrowserError> {
        let browser = self.browser.as_ref().ok_or(BrowserError::Closed)?;
        let page = browser.new_page("about:blank").await.map_err(protocol)?;
        page.execute(EnableParams::default()).await.map_err(protocol)?;

        let requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(protocol)?;
        let responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(protocol)?;
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(protocol)?;
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(protocol)?;

        let (sender, receiver) = mpsc::channel(event_buffer.max(1));
        self.forwarder_task = Some(tokio::spawn(forward_network_events(
            sender, requests, responses, finished, failed,
        )));
        self.events = Some(receiver);
        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page, BrowserError> {
        self.page.as_ref().ok_or(BrowserError::Closed)
    }
}

fn protocol(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

/// Emits a response only once its body finished loading, so the body is readable when the
/// capture task asks for it.
async fn forward_network_events(
    sender: mpsc::Sender<BrowserEvent>,
    mut requests: chromiumoxide::listeners::EventStream<EventRequestWillBeSent>,
    mut responses: chromiumoxide::listeners::EventStream<EventResponseReceived>,
    mut finished: chromiumoxide::listeners::EventStream<EventLoadingFinished>,
    mut failed: chromiumoxide::listeners::EventStream<EventLoadingFailed>,
) {
    let mut pending: HashMap<String, ResponseReceived> = HashMap::new();
    loop {
        let event = tokio::select! {
            Some(request) = requests.next() => BrowserEvent::RequestIssued(RequestIssued {
                request_id: request.request_id.inner().clone(),
                url: request.request.url.clone(),
                method: request.request.method.clone(),
            }),
            Some(response) = responses.next() => {
                let content_type = Some(response.response.mime_type.clone())
                    .filter(|mime| !mime.is_empty());
                let request_id = response.request_id.inner().clone();
                pending.insert(request_id.clone(), ResponseReceived {
                    request_id,
                    url: response.response.url.clone(),
                    status: u16::try_from(response.response.status).unwrap_or(0),
                    content_type,
                    received_at_unix_ms: now_unix_ms(),
                });
                continue;
            }
            Some(done) = finished.next() => {
                match pending.remove(done.request_id.inner()) {
                    Some(response) => BrowserEvent::ResponseReceived(response),
                    None => continue,
                }
            }
            Some(failure) = failed.next() => {
                let request_id = failure.request_id.inner().clone();
                pending.remove(&request_id);
                BrowserEvent::RequestFailed { request_id }
            }
            else => break,
        };
        if sender.send(event).await.is_err() {
            break;
        }
    }
}

struct ChromeBodyReader {
    page: Page,
}

#[async_trait]
impl ResponseBodyReader for ChromeBodyReader {
    async fn read_body(&self, request_id: &str) -> Result<Bytes, BodyReadError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .map_err(|err| {
                let message = err.to_string();
                if EVICTED_BODY_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
                {
                    BodyReadError::Evicted
                } else {
                    BodyReadError::Failed(message)
                }
            })?;

        let body = &response.result;
        if body.base64_encoded {
            base64::engine::general_purpose::STANDARD
                .decode(body.body.as_bytes())
                .map(Bytes::from)
                .map_err(|err| BodyReadError::Failed(format!("decode base64 body: {err}")))
        } else {
            Ok(Bytes::from(body.body.clone()))
        }
    }
}

/// Reader handed out after the page is gone.
struct ClosedBodyReader;

#[async_trait]
impl ResponseBodyReader for ClosedBodyReader {
    async fn read_body(&self, _request_id: &str) -> Result<Bytes, BodyReadError> {
        Err(BodyReadError::Failed("browser session is closed".to_owned()))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    fn take_events(&mut self) -> Option<mpsc::Receiver<BrowserEvent>> {
        self.events.take()
    }

    fn body_reader(&self) -> Arc<dyn ResponseBodyReader> {
        match &self.page {
            Some(page) => Arc::new(ChromeBodyReader { page: page.clone() }),
            None => Arc::new(ClosedBodyReader),
        }
    }

    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError> {
        self.page()?
            .goto(url.as_str())
            .await
            .map_err(|err| BrowserError::Navigation(format!("{url}: {err}")))?;
        Ok(())
    }

    async fn document(&mut self) -> Result<String, BrowserError> {
        self.page()?.content().await.map_err(protocol)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.page = None;
        if let Some(task) = self.forwarder_task.take() {
            task.abort();
        }
        let result = match self.browser.take() {
            Some(mut browser) => {
                let closed = browser.close().await.map_err(protocol);
                if let Err(err) = browser.wait().await {
                    tracing::debug!("waiting for chromium to exit: {err}");
                }
                closed.map(|_| ())
            }
            None => Ok(()),
        };
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        result
    }
}
