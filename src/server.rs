use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    recorder::{Recorder, RecorderError, StopOutcome},
    resource_store::ResourceStore,
    rewrite::{SiblingIndex, render},
    session::{ResourceId, SessionId, SessionStatus, SessionSummary},
    storage::StoreError,
};

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;
const REPLAY_CONTENT_SECURITY_POLICY: &str =
    "default-src 'self' 'unsafe-inline' 'unsafe-eval' data: blob: *; frame-ancestors 'self' *";

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stops accepting connections. Connections already being served finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct AppState {
    recorder: Recorder,
}

impl AppState {
    fn store(&self) -> &ResourceStore {
        self.recorder.store()
    }
}

pub async fn serve(listen: SocketAddr, recorder: Recorder) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    let state = Arc::new(AppState { recorder });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| api_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    tracing::info!(%listen_addr, "api listening");
    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    StartRecording,
    StopRecording,
    RecorderStatus,
    Sessions,
    Session(&'a str),
    Resource(&'a str, &'a str),
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    match path.trim_end_matches('/') {
        "/api/start-recording" => return Some(Route::StartRecording),
        "/api/stop-recording" => return Some(Route::StopRecording),
        "/api/recording" => return Some(Route::RecorderStatus),
        "/api/sessions" => return Some(Route::Sessions),
        _ => {}
    }

    let rest = path.strip_prefix("/api/sessions/")?.trim_end_matches('/');
    match rest.split_once("/resources/") {
        Some((session, resource)) => {
            if session.is_empty()
                || session.contains('/')
                || resource.is_empty()
                || resource.contains('/')
            {
                return None;
            }
            Some(Route::Resource(session, resource))
        }
        None if !rest.is_empty() && !rest.contains('/') => Some(Route::Session(rest)),
        None => None,
    }
}

async fn api_handler(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let mut response = if method == Method::OPTIONS {
        preflight_response()
    } else {
        route_request(req, &method, &path, &state).await
    };
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    tracing::debug!(%method, path = %path, status = response.status().as_u16(), "api request");
    Ok(response)
}

async fn route_request(
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    state: &AppState,
) -> Response<Full<Bytes>> {
    let Some(route) = parse_route(path) else {
        return error_response(StatusCode::NOT_FOUND, "not found");
    };

    match (route, method) {
        (Route::StartRecording, &Method::POST) => start_recording(req, state).await,
        (Route::StopRecording, &Method::POST) => stop_recording(req, state).await,
        (Route::RecorderStatus, &Method::GET) => {
            json_response(StatusCode::OK, &state.recorder.status())
        }
        (Route::Sessions, &Method::GET) => list_sessions(req.uri(), state).await,
        (Route::Session(session), &Method::GET) => get_session(session, state).await,
        (Route::Session(session), &Method::DELETE) => delete_session(session, state).await,
        (Route::Resource(session, resource), &Method::GET) => {
            get_resource(session, resource, state).await
        }
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

#[derive(Debug, Deserialize)]
struct StartRecordingRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRecordingResponse {
    session_id: SessionId,
    message: &'static str,
}

async fn start_recording(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let request = match read_json::<StartRecordingRequest>(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(url) = request.url.filter(|url| !url.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "URL is required");
    };

    match state.recorder.start(&url).await {
        Ok(handle) => json_response(
            StatusCode::OK,
            &StartRecordingResponse {
                session_id: handle.session_id,
                message: "Recording started",
            },
        ),
        Err(err) => recorder_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRecordingRequest {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRecordingResponse {
    message: &'static str,
    metadata: StopMetadata,
    capture: crate::capture::CaptureStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopMetadata {
    id: SessionId,
    url: String,
    status: SessionStatus,
    start_time: i64,
    completed_at: i64,
    resource_count: u64,
}

impl From<StopOutcome> for StopRecordingResponse {
    fn from(outcome: StopOutcome) -> Self {
        Self {
            message: "Recording stopped successfully",
            metadata: StopMetadata {
                id: outcome.session_id,
                url: outcome.url,
                status: outcome.status,
                start_time: outcome.started_at_unix_ms,
                completed_at: outcome.completed_at_unix_ms,
                resource_count: outcome.resource_count,
            },
            capture: outcome.capture,
        }
    }
}

async fn stop_recording(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let request = match read_json::<StopRecordingRequest>(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(raw_id) = request.session_id.filter(|id| !id.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Session ID is required");
    };
    let session_id = match SessionId::parse(&raw_id) {
        Ok(id) => id,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match state.recorder.stop(&session_id).await {
        Ok(outcome) => json_response(StatusCode::OK, &StopRecordingResponse::from(outcome)),
        Err(err) => recorder_error_response(&err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageQuery {
    page: usize,
    limit: usize,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

fn parse_page_query(uri: &Uri) -> Result<PageQuery, String> {
    let mut query = PageQuery::default();
    let Some(raw_query) = uri.query() else {
        return Ok(query);
    };

    for pair in raw_query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "page" => query.page = parse_positive(value, "page")?,
            "limit" => {
                query.limit = parse_positive(value, "limit")?;
                if query.limit > MAX_PAGE_LIMIT {
                    return Err(format!(
                        "query parameter `limit` must not exceed {MAX_PAGE_LIMIT}"
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(query)
}

fn parse_positive(value: &str, field_name: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(format!(
            "query parameter `{field_name}` must be a positive integer"
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsPage {
    sessions: Vec<SessionSummary>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    total: u64,
    page: usize,
    limit: usize,
    total_pages: u64,
}

async fn list_sessions(uri: &Uri, state: &AppState) -> Response<Full<Bytes>> {
    let query = match parse_page_query(uri) {
        Ok(query) => query,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let Some(offset) = (query.page - 1).checked_mul(query.limit) else {
        return error_response(StatusCode::BAD_REQUEST, "query parameter `page` is too large");
    };

    let sessions = state.store().sessions();
    let total = match sessions.count_sessions().await {
        Ok(total) => total,
        Err(err) => return store_error_response(&err),
    };
    let page = match sessions.list_sessions(offset, query.limit).await {
        Ok(page) => page,
        Err(err) => return store_error_response(&err),
    };

    json_response(
        StatusCode::OK,
        &SessionsPage {
            sessions: page,
            pagination: Pagination {
                total,
                page: query.page,
                limit: query.limit,
                total_pages: total.div_ceil(query.limit as u64),
            },
        },
    )
}

async fn get_session(raw_id: &str, state: &AppState) -> Response<Full<Bytes>> {
    let Ok(session_id) = SessionId::parse(raw_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("session `{raw_id}` was not found"));
    };
    match state.store().session(&session_id).await {
        Ok(detail) => json_response(StatusCode::OK, &detail),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSessionResponse {
    message: &'static str,
    blobs_deleted: usize,
}

async fn delete_session(raw_id: &str, state: &AppState) -> Response<Full<Bytes>> {
    let Ok(session_id) = SessionId::parse(raw_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("session `{raw_id}` was not found"));
    };
    if state.recorder.is_active(&session_id) {
        return error_response(
            StatusCode::CONFLICT,
            format!("session `{session_id}` is still recording; stop it first"),
        );
    }
    match state.store().delete_session(&session_id).await {
        Ok(deleted) => json_response(
            StatusCode::OK,
            &DeleteSessionResponse {
                message: "Session deleted successfully",
                blobs_deleted: deleted.blobs_deleted,
            },
        ),
        Err(err) => store_error_response(&err),
    }
}

async fn get_resource(
    raw_session: &str,
    raw_resource: &str,
    state: &AppState,
) -> Response<Full<Bytes>> {
    let (Ok(session_id), Ok(resource_id)) = (
        SessionId::parse(raw_session),
        raw_resource.parse::<ResourceId>(),
    ) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("resource `{raw_resource}` in session `{raw_session}` was not found"),
        );
    };

    let store = state.store();
    let detail = match store.session(&session_id).await {
        Ok(detail) => detail,
        Err(err) => return store_error_response(&err),
    };
    let resource = match store.resource(&session_id, resource_id).await {
        Ok(resource) => resource,
        Err(err) => return store_error_response(&err),
    };
    let payload = match store.load_payload(&resource).await {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(
                session_id = %session_id,
                resource_id = %resource_id,
                url = %resource.meta.url,
                "failed to fetch resource payload: {err}"
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch resource from storage",
            );
        }
    };

    let index = SiblingIndex::from_resources(&session_id, &detail.resources);
    let rendered = render(&resource, payload, &index);
    let mut response = Response::new(Full::new(rendered.body));
    let headers = response.headers_mut();
    if let Ok(content_type) = HeaderValue::from_str(&rendered.content_type) {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("ALLOWALL"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(REPLAY_CONTENT_SECURITY_POLICY),
    );
    response
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = req.into_body().collect().await.map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to read request body: {err}"),
        )
    })?;
    serde_json::from_slice(&body.to_bytes()).map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"))
    })
}

fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn status_for_recorder_error(err: &RecorderError) -> StatusCode {
    match err {
        RecorderError::Validation(_) => StatusCode::BAD_REQUEST,
        RecorderError::NotFound(_) => StatusCode::NOT_FOUND,
        RecorderError::Conflict { .. } => StatusCode::CONFLICT,
        RecorderError::Browser(_) => StatusCode::BAD_GATEWAY,
        RecorderError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn recorder_error_response(err: &RecorderError) -> Response<Full<Bytes>> {
    error_response(status_for_recorder_error(err), err.to_string())
}

fn store_error_response(err: &StoreError) -> Response<Full<Bytes>> {
    let status = match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Backend(_) => {
            tracing::warn!("storage error: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorBody {
            error: message.into(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    let (status, body) = match serde_json::to_vec(payload) {
        Ok(body) => (status, Bytes::from(body)),
        Err(err) => {
            tracing::debug!("failed to serialize JSON response: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from_static(br#"{"error":"failed to serialize response"}"#),
            )
        }
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
