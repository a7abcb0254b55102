//! HTTP and WebSocket transport.
//!
//! Routes:
//! - `POST   /api/terminal/session` creates a session.
//! - `GET    /api/terminal/session?sessionId=..` upgrades to a WebSocket
//!   attached to that session.
//! - `DELETE /api/terminal/session?sessionId=..` closes a session.
//! - `GET    /api/terminal/sessions` lists live sessions.
//!
//! Terminal output is sent as binary frames exactly as the PTY produced it.
//! Input arrives as binary frames (raw bytes) or text frames, which are
//! either a JSON control message or raw text.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ClientInput, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse, ErrorCode,
    ErrorResponse, SessionSummary,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::session::{ClientId, Session, SessionError, SessionRegistry, SessionState};

/// Session create/attach/close endpoint.
pub const SESSION_PATH: &str = "/api/terminal/session";

/// Session listing endpoint.
pub const SESSIONS_PATH: &str = "/api/terminal/sessions";

/// Interval between keepalive pings on an attached socket.
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A frame that cannot be sent within this window abandons the client.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Error notices waiting to go out to one client.
const NOTICE_QUEUE_DEPTH: usize = 8;

/// Shared state for all handlers.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub session_config: SessionConfig,
    /// Browser origins allowed to use the API. Empty allows any.
    pub allowed_origins: Vec<String>,
    /// Whether a request without an `Origin` header (a non-browser client)
    /// passes the origin check when `allowed_origins` is set.
    pub allow_missing_origin: bool,
}

impl AppState {
    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let Some(origin) = headers.get(header::ORIGIN) else {
            return self.allow_missing_origin;
        };
        origin
            .to_str()
            .map(|origin| self.allowed_origins.iter().any(|allowed| allowed == origin))
            .unwrap_or(false)
    }
}

/// Error returned by a handler, rendered as an [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(code, message),
        }
    }

    fn missing_session_id() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::MissingSessionId,
            "sessionId query parameter is required",
        )
    }

    fn session_not_found(id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::SessionNotFound,
            format!("Session not found: {id}"),
        )
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let (status, code) = match &err {
            // A closing session is no longer attachable.
            SessionError::AlreadyClosed(_) => (StatusCode::NOT_FOUND, ErrorCode::SessionNotFound),
            SessionError::Spawn(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ConnectionFailed),
            SessionError::LimitReached(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::ConnectionFailed)
            }
            SessionError::DuplicateClient(_) => (StatusCode::CONFLICT, ErrorCode::InvalidOperation),
            SessionError::Write(_) | SessionError::Resize(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InvalidOperation)
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl SessionQuery {
    fn require_id(self) -> Result<String, ApiError> {
        self.session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(ApiError::missing_session_id)
    }
}

/// Builds the application router with CORS and request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .route(
            SESSION_PATH,
            get(attach_session)
                .post(create_session)
                .delete(close_session)
                .fallback(method_not_allowed),
        )
        .route(SESSIONS_PATH, get(list_sessions))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::ACCEPT];

    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}

/// Serves the API on `listener` until `shutdown` fires.
///
/// Attached sockets are not waited for; closing the sessions afterwards
/// ends them.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request = CreateSessionRequest::from_json_bytes(&body).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidOperation, e.to_string())
    })?;

    let options = state.session_config.session_options(&request);
    let session = state.registry.new_session(options).map_err(|e| {
        tracing::error!(error = %e, "Failed to create terminal session");
        ApiError::from(e)
    })?;

    Ok(Json(CreateSessionResponse {
        session_id: session.id().clone(),
        message: "Session created successfully".to_string(),
    }))
}

async fn attach_session(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ws = ws.map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidOperation,
            "WebSocket upgrade required",
        )
    })?;

    if !state.origin_allowed(&headers) {
        tracing::warn!(origin = ?headers.get(header::ORIGIN), "Rejected WebSocket origin");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::ConnectionFailed,
            "Origin not allowed",
        ));
    }

    let session_id = query.require_id()?;
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ApiError::session_not_found(&session_id))?;

    let client_id: ClientId = Uuid::new_v4().to_string();
    let output = session.add_client(client_id.clone()).await?;

    let failed_session = Arc::clone(&session);
    let failed_client = client_id.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::warn!(
                session_id = %failed_session.id(),
                error = %e,
                code = %ErrorCode::ConnectionFailed,
                "WebSocket upgrade failed"
            );
            tokio::spawn(async move {
                failed_session.remove_client(&failed_client).await;
            });
        })
        .on_upgrade(move |socket| serve_attach(socket, session, client_id, output)))
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    let session_id = query.require_id()?;
    if !state.registry.close_session(&session_id).await {
        return Err(ApiError::session_not_found(&session_id));
    }

    Ok(Json(CloseSessionResponse {
        session_id,
        message: "Session closed".to_string(),
    }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let sessions = state
        .registry
        .list()
        .await
        .into_iter()
        .map(SessionSummary::from)
        .collect();
    Json(sessions)
}

async fn method_not_allowed() -> ApiError {
    ApiError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorCode::InvalidOperation,
        "Method not allowed",
    )
}

/// Runs one attached client until either side goes away.
async fn serve_attach(
    socket: WebSocket,
    session: Arc<Session>,
    client_id: ClientId,
    output: mpsc::Receiver<Bytes>,
) {
    tracing::info!(session_id = %session.id(), client_id = %client_id, "Client connected");

    let (sink, mut stream) = socket.split();
    let (notices_tx, notices_rx) = mpsc::channel(NOTICE_QUEUE_DEPTH);
    let mut forwarder = tokio::spawn(forward_output(
        sink,
        output,
        notices_rx,
        Arc::clone(&session),
        client_id.clone(),
    ));
    let mut forwarder_done = false;

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut forwarder => {
                forwarder_done = true;
                break;
            }
        };

        let input = match frame {
            Some(Ok(Message::Binary(data))) => Ok(ClientInput::from_binary(&data)),
            Some(Ok(Message::Text(text))) => ClientInput::from_text(text.as_str()),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(client_id = %client_id, error = %e, "WebSocket read failed");
                break;
            }
        };

        let outcome = match input {
            Ok(input) => apply_input(&session, &client_id, input).await,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    client_id = %client_id,
                    error = %e,
                    "Rejecting malformed control message"
                );
                InputOutcome::Rejected(ErrorResponse::new(
                    ErrorCode::InvalidOperation,
                    e.to_string(),
                ))
            }
        };

        match outcome {
            InputOutcome::Applied => {}
            InputOutcome::Rejected(notice) => {
                // A client that floods bad frames loses notices, not input.
                let _ = notices_tx.try_send(notice);
            }
            InputOutcome::Detach => break,
        }
    }

    drop(notices_tx);
    let stats = session.remove_client(&client_id).await;
    if !forwarder_done {
        // Detaching ends the output stream, so the forwarder finishes on its own.
        let _ = forwarder.await;
    }

    match stats {
        Some(stats) => tracing::info!(
            session_id = %session.id(),
            client_id = %client_id,
            chunks_sent = stats.chunks_sent,
            bytes_sent = stats.bytes_sent,
            "Client disconnected"
        ),
        None => tracing::info!(
            session_id = %session.id(),
            client_id = %client_id,
            "Client disconnected"
        ),
    }
}

/// What happened to one frame of client input.
#[derive(Debug)]
enum InputOutcome {
    Applied,
    /// The input was refused; the client is told why and stays attached.
    Rejected(ErrorResponse),
    /// The connection should end.
    Detach,
}

async fn apply_input(session: &Session, client_id: &str, input: ClientInput) -> InputOutcome {
    match input {
        ClientInput::Input(bytes) => match session.write(&bytes).await {
            Ok(()) => InputOutcome::Applied,
            Err(SessionError::AlreadyClosed(_)) => InputOutcome::Detach,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    client_id = %client_id,
                    error = %e,
                    "Failed to forward input"
                );
                InputOutcome::Detach
            }
        },
        ClientInput::Resize { rows, cols } => match session.resize(rows, cols) {
            Ok(()) => InputOutcome::Applied,
            Err(SessionError::AlreadyClosed(_)) => InputOutcome::Detach,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    client_id = %client_id,
                    rows,
                    cols,
                    error = %e,
                    "Failed to resize terminal"
                );
                InputOutcome::Rejected(ErrorResponse::new(
                    ErrorCode::InvalidOperation,
                    e.to_string(),
                ))
            }
        },
    }
}

/// Sends queued output and error notices to the socket, with periodic pings,
/// until the output queue ends or the socket stops accepting frames.
async fn forward_output(
    mut sink: SplitSink<WebSocket, Message>,
    mut output: mpsc::Receiver<Bytes>,
    mut notices: mpsc::Receiver<ErrorResponse>,
    session: Arc<Session>,
    client_id: ClientId,
) {
    let session_id = session.id().clone();
    let mut heartbeat = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;
    let mut notices_open = true;

    loop {
        let message = tokio::select! {
            chunk = output.recv() => match chunk {
                Some(data) => Message::Binary(data),
                None => break,
            },
            notice = notices.recv(), if notices_open => match notice {
                Some(notice) => match serde_json::to_string(&notice) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::warn!(client_id = %client_id, error = %e, "Failed to encode notice");
                        continue;
                    }
                },
                None => {
                    notices_open = false;
                    continue;
                }
            },
            _ = heartbeat.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(WS_SEND_TIMEOUT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session_id, client_id = %client_id, error = %e, "WebSocket send failed");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    client_id = %client_id,
                    "WebSocket send timed out, dropping client"
                );
                return;
            }
        }
    }

    // The output queue also ends when the client detaches itself.
    let frame = if session.state() == SessionState::Running {
        None
    } else {
        Some(CloseFrame {
            code: close_code::NORMAL,
            reason: ErrorCode::TerminalClosed.as_str().into(),
        })
    };
    let _ = tokio::time::timeout(WS_SEND_TIMEOUT, sink.send(Message::Close(frame))).await;
}
