//! HTTP surface: streaming chat over SSE, group CRUD, session termination,
//! and health.
//!
//! The chat handler binds one SSE subscriber to the output router for the
//! lifetime of the request. A second concurrent chat for the same group gets
//! 409. Client disconnects unsubscribe without touching the in-flight
//! container; events the stream never read are returned to the group's
//! fallback buffer.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use anyhow::Context as _;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use hearth_core::{normalize_group_id, AgentEvent, HearthConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::queue::{GroupQueue, PendingPrompt, SubmitError};
use crate::registry::GroupRegistry;
use crate::router::OutputRouter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HearthConfig>,
    pub registry: Arc<GroupRegistry>,
    pub queue: Arc<GroupQueue>,
    pub router: Arc<OutputRouter>,
    /// groupId → subscriber token of the active SSE request.
    pub active_sse: Arc<StdMutex<HashMap<String, u64>>>,
}

pub fn build_router(state: AppState) -> Router {
    let public = Router::new().route("/api/health", get(health));

    let protected = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/{folder}/session", delete(stop_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let bind = state.config.server.bind();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(bind = bind.as_str(), "http listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("http server exited unexpectedly")
}

// ── Middleware ─────────────────────────────────────────────────────────

/// Mirror-origin CORS; answers any preflight with 204.
async fn cors(req: Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    apply_cors_headers(&mut response, origin);
    response
}

fn apply_cors_headers(response: &mut Response, origin: Option<HeaderValue>) {
    let headers = response.headers_mut();
    if let Some(origin) = origin {
        headers.insert("access-control-allow-origin", origin);
    }
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(token) = state
        .config
        .server
        .auth_token
        .as_deref()
        .filter(|t| !t.is_empty())
    {
        let expected = format!("Bearer {token}");
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    next.run(req).await
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    prompt: String,
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_response(rejection),
    };
    if req.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt is required");
    }

    let raw = req
        .group_id
        .clone()
        .unwrap_or_else(|| state.config.main_group_folder.clone());
    let group_id = match normalize_group_id(&raw) {
        Ok(id) => id,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("{err}")),
    };

    if let Err(err) = state.registry.ensure_registered(&raw).await {
        warn!(group_id = group_id.as_str(), err = %err, "auto-registration failed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to register group");
    }

    // Reserve the group's single subscriber slot and drain the fallback
    // buffer in one step, so buffered events precede anything the new run
    // emits.
    let subscription = {
        let mut active = state.active_sse.lock().unwrap();
        if active.contains_key(&group_id) {
            return error_response(StatusCode::CONFLICT, "another stream is active for this group");
        }
        let subscription = state.router.subscribe(&group_id);
        active.insert(group_id.clone(), subscription.token);
        subscription
    };
    let cleanup = SseCleanup {
        router: state.router.clone(),
        active_sse: state.active_sse.clone(),
        group_id: group_id.clone(),
        token: subscription.token,
    };

    let submit = state
        .queue
        .submit(
            &group_id,
            PendingPrompt {
                prompt: req.prompt.clone(),
                isolated: false,
                scheduled: false,
            },
        )
        .await;
    if let Err(err) = submit {
        // The drained backlog goes back to the buffer for the next stream.
        cleanup.release(subscription.backlog);
        return match err {
            SubmitError::Conflict => error_response(StatusCode::CONFLICT, format!("{err}")),
            SubmitError::ShuttingDown => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, format!("{err}"))
            }
        };
    }

    let stream = EventStream {
        backlog: subscription.backlog.into(),
        rx: subscription.rx,
        finished: false,
        cleanup: Some(cleanup),
    };
    let sse_stream = stream.map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn list_groups(State(state): State<AppState>) -> Json<serde_json::Value> {
    let groups: Vec<_> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|g| {
            json!({
                "id": g.id,
                "name": g.name,
                "folder": g.folder,
                "added_at": g.added_at,
            })
        })
        .collect();
    Json(json!(groups))
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    folder: Option<String>,
}

async fn create_group(
    State(state): State<AppState>,
    payload: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_response(rejection),
    };
    if req.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }

    let raw = req.folder.clone().unwrap_or_else(|| req.name.clone());
    let group_id = match normalize_group_id(&raw) {
        Ok(id) => id,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("{err}")),
    };
    if state.registry.exists(&group_id).await {
        return error_response(StatusCode::CONFLICT, "group already exists");
    }

    match state
        .registry
        .register(&group_id, req.name.trim(), "", None)
        .await
    {
        Ok(group) => (
            StatusCode::CREATED,
            Json(json!({"id": group.id, "name": group.name, "folder": group.folder})),
        )
            .into_response(),
        Err(err) => {
            warn!(group_id = group_id.as_str(), err = %err, "group registration failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to register group")
        }
    }
}

async fn stop_session(State(state): State<AppState>, Path(folder): Path<String>) -> Response {
    if state.queue.terminate_group(&folder).await {
        Json(json!({"status": "stopped"})).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "no active session for this group")
    }
}

// ── SSE plumbing ───────────────────────────────────────────────────────

fn to_sse_event(event: &AgentEvent) -> Event {
    match event {
        AgentEvent::Message { text } => Event::default()
            .event("message")
            .data(json!({"text": text}).to_string()),
        AgentEvent::Error { error } => Event::default()
            .event("error")
            .data(json!({"error": error}).to_string()),
        AgentEvent::Done { session_id } => Event::default()
            .event("done")
            .data(json!({"sessionId": session_id}).to_string()),
    }
}

struct SseCleanup {
    router: Arc<OutputRouter>,
    active_sse: Arc<StdMutex<HashMap<String, u64>>>,
    group_id: String,
    token: u64,
}

impl SseCleanup {
    fn release(&self, undelivered: Vec<AgentEvent>) {
        self.router.restore(&self.group_id, undelivered);
        self.router.unsubscribe(&self.group_id, self.token);
        let mut active = self.active_sse.lock().unwrap();
        if active.get(&self.group_id) == Some(&self.token) {
            active.remove(&self.group_id);
        }
    }
}

/// Buffered backlog first, then live events; ends after the first terminal
/// event. Dropping the stream (client disconnect or normal end) returns any
/// unread events to the fallback buffer and releases the subscriber slot.
struct EventStream {
    backlog: VecDeque<AgentEvent>,
    rx: mpsc::Receiver<AgentEvent>,
    finished: bool,
    cleanup: Option<SseCleanup>,
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = this.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let mut undelivered = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            undelivered.push(event);
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.release(undelivered);
        }
    }
}

fn rejection_response(rejection: JsonRejection) -> Response {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    } else {
        error_response(StatusCode::BAD_REQUEST, "invalid JSON body")
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}
