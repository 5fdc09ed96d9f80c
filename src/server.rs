//! HTTP boundary for the broker engine
//!
//! Every response is a JSON envelope: `{"data": ...}` on success or
//! `{"error": "..."}` on failure. Business outcomes that simply didn't go the
//! caller's way (an unknown task id, a refused push) are status 200; only
//! malformed requests are 400, bad credentials 401, and shutdown refusals
//! 503. Request parameters are accepted from the query string and, for
//! form-encoded bodies, from the body as well, with body values winning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    extract::{FromRequest, FromRequestParts, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::HopperError;
use crate::mux::QueueStateMux;
use crate::task::TaskView;

/// Shared state behind every handler.
pub struct AppState {
    pub queues: Arc<QueueStateMux>,
    pub config: Config,
    pub started_at: DateTime<Utc>,
    pub save_stats: parking_lot::RwLock<SaveStats>,
}

/// Bookkeeping for `/stats` about the snapshot save loop.
#[derive(Debug, Clone, Default)]
pub struct SaveStats {
    pub last_save: Option<DateTime<Utc>>,
    pub last_duration: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(queues: Arc<QueueStateMux>, config: Config) -> Self {
        Self {
            queues,
            config,
            started_at: Utc::now(),
            save_stats: parking_lot::RwLock::new(SaveStats::default()),
        }
    }

    /// Records a completed snapshot save for `/stats`.
    pub fn record_save(&self, finished_at: DateTime<Utc>, duration: Duration) {
        let mut stats = self.save_stats.write();
        stats.last_save = Some(finished_at);
        stats.last_duration = duration;
    }
}

/// Builds the full router, rooted at the configured path prefix.
pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/", get(serve_index))
        .route("/summary", get(serve_summary))
        .route("/counts", get(serve_counts))
        .route("/stats", get(serve_stats))
        .route("/task/push", get(serve_push).post(serve_push))
        .route("/task/push_batch", get(serve_push_batch).post(serve_push_batch))
        .route("/task/pop", get(serve_pop).post(serve_pop))
        .route("/task/pop_batch", get(serve_pop_batch).post(serve_pop_batch))
        .route("/task/peek", get(serve_peek).post(serve_peek))
        .route("/task/completed", get(serve_completed).post(serve_completed))
        .route(
            "/task/completed_batch",
            get(serve_completed_batch).post(serve_completed_batch),
        )
        .route("/task/keepalive", get(serve_keepalive).post(serve_keepalive))
        .route("/task/clear", get(serve_clear).post(serve_clear))
        .route("/task/expire_all", get(serve_expire_all).post(serve_expire_all))
        .route(
            "/task/queue_expired",
            get(serve_queue_expired).post(serve_queue_expired),
        )
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let prefix = state.config.path_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}

// ── Envelope helpers ───────────────────────────────────────────────────────

fn data<T: Serialize>(value: T) -> Response {
    Json(json!({ "data": value })).into_response()
}

/// A business outcome the caller should handle: status 200, error envelope.
fn soft_error(message: &str) -> Response {
    Json(json!({ "error": message })).into_response()
}

/// A request the broker refused outright.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<HopperError> for ApiError {
    fn from(err: HopperError) -> Self {
        let status = match err {
            HopperError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ── Request parameters ─────────────────────────────────────────────────────

/// Merged view of query-string and form-body parameters.
///
/// Values are validated lazily by the accessor methods so each handler
/// reports the parameter it actually cares about.
pub struct Params(BTreeMap<String, String>);

impl<S: Send + Sync> FromRequest<S> for Params {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();
        let Query(query) = Query::<BTreeMap<String, String>>::from_request_parts(&mut parts, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("invalid query string: {e}")))?;
        let req = Request::from_parts(parts, body);

        let mut merged = query;
        if let Ok(Form(form)) = Form::<BTreeMap<String, String>>::from_request(req, state).await {
            merged.extend(form);
        }
        Ok(Params(merged))
    }
}

impl Params {
    fn value(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn context(&self) -> &str {
        self.0.get("context").map(String::as_str).unwrap_or("")
    }

    fn flag(&self, key: &str) -> bool {
        self.value(key) == Some("1")
    }

    fn limit(&self) -> Result<usize, ApiError> {
        match self.value("limit") {
            None => Ok(0),
            Some(raw) => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid `limit` parameter: {raw}")))?;
                Ok(parsed.max(0) as usize)
            }
        }
    }

    fn timeout(&self) -> Result<Option<Duration>, ApiError> {
        match self.value("timeout") {
            None => Ok(None),
            Some(raw) => {
                let seconds: f64 = raw
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid `timeout` parameter: {raw}")))?;
                if !(seconds > 0.0) || !seconds.is_finite() {
                    return Err(ApiError::bad_request(
                        "timeout must be at least one millisecond",
                    ));
                }
                Ok(Some(Duration::from_secs_f64(seconds)))
            }
        }
    }

    fn count(&self) -> Result<usize, ApiError> {
        let raw = self
            .value("count")
            .ok_or_else(|| ApiError::bad_request("must specify `count` parameter"))?;
        let parsed: i64 = raw
            .parse()
            .map_err(|_| ApiError::bad_request(format!("invalid `count` parameter: {raw}")))?;
        if parsed <= 0 {
            return Err(ApiError::bad_request("invalid `count` requested"));
        }
        Ok(parsed as usize)
    }

    fn window(&self) -> Result<usize, ApiError> {
        match self.value("window") {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid `window` parameter: {raw}"))),
        }
    }
}

// ── Basic auth ─────────────────────────────────────────────────────────────

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            r#"Basic realm="restricted", charset="UTF-8""#,
        )],
        Json(json!({ "error": message })),
    )
        .into_response()
}

/// Decodes `Authorization: Basic ...` into a `(username, password)` pair.
fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn basic_auth(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    if !state.config.auth_enabled() {
        return next.run(request).await;
    }

    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_basic_auth);
    let Some((username, password)) = supplied else {
        return unauthorized("basic auth must be provided");
    };

    let user_ok = secure_compare(&username, &state.config.auth_username);
    let pass_ok = secure_compare(&password, &state.config.auth_password);
    if user_ok && pass_ok {
        next.run(request).await
    } else {
        unauthorized("incorrect credentials")
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

async fn serve_index() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], "hopper task broker\n").into_response()
}

async fn serve_summary(State(state): State<SharedState>) -> Response {
    let mut out = String::new();
    let mut found = false;
    let result = state.queues.iterate(|name, qs| {
        found = true;
        if name.is_empty() {
            out.push_str("---- Default context ----\n");
        } else {
            out.push_str(&format!("---- Context: {name} ----\n"));
        }
        let counts = qs.counts(0, false, true);
        out.push_str(&format!("    Pending: {}\n", counts.pending));
        out.push_str(&format!("In progress: {}\n", counts.running));
        out.push_str(&format!("    Expired: {}\n", counts.expired));
        out.push_str(&format!("  Completed: {}\n", counts.completed));
        out.push_str(&format!("      Bytes: {}\n", counts.bytes.unwrap_or(0)));
    });

    let status = match result {
        Ok(()) => {
            if !found {
                out.push_str("No active queues.");
            }
            StatusCode::OK
        }
        Err(err) => {
            out = err.to_string();
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, [(header::CONTENT_TYPE, "text/plain")], out).into_response()
}

async fn serve_counts(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let window = params.window()?;
    let include_modtime = params.flag("includeModtime");
    let include_bytes = params.flag("includeBytes");

    if params.flag("all") {
        let mut names = Vec::new();
        let mut counts = Vec::new();
        state.queues.iterate(|name, qs| {
            names.push(name.to_string());
            counts.push(qs.counts(window, include_modtime, include_bytes));
        })?;
        return Ok(data(json!({ "names": names, "counts": counts })));
    }

    let counts = state
        .queues
        .get(params.context(), |qs| qs.counts(window, include_modtime, include_bytes))?;
    Ok(data(counts))
}

async fn serve_stats(State(state): State<SharedState>) -> Response {
    let uptime = (Utc::now() - state.started_at).num_milliseconds() as f64 / 1000.0;
    let save = {
        let stats = state.save_stats.read();
        json!({
            "elapsed": stats
                .last_save
                .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0),
            "latency": stats.last_duration.as_secs_f64(),
        })
    };
    data(json!({ "uptime": uptime, "save": save }))
}

fn task_json(view: &TaskView, include_attempts: bool) -> serde_json::Value {
    let mut obj = json!({ "id": view.id, "contents": view.contents });
    if include_attempts {
        obj["numPreviousAttempts"] = json!(view.num_attempts.saturating_sub(1));
    }
    obj
}

fn retry_seconds(next_try: DateTime<Utc>) -> f64 {
    ((next_try - Utc::now()).num_milliseconds() as f64 / 1000.0).max(0.0)
}

async fn serve_push(State(state): State<SharedState>, params: Params) -> Result<Response, ApiError> {
    let Some(contents) = params.value("contents") else {
        return Err(ApiError::bad_request(
            "must specify non-empty `contents` parameter",
        ));
    };
    let limit = params.limit()?;
    let id = state
        .queues
        .get(params.context(), |qs| qs.push(contents, limit))?;
    Ok(data(id))
}

async fn serve_push_batch(
    State(state): State<SharedState>,
    Query(query): Query<BTreeMap<String, String>>,
    body: Result<Json<Vec<String>>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(contents) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let params = Params(query);
    let limit = params.limit()?;
    let ids = state
        .queues
        .get(params.context(), |qs| qs.push_batch(&contents, limit))?;
    Ok(data(ids))
}

async fn serve_pop(State(state): State<SharedState>, params: Params) -> Result<Response, ApiError> {
    let timeout = params.timeout()?;
    let include_attempts = params.flag("includePreviousAttempts");
    let (task, next_try) = state.queues.get(params.context(), |qs| qs.pop(timeout))?;

    Ok(match (task, next_try) {
        (Some(view), _) => data(task_json(&view, include_attempts)),
        (None, Some(at)) => data(json!({ "done": false, "retry": retry_seconds(at) })),
        (None, None) => data(json!({ "done": true })),
    })
}

async fn serve_pop_batch(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let timeout = params.timeout()?;
    let count = params.count()?;
    let include_attempts = params.flag("includePreviousAttempts");
    let (tasks, next_try) = state
        .queues
        .get(params.context(), |qs| qs.pop_batch(count, timeout))?;

    let mut result = json!({
        "done": tasks.is_empty() && next_try.is_none(),
        "tasks": tasks
            .iter()
            .map(|view| task_json(view, include_attempts))
            .collect::<Vec<_>>(),
    });
    if let Some(at) = next_try {
        result["retry"] = json!(retry_seconds(at));
    }
    Ok(data(result))
}

async fn serve_peek(State(state): State<SharedState>, params: Params) -> Result<Response, ApiError> {
    let (task, next, next_time) = state.queues.get(params.context(), |qs| qs.peek())?;

    Ok(match (task, next, next_time) {
        (Some(view), _, _) => data(json!({ "id": view.id, "contents": view.contents })),
        (None, Some(next), Some(at)) => data(json!({
            "done": false,
            "retry": retry_seconds(at),
            "next": { "id": next.id, "contents": next.contents },
        })),
        _ => data(json!({ "done": true })),
    })
}

async fn serve_completed(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let id = params.value("id").unwrap_or("");
    let completed = state.queues.get(params.context(), |qs| qs.completed(id))?;
    Ok(if completed {
        data(true)
    } else {
        soft_error("there was no in-progress task with the specified `id`")
    })
}

async fn serve_completed_batch(
    State(state): State<SharedState>,
    Query(query): Query<BTreeMap<String, String>>,
    body: Result<Json<Vec<String>>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(ids) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let params = Params(query);
    let failures = state.queues.get(params.context(), |qs| {
        ids.iter()
            .filter(|id| !qs.completed(id))
            .cloned()
            .collect::<Vec<_>>()
    })?;

    Ok(if failures.is_empty() {
        data(true)
    } else {
        soft_error(&format!(
            "there were no in-progress tasks with the specified ids: {}",
            failures.join(", ")
        ))
    })
}

async fn serve_keepalive(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let timeout = params.timeout()?;
    let id = params.value("id").unwrap_or("");
    let alive = state
        .queues
        .get(params.context(), |qs| qs.keepalive(id, timeout))?;
    Ok(if alive {
        data(true)
    } else {
        soft_error("there was no in-progress task with the specified `id`")
    })
}

async fn serve_clear(State(state): State<SharedState>, params: Params) -> Result<Response, ApiError> {
    state.queues.get(params.context(), |qs| qs.clear())?;
    Ok(data(true))
}

async fn serve_expire_all(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let n = state.queues.get(params.context(), |qs| qs.expire_all())?;
    Ok(data(n))
}

async fn serve_queue_expired(
    State(state): State<SharedState>,
    params: Params,
) -> Result<Response, ApiError> {
    let n = state.queues.get(params.context(), |qs| qs.queue_expired())?;
    Ok(data(n))
}
