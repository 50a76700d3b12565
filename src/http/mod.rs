use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{
        Extension, Query,
        rejection::{FormRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    ledger::LedgerError,
    scheduler::{Scheduler, SubmitError, SubmitOutcome},
    topology::ClusterState,
};


pub const MASTER_COUNT_CONFLICT_MESSAGE: &str =
    "Master server count required is different from exist request and not accepted";
pub const RETRY_PENDING_MESSAGE: &str =
    "Request is scheduled but failed this time, will retry later";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_key(mut self, key: impl Into<String>) -> Self {
        self.details.insert("key".to_string(), Value::String(key.into()));
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<SubmitError> for ApiError {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::Rejected(LedgerError::MasterCountConflict { .. }) => ApiError::new(
                "master_count_conflict",
                StatusCode::INTERNAL_SERVER_ERROR,
                MASTER_COUNT_CONFLICT_MESSAGE,
            ),
            SubmitError::Rejected(err @ LedgerError::InvalidMasterCount { .. }) => {
                ApiError::invalid_request(err.to_string())
            }
            SubmitError::Stopped => ApiError::unavailable("scheduler is stopping"),
            SubmitError::Cancelled { key } => {
                ApiError::unavailable("scheduler stopped before the request was satisfied")
                    .with_key(key)
            }
            SubmitError::CycleAborted { key, .. } => {
                ApiError::internal(RETRY_PENDING_MESSAGE).with_key(key)
            }
        }
    }
}

// Body is `{code, message, ...details}` so callers can read `key` at the top level.
#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(flatten)]
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    let app_state = AppState { scheduler };

    Router::new()
        .route("/scale", post(scale))
        .route("/status", get(status))
        .route("/health", get(health))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

#[derive(Debug, Default, Deserialize)]
struct ScaleParams {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    master_count: Option<u32>,
    #[serde(default)]
    servant_count: Option<u32>,
}

impl ScaleParams {
    fn merge(self, over: ScaleParams) -> ScaleParams {
        ScaleParams {
            key: over.key.or(self.key),
            master_count: over.master_count.or(self.master_count),
            servant_count: over.servant_count.or(self.servant_count),
        }
    }
}

#[derive(Debug, Serialize)]
struct ScaleResponse {
    message: &'static str,
    key: String,
    master_ip: Option<String>,
}

async fn scale(
    Extension(state): Extension<AppState>,
    query: Result<Query<ScaleParams>, QueryRejection>,
    form: Result<Form<ScaleParams>, FormRejection>,
) -> Result<Json<ScaleResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let form = match form {
        Ok(Form(form)) => form,
        Err(FormRejection::InvalidFormContentType(_)) => ScaleParams::default(),
        Err(e) => return Err(ApiError::invalid_request(e.body_text())),
    };
    let params = query.merge(form);

    // Any non-zero master count asks for a dedicated manager node.
    let master_count = u32::from(params.master_count.unwrap_or(0) != 0);
    let servant_count = params.servant_count.unwrap_or(0);
    let key = params.key.filter(|k| !k.trim().is_empty());

    match state
        .scheduler
        .submit(key, master_count, servant_count)
        .await?
    {
        SubmitOutcome::Satisfied { key, primary } => Ok(Json(ScaleResponse {
            message: "success",
            key,
            master_ip: primary.address().map(str::to_string),
        })),
        SubmitOutcome::Pending { key, error } => Err(ApiError::new(
            error.code(),
            StatusCode::INTERNAL_SERVER_ERROR,
            RETRY_PENDING_MESSAGE,
        )
        .with_key(key)),
    }
}

#[derive(Debug, Serialize)]
struct AppliedView {
    master_count: u32,
    servant_count: u32,
    master_ip: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    phase: &'static str,
    applied: Option<AppliedView>,
    verdict: ClusterState,
    live_requests: usize,
}

async fn status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let reconciler = state.scheduler.reconciler();
    let (verdict, live_requests) = {
        let mut ledger = reconciler.ledger().lock().await;
        let verdict = ledger.current_verdict();
        (verdict, ledger.len())
    };
    let applied = reconciler.applied().await.map(|a| AppliedView {
        master_count: a.state.master_count,
        servant_count: a.state.servant_count,
        master_ip: a.primary.address().map(str::to_string),
    });

    Json(StatusResponse {
        phase: reconciler.phase().as_str(),
        applied,
        verdict,
        live_requests,
    })
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let status = if state.scheduler.is_stopped() {
        "stopping"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "version": crate::version::VERSION,
    }))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
