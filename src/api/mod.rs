//! Control plane: the HTTP/JSON surface over the engine.
//!
//! Handlers validate input and delegate; no domain logic lives here. The
//! response envelope is uniform: `{success, data|error, code, details?,
//! timestamp, request_id}`, with list endpoints adding pagination
//! metadata inside `data`.

mod analysis;
mod flows;
mod payloads;
mod recording;
mod replay;
mod reports;
mod system;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::analyzer::DetectionCatalog;
use crate::config::AppConfig;
use crate::model::Flow;
use crate::mutator::{MutationCatalog, MutatorError};
use crate::recorder::{Recorder, RecorderError};
use crate::replayer::{AnalysisContext, Replayer, ReplayerError};
use crate::store::{ListQuery, Page, SharedStore, StoreError};
use crate::types::ErrorKind;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub recorder: Arc<Recorder>,
    pub replayer: Replayer,
    pub config: Arc<AppConfig>,
    pub mutation_catalog: Arc<RwLock<MutationCatalog>>,
    pub detection_catalog: Arc<RwLock<DetectionCatalog>>,
    pub confidence_threshold: Arc<RwLock<f64>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(store: SharedStore, config: AppConfig, replayer: Replayer) -> Self {
        let confidence = config.confidence_threshold_default;
        let max_body = config.max_body_bytes;
        Self {
            recorder: Arc::new(Recorder::new(Arc::clone(&store), max_body)),
            store,
            replayer,
            config: Arc::new(config),
            mutation_catalog: Arc::new(RwLock::new(MutationCatalog::default())),
            detection_catalog: Arc::new(RwLock::new(DetectionCatalog::default())),
            confidence_threshold: Arc::new(RwLock::new(confidence)),
            started_at: Utc::now(),
        }
    }

    /// Snapshot the analyzer inputs for a launch: current detection
    /// catalog plus the flow's threshold override (if any).
    pub async fn analysis_context(&self, flow: &Flow) -> AnalysisContext {
        AnalysisContext {
            detection: self.detection_catalog.read().await.clone(),
            confidence_threshold: match flow.confidence_threshold {
                Some(threshold) => threshold,
                None => *self.confidence_threshold.read().await,
            },
        }
    }
}

/// Build the full resource surface.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/flows", get(flows::list).post(flows::create))
        .route(
            "/flows/{id}",
            get(flows::fetch).put(flows::update).delete(flows::remove),
        )
        .route("/flows/{id}/select", post(flows::select))
        .route("/recording/status", get(recording::status))
        .route("/recording/start", post(recording::start))
        .route("/recording/stop", post(recording::stop))
        .route("/recording/request", post(recording::add_request))
        .route("/recording/import", post(recording::import))
        .route(
            "/payloads/generate/request/{id}",
            post(payloads::generate_for_request),
        )
        .route(
            "/payloads/generate/flow/{id}",
            post(payloads::generate_for_flow),
        )
        .route(
            "/payloads/rules",
            get(payloads::get_rules).put(payloads::put_rules),
        )
        .route(
            "/payloads/testcases/flow/{id}",
            get(payloads::list_for_flow),
        )
        .route("/replay/flow/{id}", post(replay::replay_flow))
        .route("/replay/testcase/{id}", post(replay::replay_test_case))
        .route("/replay/status/{execution_id}", get(replay::status))
        .route("/replay/stop/{execution_id}", post(replay::stop))
        .route("/analysis/flow/{id}", post(analysis::reanalyze_flow))
        .route("/analysis/anomalies/{flow_id}", get(analysis::list))
        .route(
            "/analysis/anomaly/{id}",
            get(analysis::fetch).put(analysis::update),
        )
        .route(
            "/analysis/rules",
            get(analysis::get_rules).put(analysis::put_rules),
        )
        .route(
            "/analysis/threshold",
            get(analysis::get_threshold).post(analysis::set_threshold),
        )
        .route("/reports/summary/{id}", get(reports::summary))
        .route("/reports/html/{id}", get(reports::html))
        .route("/reports/json/{id}", get(reports::json))
        .route("/reports/executive/{id}", get(reports::executive))
        .route("/reports/analytics/{id}", get(reports::analytics))
        .route("/system/status", get(system::status))
        .route("/system/config", get(system::config))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    if config.cors_allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(
                config
                    .cors_allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                    .collect::<Vec<_>>(),
            ))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ------------------------------------------------------------------ envelope

fn envelope_body(data: Value) -> Value {
    json!({
        "success": true,
        "data": data,
        "timestamp": Utc::now(),
        "request_id": Uuid::new_v4(),
    })
}

/// 200 with the standard envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => (StatusCode::OK, axum::Json(envelope_body(value))).into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

/// 201 with the standard envelope.
pub fn created<T: Serialize>(data: T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => (StatusCode::CREATED, axum::Json(envelope_body(value))).into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

/// 200 with pagination metadata folded into `data`.
pub fn ok_page<T: Serialize>(page: Page<T>) -> Response {
    let has_next = page.has_next();
    let has_prev = page.has_prev();
    match serde_json::to_value(&page.items) {
        Ok(items) => ok(json!({
            "items": items,
            "total": page.total,
            "page": page.page,
            "per_page": page.per_page,
            "has_next": has_next,
            "has_prev": has_prev,
        })),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

/// Common list-endpoint query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    pub sort: Option<String>,
    pub search: Option<String>,
}

impl From<ListParams> for ListQuery {
    fn from(params: ListParams) -> Self {
        ListQuery {
            page: params.page,
            per_page: params.per_page,
            sort: params.sort,
            search: params.search,
        }
    }
}

// --------------------------------------------------------------------- error

/// Uniform API error: an [`ErrorKind`] plus a human message and optional
/// per-field details.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            details: None,
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Storage
            | ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "code": self.kind.encode(),
            "details": self.details,
            "timestamp": Utc::now(),
            "request_id": Uuid::new_v4(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { what, id } => Self::not_found(format!("{what} {id} not found")),
            StoreError::Backend { message } | StoreError::Other { message } => Self {
                kind: ErrorKind::Storage,
                message,
                details: None,
            },
        }
    }
}

impl From<RecorderError> for ApiError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::Conflict { .. } | RecorderError::NoActiveSession => {
                Self::conflict(err.to_string())
            }
            RecorderError::NoFlowSelected | RecorderError::Validation { .. } => {
                Self::validation(err.to_string())
            }
            RecorderError::Store(store) => store.into(),
        }
    }
}

impl From<ReplayerError> for ApiError {
    fn from(err: ReplayerError) -> Self {
        match err {
            ReplayerError::FlowNotFound { .. }
            | ReplayerError::TestCaseNotFound { .. }
            | ReplayerError::RequestNotFound { .. }
            | ReplayerError::ExecutionNotFound { .. } => Self::not_found(err.to_string()),
            ReplayerError::Client { message } => Self::internal(message),
            ReplayerError::Store(store) => store.into(),
        }
    }
}

impl From<MutatorError> for ApiError {
    fn from(err: MutatorError) -> Self {
        match err {
            MutatorError::InvalidCatalog { .. } | MutatorError::NotApplicable { .. } => {
                Self::validation(err.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

pub type ApiResult = std::result::Result<Response, ApiError>;
