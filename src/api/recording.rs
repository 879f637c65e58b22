//! Recording session lifecycle and exchange intake.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::model::CapturedExchange;

use super::{ApiResult, AppState, created, ok};

#[derive(Debug, Default, Deserialize)]
pub struct StartBody {
    #[serde(default)]
    pub flow_id: Option<Uuid>,
}

pub async fn status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.recorder.status().await))
}

/// Body is optional: an empty POST starts recording into the selected
/// flow.
pub async fn start(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResult {
    let flow_id = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<StartBody>(&body)
            .map_err(|e| super::ApiError::validation(format!("malformed body: {e}")))?
            .flow_id
    };
    let session_id = state.recorder.start(flow_id).await?;
    Ok(created(json!({"session_id": session_id})))
}

pub async fn stop(State(state): State<AppState>) -> ApiResult {
    let summary = state.recorder.stop().await?;
    Ok(ok(summary))
}

pub async fn add_request(
    State(state): State<AppState>,
    Json(exchange): Json<CapturedExchange>,
) -> ApiResult {
    let request = state.recorder.add_exchange(exchange).await?;
    Ok(created(request))
}

#[derive(Debug, Deserialize)]
pub struct ImportBody {
    pub flow_id: Uuid,
    pub exchanges: Vec<CapturedExchange>,
}

/// Bulk import outside any recording session: every exchange is
/// validated up front, then appended in order.
pub async fn import(
    State(state): State<AppState>,
    Json(body): Json<ImportBody>,
) -> ApiResult {
    let requests = state.recorder.import(body.flow_id, body.exchanges).await?;
    Ok(created(json!({
        "flow_id": body.flow_id,
        "imported": requests.len(),
        "requests": requests,
    })))
}
