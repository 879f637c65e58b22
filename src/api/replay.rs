//! Replay launches, status polling, and cancellation.

use axum::extract::{Path, State};
use serde_json::json;
use uuid::Uuid;

use crate::store::Store;

use super::{ApiError, ApiResult, AppState, created, ok};

pub async fn replay_flow(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let flow = state
        .store
        .get_flow(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {id} not found")))?;
    let analysis = state.analysis_context(&flow).await;
    let execution_id = state.replayer.replay_flow(id, analysis).await?;
    Ok(created(json!({"execution_id": execution_id})))
}

pub async fn replay_test_case(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let case = state
        .store
        .get_test_case(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("test case {id} not found")))?;
    let request = state
        .store
        .get_request(case.request_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("request {} not found", case.request_id)))?;
    let flow = state
        .store
        .get_flow(request.flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {} not found", request.flow_id)))?;
    let analysis = state.analysis_context(&flow).await;
    let execution_id = state.replayer.replay_test_case(id, analysis).await?;
    Ok(created(json!({"execution_id": execution_id})))
}

pub async fn status(State(state): State<AppState>, Path(execution_id): Path<Uuid>) -> ApiResult {
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("execution {execution_id} not found")))?;
    let remaining = execution.remaining();
    let mut view = serde_json::to_value(&execution)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(object) = view.as_object_mut() {
        object.insert("remaining".to_string(), json!(remaining));
    }
    Ok(ok(view))
}

pub async fn stop(State(state): State<AppState>, Path(execution_id): Path<Uuid>) -> ApiResult {
    if state.replayer.cancel(execution_id) {
        return Ok(ok(json!({"cancelling": execution_id})));
    }
    // Not running: distinguish unknown from already-terminal.
    match state.store.get_execution(execution_id).await? {
        Some(execution) => Err(ApiError::conflict(format!(
            "execution {execution_id} is already {}",
            execution.status
        ))),
        None => Err(ApiError::not_found(format!(
            "execution {execution_id} not found"
        ))),
    }
}
