//! Test-case generation and the mutation rule catalog.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;
use uuid::Uuid;

use crate::mutator::{self, MutationCatalog};
use crate::store::Store;

use super::{ApiError, ApiResult, AppState, created, ok};

pub async fn generate_for_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult {
    let request = state
        .store
        .get_request(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("request {id} not found")))?;
    let flow = state
        .store
        .get_flow(request.flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {} not found", request.flow_id)))?;
    let flow_requests = state.store.list_requests(flow.id).await?;
    let catalog = state.mutation_catalog.read().await.clone();
    let cases = mutator::derive_for_request(&flow, &flow_requests, &request, &catalog);
    let inserted = state.store.insert_test_cases(flow.id, &cases).await?;
    Ok(created(json!({
        "request_id": id,
        "derived": cases.len(),
        "inserted": inserted,
        "deduplicated": cases.len() as u64 - inserted,
        "catalog_version": catalog.version,
    })))
}

pub async fn generate_for_flow(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let flow = state
        .store
        .get_flow(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {id} not found")))?;
    let flow_requests = state.store.list_requests(flow.id).await?;
    let catalog = state.mutation_catalog.read().await.clone();
    let cases = mutator::derive_for_flow(&flow, &flow_requests, &catalog);
    let inserted = state.store.insert_test_cases(flow.id, &cases).await?;
    Ok(created(json!({
        "flow_id": id,
        "derived": cases.len(),
        "inserted": inserted,
        "deduplicated": cases.len() as u64 - inserted,
        "catalog_version": catalog.version,
    })))
}

pub async fn list_for_flow(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    if state.store.get_flow(id).await?.is_none() {
        return Err(ApiError::not_found(format!("flow {id} not found")));
    }
    let cases = state.store.list_test_cases_for_flow(id).await?;
    Ok(ok(cases))
}

pub async fn get_rules(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.mutation_catalog.read().await.clone()))
}

/// Replace the mutation catalog wholesale after validation.
pub async fn put_rules(
    State(state): State<AppState>,
    Json(catalog): Json<MutationCatalog>,
) -> ApiResult {
    catalog
        .validate()
        .map_err(|message| ApiError::validation(message))?;
    let version = catalog.version.clone();
    *state.mutation_catalog.write().await = catalog;
    Ok(ok(json!({"catalog_version": version})))
}
