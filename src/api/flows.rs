//! Flow CRUD and recording-flow selection.

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::model::{Flow, Identity};
use crate::store::Store;

use super::{ApiError, ApiResult, AppState, ListParams, created, ok, ok_page};

#[derive(Debug, Deserialize)]
pub struct CreateFlow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target_domain: String,
    #[serde(default)]
    pub identity_pool: Vec<Identity>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFlow {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_domain: Option<String>,
    pub identity_pool: Option<Vec<Identity>>,
    /// `null` clears the override; absent leaves it untouched.
    #[serde(default, with = "double_option")]
    pub confidence_threshold: Option<Option<f64>>,
}

/// Distinguish "absent" from "explicit null" for nullable overrides.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(de).map(Some)
    }
}

fn validate_threshold(threshold: Option<f64>) -> Result<(), ApiError> {
    if let Some(t) = threshold {
        if !(0.0..=1.0).contains(&t) {
            return Err(ApiError::validation("confidence_threshold must lie in [0, 1]")
                .with_details(json!({"confidence_threshold": t})));
        }
    }
    Ok(())
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let page = state.store.list_flows(&params.into()).await?;
    Ok(ok_page(page))
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateFlow>,
) -> ApiResult {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("name must not be empty")
            .with_details(json!({"name": "required"})));
    }
    if body.target_domain.trim().is_empty() {
        return Err(ApiError::validation("target_domain must not be empty")
            .with_details(json!({"target_domain": "required"})));
    }
    validate_threshold(body.confidence_threshold)?;
    let mut flow = Flow::new(body.name.trim(), body.target_domain.trim());
    flow.description = body.description;
    flow.identity_pool = body.identity_pool;
    flow.confidence_threshold = body.confidence_threshold;
    state.store.create_flow(&flow).await?;
    Ok(created(flow))
}

pub async fn fetch(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let flow = state
        .store
        .get_flow(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {id} not found")))?;
    Ok(ok(flow))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateFlow>,
) -> ApiResult {
    let mut flow = state
        .store
        .get_flow(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {id} not found")))?;
    if let Some(name) = body.name {
        if name.trim().is_empty() {
            return Err(ApiError::validation("name must not be empty"));
        }
        flow.name = name;
    }
    if let Some(description) = body.description {
        flow.description = description;
    }
    if let Some(target_domain) = body.target_domain {
        if target_domain.trim().is_empty() {
            return Err(ApiError::validation("target_domain must not be empty"));
        }
        flow.target_domain = target_domain;
    }
    if let Some(identity_pool) = body.identity_pool {
        flow.identity_pool = identity_pool;
    }
    if let Some(threshold) = body.confidence_threshold {
        validate_threshold(threshold)?;
        flow.confidence_threshold = threshold;
    }
    flow.updated_at = Utc::now();
    state.store.update_flow(&flow).await?;
    Ok(ok(flow))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    if state.store.delete_flow(id).await? {
        Ok(ok(json!({"deleted": id})))
    } else {
        Err(ApiError::not_found(format!("flow {id} not found")))
    }
}

/// Set the active flow for subsequently started recording sessions.
pub async fn select(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    if state.store.get_flow(id).await?.is_none() {
        return Err(ApiError::not_found(format!("flow {id} not found")));
    }
    state.recorder.select_flow(id).await;
    Ok(ok(json!({"selected": id})))
}
