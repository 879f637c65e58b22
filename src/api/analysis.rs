//! Anomaly listing and triage, re-analysis, and the detection catalog.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::analyzer::{self, DetectionCatalog};
use crate::replayer::probe_request;
use crate::store::Store;
use crate::types::{AnomalyStatus, OwnerKind};

use super::{ApiError, ApiResult, AppState, ListParams, ok};

/// Re-run the analyzer over the latest execution's pairs under the
/// current detection catalog. Fresh anomalies are appended with the new
/// catalog version; historical ones keep theirs.
pub async fn reanalyze_flow(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let flow = state
        .store
        .get_flow(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {id} not found")))?;
    let executions = state.store.list_executions(id).await?;
    let Some(execution) = executions.first() else {
        return Ok(ok(json!({"pairs_analyzed": 0, "anomalies_created": 0})));
    };
    let requests = state.store.list_requests(id).await?;
    let cases = state.store.list_test_cases_for_flow(id).await?;
    let analysis = state.analysis_context(&flow).await;

    let mut pairs_analyzed = 0_u64;
    let mut fresh = Vec::new();
    for case in &cases {
        let Some(mutant) = state
            .store
            .latest_response(OwnerKind::Mutant, case.id, execution.id)
            .await?
        else {
            continue;
        };
        let Some(probe) = probe_request(case, &requests) else {
            continue;
        };
        let Some(baseline) = state
            .store
            .latest_response(OwnerKind::Baseline, probe.id, execution.id)
            .await?
        else {
            continue;
        };
        pairs_analyzed += 1;
        if baseline.error_kind.is_some() && mutant.error_kind.is_some() {
            continue;
        }
        fresh.extend(analyzer::analyze(
            flow.id,
            case,
            &baseline,
            &mutant,
            &analysis.detection,
            analysis.confidence_threshold,
        ));
    }
    state.store.insert_anomalies(id, &fresh).await?;
    Ok(ok(json!({
        "execution_id": execution.id,
        "pairs_analyzed": pairs_analyzed,
        "anomalies_created": fresh.len(),
        "catalog_version": analysis.detection.version,
    })))
}

pub async fn list(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    if state.store.get_flow(flow_id).await?.is_none() {
        return Err(ApiError::not_found(format!("flow {flow_id} not found")));
    }
    let page = state.store.list_anomalies(flow_id, &params.into()).await?;
    Ok(super::ok_page(page))
}

pub async fn fetch(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let anomaly = state
        .store
        .get_anomaly(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("anomaly {id} not found")))?;
    Ok(ok(anomaly))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAnomaly {
    pub status: Option<AnomalyStatus>,
    pub description: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAnomaly>,
) -> ApiResult {
    let mut anomaly = state
        .store
        .get_anomaly(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("anomaly {id} not found")))?;
    if let Some(status) = body.status {
        anomaly.status = status;
    }
    if let Some(description) = body.description {
        anomaly.description = description;
    }
    state.store.update_anomaly(&anomaly).await?;
    Ok(ok(anomaly))
}

pub async fn get_rules(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.detection_catalog.read().await.clone()))
}

pub async fn put_rules(
    State(state): State<AppState>,
    Json(catalog): Json<DetectionCatalog>,
) -> ApiResult {
    catalog
        .validate()
        .map_err(|message| ApiError::validation(message))?;
    let version = catalog.version.clone();
    *state.detection_catalog.write().await = catalog;
    Ok(ok(json!({"catalog_version": version})))
}

pub async fn get_threshold(State(state): State<AppState>) -> ApiResult {
    let threshold = *state.confidence_threshold.read().await;
    Ok(ok(json!({"confidence_threshold": threshold})))
}

#[derive(Debug, Deserialize)]
pub struct ThresholdBody {
    pub confidence_threshold: f64,
}

pub async fn set_threshold(
    State(state): State<AppState>,
    Json(body): Json<ThresholdBody>,
) -> ApiResult {
    if !(0.0..=1.0).contains(&body.confidence_threshold) {
        return Err(ApiError::validation(
            "confidence_threshold must lie in [0, 1]",
        ));
    }
    *state.confidence_threshold.write().await = body.confidence_threshold;
    Ok(ok(json!({"confidence_threshold": body.confidence_threshold})))
}
