//! Report endpoints. The JSON report is the documented integration
//! contract; HTML is rendered from the same data.

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::scoring::{self, ReportInputs};
use crate::store::Store;

use super::{ApiError, ApiResult, AppState, ok};

async fn gather(state: &AppState, flow_id: Uuid) -> Result<ReportInputsOwned, ApiError> {
    let flow = state
        .store
        .get_flow(flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {flow_id} not found")))?;
    let requests = state.store.list_requests(flow_id).await?;
    let cases = state.store.list_test_cases_for_flow(flow_id).await?;
    let executions = state.store.list_executions(flow_id).await?;
    let anomalies = state.store.list_all_anomalies(flow_id).await?;
    Ok(ReportInputsOwned {
        flow,
        requests_recorded: requests.len() as u64,
        test_cases_derived: cases.len() as u64,
        executions,
        anomalies,
    })
}

/// Owned variant of [`ReportInputs`] so handlers can gather then borrow.
struct ReportInputsOwned {
    flow: crate::model::Flow,
    requests_recorded: u64,
    test_cases_derived: u64,
    executions: Vec<crate::model::ExecutionState>,
    anomalies: Vec<crate::model::Anomaly>,
}

impl ReportInputsOwned {
    fn as_inputs(&self) -> ReportInputs<'_> {
        ReportInputs {
            flow: &self.flow,
            requests_recorded: self.requests_recorded,
            test_cases_derived: self.test_cases_derived,
            executions: self.executions.clone(),
            anomalies: self.anomalies.clone(),
        }
    }
}

pub async fn summary(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let gathered = gather(&state, id).await?;
    Ok(ok(scoring::summary_report(&gathered.as_inputs())))
}

pub async fn executive(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let gathered = gather(&state, id).await?;
    Ok(ok(scoring::executive_report(&gathered.as_inputs())))
}

pub async fn analytics(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let gathered = gather(&state, id).await?;
    Ok(ok(scoring::analytics_report(&gathered.as_inputs())))
}

/// Full JSON report as a downloadable attachment. This body (not the
/// envelope) is the stable integration contract.
pub async fn json(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let gathered = gather(&state, id).await?;
    let report = scoring::full_report(gathered.as_inputs());
    let body = serde_json::to_vec_pretty(&report)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(attachment(
        body,
        "application/json",
        &format!("flowprobe-report-{id}.json"),
    ))
}

/// Self-contained HTML rendering of the full report.
pub async fn html(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let gathered = gather(&state, id).await?;
    let report = scoring::full_report(gathered.as_inputs());
    let body = scoring::render_html(&report).into_bytes();
    Ok(attachment(
        body,
        "text/html; charset=utf-8",
        &format!("flowprobe-report-{id}.html"),
    ))
}

fn attachment(body: Vec<u8>, content_type: &str, filename: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}
