//! Process-level status and configuration views.

use axum::extract::State;
use chrono::Utc;
use serde_json::json;

use super::{ApiResult, AppState, ok};

pub async fn status(State(state): State<AppState>) -> ApiResult {
    let recording = state.recorder.status().await;
    Ok(ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": (Utc::now() - state.started_at).num_seconds().max(0),
        "recording": recording.recording,
        "running_executions": state.replayer.running_executions(),
    })))
}

/// Effective configuration. The database URL is reduced to its scheme so
/// credentials in a DSN never leave the process.
pub async fn config(State(state): State<AppState>) -> ApiResult {
    let config = &state.config;
    let database = config
        .database_url
        .split_once("://")
        .map_or("unknown", |(scheme, _)| scheme);
    Ok(ok(json!({
        "listen_addr": config.listen_addr,
        "database": database,
        "max_concurrent_requests": config.max_concurrent_requests,
        "default_rate_limit_rps": config.default_rate_limit_rps,
        "request_timeout_s": config.request_timeout_s,
        "retry_attempts": config.retry_attempts,
        "failure_threshold_pct": config.failure_threshold_pct,
        "confidence_threshold_default": config.confidence_threshold_default,
        "max_body_bytes": config.max_body_bytes,
        "report_retention_days": config.report_retention_days,
        "cors_allowed_origins": config.cors_allowed_origins,
    })))
}
