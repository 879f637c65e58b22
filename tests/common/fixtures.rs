use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value;
use uuid::Uuid;

use flowprobe::config::AppConfig;
use flowprobe::events::EventBus;
use flowprobe::model::{
    CapturedExchange, Flow, Mutation, RecordedRequest, ResponseRecord, TestCase,
};
use flowprobe::replayer::{ReplaySettings, Replayer};
use flowprobe::store::{InMemoryStore, SharedStore, Store};
use flowprobe::types::{ExecutionStatus, MutationCategory, OwnerKind};

pub fn mem_store() -> SharedStore {
    Arc::new(InMemoryStore::new())
}

pub fn headers(pairs: &[(&str, &str)]) -> FxHashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// A bearer token shaped like a JWT whose payload is `claims`.
pub fn bearer_jwt(claims: &Value) -> String {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("Bearer hdr.{payload}.sig")
}

pub fn flow(target_domain: &str) -> Flow {
    Flow::new("checkout", target_domain)
}

pub fn request(flow_id: Uuid, ordinal: u32, method: &str, url: &str) -> RecordedRequest {
    RecordedRequest {
        id: Uuid::new_v4(),
        flow_id,
        ordinal,
        method: method.to_string(),
        url: url.to_string(),
        headers: FxHashMap::default(),
        body: None,
        captured_status: 200,
        captured_headers: FxHashMap::default(),
        captured_body: None,
        timestamp: Utc::now(),
    }
}

pub fn test_case(request_id: Uuid, category: MutationCategory, mutation: Mutation) -> TestCase {
    TestCase {
        id: Uuid::new_v4(),
        request_id,
        category,
        rule_id: "fixture-rule".to_string(),
        description: "fixture mutation".to_string(),
        mutation,
        catalog_version: "builtin-1".to_string(),
        created_at: Utc::now(),
    }
}

pub fn exchange(method: &str, url: &str, status: u16) -> CapturedExchange {
    CapturedExchange {
        method: method.to_string(),
        url: url.to_string(),
        headers: FxHashMap::default(),
        body: None,
        response_status: status,
        response_headers: FxHashMap::default(),
        response_body: None,
    }
}

pub fn response(
    owner_kind: OwnerKind,
    owner_id: Uuid,
    execution_id: Uuid,
    status: Option<u16>,
    len: u64,
) -> ResponseRecord {
    ResponseRecord {
        id: Uuid::new_v4(),
        owner_kind,
        owner_id,
        execution_id,
        status,
        headers: FxHashMap::default(),
        body: None,
        content_length: len,
        response_time_ms: 10,
        error_kind: None,
        captured_at: Utc::now(),
    }
}

/// Replay settings tuned for fast tests.
pub fn fast_settings() -> ReplaySettings {
    let config = AppConfig::default();
    let mut settings = ReplaySettings::from(&config);
    settings.rate_limit_rps = 0.0;
    settings.retry_attempts = 0;
    settings.request_timeout = Duration::from_secs(5);
    settings
}

pub fn quiet_replayer(store: SharedStore, settings: ReplaySettings) -> Replayer {
    let bus = EventBus::with_sinks(vec![]);
    bus.listen();
    Replayer::new(store, settings, bus.emitter())
}

/// Poll the store until the execution reaches a terminal state.
pub async fn wait_for_terminal(
    store: &SharedStore,
    execution_id: Uuid,
) -> flowprobe::model::ExecutionState {
    for _ in 0..250 {
        if let Ok(Some(execution)) = store.get_execution(execution_id).await {
            if execution.status != ExecutionStatus::Running {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {execution_id} never reached a terminal state");
}
