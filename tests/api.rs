use std::sync::Arc;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use flowprobe::api::{AppState, router};
use flowprobe::config::AppConfig;

mod common;
use common::*;

/// Serve the control plane on an ephemeral port; returns the base URL.
async fn spawn_app() -> String {
    let store = mem_store();
    let config = AppConfig::default();
    let replayer = quiet_replayer(Arc::clone(&store), fast_settings());
    let app = router(AppState::new(store, config, replayer));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_flow(base: &str, name: &str) -> Value {
    let response = client()
        .post(format!("{base}/flows"))
        .json(&json!({"name": name, "target_domain": "shop.example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json::<Value>().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn flow_crud_round_trips_through_the_envelope() {
    let base = spawn_app().await;

    let created = create_flow(&base, "checkout").await;
    assert_eq!(created["success"], json!(true));
    assert!(created["request_id"].is_string());
    assert!(created["timestamp"].is_string());
    let flow_id = created["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["name"], json!("checkout"));

    // Create -> read returns the created fields.
    let fetched = client()
        .get(format!("{base}/flows/{flow_id}"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(fetched["data"]["name"], json!("checkout"));
    assert_eq!(fetched["data"]["target_domain"], json!("shop.example.com"));

    let updated = client()
        .put(format!("{base}/flows/{flow_id}"))
        .json(&json!({"description": "weekly run"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(updated["data"]["description"], json!("weekly run"));

    let listed = client()
        .get(format!("{base}/flows?page=1&per_page=10"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(listed["data"]["total"], json!(1));
    assert_eq!(listed["data"]["page"], json!(1));
    assert_eq!(listed["data"]["has_next"], json!(false));
    assert_eq!(listed["data"]["has_prev"], json!(false));

    let deleted = client()
        .delete(format!("{base}/flows/{flow_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let missing = client()
        .get(format!("{base}/flows/{flow_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body = missing.json::<Value>().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("not_found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_errors_carry_per_field_details() {
    let base = spawn_app().await;
    let response = client()
        .post(format!("{base}/flows"))
        .json(&json!({"name": "", "target_domain": "shop.example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body = response.json::<Value>().await.unwrap();
    assert_eq!(body["code"], json!("validation"));
    assert_eq!(body["details"]["name"], json!("required"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recording_lifecycle_over_http() {
    let base = spawn_app().await;
    let created = create_flow(&base, "recorded").await;
    let flow_id = created["data"]["id"].as_str().unwrap().to_string();

    // Select, then start without an explicit flow.
    let selected = client()
        .post(format!("{base}/flows/{flow_id}/select"))
        .send()
        .await
        .unwrap();
    assert_eq!(selected.status(), 200);
    let started = client()
        .post(format!("{base}/recording/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(started.status(), 201);

    let status = client()
        .get(format!("{base}/recording/status"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(status["data"]["recording"], json!(true));

    // Double-start is a session conflict.
    let conflict = client()
        .post(format!("{base}/recording/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);
    assert_eq!(
        conflict.json::<Value>().await.unwrap()["code"],
        json!("conflict")
    );

    let added = client()
        .post(format!("{base}/recording/request"))
        .json(&json!({
            "method": "GET",
            "url": "https://shop.example.com/profile",
            "response_status": 200,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(added.status(), 201);

    let summary = client()
        .post(format!("{base}/recording/stop"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(summary["data"]["requests_recorded"], json!(1));

    // Adding after stop is rejected.
    let rejected = client()
        .post(format!("{base}/recording/request"))
        .json(&json!({
            "method": "GET",
            "url": "https://shop.example.com/profile",
            "response_status": 200,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 409);
}

#[tokio::test(flavor = "multi_thread")]
async fn import_generate_and_list_test_cases() {
    let base = spawn_app().await;
    let created = create_flow(&base, "generated").await;
    let flow_id = created["data"]["id"].as_str().unwrap().to_string();

    let imported = client()
        .post(format!("{base}/recording/import"))
        .json(&json!({
            "flow_id": flow_id,
            "exchanges": [
                {
                    "method": "POST",
                    "url": "https://shop.example.com/checkout/start",
                    "response_status": 200,
                },
                {
                    "method": "POST",
                    "url": "https://shop.example.com/checkout/pay?amount=100",
                    "headers": {"Content-Type": "application/json"},
                    "body": "{\"price\": 19.99}",
                    "response_status": 200,
                },
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(imported.status(), 201);
    assert_eq!(
        imported.json::<Value>().await.unwrap()["data"]["imported"],
        json!(2)
    );

    let generated = client()
        .post(format!("{base}/payloads/generate/flow/{flow_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(generated.status(), 201);
    let body = generated.json::<Value>().await.unwrap();
    let derived = body["data"]["derived"].as_u64().unwrap();
    assert!(derived > 0);
    assert_eq!(body["data"]["inserted"], json!(derived));

    // Idempotent: a second run inserts nothing new.
    let again = client()
        .post(format!("{base}/payloads/generate/flow/{flow_id}"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(again["data"]["inserted"], json!(0));

    let cases = client()
        .get(format!("{base}/payloads/testcases/flow/{flow_id}"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(cases["data"].as_array().unwrap().len() as u64, derived);
}

#[tokio::test(flavor = "multi_thread")]
async fn catalogs_and_threshold_are_tunable() {
    let base = spawn_app().await;

    let rules = client()
        .get(format!("{base}/payloads/rules"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(rules["data"]["version"], json!("builtin-1"));

    // An invalid catalog is rejected wholesale.
    let rejected = client()
        .put(format!("{base}/payloads/rules"))
        .json(&json!({"version": "", "rules": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 422);

    let detection = client()
        .get(format!("{base}/analysis/rules"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(detection["data"]["version"], json!("builtin-1"));

    let threshold = client()
        .get(format!("{base}/analysis/threshold"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(threshold["data"]["confidence_threshold"], json!(0.7));

    let set = client()
        .post(format!("{base}/analysis/threshold"))
        .json(&json!({"confidence_threshold": 0.85}))
        .send()
        .await
        .unwrap();
    assert_eq!(set.status(), 200);
    let threshold = client()
        .get(format!("{base}/analysis/threshold"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(threshold["data"]["confidence_threshold"], json!(0.85));

    let out_of_range = client()
        .post(format!("{base}/analysis/threshold"))
        .json(&json!({"confidence_threshold": 1.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(out_of_range.status(), 422);
}

#[tokio::test(flavor = "multi_thread")]
async fn reports_are_well_formed_for_an_empty_flow() {
    let base = spawn_app().await;
    let created = create_flow(&base, "empty").await;
    let flow_id = created["data"]["id"].as_str().unwrap().to_string();

    let response = client()
        .get(format!("{base}/reports/json/{flow_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("attachment"));
    let report = response.json::<Value>().await.unwrap();
    assert_eq!(report["report_version"], json!("1"));
    assert_eq!(report["anomalies"], json!([]));
    assert_eq!(report["risk"]["total_anomalies"], json!(0));
    assert_eq!(report["risk"]["risk_category"], json!("low"));

    let summary = client()
        .get(format!("{base}/reports/summary/{flow_id}"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(summary["data"]["risk"]["total_anomalies"], json!(0));

    let html = client()
        .get(format!("{base}/reports/html/{flow_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        html.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/html; charset=utf-8"
    );
    assert!(html.text().await.unwrap().contains("<h1>"));

    let missing = client()
        .get(format!("{base}/reports/json/{}", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn system_status_and_config_respond() {
    let base = spawn_app().await;
    let status = client()
        .get(format!("{base}/system/status"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(status["data"]["status"], json!("ok"));
    assert_eq!(status["data"]["recording"], json!(false));

    let config = client()
        .get(format!("{base}/system/config"))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(config["data"]["database"], json!("sqlite"));
    assert_eq!(config["data"]["max_concurrent_requests"], json!(5));
    // Credentials never leak: only the scheme of the DSN is exposed.
    assert!(config["data"]["database_url"].is_null());

    let replay_status = client()
        .get(format!("{base}/replay/status/{}", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(replay_status.status(), 404);
}
