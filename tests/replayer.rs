use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use flowprobe::model::{Mutation, TargetSelector, Transform};
use flowprobe::replayer::AnalysisContext;
use flowprobe::store::Store;
use flowprobe::types::{
    ErrorKind, ExecutionStatus, MutationCategory, OwnerKind, Severity, VulnerabilityType,
};

mod common;
use common::*;

fn default_analysis() -> AnalysisContext {
    AnalysisContext {
        detection: flowprobe::analyzer::DetectionCatalog::default(),
        confidence_threshold: 0.7,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn whole_flow_detects_stripped_auth_acceptance() {
    let server = MockServer::start_async().await;
    let login = server
        .mock_async(|when, then| {
            when.method(GET).path("/login");
            then.status(200).body("ok");
        })
        .await;
    let admin = server
        .mock_async(|when, then| {
            when.method(GET).path("/admin");
            then.status(200).body("secret listing");
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    let mut first = request(flow.id, 0, "GET", &server.url("/login"));
    store.append_request(&mut first).await.unwrap();
    let mut second = request(flow.id, 0, "GET", &server.url("/admin"));
    second.headers = headers(&[("Authorization", "Bearer valid-token")]);
    store.append_request(&mut second).await.unwrap();

    let case = test_case(
        second.id,
        MutationCategory::Auth,
        Mutation {
            selector: TargetSelector::Header {
                name: "Authorization".into(),
            },
            transform: Transform::Delete,
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let replayer = quiet_replayer(std::sync::Arc::clone(&store), fast_settings());
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.total, 1);
    assert_eq!(execution.done, 1);
    assert_eq!(execution.failed, 0);
    assert_eq!(execution.remaining(), 0);

    // Baseline transcript committed for both ordinals.
    for request in [&first, &second] {
        let baseline = store
            .latest_response(OwnerKind::Baseline, request.id, execution_id)
            .await
            .unwrap()
            .expect("baseline response committed");
        assert_eq!(baseline.status, Some(200));
    }
    let mutant = store
        .latest_response(OwnerKind::Mutant, case.id, execution_id)
        .await
        .unwrap()
        .expect("mutant response committed");
    assert_eq!(mutant.status, Some(200));

    let anomalies = store.list_all_anomalies(flow.id).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    let anomaly = &anomalies[0];
    assert_eq!(
        anomaly.vulnerability_type,
        VulnerabilityType::UnauthorizedAccess
    );
    assert_eq!(anomaly.severity, Severity::Critical);
    assert!(anomaly.is_potential_vulnerability);
    assert_eq!(anomaly.test_case_id, case.id);

    // The mutant pair re-ran the /login prefix for context.
    assert!(login.hits_async().await >= 2);
    assert!(admin.hits_async().await >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeouts_become_error_responses_without_anomalies() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).body("eventually").delay(Duration::from_secs(2));
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    let mut slow = request(flow.id, 0, "GET", &server.url("/slow"));
    store.append_request(&mut slow).await.unwrap();
    let case = test_case(
        slow.id,
        MutationCategory::Sequence,
        Mutation {
            selector: TargetSelector::Envelope,
            transform: Transform::SequenceRepeat,
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let mut settings = fast_settings();
    settings.request_timeout = Duration::from_millis(200);
    // Lenient threshold so the baseline timeout does not stop the run
    // before the mutant side of the pair executes.
    settings.failure_threshold = 1.0;
    let replayer = quiet_replayer(std::sync::Arc::clone(&store), settings);
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    // Baseline and mutant both timed out; 2 failed / 1 total exceeds
    // even the lenient threshold.
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed, 2);

    let baseline = store
        .latest_response(OwnerKind::Baseline, slow.id, execution_id)
        .await
        .unwrap()
        .expect("baseline timeout recorded as a response");
    assert_eq!(baseline.status, None);
    assert_eq!(baseline.error_kind, Some(ErrorKind::Timeout));
    let mutant = store
        .latest_response(OwnerKind::Mutant, case.id, execution_id)
        .await
        .unwrap()
        .expect("timeout recorded as a response");
    assert_eq!(mutant.status, None);
    assert_eq!(mutant.error_kind, Some(ErrorKind::Timeout));

    assert!(store.list_all_anomalies(flow.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_failure_threshold_fails_on_first_transport_error() {
    let store = mem_store();
    // Nothing listens on discard; connections are refused.
    let flow = flow("127.0.0.1");
    store.create_flow(&flow).await.unwrap();
    let mut unreachable = request(flow.id, 0, "GET", "http://127.0.0.1:9/");
    store.append_request(&mut unreachable).await.unwrap();
    let case = test_case(
        unreachable.id,
        MutationCategory::Sequence,
        Mutation {
            selector: TargetSelector::Envelope,
            transform: Transform::SequenceRepeat,
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let mut settings = fast_settings();
    settings.failure_threshold = 0.0;
    let replayer = quiet_replayer(std::sync::Arc::clone(&store), settings);
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    // The very first transport error — the baseline transcript entry —
    // stops the execution; the mutant pair never runs.
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed, 1);
    let baseline = store
        .latest_response(OwnerKind::Baseline, unreachable.id, execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(baseline.error_kind, Some(ErrorKind::Network));
    assert!(
        store
            .latest_response(OwnerKind::Mutant, case.id, execution_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn baseline_failure_counts_even_when_mutants_would_pass() {
    let server = MockServer::start_async().await;
    let healthy_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/ok");
            then.status(200).body("fine");
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    // Ordinal 1: unreachable baseline that no test case targets.
    let mut dead = request(flow.id, 0, "GET", "http://127.0.0.1:9/");
    store.append_request(&mut dead).await.unwrap();
    // Ordinal 2: healthy request whose mutant would succeed.
    let mut healthy = request(flow.id, 0, "GET", &server.url("/ok"));
    store.append_request(&mut healthy).await.unwrap();
    let case = test_case(
        healthy.id,
        MutationCategory::Sequence,
        Mutation {
            selector: TargetSelector::Envelope,
            transform: Transform::SequenceRepeat,
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let mut settings = fast_settings();
    settings.failure_threshold = 0.0;
    let replayer = quiet_replayer(std::sync::Arc::clone(&store), settings);
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    // The baseline failure alone trips the zero threshold, even though
    // every mutant pair would have passed.
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed, 1);
    assert_eq!(execution.done, 0);

    let baseline = store
        .latest_response(OwnerKind::Baseline, dead.id, execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(baseline.error_kind, Some(ErrorKind::Network));
    // The execution stopped at the tripped baseline: the healthy step
    // was never replayed and its mutant never committed.
    assert!(
        store
            .latest_response(OwnerKind::Mutant, case.id, execution_id)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(healthy_mock.hits_async().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_flow_replay_is_a_noop() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();

    let replayer = quiet_replayer(std::sync::Arc::clone(&store), fast_settings());
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.total, 0);
    assert_eq!(execution.done, 0);
    assert!(store.list_all_anomalies(flow.id).await.unwrap().is_empty());

    // The aggregate view over an empty flow is well-formed.
    let summary = flowprobe::scoring::summarize(&[]);
    assert_eq!(summary.total_anomalies, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn early_cancellation_discards_pending_pairs() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(200).body("ok").delay(Duration::from_millis(250));
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    let mut case_ids = Vec::new();
    for i in 0..3 {
        let mut req = request(flow.id, 0, "GET", &server.url(&format!("/step/{i}")));
        store.append_request(&mut req).await.unwrap();
        let case = test_case(
            req.id,
            MutationCategory::Sequence,
            Mutation {
                selector: TargetSelector::Envelope,
                transform: Transform::SequenceRepeat,
            },
        );
        store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();
        case_ids.push(case.id);
    }

    let replayer = quiet_replayer(std::sync::Arc::clone(&store), fast_settings());
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(replayer.cancel(execution_id));

    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    // Workers observed the flag before any pair committed.
    for case_id in case_ids {
        assert!(
            store
                .latest_response(OwnerKind::Mutant, case_id, execution_id)
                .await
                .unwrap()
                .is_none()
        );
    }
    // Cancelling a terminal execution is a no-op.
    assert!(!replayer.cancel(execution_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn sequence_repeat_plays_the_step_twice() {
    let server = MockServer::start_async().await;
    let start = server
        .mock_async(|when, then| {
            when.method(POST).path("/checkout/start");
            then.status(200).body("started");
        })
        .await;
    let pay = server
        .mock_async(|when, then| {
            when.method(POST).path("/checkout/pay");
            then.status(200).body("paid");
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    let mut first = request(flow.id, 0, "POST", &server.url("/checkout/start"));
    store.append_request(&mut first).await.unwrap();
    let mut second = request(flow.id, 0, "POST", &server.url("/checkout/pay"));
    store.append_request(&mut second).await.unwrap();
    let case = test_case(
        second.id,
        MutationCategory::Sequence,
        Mutation {
            selector: TargetSelector::Envelope,
            transform: Transform::SequenceRepeat,
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let replayer = quiet_replayer(std::sync::Arc::clone(&store), fast_settings());
    let execution_id = replayer
        .replay_flow(flow.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    // Baseline pass: start 1, pay 1. Pair: prefix start+pay, probe pay.
    assert_eq!(start.hits_async().await, 2);
    assert_eq!(pay.hits_async().await, 3);

    // Repeat is not a bypass; no anomaly for an identical 200.
    assert!(store.list_all_anomalies(flow.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_test_case_mode_commits_a_strict_pair() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/cart/add");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"accepted": true}));
        })
        .await;

    let store = mem_store();
    let flow = flow(&server.host());
    store.create_flow(&flow).await.unwrap();
    let mut cart = request(flow.id, 0, "POST", &server.url("/cart/add"));
    cart.headers = headers(&[("Content-Type", "application/json")]);
    cart.body = Some(serde_json::to_vec(&json!({"price": 19.99, "qty": 1})).unwrap());
    store.append_request(&mut cart).await.unwrap();
    let case = test_case(
        cart.id,
        MutationCategory::Parameter,
        Mutation {
            selector: TargetSelector::JsonBodyField {
                pointer: "/price".into(),
            },
            transform: Transform::NumericExtreme { value: json!(-1) },
        },
    );
    store.insert_test_cases(flow.id, &[case.clone()]).await.unwrap();

    let replayer = quiet_replayer(std::sync::Arc::clone(&store), fast_settings());
    let execution_id = replayer
        .replay_test_case(case.id, default_analysis())
        .await
        .unwrap();
    let execution = wait_for_terminal(&store, execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.total, 1);

    let baseline = store
        .latest_response(OwnerKind::Baseline, cart.id, execution_id)
        .await
        .unwrap()
        .expect("baseline committed");
    let mutant = store
        .latest_response(OwnerKind::Mutant, case.id, execution_id)
        .await
        .unwrap()
        .expect("mutant committed");
    assert_eq!(baseline.status, Some(200));
    assert_eq!(mutant.status, Some(200));

    // A negative price accepted with 200 is parameter tampering.
    let anomalies = store.list_all_anomalies(flow.id).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(
        anomalies[0].vulnerability_type,
        VulnerabilityType::ParameterTampering
    );
    assert_eq!(anomalies[0].severity, Severity::High);
}
