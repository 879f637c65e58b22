use std::sync::Arc;

use flowprobe::recorder::{Recorder, RecorderError};
use flowprobe::store::Store;

mod common;
use common::*;

fn recorder(store: &flowprobe::store::SharedStore) -> Recorder {
    Recorder::new(Arc::clone(store), 1024 * 1024)
}

#[tokio::test]
async fn session_lifecycle_idle_recording_idle() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = recorder(&store);

    let status = recorder.status().await;
    assert!(!status.recording);

    let session_id = recorder.start(Some(flow.id)).await.unwrap();
    let status = recorder.status().await;
    assert!(status.recording);
    assert_eq!(status.session_id, Some(session_id));
    assert_eq!(status.flow_id, Some(flow.id));

    recorder
        .add_exchange(exchange("GET", "https://shop.example.com/one", 200))
        .await
        .unwrap();
    recorder
        .add_exchange(exchange("POST", "https://shop.example.com/two", 201))
        .await
        .unwrap();

    let summary = recorder.stop().await.unwrap();
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.requests_recorded, 2);
    assert!(!recorder.status().await.recording);

    let requests = store.list_requests(flow.id).await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].ordinal, 1);
    assert_eq!(requests[1].method, "POST");
}

#[tokio::test]
async fn second_start_conflicts_until_stop() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = recorder(&store);

    let first = recorder.start(Some(flow.id)).await.unwrap();
    match recorder.start(Some(flow.id)).await {
        Err(RecorderError::Conflict { active_session }) => assert_eq!(active_session, first),
        other => panic!("expected conflict, got {other:?}"),
    }
    recorder.stop().await.unwrap();
    recorder.start(Some(flow.id)).await.unwrap();
}

#[tokio::test]
async fn adding_outside_recording_is_rejected() {
    let store = mem_store();
    let recorder = recorder(&store);
    let result = recorder
        .add_exchange(exchange("GET", "https://shop.example.com/one", 200))
        .await;
    assert!(matches!(result, Err(RecorderError::NoActiveSession)));
}

#[tokio::test]
async fn stop_without_session_is_rejected() {
    let store = mem_store();
    let recorder = recorder(&store);
    assert!(matches!(
        recorder.stop().await,
        Err(RecorderError::NoActiveSession)
    ));
}

#[tokio::test]
async fn start_uses_selected_flow_when_none_given() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = recorder(&store);

    assert!(matches!(
        recorder.start(None).await,
        Err(RecorderError::NoFlowSelected)
    ));
    recorder.select_flow(flow.id).await;
    recorder.start(None).await.unwrap();
    assert_eq!(recorder.status().await.flow_id, Some(flow.id));
}

#[tokio::test]
async fn malformed_exchanges_are_rejected() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = recorder(&store);
    recorder.start(Some(flow.id)).await.unwrap();

    for bad in [
        exchange("YEET", "https://shop.example.com/one", 200),
        exchange("GET", "not a url", 200),
        exchange("GET", "https://shop.example.com/one", 99),
        exchange("GET", "https://shop.example.com/one", 600),
    ] {
        assert!(matches!(
            recorder.add_exchange(bad).await,
            Err(RecorderError::Validation { .. })
        ));
    }
    // Nothing was appended.
    assert_eq!(store.list_requests(flow.id).await.unwrap().len(), 0);
}

#[tokio::test]
async fn import_validates_everything_before_appending() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = recorder(&store);

    let result = recorder
        .import(
            flow.id,
            vec![
                exchange("GET", "https://shop.example.com/ok", 200),
                exchange("GET", "broken url", 200),
            ],
        )
        .await;
    assert!(result.is_err());
    // All-or-nothing: the valid exchange was not appended either.
    assert_eq!(store.list_requests(flow.id).await.unwrap().len(), 0);

    let imported = recorder
        .import(
            flow.id,
            vec![
                exchange("POST", "https://shop.example.com/start", 200),
                exchange("POST", "https://shop.example.com/pay", 200),
            ],
        )
        .await
        .unwrap();
    assert_eq!(imported.len(), 2);
    assert_eq!(imported[0].ordinal, 1);
    assert_eq!(imported[1].ordinal, 2);
}

#[tokio::test]
async fn oversized_bodies_are_clipped() {
    let store = mem_store();
    let flow = flow("shop.example.com");
    store.create_flow(&flow).await.unwrap();
    let recorder = Recorder::new(Arc::clone(&store), 8);
    recorder.start(Some(flow.id)).await.unwrap();

    let mut big = exchange("POST", "https://shop.example.com/upload", 200);
    big.body = Some("0123456789abcdef".to_string());
    let recorded = recorder.add_exchange(big).await.unwrap();
    assert_eq!(recorded.body.as_deref().map(<[u8]>::len), Some(8));
}
