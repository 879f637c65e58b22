use flowprobe::model::Mutation;
use flowprobe::mutator::{self, MutationCatalog};
use flowprobe::store::Store;
use serde_json::json;

mod common;
use common::*;

#[tokio::test]
async fn regeneration_is_idempotent_through_the_store() {
    let store = mem_store();
    let mut flow = flow("shop.example.com");
    flow.identity_pool = vec![flowprobe::model::Identity {
        label: "other-tenant".into(),
        header: "Authorization".into(),
        value: "Bearer tenant2".into(),
    }];
    store.create_flow(&flow).await.unwrap();

    let mut login = request(flow.id, 0, "POST", "https://shop.example.com/login");
    store.append_request(&mut login).await.unwrap();
    let mut cart = request(
        flow.id,
        0,
        "POST",
        "https://shop.example.com/cart/add?coupon=SAVE10",
    );
    cart.headers = headers(&[
        ("Content-Type", "application/json"),
        ("Authorization", &bearer_jwt(&json!({"sub": "42", "role": "user"}))),
    ]);
    cart.body = Some(serde_json::to_vec(&json!({"price": 19.99, "qty": 1})).unwrap());
    store.append_request(&mut cart).await.unwrap();

    let requests = store.list_requests(flow.id).await.unwrap();
    let catalog = MutationCatalog::default();
    let first = mutator::derive_for_flow(&flow, &requests, &catalog);
    assert!(!first.is_empty());
    let inserted = store.insert_test_cases(flow.id, &first).await.unwrap();
    assert_eq!(inserted, first.len() as u64);

    // Same request + same catalog version: the second run inserts nothing.
    let second = mutator::derive_for_flow(&flow, &requests, &catalog);
    let first_mutations: Vec<&Mutation> = first.iter().map(|tc| &tc.mutation).collect();
    let second_mutations: Vec<&Mutation> = second.iter().map(|tc| &tc.mutation).collect();
    assert_eq!(first_mutations, second_mutations);
    assert_eq!(store.insert_test_cases(flow.id, &second).await.unwrap(), 0);
    assert_eq!(
        store.list_test_cases_for_flow(flow.id).await.unwrap().len(),
        first.len()
    );
}

#[tokio::test]
async fn derived_set_spans_the_expected_categories() {
    let store = mem_store();
    let mut flow = flow("shop.example.com");
    flow.identity_pool = vec![flowprobe::model::Identity {
        label: "admin-candidate".into(),
        header: "Authorization".into(),
        value: "Bearer admin".into(),
    }];
    store.create_flow(&flow).await.unwrap();

    let mut start = request(flow.id, 0, "POST", "https://shop.example.com/checkout/start");
    store.append_request(&mut start).await.unwrap();
    let mut pay = request(flow.id, 0, "POST", "https://shop.example.com/checkout/pay");
    pay.headers = headers(&[
        ("Content-Type", "application/json"),
        ("Authorization", &bearer_jwt(&json!({"sub": "42"}))),
    ]);
    pay.body = Some(serde_json::to_vec(&json!({"amount": 100, "currency": "EUR"})).unwrap());
    store.append_request(&mut pay).await.unwrap();

    let requests = store.list_requests(flow.id).await.unwrap();
    let cases = mutator::derive_for_flow(&flow, &requests, &MutationCatalog::default());

    use flowprobe::types::MutationCategory;
    for category in [
        MutationCategory::String,
        MutationCategory::Auth,
        MutationCategory::Parameter,
        MutationCategory::Sequence,
    ] {
        assert!(
            cases.iter().any(|tc| tc.category == category),
            "expected at least one {category} case"
        );
    }
    // Every case carries the catalog version for later interpretation.
    assert!(cases.iter().all(|tc| tc.catalog_version == "builtin-1"));
}
