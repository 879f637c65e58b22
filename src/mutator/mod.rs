//! Test-case derivation: expand the rule catalog against recorded
//! requests into declarative mutations.
//!
//! Derivation is deterministic: for a given request and catalog version
//! the emitted set of mutation records is always the same (ids are
//! assigned fresh, but the store de-duplicates on the record itself, so
//! re-generation is idempotent). Sites are enumerated in stable order:
//! query parameters in URL order, JSON fields in sorted-pointer order,
//! rules in catalog order.

mod apply;
pub mod catalog;

pub use apply::{MaterializedRequest, materialize};
pub use catalog::{
    Applies, ClaimTamper, MutationCatalog, MutationRule, SelectorSpec, TransformSpec,
};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    CoerceTarget, Flow, Mutation, RecordedRequest, TargetSelector, TestCase, Transform,
};

/// Errors from derivation and materialization.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MutatorError {
    /// The mutation does not apply to this request.
    #[error("mutation not applicable: {what}")]
    #[diagnostic(code(flowprobe::mutator::not_applicable))]
    NotApplicable { what: String },

    /// Request body could not be interpreted.
    #[error("body error: {message}")]
    #[diagnostic(code(flowprobe::mutator::body))]
    Body { message: String },

    /// The referenced identity is not in the flow's pool.
    #[error("unknown identity: {label}")]
    #[diagnostic(
        code(flowprobe::mutator::unknown_identity),
        help("Add the identity to the flow's identity pool first.")
    )]
    UnknownIdentity { label: String },

    /// Catalog failed validation.
    #[error("invalid catalog: {message}")]
    #[diagnostic(code(flowprobe::mutator::invalid_catalog))]
    InvalidCatalog { message: String },
}

/// Derive the full test-case set for one request.
///
/// `flow_requests` is the flow's complete request list in ordinal order;
/// sequence rules consult it for neighbors.
#[must_use]
pub fn derive_for_request(
    flow: &Flow,
    flow_requests: &[RecordedRequest],
    request: &RecordedRequest,
    catalog: &MutationCatalog,
) -> Vec<TestCase> {
    let mut cases = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for rule in &catalog.rules {
        if !rule_applies(rule, flow_requests, request) {
            continue;
        }
        for (mutation, description) in expand_rule(rule, flow, flow_requests, request) {
            let key = serde_json::to_string(&mutation).unwrap_or_default();
            if !seen.insert(key) {
                continue;
            }
            cases.push(TestCase {
                id: Uuid::new_v4(),
                request_id: request.id,
                category: rule.category,
                rule_id: rule.id.clone(),
                description,
                mutation,
                catalog_version: catalog.version.clone(),
                created_at: Utc::now(),
            });
        }
    }
    cases
}

/// Derive test cases for every request of a flow.
#[must_use]
pub fn derive_for_flow(
    flow: &Flow,
    flow_requests: &[RecordedRequest],
    catalog: &MutationCatalog,
) -> Vec<TestCase> {
    flow_requests
        .iter()
        .flat_map(|request| derive_for_request(flow, flow_requests, request, catalog))
        .collect()
}

fn rule_applies(
    rule: &MutationRule,
    flow_requests: &[RecordedRequest],
    request: &RecordedRequest,
) -> bool {
    if rule.applies.requires_auth && !request.carries_auth() {
        return false;
    }
    if (flow_requests.len() as u32) < rule.applies.min_flow_requests {
        return false;
    }
    if !rule.applies.methods.is_empty()
        && !rule
            .applies
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&request.method))
    {
        return false;
    }
    true
}

fn expand_rule(
    rule: &MutationRule,
    flow: &Flow,
    flow_requests: &[RecordedRequest],
    request: &RecordedRequest,
) -> Vec<(Mutation, String)> {
    match &rule.selector {
        SelectorSpec::EveryQueryParam => query_params(request)
            .into_iter()
            .flat_map(|(name, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::QueryParam { name: name.clone() },
                    &Value::String(value),
                    &format!("query param '{name}'"),
                )
            })
            .collect(),
        SelectorSpec::EveryNumericQueryParam => query_params(request)
            .into_iter()
            .filter(|(_, value)| value.parse::<f64>().is_ok())
            .flat_map(|(name, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::QueryParam { name: name.clone() },
                    &Value::String(value),
                    &format!("query param '{name}'"),
                )
            })
            .collect(),
        SelectorSpec::EveryJsonField => json_scalar_fields(request)
            .into_iter()
            .flat_map(|(pointer, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::JsonBodyField {
                        pointer: pointer.clone(),
                    },
                    &value,
                    &format!("body field '{pointer}'"),
                )
            })
            .collect(),
        SelectorSpec::EveryNumericJsonField => json_scalar_fields(request)
            .into_iter()
            .filter(|(_, value)| value.is_number())
            .flat_map(|(pointer, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::JsonBodyField {
                        pointer: pointer.clone(),
                    },
                    &value,
                    &format!("body field '{pointer}'"),
                )
            })
            .collect(),
        SelectorSpec::EveryStringJsonField => json_scalar_fields(request)
            .into_iter()
            .filter(|(_, value)| value.is_string())
            .flat_map(|(pointer, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::JsonBodyField {
                        pointer: pointer.clone(),
                    },
                    &value,
                    &format!("body field '{pointer}'"),
                )
            })
            .collect(),
        SelectorSpec::EveryFormField => form_fields(request)
            .into_iter()
            .flat_map(|(name, value)| {
                expand_value_transforms(
                    &rule.transform,
                    TargetSelector::FormField { name: name.clone() },
                    &Value::String(value),
                    &format!("form field '{name}'"),
                )
            })
            .collect(),
        SelectorSpec::AuthMaterial => expand_auth(rule, request),
        SelectorSpec::Envelope => expand_envelope(rule, flow, flow_requests, request),
    }
}

/// Expand value-shaped transform families against one concrete site.
fn expand_value_transforms(
    transform: &TransformSpec,
    selector: TargetSelector,
    current: &Value,
    site_label: &str,
) -> Vec<(Mutation, String)> {
    match transform {
        TransformSpec::SetValue { value } => vec![(
            Mutation {
                selector,
                transform: Transform::SetValue {
                    value: value.clone(),
                },
            },
            format!("set {site_label} to {value}"),
        )],
        TransformSpec::Delete => vec![(
            Mutation {
                selector,
                transform: Transform::Delete,
            },
            format!("delete {site_label}"),
        )],
        TransformSpec::Duplicate => vec![(
            Mutation {
                selector,
                transform: Transform::Duplicate,
            },
            format!("duplicate {site_label}"),
        )],
        TransformSpec::NumericExtremes { values } => values
            .iter()
            .map(|value| {
                (
                    Mutation {
                        selector: selector.clone(),
                        transform: Transform::NumericExtreme {
                            value: value.clone(),
                        },
                    },
                    format!("set {site_label} to extreme {value}"),
                )
            })
            .collect(),
        TransformSpec::StringBoundaries { values } => values
            .iter()
            .map(|value| {
                (
                    Mutation {
                        selector: selector.clone(),
                        transform: Transform::StringBoundary {
                            value: value.clone(),
                        },
                    },
                    format!("boundary string ({} chars) in {site_label}", value.len()),
                )
            })
            .collect(),
        TransformSpec::TypeCoerce => [
            CoerceTarget::Null,
            CoerceTarget::String,
            CoerceTarget::Number,
            CoerceTarget::Bool,
        ]
        .into_iter()
        .filter(|target| apply::coerce(current, *target).is_some())
        .map(|target| {
            (
                Mutation {
                    selector: selector.clone(),
                    transform: Transform::TypeCoerce { target },
                },
                format!("coerce {site_label} to {target:?}"),
            )
        })
        .collect(),
        // Token, identity, and sequence families are handled by their
        // dedicated selectors.
        _ => Vec::new(),
    }
}

fn expand_auth(rule: &MutationRule, request: &RecordedRequest) -> Vec<(Mutation, String)> {
    let header = if request.header("authorization").is_some() {
        "Authorization"
    } else if request.header("cookie").is_some() {
        "Cookie"
    } else {
        return Vec::new();
    };
    match &rule.transform {
        TransformSpec::Delete => vec![(
            Mutation {
                selector: TargetSelector::Header {
                    name: header.to_string(),
                },
                transform: Transform::Delete,
            },
            format!("strip {header} header"),
        )],
        TransformSpec::TokenTamper { claims } => {
            // Only bearer JWTs with a decodable object payload are tamperable.
            let Some(value) = request.header("authorization") else {
                return Vec::new();
            };
            let token = value
                .split_once(' ')
                .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
                .map_or(value, |(_, t)| t);
            let Some(payload) = apply::decode_jwt_payload(token) else {
                return Vec::new();
            };
            let Some(object) = payload.as_object() else {
                return Vec::new();
            };
            claims
                .iter()
                .filter(|tamper| object.contains_key(&tamper.claim))
                .map(|tamper| {
                    (
                        Mutation {
                            selector: TargetSelector::Header {
                                name: "Authorization".to_string(),
                            },
                            transform: Transform::TokenTamper {
                                claim: tamper.claim.clone(),
                                value: tamper.value.clone(),
                            },
                        },
                        format!("tamper token claim '{}'", tamper.claim),
                    )
                })
                .collect()
        }
        TransformSpec::StringBoundaries { values } => values
            .iter()
            .map(|value| {
                (
                    Mutation {
                        selector: TargetSelector::Header {
                            name: header.to_string(),
                        },
                        transform: Transform::StringBoundary {
                            value: value.clone(),
                        },
                    },
                    format!("boundary string in {header} header"),
                )
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn expand_envelope(
    rule: &MutationRule,
    flow: &Flow,
    flow_requests: &[RecordedRequest],
    request: &RecordedRequest,
) -> Vec<(Mutation, String)> {
    match &rule.transform {
        TransformSpec::SubstituteIdentities => flow
            .identity_pool
            .iter()
            .map(|identity| {
                (
                    Mutation {
                        selector: TargetSelector::Envelope,
                        transform: Transform::SubstituteIdentity {
                            identity_label: identity.label.clone(),
                        },
                    },
                    format!("substitute identity '{}'", identity.label),
                )
            })
            .collect(),
        TransformSpec::SequenceSkip => {
            let has_successor = flow_requests.iter().any(|r| r.ordinal > request.ordinal);
            if has_successor {
                vec![(
                    Mutation {
                        selector: TargetSelector::Envelope,
                        transform: Transform::SequenceSkip,
                    },
                    format!("skip step {} and probe the next", request.ordinal),
                )]
            } else {
                Vec::new()
            }
        }
        TransformSpec::SequenceRepeat => vec![(
            Mutation {
                selector: TargetSelector::Envelope,
                transform: Transform::SequenceRepeat,
            },
            format!("repeat step {}", request.ordinal),
        )],
        TransformSpec::SequenceReorder => {
            if request.ordinal >= 2 {
                vec![(
                    Mutation {
                        selector: TargetSelector::Envelope,
                        transform: Transform::SequenceReorder,
                    },
                    format!("run step {} before its predecessor", request.ordinal),
                )]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn query_params(request: &RecordedRequest) -> Vec<(String, String)> {
    let Ok(parsed) = url::Url::parse(&request.url) else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    parsed
        .query_pairs()
        .filter(|(name, _)| seen.insert(name.to_string()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// Scalar fields of a JSON body as `(pointer, value)` pairs, in sorted
/// document order (serde_json maps iterate sorted by key).
fn json_scalar_fields(request: &RecordedRequest) -> Vec<(String, Value)> {
    let Some(body) = request.body.as_deref() else {
        return Vec::new();
    };
    let Ok(doc) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let mut fields = Vec::new();
    collect_scalars(&doc, String::new(), &mut fields);
    fields
}

fn collect_scalars(value: &Value, pointer: String, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_scalars(child, format!("{pointer}/{escaped}"), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_scalars(child, format!("{pointer}/{index}"), out);
            }
        }
        scalar => {
            if !pointer.is_empty() {
                out.push((pointer, scalar.clone()));
            }
        }
    }
}

fn form_fields(request: &RecordedRequest) -> Vec<(String, String)> {
    let is_form = request
        .header("content-type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return Vec::new();
    }
    let Some(body) = request.body.as_deref() else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    url::form_urlencoded::parse(body)
        .filter(|(name, _)| seen.insert(name.to_string()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rustc_hash::FxHashMap;
    use serde_json::json;

    fn flow_with_pool(pool: Vec<Identity>) -> Flow {
        let mut flow = Flow::new("checkout", "shop.example.com");
        flow.identity_pool = pool;
        flow
    }

    fn bearer_request(ordinal: u32, claims: Value) -> RecordedRequest {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let mut headers = FxHashMap::default();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer hdr.{payload}.sig"),
        );
        RecordedRequest {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            ordinal,
            method: "GET".into(),
            url: "https://shop.example.com/profile?verbose=1".into(),
            headers,
            body: None,
            captured_status: 200,
            captured_headers: FxHashMap::default(),
            captured_body: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let flow = flow_with_pool(vec![]);
        let request = bearer_request(1, json!({"sub": "42", "role": "user"}));
        let requests = vec![request.clone()];
        let catalog = MutationCatalog::default();
        let first: Vec<Mutation> = derive_for_request(&flow, &requests, &request, &catalog)
            .into_iter()
            .map(|tc| tc.mutation)
            .collect();
        let second: Vec<Mutation> = derive_for_request(&flow, &requests, &request, &catalog)
            .into_iter()
            .map(|tc| tc.mutation)
            .collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn token_tamper_only_targets_present_claims() {
        let flow = flow_with_pool(vec![]);
        let request = bearer_request(1, json!({"sub": "42"}));
        let requests = vec![request.clone()];
        let catalog = MutationCatalog::default();
        let cases = derive_for_request(&flow, &requests, &request, &catalog);
        let tampered: Vec<_> = cases
            .iter()
            .filter(|tc| matches!(tc.mutation.transform, Transform::TokenTamper { .. }))
            .collect();
        // The builtin catalog tampers sub/role/admin; only `sub` exists here.
        assert_eq!(tampered.len(), 1);
        assert!(tampered[0].description.contains("sub"));
    }

    #[test]
    fn sequence_rules_need_two_requests() {
        let flow = flow_with_pool(vec![]);
        let request = bearer_request(1, json!({"sub": "1"}));
        let catalog = MutationCatalog::default();
        let solo = derive_for_request(&flow, &[request.clone()], &request, &catalog);
        assert!(
            solo.iter()
                .all(|tc| tc.category != crate::types::MutationCategory::Sequence)
        );

        let second = bearer_request(2, json!({"sub": "1"}));
        let both = vec![request.clone(), second];
        let with_seq = derive_for_request(&flow, &both, &request, &catalog);
        assert!(
            with_seq
                .iter()
                .any(|tc| matches!(tc.mutation.transform, Transform::SequenceSkip))
        );
        // Ordinal 1 has no predecessor, so no reorder case.
        assert!(
            !with_seq
                .iter()
                .any(|tc| matches!(tc.mutation.transform, Transform::SequenceReorder))
        );
    }

    #[test]
    fn identity_pool_drives_substitution_cases() {
        let flow = flow_with_pool(vec![
            Identity {
                label: "admin-candidate".into(),
                header: "Authorization".into(),
                value: "Bearer admin".into(),
            },
            Identity {
                label: "other-tenant".into(),
                header: "Authorization".into(),
                value: "Bearer tenant2".into(),
            },
        ]);
        let request = bearer_request(1, json!({"sub": "1"}));
        let requests = vec![request.clone()];
        let catalog = MutationCatalog::default();
        let cases = derive_for_request(&flow, &requests, &request, &catalog);
        let substitutions: Vec<_> = cases
            .iter()
            .filter(|tc| matches!(tc.mutation.transform, Transform::SubstituteIdentity { .. }))
            .collect();
        assert_eq!(substitutions.len(), 2);
    }

    #[test]
    fn unauthenticated_requests_get_no_auth_cases() {
        let flow = flow_with_pool(vec![]);
        let mut request = bearer_request(1, json!({"sub": "1"}));
        request.headers.clear();
        let requests = vec![request.clone()];
        let catalog = MutationCatalog::default();
        let cases = derive_for_request(&flow, &requests, &request, &catalog);
        assert!(
            cases
                .iter()
                .all(|tc| tc.category != crate::types::MutationCategory::Auth)
        );
    }
}
