//! Materialization: turn `(RecordedRequest, Mutation)` into the concrete
//! HTTP request the replayer sends.
//!
//! Materialization is deterministic and total over the mutations the
//! derivation engine emits: the engine only generates mutations it has
//! verified to be applicable to the baseline, so failures here indicate a
//! catalog/baseline mismatch and surface as [`MutatorError`].

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::model::{
    CoerceTarget, Identity, Mutation, RecordedRequest, TargetSelector, Transform,
};

use super::MutatorError;

/// A fully materialized HTTP request, ready for the replay client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedRequest {
    pub method: String,
    pub url: String,
    pub headers: FxHashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl MaterializedRequest {
    /// The unmodified baseline request.
    #[must_use]
    pub fn baseline(request: &RecordedRequest) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }
}

/// Produce the mutated request for a test case.
///
/// Sequence transforms return the baseline unchanged; the replayer
/// resolves them against the whole flow's replay plan instead.
pub fn materialize(
    request: &RecordedRequest,
    mutation: &Mutation,
    identity_pool: &[Identity],
) -> Result<MaterializedRequest, MutatorError> {
    let mut out = MaterializedRequest::baseline(request);
    match (&mutation.selector, &mutation.transform) {
        // Sequence operations do not change the request itself.
        (
            _,
            Transform::SequenceSkip | Transform::SequenceRepeat | Transform::SequenceReorder,
        ) => Ok(out),

        (TargetSelector::Envelope, Transform::SubstituteIdentity { identity_label }) => {
            let identity = identity_pool
                .iter()
                .find(|i| i.label == *identity_label)
                .ok_or_else(|| MutatorError::UnknownIdentity {
                    label: identity_label.clone(),
                })?;
            remove_header(&mut out.headers, "authorization");
            remove_header(&mut out.headers, "cookie");
            out.headers
                .insert(identity.header.clone(), identity.value.clone());
            Ok(out)
        }

        (TargetSelector::Header { name }, transform) => {
            apply_header(&mut out, name, transform)?;
            Ok(out)
        }

        (TargetSelector::QueryParam { name }, transform) => {
            out.url = apply_query(&out.url, name, transform)?;
            Ok(out)
        }

        (TargetSelector::PathSegment { index }, transform) => {
            out.url = apply_path_segment(&out.url, *index, transform)?;
            Ok(out)
        }

        (TargetSelector::JsonBodyField { pointer }, transform) => {
            out.body = Some(apply_json_field(out.body.as_deref(), pointer, transform)?);
            Ok(out)
        }

        (TargetSelector::FormField { name }, transform) => {
            out.body = Some(apply_form_field(out.body.as_deref(), name, transform)?);
            Ok(out)
        }

        (selector, transform) => Err(MutatorError::NotApplicable {
            what: format!("{selector:?} does not accept {transform:?}"),
        }),
    }
}

fn remove_header(headers: &mut FxHashMap<String, String>, name: &str) {
    headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
}

fn header_value(headers: &FxHashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn value_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_header(
    out: &mut MaterializedRequest,
    name: &str,
    transform: &Transform,
) -> Result<(), MutatorError> {
    match transform {
        Transform::Delete => {
            remove_header(&mut out.headers, name);
            Ok(())
        }
        Transform::SetValue { value } | Transform::NumericExtreme { value } => {
            remove_header(&mut out.headers, name);
            out.headers.insert(name.to_string(), value_as_str(value));
            Ok(())
        }
        Transform::TokenTamper { claim, value } => {
            let current =
                header_value(&out.headers, name).ok_or_else(|| MutatorError::NotApplicable {
                    what: format!("header {name} is absent"),
                })?;
            let tampered = tamper_bearer(&current, claim, value)?;
            remove_header(&mut out.headers, name);
            out.headers.insert(name.to_string(), tampered);
            Ok(())
        }
        Transform::StringBoundary { value } => {
            remove_header(&mut out.headers, name);
            out.headers.insert(name.to_string(), value.clone());
            Ok(())
        }
        other => Err(MutatorError::NotApplicable {
            what: format!("header transform {other:?}"),
        }),
    }
}

/// Rewrite one claim of a `Bearer <jwt>` header value, keeping the header
/// segment and replacing the signature with garbage so only a server that
/// skips verification accepts it.
fn tamper_bearer(value: &str, claim: &str, new_value: &Value) -> Result<String, MutatorError> {
    let (prefix, token) = match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => ("Bearer ", token),
        _ => ("", value),
    };
    let mut payload = decode_jwt_payload(token).ok_or_else(|| MutatorError::NotApplicable {
        what: "token is not a decodable JWT".to_string(),
    })?;
    let Some(object) = payload.as_object_mut() else {
        return Err(MutatorError::NotApplicable {
            what: "JWT payload is not an object".to_string(),
        });
    };
    object.insert(claim.to_string(), new_value.clone());
    let header_segment = token.split('.').next().unwrap_or_default();
    let encoded = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&payload).map_err(|e| MutatorError::Body {
            message: format!("re-encode payload: {e}"),
        })?,
    );
    Ok(format!("{prefix}{header_segment}.{encoded}.tampered"))
}

/// Decode the payload segment of a JWT-shaped token.
pub(crate) fn decode_jwt_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let _signature = parts.next()?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn apply_query(url: &str, name: &str, transform: &Transform) -> Result<String, MutatorError> {
    let mut parsed = url::Url::parse(url).map_err(|e| MutatorError::Body {
        message: format!("invalid url {url}: {e}"),
    })?;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut rebuilt: Vec<(String, String)> = Vec::with_capacity(pairs.len() + 1);
    let mut touched = false;
    for (k, v) in pairs {
        if k == name {
            touched = true;
            match transform {
                Transform::Delete => {}
                Transform::Duplicate => {
                    rebuilt.push((k.clone(), v.clone()));
                    rebuilt.push((k, v));
                }
                Transform::SetValue { value } | Transform::NumericExtreme { value } => {
                    rebuilt.push((k, value_as_str(value)));
                }
                Transform::StringBoundary { value } => {
                    rebuilt.push((k, value.clone()));
                }
                Transform::TypeCoerce { target } => {
                    let coerced = coerce(&Value::String(v.clone()), *target).ok_or_else(|| {
                        MutatorError::NotApplicable {
                            what: format!("cannot coerce query param {name}"),
                        }
                    })?;
                    rebuilt.push((k, value_as_str(&coerced)));
                }
                other => {
                    return Err(MutatorError::NotApplicable {
                        what: format!("query transform {other:?}"),
                    });
                }
            }
        } else {
            rebuilt.push((k, v));
        }
    }
    if !touched {
        return Err(MutatorError::NotApplicable {
            what: format!("query param {name} is absent"),
        });
    }
    if rebuilt.is_empty() {
        parsed.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &rebuilt {
            serializer.append_pair(k, v);
        }
        parsed.set_query(Some(&serializer.finish()));
    }
    Ok(parsed.to_string())
}

fn apply_path_segment(
    url: &str,
    index: usize,
    transform: &Transform,
) -> Result<String, MutatorError> {
    let mut parsed = url::Url::parse(url).map_err(|e| MutatorError::Body {
        message: format!("invalid url {url}: {e}"),
    })?;
    let mut segments: Vec<String> = parsed
        .path_segments()
        .map(|s| s.map(str::to_string).collect())
        .unwrap_or_default();
    if index >= segments.len() {
        return Err(MutatorError::NotApplicable {
            what: format!("path segment {index} is out of range"),
        });
    }
    match transform {
        Transform::Delete => {
            segments.remove(index);
        }
        Transform::Duplicate => {
            let seg = segments[index].clone();
            segments.insert(index, seg);
        }
        Transform::SetValue { value } | Transform::NumericExtreme { value } => {
            segments[index] = value_as_str(value);
        }
        Transform::StringBoundary { value } => {
            segments[index] = value.clone();
        }
        other => {
            return Err(MutatorError::NotApplicable {
                what: format!("path transform {other:?}"),
            });
        }
    }
    parsed.set_path(&format!("/{}", segments.join("/")));
    Ok(parsed.to_string())
}

fn apply_json_field(
    body: Option<&[u8]>,
    pointer: &str,
    transform: &Transform,
) -> Result<Vec<u8>, MutatorError> {
    let body = body.ok_or_else(|| MutatorError::Body {
        message: "request has no body".to_string(),
    })?;
    let mut doc: Value = serde_json::from_slice(body).map_err(|e| MutatorError::Body {
        message: format!("body is not JSON: {e}"),
    })?;
    match transform {
        Transform::Delete => {
            remove_pointer(&mut doc, pointer)?;
        }
        Transform::SetValue { value } | Transform::NumericExtreme { value } => {
            let slot = doc
                .pointer_mut(pointer)
                .ok_or_else(|| pointer_missing(pointer))?;
            *slot = value.clone();
        }
        Transform::StringBoundary { value } => {
            let slot = doc
                .pointer_mut(pointer)
                .ok_or_else(|| pointer_missing(pointer))?;
            *slot = Value::String(value.clone());
        }
        Transform::TypeCoerce { target } => {
            let slot = doc
                .pointer_mut(pointer)
                .ok_or_else(|| pointer_missing(pointer))?;
            let coerced = coerce(slot, *target).ok_or_else(|| MutatorError::NotApplicable {
                what: format!("cannot coerce {pointer} to {target:?}"),
            })?;
            *slot = coerced;
        }
        Transform::Duplicate => {
            // Duplicate the field under a doubled key, e.g. {"id":1,"idid":1}.
            let (parent, key) = split_pointer(pointer)?;
            let value = doc
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| pointer_missing(pointer))?;
            let parent_slot = doc
                .pointer_mut(parent)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| pointer_missing(pointer))?;
            parent_slot.insert(format!("{key}{key}"), value);
        }
        other => {
            return Err(MutatorError::NotApplicable {
                what: format!("json transform {other:?}"),
            });
        }
    }
    serde_json::to_vec(&doc).map_err(|e| MutatorError::Body {
        message: format!("re-encode body: {e}"),
    })
}

fn pointer_missing(pointer: &str) -> MutatorError {
    MutatorError::NotApplicable {
        what: format!("json pointer {pointer} is absent"),
    }
}

fn split_pointer(pointer: &str) -> Result<(&str, &str), MutatorError> {
    pointer
        .rsplit_once('/')
        .ok_or_else(|| pointer_missing(pointer))
}

fn remove_pointer(doc: &mut Value, pointer: &str) -> Result<(), MutatorError> {
    let (parent, key) = split_pointer(pointer)?;
    let parent_slot = doc
        .pointer_mut(parent)
        .ok_or_else(|| pointer_missing(pointer))?;
    match parent_slot {
        Value::Object(map) => {
            map.remove(key).ok_or_else(|| pointer_missing(pointer))?;
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = key.parse().map_err(|_| pointer_missing(pointer))?;
            if index >= items.len() {
                return Err(pointer_missing(pointer));
            }
            items.remove(index);
            Ok(())
        }
        _ => Err(pointer_missing(pointer)),
    }
}

fn apply_form_field(
    body: Option<&[u8]>,
    name: &str,
    transform: &Transform,
) -> Result<Vec<u8>, MutatorError> {
    let body = body.ok_or_else(|| MutatorError::Body {
        message: "request has no body".to_string(),
    })?;
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut rebuilt: Vec<(String, String)> = Vec::with_capacity(pairs.len() + 1);
    let mut touched = false;
    for (k, v) in pairs {
        if k == name {
            touched = true;
            match transform {
                Transform::Delete => {}
                Transform::Duplicate => {
                    rebuilt.push((k.clone(), v.clone()));
                    rebuilt.push((k, v));
                }
                Transform::SetValue { value } | Transform::NumericExtreme { value } => {
                    rebuilt.push((k, value_as_str(value)));
                }
                Transform::StringBoundary { value } => {
                    rebuilt.push((k, value.clone()));
                }
                other => {
                    return Err(MutatorError::NotApplicable {
                        what: format!("form transform {other:?}"),
                    });
                }
            }
        } else {
            rebuilt.push((k, v));
        }
    }
    if !touched {
        return Err(MutatorError::NotApplicable {
            what: format!("form field {name} is absent"),
        });
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &rebuilt {
        serializer.append_pair(k, v);
    }
    Ok(serializer.finish().into_bytes())
}

/// Coerce a JSON value to another primitive representation. Returns
/// `None` when the coercion is a no-op or has no sensible result, so the
/// derivation engine only emits type-changing mutations.
pub(crate) fn coerce(value: &Value, target: CoerceTarget) -> Option<Value> {
    match target {
        CoerceTarget::Null => (!value.is_null()).then_some(Value::Null),
        CoerceTarget::String => match value {
            Value::String(_) => None,
            other => Some(Value::String(other.to_string())),
        },
        CoerceTarget::Number => match value {
            Value::Number(_) => None,
            Value::String(s) => s
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                }),
            Value::Bool(b) => Some(Value::Number(i64::from(*b).into())),
            _ => None,
        },
        CoerceTarget::Bool => match value {
            Value::Bool(_) => None,
            Value::String(s) => s.parse::<bool>().ok().map(Value::Bool),
            Value::Number(n) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_body(url: &str, body: Value) -> RecordedRequest {
        RecordedRequest {
            id: uuid::Uuid::new_v4(),
            flow_id: uuid::Uuid::new_v4(),
            ordinal: 1,
            method: "POST".into(),
            url: url.to_string(),
            headers: FxHashMap::default(),
            body: Some(serde_json::to_vec(&body).unwrap()),
            captured_status: 200,
            captured_headers: FxHashMap::default(),
            captured_body: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn json_field_extreme_rewrites_body() {
        let request = request_with_body(
            "https://shop.example.com/cart/add",
            json!({"price": 19.99, "qty": 1}),
        );
        let mutation = Mutation {
            selector: TargetSelector::JsonBodyField {
                pointer: "/price".into(),
            },
            transform: Transform::NumericExtreme { value: json!(-1) },
        };
        let out = materialize(&request, &mutation, &[]).unwrap();
        let body: Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["price"], json!(-1));
        assert_eq!(body["qty"], json!(1));
    }

    #[test]
    fn query_param_delete_drops_only_target() {
        let request = request_with_body("https://api.example.com/items?a=1&b=2", json!({}));
        let mutation = Mutation {
            selector: TargetSelector::QueryParam { name: "a".into() },
            transform: Transform::Delete,
        };
        let out = materialize(&request, &mutation, &[]).unwrap();
        assert!(!out.url.contains("a=1"));
        assert!(out.url.contains("b=2"));
    }

    #[test]
    fn token_tamper_rewrites_claim_and_breaks_signature() {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({"sub": "42"})).unwrap());
        let token = format!("hdr.{payload}.sig");
        let mut headers = FxHashMap::default();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        let mut request = request_with_body("https://api.example.com/me", json!({}));
        request.headers = headers;
        let mutation = Mutation {
            selector: TargetSelector::Header {
                name: "Authorization".into(),
            },
            transform: Transform::TokenTamper {
                claim: "sub".into(),
                value: json!("1"),
            },
        };
        let out = materialize(&request, &mutation, &[]).unwrap();
        let value = out.headers.get("Authorization").unwrap();
        let tampered_token = value.strip_prefix("Bearer ").unwrap();
        assert!(tampered_token.ends_with(".tampered"));
        let decoded = decode_jwt_payload(tampered_token).unwrap();
        assert_eq!(decoded["sub"], json!("1"));
    }

    #[test]
    fn substitute_identity_replaces_auth_material() {
        let mut headers = FxHashMap::default();
        headers.insert("Authorization".to_string(), "Bearer original".to_string());
        let mut request = request_with_body("https://api.example.com/admin", json!({}));
        request.headers = headers;
        let pool = vec![Identity {
            label: "other-user".into(),
            header: "Authorization".into(),
            value: "Bearer other".into(),
        }];
        let mutation = Mutation {
            selector: TargetSelector::Envelope,
            transform: Transform::SubstituteIdentity {
                identity_label: "other-user".into(),
            },
        };
        let out = materialize(&request, &mutation, &pool).unwrap();
        assert_eq!(
            out.headers.get("Authorization").map(String::as_str),
            Some("Bearer other")
        );
    }

    #[test]
    fn coercions_only_change_type() {
        assert_eq!(coerce(&json!("12"), CoerceTarget::Number), Some(json!(12)));
        assert_eq!(coerce(&json!(12), CoerceTarget::Number), None);
        assert_eq!(coerce(&json!(0), CoerceTarget::Bool), Some(json!(false)));
        assert_eq!(coerce(&json!(null), CoerceTarget::Null), None);
    }
}
