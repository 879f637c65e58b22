//! The mutation rule catalog.
//!
//! Rules are data, not code: the catalog is a versioned serde document the
//! control plane can read and replace at runtime. Each rule names a site
//! selector, a transform family with its concrete payloads, and an
//! applicability gate. The derivation engine in the parent module expands
//! rules against a request into concrete [`Mutation`](crate::model::Mutation)
//! records.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::MutationCategory;

/// Which sites of a request a rule targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorSpec {
    /// Every query parameter of the URL.
    EveryQueryParam,
    /// Every query parameter whose value parses as a number.
    EveryNumericQueryParam,
    /// Every scalar field of a JSON body.
    EveryJsonField,
    /// Every numeric field of a JSON body.
    EveryNumericJsonField,
    /// Every string field of a JSON body.
    EveryStringJsonField,
    /// Every field of a form-urlencoded body.
    EveryFormField,
    /// The request's authentication material (`Authorization`, else `Cookie`).
    AuthMaterial,
    /// The request envelope as a whole.
    Envelope,
}

/// One claim rewrite applied by a token-tamper rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClaimTamper {
    pub claim: String,
    pub value: Value,
}

/// Transform family with concrete payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TransformSpec {
    SetValue { value: Value },
    Delete,
    Duplicate,
    /// One mutation per coercion target that changes the value's type.
    TypeCoerce,
    /// One mutation per extreme value.
    NumericExtremes { values: Vec<Value> },
    /// One mutation per boundary string.
    StringBoundaries { values: Vec<String> },
    /// One mutation per claim present in the decoded token payload.
    TokenTamper { claims: Vec<ClaimTamper> },
    /// One mutation per identity in the flow's pool.
    SubstituteIdentities,
    SequenceSkip,
    SequenceRepeat,
    SequenceReorder,
}

/// Applicability gate evaluated against the request and its flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applies {
    /// Rule only fires when the request carries auth material.
    #[serde(default)]
    pub requires_auth: bool,
    /// Minimum number of recorded requests in the flow.
    #[serde(default)]
    pub min_flow_requests: u32,
    /// Restrict to these HTTP methods (empty = any).
    #[serde(default)]
    pub methods: Vec<String>,
}

/// One declarative mutation rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRule {
    pub id: String,
    pub category: MutationCategory,
    pub description: String,
    pub selector: SelectorSpec,
    pub transform: TransformSpec,
    #[serde(default)]
    pub applies: Applies,
}

/// The versioned rule catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationCatalog {
    pub version: String,
    pub rules: Vec<MutationRule>,
}

impl MutationCatalog {
    /// Reject catalogs that would break derivation determinism.
    pub fn validate(&self) -> Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("catalog version must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err("rule id must not be empty".to_string());
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(format!("duplicate rule id: {}", rule.id));
            }
            let is_sequence_transform = matches!(
                rule.transform,
                TransformSpec::SequenceSkip
                    | TransformSpec::SequenceRepeat
                    | TransformSpec::SequenceReorder
            );
            if is_sequence_transform && rule.category != MutationCategory::Sequence {
                return Err(format!(
                    "rule {} uses a sequence transform outside the sequence category",
                    rule.id
                ));
            }
            if is_sequence_transform && rule.applies.min_flow_requests < 2 {
                return Err(format!(
                    "sequence rule {} must require at least 2 flow requests",
                    rule.id
                ));
            }
        }
        Ok(())
    }
}

impl Default for MutationCatalog {
    /// The catalog shipped with the engine. Rule order is derivation order.
    fn default() -> Self {
        let auth_only = Applies {
            requires_auth: true,
            ..Applies::default()
        };
        let seq = Applies {
            min_flow_requests: 2,
            ..Applies::default()
        };
        Self {
            version: "builtin-1".to_string(),
            rules: vec![
                MutationRule {
                    id: "param-extreme-json".to_string(),
                    category: MutationCategory::Parameter,
                    description: "numeric extremes in JSON body fields".to_string(),
                    selector: SelectorSpec::EveryNumericJsonField,
                    transform: TransformSpec::NumericExtremes {
                        values: vec![json!(-1), json!(0), json!(i64::MAX)],
                    },
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "param-extreme-query".to_string(),
                    category: MutationCategory::Parameter,
                    description: "numeric extremes in query parameters".to_string(),
                    selector: SelectorSpec::EveryNumericQueryParam,
                    transform: TransformSpec::NumericExtremes {
                        values: vec![json!(-1), json!(0), json!(i64::MAX)],
                    },
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "param-delete-query".to_string(),
                    category: MutationCategory::Parameter,
                    description: "drop each query parameter".to_string(),
                    selector: SelectorSpec::EveryQueryParam,
                    transform: TransformSpec::Delete,
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "param-duplicate-query".to_string(),
                    category: MutationCategory::Parameter,
                    description: "duplicate each query parameter".to_string(),
                    selector: SelectorSpec::EveryQueryParam,
                    transform: TransformSpec::Duplicate,
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "param-coerce-json".to_string(),
                    category: MutationCategory::Parameter,
                    description: "type coercion of JSON body fields".to_string(),
                    selector: SelectorSpec::EveryJsonField,
                    transform: TransformSpec::TypeCoerce,
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "string-boundary-json".to_string(),
                    category: MutationCategory::String,
                    description: "string boundaries in JSON body fields".to_string(),
                    selector: SelectorSpec::EveryStringJsonField,
                    transform: TransformSpec::StringBoundaries {
                        values: default_boundary_strings(),
                    },
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "string-boundary-query".to_string(),
                    category: MutationCategory::String,
                    description: "string boundaries in query parameters".to_string(),
                    selector: SelectorSpec::EveryQueryParam,
                    transform: TransformSpec::StringBoundaries {
                        values: default_boundary_strings(),
                    },
                    applies: Applies::default(),
                },
                MutationRule {
                    id: "auth-strip".to_string(),
                    category: MutationCategory::Auth,
                    description: "remove authentication material entirely".to_string(),
                    selector: SelectorSpec::AuthMaterial,
                    transform: TransformSpec::Delete,
                    applies: auth_only.clone(),
                },
                MutationRule {
                    id: "auth-token-tamper".to_string(),
                    category: MutationCategory::Auth,
                    description: "rewrite bearer-token claims without re-signing".to_string(),
                    selector: SelectorSpec::AuthMaterial,
                    transform: TransformSpec::TokenTamper {
                        claims: vec![
                            ClaimTamper {
                                claim: "sub".to_string(),
                                value: json!("1"),
                            },
                            ClaimTamper {
                                claim: "role".to_string(),
                                value: json!("admin"),
                            },
                            ClaimTamper {
                                claim: "admin".to_string(),
                                value: json!(true),
                            },
                        ],
                    },
                    applies: auth_only.clone(),
                },
                MutationRule {
                    id: "auth-substitute-identity".to_string(),
                    category: MutationCategory::Auth,
                    description: "swap in each configured alternate identity".to_string(),
                    selector: SelectorSpec::Envelope,
                    transform: TransformSpec::SubstituteIdentities,
                    applies: auth_only,
                },
                MutationRule {
                    id: "seq-skip".to_string(),
                    category: MutationCategory::Sequence,
                    description: "skip this step and probe the next".to_string(),
                    selector: SelectorSpec::Envelope,
                    transform: TransformSpec::SequenceSkip,
                    applies: seq.clone(),
                },
                MutationRule {
                    id: "seq-repeat".to_string(),
                    category: MutationCategory::Sequence,
                    description: "replay this step twice".to_string(),
                    selector: SelectorSpec::Envelope,
                    transform: TransformSpec::SequenceRepeat,
                    applies: seq.clone(),
                },
                MutationRule {
                    id: "seq-reorder".to_string(),
                    category: MutationCategory::Sequence,
                    description: "run this step before its predecessor".to_string(),
                    selector: SelectorSpec::Envelope,
                    transform: TransformSpec::SequenceReorder,
                    applies: seq,
                },
            ],
        }
    }
}

fn default_boundary_strings() -> Vec<String> {
    vec![
        String::new(),
        "A".repeat(4096),
        "\u{1F600}\u{200B}\u{202E}test".to_string(),
        "\u{0000}\u{0001}\u{001B}".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = MutationCatalog::default();
        catalog.validate().expect("builtin catalog must validate");
        assert!(catalog.rules.len() >= 10);
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let mut catalog = MutationCatalog::default();
        let first = catalog.rules[0].clone();
        catalog.rules.push(first);
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn catalog_round_trips_through_json() {
        let catalog = MutationCatalog::default();
        let text = serde_json::to_string(&catalog).unwrap();
        let back: MutationCatalog = serde_json::from_str(&text).unwrap();
        assert_eq!(catalog, back);
    }
}
