//! Entity graph for recorded flows and everything derived from them.
//!
//! The graph is a tree rooted at [`Flow`]: requests belong to a flow, test
//! cases to a request, responses to either side of a baseline/mutant pair,
//! and anomalies to a test case. Child-to-parent references are plain
//! foreign keys; nothing here owns its parent.
//!
//! All entities are plain serde structs. Derivation logic lives in the
//! `mutator`/`analyzer` modules; this module only defines shape.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    AnomalyKind, AnomalyStatus, ErrorKind, ExecutionStatus, MutationCategory, OwnerKind, Severity,
    VulnerabilityType,
};

/// An alternate identity the mutator may substitute into requests when
/// probing for privilege escalation. Configured out-of-band on the flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Human label ("admin-candidate", "other-tenant").
    pub label: String,
    /// Header the credential is carried in, e.g. `Authorization` or `Cookie`.
    pub header: String,
    /// Full header value, e.g. `Bearer eyJ...`.
    pub value: String,
}

/// Container for one testing session: recorded requests, derived test
/// cases, replay results, and anomalies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Domain the flow targets.
    pub target_domain: String,
    /// Alternate identities for privilege-substitution mutations.
    #[serde(default)]
    pub identity_pool: Vec<Identity>,
    /// Per-flow override of the configured confidence threshold.
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Create a flow with fresh id and timestamps.
    #[must_use]
    pub fn new(name: impl Into<String>, target_domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            target_domain: target_domain.into(),
            identity_pool: Vec::new(),
            confidence_threshold: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A captured baseline HTTP exchange, immutable once recorded.
///
/// `ordinal` is a 1-based, per-flow monotonic sequence preserving capture
/// order; sequence mutations anchor on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub ordinal: u32,
    pub method: String,
    pub url: String,
    pub headers: FxHashMap<String, String>,
    /// Opaque request body bytes; `None` for body-less methods.
    pub body: Option<Vec<u8>>,
    /// Status observed at capture time, within `[100, 599]`.
    pub captured_status: u16,
    pub captured_headers: FxHashMap<String, String>,
    pub captured_body: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl RecordedRequest {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the request carries authentication material: an
    /// `Authorization` header or a session cookie.
    #[must_use]
    pub fn carries_auth(&self) -> bool {
        self.header("authorization").is_some() || self.header("cookie").is_some()
    }
}

/// Picks the site inside a request that a transform applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "site", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Zero-based path segment index.
    PathSegment { index: usize },
    QueryParam { name: String },
    Header { name: String },
    /// JSON pointer into the request body, e.g. `/price`.
    JsonBodyField { pointer: String },
    /// `application/x-www-form-urlencoded` body field.
    FormField { name: String },
    /// The whole request; used by sequence and identity operations.
    Envelope,
}

/// The concrete change applied at a selected site.
///
/// Sequence variants are not materialized into a single request; the
/// replayer resolves them against the whole flow's replay context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    SetValue { value: Value },
    Delete,
    Duplicate,
    /// Coerce between string/number/bool/null representations.
    TypeCoerce { target: CoerceTarget },
    NumericExtreme { value: Value },
    StringBoundary { value: String },
    /// Rewrite one claim of a JWT-like token and drop the valid signature.
    TokenTamper { claim: String, value: Value },
    /// Substitute the request's identity material with a pool entry.
    SubstituteIdentity { identity_label: String },
    /// Drop this ordinal from the flow and observe the next request.
    SequenceSkip,
    /// Replay this ordinal twice in a row.
    SequenceRepeat,
    /// Play this ordinal before its predecessor.
    SequenceReorder,
}

/// Target representation for [`Transform::TypeCoerce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoerceTarget {
    String,
    Number,
    Bool,
    Null,
}

/// The structured mutation record stored on a test case.
///
/// A test case never contains a materialized HTTP request; the request is
/// produced deterministically from `(RecordedRequest, Mutation)` at replay
/// time. Equality on this record is the de-duplication key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub selector: TargetSelector,
    pub transform: Transform,
}

/// A declarative mutation of one baseline request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub request_id: Uuid,
    pub category: MutationCategory,
    /// Identifier of the catalog rule that produced this case.
    pub rule_id: String,
    pub description: String,
    pub mutation: Mutation,
    /// Version of the mutation catalog in force at derivation time.
    pub catalog_version: String,
    pub created_at: DateTime<Utc>,
}

/// One observed HTTP response (or transport failure) for a baseline
/// request or a test case.
///
/// Multiple records may exist per owner across re-runs; the latest per
/// `(owner, execution)` is authoritative. `status` is `None` exactly when
/// `error_kind` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: Uuid,
    pub owner_kind: OwnerKind,
    pub owner_id: Uuid,
    pub execution_id: Uuid,
    pub status: Option<u16>,
    pub headers: FxHashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub content_length: u64,
    pub response_time_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub captured_at: DateTime<Utc>,
}

impl ResponseRecord {
    /// Whether the response is a 2xx success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(s) if (200..300).contains(&s))
    }

    /// Body parsed as JSON, if present and decodable.
    #[must_use]
    pub fn body_json(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// A scored, typed diff between a baseline and a mutant response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub test_case_id: Uuid,
    /// Detector signal category that fired.
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Calibrated belief in `[0, 1]` that this indicates a real flaw.
    pub confidence: f64,
    pub is_potential_vulnerability: bool,
    pub vulnerability_type: VulnerabilityType,
    pub original_status: Option<u16>,
    pub replayed_status: Option<u16>,
    pub original_content_length: u64,
    pub replayed_content_length: u64,
    pub description: String,
    pub status: AnomalyStatus,
    /// Version of the detection catalog that produced this anomaly.
    pub catalog_version: String,
    pub created_at: DateTime<Utc>,
}

/// Progress ledger for one replay execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Total baseline/mutant pairs scheduled.
    pub total: u64,
    /// Pairs completed without transport failure.
    pub done: u64,
    /// Requests that ended in a transport failure, baseline transcript
    /// entries included.
    pub failed: u64,
    pub status: ExecutionStatus,
}

impl ExecutionState {
    /// Start a fresh running execution over `total` pairs.
    #[must_use]
    pub fn begin(flow_id: Uuid, total: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            started_at: Utc::now(),
            finished_at: None,
            total,
            done: 0,
            failed: 0,
            status: ExecutionStatus::Running,
        }
    }

    /// Pairs not yet attempted.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.done + self.failed)
    }
}

/// A captured exchange presented to the recorder by an importer.
///
/// The recorder validates shape and appends; it never intercepts traffic
/// itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: FxHashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub response_status: u16,
    #[serde(default)]
    pub response_headers: FxHashMap<String, String>,
    #[serde(default)]
    pub response_body: Option<String>,
}
