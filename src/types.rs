//! Core types for the Flowprobe testing engine.
//!
//! This module defines the closed vocabularies used throughout the system:
//! mutation categories, anomaly classification, severity grades, execution
//! lifecycle states, and the error taxonomy surfaced on both stored
//! responses and API payloads.
//!
//! Every enum carries an [`encode`](MutationCategory::encode)-style string
//! form used for persistence so stored rows stay readable and forward
//! compatible, plus serde derives for the wire.
//!
//! # Examples
//!
//! ```rust
//! use flowprobe::types::{MutationCategory, Severity};
//!
//! let cat = MutationCategory::Auth;
//! assert_eq!(cat.encode(), "auth");
//! assert_eq!(MutationCategory::decode("auth"), Some(MutationCategory::Auth));
//!
//! // Severity is ordered from Info up to Critical.
//! assert!(Severity::Critical > Severity::Medium);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a derived test case.
///
/// The category drives detector applicability in the analyzer (for example,
/// the sequence-bypass detector only fires on [`Sequence`](Self::Sequence)
/// cases) and groups rules in the mutation catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationCategory {
    /// String boundary and encoding abuse against individual values.
    String,
    /// Authentication and identity material tampering.
    Auth,
    /// Parameter-level tampering: numerics, type coercion, deletion.
    Parameter,
    /// Workflow-order manipulation across a flow's ordinals.
    Sequence,
}

impl MutationCategory {
    /// Persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            MutationCategory::String => "string",
            MutationCategory::Auth => "auth",
            MutationCategory::Parameter => "parameter",
            MutationCategory::Sequence => "sequence",
        }
    }

    /// Decode a persisted string form; returns `None` for unknown input.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "string" => Some(MutationCategory::String),
            "auth" => Some(MutationCategory::Auth),
            "parameter" => Some(MutationCategory::Parameter),
            "sequence" => Some(MutationCategory::Sequence),
            _ => None,
        }
    }
}

impl fmt::Display for MutationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Signal category of the detector that produced an anomaly.
///
/// One anomaly is produced per firing category; categories are evaluated in
/// a fixed order by the analyzer and each may fire at most once per
/// baseline/mutant pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Baseline denied (401/403), mutant succeeded.
    StatusTransition,
    /// Baseline non-auth 4xx, mutant succeeded.
    StatusUpgrade,
    /// Large relative and absolute body-size change between two successes.
    ContentLengthDelta,
    /// New top-level JSON keys appeared in the mutant body.
    BodyStructuralDrift,
    /// Mutant response time diverged by a large multiple.
    TimingDelta,
    /// A sequence mutation succeeded despite a skipped prerequisite.
    SequenceBypass,
}

impl AnomalyKind {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            AnomalyKind::StatusTransition => "status_transition",
            AnomalyKind::StatusUpgrade => "status_upgrade",
            AnomalyKind::ContentLengthDelta => "content_length_delta",
            AnomalyKind::BodyStructuralDrift => "body_structural_drift",
            AnomalyKind::TimingDelta => "timing_delta",
            AnomalyKind::SequenceBypass => "sequence_bypass",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "status_transition" => Some(AnomalyKind::StatusTransition),
            "status_upgrade" => Some(AnomalyKind::StatusUpgrade),
            "content_length_delta" => Some(AnomalyKind::ContentLengthDelta),
            "body_structural_drift" => Some(AnomalyKind::BodyStructuralDrift),
            "timing_delta" => Some(AnomalyKind::TimingDelta),
            "sequence_bypass" => Some(AnomalyKind::SequenceBypass),
            _ => None,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// The class of suspected vulnerability an anomaly points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnerabilityType {
    UnauthorizedAccess,
    PrivilegeEscalation,
    ParameterTampering,
    InformationDisclosure,
    TimingAnomaly,
    SequenceManipulation,
}

impl VulnerabilityType {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            VulnerabilityType::UnauthorizedAccess => "unauthorized_access",
            VulnerabilityType::PrivilegeEscalation => "privilege_escalation",
            VulnerabilityType::ParameterTampering => "parameter_tampering",
            VulnerabilityType::InformationDisclosure => "information_disclosure",
            VulnerabilityType::TimingAnomaly => "timing_anomaly",
            VulnerabilityType::SequenceManipulation => "sequence_manipulation",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "unauthorized_access" => Some(VulnerabilityType::UnauthorizedAccess),
            "privilege_escalation" => Some(VulnerabilityType::PrivilegeEscalation),
            "parameter_tampering" => Some(VulnerabilityType::ParameterTampering),
            "information_disclosure" => Some(VulnerabilityType::InformationDisclosure),
            "timing_anomaly" => Some(VulnerabilityType::TimingAnomaly),
            "sequence_manipulation" => Some(VulnerabilityType::SequenceManipulation),
            _ => None,
        }
    }
}

impl fmt::Display for VulnerabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Severity grade of an anomaly.
///
/// Declared in ascending order so the derived `Ord` makes
/// `Severity::Critical` the maximum; aggregation and the
/// `is_potential_vulnerability` rule rely on this ordering.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Triage state of a stored anomaly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    New,
    Confirmed,
    FalsePositive,
}

impl AnomalyStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            AnomalyStatus::New => "new",
            AnomalyStatus::Confirmed => "confirmed",
            AnomalyStatus::FalsePositive => "false_positive",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "new" => Some(AnomalyStatus::New),
            "confirmed" => Some(AnomalyStatus::Confirmed),
            "false_positive" => Some(AnomalyStatus::FalsePositive),
            _ => None,
        }
    }
}

impl fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Lifecycle state of one replay execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "succeeded" => Some(ExecutionStatus::Succeeded),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Which side of a baseline/mutant pair a stored response belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// Owned by a recorded baseline request.
    Baseline,
    /// Owned by a derived test case.
    Mutant,
}

impl OwnerKind {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            OwnerKind::Baseline => "baseline",
            OwnerKind::Mutant => "mutant",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(OwnerKind::Baseline),
            "mutant" => Some(OwnerKind::Mutant),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Error taxonomy shared by stored responses (`error_kind`) and API error
/// payloads (`code`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Storage,
    Network,
    Timeout,
    RateLimited,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Internal => "internal",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "not_found" => Some(ErrorKind::NotFound),
            "conflict" => Some(ErrorKind::Conflict),
            "storage" => Some(ErrorKind::Storage),
            "network" => Some(ErrorKind::Network),
            "timeout" => Some(ErrorKind::Timeout),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
