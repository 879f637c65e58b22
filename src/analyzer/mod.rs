//! Diff engine: decide whether a baseline/mutant response pair
//! constitutes anomalies, classify them, and score them.
//!
//! Detectors run in catalog order; each signal category fires at most
//! once per pair, and categories are independent, so one pair can yield
//! several anomalies. The engine is pure: for fixed inputs the findings
//! are deterministic (anomaly ids and timestamps are assigned at wrap-up,
//! the scored content never varies). A detector that cannot compute its
//! verdict — a body that is not JSON under the drift detector, a missing
//! status under the transition detectors — skips silently; the analyzer
//! never fails a replay.

pub mod catalog;

pub use catalog::{DetectionCatalog, DetectorRule};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Anomaly, ResponseRecord, TestCase, Transform};
use crate::types::{AnomalyKind, AnomalyStatus, MutationCategory, Severity, VulnerabilityType};

/// A scored detector hit before persistence identifiers are attached.
#[derive(Clone, Debug, PartialEq)]
pub struct Finding {
    pub kind: AnomalyKind,
    pub vulnerability_type: VulnerabilityType,
    pub severity: Severity,
    pub confidence: f64,
    pub is_potential_vulnerability: bool,
    pub description: String,
}

/// Severity is a pure function of vulnerability type, confidence, and the
/// content-length delta ratio.
#[must_use]
pub fn severity_for(
    vulnerability_type: VulnerabilityType,
    confidence: f64,
    len_ratio: f64,
) -> Severity {
    match vulnerability_type {
        VulnerabilityType::UnauthorizedAccess | VulnerabilityType::PrivilegeEscalation => {
            if confidence >= 0.85 {
                Severity::Critical
            } else {
                Severity::High
            }
        }
        VulnerabilityType::SequenceManipulation | VulnerabilityType::ParameterTampering => {
            if confidence >= 0.8 {
                Severity::High
            } else {
                Severity::Medium
            }
        }
        VulnerabilityType::InformationDisclosure => {
            if len_ratio >= 2.0 {
                Severity::High
            } else if len_ratio >= 0.75 {
                Severity::Medium
            } else {
                Severity::Low
            }
        }
        VulnerabilityType::TimingAnomaly => {
            if confidence >= 0.6 {
                Severity::Medium
            } else {
                Severity::Low
            }
        }
    }
}

/// Run every detector against one pair. At most one finding per signal
/// category; `confidence_threshold` gates `is_potential_vulnerability`.
#[must_use]
pub fn evaluate(
    test_case: &TestCase,
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    detection: &DetectionCatalog,
    confidence_threshold: f64,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut fired = std::collections::HashSet::new();
    let len_ratio = length_ratio(baseline, mutant);
    for detector in &detection.detectors {
        if fired.contains(detector.category()) {
            continue;
        }
        let hit = match detector {
            DetectorRule::StatusTransition { confidence } => {
                status_transition(test_case, baseline, mutant, *confidence)
            }
            DetectorRule::StatusUpgrade {
                confidence,
                extreme_confidence,
            } => status_upgrade(test_case, baseline, mutant, *confidence, *extreme_confidence),
            DetectorRule::ContentLengthDelta {
                min_ratio,
                min_bytes,
                confidence_floor,
                confidence_ceiling,
                high_ratio,
            } => content_length_delta(
                baseline,
                mutant,
                *min_ratio,
                *min_bytes,
                *confidence_floor,
                *confidence_ceiling,
                *high_ratio,
            ),
            DetectorRule::BodyStructuralDrift {
                min_new_keys,
                confidence,
            } => body_structural_drift(baseline, mutant, *min_new_keys, *confidence),
            DetectorRule::TimingDelta {
                multiplier,
                min_baseline_ms,
                confidence,
            } => timing_delta(baseline, mutant, *multiplier, *min_baseline_ms, *confidence),
            DetectorRule::SequenceBypass { confidence } => {
                sequence_bypass(test_case, mutant, *confidence)
            }
        };
        if let Some((kind, vulnerability_type, confidence, description)) = hit {
            fired.insert(detector.category());
            let confidence = confidence.clamp(0.0, 1.0);
            let severity = severity_for(vulnerability_type, confidence, len_ratio);
            findings.push(Finding {
                kind,
                vulnerability_type,
                severity,
                confidence,
                is_potential_vulnerability: severity >= Severity::Medium
                    && confidence >= confidence_threshold,
                description,
            });
        }
    }
    findings
}

/// Evaluate a pair and wrap the findings into storable anomalies.
#[must_use]
pub fn analyze(
    flow_id: Uuid,
    test_case: &TestCase,
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    detection: &DetectionCatalog,
    confidence_threshold: f64,
) -> Vec<Anomaly> {
    evaluate(test_case, baseline, mutant, detection, confidence_threshold)
        .into_iter()
        .map(|finding| Anomaly {
            id: Uuid::new_v4(),
            flow_id,
            test_case_id: test_case.id,
            kind: finding.kind,
            severity: finding.severity,
            confidence: finding.confidence,
            is_potential_vulnerability: finding.is_potential_vulnerability,
            vulnerability_type: finding.vulnerability_type,
            original_status: baseline.status,
            replayed_status: mutant.status,
            original_content_length: baseline.content_length,
            replayed_content_length: mutant.content_length,
            description: finding.description,
            status: AnomalyStatus::New,
            catalog_version: detection.version.clone(),
            created_at: Utc::now(),
        })
        .collect()
}

type Hit = Option<(AnomalyKind, VulnerabilityType, f64, String)>;

fn is_denied(status: Option<u16>) -> bool {
    matches!(status, Some(401 | 403))
}

/// Whether the mutation removed, forged, or swapped the credential the
/// baseline carried.
fn invalidates_auth(test_case: &TestCase) -> bool {
    test_case.category == MutationCategory::Auth
        && matches!(
            test_case.mutation.transform,
            Transform::TokenTamper { .. } | Transform::SubstituteIdentity { .. } | Transform::Delete
        )
}

fn status_transition(
    test_case: &TestCase,
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    confidence: f64,
) -> Hit {
    if !mutant.is_success() {
        return None;
    }
    if is_denied(baseline.status) {
        // Denied-to-allowed: the mutant reached something the baseline
        // identity could not.
        return Some((
            AnomalyKind::StatusTransition,
            VulnerabilityType::UnauthorizedAccess,
            confidence,
            format!(
                "baseline was denied ({}) but the mutant succeeded ({})",
                baseline.status.unwrap_or_default(),
                mutant.status.unwrap_or_default()
            ),
        ));
    }
    if baseline.is_success() && invalidates_auth(test_case) {
        // The server accepted credentials that should not verify.
        let vulnerability_type = match test_case.mutation.transform {
            Transform::TokenTamper { .. } | Transform::SubstituteIdentity { .. } => {
                VulnerabilityType::PrivilegeEscalation
            }
            _ => VulnerabilityType::UnauthorizedAccess,
        };
        return Some((
            AnomalyKind::StatusTransition,
            vulnerability_type,
            confidence,
            format!(
                "mutated credentials were accepted ({}); {}",
                mutant.status.unwrap_or_default(),
                test_case.description
            ),
        ));
    }
    None
}

fn status_upgrade(
    test_case: &TestCase,
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    confidence: f64,
    extreme_confidence: f64,
) -> Hit {
    if !mutant.is_success() || test_case.category == MutationCategory::Auth {
        return None;
    }
    match baseline.status {
        Some(status) if (400..500).contains(&status) && !is_denied(baseline.status) => Some((
            AnomalyKind::StatusUpgrade,
            VulnerabilityType::ParameterTampering,
            confidence,
            format!(
                "baseline failed with {status} but the mutant succeeded ({})",
                mutant.status.unwrap_or_default()
            ),
        )),
        _ if baseline.is_success() && accepted_negative_extreme(test_case) => Some((
            AnomalyKind::StatusUpgrade,
            VulnerabilityType::ParameterTampering,
            extreme_confidence,
            format!(
                "server accepted an out-of-domain value: {}",
                test_case.description
            ),
        )),
        _ => None,
    }
}

fn accepted_negative_extreme(test_case: &TestCase) -> bool {
    match &test_case.mutation.transform {
        Transform::NumericExtreme { value } => value.as_f64().is_some_and(|v| v < 0.0),
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn content_length_delta(
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    min_ratio: f64,
    min_bytes: u64,
    confidence_floor: f64,
    confidence_ceiling: f64,
    high_ratio: f64,
) -> Hit {
    if !baseline.is_success() || !mutant.is_success() {
        return None;
    }
    let delta = baseline.content_length.abs_diff(mutant.content_length);
    let ratio = delta as f64 / (baseline.content_length.max(1)) as f64;
    if ratio < min_ratio || delta < min_bytes {
        return None;
    }
    let span = confidence_ceiling - confidence_floor;
    let confidence =
        (confidence_floor + span * (ratio / high_ratio)).clamp(confidence_floor, confidence_ceiling);
    Some((
        AnomalyKind::ContentLengthDelta,
        VulnerabilityType::InformationDisclosure,
        confidence,
        format!(
            "body size shifted {} -> {} bytes (ratio {:.2})",
            baseline.content_length, mutant.content_length, ratio
        ),
    ))
}

fn body_structural_drift(
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    min_new_keys: usize,
    confidence: f64,
) -> Hit {
    if !baseline.is_success() || !mutant.is_success() {
        return None;
    }
    // Undecodable bodies skip the detector; the analyzer never errors.
    let (Some(Value::Object(base)), Some(Value::Object(mutated))) =
        (baseline.body_json(), mutant.body_json())
    else {
        return None;
    };
    let new_keys: Vec<&String> = mutated.keys().filter(|k| !base.contains_key(*k)).collect();
    if new_keys.len() < min_new_keys {
        return None;
    }
    Some((
        AnomalyKind::BodyStructuralDrift,
        VulnerabilityType::InformationDisclosure,
        confidence,
        format!(
            "mutant response exposed new top-level keys: {}",
            new_keys
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    ))
}

fn timing_delta(
    baseline: &ResponseRecord,
    mutant: &ResponseRecord,
    multiplier: f64,
    min_baseline_ms: u64,
    confidence: f64,
) -> Hit {
    if baseline.status != mutant.status || baseline.response_time_ms < min_baseline_ms {
        return None;
    }
    let base = baseline.response_time_ms.max(1) as f64;
    let observed = mutant.response_time_ms.max(1) as f64;
    let factor = if observed > base {
        observed / base
    } else {
        base / observed
    };
    if factor < multiplier {
        return None;
    }
    Some((
        AnomalyKind::TimingDelta,
        VulnerabilityType::TimingAnomaly,
        confidence,
        format!(
            "response time diverged {}ms -> {}ms ({factor:.1}x)",
            baseline.response_time_ms, mutant.response_time_ms
        ),
    ))
}

fn sequence_bypass(test_case: &TestCase, mutant: &ResponseRecord, confidence: f64) -> Hit {
    if test_case.category != MutationCategory::Sequence || !mutant.is_success() {
        return None;
    }
    // Repeat keeps every prerequisite in place; only skip/reorder drop one.
    if !matches!(
        test_case.mutation.transform,
        Transform::SequenceSkip | Transform::SequenceReorder
    ) {
        return None;
    }
    Some((
        AnomalyKind::SequenceBypass,
        VulnerabilityType::SequenceManipulation,
        confidence,
        format!(
            "step succeeded ({}) despite a skipped prerequisite; {}",
            mutant.status.unwrap_or_default(),
            test_case.description
        ),
    ))
}

fn length_ratio(baseline: &ResponseRecord, mutant: &ResponseRecord) -> f64 {
    let delta = baseline.content_length.abs_diff(mutant.content_length);
    delta as f64 / (baseline.content_length.max(1)) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mutation, TargetSelector};
    use rustc_hash::FxHashMap;
    use serde_json::json;

    fn response(status: Option<u16>, len: u64, time_ms: u64) -> ResponseRecord {
        ResponseRecord {
            id: Uuid::new_v4(),
            owner_kind: crate::types::OwnerKind::Baseline,
            owner_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            status,
            headers: FxHashMap::default(),
            body: None,
            content_length: len,
            response_time_ms: time_ms,
            error_kind: None,
            captured_at: Utc::now(),
        }
    }

    fn case(category: MutationCategory, transform: Transform) -> TestCase {
        TestCase {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            category,
            rule_id: "test-rule".into(),
            description: "test mutation".into(),
            mutation: Mutation {
                selector: TargetSelector::Envelope,
                transform,
            },
            catalog_version: "builtin-1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn tampered_token_accepted_is_critical_privilege_escalation() {
        let tc = case(
            MutationCategory::Auth,
            Transform::TokenTamper {
                claim: "sub".into(),
                value: json!("1"),
            },
        );
        let baseline = response(Some(200), 1250, 80);
        let mutant = response(Some(200), 1250, 85);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.vulnerability_type, VulnerabilityType::PrivilegeEscalation);
        assert_eq!(f.severity, Severity::Critical);
        assert!(f.confidence >= 0.85);
        assert!(f.is_potential_vulnerability);
    }

    #[test]
    fn denied_to_allowed_is_unauthorized_access() {
        let tc = case(
            MutationCategory::Auth,
            Transform::SubstituteIdentity {
                identity_label: "admin-candidate".into(),
            },
        );
        let baseline = response(Some(403), 45, 40);
        let mutant = response(Some(200), 5000, 55);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        let transition = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::StatusTransition)
            .expect("status transition must fire");
        assert_eq!(
            transition.vulnerability_type,
            VulnerabilityType::UnauthorizedAccess
        );
        assert_eq!(transition.severity, Severity::Critical);
    }

    #[test]
    fn negative_price_accepted_is_high_parameter_tampering() {
        let tc = case(
            MutationCategory::Parameter,
            Transform::NumericExtreme { value: json!(-1) },
        );
        let baseline = response(Some(200), 120, 30);
        let mutant = response(Some(200), 120, 32);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.vulnerability_type, VulnerabilityType::ParameterTampering);
        assert_eq!(f.severity, Severity::High);
        assert!(f.confidence >= 0.75);
    }

    #[test]
    fn sequence_skip_success_is_high() {
        let tc = case(MutationCategory::Sequence, Transform::SequenceSkip);
        let baseline = response(Some(200), 300, 30);
        let mutant = response(Some(200), 300, 28);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        let bypass = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::SequenceBypass)
            .expect("sequence bypass must fire");
        assert_eq!(
            bypass.vulnerability_type,
            VulnerabilityType::SequenceManipulation
        );
        assert_eq!(bypass.severity, Severity::High);
    }

    #[test]
    fn small_benign_diff_produces_no_findings() {
        let tc = case(
            MutationCategory::String,
            Transform::StringBoundary { value: "x".into() },
        );
        let baseline = response(Some(200), 1000, 40);
        let mutant = response(Some(200), 1020, 44);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        assert!(findings.is_empty());
    }

    #[test]
    fn timeout_mutant_fires_nothing() {
        let tc = case(
            MutationCategory::Parameter,
            Transform::NumericExtreme { value: json!(-1) },
        );
        let baseline = response(Some(200), 1000, 40);
        let mut mutant = response(None, 0, 30_000);
        mutant.error_kind = Some(crate::types::ErrorKind::Timeout);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        assert!(findings.is_empty());
    }

    #[test]
    fn large_body_delta_fires_information_disclosure() {
        let tc = case(
            MutationCategory::Parameter,
            Transform::Delete,
        );
        let baseline = response(Some(200), 500, 40);
        let mutant = response(Some(200), 2000, 42);
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        let delta = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::ContentLengthDelta)
            .expect("content length delta must fire");
        assert_eq!(
            delta.vulnerability_type,
            VulnerabilityType::InformationDisclosure
        );
        // ratio 3.0 >= 2.0
        assert_eq!(delta.severity, Severity::High);
        assert!(delta.confidence <= 0.85 && delta.confidence >= 0.5);
    }

    #[test]
    fn structural_drift_detects_new_keys() {
        let tc = case(MutationCategory::Parameter, Transform::Delete);
        let mut baseline = response(Some(200), 100, 40);
        baseline.body = Some(serde_json::to_vec(&json!({"a": 1})).unwrap());
        let mut mutant = response(Some(200), 130, 40);
        mutant.body = Some(serde_json::to_vec(&json!({"a": 1, "debug": true})).unwrap());
        let findings = evaluate(&tc, &baseline, &mutant, &DetectionCatalog::default(), 0.7);
        let drift = findings
            .iter()
            .find(|f| f.kind == AnomalyKind::BodyStructuralDrift)
            .expect("drift must fire");
        assert!(drift.description.contains("debug"));
    }

    #[test]
    fn timing_divergence_fires_in_both_directions() {
        let tc = case(MutationCategory::String, Transform::Delete);
        let baseline = response(Some(200), 100, 100);
        let slow = response(Some(200), 100, 600);
        let findings = evaluate(&tc, &baseline, &slow, &DetectionCatalog::default(), 0.7);
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::TimingDelta));

        let fast = response(Some(200), 100, 10);
        let findings = evaluate(&tc, &baseline, &fast, &DetectionCatalog::default(), 0.7);
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::TimingDelta));

        // Below the 50ms floor nothing fires.
        let tiny_base = response(Some(200), 100, 5);
        let tiny_slow = response(Some(200), 100, 100);
        let findings = evaluate(&tc, &tiny_base, &tiny_slow, &DetectionCatalog::default(), 0.7);
        assert!(findings.is_empty());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let tc = case(
            MutationCategory::Auth,
            Transform::TokenTamper {
                claim: "sub".into(),
                value: json!("1"),
            },
        );
        let baseline = response(Some(403), 45, 40);
        let mutant = response(Some(200), 5000, 50);
        let catalog = DetectionCatalog::default();
        let first = evaluate(&tc, &baseline, &mutant, &catalog, 0.7);
        let second = evaluate(&tc, &baseline, &mutant, &catalog, 0.7);
        assert_eq!(first, second);
    }
}
