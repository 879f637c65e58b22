//! Risk scoring, aggregation, and report documents.
//!
//! Aggregation is pure and idempotent: everything here is computed from
//! the current anomaly set on demand and never stored as authoritative.
//! Recommendations are a deterministic mapping from the severity/type
//! breakdown to a fixed phrase set, never free text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Anomaly, ExecutionState, Flow};
use crate::types::{Severity, VulnerabilityType};

/// Wire-format version of the JSON report, the one persisted integration
/// contract for downstream pipelines.
pub const REPORT_VERSION: &str = "1";

/// Anomaly counts by severity grade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityHistogram {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub info: u64,
}

impl SeverityHistogram {
    #[must_use]
    pub fn from_anomalies(anomalies: &[Anomaly]) -> Self {
        let mut histogram = Self::default();
        for anomaly in anomalies {
            match anomaly.severity {
                Severity::Critical => histogram.critical += 1,
                Severity::High => histogram.high += 1,
                Severity::Medium => histogram.medium += 1,
                Severity::Low => histogram.low += 1,
                Severity::Info => histogram.info += 1,
            }
        }
        histogram
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

/// Confidence statistics with the fixed 0.33/0.66 bucket split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    /// confidence < 0.33
    pub bucket_low: u64,
    /// 0.33 <= confidence < 0.66
    pub bucket_mid: u64,
    /// confidence >= 0.66
    pub bucket_high: u64,
}

impl ConfidenceStats {
    #[must_use]
    pub fn from_anomalies(anomalies: &[Anomaly]) -> Self {
        if anomalies.is_empty() {
            return Self::default();
        }
        let mut stats = Self {
            min: f64::MAX,
            ..Self::default()
        };
        let mut sum = 0.0;
        for anomaly in anomalies {
            let c = anomaly.confidence;
            sum += c;
            stats.min = stats.min.min(c);
            stats.max = stats.max.max(c);
            if c < 0.33 {
                stats.bucket_low += 1;
            } else if c < 0.66 {
                stats.bucket_mid += 1;
            } else {
                stats.bucket_high += 1;
            }
        }
        stats.avg = sum / anomalies.len() as f64;
        stats
    }
}

/// Flow-level risk grade derived from the score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Low,
    Medium,
    High,
    Critical,
}

/// Weighted risk score in `[0, 10]`.
#[must_use]
pub fn risk_score(histogram: &SeverityHistogram) -> f64 {
    let weighted = 0.30 * histogram.critical as f64
        + 0.18 * histogram.high as f64
        + 0.08 * histogram.medium as f64
        + 0.02 * histogram.low as f64;
    10.0 * weighted.min(1.0)
}

#[must_use]
pub fn risk_category(score: f64) -> RiskCategory {
    if score >= 8.0 {
        RiskCategory::Critical
    } else if score >= 6.0 {
        RiskCategory::High
    } else if score >= 3.0 {
        RiskCategory::Medium
    } else {
        RiskCategory::Low
    }
}

/// Fixed recommendation phrases; the mapping below is the only producer.
pub mod recommendations {
    pub const URGENT_TRIAGE: &str =
        "Critical findings present: triage and verify them before the next release.";
    pub const REVIEW_AUTHORIZATION: &str =
        "Review server-side authorization checks on every endpoint that returned data to a modified identity.";
    pub const VALIDATE_INPUT: &str =
        "Enforce server-side domain validation for numeric and typed parameters.";
    pub const ENFORCE_WORKFLOW: &str =
        "Enforce workflow-state checks so later steps fail when prerequisites were skipped.";
    pub const LIMIT_RESPONSES: &str =
        "Audit response payloads for fields and records the caller should not receive.";
    pub const INVESTIGATE_TIMING: &str =
        "Investigate response-time divergence for data-dependent code paths.";
    pub const NO_FINDINGS: &str =
        "No anomalies detected; extend recordings and the mutation catalog for broader coverage.";
}

/// Deterministic recommendation mapping from the aggregate breakdown.
#[must_use]
pub fn recommend(histogram: &SeverityHistogram, anomalies: &[Anomaly]) -> Vec<String> {
    let mut phrases = Vec::new();
    if histogram.total() == 0 {
        phrases.push(recommendations::NO_FINDINGS.to_string());
        return phrases;
    }
    if histogram.critical > 0 {
        phrases.push(recommendations::URGENT_TRIAGE.to_string());
    }
    let has = |t: VulnerabilityType| anomalies.iter().any(|a| a.vulnerability_type == t);
    if has(VulnerabilityType::UnauthorizedAccess) || has(VulnerabilityType::PrivilegeEscalation) {
        phrases.push(recommendations::REVIEW_AUTHORIZATION.to_string());
    }
    if has(VulnerabilityType::ParameterTampering) {
        phrases.push(recommendations::VALIDATE_INPUT.to_string());
    }
    if has(VulnerabilityType::SequenceManipulation) {
        phrases.push(recommendations::ENFORCE_WORKFLOW.to_string());
    }
    if has(VulnerabilityType::InformationDisclosure) {
        phrases.push(recommendations::LIMIT_RESPONSES.to_string());
    }
    if has(VulnerabilityType::TimingAnomaly) {
        phrases.push(recommendations::INVESTIGATE_TIMING.to_string());
    }
    phrases
}

/// The flow-level aggregate view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskSummary {
    pub risk_score: f64,
    pub risk_category: RiskCategory,
    pub severity: SeverityHistogram,
    /// Anomaly counts keyed by vulnerability type (stable key order).
    pub types: BTreeMap<String, u64>,
    pub confidence: ConfidenceStats,
    pub total_anomalies: u64,
    pub potential_vulnerabilities: u64,
    pub recommendations: Vec<String>,
}

/// Aggregate the current anomaly set; callers may invoke at any time.
#[must_use]
pub fn summarize(anomalies: &[Anomaly]) -> RiskSummary {
    let severity = SeverityHistogram::from_anomalies(anomalies);
    let score = risk_score(&severity);
    let mut types = BTreeMap::new();
    for anomaly in anomalies {
        *types
            .entry(anomaly.vulnerability_type.encode().to_string())
            .or_insert(0) += 1;
    }
    RiskSummary {
        risk_score: score,
        risk_category: risk_category(score),
        severity,
        types,
        confidence: ConfidenceStats::from_anomalies(anomalies),
        total_anomalies: anomalies.len() as u64,
        potential_vulnerabilities: anomalies
            .iter()
            .filter(|a| a.is_potential_vulnerability)
            .count() as u64,
        recommendations: recommend(&severity, anomalies),
    }
}

/// Identification block shared by every report shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowHeading {
    pub flow_id: Uuid,
    pub name: String,
    pub target_domain: String,
    pub description: String,
}

impl From<&Flow> for FlowHeading {
    fn from(flow: &Flow) -> Self {
        Self {
            flow_id: flow.id,
            name: flow.name.clone(),
            target_domain: flow.target_domain.clone(),
            description: flow.description.clone(),
        }
    }
}

/// The full JSON report: the documented integration contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowReport {
    pub report_version: String,
    pub generated_at: DateTime<Utc>,
    pub flow: FlowHeading,
    pub requests_recorded: u64,
    pub test_cases_derived: u64,
    pub executions: Vec<ExecutionState>,
    pub risk: RiskSummary,
    pub anomalies: Vec<Anomaly>,
}

/// Compact summary used by the dashboard and `/reports/summary`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryReport {
    pub flow: FlowHeading,
    pub generated_at: DateTime<Utc>,
    pub requests_recorded: u64,
    pub test_cases_derived: u64,
    pub risk: RiskSummary,
}

/// Executive digest: headline numbers and the top findings only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutiveReport {
    pub flow: FlowHeading,
    pub generated_at: DateTime<Utc>,
    pub risk_score: f64,
    pub risk_category: RiskCategory,
    pub total_anomalies: u64,
    pub potential_vulnerabilities: u64,
    pub top_findings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Distribution views for charting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub flow: FlowHeading,
    pub generated_at: DateTime<Utc>,
    pub severity: SeverityHistogram,
    pub types: BTreeMap<String, u64>,
    pub confidence: ConfidenceStats,
    /// Anomalies per UTC day (`YYYY-MM-DD`), ascending.
    pub daily_counts: BTreeMap<String, u64>,
}

/// Inputs for report assembly, gathered by the control plane.
pub struct ReportInputs<'a> {
    pub flow: &'a Flow,
    pub requests_recorded: u64,
    pub test_cases_derived: u64,
    pub executions: Vec<ExecutionState>,
    pub anomalies: Vec<Anomaly>,
}

#[must_use]
pub fn full_report(inputs: ReportInputs<'_>) -> FlowReport {
    let risk = summarize(&inputs.anomalies);
    FlowReport {
        report_version: REPORT_VERSION.to_string(),
        generated_at: Utc::now(),
        flow: FlowHeading::from(inputs.flow),
        requests_recorded: inputs.requests_recorded,
        test_cases_derived: inputs.test_cases_derived,
        executions: inputs.executions,
        risk,
        anomalies: inputs.anomalies,
    }
}

#[must_use]
pub fn summary_report(inputs: &ReportInputs<'_>) -> SummaryReport {
    SummaryReport {
        flow: FlowHeading::from(inputs.flow),
        generated_at: Utc::now(),
        requests_recorded: inputs.requests_recorded,
        test_cases_derived: inputs.test_cases_derived,
        risk: summarize(&inputs.anomalies),
    }
}

#[must_use]
pub fn executive_report(inputs: &ReportInputs<'_>) -> ExecutiveReport {
    let risk = summarize(&inputs.anomalies);
    let mut ranked: Vec<&Anomaly> = inputs.anomalies.iter().collect();
    ranked.sort_by(|a, b| {
        b.severity.cmp(&a.severity).then(
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    ExecutiveReport {
        flow: FlowHeading::from(inputs.flow),
        generated_at: Utc::now(),
        risk_score: risk.risk_score,
        risk_category: risk.risk_category,
        total_anomalies: risk.total_anomalies,
        potential_vulnerabilities: risk.potential_vulnerabilities,
        top_findings: ranked
            .iter()
            .take(5)
            .map(|a| {
                format!(
                    "[{}] {}: {}",
                    a.severity,
                    a.vulnerability_type,
                    a.description
                )
            })
            .collect(),
        recommendations: risk.recommendations,
    }
}

#[must_use]
pub fn analytics_report(inputs: &ReportInputs<'_>) -> AnalyticsReport {
    let mut daily_counts = BTreeMap::new();
    for anomaly in &inputs.anomalies {
        let day = anomaly.created_at.format("%Y-%m-%d").to_string();
        *daily_counts.entry(day).or_insert(0) += 1;
    }
    AnalyticsReport {
        flow: FlowHeading::from(inputs.flow),
        generated_at: Utc::now(),
        severity: SeverityHistogram::from_anomalies(&inputs.anomalies),
        types: {
            let mut types = BTreeMap::new();
            for anomaly in &inputs.anomalies {
                *types
                    .entry(anomaly.vulnerability_type.encode().to_string())
                    .or_insert(0) += 1;
            }
            types
        },
        confidence: ConfidenceStats::from_anomalies(&inputs.anomalies),
        daily_counts,
    }
}

/// Minimal self-contained HTML rendering of the full report.
#[must_use]
pub fn render_html(report: &FlowReport) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    out.push_str(&format!(
        "<title>flowprobe report: {}</title>",
        escape(&report.flow.name)
    ));
    out.push_str(
        "<style>body{font-family:sans-serif;margin:2rem}table{border-collapse:collapse}\
         td,th{border:1px solid #999;padding:4px 8px}</style></head><body>",
    );
    out.push_str(&format!(
        "<h1>{} &mdash; risk {:.1} ({:?})</h1>",
        escape(&report.flow.name),
        report.risk.risk_score,
        report.risk.risk_category
    ));
    out.push_str(&format!(
        "<p>Target: {} &middot; {} requests &middot; {} test cases &middot; {} anomalies</p>",
        escape(&report.flow.target_domain),
        report.requests_recorded,
        report.test_cases_derived,
        report.risk.total_anomalies
    ));
    out.push_str("<h2>Recommendations</h2><ul>");
    for phrase in &report.risk.recommendations {
        out.push_str(&format!("<li>{}</li>", escape(phrase)));
    }
    out.push_str("</ul><h2>Anomalies</h2><table><tr>\
         <th>Severity</th><th>Type</th><th>Confidence</th><th>Status</th><th>Description</th></tr>");
    for anomaly in &report.anomalies {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:.2}</td><td>{}</td><td>{}</td></tr>",
            anomaly.severity,
            anomaly.vulnerability_type,
            anomaly.confidence,
            anomaly.status,
            escape(&anomaly.description)
        ));
    }
    out.push_str("</table></body></html>");
    out
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
