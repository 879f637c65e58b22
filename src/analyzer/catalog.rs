//! The detection rule catalog.
//!
//! Detectors are tagged variants with tunable parameters, not subclasses:
//! the dispatch function in the parent module walks the catalog in
//! document order and each variant may fire at most once per pair. The
//! confidence bases and thresholds below are shipped defaults; the
//! control plane can replace the whole document at runtime, and every
//! produced anomaly records the catalog version that scored it.

use serde::{Deserialize, Serialize};

/// One detector with its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detector", rename_all = "snake_case")]
pub enum DetectorRule {
    /// Baseline denied (401/403) but the mutant succeeded, or an
    /// auth-invalidating mutant was accepted where the baseline
    /// succeeded with valid credentials.
    StatusTransition { confidence: f64 },
    /// Baseline failed with a non-auth 4xx but the mutant succeeded, or
    /// a negative numeric extreme was accepted.
    StatusUpgrade {
        confidence: f64,
        extreme_confidence: f64,
    },
    /// Body size shifted by a large relative and absolute amount between
    /// two successful responses.
    ContentLengthDelta {
        min_ratio: f64,
        min_bytes: u64,
        confidence_floor: f64,
        confidence_ceiling: f64,
        high_ratio: f64,
    },
    /// New top-level JSON keys surfaced in the mutant body.
    BodyStructuralDrift { min_new_keys: usize, confidence: f64 },
    /// Mutant response time diverged by a large multiple in either
    /// direction.
    TimingDelta {
        multiplier: f64,
        min_baseline_ms: u64,
        confidence: f64,
    },
    /// A sequence mutation succeeded despite a skipped prerequisite.
    SequenceBypass { confidence: f64 },
}

impl DetectorRule {
    /// Stable category label; one anomaly per category per pair.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            DetectorRule::StatusTransition { .. } => "status_transition",
            DetectorRule::StatusUpgrade { .. } => "status_upgrade",
            DetectorRule::ContentLengthDelta { .. } => "content_length_delta",
            DetectorRule::BodyStructuralDrift { .. } => "body_structural_drift",
            DetectorRule::TimingDelta { .. } => "timing_delta",
            DetectorRule::SequenceBypass { .. } => "sequence_bypass",
        }
    }
}

/// The versioned detection catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionCatalog {
    pub version: String,
    pub detectors: Vec<DetectorRule>,
}

impl DetectionCatalog {
    pub fn validate(&self) -> Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("catalog version must not be empty".to_string());
        }
        if self.detectors.is_empty() {
            return Err("catalog must carry at least one detector".to_string());
        }
        let confidences_ok = self.detectors.iter().all(|d| match d {
            DetectorRule::StatusTransition { confidence }
            | DetectorRule::BodyStructuralDrift { confidence, .. }
            | DetectorRule::TimingDelta { confidence, .. }
            | DetectorRule::SequenceBypass { confidence } => (0.0..=1.0).contains(confidence),
            DetectorRule::StatusUpgrade {
                confidence,
                extreme_confidence,
            } => (0.0..=1.0).contains(confidence) && (0.0..=1.0).contains(extreme_confidence),
            DetectorRule::ContentLengthDelta {
                confidence_floor,
                confidence_ceiling,
                ..
            } => {
                (0.0..=1.0).contains(confidence_floor)
                    && (0.0..=1.0).contains(confidence_ceiling)
                    && confidence_floor <= confidence_ceiling
            }
        });
        if !confidences_ok {
            return Err("detector confidences must lie in [0, 1]".to_string());
        }
        Ok(())
    }
}

impl Default for DetectionCatalog {
    fn default() -> Self {
        Self {
            version: "builtin-1".to_string(),
            detectors: vec![
                DetectorRule::StatusTransition { confidence: 0.9 },
                DetectorRule::StatusUpgrade {
                    confidence: 0.75,
                    extreme_confidence: 0.8,
                },
                DetectorRule::ContentLengthDelta {
                    min_ratio: 0.3,
                    min_bytes: 128,
                    confidence_floor: 0.5,
                    confidence_ceiling: 0.85,
                    high_ratio: 2.0,
                },
                DetectorRule::BodyStructuralDrift {
                    min_new_keys: 1,
                    confidence: 0.6,
                },
                DetectorRule::TimingDelta {
                    multiplier: 5.0,
                    min_baseline_ms: 50,
                    confidence: 0.5,
                },
                DetectorRule::SequenceBypass { confidence: 0.85 },
            ],
        }
    }
}
