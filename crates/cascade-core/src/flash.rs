//! Flash-tier verdicts: the validated response shape, the deterministic
//! fallback, and the uncertainty post-processing step.

use serde::{Deserialize, Serialize};

use crate::packet::{Candidate, EventType};

/// A validated Flash-tier verdict for one packet.
///
/// # Invariants
/// - `confidence` is in `[0, 1]`.
/// - `start_time <= end_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashEvent {
    /// Must equal the originating candidate's `packet_id`; checked by the
    /// executor before this value is trusted (`SCHEMA_PACKET_MISMATCH`).
    pub packet_id: String,
    /// Echoed candidate id, for human-readable cross-referencing.
    pub candidate_id: String,
    /// Whether the model considers this window an actual violation.
    pub is_relevant: bool,
    /// The violation type the model identified.
    pub event_type: EventType,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Window start, in seconds.
    pub start_time: f64,
    /// Window end, in seconds.
    pub end_time: f64,
    /// Whether a license plate is visible in the window.
    pub plate_visible: bool,
    /// Plate text, if visible and legible.
    #[serde(default)]
    pub plate_number: Option<String>,
    /// Model confidence in the plate read, if any.
    #[serde(default)]
    pub plate_confidence: Option<f64>,
    /// Free-text description of the violator/vehicle.
    #[serde(default)]
    pub violator_description: Option<String>,
    /// Whether the model flagged its own verdict as uncertain. May be
    /// overridden to `true` by post-processing even when the model itself
    /// reported `false`.
    #[serde(default)]
    pub uncertain: bool,
    /// Reason for uncertainty, synthesized by post-processing when the
    /// model didn't supply one.
    #[serde(default)]
    pub uncertainty_reason: Option<String>,
    /// Whether this packet should be escalated to the Pro tier. Set by
    /// post-processing, not trusted from the raw model response.
    #[serde(default)]
    pub needs_pro: bool,
}

impl FlashEvent {
    /// Applies the uncertainty post-processing step: a relevant event whose
    /// confidence falls in the uncertain band (or that the model itself
    /// flagged uncertain) is marked `uncertain = true, needs_pro = true`,
    /// synthesizing a reason when the model didn't supply one.
    pub fn postprocess_uncertainty(&mut self, uncertain_low: f64, uncertain_high: f64) {
        if !self.is_relevant {
            return;
        }
        let in_band = self.confidence >= uncertain_low && self.confidence < uncertain_high;
        if self.uncertain || in_band {
            self.uncertain = true;
            self.needs_pro = true;
            if self.uncertainty_reason.is_none() {
                self.uncertainty_reason = Some(if in_band {
                    format!(
                        "confidence {:.2} within uncertain band [{:.2}, {:.2})",
                        self.confidence, uncertain_low, uncertain_high
                    )
                } else {
                    "model flagged verdict as uncertain".to_string()
                });
            }
        }
    }
}

/// Builds the deterministic Flash fallback for a candidate, used whenever
/// media upload or a model call ultimately fails for this packet.
///
/// # Invariants
/// - `is_relevant == (candidate.score >= 0.55)`.
/// - `confidence` is clamped to `[0.2, 0.95]`.
#[must_use]
pub fn flash_fallback(candidate: &Candidate) -> FlashEvent {
    let is_relevant = candidate.score >= 0.55;
    let confidence = candidate.score.clamp(0.2, 0.95);
    let uncertain = candidate.score < 0.82;
    FlashEvent {
        packet_id: candidate.packet_id.clone(),
        candidate_id: candidate.candidate_id.clone(),
        is_relevant,
        event_type: candidate.event_type,
        confidence,
        start_time: candidate.start_s,
        end_time: candidate.end_s,
        plate_visible: false,
        plate_number: None,
        plate_confidence: None,
        violator_description: None,
        uncertain,
        uncertainty_reason: Some("local fallback: no model response available".to_string()),
        needs_pro: uncertain && is_relevant && candidate.score >= 0.55,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate(score: f64) -> Candidate {
        Candidate {
            packet_id: "pkt_1".into(),
            candidate_id: "cand_001".into(),
            candidate_rank: 0,
            event_type: EventType::RecklessDriving,
            start_s: 1.0,
            end_s: 2.0,
            score,
            anchor_frames: vec![],
            feature_snapshot: HashMap::new(),
            routing: Default::default(),
        }
    }

    #[test]
    fn fallback_relevance_matches_score_threshold() {
        assert!(flash_fallback(&candidate(0.9)).is_relevant);
        assert!(!flash_fallback(&candidate(0.4)).is_relevant);
        assert!(flash_fallback(&candidate(0.55)).is_relevant);
    }

    #[test]
    fn fallback_confidence_is_clamped() {
        let ev = flash_fallback(&candidate(0.05));
        assert!((ev.confidence - 0.2).abs() < 1e-9);
        let ev = flash_fallback(&candidate(0.99));
        assert!((ev.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn scenario_s1_high_confidence_is_not_uncertain() {
        let mut ev = flash_fallback(&candidate(0.9));
        assert!(ev.is_relevant);
        assert!((ev.confidence - 0.9).abs() < 1e-9);
        assert!(!ev.uncertain);
        ev.postprocess_uncertainty(0.45, 0.82);
        assert!(!ev.uncertain);
        assert!(!ev.needs_pro);
    }

    #[test]
    fn postprocess_marks_band_confidence_uncertain() {
        let mut ev = FlashEvent {
            packet_id: "pkt_2".into(),
            candidate_id: "cand_002".into(),
            is_relevant: true,
            event_type: EventType::WrongSideDriving,
            confidence: 0.55,
            start_time: 0.0,
            end_time: 1.0,
            plate_visible: false,
            plate_number: None,
            plate_confidence: None,
            violator_description: None,
            uncertain: false,
            uncertainty_reason: None,
            needs_pro: false,
        };
        ev.postprocess_uncertainty(0.45, 0.82);
        assert!(ev.uncertain);
        assert!(ev.needs_pro);
        assert!(ev.uncertainty_reason.is_some());
    }
}
