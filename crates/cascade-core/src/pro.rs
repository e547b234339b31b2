//! Pro-tier verdicts: the validated response shape and its deterministic
//! fallback.

use serde::{Deserialize, Serialize};

use crate::flash::FlashEvent;
use crate::ids;
use crate::packet::{Candidate, EventType};

/// A validated Pro-tier verdict for one packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProResponse {
    /// Must equal the originating candidate's `packet_id`.
    pub packet_id: String,
    pub candidate_id: String,
    pub event_type: EventType,
    pub confidence: f64,
    pub risk_score: f64,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub plate_visible: bool,
    #[serde(default)]
    pub plate_number: Option<String>,
    #[serde(default)]
    pub plate_confidence: Option<f64>,
    #[serde(default)]
    pub violator_description: Option<String>,
    #[serde(default)]
    pub evidence_frames: Vec<String>,
    #[serde(default)]
    pub key_moments: Vec<String>,
    #[serde(default)]
    pub explanation_short: Option<String>,
    #[serde(default)]
    pub uncertain: bool,
    #[serde(default)]
    pub uncertainty_reason: Option<String>,
}

/// Builds the deterministic Pro fallback used when a Pro call ultimately
/// fails for an escalated packet. Inherits the Flash verdict's type, window,
/// and confidence; always flagged uncertain.
#[must_use]
pub fn pro_fallback(candidate: &Candidate, flash: &FlashEvent, ordinal: usize) -> ProResponse {
    ProResponse {
        packet_id: candidate.packet_id.clone(),
        candidate_id: candidate.candidate_id.clone(),
        event_type: flash.event_type,
        confidence: flash.confidence,
        risk_score: candidate.score * 100.0,
        start_time: flash.start_time,
        end_time: flash.end_time,
        plate_visible: false,
        plate_number: None,
        plate_confidence: None,
        violator_description: flash.violator_description.clone(),
        evidence_frames: Vec::new(),
        key_moments: Vec::new(),
        explanation_short: None,
        uncertain: true,
        uncertainty_reason: Some(format!(
            "local fallback: no Pro response available ({})",
            ids::event_id(ordinal, Some(&candidate.packet_id))
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn fallback_risk_is_score_scaled() {
        let candidate = Candidate {
            packet_id: "pkt_9".into(),
            candidate_id: "cand_009".into(),
            candidate_rank: 8,
            event_type: EventType::RedLightJump,
            start_s: 0.0,
            end_s: 3.0,
            score: 0.8,
            anchor_frames: vec![],
            feature_snapshot: HashMap::new(),
            routing: Default::default(),
        };
        let flash = crate::flash::flash_fallback(&candidate);
        let pro = pro_fallback(&candidate, &flash, 1);
        assert!((pro.risk_score - 80.0).abs() < 1e-9);
        assert!(pro.uncertain);
    }
}
