//! Blends Flash and Pro decisions into the final, reviewer-visible event
//! list, and records a full per-packet trace alongside it.

use std::path::Path;

use crate::decision::{Decision, DecisionStatus};
use crate::error::{CascadeError, Result};
use crate::final_event::{FinalEvent, SourceStage, Trace, TraceEntry, TraceSummary};
use crate::flash::FlashEvent;
use crate::ids;
use crate::packet::Candidate;
use crate::pro::ProResponse;
use crate::run_logger::RunLogger;
use crate::run_status::Stage;

const REASON_NOT_PROCESSED: &str = "not_processed";
const REASON_FLASH_NOT_RELEVANT: &str = "flash_not_relevant";

/// Merges a run's packets with their Flash/Pro decisions, writing
/// `events_final.json` and `trace.json` under `run_dir`.
///
/// Packets are walked in `candidate_rank` order (the proposal engine's
/// score-descending order), so `events_final.json` reads highest-confidence
/// first. A packet becomes a `FinalEvent` in exactly two cases:
///
/// - Pro produced a response (`PRO_FINAL`): `confidence = 0.45*local +
///   0.55*pro.confidence`, `risk_score = 0.4*(local*100) + 0.6*pro.risk`.
/// - Flash was relevant and the packet was never sent to Pro
///   (`FLASH_ONLY`): `confidence = 0.45*local + 0.55*flash.confidence`,
///   `risk_score = 0.7*local*100`, always `uncertain = true`.
///
/// Every other packet is dropped and recorded with its last routing reason.
pub fn merge(
    run_dir: &Path,
    candidates: &[Candidate],
    flash_decisions: &[Decision<FlashEvent>],
    pro_decisions: &[Decision<ProResponse>],
    logger: &RunLogger,
) -> Result<Vec<FinalEvent>> {
    logger.stage_event(Stage::Postprocess, "stage_started", "starting merge")?;

    let mut by_rank: Vec<&Candidate> = candidates.iter().collect();
    by_rank.sort_by_key(|c| c.candidate_rank);

    let flash_by_packet: std::collections::HashMap<&str, &Decision<FlashEvent>> = flash_decisions
        .iter()
        .map(|d| (d.packet_id.as_str(), d))
        .collect();
    let pro_by_packet: std::collections::HashMap<&str, &Decision<ProResponse>> = pro_decisions
        .iter()
        .map(|d| (d.packet_id.as_str(), d))
        .collect();

    let mut final_events = Vec::new();
    let mut entries = Vec::new();
    let mut ordinal = 0usize;
    let mut pro_final_count = 0usize;
    let mut flash_only_count = 0usize;

    for candidate in &by_rank {
        let flash_decision = flash_by_packet.get(candidate.packet_id.as_str()).copied();
        let pro_decision = pro_by_packet.get(candidate.packet_id.as_str()).copied();

        let mut entry = TraceEntry {
            packet_id: candidate.packet_id.clone(),
            candidate_id: candidate.candidate_id.clone(),
            local_score: candidate.score,
            flash_status: flash_decision.map(|d| status_label(d.status)),
            pro_status: pro_decision.map(|d| status_label(d.status)),
            final_event_id: None,
            dropped_reason: None,
        };

        if let Some(pro) = pro_decision.and_then(|d| d.response.as_ref()) {
            ordinal += 1;
            let event_id = ids::event_id(ordinal, Some(&candidate.packet_id));
            let confidence = round3(0.45 * candidate.score + 0.55 * pro.confidence);
            let risk_score = round2(0.4 * (candidate.score * 100.0) + 0.6 * pro.risk_score);
            let event = FinalEvent {
                event_id: event_id.clone(),
                packet_id: candidate.packet_id.clone(),
                source_stage: SourceStage::ProFinal,
                event_type: pro.event_type,
                start_time: pro.start_time,
                end_time: pro.end_time,
                confidence,
                risk_score,
                plate_visible: pro.plate_visible,
                plate_number: pro.plate_number.clone(),
                plate_confidence: pro.plate_confidence,
                evidence_frames: candidate.anchor_frames.clone(),
                key_moments: pro.key_moments.clone(),
                explanation_short: pro.explanation_short.clone(),
                uncertain: pro.uncertain,
                uncertainty_reason: pro.uncertainty_reason.clone(),
            };
            entry.final_event_id = Some(event_id);
            pro_final_count += 1;
            final_events.push(event);
        } else if let Some(flash) = flash_decision
            .and_then(|d| d.response.as_ref())
            .filter(|ev| ev.is_relevant)
        {
            let is_pro_eligible = candidate.routing.sent_to_pro;
            if is_pro_eligible {
                // Sent to Pro but no Pro response at all (should not happen once
                // the executor always falls back): treat as dropped rather than
                // silently promoting an unvalidated Flash verdict.
                entry.dropped_reason = Some(last_reason(candidate, REASON_NOT_PROCESSED));
                entries.push(entry);
                continue;
            }
            ordinal += 1;
            let event_id = ids::event_id(ordinal, Some(&candidate.packet_id));
            let confidence = round3(0.45 * candidate.score + 0.55 * flash.confidence);
            let risk_score = round2(0.7 * candidate.score * 100.0);
            let event = FinalEvent {
                event_id: event_id.clone(),
                packet_id: candidate.packet_id.clone(),
                source_stage: SourceStage::FlashOnly,
                event_type: flash.event_type,
                start_time: flash.start_time,
                end_time: flash.end_time,
                confidence,
                risk_score,
                plate_visible: flash.plate_visible,
                plate_number: flash.plate_number.clone(),
                plate_confidence: flash.plate_confidence,
                evidence_frames: candidate.anchor_frames.clone(),
                key_moments: Vec::new(),
                explanation_short: None,
                uncertain: true,
                uncertainty_reason: Some("Not escalated to Pro".to_string()),
            };
            entry.final_event_id = Some(event_id);
            flash_only_count += 1;
            final_events.push(event);
        } else {
            let reason = if flash_decision.and_then(|d| d.response.as_ref()).is_some() {
                REASON_FLASH_NOT_RELEVANT.to_string()
            } else {
                last_reason(candidate, REASON_NOT_PROCESSED)
            };
            entry.dropped_reason = Some(reason);
        }

        entries.push(entry);
    }

    let dropped_packets = entries.iter().filter(|e| e.dropped_reason.is_some()).count();
    let trace = Trace {
        summary: TraceSummary {
            packets_total: candidates.len(),
            final_events: final_events.len(),
            dropped_packets,
            pro_final_events: pro_final_count,
            flash_only_events: flash_only_count,
        },
        entries,
    };

    write_json(run_dir, "events_final.json", &final_events)?;
    write_json(run_dir, "trace.json", &trace)?;

    logger.stage_event(
        Stage::Postprocess,
        "stage_completed",
        &format!(
            "merge complete: {} final events ({} pro, {} flash-only), {} dropped",
            final_events.len(),
            pro_final_count,
            flash_only_count,
            dropped_packets
        ),
    )?;

    Ok(final_events)
}

fn status_label(status: DecisionStatus) -> String {
    match status {
        DecisionStatus::Ok => "ok".to_string(),
        DecisionStatus::Fallback => "fallback".to_string(),
    }
}

fn last_reason(candidate: &Candidate, default: &str) -> String {
    candidate
        .routing
        .last_reason()
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn write_json<T: serde::Serialize>(run_dir: &Path, file_name: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| CascadeError::json(file_name, e))?;
    let path = run_dir.join(file_name);
    std::fs::write(&path, bytes).map_err(|e| CascadeError::io(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::model_client::ModelWindow;
    use crate::packet::{EventType, Routing};
    use std::collections::HashMap as StdHashMap;

    fn candidate(packet_id: &str, rank: usize, score: f64) -> Candidate {
        Candidate {
            packet_id: packet_id.to_string(),
            candidate_id: ids::candidate_id(rank + 1),
            candidate_rank: rank,
            event_type: EventType::RecklessDriving,
            start_s: 0.0,
            end_s: 2.0,
            score,
            anchor_frames: vec![],
            feature_snapshot: StdHashMap::new(),
            routing: Routing::default(),
        }
    }

    fn window() -> ModelWindow {
        ModelWindow { start_s: 0.0, end_s: 2.0 }
    }

    fn candidate_with_anchors(packet_id: &str, rank: usize, score: f64, anchor_frames: Vec<String>) -> Candidate {
        Candidate { anchor_frames, ..candidate(packet_id, rank, score) }
    }

    #[test]
    fn pro_final_blends_local_and_pro_scores() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), "run_merge_1").unwrap();
        let c = candidate("pkt_1", 0, 0.8);
        let flash = crate::flash::flash_fallback(&c);
        let pro = ProResponse {
            packet_id: "pkt_1".into(),
            candidate_id: c.candidate_id.clone(),
            event_type: EventType::RecklessDriving,
            confidence: 0.9,
            risk_score: 88.0,
            start_time: 0.0,
            end_time: 2.0,
            plate_visible: false,
            plate_number: None,
            plate_confidence: None,
            violator_description: None,
            evidence_frames: vec![],
            key_moments: vec![],
            explanation_short: None,
            uncertain: false,
            uncertainty_reason: None,
        };
        let flash_decisions = vec![Decision {
            packet_id: "pkt_1".into(),
            model: "gemini-flash".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(flash),
        }];
        let pro_decisions = vec![Decision {
            packet_id: "pkt_1".into(),
            model: "gemini-pro".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(pro),
        }];

        let events = merge(dir.path(), std::slice::from_ref(&c), &flash_decisions, &pro_decisions, &logger).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.source_stage, SourceStage::ProFinal);
        assert!((event.confidence - (0.45 * 0.8 + 0.55 * 0.9)).abs() < 1e-9);
        assert!((event.risk_score - (0.4 * 80.0 + 0.6 * 88.0)).abs() < 1e-9);
    }

    #[test]
    fn flash_only_is_always_uncertain() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), "run_merge_2").unwrap();
        let c = candidate("pkt_2", 0, 0.9);
        let flash = crate::flash::flash_fallback(&c);
        let flash_decisions = vec![Decision {
            packet_id: "pkt_2".into(),
            model: "gemini-flash".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(flash),
        }];

        let events = merge(dir.path(), std::slice::from_ref(&c), &flash_decisions, &[], &logger).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_stage, SourceStage::FlashOnly);
        assert!(events[0].uncertain);
    }

    #[test]
    fn pro_final_evidence_frames_come_from_candidate_anchors_not_pro_response() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), "run_merge_4").unwrap();
        let anchors = vec!["frame_001.jpg".to_string(), "frame_004.jpg".to_string()];
        let c = candidate_with_anchors("pkt_4", 0, 0.8, anchors.clone());
        let flash = crate::flash::flash_fallback(&c);
        let mut pro = ProResponse {
            packet_id: "pkt_4".into(),
            candidate_id: c.candidate_id.clone(),
            event_type: EventType::RecklessDriving,
            confidence: 0.9,
            risk_score: 88.0,
            start_time: 0.0,
            end_time: 2.0,
            plate_visible: false,
            plate_number: None,
            plate_confidence: None,
            violator_description: None,
            evidence_frames: vec![],
            key_moments: vec![],
            explanation_short: None,
            uncertain: false,
            uncertainty_reason: None,
        };
        // The model's own evidence_frames must be ignored in favor of the candidate's anchors.
        pro.evidence_frames = vec!["model_picked_this.jpg".to_string()];
        let flash_decisions = vec![Decision {
            packet_id: "pkt_4".into(),
            model: "gemini-flash".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(flash),
        }];
        let pro_decisions = vec![Decision {
            packet_id: "pkt_4".into(),
            model: "gemini-pro".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(pro),
        }];

        let events = merge(dir.path(), std::slice::from_ref(&c), &flash_decisions, &pro_decisions, &logger).unwrap();
        assert_eq!(events[0].evidence_frames, anchors);
    }

    #[test]
    fn flash_only_evidence_frames_come_from_candidate_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), "run_merge_5").unwrap();
        let anchors = vec!["frame_010.jpg".to_string()];
        let c = candidate_with_anchors("pkt_5", 0, 0.9, anchors.clone());
        let flash = crate::flash::flash_fallback(&c);
        let flash_decisions = vec![Decision {
            packet_id: "pkt_5".into(),
            model: "gemini-flash".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(flash),
        }];

        let events = merge(dir.path(), std::slice::from_ref(&c), &flash_decisions, &[], &logger).unwrap();
        assert_eq!(events[0].evidence_frames, anchors);
    }

    #[test]
    fn not_relevant_packet_is_dropped_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), "run_merge_3").unwrap();
        let c = candidate("pkt_3", 0, 0.1);
        let mut flash = crate::flash::flash_fallback(&c);
        flash.is_relevant = false;
        let flash_decisions = vec![Decision {
            packet_id: "pkt_3".into(),
            model: "gemini-flash".into(),
            request_window: window(),
            status: DecisionStatus::Ok,
            latency_ms: 10,
            error_detail: None,
            response: Some(flash),
        }];

        let events = merge(dir.path(), std::slice::from_ref(&c), &flash_decisions, &[], &logger).unwrap();
        assert!(events.is_empty());
        let trace: Trace = serde_json::from_slice(&std::fs::read(dir.path().join("trace.json")).unwrap()).unwrap();
        assert_eq!(trace.summary.dropped_packets, 1);
        assert_eq!(trace.entries[0].dropped_reason.as_deref(), Some(REASON_FLASH_NOT_RELEVANT));
    }
}
