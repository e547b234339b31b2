//! The merger's output record and its closed set of provenance sources.

use serde::{Deserialize, Serialize};

use crate::packet::EventType;

/// Where a `FinalEvent` came from. Downstream consumers switch on this tag,
/// never on structural shape, since both variants share a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStage {
    /// Pro tier produced a successful response.
    ProFinal,
    /// Flash was confident and relevant; the packet was never sent to Pro.
    FlashOnly,
}

/// A merged, reviewer-visible violation event.
///
/// # Invariants
/// - `0 <= confidence <= 1`.
/// - `0 <= risk_score <= 100`.
/// - `start_time <= end_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalEvent {
    pub event_id: String,
    pub packet_id: String,
    pub source_stage: SourceStage,
    pub event_type: EventType,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    pub risk_score: f64,
    #[serde(default)]
    pub plate_visible: bool,
    #[serde(default)]
    pub plate_number: Option<String>,
    #[serde(default)]
    pub plate_confidence: Option<f64>,
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

/// A per-packet provenance record: local features plus whatever decisions
/// were made, terminating in either a final event or a drop reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub packet_id: String,
    pub candidate_id: String,
    pub local_score: f64,
    #[serde(default)]
    pub flash_status: Option<String>,
    #[serde(default)]
    pub pro_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dropped_reason: Option<String>,
}

/// The `trace.json` summary block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub packets_total: usize,
    pub final_events: usize,
    pub dropped_packets: usize,
    pub pro_final_events: usize,
    pub flash_only_events: usize,
}

/// The full `trace.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    pub summary: TraceSummary,
    pub entries: Vec<TraceEntry>,
}
