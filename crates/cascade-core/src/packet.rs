//! The `Candidate` (packet) data model and its routing sub-record.
//!
//! Packets are created exclusively by [`crate::proposal::ProposalEngine`].
//! Their `routing` field is the only mutable part of the graph in the core
//! and is mutated exclusively by the cascade executor's single collector
//! path (see `crate::cascade`) — worker tasks only ever return immutable
//! decisions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The four violation categories the pipeline can flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Rider without a helmet.
    NoHelmet,
    /// Vehicle entering an intersection after the signal has turned red.
    RedLightJump,
    /// Vehicle travelling against the expected flow of traffic.
    WrongSideDriving,
    /// Generic dangerous manoeuvre (speeding, weaving, near-miss).
    RecklessDriving,
}

impl EventType {
    /// All violation types, in a stable iteration order used for diversity
    /// seeding during Flash admission.
    #[must_use]
    pub const fn all() -> [EventType; 4] {
        [
            EventType::NoHelmet,
            EventType::RedLightJump,
            EventType::WrongSideDriving,
            EventType::RecklessDriving,
        ]
    }
}

/// Ordered, deduplicated routing reasons plus the two admission flags the
/// cascade executor is responsible for maintaining.
///
/// # Invariants
/// - `routing_reason` never contains a duplicate entry; later pushes of an
///   already-present reason are no-ops.
/// - A packet with `sent_to_pro == true` always has `sent_to_flash == true`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// Whether the packet was submitted to the Flash tier.
    pub sent_to_flash: bool,
    /// Whether the packet was submitted to the Pro tier.
    pub sent_to_pro: bool,
    /// Insertion-ordered, deduplicated routing reason tags.
    pub routing_reason: Vec<String>,
}

impl Routing {
    /// Appends a routing reason if it is not already present.
    pub fn add_reason(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.routing_reason.contains(&reason) {
            self.routing_reason.push(reason);
        }
    }

    /// The most recently added routing reason, if any.
    #[must_use]
    pub fn last_reason(&self) -> Option<&str> {
        self.routing_reason.last().map(String::as_str)
    }
}

/// A proposed time window in the video, produced by local heuristics and
/// carried unchanged (aside from its `routing` sub-record) through the rest
/// of the pipeline.
///
/// # Invariants
/// - `packet_id` is immutable once assigned and identical across
///   `Candidate`, every `FlashEvent`/`Decision` derived from it, and the
///   final `FinalEvent`/`Trace` entry.
/// - `start_s <= end_s`.
/// - `score` is in `[0, 1]`.
/// - `anchor_frames.len() <= 3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable, immutable identity propagated to every downstream artifact.
    pub packet_id: String,
    /// Rank-ordered label assigned at creation (`cand_###`).
    pub candidate_id: String,
    /// Ordinal rank among all candidates in the run, 0-based.
    pub candidate_rank: usize,
    /// The violation type this candidate was grouped under.
    pub event_type: EventType,
    /// Window start, in seconds from the start of the video.
    pub start_s: f64,
    /// Window end, in seconds from the start of the video.
    pub end_s: f64,
    /// Local heuristic score in `[0, 1]`.
    pub score: f64,
    /// Up to three representative frame paths.
    pub anchor_frames: Vec<String>,
    /// Numeric feature snapshot taken at the run's midpoint frame.
    pub feature_snapshot: HashMap<String, f64>,
    /// Mutable routing sub-record, owned by the cascade executor.
    #[serde(default)]
    pub routing: Routing,
}

impl Candidate {
    /// Duration of the candidate's window, in seconds.
    #[must_use]
    pub fn duration_s(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0)
    }

    /// Overlap, in seconds, between this candidate's window and another's.
    #[must_use]
    pub fn overlap_s(&self, other: &Candidate) -> f64 {
        let start = self.start_s.max(other.start_s);
        let end = self.end_s.min(other.end_s);
        (end - start).max(0.0)
    }
}
