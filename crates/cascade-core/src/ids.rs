//! Identifier formats for runs, candidates, packets, and final events.
//!
//! `packet_id` is the one identifier that must be immutable and propagate
//! unchanged through every downstream artifact; the others are generated
//! once at creation time.

use rand::Rng;

/// Generates a run id of the form `run_` followed by 10 lowercase hex chars.
#[must_use]
pub fn new_run_id() -> String {
    format!("run_{}", random_hex(5))
}

/// Generates a stable packet id. Packets are the unit of identity that
/// flows through Flash/Pro requests and every output artifact, so the id
/// carries no information about its position (unlike `candidate_id`, which
/// is a rank-ordered label) and is never recomputed.
#[must_use]
pub fn new_packet_id() -> String {
    format!("pkt_{}", random_hex(6))
}

/// Formats a candidate id as `cand_###` (zero-padded, 1-indexed by caller).
#[must_use]
pub fn candidate_id(ordinal: usize) -> String {
    format!("cand_{ordinal:03}")
}

/// Formats a final-event id as `evt_###` optionally suffixed with the
/// originating packet id, per the external interface contract.
#[must_use]
pub fn event_id(ordinal: usize, packet_id: Option<&str>) -> String {
    match packet_id {
        Some(pid) => format!("evt_{ordinal:03}_{pid}"),
        None => format!("evt_{ordinal:03}"),
    }
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; bytes];
    rng.fill(buf.as_mut_slice());
    hex::encode(buf)
}
