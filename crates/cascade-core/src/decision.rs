//! Per-packet decision envelopes, persisted as `flash_decisions.json` and
//! `pro_decisions.json`.

use serde::{Deserialize, Serialize};

use crate::model_client::ModelWindow;

/// Whether a tier invocation for a packet succeeded or had to fall back to
/// the deterministic local substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// The model call succeeded and validated.
    Ok,
    /// A deterministic local fallback was used instead of a model response.
    Fallback,
}

/// A per-packet envelope recorded for each tier, generic over the tier's
/// validated response type (`FlashEvent` or `ProResponse`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision<T> {
    /// The packet this decision covers. Must equal the originating
    /// candidate's `packet_id`.
    pub packet_id: String,
    /// Model identifier used for the call (or `"fallback"`).
    pub model: String,
    /// The request window sent to the model.
    pub request_window: ModelWindow,
    /// Whether the model call succeeded or a fallback was applied.
    pub status: DecisionStatus,
    /// Wall-clock latency of the call, summed across retries.
    pub latency_ms: u64,
    /// Machine-readable error code, present only when a fallback occurred.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_detail: Option<String>,
    /// The validated response, present for both `Ok` and `Fallback` (the
    /// fallback path synthesizes a response in the same shape).
    pub response: Option<T>,
}

impl<T> Decision<T> {
    /// Whether this decision's response, if present, is usable by
    /// downstream consumers (i.e. either an `Ok` model response or a
    /// synthesized fallback).
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }
}
