//! Error taxonomy for the cascade pipeline.
//!
//! Errors are split into stage-fatal conditions (the whole run transitions to
//! `FAILED`) and per-packet conditions, which the cascade executor always
//! resolves locally via a deterministic fallback rather than propagating.

use thiserror::Error;

/// Machine-readable error codes surfaced in run status and log records.
///
/// # Invariants
/// - Variants are stable for serialization; new codes are additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The video container could not be opened or probed.
    IngestDecodeError,
    /// Uploading the source media to the model backend failed.
    MediaUploadFailed,
    /// A Flash/Pro response's `packet_id` did not match the request.
    SchemaPacketMismatch,
    /// A Flash response failed schema validation.
    FlashSchemaValidationFailed,
    /// A Pro response failed schema validation.
    ProSchemaValidationFailed,
    /// A model call exceeded its per-attempt deadline.
    RequestTimeout,
    /// A model call failed for a transient, retryable reason.
    TransientRequestError,
    /// A run status transition was requested for an unknown run.
    RunNotFound,
    /// A status transition was requested that is not reachable from the
    /// run's current state.
    InvalidTransition,
}

/// Top-level error type for cascade-core operations.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// The run store has no record for the given run id.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run id that was looked up.
        run_id: String,
    },

    /// A stage failed in a way that is fatal for the whole run.
    #[error("stage {stage} failed: {message} ({code:?})")]
    StageFatal {
        /// The stage that failed.
        stage: String,
        /// Human-readable detail.
        message: String,
        /// Machine-readable error code.
        code: ErrorCode,
    },

    /// Underlying I/O failure (reading/writing run artifacts).
    #[error("io error at {path}: {source}")]
    Io {
        /// Path being read or written.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A JSON artifact failed to parse or serialize.
    #[error("json error at {context}: {source}")]
    Json {
        /// Description of what was being (de)serialized.
        context: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience result alias used throughout cascade-core.
pub type Result<T> = std::result::Result<T, CascadeError>;

impl CascadeError {
    /// Wrap an I/O error with the path that was being accessed.
    #[must_use]
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a JSON (de)serialization error with a short description.
    #[must_use]
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }
}
