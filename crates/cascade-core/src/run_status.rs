//! The per-run status record persisted to `status.json` and owned by
//! [`crate::run_store::RunStore`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    ReadyForReview,
    Exported,
    Failed,
}

/// Which stage of the pipeline a run is currently executing (or, if
/// `state == Failed`, the stage that was executing when it failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingest,
    LocalProposals,
    GeminiFlash,
    GeminiPro,
    Postprocess,
    ReadyForReview,
    Export,
}

/// The persisted record for one run.
///
/// # Invariants
/// - `progress_pct` never decreases while `state != Failed`; once `Failed`,
///   it is frozen at the value it held at the moment of failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    pub stage: Stage,
    pub progress_pct: u8,
    #[serde(default)]
    pub stage_message: Option<String>,
    #[serde(default)]
    pub failed_stage: Option<Stage>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub timings_ms: HashMap<String, u64>,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl RunRecord {
    /// A fresh record for a newly registered run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Pending,
            stage: Stage::Ingest,
            progress_pct: 0,
            stage_message: None,
            failed_stage: None,
            error_message: None,
            timings_ms: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    /// Advances the record to `stage` at `progress_pct`, clamping downward
    /// moves so progress never regresses.
    pub fn advance(&mut self, stage: Stage, progress_pct: u8, message: Option<String>) {
        self.state = RunState::Running;
        self.stage = stage;
        self.progress_pct = self.progress_pct.max(progress_pct);
        self.stage_message = message;
    }

    /// Marks the record failed at its current stage, freezing progress.
    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.state = RunState::Failed;
        self.failed_stage = Some(self.stage);
        self.error_message = Some(error_message.into());
    }
}
