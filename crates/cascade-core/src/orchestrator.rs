//! Drives one run end-to-end: ingest, local proposals, the cascade
//! executor, merge, and the terminal review/export states. Owns the state
//! machine transitions recorded in `status.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cascade::{CascadeExecutor, CascadeMetrics};
use crate::config::{PerfConfig, ProposalConfig, RoiConfig};
use crate::error::{CascadeError, ErrorCode, Result};
use crate::ids;
use crate::ingest;
use crate::merge;
use crate::proposal;
use crate::run_logger::RunLogger;
use crate::run_status::{RunRecord, RunState, Stage};
use crate::run_store::RunStore;

const PROGRESS_INGEST: u8 = 5;
const PROGRESS_PROPOSALS: u8 = 30;
const PROGRESS_FLASH_FLOOR: u8 = 55;
const PROGRESS_PRO_CEIL: u8 = 79;
const PROGRESS_POSTPROCESS: u8 = 80;
const PROGRESS_READY: u8 = 95;
const PROGRESS_EXPORT: u8 = 100;

/// Configuration paths the orchestrator loads once per run.
pub struct ConfigPaths {
    pub perf_config: PathBuf,
    pub roi_config: PathBuf,
    pub proposal_config: PathBuf,
}

/// Ties the run store, config, and cascade executor together into the
/// single entry point a CLI or service surface calls.
pub struct Orchestrator {
    store: Arc<RunStore>,
    executor: Arc<CascadeExecutor>,
    config_paths: ConfigPaths,
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: Arc<RunStore>, executor: Arc<CascadeExecutor>, config_paths: ConfigPaths) -> Self {
        Self {
            store,
            executor,
            config_paths,
        }
    }

    /// Registers and runs a new pipeline over `video_path`, returning the
    /// assigned run id once the run reaches `READY_FOR_REVIEW` or `FAILED`.
    ///
    /// A stage-fatal error transitions the run to `FAILED` and is also
    /// returned to the caller; every other error surfaces only through the
    /// run record (packet-level failures are always absorbed into a
    /// fallback by the cascade executor).
    pub async fn run(&self, video_path: &Path) -> Result<String> {
        let run_id = ids::new_run_id();
        self.store.register(RunRecord::new(&run_id))?;
        let run_dir = self.store.run_dir(&run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| CascadeError::io(run_dir.display().to_string(), e))?;

        let logger = Arc::new(RunLogger::open(&run_dir, &run_id)?);

        match self.run_inner(&run_id, &run_dir, video_path, Arc::clone(&logger)).await {
            Ok(()) => Ok(run_id),
            Err(e) => {
                self.store.mark_failed(&run_id, e.to_string())?;
                Err(e)
            }
        }
    }

    async fn run_inner(&self, run_id: &str, run_dir: &Path, video_path: &Path, logger: Arc<RunLogger>) -> Result<()> {
        let perf = PerfConfig::load_or_default(&self.config_paths.perf_config);
        let roi_cfg = RoiConfig::load_or_default(&self.config_paths.roi_config);
        let proposal_cfg = ProposalConfig::load_or_default(&self.config_paths.proposal_config);

        self.store.update_status(run_id, |r| {
            r.advance(Stage::Ingest, PROGRESS_INGEST, Some("decoding source video".to_string()));
        })?;

        let run_dir_owned = run_dir.to_path_buf();
        let video_path_owned = video_path.to_path_buf();
        let (fps_short, fps_long, long_threshold) =
            (perf.analysis_fps_short, perf.analysis_fps_long, perf.long_video_threshold_sec);
        let ingest_logger = Arc::clone(&logger);
        let manifest = tokio::task::spawn_blocking(move || {
            ingest::ingest(&video_path_owned, &run_dir_owned, fps_short, fps_long, long_threshold, &ingest_logger)
        })
        .await
        .map_err(|e| CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: format!("ingest task panicked: {e}"),
            code: ErrorCode::IngestDecodeError,
        })??;

        self.store.update_status(run_id, |r| {
            r.advance(Stage::LocalProposals, PROGRESS_PROPOSALS, Some("scanning local signals".to_string()));
        })?;

        let run_dir_owned = run_dir.to_path_buf();
        let roi_cfg_owned = roi_cfg.clone();
        let proposal_cfg_owned = proposal_cfg.clone();
        let proposal_logger = Arc::clone(&logger);
        let mut candidates = tokio::task::spawn_blocking(move || {
            proposal::propose(&manifest, &run_dir_owned, &roi_cfg_owned, &proposal_cfg_owned, &proposal_logger)
        })
        .await
        .map_err(|e| CascadeError::StageFatal {
            stage: "LOCAL_PROPOSALS".to_string(),
            message: format!("proposal task panicked: {e}"),
            code: ErrorCode::IngestDecodeError,
        })??;

        self.store.update_status(run_id, |r| {
            r.advance(Stage::GeminiFlash, PROGRESS_FLASH_FLOOR, Some("starting Flash tier".to_string()));
        })?;

        let store = Arc::clone(&self.store);
        let run_id_for_cb = run_id.to_string();
        let progress_cb: crate::cascade::ProgressCb = Arc::new(move |metrics: &CascadeMetrics| {
            let pct = cascade_progress_pct(metrics);
            let _ = store.update_status(&run_id_for_cb, |r| {
                r.advance(Stage::GeminiFlash, pct, None);
                r.metrics.insert(
                    "cascade".to_string(),
                    serde_json::to_value(metrics).unwrap_or(serde_json::Value::Null),
                );
            });
        });

        let (flash_ms, pro_ms) = self
            .executor
            .analyze(run_dir, video_path, &mut candidates, &perf, &logger, progress_cb)
            .await?;

        self.store.update_status(run_id, |r| {
            r.advance(Stage::Postprocess, PROGRESS_POSTPROCESS, Some("merging decisions".to_string()));
            r.timings_ms.insert("flash_ms".to_string(), flash_ms);
            r.timings_ms.insert("pro_ms".to_string(), pro_ms);
        })?;

        let flash_decisions: Vec<crate::decision::Decision<crate::flash::FlashEvent>> =
            read_json(run_dir, "flash_decisions.json")?;
        let pro_decisions: Vec<crate::decision::Decision<crate::pro::ProResponse>> =
            read_json(run_dir, "pro_decisions.json")?;

        merge::merge(run_dir, &candidates, &flash_decisions, &pro_decisions, &logger)?;

        self.store.update_status(run_id, |r| {
            r.advance(Stage::ReadyForReview, PROGRESS_READY, Some("ready for review".to_string()));
            r.state = RunState::ReadyForReview;
        })?;

        Ok(())
    }

    /// Transitions a run from `READY_FOR_REVIEW` to `EXPORTED`. Fails with
    /// `InvalidTransition` from any other state.
    pub fn export(&self, run_id: &str) -> Result<RunRecord> {
        let current = self.store.get(run_id)?;
        if current.state != RunState::ReadyForReview {
            return Err(CascadeError::StageFatal {
                stage: "EXPORT".to_string(),
                message: format!("cannot export from state {:?}", current.state),
                code: ErrorCode::InvalidTransition,
            });
        }
        self.store.update_status(run_id, |r| {
            r.advance(Stage::Export, PROGRESS_EXPORT, Some("exported".to_string()));
            r.state = RunState::Exported;
        })
    }
}

/// Maps cascade metrics onto the `[55, 79]` progress band regardless of what
/// fraction the executor itself would compute, per the documented contract
/// that Flash/Pro progress never escapes that window.
fn cascade_progress_pct(metrics: &CascadeMetrics) -> u8 {
    let total_work = metrics.packets_sent_flash + metrics.packets_sent_pro;
    if total_work == 0 {
        return PROGRESS_FLASH_FLOOR;
    }
    let done = metrics.flash_done + metrics.pro_done;
    let fraction = (done as f64 / total_work as f64).clamp(0.0, 1.0);
    let span = f64::from(PROGRESS_PRO_CEIL - PROGRESS_FLASH_FLOOR);
    (f64::from(PROGRESS_FLASH_FLOOR) + fraction * span).round() as u8
}

fn read_json<T: serde::de::DeserializeOwned>(run_dir: &Path, file_name: &str) -> Result<T> {
    let path = run_dir.join(file_name);
    let bytes = std::fs::read(&path).map_err(|e| CascadeError::io(path.display().to_string(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| CascadeError::json(file_name, e))
}
