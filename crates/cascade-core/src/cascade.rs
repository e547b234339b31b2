//! The cascade executor: Flash admission, bounded-concurrency model
//! invocation with retry/backoff/timeout, Flash→Pro routing, and the
//! metrics published back to the orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::PerfConfig;
use crate::decision::{Decision, DecisionStatus};
use crate::error::{CascadeError, ErrorCode, Result};
use crate::flash::{flash_fallback, FlashEvent};
use crate::model_client::{GenerateRequest, MediaHandle, ModelClient, ModelTier, ModelWindow};
use crate::packet::{Candidate, EventType};
use crate::pro::{pro_fallback, ProResponse};
use crate::run_logger::{LogLevel, RunLogger};
use crate::run_status::Stage;

/// Snapshot of cascade progress, published through `progress_cb` as the two
/// tiers run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeMetrics {
    pub packets_total: usize,
    pub packets_sent_flash: usize,
    pub packets_sent_pro: usize,
    pub packets_finalized: usize,
    pub packets_dropped: usize,
    pub flash_done: usize,
    pub pro_done: usize,
    pub flash_errors: usize,
    pub pro_errors: usize,
    pub flash_concurrency: usize,
    pub pro_concurrency: usize,
    pub pro_queued: usize,
    pub flash_uncertain: usize,
    pub flash_relevant: usize,
    pub flash_min_local_score: f64,
    pub pro_uncertain_conf_low: f64,
    pub pro_uncertain_conf_high: f64,
}

/// Callback invoked whenever the executor's metrics change.
pub type ProgressCb = Arc<dyn Fn(&CascadeMetrics) + Send + Sync>;

const REASON_BELOW_THRESHOLD: &str = "local_score_below_flash_threshold";
const REASON_FLASH_K_LIMIT: &str = "flash_k_limit";
const REASON_FLASH_NOT_RELEVANT: &str = "flash_not_relevant";
const REASON_FLASH_CONFIDENT_NO_PRO: &str = "flash_confident_no_pro";
const REASON_PRO_K_LIMIT: &str = "pro_k_limit";

/// Builds the Flash selection: diversity seed per event type (highest
/// scoring eligible candidate per type, in rank order), then score fill,
/// capped at `max_candidates`. `candidates` is assumed sorted by score
/// descending (the proposal engine's output order). Returns selected
/// indices in submission order.
///
/// If no candidate meets `min_score`, the single top candidate is kept
/// regardless, so a run is always inspectable.
fn select_flash_candidates(
    candidates: &[Candidate],
    min_score: f64,
    max_candidates: usize,
) -> Vec<usize> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut eligible: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].score >= min_score)
        .collect();
    if eligible.is_empty() {
        eligible.push(0);
    }

    let mut selected = Vec::new();
    let mut seen_types = std::collections::HashSet::new();
    for event_type in EventType::all() {
        if selected.len() >= max_candidates {
            break;
        }
        if let Some(&idx) = eligible
            .iter()
            .find(|&&i| candidates[i].event_type == event_type && !seen_types.contains(&i))
        {
            selected.push(idx);
            seen_types.insert(idx);
        }
    }
    for &idx in &eligible {
        if selected.len() >= max_candidates {
            break;
        }
        if !seen_types.contains(&idx) {
            selected.push(idx);
            seen_types.insert(idx);
        }
    }
    selected
}

/// Annotates every candidate not selected for Flash with the reason it was
/// excluded.
fn annotate_unselected(candidates: &mut [Candidate], selected: &[usize], min_score: f64) {
    let selected_set: std::collections::HashSet<usize> = selected.iter().copied().collect();
    for (idx, candidate) in candidates.iter_mut().enumerate() {
        if selected_set.contains(&idx) {
            continue;
        }
        if candidate.score < min_score {
            candidate.routing.add_reason(REASON_BELOW_THRESHOLD);
        } else {
            candidate.routing.add_reason(REASON_FLASH_K_LIMIT);
        }
    }
}

/// Calls `client.generate` under `timeout`, retrying up to `retry_attempts`
/// times with `2^attempt` second backoff between attempts. Returns the raw
/// JSON response and total latency, or the error code/message of the last
/// failed attempt.
async fn call_with_retry(
    client: &dyn ModelClient,
    tier: ModelTier,
    media: &MediaHandle,
    packet_id: &str,
    candidate_id: &str,
    event_type: EventType,
    window: ModelWindow,
    fps: u32,
    timeout: Duration,
    retry_attempts: u32,
) -> (Duration, std::result::Result<serde_json::Value, (ErrorCode, String)>) {
    let started = Instant::now();
    let mut last_err = (ErrorCode::TransientRequestError, "no attempts made".to_string());

    for attempt in 0..=retry_attempts {
        let request = GenerateRequest {
            packet_id,
            candidate_id,
            event_type,
            window,
            fps,
        };
        match tokio::time::timeout(timeout, client.generate(tier, media, request)).await {
            Ok(Ok(value)) => return (started.elapsed(), Ok(value)),
            Ok(Err(model_err)) => {
                last_err = (ErrorCode::TransientRequestError, model_err.to_string());
            }
            Err(_elapsed) => {
                last_err = (
                    ErrorCode::RequestTimeout,
                    format!("timed out after {timeout:?}"),
                );
            }
        }
        if attempt < retry_attempts {
            tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
        }
    }
    (started.elapsed(), Err(last_err))
}

/// Validates that `value.packet_id == expected`, returning the schema
/// mismatch error code if not.
fn check_packet_id(value: &serde_json::Value, expected: &str) -> std::result::Result<(), (ErrorCode, String)> {
    match value.get("packet_id").and_then(serde_json::Value::as_str) {
        Some(pid) if pid == expected => Ok(()),
        Some(pid) => Err((
            ErrorCode::SchemaPacketMismatch,
            format!("response packet_id '{pid}' != expected '{expected}'"),
        )),
        None => Err((
            ErrorCode::SchemaPacketMismatch,
            "response missing packet_id".to_string(),
        )),
    }
}

/// Drives the Flash and Pro tiers over a run's candidates.
pub struct CascadeExecutor {
    client: Arc<dyn ModelClient>,
}

impl CascadeExecutor {
    #[must_use]
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    /// Runs both tiers over `candidates`, mutating each candidate's
    /// `routing` in place, and writes every stage artifact under `run_dir`.
    /// Returns `(flash_elapsed_ms, pro_elapsed_ms)`.
    pub async fn analyze(
        &self,
        run_dir: &Path,
        video_path: &Path,
        candidates: &mut [Candidate],
        perf: &PerfConfig,
        logger: &RunLogger,
        progress_cb: ProgressCb,
    ) -> Result<(u64, u64)> {
        let mut metrics = CascadeMetrics {
            packets_total: candidates.len(),
            flash_concurrency: perf.gemini_flash_concurrency,
            pro_concurrency: perf.gemini_pro_concurrency,
            flash_min_local_score: perf.flash_min_local_score,
            pro_uncertain_conf_low: perf.pro_uncertain_conf_low,
            pro_uncertain_conf_high: perf.pro_uncertain_conf_high,
            ..Default::default()
        };
        progress_cb(&metrics);

        logger.stage_event(Stage::GeminiFlash, "stage_started", "starting Flash tier")?;
        let flash_start = Instant::now();

        let selected = select_flash_candidates(candidates, perf.flash_min_local_score, perf.gemini_flash_max_candidates);
        annotate_unselected(candidates, &selected, perf.flash_min_local_score);
        metrics.packets_sent_flash = selected.len();

        let media = self.upload_and_activate(video_path, logger).await;

        let flash_decisions = self
            .run_flash_tier(candidates, &selected, media.as_ref(), perf)
            .await;
        let flash_elapsed_ms = flash_start.elapsed().as_millis() as u64;

        for (&idx, decision) in selected.iter().zip(flash_decisions.iter()) {
            candidates[idx].routing.sent_to_flash = true;
            match decision.status {
                DecisionStatus::Ok => {}
                DecisionStatus::Fallback => metrics.flash_errors += 1,
            }
            metrics.flash_done += 1;
            if let Some(ev) = &decision.response {
                if ev.is_relevant {
                    metrics.flash_relevant += 1;
                }
                if ev.uncertain {
                    metrics.flash_uncertain += 1;
                }
            }
        }
        progress_cb(&metrics);

        write_json(run_dir, "flash_decisions.json", &flash_decisions)?;
        write_json(
            run_dir,
            "flash_events.json",
            &flash_decisions.iter().filter_map(|d| d.response.clone()).collect::<Vec<_>>(),
        )?;
        logger.stage_event(
            Stage::GeminiFlash,
            "stage_completed",
            &format!("{} Flash decisions", flash_decisions.len()),
        )?;

        logger.stage_event(Stage::GeminiPro, "stage_started", "starting Pro tier")?;
        let pro_start = Instant::now();

        let pro_eligible = self.route_to_pro(candidates, &selected, &flash_decisions, perf);
        metrics.packets_sent_pro = pro_eligible.len();
        metrics.pro_queued = pro_eligible.len();

        let pro_decisions = self
            .run_pro_tier(candidates, &selected, &flash_decisions, &pro_eligible, media.as_ref(), perf)
            .await;
        let pro_elapsed_ms = pro_start.elapsed().as_millis() as u64;

        for (&idx, decision) in pro_eligible.iter().zip(pro_decisions.iter()) {
            candidates[idx].routing.sent_to_pro = true;
            match decision.status {
                DecisionStatus::Ok => {}
                DecisionStatus::Fallback => metrics.pro_errors += 1,
            }
            metrics.pro_done += 1;
        }

        write_json(run_dir, "pro_decisions.json", &pro_decisions)?;
        write_json(
            run_dir,
            "pro_events.json",
            &pro_decisions.iter().filter_map(|d| d.response.clone()).collect::<Vec<_>>(),
        )?;

        let flash_only_finalized = selected
            .iter()
            .zip(flash_decisions.iter())
            .filter(|(idx, _)| !pro_eligible.contains(idx))
            .filter(|(_, d)| d.response.as_ref().is_some_and(|ev| ev.is_relevant))
            .count();
        metrics.packets_finalized = pro_decisions.iter().filter(|d| d.has_response()).count() + flash_only_finalized;
        metrics.packets_dropped = metrics.packets_total.saturating_sub(metrics.packets_finalized);
        progress_cb(&metrics);

        logger.stage_event(
            Stage::GeminiPro,
            "stage_completed",
            &format!("{} Pro decisions", pro_decisions.len()),
        )?;

        Ok((flash_elapsed_ms, pro_elapsed_ms))
    }

    async fn upload_and_activate(&self, video_path: &Path, logger: &RunLogger) -> Option<MediaHandle> {
        let handle = match self.client.upload_media(video_path).await {
            Ok(h) => h,
            Err(e) => {
                let _ = logger.log(
                    Stage::GeminiFlash,
                    LogLevel::Warning,
                    "media_upload_failed",
                    &format!("media upload failed: {e}; proceeding in fallback mode"),
                    None,
                    None,
                    Some("MEDIA_UPLOAD_FAILED"),
                );
                return None;
            }
        };
        match self.client.poll_until_active(&handle).await {
            Ok(()) => Some(handle),
            Err(e) => {
                let _ = logger.log(
                    Stage::GeminiFlash,
                    LogLevel::Warning,
                    "media_upload_failed",
                    &format!("media never became active: {e}; proceeding in fallback mode"),
                    None,
                    None,
                    Some("MEDIA_UPLOAD_FAILED"),
                );
                None
            }
        }
    }

    async fn run_flash_tier(
        &self,
        candidates: &[Candidate],
        selected: &[usize],
        media: Option<&MediaHandle>,
        perf: &PerfConfig,
    ) -> Vec<Decision<FlashEvent>> {
        let Some(media) = media else {
            return selected
                .iter()
                .map(|&idx| fallback_flash_decision(&candidates[idx]))
                .collect();
        };

        let semaphore = Arc::new(Semaphore::new(perf.gemini_flash_concurrency.max(1)));
        let client = Arc::clone(&self.client);
        let timeout = Duration::from_secs(perf.gemini_flash_timeout_sec);
        let retries = perf.gemini_retry_attempts;
        let (uncertain_low, uncertain_high) = perf.normalized_uncertain_band();
        let media = media.clone();

        let mut handles = Vec::with_capacity(selected.len());
        for &idx in selected {
            let candidate = candidates[idx].clone();
            let client = Arc::clone(&client);
            let semaphore = Arc::clone(&semaphore);
            let media = media.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let window = ModelWindow {
                    start_s: candidate.start_s,
                    end_s: candidate.end_s,
                };
                let (latency, outcome) = call_with_retry(
                    client.as_ref(),
                    ModelTier::Flash,
                    &media,
                    &candidate.packet_id,
                    &candidate.candidate_id,
                    candidate.event_type,
                    window,
                    2,
                    timeout,
                    retries,
                )
                .await;

                build_flash_decision(&candidate, latency, outcome, uncertain_low, uncertain_high)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(decision) => decision,
                Err(_join_err) => fallback_flash_decision(&candidates[selected[results.len()]]),
            });
        }
        results
    }

    fn route_to_pro(
        &self,
        candidates: &mut [Candidate],
        selected: &[usize],
        flash_decisions: &[Decision<FlashEvent>],
        perf: &PerfConfig,
    ) -> Vec<usize> {
        let (uncertain_low, uncertain_high) = perf.normalized_uncertain_band();
        let mut scored: Vec<(usize, f64)> = Vec::new();

        for (&idx, decision) in selected.iter().zip(flash_decisions.iter()) {
            let Some(flash) = &decision.response else {
                continue;
            };
            if !flash.is_relevant {
                candidates[idx].routing.add_reason(REASON_FLASH_NOT_RELEVANT);
                continue;
            }
            // Deliberately does not also admit on `decision.status == Fallback`:
            // the deterministic Flash fallback already derives `uncertain` from
            // the same score threshold (see `flash::flash_fallback`), so a
            // confident fallback (e.g. score 0.9, no API available) stays
            // FLASH_ONLY rather than escalating for no reason.
            let in_band = flash.confidence >= uncertain_low && flash.confidence < uncertain_high;
            let eligible = flash.uncertain || in_band;
            if !eligible {
                candidates[idx].routing.add_reason(REASON_FLASH_CONFIDENT_NO_PRO);
                continue;
            }
            let plate_bonus = if flash.plate_visible { 0.1 } else { 0.0 };
            let priority = (1.0 - flash.confidence) + 0.5 * candidates[idx].score + plate_bonus;
            scored.push((idx, priority));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let pro_max_candidates = perf.gemini_pro_max_candidates;
        let (kept, overflow) = if scored.len() > pro_max_candidates {
            scored.split_at(pro_max_candidates)
        } else {
            (scored.as_slice(), &[][..])
        };
        for &(idx, _) in overflow {
            candidates[idx].routing.add_reason(REASON_PRO_K_LIMIT);
        }
        kept.iter().map(|(idx, _)| *idx).collect()
    }

    async fn run_pro_tier(
        &self,
        candidates: &[Candidate],
        selected: &[usize],
        flash_decisions: &[Decision<FlashEvent>],
        pro_eligible: &[usize],
        media: Option<&MediaHandle>,
        perf: &PerfConfig,
    ) -> Vec<Decision<ProResponse>> {
        let flash_for = |idx: usize| -> FlashEvent {
            let pos = selected.iter().position(|&s| s == idx).expect("pro-eligible index must have a Flash decision");
            flash_decisions[pos]
                .response
                .clone()
                .unwrap_or_else(|| flash_fallback(&candidates[idx]))
        };

        let Some(media) = media else {
            return pro_eligible
                .iter()
                .enumerate()
                .map(|(ordinal, &idx)| {
                    let flash = flash_for(idx);
                    fallback_pro_decision(&candidates[idx], &flash, ordinal + 1)
                })
                .collect();
        };

        let semaphore = Arc::new(Semaphore::new(perf.gemini_pro_concurrency.max(1)));
        let client = Arc::clone(&self.client);
        let timeout = Duration::from_secs(perf.gemini_pro_timeout_sec);
        let retries = perf.gemini_retry_attempts;
        let media = media.clone();

        let mut handles = Vec::with_capacity(pro_eligible.len());
        for (ordinal, &idx) in pro_eligible.iter().enumerate() {
            let candidate = candidates[idx].clone();
            let flash = flash_for(idx);
            let client = Arc::clone(&client);
            let semaphore = Arc::clone(&semaphore);
            let media = media.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let window = ModelWindow {
                    start_s: candidate.start_s,
                    end_s: candidate.end_s,
                };
                let fps = if candidate.event_type == EventType::RecklessDriving { 4 } else { 2 };
                let (latency, outcome) = call_with_retry(
                    client.as_ref(),
                    ModelTier::Pro,
                    &media,
                    &candidate.packet_id,
                    &candidate.candidate_id,
                    candidate.event_type,
                    window,
                    fps,
                    timeout,
                    retries,
                )
                .await;

                build_pro_decision(&candidate, &flash, ordinal + 1, latency, outcome)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (ordinal, handle) in handles.into_iter().enumerate() {
            results.push(match handle.await {
                Ok(decision) => decision,
                Err(_join_err) => {
                    let idx = pro_eligible[ordinal];
                    let flash = flash_for(idx);
                    fallback_pro_decision(&candidates[idx], &flash, ordinal + 1)
                }
            });
        }
        results
    }
}

fn fallback_flash_decision(candidate: &Candidate) -> Decision<FlashEvent> {
    Decision {
        packet_id: candidate.packet_id.clone(),
        model: "fallback".to_string(),
        request_window: ModelWindow {
            start_s: candidate.start_s,
            end_s: candidate.end_s,
        },
        status: DecisionStatus::Fallback,
        latency_ms: 0,
        error_detail: Some("media unavailable".to_string()),
        response: Some(flash_fallback(candidate)),
    }
}

fn build_flash_decision(
    candidate: &Candidate,
    latency: Duration,
    outcome: std::result::Result<serde_json::Value, (ErrorCode, String)>,
    uncertain_low: f64,
    uncertain_high: f64,
) -> Decision<FlashEvent> {
    let window = ModelWindow {
        start_s: candidate.start_s,
        end_s: candidate.end_s,
    };
    let latency_ms = latency.as_millis() as u64;

    match outcome {
        Ok(value) => {
            if let Err((code, message)) = check_packet_id(&value, &candidate.packet_id) {
                return Decision {
                    packet_id: candidate.packet_id.clone(),
                    model: "gemini-flash".to_string(),
                    request_window: window,
                    status: DecisionStatus::Fallback,
                    latency_ms,
                    error_detail: Some(format!("{code:?}: {message}")),
                    response: Some(flash_fallback(candidate)),
                };
            }
            match serde_json::from_value::<FlashEvent>(value) {
                Ok(mut ev) => {
                    ev.postprocess_uncertainty(uncertain_low, uncertain_high);
                    Decision {
                        packet_id: candidate.packet_id.clone(),
                        model: "gemini-flash".to_string(),
                        request_window: window,
                        status: DecisionStatus::Ok,
                        latency_ms,
                        error_detail: None,
                        response: Some(ev),
                    }
                }
                Err(e) => Decision {
                    packet_id: candidate.packet_id.clone(),
                    model: "gemini-flash".to_string(),
                    request_window: window,
                    status: DecisionStatus::Fallback,
                    latency_ms,
                    error_detail: Some(format!("FLASH_SCHEMA_VALIDATION_FAILED: {e}")),
                    response: Some(flash_fallback(candidate)),
                },
            }
        }
        Err((code, message)) => Decision {
            packet_id: candidate.packet_id.clone(),
            model: "gemini-flash".to_string(),
            request_window: window,
            status: DecisionStatus::Fallback,
            latency_ms,
            error_detail: Some(format!("{code:?}: {message}")),
            response: Some(flash_fallback(candidate)),
        },
    }
}

fn fallback_pro_decision(candidate: &Candidate, flash: &FlashEvent, ordinal: usize) -> Decision<ProResponse> {
    Decision {
        packet_id: candidate.packet_id.clone(),
        model: "fallback".to_string(),
        request_window: ModelWindow {
            start_s: candidate.start_s,
            end_s: candidate.end_s,
        },
        status: DecisionStatus::Fallback,
        latency_ms: 0,
        error_detail: Some("media unavailable".to_string()),
        response: Some(pro_fallback(candidate, flash, ordinal)),
    }
}

fn build_pro_decision(
    candidate: &Candidate,
    flash: &FlashEvent,
    ordinal: usize,
    latency: Duration,
    outcome: std::result::Result<serde_json::Value, (ErrorCode, String)>,
) -> Decision<ProResponse> {
    let window = ModelWindow {
        start_s: candidate.start_s,
        end_s: candidate.end_s,
    };
    let latency_ms = latency.as_millis() as u64;

    match outcome {
        Ok(value) => {
            if let Err((code, message)) = check_packet_id(&value, &candidate.packet_id) {
                return Decision {
                    packet_id: candidate.packet_id.clone(),
                    model: "gemini-pro".to_string(),
                    request_window: window,
                    status: DecisionStatus::Fallback,
                    latency_ms,
                    error_detail: Some(format!("{code:?}: {message}")),
                    response: Some(pro_fallback(candidate, flash, ordinal)),
                };
            }
            match serde_json::from_value::<ProResponse>(value) {
                Ok(resp) => Decision {
                    packet_id: candidate.packet_id.clone(),
                    model: "gemini-pro".to_string(),
                    request_window: window,
                    status: DecisionStatus::Ok,
                    latency_ms,
                    error_detail: None,
                    response: Some(resp),
                },
                Err(e) => Decision {
                    packet_id: candidate.packet_id.clone(),
                    model: "gemini-pro".to_string(),
                    request_window: window,
                    status: DecisionStatus::Fallback,
                    latency_ms,
                    error_detail: Some(format!("PRO_SCHEMA_VALIDATION_FAILED: {e}")),
                    response: Some(pro_fallback(candidate, flash, ordinal)),
                },
            }
        }
        Err((code, message)) => Decision {
            packet_id: candidate.packet_id.clone(),
            model: "gemini-pro".to_string(),
            request_window: window,
            status: DecisionStatus::Fallback,
            latency_ms,
            error_detail: Some(format!("{code:?}: {message}")),
            response: Some(pro_fallback(candidate, flash, ordinal)),
        },
    }
}

fn write_json<T: Serialize>(run_dir: &Path, file_name: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| CascadeError::json(file_name, e))?;
    let path = run_dir.join(file_name);
    std::fs::write(&path, bytes).map_err(|e| CascadeError::io(path.display().to_string(), e))
}
