//! Configuration knobs for the pipeline, with hard defaults matching the
//! documented contract. All config is optional on disk: a missing or
//! malformed file falls back to defaults rather than failing the run.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::packet::EventType;

/// Tunables for the cascade executor and proposal engine, loadable from a
/// TOML file (`config/perf_config.toml`) or constructed with defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    /// Tag only; carried into metrics, not interpreted.
    pub pipeline_mode: String,
    pub gemini_flash_max_candidates: usize,
    pub gemini_pro_max_candidates: usize,
    pub gemini_flash_concurrency: usize,
    pub gemini_pro_concurrency: usize,
    pub gemini_flash_timeout_sec: u64,
    pub gemini_pro_timeout_sec: u64,
    pub gemini_retry_attempts: u32,
    pub flash_min_local_score: f64,
    pub pro_uncertain_conf_low: f64,
    pub pro_uncertain_conf_high: f64,
    pub analysis_fps_short: u32,
    pub analysis_fps_long: u32,
    pub long_video_threshold_sec: f64,
    pub local_downscale_long_edge: u32,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            pipeline_mode: "standard".to_string(),
            gemini_flash_max_candidates: 6,
            gemini_pro_max_candidates: 3,
            gemini_flash_concurrency: 4,
            gemini_pro_concurrency: 2,
            gemini_flash_timeout_sec: 30,
            gemini_pro_timeout_sec: 45,
            gemini_retry_attempts: 2,
            flash_min_local_score: 0.4,
            pro_uncertain_conf_low: 0.45,
            pro_uncertain_conf_high: 0.82,
            analysis_fps_short: 4,
            analysis_fps_long: 2,
            long_video_threshold_sec: 300.0,
            local_downscale_long_edge: 960,
        }
    }
}

impl PerfConfig {
    /// Loads from `path`, falling back to defaults if the file is missing
    /// or fails to parse. Malformed config is never a fatal error (only
    /// `INGEST_DECODE_ERROR` is).
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| toml::from_str(&contents).ok())
            .unwrap_or_default()
    }

    /// Normalizes an inverted uncertain band (`low > high`) by swapping,
    /// per the documented tolerance for misconfigured knobs.
    #[must_use]
    pub fn normalized_uncertain_band(&self) -> (f64, f64) {
        if self.pro_uncertain_conf_low <= self.pro_uncertain_conf_high {
            (self.pro_uncertain_conf_low, self.pro_uncertain_conf_high)
        } else {
            (self.pro_uncertain_conf_high, self.pro_uncertain_conf_low)
        }
    }
}

/// A normalized polygon (points in `[0, 1] x [0, 1]`) defining a region of
/// interest in the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiPolygon {
    pub points: Vec<(f64, f64)>,
}

/// ROI configuration used by the proposal engine's per-frame signal
/// computation. Missing or malformed config falls back to an empty set of
/// ROIs, which simply yields no candidates for the ROI-gated event types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// ROI used for red-light-jump signal (red-channel dominance).
    pub signal_roi: Option<RoiPolygon>,
    /// ROI used for wrong-side-driving optical-flow comparison.
    pub wrong_side_roi: Option<RoiPolygon>,
    /// Expected direction vector (unit-normalized) for wrong-side driving.
    pub expected_direction: Option<(f64, f64)>,
}

impl RoiConfig {
    /// Loads from `path`, falling back to an empty (all-`None`)
    /// configuration if the file is missing or fails to parse.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }
}

/// Per-type thresholds and caps used by the proposal engine's grouping and
/// pruning steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalConfig {
    /// Per-type signal threshold used to build the boolean hit-set.
    pub hit_thresholds: HashMap<EventType, f64>,
    /// Per-type minimum run length (in samples) to keep a candidate.
    pub min_run_length: HashMap<EventType, usize>,
    /// Per-type base score used in the `score = clamp(base + 0.25*reckless, 0, 1)` formula.
    pub type_base_score: HashMap<EventType, f64>,
    /// Maximum candidates kept per violation type.
    pub max_per_type: usize,
    /// Maximum candidates kept across all types.
    pub max_total: usize,
    /// Overlap fraction above which a lower-scored same-type candidate is
    /// pruned against an already-kept one.
    pub overlap_prune_threshold: f64,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        let mut hit_thresholds = HashMap::new();
        let mut min_run_length = HashMap::new();
        let mut type_base_score = HashMap::new();
        for event_type in EventType::all() {
            hit_thresholds.insert(event_type, 0.5);
            min_run_length.insert(event_type, 3);
            type_base_score.insert(event_type, 0.5);
        }
        Self {
            hit_thresholds,
            min_run_length,
            type_base_score,
            max_per_type: 10,
            max_total: 40,
            overlap_prune_threshold: 0.4,
        }
    }
}

impl ProposalConfig {
    /// Loads from `path`, falling back to defaults if the file is missing
    /// or fails to parse.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_config_defaults_match_documented_caps() {
        let cfg = PerfConfig::default();
        assert_eq!(cfg.gemini_flash_max_candidates, 6);
        assert_eq!(cfg.gemini_pro_max_candidates, 3);
        assert_eq!(cfg.gemini_flash_concurrency, 4);
        assert_eq!(cfg.gemini_pro_concurrency, 2);
    }

    #[test]
    fn normalized_band_swaps_when_inverted() {
        let mut cfg = PerfConfig {
            pro_uncertain_conf_low: 0.9,
            pro_uncertain_conf_high: 0.2,
            ..PerfConfig::default()
        };
        assert_eq!(cfg.normalized_uncertain_band(), (0.2, 0.9));
        cfg.pro_uncertain_conf_low = 0.2;
        cfg.pro_uncertain_conf_high = 0.9;
        assert_eq!(cfg.normalized_uncertain_band(), (0.2, 0.9));
    }

    #[test]
    fn missing_perf_config_file_falls_back_to_default() {
        let cfg = PerfConfig::load_or_default(Path::new("/nonexistent/perf_config.toml"));
        assert_eq!(cfg, PerfConfig::default());
    }

    #[test]
    fn missing_roi_config_file_falls_back_to_default() {
        let cfg = RoiConfig::load_or_default(Path::new("/nonexistent/roi_config.json"));
        assert_eq!(cfg, RoiConfig::default());
    }
}
