//! Decodes the source video, samples frames at an adaptive rate, and writes
//! the frame manifest that the proposal engine consumes.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, ErrorCode, Result};
use crate::run_logger::{LogLevel, RunLogger};
use crate::run_status::Stage;

/// One sampled frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_idx: u64,
    pub sample_idx: u64,
    pub ts_sec: f64,
    pub path: String,
    pub height: u32,
    pub width: u32,
}

/// Ingestor output, persisted as `frames_manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub video_path: String,
    pub source_fps: f64,
    pub analysis_fps: u32,
    pub duration_sec: f64,
    pub frame_count: u64,
    pub sample_count: u64,
    pub frames: Vec<FrameMeta>,
}

/// Resolves a usable ffmpeg/ffprobe binary, preferring the system
/// installation and falling back to a downloaded sidecar.
fn ensure_ffmpeg() -> Result<()> {
    let system_ok = Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if system_ok {
        return Ok(());
    }
    ffmpeg_sidecar::download::auto_download()
        .map_err(|e| CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: format!("failed to obtain an ffmpeg binary: {e}"),
            code: ErrorCode::IngestDecodeError,
        })
}

fn ffprobe_bin() -> PathBuf {
    if Command::new("ffprobe")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
    {
        PathBuf::from("ffprobe")
    } else {
        ffmpeg_sidecar::paths::sidecar_dir()
            .map(|dir| dir.join("ffprobe"))
            .unwrap_or_else(|_| PathBuf::from("ffprobe"))
    }
}

fn ffmpeg_bin() -> PathBuf {
    if Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
    {
        PathBuf::from("ffmpeg")
    } else {
        ffmpeg_sidecar::paths::sidecar_dir()
            .map(|dir| dir.join("ffmpeg"))
            .unwrap_or_else(|_| PathBuf::from("ffmpeg"))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
    height: Option<u32>,
    width: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
    streams: Vec<ProbeStream>,
}

fn parse_frame_rate(raw: &str) -> f64 {
    if let Some((num, den)) = raw.split_once('/') {
        let (num, den): (f64, f64) = (num.parse().unwrap_or(30.0), den.parse().unwrap_or(1.0));
        if den > 0.0 {
            return num / den;
        }
    }
    raw.parse().unwrap_or(30.0)
}

fn probe(video_path: &Path) -> Result<(f64, f64, u32, u32)> {
    let output = Command::new(ffprobe_bin())
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate,width,height:format=duration",
            "-of",
            "json",
        ])
        .arg(video_path)
        .output()
        .map_err(|e| CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: format!("failed to run ffprobe: {e}"),
            code: ErrorCode::IngestDecodeError,
        })?;

    if !output.status.success() {
        return Err(CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: "ffprobe exited with a non-zero status".to_string(),
            code: ErrorCode::IngestDecodeError,
        });
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
        CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: format!("failed to parse ffprobe output: {e}"),
            code: ErrorCode::IngestDecodeError,
        }
    })?;

    let stream = parsed.streams.first().ok_or_else(|| CascadeError::StageFatal {
        stage: "INGEST".to_string(),
        message: "no video stream found".to_string(),
        code: ErrorCode::IngestDecodeError,
    })?;

    let source_fps = stream
        .r_frame_rate
        .as_deref()
        .map(parse_frame_rate)
        .unwrap_or(30.0);
    let duration_sec: f64 = parsed
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);
    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);

    Ok((source_fps, duration_sec, width, height))
}

/// Decodes `video_path`, samples frames at the adaptive analysis fps, and
/// writes both the frame files and `frames_manifest.json` under `run_dir`.
///
/// `analysis_fps = fps_short` when `duration_s <= long_threshold_s`, else
/// `fps_long`. Sampling keeps every `round(source_fps / analysis_fps)`-th
/// frame (floor 1).
///
/// Failure to open the video is stage-fatal (`INGEST_DECODE_ERROR`).
pub fn ingest(
    video_path: &Path,
    run_dir: &Path,
    fps_short: u32,
    fps_long: u32,
    long_threshold_s: f64,
    logger: &RunLogger,
) -> Result<Manifest> {
    logger.stage_event(Stage::Ingest, "stage_started", "starting ingest")?;

    ensure_ffmpeg()?;
    let (source_fps, duration_sec, _probe_width, _probe_height) = probe(video_path)?;

    let analysis_fps = if duration_sec <= long_threshold_s {
        fps_short
    } else {
        fps_long
    };

    let frames_dir = run_dir.join("frames");
    std::fs::create_dir_all(&frames_dir)
        .map_err(|e| CascadeError::io(frames_dir.display().to_string(), e))?;

    let pattern = frames_dir.join("f_%05d.jpg");
    let status = Command::new(ffmpeg_bin())
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(video_path)
        .args(["-vf", &format!("fps={analysis_fps}"), "-vsync", "vfr"])
        .arg(&pattern)
        .status()
        .map_err(|e| CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: format!("failed to spawn ffmpeg: {e}"),
            code: ErrorCode::IngestDecodeError,
        })?;
    if !status.success() {
        logger.log(
            Stage::Ingest,
            LogLevel::Error,
            "stage_failed",
            "ffmpeg frame extraction failed",
            None,
            None,
            Some("INGEST_DECODE_ERROR"),
        )?;
        return Err(CascadeError::StageFatal {
            stage: "INGEST".to_string(),
            message: "ffmpeg frame extraction failed".to_string(),
            code: ErrorCode::IngestDecodeError,
        });
    }

    let sample_every = ((source_fps / f64::from(analysis_fps.max(1))).round() as u64).max(1);

    let mut frame_files: Vec<PathBuf> = std::fs::read_dir(&frames_dir)
        .map_err(|e| CascadeError::io(frames_dir.display().to_string(), e))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jpg"))
        .collect();
    frame_files.sort();

    let mut frames = Vec::with_capacity(frame_files.len());
    for (sample_idx, path) in frame_files.iter().enumerate() {
        let frame_idx = sample_idx as u64 * sample_every;
        let ts_sec = frame_idx as f64 / source_fps.max(1.0);
        let (width, height) = image::image_dimensions(path).unwrap_or((0, 0));
        frames.push(FrameMeta {
            frame_idx,
            sample_idx: sample_idx as u64,
            ts_sec: (ts_sec * 1000.0).round() / 1000.0,
            path: path.display().to_string(),
            height,
            width,
        });
    }

    let manifest = Manifest {
        video_path: video_path.display().to_string(),
        source_fps,
        analysis_fps,
        duration_sec: (duration_sec * 1000.0).round() / 1000.0,
        frame_count: frames.len() as u64 * sample_every,
        sample_count: frames.len() as u64,
        frames,
    };

    let manifest_path = run_dir.join("frames_manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| CascadeError::json("frames_manifest.json", e))?;
    std::fs::write(&manifest_path, bytes)
        .map_err(|e| CascadeError::io(manifest_path.display().to_string(), e))?;

    logger.stage_event(
        Stage::Ingest,
        "stage_completed",
        &format!("ingest complete: {} samples", manifest.sample_count),
    )?;

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parses_fraction() {
        assert!((parse_frame_rate("30000/1001") - 29.970_03).abs() < 1e-3);
        assert!((parse_frame_rate("25/1") - 25.0).abs() < 1e-9);
        assert!((parse_frame_rate("30") - 30.0).abs() < 1e-9);
    }
}
