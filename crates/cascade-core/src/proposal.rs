//! Converts a frame manifest into ranked, capped `Candidate` packets by
//! scanning per-frame pixel signals, grouping consecutive hits into runs,
//! scoring each run, and pruning by per-type cap and overlap.

use std::collections::HashMap;

use image::{GenericImageView, Rgba};

use crate::config::{ProposalConfig, RoiConfig, RoiPolygon};
use crate::error::{CascadeError, Result};
use crate::ids;
use crate::ingest::Manifest;
use crate::packet::{Candidate, EventType, Routing};
use crate::run_logger::{LogLevel, RunLogger};
use crate::run_status::Stage;

/// Per-frame numeric signals, also persisted verbatim as a candidate's
/// midpoint `feature_snapshot`.
#[derive(Debug, Clone, Copy, Default)]
struct FrameSignals {
    red_score: f64,
    motion_score: f64,
    flow_cos: f64,
    fg_ratio: f64,
    reckless_score: f64,
}

impl FrameSignals {
    fn snapshot(self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("red_score".to_string(), self.red_score);
        map.insert("motion_score".to_string(), self.motion_score);
        map.insert("flow_cos".to_string(), self.flow_cos);
        map.insert("fg_ratio".to_string(), self.fg_ratio);
        map.insert("reckless_score".to_string(), self.reckless_score);
        map
    }
}

/// A normalised polygon's axis-aligned bounding box in pixel space, used as
/// a cheap stand-in for a true point-in-polygon mask.
fn roi_bbox(roi: &RoiPolygon, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let xs = roi.points.iter().map(|(x, _)| *x);
    let ys = roi.points.iter().map(|(_, y)| *y);
    let min_x = xs.clone().fold(f64::INFINITY, f64::min).clamp(0.0, 1.0);
    let max_x = xs.fold(f64::NEG_INFINITY, f64::max).clamp(0.0, 1.0);
    let min_y = ys.clone().fold(f64::INFINITY, f64::min).clamp(0.0, 1.0);
    let max_y = ys.fold(f64::NEG_INFINITY, f64::max).clamp(0.0, 1.0);
    let x0 = (min_x * f64::from(width)) as u32;
    let x1 = ((max_x * f64::from(width)) as u32).max(x0 + 1).min(width);
    let y0 = (min_y * f64::from(height)) as u32;
    let y1 = ((max_y * f64::from(height)) as u32).max(y0 + 1).min(height);
    (x0, y0, x1, y1)
}

fn full_frame_bbox(width: u32, height: u32) -> (u32, u32, u32, u32) {
    (0, 0, width, height)
}

fn region_mean_rgb(img: &image::DynamicImage, bbox: (u32, u32, u32, u32)) -> (f64, f64, f64) {
    let (x0, y0, x1, y1) = bbox;
    let mut sum = (0.0f64, 0.0f64, 0.0f64);
    let mut count = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            let Rgba([r, g, b, _]) = img.get_pixel(x, y);
            sum.0 += f64::from(r);
            sum.1 += f64::from(g);
            sum.2 += f64::from(b);
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0, 0.0);
    }
    let n = count as f64;
    (sum.0 / n, sum.1 / n, sum.2 / n)
}

fn region_gray_mean_abs_diff(
    cur: &image::DynamicImage,
    prev: &image::DynamicImage,
    bbox: (u32, u32, u32, u32),
) -> f64 {
    let (x0, y0, x1, y1) = bbox;
    let mut sum = 0.0f64;
    let mut count = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            let c = cur.get_pixel(x, y).0;
            let p = prev.get_pixel(x, y).0;
            let cg = 0.299 * f64::from(c[0]) + 0.587 * f64::from(c[1]) + 0.114 * f64::from(c[2]);
            let pg = 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]);
            sum += (cg - pg).abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn region_centroid_shift(
    cur: &image::DynamicImage,
    prev: &image::DynamicImage,
    bbox: (u32, u32, u32, u32),
) -> (f64, f64) {
    let (x0, y0, x1, y1) = bbox;
    let (mut wsum, mut xsum, mut ysum) = (0.0f64, 0.0f64, 0.0f64);
    let (mut pwsum, mut pxsum, mut pysum) = (0.0f64, 0.0f64, 0.0f64);
    for y in y0..y1 {
        for x in x0..x1 {
            let c = cur.get_pixel(x, y).0;
            let p = prev.get_pixel(x, y).0;
            let cg = 0.299 * f64::from(c[0]) + 0.587 * f64::from(c[1]) + 0.114 * f64::from(c[2]);
            let pg = 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]);
            wsum += cg;
            xsum += cg * f64::from(x);
            ysum += cg * f64::from(y);
            pwsum += pg;
            pxsum += pg * f64::from(x);
            pysum += pg * f64::from(y);
        }
    }
    if wsum < f64::EPSILON || pwsum < f64::EPSILON {
        return (0.0, 0.0);
    }
    (xsum / wsum - pxsum / pwsum, ysum / wsum - pysum / pwsum)
}

fn region_foreground_ratio(
    cur: &image::DynamicImage,
    background: &mut [f64],
    bbox: (u32, u32, u32, u32),
    full_width: u32,
) -> f64 {
    const ALPHA: f64 = 0.05;
    const FG_THRESHOLD: f64 = 28.0;
    let (x0, y0, x1, y1) = bbox;
    let mut fg = 0u64;
    let mut total = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            let c = cur.get_pixel(x, y).0;
            let gray = 0.299 * f64::from(c[0]) + 0.587 * f64::from(c[1]) + 0.114 * f64::from(c[2]);
            let idx = (y * full_width + x) as usize;
            let bg = background[idx];
            if (gray - bg).abs() > FG_THRESHOLD {
                fg += 1;
            }
            background[idx] = ALPHA * gray + (1.0 - ALPHA) * bg;
            total += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        fg as f64 / total as f64
    }
}

fn compute_signals(
    img: &image::DynamicImage,
    prev: Option<&image::DynamicImage>,
    background: &mut [f64],
    roi_cfg: &RoiConfig,
) -> FrameSignals {
    let (width, height) = img.dimensions();
    let full_bbox = full_frame_bbox(width, height);

    let signal_bbox = roi_cfg
        .signal_roi
        .as_ref()
        .map(|roi| roi_bbox(roi, width, height))
        .unwrap_or(full_bbox);
    let (r, g, b) = region_mean_rgb(img, signal_bbox);
    let red_score = r / (g + b + 1.0);

    let motion_score = prev
        .map(|p| region_gray_mean_abs_diff(img, p, full_bbox))
        .unwrap_or(0.0);

    let flow_cos = match (prev, &roi_cfg.wrong_side_roi, roi_cfg.expected_direction) {
        (Some(p), Some(roi), Some((ex, ey))) => {
            let bbox = roi_bbox(roi, width, height);
            let (dx, dy) = region_centroid_shift(img, p, bbox);
            let mag = (dx * dx + dy * dy).sqrt();
            let dir_mag = (ex * ex + ey * ey).sqrt();
            if mag > f64::EPSILON && dir_mag > f64::EPSILON {
                (dx * ex + dy * ey) / (mag * dir_mag)
            } else {
                0.0
            }
        }
        _ => 0.0,
    };

    let fg_ratio = region_foreground_ratio(img, background, full_bbox, width);

    let reckless_score = (motion_score / 80.0 * 0.5 + fg_ratio * 1.2 + (-flow_cos).max(0.0) * 0.3)
        .min(1.0);

    FrameSignals {
        red_score,
        motion_score,
        flow_cos,
        fg_ratio,
        reckless_score,
    }
}

/// Coalesces consecutive sample indices in `hits` into runs of length
/// `>= k_required`.
fn group_runs(hits: &[usize], k_required: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    let mut prev: Option<usize> = None;

    for &idx in hits {
        match (start, prev) {
            (Some(_), Some(p)) if idx == p + 1 => {
                prev = Some(idx);
            }
            _ => {
                if let (Some(s), Some(p)) = (start, prev) {
                    if p - s + 1 >= k_required {
                        runs.push((s, p));
                    }
                }
                start = Some(idx);
                prev = Some(idx);
            }
        }
    }
    if let (Some(s), Some(p)) = (start, prev) {
        if p - s + 1 >= k_required {
            runs.push((s, p));
        }
    }
    runs
}

fn hit_threshold(signals: &FrameSignals, event_type: EventType, threshold: f64) -> bool {
    match event_type {
        EventType::RedLightJump => signals.red_score >= threshold && signals.motion_score >= 10.0,
        EventType::WrongSideDriving => signals.flow_cos <= -threshold,
        EventType::NoHelmet => signals.red_score >= threshold * 0.6,
        EventType::RecklessDriving => signals.reckless_score >= threshold,
    }
}

/// From `manifest`, emits ranked `Candidate` packets per violation type,
/// capped per-type and in total, and writes `candidates.json`/`packets.json`
/// under `run_dir`.
///
/// Empty output is non-fatal; it is logged as a warning.
pub fn propose(
    manifest: &Manifest,
    run_dir: &std::path::Path,
    roi_cfg: &RoiConfig,
    proposal_cfg: &ProposalConfig,
    logger: &RunLogger,
) -> Result<Vec<Candidate>> {
    logger.stage_event(Stage::LocalProposals, "stage_started", "scanning frames")?;

    let mut per_frame_signals = Vec::with_capacity(manifest.frames.len());
    let mut prev_img: Option<image::DynamicImage> = None;
    let mut background: Option<Vec<f64>> = None;

    for frame in &manifest.frames {
        let img = image::open(&frame.path).map_err(|e| CascadeError::StageFatal {
            stage: "LOCAL_PROPOSALS".to_string(),
            message: format!("failed to open frame {}: {e}", frame.path),
            code: crate::error::ErrorCode::IngestDecodeError,
        })?;
        let (width, height) = img.dimensions();
        let background = background.get_or_insert_with(|| vec![0.0; (width * height) as usize]);

        let signals = compute_signals(&img, prev_img.as_ref(), background, roi_cfg);
        per_frame_signals.push(signals);
        prev_img = Some(img);
    }

    if per_frame_signals.is_empty() {
        logger.log(
            Stage::LocalProposals,
            LogLevel::Warning,
            "candidate_empty_warning",
            "no frames to scan; proposal engine produced no candidates",
            None,
            None,
            None,
        )?;
        write_outputs(run_dir, &[])?;
        return Ok(Vec::new());
    }

    let mut candidates = Vec::new();

    for event_type in EventType::all() {
        let threshold = proposal_cfg
            .hit_thresholds
            .get(&event_type)
            .copied()
            .unwrap_or(0.5);
        let k_required = proposal_cfg
            .min_run_length
            .get(&event_type)
            .copied()
            .unwrap_or(3);
        let base_score = proposal_cfg
            .type_base_score
            .get(&event_type)
            .copied()
            .unwrap_or(0.5);

        let hits: Vec<usize> = per_frame_signals
            .iter()
            .enumerate()
            .filter(|(_, s)| hit_threshold(s, event_type, threshold))
            .map(|(idx, _)| idx)
            .collect();

        for (run_start, run_end) in group_runs(&hits, k_required) {
            let mid = run_start + (run_end - run_start) / 2;
            let reckless_snapshot = per_frame_signals[mid].reckless_score;
            let score = (base_score + 0.25 * reckless_snapshot).clamp(0.0, 1.0);

            let start_s = (manifest.frames[run_start].ts_sec - 1.0).max(0.0);
            let end_s = (manifest.frames[run_end].ts_sec + 1.0).min(manifest.duration_sec);

            let anchor_frames = [run_start, mid, run_end]
                .into_iter()
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .take(3)
                .map(|idx| manifest.frames[idx].path.clone())
                .collect();

            candidates.push(Candidate {
                packet_id: ids::new_packet_id(),
                candidate_id: String::new(),
                candidate_rank: 0,
                event_type,
                start_s,
                end_s,
                score,
                anchor_frames,
                feature_snapshot: per_frame_signals[mid].snapshot(),
                routing: Routing::default(),
            });
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    let mut per_type_count: HashMap<EventType, usize> = HashMap::new();

    for candidate in candidates {
        if kept.len() >= proposal_cfg.max_total {
            break;
        }
        let count = per_type_count.entry(candidate.event_type).or_insert(0);
        if *count >= proposal_cfg.max_per_type {
            continue;
        }
        let overlaps = kept.iter().any(|existing| {
            existing.event_type == candidate.event_type && {
                let overlap = existing.overlap_s(&candidate);
                let shorter = existing.duration_s().min(candidate.duration_s()).max(f64::EPSILON);
                overlap / shorter > proposal_cfg.overlap_prune_threshold
            }
        });
        if overlaps {
            continue;
        }
        *count += 1;
        kept.push(candidate);
    }

    for (ordinal, candidate) in kept.iter_mut().enumerate() {
        candidate.candidate_rank = ordinal;
        candidate.candidate_id = ids::candidate_id(ordinal + 1);
    }

    write_outputs(run_dir, &kept)?;

    if kept.is_empty() {
        logger.log(
            Stage::LocalProposals,
            LogLevel::Warning,
            "candidate_empty_warning",
            "proposal engine produced no candidates after pruning",
            None,
            None,
            None,
        )?;
    }

    logger.stage_event(
        Stage::LocalProposals,
        "stage_completed",
        &format!("{} candidates emitted", kept.len()),
    )?;

    Ok(kept)
}

fn write_outputs(run_dir: &std::path::Path, candidates: &[Candidate]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(candidates)
        .map_err(|e| CascadeError::json("candidates.json", e))?;
    let path = run_dir.join("candidates.json");
    std::fs::write(&path, &bytes).map_err(|e| CascadeError::io(path.display().to_string(), e))?;
    let packets_path = run_dir.join("packets.json");
    std::fs::write(&packets_path, &bytes)
        .map_err(|e| CascadeError::io(packets_path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_runs_keeps_only_long_enough_consecutive_spans() {
        let hits = vec![0, 1, 2, 5, 8, 9, 10, 11];
        let runs = group_runs(&hits, 3);
        assert_eq!(runs, vec![(0, 2), (8, 11)]);
    }

    #[test]
    fn group_runs_drops_isolated_hits() {
        let hits = vec![0, 4, 9];
        let runs = group_runs(&hits, 2);
        assert!(runs.is_empty());
    }

    #[test]
    fn roi_bbox_clamps_to_image_bounds() {
        let roi = RoiPolygon {
            points: vec![(0.1, 0.1), (0.9, 0.1), (0.9, 0.9), (0.1, 0.9)],
        };
        let (x0, y0, x1, y1) = roi_bbox(&roi, 100, 100);
        assert_eq!((x0, y0), (10, 10));
        assert_eq!((x1, y1), (90, 90));
    }
}
