//! End-to-end scenarios for the cascade executor and merger, driven through
//! a deterministic `ModelClient` test double rather than a real backend.
//! Each scenario corresponds to a literal case from the documented testable
//! properties: no-API fallback, Flash uncertain-band escalation, schema
//! mismatch, timeout/retry, cap enforcement, and empty proposals.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cascade_core::cascade::CascadeExecutor;
use cascade_core::config::PerfConfig;
use cascade_core::decision::{Decision, DecisionStatus};
use cascade_core::final_event::SourceStage;
use cascade_core::flash::FlashEvent;
use cascade_core::merge;
use cascade_core::model_client::{GenerateRequest, MediaHandle, ModelClient, ModelError, ModelTier};
use cascade_core::packet::{Candidate, EventType, Routing};
use cascade_core::pro::ProResponse;
use cascade_core::run_logger::RunLogger;

/// What a queued `generate` call should do the next time it's invoked.
enum Outcome {
    Value(serde_json::Value),
    Transient,
    /// Sleeps far longer than any configured timeout, so the call is always
    /// observed as a timeout rather than a transient error.
    Timeout,
}

/// Deterministic `ModelClient` double. Queues per-(tier, packet_id)
/// outcomes consumed in order; an empty queue for a key yields a transient
/// error (the safe default for packets a test doesn't care about).
struct TestClient {
    upload_ok: bool,
    outcomes: Mutex<HashMap<(u8, String), VecDeque<Outcome>>>,
}

impl TestClient {
    fn new(upload_ok: bool) -> Self {
        Self {
            upload_ok,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    fn queue(&self, tier: ModelTier, packet_id: &str, outcome: Outcome) {
        let key = (tier_key(tier), packet_id.to_string());
        self.outcomes.lock().unwrap().entry(key).or_default().push_back(outcome);
    }
}

fn tier_key(tier: ModelTier) -> u8 {
    match tier {
        ModelTier::Flash => 0,
        ModelTier::Pro => 1,
    }
}

#[async_trait]
impl ModelClient for TestClient {
    async fn upload_media(&self, _video_path: &Path) -> Result<MediaHandle, ModelError> {
        if self.upload_ok {
            Ok(MediaHandle { uri: "test-media".to_string() })
        } else {
            Err(ModelError::Transient("no backend configured".to_string()))
        }
    }

    async fn is_active(&self, _handle: &MediaHandle) -> Result<bool, ModelError> {
        Ok(true)
    }

    async fn generate(
        &self,
        tier: ModelTier,
        _media: &MediaHandle,
        request: GenerateRequest<'_>,
    ) -> Result<serde_json::Value, ModelError> {
        let key = (tier_key(tier), request.packet_id.to_string());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        match outcome {
            Some(Outcome::Value(v)) => Ok(v),
            Some(Outcome::Transient) | None => Err(ModelError::Transient("boom".to_string())),
            Some(Outcome::Timeout) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("outer timeout should have fired first")
            }
        }
    }
}

fn candidate(packet_id: &str, event_type: EventType, score: f64) -> Candidate {
    Candidate {
        packet_id: packet_id.to_string(),
        candidate_id: format!("cand_{packet_id}"),
        candidate_rank: 0,
        event_type,
        start_s: 1.0,
        end_s: 2.0,
        score,
        anchor_frames: vec![],
        feature_snapshot: HashMap::new(),
        routing: Routing::default(),
    }
}

fn flash_json(packet_id: &str, event_type: EventType, confidence: f64, is_relevant: bool) -> serde_json::Value {
    json!({
        "packet_id": packet_id,
        "candidate_id": format!("cand_{packet_id}"),
        "is_relevant": is_relevant,
        "event_type": event_type_tag(event_type),
        "confidence": confidence,
        "start_time": 1.0,
        "end_time": 2.0,
        "plate_visible": false,
        "uncertain": false,
    })
}

fn pro_json(packet_id: &str, event_type: EventType, confidence: f64, risk_score: f64) -> serde_json::Value {
    json!({
        "packet_id": packet_id,
        "candidate_id": format!("cand_{packet_id}"),
        "event_type": event_type_tag(event_type),
        "confidence": confidence,
        "risk_score": risk_score,
        "start_time": 1.0,
        "end_time": 2.0,
    })
}

fn event_type_tag(event_type: EventType) -> &'static str {
    match event_type {
        EventType::NoHelmet => "NO_HELMET",
        EventType::RedLightJump => "RED_LIGHT_JUMP",
        EventType::WrongSideDriving => "WRONG_SIDE_DRIVING",
        EventType::RecklessDriving => "RECKLESS_DRIVING",
    }
}

struct Harness {
    dir: tempfile::TempDir,
    logger: RunLogger,
}

impl Harness {
    fn new(run_id: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), run_id).unwrap();
        Self { dir, logger }
    }

    async fn analyze(
        &self,
        client: TestClient,
        candidates: &mut [Candidate],
        perf: &PerfConfig,
    ) -> (Vec<Decision<FlashEvent>>, Vec<Decision<ProResponse>>) {
        let executor = CascadeExecutor::new(std::sync::Arc::new(client));
        let progress_cb: cascade_core::cascade::ProgressCb = std::sync::Arc::new(|_| {});
        executor
            .analyze(self.dir.path(), Path::new("clip.mp4"), candidates, perf, &self.logger, progress_cb)
            .await
            .unwrap();

        let flash: Vec<Decision<FlashEvent>> =
            serde_json::from_slice(&std::fs::read(self.dir.path().join("flash_decisions.json")).unwrap()).unwrap();
        let pro: Vec<Decision<ProResponse>> =
            serde_json::from_slice(&std::fs::read(self.dir.path().join("pro_decisions.json")).unwrap()).unwrap();
        (flash, pro)
    }
}

#[tokio::test]
async fn s1_no_api_yields_flash_only_final_event() {
    let harness = Harness::new("run_s1");
    let mut candidates = vec![candidate("pkt_s1", EventType::RecklessDriving, 0.9)];
    let perf = PerfConfig::default();

    let client = TestClient::new(false);
    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;

    assert_eq!(flash.len(), 1);
    let flash_ev = flash[0].response.as_ref().unwrap();
    assert!(flash_ev.is_relevant);
    assert!((flash_ev.confidence - 0.9).abs() < 1e-9);
    assert!(!flash_ev.uncertain);
    assert!(pro.is_empty());
    assert_eq!(candidates[0].routing.last_reason(), Some("flash_confident_no_pro"));

    let events = merge::merge(harness.dir.path(), &candidates, &flash, &pro, &harness.logger).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_stage, SourceStage::FlashOnly);
}

#[tokio::test]
async fn s2_uncertain_band_escalates_and_blends_exactly() {
    let harness = Harness::new("run_s2");
    let mut candidates = vec![candidate("pkt_s2", EventType::WrongSideDriving, 0.6)];
    let perf = PerfConfig::default();

    let client = TestClient::new(true);
    client.queue(
        ModelTier::Flash,
        "pkt_s2",
        Outcome::Value(flash_json("pkt_s2", EventType::WrongSideDriving, 0.55, true)),
    );
    client.queue(
        ModelTier::Pro,
        "pkt_s2",
        Outcome::Value(pro_json("pkt_s2", EventType::WrongSideDriving, 0.9, 80.0)),
    );

    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    assert_eq!(flash[0].status, DecisionStatus::Ok);
    assert!(flash[0].response.as_ref().unwrap().uncertain);
    assert_eq!(pro.len(), 1);
    assert!(candidates[0].routing.sent_to_pro);

    let events = merge::merge(harness.dir.path(), &candidates, &flash, &pro, &harness.logger).unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.source_stage, SourceStage::ProFinal);
    assert!((event.confidence - 0.765).abs() < 1e-9);
    assert!((event.risk_score - 72.0).abs() < 1e-9);
}

#[tokio::test]
async fn s3_schema_mismatch_falls_back() {
    let harness = Harness::new("run_s3");
    let mut candidates = vec![candidate("pkt_s3", EventType::NoHelmet, 0.2)];
    let perf = PerfConfig::default();

    let client = TestClient::new(true);
    client.queue(
        ModelTier::Flash,
        "pkt_s3",
        Outcome::Value(flash_json("other_packet", EventType::NoHelmet, 0.8, true)),
    );

    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    assert_eq!(flash[0].status, DecisionStatus::Fallback);
    assert!(flash[0].error_detail.as_ref().unwrap().contains("SchemaPacketMismatch"));
    // score 0.2 < 0.55, so the deterministic fallback is not relevant and
    // never reaches the Pro queue.
    assert!(pro.is_empty());
}

#[tokio::test(start_paused = true)]
async fn s4_timeout_retries_then_falls_back() {
    let harness = Harness::new("run_s4");
    let mut candidates = vec![candidate("pkt_s4", EventType::RecklessDriving, 0.5)];
    let perf = PerfConfig {
        gemini_retry_attempts: 1,
        gemini_flash_timeout_sec: 1,
        ..PerfConfig::default()
    };

    let client = TestClient::new(true);
    client.queue(ModelTier::Flash, "pkt_s4", Outcome::Timeout);
    client.queue(ModelTier::Flash, "pkt_s4", Outcome::Timeout);

    let (flash, _pro) = harness.analyze(client, &mut candidates, &perf).await;
    assert_eq!(flash[0].status, DecisionStatus::Fallback);
    assert!(flash[0].error_detail.as_ref().unwrap().contains("RequestTimeout"));
}

#[tokio::test]
async fn s5_caps_are_enforced_at_both_tiers() {
    let harness = Harness::new("run_s5");
    let types = EventType::all();
    let mut candidates: Vec<Candidate> = (0..20)
        .map(|i| {
            let event_type = types[i % types.len()];
            candidate(&format!("pkt_{i:02}"), event_type, 0.9 - (i as f64) * 0.01)
        })
        .collect();
    let perf = PerfConfig {
        gemini_flash_max_candidates: 6,
        gemini_pro_max_candidates: 3,
        flash_min_local_score: 0.0,
        ..PerfConfig::default()
    };

    let client = TestClient::new(true);
    for c in &candidates {
        client.queue(
            ModelTier::Flash,
            &c.packet_id,
            Outcome::Value(flash_json(&c.packet_id, c.event_type, 0.6, true)),
        );
        client.queue(
            ModelTier::Pro,
            &c.packet_id,
            Outcome::Value(pro_json(&c.packet_id, c.event_type, 0.9, 80.0)),
        );
    }

    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    // Flash admission cap: 20 score-eligible candidates, cap 6.
    assert_eq!(flash.len(), 6);
    // Every admitted packet came back uncertain (confidence 0.6 sits inside
    // the default [0.45, 0.82) band), so all 6 are Pro-eligible; cap 3.
    assert_eq!(pro.len(), 3);
    let k_limited = candidates
        .iter()
        .filter(|c| c.routing.routing_reason.iter().any(|r| r == "pro_k_limit"))
        .count();
    assert_eq!(k_limited, 6 - 3);
}

#[tokio::test]
async fn s6_empty_proposals_produce_zero_final_events() {
    let harness = Harness::new("run_s6");
    let mut candidates: Vec<Candidate> = vec![];
    let perf = PerfConfig::default();

    let client = TestClient::new(true);
    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    assert!(flash.is_empty());
    assert!(pro.is_empty());

    let events = merge::merge(harness.dir.path(), &candidates, &flash, &pro, &harness.logger).unwrap();
    assert!(events.is_empty());
    let trace: cascade_core::final_event::Trace =
        serde_json::from_slice(&std::fs::read(harness.dir.path().join("trace.json")).unwrap()).unwrap();
    assert_eq!(trace.summary.packets_total, 0);
    assert_eq!(trace.summary.dropped_packets, 0);
}

#[tokio::test]
async fn invariant_packet_id_propagates_unchanged_through_decisions() {
    let harness = Harness::new("run_inv_id");
    let mut candidates = vec![candidate("pkt_inv", EventType::RedLightJump, 0.7)];
    let perf = PerfConfig::default();

    let client = TestClient::new(true);
    client.queue(
        ModelTier::Flash,
        "pkt_inv",
        Outcome::Value(flash_json("pkt_inv", EventType::RedLightJump, 0.5, true)),
    );
    client.queue(
        ModelTier::Pro,
        "pkt_inv",
        Outcome::Value(pro_json("pkt_inv", EventType::RedLightJump, 0.6, 50.0)),
    );

    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    assert_eq!(flash[0].packet_id, "pkt_inv");
    assert_eq!(flash[0].response.as_ref().unwrap().packet_id, "pkt_inv");
    assert_eq!(pro[0].packet_id, "pkt_inv");
    assert_eq!(pro[0].response.as_ref().unwrap().packet_id, "pkt_inv");
}

#[tokio::test]
async fn invariant_finalized_plus_dropped_equals_total() {
    let harness = Harness::new("run_inv_total");
    let mut candidates = vec![
        candidate("pkt_a", EventType::NoHelmet, 0.9),
        candidate("pkt_b", EventType::RedLightJump, 0.1),
    ];
    let perf = PerfConfig::default();

    let client = TestClient::new(true);
    client.queue(
        ModelTier::Flash,
        "pkt_a",
        Outcome::Value(flash_json("pkt_a", EventType::NoHelmet, 0.9, true)),
    );
    client.queue(
        ModelTier::Flash,
        "pkt_b",
        Outcome::Value(flash_json("pkt_b", EventType::RedLightJump, 0.3, false)),
    );

    let (flash, pro) = harness.analyze(client, &mut candidates, &perf).await;
    let events = merge::merge(harness.dir.path(), &candidates, &flash, &pro, &harness.logger).unwrap();
    let trace: cascade_core::final_event::Trace =
        serde_json::from_slice(&std::fs::read(harness.dir.path().join("trace.json")).unwrap()).unwrap();
    assert_eq!(trace.summary.final_events + trace.summary.dropped_packets, candidates.len());
    assert_eq!(events.len(), trace.summary.final_events);
}
