//! Core pipeline for the traffic-violation review cascade: decode a video,
//! propose candidate violation windows from cheap local signals, validate
//! them through a two-tier (Flash, then Pro) model cascade, and merge the
//! result into a reviewer-visible event list.
//!
//! # Pipeline
//!
//! 1. [`ingest`] decodes the source video and samples frames at an adaptive
//!    rate, writing `frames_manifest.json`.
//! 2. [`proposal`] scans the sampled frames for per-type signal runs and
//!    emits ranked, capped [`packet::Candidate`] packets.
//! 3. [`cascade`]'s [`cascade::CascadeExecutor`] submits a subset of packets
//!    to the Flash tier, routes the uncertain/relevant subset to the Pro
//!    tier, and falls back deterministically whenever a model call fails.
//! 4. [`merge`] blends each packet's Flash/Pro decisions into a
//!    [`final_event::FinalEvent`] and records a full [`final_event::Trace`].
//!
//! [`orchestrator::Orchestrator`] drives all four stages for one run and
//! owns its [`run_status::RunRecord`] state machine; [`runtime::Runtime`]
//! bundles the run store, config, and a [`model_client::ModelClient`]
//! implementation into the single object a process entry point constructs.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use cascade_core::model_client::UnavailableModelClient;
//! use cascade_core::runtime::{Runtime, RuntimePaths};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::new(RuntimePaths::under("./data"), Arc::new(UnavailableModelClient));
//! let run_id = runtime.orchestrator.run(Path::new("clip.mp4")).await?;
//! println!("run {run_id} ready for review");
//! # Ok(())
//! # }
//! ```

pub mod cascade;
pub mod config;
pub mod decision;
pub mod error;
pub mod final_event;
pub mod flash;
pub mod ids;
pub mod ingest;
pub mod merge;
pub mod model_client;
pub mod orchestrator;
pub mod packet;
pub mod pro;
pub mod proposal;
pub mod run_logger;
pub mod run_status;
pub mod run_store;
pub mod runtime;

pub use error::{CascadeError, Result};
