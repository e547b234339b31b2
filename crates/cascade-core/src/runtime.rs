//! Bundles the pieces a process entry point needs to build an
//! [`Orchestrator`]: the run store, the model client, and config paths.
//! Keeps wiring out of `cascade-cli`'s command bodies and out of any future
//! HTTP surface, so both can share one construction path.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cascade::CascadeExecutor;
use crate::model_client::ModelClient;
use crate::orchestrator::{ConfigPaths, Orchestrator};
use crate::run_store::RunStore;

/// Where a `Runtime` expects to find a deployment's run data and config.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root directory under which every run gets its own subdirectory.
    pub runs_dir: PathBuf,
    /// `perf_config.toml`.
    pub perf_config: PathBuf,
    /// `roi_config.json`.
    pub roi_config: PathBuf,
    /// `proposal_config.json`.
    pub proposal_config: PathBuf,
}

impl RuntimePaths {
    /// Lays out the standard `<root>/runs` + `<root>/config/*` convention.
    #[must_use]
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            runs_dir: root.join("runs"),
            perf_config: root.join("config").join("perf_config.toml"),
            roi_config: root.join("config").join("roi_config.json"),
            proposal_config: root.join("config").join("proposal_config.json"),
        }
    }
}

/// The dependency bundle a process entry point constructs once at startup.
pub struct Runtime {
    pub store: Arc<RunStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    /// Builds a `Runtime` rooted at `paths`, using `client` as the Flash/Pro
    /// backend. Rehydrates the run store from any prior runs under
    /// `paths.runs_dir`.
    #[must_use]
    pub fn new(paths: RuntimePaths, client: Arc<dyn ModelClient>) -> Self {
        let store = Arc::new(RunStore::open(&paths.runs_dir));
        let executor = Arc::new(CascadeExecutor::new(client));
        let config_paths = ConfigPaths {
            perf_config: paths.perf_config,
            roi_config: paths.roi_config,
            proposal_config: paths.proposal_config,
        };
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), executor, config_paths));
        Self { store, orchestrator }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_paths_lay_out_standard_convention() {
        let paths = RuntimePaths::under("/srv/cascade");
        assert_eq!(paths.runs_dir, PathBuf::from("/srv/cascade/runs"));
        assert_eq!(paths.perf_config, PathBuf::from("/srv/cascade/config/perf_config.toml"));
    }
}
