//! HTTP server wiring: shared state and the router.

pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use fleet::debug::{DebugSink, NoopSink};
use fleet::{EngineFailureTracker, OrchestratorClient, OrchestratorConfig, UpstreamSessionClient};

use crate::config::ProxyConfig;
use crate::debug::JsonlSink;
use crate::stream::active::ActiveStreams;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    /// Absent when no orchestrator URL is configured; requests then go to
    /// the static fallback upstream and no lifecycle events are reported.
    pub orchestrator: Option<Arc<OrchestratorClient>>,
    pub tracker: Arc<EngineFailureTracker>,
    pub sessions: Arc<UpstreamSessionClient>,
    pub debug: Arc<dyn DebugSink>,
    pub active: Arc<ActiveStreams>,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn build(config: ProxyConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let debug: Arc<dyn DebugSink> = if config.debug.enabled {
            Arc::new(JsonlSink::create(&config.debug.log_dir)?)
        } else {
            Arc::new(NoopSink)
        };

        let orchestrator = match &config.orchestrator_url {
            Some(url) => {
                let mut orch_cfg = OrchestratorConfig::new(url.clone());
                orch_cfg.api_key = config.orchestrator_api_key.clone();
                orch_cfg.max_streams_per_engine = config.max_streams_per_engine;
                let client = OrchestratorClient::new(orch_cfg)?.with_debug_sink(debug.clone());
                Some(Arc::new(client))
            }
            None => None,
        };

        let sessions = Arc::new(UpstreamSessionClient::new(
            config.upstream.scheme.clone(),
            config.no_response_timeout,
        )?);

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            tracker: Arc::new(EngineFailureTracker::with_defaults()),
            sessions,
            debug,
            active: Arc::new(ActiveStreams::new()),
            shutdown,
            start_time: Instant::now(),
        })
    }

    /// Start the background upkeep tasks (health poller, ended-set sweeper,
    /// tracker cleanup). Needs a running runtime.
    pub fn spawn_background(&self) {
        self.tracker.spawn_cleanup(self.shutdown.clone());
        if let Some(client) = &self.orchestrator {
            client.spawn_background(self.shutdown.clone());
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ace/getstream", get(routes::stream::getstream))
        .route("/ace/status", get(routes::status::status))
        .route("/health", get(routes::status::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
