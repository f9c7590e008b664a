//! Orchestrator client: the single point of contact with the fleet
//! controller.
//!
//! Owns every piece of process-wide coordination state: the engine list
//! cache, pending allocations, the ended-event idempotency set, and the
//! health snapshot maintained by the background poller. Locks guard only
//! in-memory state; no lock is held across a network call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::breaker::EngineFailureTracker;
use crate::cache::EngineCache;
use crate::debug::{DebugSink, ProvisioningRecord, SelectionRecord, StressRecord};
use crate::error::FleetError;
use crate::models::{
    EndReason, Engine, EngineAddr, OrchestratorHealth, OrchestratorStatus, ProvisionRequest,
    ProvisionResponse, SelectedEngine, SessionInfo, StartedLabels, StreamDescriptor, StreamEndedEvent,
    StreamKey, StreamRecord, StreamStartedEvent,
};
use crate::pending::PendingAllocations;
use crate::provision::{calculate_wait, map_legacy_error, parse_provision_detail};
use crate::selection::{self, Candidate};
use crate::session::SessionHandle;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub max_streams_per_engine: u32,
    pub engine_cache_ttl: Duration,
    pub status_poll_interval: Duration,
    pub request_timeout: Duration,
    pub provision_attempts: u32,
    /// How long a freshly provisioned engine may take to show up in the list.
    pub engine_ready_timeout: Duration,
    pub engine_ready_poll: Duration,
    pub ended_set_cap: usize,
    pub ended_sweep_interval: Duration,
}

impl OrchestratorConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            api_key: None,
            max_streams_per_engine: 1,
            engine_cache_ttl: Duration::from_secs(3),
            status_poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            provision_attempts: 3,
            engine_ready_timeout: Duration::from_secs(10),
            engine_ready_poll: Duration::from_millis(500),
            ended_set_cap: 1000,
            ended_sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Everything `emit_started` needs to describe a freshly opened stream.
pub struct StartedStream<'a> {
    pub container_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub key: &'a StreamKey,
    pub session: &'a SessionHandle,
    pub is_live: bool,
    pub stream_id: &'a str,
}

pub struct OrchestratorClient {
    http: reqwest::Client,
    cfg: OrchestratorConfig,
    cache: EngineCache,
    pending: PendingAllocations,
    ended: Mutex<HashSet<String>>,
    health: RwLock<OrchestratorHealth>,
    debug: Option<Arc<dyn DebugSink>>,
}

impl OrchestratorClient {
    pub fn new(cfg: OrchestratorConfig) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            cache: EngineCache::new(cfg.engine_cache_ttl),
            pending: PendingAllocations::new(),
            ended: Mutex::new(HashSet::new()),
            health: RwLock::new(OrchestratorHealth::default()),
            debug: None,
            cfg,
        })
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.cfg.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.endpoint(path))
            .timeout(self.cfg.request_timeout);
        if let Some(key) = &self.cfg.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, FleetError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Api {
                status,
                operation,
                body: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| FleetError::decode(operation, e.to_string()))
    }

    // --- engine list -----------------------------------------------------

    /// Engine list, served from cache while it is fresher than the TTL.
    pub async fn list_engines(&self) -> Result<Vec<Engine>, FleetError> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached);
        }
        self.list_engines_fresh().await
    }

    /// Fetch the engine list bypassing the cache, updating it on the way out.
    pub async fn list_engines_fresh(&self) -> Result<Vec<Engine>, FleetError> {
        let engines: Vec<Engine> = self
            .fetch_json(self.request(Method::GET, "engines"), "list engines")
            .await?;
        self.cache.put(engines.clone());
        Ok(engines)
    }

    async fn started_stream_count(&self, container_id: &str) -> Result<u32, FleetError> {
        let streams: Vec<StreamRecord> = self
            .fetch_json(
                self.request(Method::GET, "streams")
                    .query(&[("container_id", container_id), ("status", "started")]),
                "list streams",
            )
            .await?;
        Ok(streams.len() as u32)
    }

    // --- health ----------------------------------------------------------

    pub async fn fetch_status(&self) -> Result<OrchestratorStatus, FleetError> {
        self.fetch_json(
            self.request(Method::GET, "orchestrator/status"),
            "orchestrator status",
        )
        .await
    }

    /// Fetch the status once and replace the local health snapshot.
    pub async fn refresh_health(&self) -> Result<(), FleetError> {
        let status = self.fetch_status().await?;
        let health = OrchestratorHealth::from_status(status, Utc::now());
        if let Some(sink) = &self.debug {
            sink.orchestrator_health((&health).into());
        }
        *self.health.write() = health;
        Ok(())
    }

    pub fn health_snapshot(&self) -> OrchestratorHealth {
        self.health.read().clone()
    }

    pub fn can_provision(&self) -> (bool, String) {
        let health = self.health.read();
        (health.can_provision, health.blocked_reason.clone())
    }

    /// (can_provision, should_wait, recovery ETA seconds).
    pub fn provisioning_status(&self) -> (bool, bool, u64) {
        let health = self.health.read();
        (
            health.can_provision,
            health.should_wait,
            health.recovery_eta_seconds,
        )
    }

    // --- selection -------------------------------------------------------

    pub async fn select_best_engine(
        &self,
        tracker: Option<&EngineFailureTracker>,
    ) -> Result<SelectedEngine, FleetError> {
        let started_at = Instant::now();
        let result = self.select_inner(tracker).await;
        if let Some(sink) = &self.debug {
            sink.selection(SelectionRecord {
                operation: "select_best_engine".to_string(),
                host: result.as_ref().ok().map(|s| s.host.clone()),
                port: result.as_ref().ok().map(|s| s.port),
                container_id: result.as_ref().ok().map(|s| s.container_id.clone()),
                duration_ms: started_at.elapsed().as_millis() as u64,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
        }
        result
    }

    async fn select_inner(
        &self,
        tracker: Option<&EngineFailureTracker>,
    ) -> Result<SelectedEngine, FleetError> {
        let engines = self.list_engines().await?;

        let mut admitted = Vec::with_capacity(engines.len());
        for engine in engines {
            if let Some(tracker) = tracker {
                let (ok, reason) = tracker.can_attempt(&engine.container_id);
                if !ok {
                    debug!(
                        container_id = %engine.container_id,
                        reason = %reason.unwrap_or_default(),
                        "skipping engine"
                    );
                    continue;
                }
            }
            admitted.push(engine);
        }

        let counts = join_all(admitted.iter().map(|engine| async move {
            match self.started_stream_count(&engine.container_id).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        container_id = %engine.container_id,
                        error = %e,
                        "stream count query failed; using advisory list"
                    );
                    engine.stream_ids.len() as u32
                }
            }
        }))
        .await;

        let candidates: Vec<Candidate> = admitted
            .into_iter()
            .zip(counts)
            .map(|(engine, started)| Candidate { engine, started })
            .collect();

        let max_streams = self.cfg.max_streams_per_engine;
        let chosen_id = self.pending.allocate_with(|pending| {
            selection::pick(&candidates, pending, max_streams)
                .map(|candidate| candidate.engine.container_id.clone())
        });

        if let Some(container_id) = chosen_id {
            let candidate = candidates
                .iter()
                .find(|c| c.engine.container_id == container_id)
                .ok_or_else(|| FleetError::internal("chosen engine vanished from candidates"))?;
            return Ok(SelectedEngine {
                container_id,
                host: candidate.engine.host.clone(),
                port: candidate.engine.port,
                p2p_forwarded: candidate.engine.p2p_forwarded,
            });
        }

        // No engine with headroom: try to grow the fleet.
        let health = self.health_snapshot();
        if !health.can_provision {
            if health.should_wait {
                return Err(FleetError::ProvisioningBlocked(health.blocked_detail()));
            }
            let reason = if health.blocked_reason.is_empty() {
                "no engine with capacity and provisioning unavailable".to_string()
            } else {
                health.blocked_reason
            };
            return Err(FleetError::no_engine(reason));
        }

        let provisioned = self.provision_with_retry(self.cfg.provision_attempts).await?;
        // The fleet just changed; concurrent selections must not keep being
        // served the pre-provision list for the rest of the TTL.
        self.cache.invalidate();
        self.pending.note(&provisioned.container_id);
        match self.wait_for_engine(&provisioned.container_id).await {
            Ok(engine) => Ok(SelectedEngine {
                container_id: engine.container_id,
                host: engine.host,
                port: engine.port,
                p2p_forwarded: engine.p2p_forwarded,
            }),
            Err(e) => {
                self.pending.release(&provisioned.container_id);
                Err(e)
            }
        }
    }

    async fn wait_for_engine(&self, container_id: &str) -> Result<Engine, FleetError> {
        let deadline = Instant::now() + self.cfg.engine_ready_timeout;
        loop {
            match self.list_engines_fresh().await {
                Ok(engines) => {
                    if let Some(engine) = engines
                        .into_iter()
                        .find(|e| e.container_id == container_id)
                    {
                        return Ok(engine);
                    }
                }
                Err(e) => warn!(container_id, error = %e, "engine list fetch failed while waiting"),
            }
            if Instant::now() >= deadline {
                return Err(FleetError::EngineNotReady {
                    container_id: container_id.to_string(),
                    waited_ms: self.cfg.engine_ready_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.cfg.engine_ready_poll).await;
        }
    }

    // --- provisioning ----------------------------------------------------

    pub async fn provision_with_retry(
        &self,
        max_attempts: u32,
    ) -> Result<ProvisionResponse, FleetError> {
        let started_at = Instant::now();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.provision_once().await {
                Ok(response) => {
                    info!(
                        container_id = %response.container_id,
                        attempt, "engine provisioned"
                    );
                    break Ok(response);
                }
                Err(FleetError::ProvisioningBlocked(detail)) => {
                    if !detail.should_wait {
                        break Err(FleetError::ProvisioningFailed(detail));
                    }
                    if attempt >= max_attempts {
                        break Err(FleetError::ProvisioningBlocked(detail));
                    }
                    let wait = calculate_wait(detail.recovery_eta_seconds, attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        code = detail.code.as_str(),
                        wait_ms = wait.as_millis() as u64,
                        "provisioning blocked; retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(other) => break Err(other),
            }
        };
        if let Some(sink) = &self.debug {
            sink.provisioning(ProvisioningRecord {
                operation: "provision".to_string(),
                duration_ms: started_at.elapsed().as_millis() as u64,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                retries: attempt.saturating_sub(1),
            });
            if let Err(e) = &result {
                sink.stress(StressRecord {
                    kind: "provisioning_exhausted".to_string(),
                    severity: "high".to_string(),
                    description: format!("provisioning gave up after {attempt} attempt(s)"),
                    details: Some(serde_json::json!({ "error": e.to_string() })),
                });
            }
        }
        result
    }

    async fn provision_once(&self) -> Result<ProvisionResponse, FleetError> {
        let response = self
            .request(Method::POST, "provision/acestream")
            .json(&ProvisionRequest::default())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| FleetError::decode("provision response", e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| value.get("detail").cloned())
            .map(|value| parse_provision_detail(&value))
            .unwrap_or_else(|| map_legacy_error(&body));
        Err(FleetError::ProvisioningBlocked(detail))
    }

    // --- pending allocations ---------------------------------------------

    /// Release the pending allocation for a selection that will never reach
    /// `emit_started` (session open failed, handler bailed out).
    pub fn release_pending(&self, container_id: &str) {
        self.pending.release(container_id);
    }

    pub fn pending_count(&self, container_id: &str) -> u32 {
        self.pending.count(container_id)
    }

    pub fn pending_total(&self) -> u32 {
        self.pending.total()
    }

    // --- lifecycle events ------------------------------------------------

    /// Report a started stream. Synchronous by contract: returns only after
    /// the orchestrator acknowledged or rejected, which guarantees
    /// started-before-ended ordering for this stream. The pending allocation
    /// is released once the attempt completes, acknowledged or not.
    pub async fn emit_started(&self, started: StartedStream<'_>) -> Result<(), FleetError> {
        let event = StreamStartedEvent {
            container_id: started.container_id.to_string(),
            engine: EngineAddr {
                host: started.host.to_string(),
                port: started.port,
            },
            stream: StreamDescriptor {
                key_type: started.key.kind().to_string(),
                key: started.key.value().to_string(),
            },
            session: SessionInfo {
                playback_session_id: started.session.playback_session_id.clone(),
                stat_url: started.session.stat_url.clone(),
                command_url: started.session.command_url.clone(),
                is_live: started.is_live,
            },
            labels: StartedLabels {
                stream_id: started.stream_id.to_string(),
            },
        };

        let result = async {
            let response = self
                .request(Method::POST, "events/stream_started")
                .json(&event)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FleetError::Api {
                    status,
                    operation: "stream_started",
                    body: response.text().await.unwrap_or_default(),
                });
            }
            Ok(())
        }
        .await;

        self.pending.release(started.container_id);
        result
    }

    /// Report an ended stream. Asynchronous and idempotent: the first call
    /// for a stream id wins, later calls are dropped without a network post.
    pub fn emit_ended(self: &Arc<Self>, container_id: &str, stream_id: &str, reason: EndReason) {
        {
            let mut ended = self.ended.lock();
            if !ended.insert(stream_id.to_string()) {
                debug!(stream_id, "duplicate ended event suppressed");
                return;
            }
        }

        let client = self.clone();
        let event = StreamEndedEvent {
            container_id: container_id.to_string(),
            stream_id: stream_id.to_string(),
            reason,
        };
        tokio::spawn(async move {
            let result = client
                .request(Method::POST, "events/stream_ended")
                .json(&event)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(stream_id = %event.stream_id, %reason, "ended event delivered");
                }
                Ok(response) => warn!(
                    stream_id = %event.stream_id,
                    status = %response.status(),
                    "orchestrator rejected ended event"
                ),
                Err(e) => warn!(stream_id = %event.stream_id, error = %e, "ended event post failed"),
            }
        });
    }

    #[doc(hidden)]
    pub fn ended_set_len(&self) -> usize {
        self.ended.lock().len()
    }

    // --- background upkeep -----------------------------------------------

    /// Start the health poller (30 s cadence, first fetch immediate) and the
    /// ended-set sweeper. Both stop when the token is cancelled.
    pub fn spawn_background(self: &Arc<Self>, token: CancellationToken) {
        let client = self.clone();
        let poll_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.cfg.status_poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = poll_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = client.refresh_health().await {
                            warn!(error = %e, "orchestrator status fetch failed");
                        }
                    }
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.cfg.ended_sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut ended = client.ended.lock();
                        if ended.len() > client.cfg.ended_set_cap {
                            // Streams that ended minutes ago never receive a
                            // late duplicate from this process.
                            debug!(entries = ended.len(), "clearing ended-stream set");
                            ended.clear();
                        }
                    }
                }
            }
        });
    }
}
