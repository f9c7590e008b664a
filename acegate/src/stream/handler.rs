//! Per-request streaming pipeline.
//!
//! Parse -> EngineSelected -> SessionOpened -> Streaming -> Ended. Engine
//! selection and provisioning retries live in the fleet client; everything
//! here is single-shot because the player retries failed requests itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use fleet::debug::{DebugSink, ErrorRecord, LifecycleRecord, StressRecord};
use fleet::{
    EndReason, EngineFailureTracker, FleetError, OrchestratorClient, SelectedEngine,
    SessionHandle, StartedStream, StreamKey, UpstreamSessionClient,
};

use crate::api::AppState;
use crate::api::error::ApiError;
use crate::stream::active::{ActiveStreamInfo, ActiveStreams};
use crate::stream::{copier, reason};

const STREAM_CONTENT_TYPE: &str = "video/MP2T";
/// Capacity of the in-process pipe between the pump task and the response
/// body; backpressure from a slow client builds up here first.
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub id: Option<String>,
    pub infohash: Option<String>,
    pub pid: Option<String>,
}

/// Validate the client's query: exactly one identifier, and `pid` is
/// reserved for the proxy.
pub fn parse_stream_request(query: &StreamQuery) -> Result<StreamKey, ApiError> {
    if query.pid.is_some() {
        return Err(ApiError::bad_request(
            "pid is assigned by the proxy and may not be supplied",
        ));
    }
    let id = query.id.as_deref().filter(|s| !s.is_empty());
    let infohash = query.infohash.as_deref().filter(|s| !s.is_empty());
    match (id, infohash) {
        (Some(id), None) => Ok(StreamKey::Id(id.to_string())),
        (None, Some(hash)) => Ok(StreamKey::Infohash(hash.to_string())),
        (Some(_), Some(_)) => Err(ApiError::bad_request(
            "exactly one of id and infohash must be given",
        )),
        (None, None) => Err(ApiError::bad_request(
            "missing stream identifier: id or infohash",
        )),
    }
}

pub async fn serve_stream(state: &AppState, key: StreamKey) -> Result<Response, ApiError> {
    let request_started = Instant::now();

    let engine = select_engine(state).await?;
    let container_id = engine.container_id.clone();
    let stream_id = Uuid::new_v4().to_string();

    // The handler future is dropped as soon as the client goes away, so
    // every await between selection and the pump handoff runs under a guard
    // that unwinds the bookkeeping (pending, admission, opened session).
    let mut guard = SetupGuard {
        orchestrator: state.orchestrator.clone(),
        tracker: state.tracker.clone(),
        sessions: state.sessions.clone(),
        container_id: container_id.clone(),
        stream_id: stream_id.clone(),
        pending: state.orchestrator.is_some(),
        attempt: false,
        session: None,
    };

    // Admission: bounded in-flight session starts per engine.
    if !state.tracker.record_attempt(&container_id) {
        state.debug.stress(StressRecord {
            kind: "admission_rejected".to_string(),
            severity: "warning".to_string(),
            description: format!("engine {container_id} is saturated with session starts"),
            details: Some(serde_json::json!({
                "container_id": container_id,
                "key": key.to_string(),
            })),
        });
        return Err(ApiError::service_unavailable(
            "Service at capacity: Please try again in a moment",
        ));
    }
    guard.attempt = true;

    let session = match state.sessions.open(&engine.host, engine.port, &key).await {
        Ok(session) => {
            state.tracker.record_success(&container_id);
            state.tracker.release_attempt(&container_id);
            guard.attempt = false;
            guard.session = Some(session.clone());
            session
        }
        Err(e) => {
            state.tracker.record_failure(&container_id, &e.to_string());
            if let Some(client) = &state.orchestrator {
                client.emit_ended(&container_id, &stream_id, EndReason::SessionOpenFailed);
            }
            state.debug.error(ErrorRecord {
                component: "stream_handler".to_string(),
                operation: "open_session".to_string(),
                error_kind: "upstream_session_failed".to_string(),
                error_message: e.to_string(),
                context: Some(serde_json::json!({
                    "key": key.to_string(),
                    "container_id": container_id,
                })),
            });
            warn!(%key, container_id = %container_id, error = %e, "session open failed");
            // Guard drop releases the pending allocation and the admission.
            return Err(session_error(e));
        }
    };

    // Synchronous by contract: the orchestrator sees started before any
    // ended for this stream. A failed post is logged, never surfaced.
    if let Some(client) = &state.orchestrator {
        if let Err(e) = client
            .emit_started(StartedStream {
                container_id: &container_id,
                host: &engine.host,
                port: engine.port,
                key: &key,
                session: &session,
                is_live: true,
                stream_id: &stream_id,
            })
            .await
        {
            warn!(stream_id = %stream_id, error = %e, "stream_started event failed");
        }
    }
    // emit_started released the allocation whether or not it was acked.
    guard.pending = false;

    let upstream = match state.sessions.start_playback(&session).await {
        Ok(response) => response,
        Err(e) => {
            guard.session = None;
            state.sessions.close(&session).await;
            if let Some(client) = &state.orchestrator {
                client.emit_ended(&container_id, &stream_id, EndReason::SessionOpenFailed);
            }
            warn!(%key, container_id = %container_id, error = %e, "playback fetch failed");
            return Err(session_error(e));
        }
    };

    let bytes = Arc::new(AtomicU64::new(0));
    state.active.insert(
        stream_id.clone(),
        ActiveStreamInfo {
            key: key.clone(),
            container_id: container_id.clone(),
            started_at: Utc::now(),
            bytes: bytes.clone(),
        },
    );
    state.debug.stream_lifecycle(LifecycleRecord {
        event: "stream_started".to_string(),
        stream_id: stream_id.clone(),
        engine_id: container_id.clone(),
        duration_ms: request_started.elapsed().as_millis() as u64,
        extras: None,
    });
    info!(%key, stream_id = %stream_id, container_id = %container_id, "stream started");

    let (read_half, write_half) = tokio::io::duplex(PIPE_CAPACITY);
    let source = StreamReader::new(upstream.bytes_stream().map_err(stream_io_error));

    // The pump task owns teardown from here on.
    guard.session = None;

    let task = StreamTask {
        orchestrator: state.orchestrator.clone(),
        sessions: state.sessions.clone(),
        active: state.active.clone(),
        debug: state.debug.clone(),
        shutdown: state.shutdown.clone(),
        idle_timeout: state.config.idle_timeout,
        buffer_size: state.config.buffer_size,
        container_id,
        stream_id,
        session,
        bytes,
    };
    tokio::spawn(task.pump(write_half, source));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .body(Body::from_stream(ReaderStream::new(read_half)))
        .map_err(|e| ApiError::internal(e.to_string()))
}

async fn select_engine(state: &AppState) -> Result<SelectedEngine, ApiError> {
    match &state.orchestrator {
        Some(client) => client
            .select_best_engine(Some(state.tracker.as_ref()))
            .await
            .map_err(ApiError::from),
        // No orchestrator: every request goes to the static upstream engine.
        None => {
            let upstream = &state.config.upstream;
            Ok(SelectedEngine {
                container_id: format!("upstream:{}:{}", upstream.host, upstream.port),
                host: upstream.host.clone(),
                port: upstream.port,
                p2p_forwarded: false,
            })
        }
    }
}

fn session_error(error: FleetError) -> ApiError {
    if error.is_timeout() {
        ApiError::gateway_timeout("Engine did not respond in time")
    } else {
        ApiError::bad_gateway(format!("Engine refused the stream: {error}"))
    }
}

fn stream_io_error(error: reqwest::Error) -> std::io::Error {
    if error.is_timeout() {
        std::io::Error::new(std::io::ErrorKind::TimedOut, error)
    } else {
        std::io::Error::other(error)
    }
}

/// Unwinds setup bookkeeping when the handler future is dropped before the
/// pump task takes over (typically: the client disconnected mid-setup).
/// Stages already completed are flagged off as the handler passes them.
struct SetupGuard {
    orchestrator: Option<Arc<OrchestratorClient>>,
    tracker: Arc<EngineFailureTracker>,
    sessions: Arc<UpstreamSessionClient>,
    container_id: String,
    stream_id: String,
    pending: bool,
    attempt: bool,
    session: Option<SessionHandle>,
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        if self.attempt {
            self.tracker.release_attempt(&self.container_id);
        }
        if self.pending
            && let Some(client) = &self.orchestrator
        {
            client.release_pending(&self.container_id);
        }
        if let Some(session) = self.session.take() {
            if let Some(client) = &self.orchestrator {
                client.emit_ended(
                    &self.container_id,
                    &self.stream_id,
                    EndReason::ClientDisconnected,
                );
            }
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                sessions.close(&session).await;
            });
        }
    }
}

/// Everything the pump task owns for the lifetime of one stream.
struct StreamTask {
    orchestrator: Option<Arc<OrchestratorClient>>,
    sessions: Arc<UpstreamSessionClient>,
    active: Arc<ActiveStreams>,
    debug: Arc<dyn DebugSink>,
    shutdown: CancellationToken,
    idle_timeout: Duration,
    buffer_size: usize,
    container_id: String,
    stream_id: String,
    session: SessionHandle,
    bytes: Arc<AtomicU64>,
}

impl StreamTask {
    /// Run the copy, then the unified teardown path. Every teardown step
    /// runs regardless of how the copy ended or whether an earlier step
    /// failed.
    async fn pump<W, R>(self, dst: W, src: R)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let streaming_started = Instant::now();

        let outcome = tokio::select! {
            outcome = copier::run(dst, src, self.idle_timeout, self.buffer_size, self.bytes.clone()) => outcome,
            _ = self.shutdown.cancelled() => copier::CopyOutcome {
                bytes_copied: self.bytes.load(Ordering::Relaxed),
                kind: copier::CopyErrorKind::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "server shutting down",
                )),
            },
        };

        let reason = reason::classify_copy(&outcome.kind);
        if reason.is_error() {
            warn!(
                stream_id = %self.stream_id,
                %reason,
                bytes = outcome.bytes_copied,
                "stream ended"
            );
        } else {
            info!(
                stream_id = %self.stream_id,
                %reason,
                bytes = outcome.bytes_copied,
                "stream ended"
            );
        }

        self.sessions.close(&self.session).await;
        if let Some(client) = &self.orchestrator {
            client.emit_ended(&self.container_id, &self.stream_id, reason);
        }
        self.active.remove(&self.stream_id);
        self.debug.stream_lifecycle(LifecycleRecord {
            event: "stream_ended".to_string(),
            stream_id: self.stream_id.clone(),
            engine_id: self.container_id.clone(),
            duration_ms: streaming_started.elapsed().as_millis() as u64,
            extras: Some(serde_json::json!({
                "reason": reason.as_str(),
                "bytes_copied": outcome.bytes_copied,
            })),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: Option<&str>, infohash: Option<&str>, pid: Option<&str>) -> StreamQuery {
        StreamQuery {
            id: id.map(String::from),
            infohash: infohash.map(String::from),
            pid: pid.map(String::from),
        }
    }

    #[test]
    fn exactly_one_identifier_required() {
        assert!(parse_stream_request(&query(None, None, None)).is_err());
        assert!(parse_stream_request(&query(Some("a"), Some("b"), None)).is_err());
        assert!(parse_stream_request(&query(Some(""), None, None)).is_err());

        let key = parse_stream_request(&query(Some("movie"), None, None)).unwrap();
        assert_eq!(key, StreamKey::Id("movie".to_string()));
        let key = parse_stream_request(&query(None, Some("c0ffee"), None)).unwrap();
        assert_eq!(key, StreamKey::Infohash("c0ffee".to_string()));
    }

    #[test]
    fn preset_pid_is_rejected() {
        let result = parse_stream_request(&query(Some("movie"), None, Some("abc")));
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().status,
            axum::http::StatusCode::BAD_REQUEST
        );
    }
}
