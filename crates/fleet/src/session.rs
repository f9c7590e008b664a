//! Engine middleware client: opens playback sessions, starts the media
//! fetch, and tears sessions down.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::FleetError;
use crate::models::StreamKey;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// One opened playback session on one engine. The pid is generated fresh
/// per client request; reusing a pid across concurrent requests to the same
/// engine is a protocol error at the middleware.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub pid: String,
    pub playback_url: String,
    pub stat_url: String,
    pub command_url: String,
    pub playback_session_id: String,
}

#[derive(Debug, Deserialize)]
struct MiddlewareEnvelope {
    #[serde(default)]
    response: Option<SessionDescriptor>,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct SessionDescriptor {
    playback_url: String,
    #[serde(default)]
    stat_url: String,
    #[serde(default)]
    command_url: String,
    #[serde(default)]
    playback_session_id: String,
}

pub struct UpstreamSessionClient {
    http: reqwest::Client,
    scheme: String,
    /// Bound on how long the middleware may take to produce response headers.
    no_response_timeout: Duration,
}

impl UpstreamSessionClient {
    pub fn new(
        scheme: impl Into<String>,
        no_response_timeout: Duration,
    ) -> Result<Self, FleetError> {
        // Media bytes must pass through untouched; decompression would also
        // break the idle-timeout signal by buffering.
        let http = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            scheme: scheme.into(),
            no_response_timeout,
        })
    }

    /// Open a playback session: a single GET against the engine's middleware
    /// with a freshly generated pid and `format=json`.
    pub async fn open(
        &self,
        host: &str,
        port: u16,
        key: &StreamKey,
    ) -> Result<SessionHandle, FleetError> {
        let pid = Uuid::new_v4().to_string();
        let url = format!("{}://{host}:{port}/ace/getstream", self.scheme);
        let (param, value) = key.param();

        let request = self
            .http
            .get(&url)
            .query(&[(param, value), ("format", "json"), ("pid", pid.as_str())]);

        let response = tokio::time::timeout(self.no_response_timeout, request.send())
            .await
            .map_err(|_| FleetError::SessionTimeout {
                timeout_ms: self.no_response_timeout.as_millis() as u64,
            })??;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Api {
                status,
                operation: "open session",
                body: response.text().await.unwrap_or_default(),
            });
        }

        let envelope: MiddlewareEnvelope = response
            .json()
            .await
            .map_err(|e| FleetError::decode("session descriptor", e.to_string()))?;
        if !envelope.error.is_empty() {
            return Err(FleetError::SessionRejected {
                reason: envelope.error,
            });
        }
        let descriptor = envelope.response.ok_or_else(|| {
            FleetError::decode("session descriptor", "missing response object")
        })?;

        debug!(
            %key,
            %pid,
            playback_session_id = %descriptor.playback_session_id,
            "opened engine session"
        );
        Ok(SessionHandle {
            pid,
            playback_url: descriptor.playback_url,
            stat_url: descriptor.stat_url,
            command_url: descriptor.command_url,
            playback_session_id: descriptor.playback_session_id,
        })
    }

    /// Start the media fetch for an opened session. Headers must arrive
    /// within the no-response bound; the body streams unbounded after that.
    pub async fn start_playback(
        &self,
        session: &SessionHandle,
    ) -> Result<reqwest::Response, FleetError> {
        let request = self.http.get(&session.playback_url);
        let response = tokio::time::timeout(self.no_response_timeout, request.send())
            .await
            .map_err(|_| FleetError::SessionTimeout {
                timeout_ms: self.no_response_timeout.as_millis() as u64,
            })??;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Api {
                status,
                operation: "start playback",
                body: String::new(),
            });
        }
        Ok(response)
    }

    /// Tear the session down. Best-effort: the client is already gone, so
    /// failures are logged and swallowed.
    pub async fn close(&self, session: &SessionHandle) {
        if session.command_url.is_empty() {
            return;
        }
        let result = self
            .http
            .get(&session.command_url)
            .query(&[("method", "stop")])
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                match response.json::<MiddlewareEnvelope>().await {
                    Ok(envelope) if !envelope.error.is_empty() => {
                        warn!(pid = %session.pid, error = %envelope.error, "session stop rejected");
                    }
                    Ok(_) => debug!(pid = %session.pid, "session closed"),
                    Err(e) => {
                        warn!(pid = %session.pid, %status, error = %e, "unreadable stop response");
                    }
                }
            }
            Err(e) => warn!(pid = %session.pid, error = %e, "failed to stop session"),
        }
    }
}
