//! Wire types exchanged with the orchestrator and engine middleware, plus
//! the process-local health snapshot derived from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BlockReason, ProvisionError};

/// Identifier a player client asks for a stream by. Exactly one form is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// Proxy-specific content id.
    Id(String),
    /// Content hash (hex infohash).
    Infohash(String),
}

impl StreamKey {
    /// Query parameter name for the engine middleware and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::Infohash(_) => "infohash",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Id(v) | Self::Infohash(v) => v,
        }
    }

    pub fn param(&self) -> (&'static str, &str) {
        (self.kind(), self.value())
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Engine record as reported by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// P2P port forwarded through the fleet VPN.
    #[serde(default)]
    pub p2p_forwarded: bool,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stream_usage: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: String,
    /// Advisory: stream ids the orchestrator currently attributes to this engine.
    #[serde(default)]
    pub stream_ids: Vec<String>,
}

impl Engine {
    pub fn is_healthy(&self) -> bool {
        self.health == "healthy"
    }
}

/// Stream record as reported by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: String,
    #[serde(default)]
    pub key_type: String,
    #[serde(default)]
    pub key: String,
    pub container_id: String,
    #[serde(default)]
    pub playback_session_id: String,
    #[serde(default)]
    pub stat_url: String,
    #[serde(default)]
    pub command_url: String,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capacity {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub used: u32,
    #[serde(default)]
    pub available: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VpnStatus {
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisioningInfo {
    #[serde(default)]
    pub can_provision: bool,
    #[serde(default)]
    pub blocked_reason: String,
    /// Optional structured detail; older orchestrators omit it.
    #[serde(default)]
    pub blocked_reason_details: Option<ProvisionError>,
}

/// `GET /orchestrator/status` response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub vpn: VpnStatus,
    #[serde(default)]
    pub provisioning: ProvisioningInfo,
    #[serde(default)]
    pub capacity: Capacity,
}

/// Process-local view of the orchestrator, replaced wholesale by the health
/// poller and read by selection and the status endpoint.
#[derive(Debug, Clone)]
pub struct OrchestratorHealth {
    pub status: String,
    pub can_provision: bool,
    pub blocked_reason: String,
    pub blocked_code: BlockReason,
    pub recovery_eta_seconds: u64,
    pub should_wait: bool,
    pub vpn_connected: bool,
    pub capacity: Capacity,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for OrchestratorHealth {
    fn default() -> Self {
        Self {
            status: "unknown".to_string(),
            can_provision: false,
            blocked_reason: String::new(),
            blocked_code: BlockReason::GeneralError,
            recovery_eta_seconds: 0,
            should_wait: false,
            vpn_connected: false,
            capacity: Capacity::default(),
            last_check: None,
        }
    }
}

impl OrchestratorHealth {
    /// Fold a freshly fetched status into the local snapshot. Missing
    /// `blocked_reason_details` degrade to empty code / zero eta / no wait.
    pub fn from_status(status: OrchestratorStatus, checked_at: DateTime<Utc>) -> Self {
        let details = status.provisioning.blocked_reason_details.unwrap_or_default();
        Self {
            status: status.status,
            can_provision: status.provisioning.can_provision,
            blocked_reason: status.provisioning.blocked_reason,
            blocked_code: details.code,
            recovery_eta_seconds: details.recovery_eta_seconds,
            should_wait: details.should_wait,
            vpn_connected: status.vpn.connected,
            capacity: status.capacity,
            last_check: Some(checked_at),
        }
    }

    /// The blocked state as a provisioning error, for surfacing to clients.
    pub fn blocked_detail(&self) -> ProvisionError {
        ProvisionError {
            code: self.blocked_code,
            message: self.blocked_reason.clone(),
            recovery_eta_seconds: self.recovery_eta_seconds,
            should_wait: self.should_wait,
            can_retry: self.should_wait,
        }
    }
}

/// Engine chosen by selection; pending allocation already counted.
#[derive(Debug, Clone)]
pub struct SelectedEngine {
    pub container_id: String,
    pub host: String,
    pub port: u16,
    pub p2p_forwarded: bool,
}

/// `POST /provision/acestream` request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// `POST /provision/acestream` success body.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionResponse {
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub host_http_port: u16,
    #[serde(default)]
    pub container_http_port: u16,
    #[serde(default)]
    pub container_https_port: u16,
}

/// Why a stream ended, as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    ClientDisconnected,
    Timeout,
    NetworkError,
    Eof,
    ClosedPipe,
    ClosedConnection,
    SessionOpenFailed,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientDisconnected => "client_disconnected",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::Eof => "eof",
            Self::ClosedPipe => "closed_pipe",
            Self::ClosedConnection => "closed_connection",
            Self::SessionOpenFailed => "session_open_failed",
            Self::Error => "error",
        }
    }

    /// A client walking away is normal teardown, not an error condition.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Completed | Self::ClientDisconnected)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- lifecycle event payloads -----------------------------------------------

#[derive(Debug, Serialize)]
pub struct EngineAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct StreamDescriptor {
    pub key_type: String,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub playback_session_id: String,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
}

#[derive(Debug, Serialize)]
pub struct StartedLabels {
    pub stream_id: String,
}

/// `POST /events/stream_started` body.
#[derive(Debug, Serialize)]
pub struct StreamStartedEvent {
    pub container_id: String,
    pub engine: EngineAddr,
    pub stream: StreamDescriptor,
    pub session: SessionInfo,
    pub labels: StartedLabels,
}

/// `POST /events/stream_ended` body.
#[derive(Debug, Serialize)]
pub struct StreamEndedEvent {
    pub container_id: String,
    pub stream_id: String,
    pub reason: EndReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_params() {
        let key = StreamKey::Infohash("c0ffee".to_string());
        assert_eq!(key.param(), ("infohash", "c0ffee"));
        assert_eq!(key.to_string(), "infohash:c0ffee");

        let key = StreamKey::Id("movie-1".to_string());
        assert_eq!(key.param(), ("id", "movie-1"));
    }

    #[test]
    fn engine_deserializes_with_minimal_fields() {
        let engine: Engine = serde_json::from_str(
            r#"{"container_id":"abc","host":"10.0.0.2","port":6878}"#,
        )
        .unwrap();
        assert_eq!(engine.container_id, "abc");
        assert!(!engine.p2p_forwarded);
        assert!(engine.stream_ids.is_empty());
        assert!(!engine.is_healthy());
    }

    #[test]
    fn status_without_details_defaults_conservatively() {
        let status: OrchestratorStatus = serde_json::from_str(
            r#"{"status":"degraded","vpn":{"connected":false},
                "provisioning":{"can_provision":false,"blocked_reason":"vpn down"},
                "capacity":{"total":4,"used":4,"available":0}}"#,
        )
        .unwrap();
        let health = OrchestratorHealth::from_status(status, Utc::now());
        assert!(!health.can_provision);
        assert!(!health.should_wait);
        assert_eq!(health.recovery_eta_seconds, 0);
        assert_eq!(health.blocked_code, BlockReason::GeneralError);
        assert_eq!(health.blocked_reason, "vpn down");
    }

    #[test]
    fn status_with_structured_details() {
        let status: OrchestratorStatus = serde_json::from_str(
            r#"{"status":"degraded","provisioning":{
                "can_provision":false,"blocked_reason":"vpn reconnecting",
                "blocked_reason_details":{"code":"vpn_disconnected","message":"vpn reconnecting",
                    "recovery_eta_seconds":60,"should_wait":true,"can_retry":true}}}"#,
        )
        .unwrap();
        let health = OrchestratorHealth::from_status(status, Utc::now());
        assert_eq!(health.blocked_code, BlockReason::VpnDisconnected);
        assert_eq!(health.recovery_eta_seconds, 60);
        assert!(health.should_wait);
    }

    #[test]
    fn end_reason_wire_labels() {
        assert_eq!(EndReason::ClientDisconnected.as_str(), "client_disconnected");
        assert_eq!(
            serde_json::to_string(&EndReason::SessionOpenFailed).unwrap(),
            "\"session_open_failed\""
        );
        assert!(!EndReason::ClientDisconnected.is_error());
        assert!(EndReason::Timeout.is_error());
    }
}
