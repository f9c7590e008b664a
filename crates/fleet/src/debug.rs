//! Typed debug-record surface.
//!
//! The coordination core reports noteworthy events through this trait; what
//! a sink does with them (JSONL file, nothing at all) is the application's
//! concern. All methods default to no-ops so sinks implement only what they
//! store.

use serde::Serialize;

use crate::models::{Capacity, OrchestratorHealth};

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub duration_ms: u64,
    pub status: u16,
    /// Printable stream key, when the request carried one.
    pub stream_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionRecord {
    pub operation: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub container_id: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningRecord {
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: String,
    pub can_provision: bool,
    pub blocked_reason: String,
    pub blocked_code: String,
    pub recovery_eta_seconds: u64,
    pub should_wait: bool,
    pub vpn_connected: bool,
    pub capacity: Capacity,
}

impl From<&OrchestratorHealth> for HealthRecord {
    fn from(health: &OrchestratorHealth) -> Self {
        Self {
            status: health.status.clone(),
            can_provision: health.can_provision,
            blocked_reason: health.blocked_reason.clone(),
            blocked_code: health.blocked_code.as_str().to_string(),
            recovery_eta_seconds: health.recovery_eta_seconds,
            should_wait: health.should_wait,
            vpn_connected: health.vpn_connected,
            capacity: health.capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRecord {
    pub event: String,
    pub stream_id: String,
    pub engine_id: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressRecord {
    pub kind: String,
    pub severity: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub component: String,
    pub operation: String,
    pub error_kind: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

pub trait DebugSink: Send + Sync {
    fn request(&self, _record: RequestRecord) {}
    fn selection(&self, _record: SelectionRecord) {}
    fn provisioning(&self, _record: ProvisioningRecord) {}
    fn orchestrator_health(&self, _record: HealthRecord) {}
    fn stream_lifecycle(&self, _record: LifecycleRecord) {}
    fn stress(&self, _record: StressRecord) {}
    fn error(&self, _record: ErrorRecord) {}
}

/// Sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DebugSink for NoopSink {}
