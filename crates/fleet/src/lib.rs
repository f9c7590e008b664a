//! Fleet coordination for an HTTP streaming proxy fronting peer-to-peer
//! video engines.
//!
//! Talks to the external orchestrator (engine listing, on-demand
//! provisioning, stream lifecycle events, health polling), opens and tears
//! down playback sessions on engine middleware, and keeps the per-engine
//! failure state that guards selection.

pub mod breaker;
pub mod cache;
pub mod client;
pub mod debug;
pub mod error;
pub mod models;
pub mod pending;
pub mod provision;
pub mod selection;
pub mod session;

pub use breaker::{EngineFailureTracker, EngineHealth, TrackerConfig};
pub use client::{OrchestratorClient, OrchestratorConfig, StartedStream};
pub use debug::{
    DebugSink, ErrorRecord, HealthRecord, LifecycleRecord, NoopSink, ProvisioningRecord,
    RequestRecord, SelectionRecord, StressRecord,
};
pub use error::{BlockReason, FleetError, ProvisionError};
pub use models::{
    Capacity, EndReason, Engine, OrchestratorHealth, OrchestratorStatus, ProvisionResponse,
    SelectedEngine, StreamKey, StreamRecord,
};
pub use session::{SessionHandle, UpstreamSessionClient};
