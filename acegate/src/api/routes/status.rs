//! Status and liveness routes.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fleet::{Capacity, StreamKey};

use crate::api::AppState;
use crate::stream::active::ActiveStreamSnapshot;
use crate::stream::handler::StreamQuery;

#[derive(Debug, Serialize)]
pub struct OrchestratorView {
    pub status: String,
    pub can_provision: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub blocked_reason: String,
    pub vpn_connected: bool,
    pub capacity: Capacity,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorView>,
    pub active_streams: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<ActiveStreamSnapshot>,
}

/// `GET /ace/status[?id=...|infohash=...]`
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Json<StatusResponse> {
    let key = query
        .id
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(|id| StreamKey::Id(id.clone()))
        .or_else(|| {
            query
                .infohash
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|hash| StreamKey::Infohash(hash.clone()))
        });
    let stream = key.as_ref().and_then(|k| state.active.find_by_key(k));

    let orchestrator = state.orchestrator.as_ref().map(|client| {
        let health = client.health_snapshot();
        OrchestratorView {
            status: health.status,
            can_provision: health.can_provision,
            blocked_reason: health.blocked_reason,
            vpn_connected: health.vpn_connected,
            capacity: health.capacity,
            last_check: health.last_check,
        }
    });

    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        orchestrator,
        active_streams: state.active.count(),
        stream,
    })
}

/// Liveness probe.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
