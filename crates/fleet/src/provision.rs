//! Provisioning retry math and failure-body parsing.
//!
//! The orchestrator reports provisioning failures either as a structured
//! `detail` object or, on older deployments, as a bare string. The string
//! form is a deprecation bridge: it is mapped to structured codes by keyword
//! and defaults conservatively (general_error, no wait) when nothing matches.

use std::time::Duration;

use crate::error::{BlockReason, ProvisionError};

/// Exponential backoff bounds used when the orchestrator gives no ETA.
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 120;

/// Wait before retry `attempt` (1-based) given the orchestrator's recovery ETA.
///
/// The first retry goes early at half the ETA; later retries wait the full
/// ETA. With no ETA the wait is `min(30 * 2^attempt, 120)` seconds.
pub fn calculate_wait(eta_seconds: u64, attempt: u32) -> Duration {
    if eta_seconds == 0 {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let secs = BACKOFF_BASE_SECS
            .saturating_mul(multiplier)
            .min(BACKOFF_CAP_SECS);
        return Duration::from_secs(secs);
    }
    if attempt <= 1 {
        Duration::from_secs(eta_seconds / 2)
    } else {
        Duration::from_secs(eta_seconds)
    }
}

/// Synthesize a structured provisioning error from a legacy string body.
pub fn map_legacy_error(message: &str) -> ProvisionError {
    let lowered = message.to_lowercase();
    let (code, eta, should_wait) = if lowered.contains("vpn") {
        (BlockReason::VpnDisconnected, 60, true)
    } else if lowered.contains("circuit breaker") {
        (BlockReason::CircuitBreaker, 180, true)
    } else if lowered.contains("capacity") {
        (BlockReason::MaxCapacity, 30, true)
    } else {
        (BlockReason::GeneralError, 0, false)
    };
    ProvisionError {
        code,
        message: message.to_string(),
        recovery_eta_seconds: eta,
        should_wait,
        can_retry: should_wait,
    }
}

/// Parse the `detail` field of a provisioning failure body.
pub fn parse_provision_detail(detail: &serde_json::Value) -> ProvisionError {
    match detail {
        serde_json::Value::String(message) => map_legacy_error(message),
        serde_json::Value::Object(_) => serde_json::from_value(detail.clone())
            .unwrap_or_else(|_| map_legacy_error(&detail.to_string())),
        other => map_legacy_error(&other.to_string()),
    }
}
