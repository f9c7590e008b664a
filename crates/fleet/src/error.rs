use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};

/// Structured reason the orchestrator gives for refusing to provision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    VpnDisconnected,
    CircuitBreaker,
    MaxCapacity,
    VpnError,
    #[default]
    GeneralError,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VpnDisconnected => "vpn_disconnected",
            Self::CircuitBreaker => "circuit_breaker",
            Self::MaxCapacity => "max_capacity",
            Self::VpnError => "vpn_error",
            Self::GeneralError => "general_error",
        }
    }

    /// Unknown codes from newer or older orchestrators degrade to the
    /// catch-all instead of failing the parse.
    pub fn from_str_lossy(code: &str) -> Self {
        match code {
            "vpn_disconnected" => Self::VpnDisconnected,
            "circuit_breaker" => Self::CircuitBreaker,
            "max_capacity" => Self::MaxCapacity,
            "vpn_error" => Self::VpnError,
            _ => Self::GeneralError,
        }
    }
}

impl<'de> Deserialize<'de> for BlockReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_str_lossy(&code))
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning failure detail, either parsed from the orchestrator's
/// structured `detail` object or synthesized from a legacy string body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionError {
    #[serde(default)]
    pub code: BlockReason,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub recovery_eta_seconds: u64,
    #[serde(default)]
    pub should_wait: bool,
    #[serde(default)]
    pub can_retry: bool,
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if self.recovery_eta_seconds > 0 {
            write!(f, " (eta {}s)", self.recovery_eta_seconds)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("orchestrator request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("orchestrator returned HTTP {status} during {operation}")]
    Api {
        status: StatusCode,
        operation: &'static str,
        body: String,
    },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("provisioning temporarily blocked: {0}")]
    ProvisioningBlocked(ProvisionError),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(ProvisionError),

    #[error("no engine available: {reason}")]
    NoEngineAvailable { reason: String },

    #[error("engine `{container_id}` not visible in fleet after {waited_ms} ms")]
    EngineNotReady {
        container_id: String,
        waited_ms: u64,
    },

    #[error("engine middleware rejected session: {reason}")]
    SessionRejected { reason: String },

    #[error("engine middleware did not respond within {timeout_ms} ms")]
    SessionTimeout { timeout_ms: u64 },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl FleetError {
    pub fn decode(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            what,
            reason: reason.into(),
        }
    }

    pub fn no_engine(reason: impl Into<String>) -> Self {
        Self::NoEngineAvailable {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Seconds the caller should suggest waiting before retrying, when known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ProvisioningBlocked(detail) | Self::ProvisioningFailed(detail)
                if detail.recovery_eta_seconds > 0 =>
            {
                Some(detail.recovery_eta_seconds)
            }
            _ => None,
        }
    }

    /// Whether the upstream gateway timed out rather than refused.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::SessionTimeout { .. } => true,
            Self::Network { source } => source.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_reason_deserializes_known_codes() {
        let code: BlockReason = serde_json::from_str("\"vpn_disconnected\"").unwrap();
        assert_eq!(code, BlockReason::VpnDisconnected);
        let code: BlockReason = serde_json::from_str("\"max_capacity\"").unwrap();
        assert_eq!(code, BlockReason::MaxCapacity);
    }

    #[test]
    fn block_reason_unknown_code_falls_back_to_general() {
        let code: BlockReason = serde_json::from_str("\"quota_exceeded\"").unwrap();
        assert_eq!(code, BlockReason::GeneralError);
    }

    #[test]
    fn provision_error_tolerates_missing_fields() {
        let detail: ProvisionError =
            serde_json::from_str(r#"{"code":"circuit_breaker","message":"too many failures"}"#)
                .unwrap();
        assert_eq!(detail.code, BlockReason::CircuitBreaker);
        assert_eq!(detail.recovery_eta_seconds, 0);
        assert!(!detail.should_wait);
    }

    #[test]
    fn retry_after_only_set_for_known_eta() {
        let blocked = FleetError::ProvisioningBlocked(ProvisionError {
            recovery_eta_seconds: 45,
            ..Default::default()
        });
        assert_eq!(blocked.retry_after(), Some(45));

        let blocked_no_eta = FleetError::ProvisioningBlocked(ProvisionError::default());
        assert_eq!(blocked_no_eta.retry_after(), None);
    }
}
