//! HTTP boundary errors.
//!
//! Everything below the boundary is a typed fleet error; here it becomes a
//! status code, a JSON body, and (for temporarily blocked provisioning) a
//! `Retry-After` header with the recovery ETA.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use fleet::{BlockReason, FleetError, ProvisionError};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message,
            retry_after: self.retry_after,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// User-facing message for a blocked provisioning attempt.
fn blocked_message(detail: &ProvisionError) -> String {
    match detail.code {
        BlockReason::VpnDisconnected => {
            "Service temporarily unavailable: VPN connection is being restored".to_string()
        }
        BlockReason::CircuitBreaker => {
            "Service temporarily unavailable: System is recovering from errors".to_string()
        }
        BlockReason::MaxCapacity => {
            "Service at capacity: Please try again in a moment".to_string()
        }
        _ => format!("Service temporarily unavailable: {}", detail.message),
    }
}

impl From<FleetError> for ApiError {
    fn from(error: FleetError) -> Self {
        match error {
            FleetError::ProvisioningBlocked(detail) => {
                let mut api = ApiError::service_unavailable(blocked_message(&detail));
                if detail.recovery_eta_seconds > 0 {
                    api = api.with_retry_after(detail.recovery_eta_seconds);
                }
                api
            }
            FleetError::ProvisioningFailed(detail) => {
                ApiError::service_unavailable(blocked_message(&detail))
            }
            FleetError::NoEngineAvailable { reason } => {
                ApiError::service_unavailable(format!("Service temporarily unavailable: {reason}"))
            }
            FleetError::EngineNotReady { .. } => ApiError::service_unavailable(
                "Service temporarily unavailable: New engine is still starting",
            ),
            FleetError::SessionTimeout { .. } => {
                ApiError::gateway_timeout("Engine did not respond in time")
            }
            FleetError::SessionRejected { reason } => {
                ApiError::bad_gateway(format!("Engine refused the stream: {reason}"))
            }
            FleetError::Network { .. } | FleetError::Api { .. } => {
                ApiError::bad_gateway("Upstream request failed")
            }
            FleetError::Decode { .. } | FleetError::Internal { .. } => {
                ApiError::internal("Internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_error_carries_retry_after() {
        let api: ApiError = FleetError::ProvisioningBlocked(ProvisionError {
            code: BlockReason::VpnDisconnected,
            message: "vpn reconnecting".to_string(),
            recovery_eta_seconds: 60,
            should_wait: true,
            can_retry: true,
        })
        .into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.retry_after, Some(60));
        assert!(api.message.contains("VPN connection is being restored"));
    }

    #[test]
    fn permanent_failure_has_no_retry_after() {
        let api: ApiError = FleetError::ProvisioningFailed(ProvisionError {
            code: BlockReason::GeneralError,
            message: "docker daemon down".to_string(),
            ..Default::default()
        })
        .into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.retry_after, None);
        assert!(api.message.contains("docker daemon down"));
    }

    #[test]
    fn capacity_message_maps() {
        let api: ApiError = FleetError::ProvisioningBlocked(ProvisionError {
            code: BlockReason::MaxCapacity,
            recovery_eta_seconds: 30,
            should_wait: true,
            ..Default::default()
        })
        .into();
        assert_eq!(
            api.message,
            "Service at capacity: Please try again in a moment"
        );
        assert_eq!(api.retry_after, Some(30));
    }
}
