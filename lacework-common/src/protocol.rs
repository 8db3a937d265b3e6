//! Protocol definitions for the Lacework controller API

use crate::Lease;
use serde::{Deserialize, Serialize};

/// Base path for REST API
pub const API_BASE_PATH: &str = "/api/v1";

/// REST API endpoints
pub mod endpoints {
    use super::API_BASE_PATH;

    /// Acquire (or re-fetch) the lease of an underlay host
    pub const ACQUIRE_LEASE: &str = const_format::concatcp!(API_BASE_PATH, "/leases/acquire");

    /// Renew an existing lease
    pub const RENEW_LEASE: &str = const_format::concatcp!(API_BASE_PATH, "/leases/renew");

    /// Release a lease
    pub const RELEASE_LEASE: &str = const_format::concatcp!(API_BASE_PATH, "/leases/release");

    /// List leases that are still within the liveness window
    pub const ROUTABLE_LEASES: &str = const_format::concatcp!(API_BASE_PATH, "/leases");

    /// Health check endpoint
    pub const HEALTH: &str = "/health";

    /// Metrics endpoint (Prometheus format)
    pub const METRICS: &str = "/metrics";
}

/// Body of acquire and release requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnderlayRequest {
    /// Underlay address of the requesting host
    pub underlay_ip: String,
}

/// Leases that overlay routes should currently be programmed for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutableLeases {
    /// Active leases, oldest allocation first
    pub leases: Vec<Lease>,
}

/// HTTP response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Success status
    pub success: bool,
    /// Response data
    pub data: Option<T>,
    /// Error message if any
    pub error: Option<String>,
    /// Request timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an error response
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response() {
        let success_response = ApiResponse::success("test data");
        assert!(success_response.success);
        assert_eq!(success_response.data, Some("test data"));
        assert!(success_response.error.is_none());

        let error_response: ApiResponse<String> = ApiResponse::error("test error".to_string());
        assert!(!error_response.success);
        assert!(error_response.data.is_none());
        assert_eq!(error_response.error, Some("test error".to_string()));
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(endpoints::ACQUIRE_LEASE, "/api/v1/leases/acquire");
        assert_eq!(endpoints::ROUTABLE_LEASES, "/api/v1/leases");
    }

    #[test]
    fn test_underlay_request_roundtrip() {
        let request: UnderlayRequest =
            serde_json::from_str(r#"{"underlay_ip": "10.244.4.5"}"#).unwrap();
        assert_eq!(request.underlay_ip, "10.244.4.5");
    }
}
