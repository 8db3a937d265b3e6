//! HTTP request handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use lacework_common::{
    protocol::{ApiResponse, RoutableLeases, UnderlayRequest},
    Lease,
};
use lacework_store::{LeaseStore, StoreError};
use tracing::{error, warn};

use crate::leaser::LeaseError;
use crate::AppState;

/// Lease error rendered as an [`ApiResponse`] with a matching status code
#[derive(Debug)]
pub struct ApiError(LeaseError);

impl From<LeaseError> for ApiError {
    fn from(error: LeaseError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            LeaseError::InvalidLease(_) => StatusCode::BAD_REQUEST,
            LeaseError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            LeaseError::LeaseMismatch { .. } | LeaseError::Contention { .. } => {
                StatusCode::CONFLICT
            }
            LeaseError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LeaseError::Store(store) => match store {
                StoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                StoreError::InvalidLease(_) => StatusCode::BAD_REQUEST,
                StoreError::NotFound { .. } | StoreError::RecordNotAffected => {
                    StatusCode::NOT_FOUND
                }
                StoreError::ConstraintViolation { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }

        let body = ApiResponse::<()>::error(self.0.to_string());
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Acquire the lease of an underlay host, allocating one if needed
pub async fn acquire_lease<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<UnderlayRequest>,
) -> ApiResult<Lease> {
    let lease = state.allocator.acquire(&request.underlay_ip).await?;
    Ok(Json(ApiResponse::success(lease)))
}

/// Renew a lease presented by its holder
pub async fn renew_lease<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
    Json(lease): Json<Lease>,
) -> ApiResult<Lease> {
    let lease = state.allocator.renew_lease(&lease).await?;
    Ok(Json(ApiResponse::success(lease)))
}

/// Release the lease of an underlay host
pub async fn release_lease<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<UnderlayRequest>,
) -> ApiResult<UnderlayRequest> {
    state.allocator.release(&request.underlay_ip).await?;
    Ok(Json(ApiResponse::success(request)))
}

/// List leases that should currently be routed
pub async fn routable_leases<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
) -> ApiResult<RoutableLeases> {
    let leases = state.allocator.routable_leases().await?;
    Ok(Json(ApiResponse::success(RoutableLeases { leases })))
}

/// Health check handler
pub async fn health_check<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
) -> Json<ApiResponse<serde_json::Value>> {
    let pool = state.allocator.pool();
    let health_data = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "subnet_range": pool.range().to_string(),
        "subnet_prefix": pool.subnet_prefix(),
        "pool_size": pool.size(),
        "timestamp": chrono::Utc::now(),
    });

    Json(ApiResponse::success(health_data))
}

/// Metrics handler (Prometheus format)
pub async fn metrics_handler<S: LeaseStore + 'static>(
    State(state): State<AppState<S>>,
) -> Result<String, StatusCode> {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let status = |e: LeaseError| ApiError::from(e).status();

        assert_eq!(
            status(LeaseError::LeaseNotFound("10.0.0.1".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(LeaseError::PoolExhausted {
                range: "10.255.0.0/16".to_string()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(LeaseError::Contention {
                underlay_ip: "10.0.0.1".to_string(),
                attempts: 5
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(LeaseError::InvalidLease(
                lacework_common::LaceworkError::InvalidIp("x".to_string())
            )),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(LeaseError::Store(StoreError::Timeout {
                operation: "selecting all subnets",
                timeout: Duration::from_secs(5),
            })),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(LeaseError::Store(StoreError::MultipleRecordsAffected {
                count: 2
            })),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
