//! HTTP middleware

use std::time::Duration;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Create logging middleware
pub fn logging_middleware() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

/// Create timeout middleware bounding every request to `timeout`
pub fn timeout_middleware(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::new(timeout)
}
