use axum::http::StatusCode;

/// Unauthenticated liveness probe.
pub(crate) async fn handler() -> StatusCode {
    StatusCode::OK
}
