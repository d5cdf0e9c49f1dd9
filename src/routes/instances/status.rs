use axum::extract::State;

use crate::{errors::AgentResult, models::{ApiResponse, InstanceStatusResponse}, routes::AppState};

/// Reports the running instance's current lifecycle status.
pub(crate) async fn handler(State(state): State<AppState>) -> AgentResult<axum::Json<ApiResponse<InstanceStatusResponse>>> {
    let status = state.instance_manager.status().await;
    Ok(axum::Json(ApiResponse::ok(InstanceStatusResponse { status })))
}
