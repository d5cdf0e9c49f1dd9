use axum::extract::State;

use crate::{errors::AgentResult, models::ApiResponse, routes::AppState};

/// Tears down the running instance and releases everything it held.
pub(crate) async fn handler(State(state): State<AppState>) -> AgentResult<axum::Json<ApiResponse<()>>> {
    state.instance_manager.stop().await?;
    Ok(axum::Json(ApiResponse::empty_ok()))
}
