use std::time::Duration;

use axum::extract::State;

use crate::{errors::{AgentError, AgentResult}, models::ApiResponse, routes::AppState};

const RESTART_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Triggers a self-update: downloads the new agent binary and swaps it in.
pub(crate) async fn handler(State(state): State<AppState>) -> AgentResult<axum::Json<ApiResponse<()>>> {
    crate::self_update::trigger(&state.self_update_url, RESTART_GRACE_PERIOD)
        .await
        .map_err(|e| AgentError::Hypervisor { op: "self-update", message: e.to_string() })?;
    Ok(axum::Json(ApiResponse::empty_ok()))
}
