use axum::extract::State;

use crate::{errors::AgentResult, models::{ApiResponse, SshKeyRequest}, routes::AppState};

/// Removes an authorized SSH public key from the running guest.
pub(crate) async fn handler(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<SshKeyRequest>,
) -> AgentResult<axum::Json<ApiResponse<()>>> {
    state.instance_manager.remove_ssh_key(&request.ssh_pubkey).await?;
    Ok(axum::Json(ApiResponse::empty_ok()))
}
