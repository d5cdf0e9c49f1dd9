use axum::extract::State;

use crate::{errors::AgentResult, models::{ApiResponse, InstanceCommand, ManageInstanceRequest}, routes::AppState};

/// Issues a lifecycle command to the running instance. `delete` tears it all the way
/// down, same as the dedicated delete route; the other commands go through the control
/// channel.
pub(crate) async fn handler(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<ManageInstanceRequest>,
) -> AgentResult<axum::Json<ApiResponse<()>>> {
    match request.command {
        InstanceCommand::Delete => state.instance_manager.stop().await?,
        command => state.instance_manager.manage(command).await?,
    }
    Ok(axum::Json(ApiResponse::empty_ok()))
}
