use axum::extract::State;

use crate::{errors::{AgentError, AgentResult}, models::{ApiResponse, CreateInstanceResponse, InstanceSpec}, routes::AppState};

/// Creates the host's single instance, all-or-nothing.
///
/// This body is fully attacker-controlled (image, registry, command, env map all flow
/// into shell-quoted guest commands downstream), so the create call runs on its own
/// task: a panic anywhere in that call tree becomes a `JoinError` here instead of
/// taking down the whole HTTP server.
pub(crate) async fn handler(
    State(state): State<AppState>,
    axum::Json(spec): axum::Json<InstanceSpec>,
) -> AgentResult<axum::Json<ApiResponse<CreateInstanceResponse>>> {
    tracing::debug!(request = ?spec, "instance create request");
    let instance_manager = state.instance_manager.clone();
    let ports = match tokio::spawn(async move { instance_manager.create(spec).await }).await {
        Ok(create_result) => create_result?,
        Err(join_err) => {
            tracing::error!(error = %join_err, "panic while handling instance create request");
            return Err(AgentError::Panicked);
        }
    };
    Ok(axum::Json(ApiResponse::ok(CreateInstanceResponse { ports })))
}
