//! HTTP route surface: one handler file per route, an `AuthLayer`-guarded router,
//! everything except `/ping` requiring `X-Agent-Secret`.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use crate::{auth::AuthLayer, instance_manager::InstanceManager};

pub(crate) mod instances;
pub(crate) mod ping;
pub(crate) mod self_update;
pub(crate) mod ssh;

#[derive(Clone)]
pub struct AppState {
    pub instance_manager: Arc<InstanceManager>,
    pub self_update_url: String,
}

pub fn build_router(state: AppState, agent_secret: String) -> Router {
    let protected = Router::new()
        .route(
            "/instances",
            get(instances::status::handler)
                .post(instances::create::handler)
                .put(instances::manage::handler)
                .delete(instances::delete::handler),
        )
        .route("/ssh", post(ssh::add::handler).delete(ssh::remove::handler))
        .route("/self-update", post(self_update::handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(AuthLayer::new(agent_secret)));

    Router::new().route("/ping", get(ping::handler)).merge(protected)
}
