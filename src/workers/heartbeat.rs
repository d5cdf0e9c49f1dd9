use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::clients::control_plane::ControlPlaneClient;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically pings the control plane so a dropped connection surfaces in logs well
/// before the next `/stats` publish would notice it.
pub struct HeartbeatWorker {
    client: Arc<dyn ControlPlaneClient>,
}

impl HeartbeatWorker {
    pub fn spawn(client: Arc<dyn ControlPlaneClient>) {
        tokio::spawn(async move {
            let worker = Self { client };
            worker.run().await
        });
    }

    async fn run(self) {
        loop {
            debug!("sending heartbeat ping");
            if let Err(e) = self.client.ping().await {
                warn!("control plane heartbeat failed: {e}");
            }
            sleep(HEARTBEAT_INTERVAL).await;
        }
    }
}
