use std::{sync::Arc, time::Duration};

use sysinfo::System;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::{clients::control_plane::ControlPlaneClient, stats::StatsFeeder};

const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// Samples the Stats Feeder every 500ms and publishes the result to the control plane.
pub struct StatsPublisher {
    agent_id: Uuid,
    feeder: Arc<StatsFeeder>,
    client: Arc<dyn ControlPlaneClient>,
}

impl StatsPublisher {
    pub fn spawn(agent_id: Uuid, feeder: Arc<StatsFeeder>, client: Arc<dyn ControlPlaneClient>) {
        tokio::spawn(async move {
            let worker = Self { agent_id, feeder, client };
            worker.run().await
        });
    }

    async fn run(self) {
        let mut system = System::new();
        loop {
            let sample = self.feeder.sample(&mut system).await;
            if let Err(e) = self.client.publish_stats(self.agent_id, &sample).await {
                warn!("failed to publish stats: {e}");
            }
            sleep(PUBLISH_INTERVAL).await;
        }
    }
}
