//! Stats Feeder: samples host CPU/RAM/net and, when an instance is running and a GPU
//! metrics provider is registered, GPU utilization, publishing both as metrics gauges
//! and periodic `POST /stats` payloads. The feeder only ever holds a read-only
//! capability object for the GPU side, never a reference back to the VM backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;

use crate::guest_channel::GpuMetrics;

/// Capability object the Instance Manager registers after `Create` so the Stats Feeder
/// never needs a direct reference back to the VM backend.
#[async_trait]
pub trait GpuMetricsProvider: Send + Sync {
    async fn gpu_metrics(&self) -> Option<GpuMetrics>;
}

#[derive(Clone, Serialize, Debug, Default)]
pub struct HostStats {
    pub cpu_pct: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

#[derive(Clone, Serialize, Debug)]
pub struct StatsSample {
    pub host: HostStats,
    pub gpu: Option<GpuMetrics>,
}

/// Samples host resource usage and, if a GPU provider is registered, GPU metrics.
pub struct StatsFeeder {
    gpu_provider: std::sync::Mutex<Option<Arc<dyn GpuMetricsProvider>>>,
    failure_count: std::sync::atomic::AtomicU64,
}

const FAILURE_LOG_EVERY: u64 = 40;

impl Default for StatsFeeder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsFeeder {
    pub fn new() -> Self {
        Self { gpu_provider: std::sync::Mutex::new(None), failure_count: std::sync::atomic::AtomicU64::new(0) }
    }

    pub fn register_gpu_provider(&self, provider: Arc<dyn GpuMetricsProvider>) {
        *self.gpu_provider.lock().expect("stats feeder mutex poisoned") = Some(provider);
    }

    pub fn clear_gpu_provider(&self) {
        *self.gpu_provider.lock().expect("stats feeder mutex poisoned") = None;
    }

    fn sample_host(system: &mut System) -> HostStats {
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu_pct = system.global_cpu_usage();
        let networks = sysinfo::Networks::new_with_refreshed_list();
        let (rx, tx) = networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });
        HostStats {
            cpu_pct,
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            net_rx_bytes: rx,
            net_tx_bytes: tx,
        }
    }

    /// Takes a single sample; failures in the GPU leg are logged with rate limiting
    /// (every 40th failure) rather than propagated, since a stats worker shouldn't die
    /// over a transient GPU read.
    pub async fn sample(&self, system: &mut System) -> StatsSample {
        let host = Self::sample_host(system);
        let provider = self.gpu_provider.lock().expect("stats feeder mutex poisoned").clone();
        let gpu = match provider {
            Some(provider) => provider.gpu_metrics().await,
            None => None,
        };
        if gpu.is_none() && provider_is_some(&self.gpu_provider) {
            let count = self.failure_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            if count % FAILURE_LOG_EVERY == 0 {
                tracing::warn!(count, "repeated GPU metrics sampling failures");
            }
        }
        StatsSample { host, gpu }
    }
}

fn provider_is_some(provider: &std::sync::Mutex<Option<Arc<dyn GpuMetricsProvider>>>) -> bool {
    provider.lock().expect("stats feeder mutex poisoned").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysNoneProvider;

    #[async_trait]
    impl GpuMetricsProvider for AlwaysNoneProvider {
        async fn gpu_metrics(&self) -> Option<GpuMetrics> {
            None
        }
    }

    #[tokio::test]
    async fn sample_without_gpu_provider_returns_none_gpu() {
        let feeder = StatsFeeder::new();
        let mut system = System::new();
        let sample = feeder.sample(&mut system).await;
        assert!(sample.gpu.is_none());
    }

    #[tokio::test]
    async fn clearing_provider_reverts_to_no_gpu_data() {
        let feeder = StatsFeeder::new();
        feeder.register_gpu_provider(Arc::new(AlwaysNoneProvider));
        feeder.clear_gpu_provider();
        let mut system = System::new();
        let sample = feeder.sample(&mut system).await;
        assert!(sample.gpu.is_none());
    }
}
