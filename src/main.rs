use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use nilcc_agent_node::{
    clients::control_plane::{ControlPlaneClient, HttpControlPlaneClient},
    config::{AgentConfig, CliArgs},
    fingerprint,
    host_probe,
    image_store::DefaultImageStore,
    instance_manager::{InstanceManager, InstanceManagerConfig},
    ports::{self, PortAllocator},
    routes::{build_router, AppState},
    state_store::{FileStateStore, StateStore},
    stats::StatsFeeder,
    tunnel::TunnelProcess,
    workers::{heartbeat::HeartbeatWorker, stats_publisher::StatsPublisher},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = AgentConfig::from_args(args)?;
    init_tracing(config.debug);
    init_metrics(&config)?;

    tracing::info!(version = nilcc_agent_node::build_info::get_agent_version(), "starting nilcc agent node");

    let public_ip = host_probe::find_public_ip().map(|ip| ip.to_string()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not determine public IP");
        "0.0.0.0".to_string()
    });
    let (fingerprint_value, fingerprint_quality) = {
        let machine_id = fingerprint::read_machine_id();
        fingerprint::compute(machine_id.as_deref(), None, &whoami_hostname())
    };

    let state_store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(config.data_dir.clone(), config.management_key.clone()));
    let metadata = state_store.load_or_init_metadata(public_ip.clone(), fingerprint_value.clone(), fingerprint_quality).await?;

    let control_plane: Arc<dyn ControlPlaneClient> =
        Arc::new(HttpControlPlaneClient::new(config.service_url.clone(), config.api_key.clone()));

    let init_response = control_plane.init(metadata.agent_id, &fingerprint_value).await?;
    control_plane.use_agent_secret(init_response.secret_key.clone());

    let host_resources = host_probe::gather().await?;
    if let Err(e) = control_plane.init_host(metadata.agent_id, &host_resources).await {
        tracing::warn!(error = %e, "failed to report host resources at startup");
    }

    let app_ports = ports::parse_port_list(&config.ports).unwrap_or_else(|e| {
        tracing::warn!(error = %e, ports = %config.ports, "invalid PORTS config, falling back to default range");
        ports::parse_port_list("15001-15300").expect("default port range is valid")
    });
    let ports = Arc::new(PortAllocator::new(app_ports));
    let image_store = Arc::new(DefaultImageStore::new(config.qemu_img_binary.clone(), config.image_dir.clone()));
    let tunnel = Arc::new(TunnelProcess::new(
        config.frpc_binary.clone(),
        config.frpc_config.clone(),
        config.frp_server_addr.clone(),
        config.frp_server_port,
        init_response.secret_key.clone(),
    ));
    tunnel.start(config.api_bind.port()).await?;

    let manager_config = InstanceManagerConfig {
        qemu_binary: config.qemu_binary.clone(),
        ovmf_path: config.ovmf_path.clone(),
        base_image: config.base_image.clone(),
        image_dir: config.image_dir.clone(),
        vm_run_dir: config.vm_run_dir.clone(),
        default_gpu_pci_addr: config.gpu_pci_addr.clone(),
        tunnel_subdomain: init_response.secret_domain.clone(),
    };
    let instance_manager =
        Arc::new(InstanceManager::new(manager_config, ports, image_store, state_store.clone(), tunnel.clone()));
    instance_manager.restore_from_disk().await?;

    let stats_feeder = Arc::new(StatsFeeder::new());
    stats_feeder.register_gpu_provider(instance_manager.clone());

    HeartbeatWorker::spawn(control_plane.clone());
    StatsPublisher::spawn(metadata.agent_id, stats_feeder, control_plane.clone());

    let app_state = AppState {
        instance_manager,
        self_update_url: format!("{}/artifacts/nilcc-agent-node/x86-64/nilcc-agent-node", config.service_url),
    };
    let router = build_router(app_state, init_response.secret_key.clone());

    let listener = tokio::net::TcpListener::bind(config.api_bind).await?;
    tracing::info!(addr = %config.api_bind, "agent HTTP API listening");
    axum::serve(listener, router).await?;

    Ok(())
}

fn whoami_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn init_metrics(config: &AgentConfig) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(config.metrics_bind).install()?;
    Ok(())
}
