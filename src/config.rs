use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Environment inputs recognized by the agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "nilcc-agent-node")]
pub struct CliArgs {
    /// nilcc API key; must start with `ak-`.
    #[arg(long, env = "API_KEY")]
    pub api_key: String,

    /// Control plane base URL.
    #[arg(long, env = "SERVICE_URL")]
    pub service_url: String,

    /// Enables debug-level logging.
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Directory for agent identity and instance state files.
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/nilcc-agent")]
    pub data_dir: PathBuf,

    /// Directory for log files.
    #[arg(long, env = "LOG_DIR", default_value = "/var/log/nilcc-agent")]
    pub log_dir: PathBuf,

    /// Path to the frpc-equivalent tunnel binary.
    #[arg(long, env = "FRPC_BINARY", default_value = "/usr/local/bin/frpc")]
    pub frpc_binary: PathBuf,

    /// Path the tunnel config file is rewritten to.
    #[arg(long, env = "FRPC_CONFIG", default_value = "/etc/nilcc-agent/frpc.toml")]
    pub frpc_config: PathBuf,

    /// Path to the qemu-system binary.
    #[arg(long, env = "QEMU_BINARY", default_value = "/usr/bin/qemu-system-x86_64")]
    pub qemu_binary: PathBuf,

    /// Path to the qemu-img binary.
    #[arg(long, env = "QEMU_IMG_BINARY", default_value = "/usr/bin/qemu-img")]
    pub qemu_img_binary: PathBuf,

    /// Path to the UEFI firmware, if any.
    #[arg(long, env = "OVMF_PATH")]
    pub ovmf_path: Option<PathBuf>,

    /// Base image new instances overlay onto, if any.
    #[arg(long, env = "BASE_IMAGE")]
    pub base_image: Option<PathBuf>,

    /// Directory qcow2 disk images live in.
    #[arg(long, env = "IMAGE_DIR", default_value = "/var/lib/nilcc-agent/images")]
    pub image_dir: PathBuf,

    /// Directory QMP sockets and VM logs live in.
    #[arg(long, env = "VM_RUN_DIR", default_value = "/run/nilcc-agent")]
    pub vm_run_dir: PathBuf,

    /// Default GPU PCI address to bind if a create request doesn't override one.
    #[arg(long, env = "GPU_PCI_ADDR")]
    pub gpu_pci_addr: Option<String>,

    /// Path to the management (agent bearer secret) key file.
    #[arg(long, env = "MANAGEMENT_KEY")]
    pub management_key: Option<PathBuf>,

    /// Comma/range list of app-range ports, e.g. `15001-15300`.
    #[arg(long, env = "PORTS", default_value = "15001-15300")]
    pub ports: String,

    /// Address the agent's own HTTP API binds to.
    #[arg(long, env = "API_BIND", default_value = "127.0.0.1:9100")]
    pub api_bind: SocketAddr,

    /// Address the prometheus metrics exporter binds to.
    #[arg(long, env = "METRICS_BIND", default_value = "127.0.0.1:9101")]
    pub metrics_bind: SocketAddr,

    /// frp concentrator address.
    #[arg(long, env = "FRP_SERVER_ADDR", default_value = "")]
    pub frp_server_addr: String,

    /// frp concentrator port.
    #[arg(long, env = "FRP_SERVER_PORT", default_value_t = 7000)]
    pub frp_server_port: u16,
}

/// Fully resolved runtime configuration, derived from `CliArgs`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: String,
    pub service_url: String,
    pub debug: bool,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub frpc_binary: PathBuf,
    pub frpc_config: PathBuf,
    pub qemu_binary: PathBuf,
    pub qemu_img_binary: PathBuf,
    pub ovmf_path: Option<PathBuf>,
    pub base_image: Option<PathBuf>,
    pub image_dir: PathBuf,
    pub vm_run_dir: PathBuf,
    pub gpu_pci_addr: Option<String>,
    pub management_key: Option<PathBuf>,
    pub ports: String,
    pub api_bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub frp_server_addr: String,
    pub frp_server_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_KEY must start with 'ak-'")]
    InvalidApiKeyPrefix,
}

impl AgentConfig {
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        if !args.api_key.starts_with("ak-") {
            return Err(ConfigError::InvalidApiKeyPrefix);
        }
        Ok(Self {
            api_key: args.api_key,
            service_url: args.service_url,
            debug: args.debug,
            data_dir: args.data_dir,
            log_dir: args.log_dir,
            frpc_binary: args.frpc_binary,
            frpc_config: args.frpc_config,
            qemu_binary: args.qemu_binary,
            qemu_img_binary: args.qemu_img_binary,
            ovmf_path: args.ovmf_path,
            base_image: args.base_image,
            image_dir: args.image_dir,
            vm_run_dir: args.vm_run_dir,
            gpu_pci_addr: args.gpu_pci_addr,
            management_key: args.management_key,
            ports: args.ports,
            api_bind: args.api_bind,
            metrics_bind: args.metrics_bind,
            frp_server_addr: args.frp_server_addr,
            frp_server_port: args.frp_server_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs {
            api_key: "ak-test".into(),
            service_url: "https://example.com".into(),
            debug: false,
            data_dir: "/tmp/data".into(),
            log_dir: "/tmp/log".into(),
            frpc_binary: "/usr/bin/frpc".into(),
            frpc_config: "/tmp/frpc.toml".into(),
            qemu_binary: "/usr/bin/qemu-system-x86_64".into(),
            qemu_img_binary: "/usr/bin/qemu-img".into(),
            ovmf_path: None,
            base_image: None,
            image_dir: "/tmp/images".into(),
            vm_run_dir: "/tmp/run".into(),
            gpu_pci_addr: None,
            management_key: None,
            ports: "15001-15300".into(),
            api_bind: "127.0.0.1:9100".parse().unwrap(),
            metrics_bind: "127.0.0.1:9101".parse().unwrap(),
            frp_server_addr: "tunnel.example.com".into(),
            frp_server_port: 7000,
        }
    }

    #[test]
    fn rejects_api_key_without_prefix() {
        let mut args = base_args();
        args.api_key = "plain".into();
        assert!(matches!(AgentConfig::from_args(args), Err(ConfigError::InvalidApiKeyPrefix)));
    }

    #[test]
    fn accepts_well_formed_args() {
        assert!(AgentConfig::from_args(base_args()).is_ok());
    }
}
