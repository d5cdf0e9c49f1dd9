//! Host Probe: gathers the hardware facts reported to the control plane at startup —
//! memory, disk, CPU count, and any NVIDIA GPUs present via `lspci`.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr},
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use sysinfo::{Disks, Networks, System};
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::HostResources;

const NVIDIA_GPU_VENDOR_ID: &str = "10de";

/// Gathers the facts reported in `POST /init/host`.
pub async fn gather() -> anyhow::Result<HostResources> {
    info!("gathering host resources");
    let sys = System::new_all();
    let hostname = System::host_name().context("failed to read hostname")?;
    let memory_mb: u32 = (sys.total_memory() / (1024 * 1024)).try_into().context("implausible memory size")?;

    let disks = Disks::new_with_refreshed_list();
    let root_disk_bytes = disks.list().iter().find(|d| d.mount_point().as_os_str() == "/").map(|d| d.total_space()).unwrap_or(0);
    let disk_space_gb: u32 = (root_disk_bytes / (1024 * 1024 * 1024)).try_into().context("implausible disk size")?;

    let cpus = sys.cpus().len() as u32;

    let gpus = find_gpus().await?;
    let (gpu_model, gpu_pci_addrs) = match gpus {
        Some(gpus) => (Some(gpus.model), gpus.addresses.into_iter().map(|a| a.0).collect()),
        None => (None, Vec::new()),
    };

    Ok(HostResources { hostname, memory_mb, disk_space_gb, cpus, gpu_model, gpu_pci_addrs })
}

/// Returns this host's public-facing IPv4 address, used as `AgentMetadata::public_ip`.
pub fn find_public_ip() -> anyhow::Result<Ipv4Addr> {
    let networks = Networks::new_with_refreshed_list();
    for (_, network) in &networks {
        for network in network.ip_networks() {
            let IpAddr::V4(addr) = network.addr else {
                debug!("ignoring IPv6 address {}", network.addr);
                continue;
            };
            if addr.is_public() {
                info!(%addr, "found public IPv4 address");
                return Ok(addr);
            }
        }
    }
    bail!("no public IPv4 address available on this host");
}

async fn find_gpus() -> anyhow::Result<Option<Gpus>> {
    let output = Command::new("lspci").arg("-d").arg(format!("{NVIDIA_GPU_VENDOR_ID}:")).invoke().await?;
    parse_gpus(&output)
}

fn parse_gpus(lspci_output: &str) -> anyhow::Result<Option<Gpus>> {
    let lines: Vec<&str> = lspci_output.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.is_empty() {
        return Ok(None);
    }
    let mut addresses = Vec::new();
    let mut model = None;
    for line in lines {
        let Some(bdf) = line.split_whitespace().next() else {
            bail!("failed to parse BDF address from lspci line: {line}");
        };
        addresses.push(GpuAddress(bdf.to_string()));
        if model.is_none() {
            model = extract_model(line);
        }
    }
    addresses.sort();
    Ok(Some(Gpus { model: model.unwrap_or_else(|| "unknown".to_string()), addresses }))
}

fn extract_model(lspci_line: &str) -> Option<String> {
    let start = lspci_line.find('[')?;
    let end = lspci_line[start..].find(']')? + start;
    Some(lspci_line[start + 1..end].to_string())
}

trait IsPublic {
    fn is_public(&self) -> bool;
}

impl IsPublic for Ipv4Addr {
    fn is_public(&self) -> bool {
        let octets = self.octets();
        if octets[0] == 127 {
            return false;
        }
        if octets[0] == 10 {
            return false;
        }
        if octets[0] == 192 && octets[1] == 168 {
            return false;
        }
        if octets[0] == 169 && octets[1] == 254 {
            return false;
        }
        if octets[0] == 172 && (16..=31).contains(&octets[1]) {
            return false;
        }
        if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
            return false;
        }
        true
    }
}

#[async_trait]
trait CommandExt {
    async fn invoke(&mut self) -> anyhow::Result<String>;
}

#[async_trait]
impl CommandExt for Command {
    async fn invoke(&mut self) -> anyhow::Result<String> {
        let output = self.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("lspci command failed with status {}: {stderr}", output.status.code().unwrap_or_default());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct GpuAddress(String);

impl fmt::Display for GpuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Gpus {
    model: String,
    addresses: Vec<GpuAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_address_classification_matches_rfc1918() {
        assert!(!Ipv4Addr::new(10, 0, 0, 1).is_public());
        assert!(!Ipv4Addr::new(192, 168, 1, 1).is_public());
        assert!(!Ipv4Addr::new(172, 16, 0, 1).is_public());
        assert!(!Ipv4Addr::new(127, 0, 0, 1).is_public());
        assert!(Ipv4Addr::new(8, 8, 8, 8).is_public());
    }

    #[test]
    fn parses_model_and_addresses_from_lspci_output() {
        let input = [
            "01:00.0 3D controller: NVIDIA Corporation GH100 [H100 PCIe] (rev a1)",
            "01:00.1 3D controller: NVIDIA Corporation GH100 [H100 PCIe] (rev a1)",
        ]
        .join("\n");
        let gpus = parse_gpus(&input).unwrap().unwrap();
        assert_eq!(gpus.model, "H100 PCIe");
        assert_eq!(gpus.addresses.len(), 2);
    }

    #[test]
    fn empty_lspci_output_means_no_gpus() {
        assert!(parse_gpus("").unwrap().is_none());
    }
}
