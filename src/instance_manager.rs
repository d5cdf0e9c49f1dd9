//! Instance Manager: the central lifecycle state machine. Serializes every operation
//! that touches host-scoped shared resources and drives the create/manage/stop/restore
//! algorithms.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::timeout};
use uuid::Uuid;

use crate::{
    control_channel::{ControlChannel, QmpClient},
    errors::AgentError,
    guest_channel::{DockerRunOptions, GuestChannel, SshGuestChannel},
    image_store::ImageStore,
    models::{InstanceCommand, InstancePorts, InstanceSpec, InstanceState, InstanceStatus, PortProto, ProxyEntry},
    ports::PortAllocator,
    stats::GpuMetricsProvider,
    tunnel::TunnelProcess,
    vfio::VfioBinder,
};

const DEFAULT_CPUS: u32 = 4;
const DEFAULT_MEMORY_MIB: u32 = 8192;
const DEFAULT_DISK_GIB: u32 = 50;
const QMP_SOCKET_POLL_DEADLINE: Duration = Duration::from_secs(30);
const QMP_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

pub struct InstanceManagerConfig {
    pub qemu_binary: PathBuf,
    pub ovmf_path: Option<PathBuf>,
    pub base_image: Option<PathBuf>,
    pub image_dir: PathBuf,
    pub vm_run_dir: PathBuf,
    pub default_gpu_pci_addr: Option<String>,
    pub tunnel_subdomain: String,
}

struct Live {
    control_channel: Arc<QmpClient>,
    guest_channel: Option<Arc<SshGuestChannel>>,
    container_id: Arc<std::sync::Mutex<Option<String>>>,
    disk_path: PathBuf,
    socket_path: PathBuf,
    ports: InstancePorts,
    gpu_pci_addr: String,
    allocated_ports: Vec<u16>,
    child: tokio::process::Child,
}

struct ManagerState {
    live: Option<Live>,
    creating: bool,
}

/// Owns the single instance this agent may host. All public operations take the
/// manager's own async mutex for their full duration.
pub struct InstanceManager {
    config: InstanceManagerConfig,
    state: Mutex<ManagerState>,
    vfio: Mutex<VfioBinder>,
    ports: Arc<PortAllocator>,
    image_store: Arc<dyn ImageStore>,
    state_store: Arc<dyn crate::state_store::StateStore>,
    tunnel: Arc<TunnelProcess>,
}

impl InstanceManager {
    pub fn new(
        config: InstanceManagerConfig,
        ports: Arc<PortAllocator>,
        image_store: Arc<dyn ImageStore>,
        state_store: Arc<dyn crate::state_store::StateStore>,
        tunnel: Arc<TunnelProcess>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState { live: None, creating: false }),
            vfio: Mutex::new(VfioBinder::new()),
            ports,
            image_store,
            state_store,
            tunnel,
        }
    }

    pub async fn status(&self) -> InstanceStatus {
        let state = self.state.lock().await;
        let Some(live) = &state.live else { return InstanceStatus::Destroyed };
        match live.control_channel.query_status().await {
            Ok(qs) => InstanceStatus::from_qmp_status(&qs.status),
            Err(_) => InstanceStatus::Error,
        }
    }

    pub async fn instance_ports(&self) -> Option<InstancePorts> {
        self.state.lock().await.live.as_ref().map(|l| l.ports.clone())
    }

    fn compose_qemu_args(
        &self,
        spec: &InstanceSpec,
        disk_path: &std::path::Path,
        socket_path: &std::path::Path,
        gpu_pci_addr: &str,
        hostfwds: &[(PortProto, u16, u16)],
    ) -> Vec<String> {
        let memory = spec.memory.clone().unwrap_or_else(|| format!("{DEFAULT_MEMORY_MIB}M"));
        let cpus = spec.cpu.clone().unwrap_or_else(|| DEFAULT_CPUS.to_string());
        let mut args = vec![
            "-machine".into(),
            "q35,accel=kvm".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            cpus,
            "-m".into(),
            memory,
            "-drive".into(),
            format!("file={},if=virtio,format=qcow2", disk_path.display()),
            "-device".into(),
            format!("vfio-pci,host={gpu_pci_addr}"),
            "-qmp".into(),
            format!("unix:{},server,nowait", socket_path.display()),
            "-nographic".into(),
        ];
        let hostfwd_str = hostfwds
            .iter()
            .map(|(proto, host, guest)| format!("{}:127.0.0.1:{host}-:{guest}", proto_prefix(*proto)))
            .collect::<Vec<_>>()
            .join(",");
        args.push("-netdev".into());
        args.push(format!("user,id=vmnic,hostfwd={hostfwd_str}"));
        args.push("-device".into());
        args.push("virtio-net-pci,netdev=vmnic".into());
        if let Some(ovmf) = &self.config.ovmf_path {
            args.push("-bios".into());
            args.push(ovmf.display().to_string());
        }
        args
    }

    /// Create algorithm, all-or-nothing: any failure after partial work rolls back
    /// everything allocated so far.
    pub async fn create(&self, spec: InstanceSpec) -> Result<InstancePorts, AgentError> {
        {
            let mut state = self.state.lock().await;
            if state.live.is_some() || state.creating {
                return Err(AgentError::AlreadyRunning);
            }
            state.creating = true;
        }

        let result = self.create_inner(spec).await;

        let mut state = self.state.lock().await;
        state.creating = false;
        match result {
            Ok((live, ports)) => {
                state.live = Some(live);
                Ok(ports)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_inner(&self, spec: InstanceSpec) -> Result<(Live, InstancePorts), AgentError> {
        let vm_id = Uuid::new_v4();

        let gpu_pci_addr = spec
            .gpu_pci_addr
            .clone()
            .or_else(|| self.config.default_gpu_pci_addr.clone())
            .ok_or_else(|| AgentError::Hypervisor { op: "configure", message: "no GPU PCI address configured".into() })?;

        self.vfio
            .lock()
            .await
            .bind(&gpu_pci_addr)
            .await
            .map_err(|e| AgentError::Vfio { op: "bind", addr: gpu_pci_addr.clone(), source: e })?;

        let guest_port_count = spec.ports.len() + usize::from(spec.ssh_enabled);
        let allocated_app_ports = match self.ports.allocate_app_ports(spec.ports.len()) {
            Ok(ports) => ports,
            Err(e) => {
                self.unbind_vfio().await;
                return Err(AgentError::PortAllocation(e.to_string()));
            }
        };
        let ssh_host_port = if spec.ssh_enabled {
            match self.ports.allocate_ssh_port() {
                Ok(p) => Some(p),
                Err(e) => {
                    self.ports.release(&allocated_app_ports);
                    self.unbind_vfio().await;
                    return Err(AgentError::PortAllocation(e.to_string()));
                }
            }
        } else {
            None
        };
        let mut all_allocated = allocated_app_ports.clone();
        if let Some(p) = ssh_host_port {
            all_allocated.push(p);
        }
        debug_assert_eq!(all_allocated.len(), guest_port_count);

        let disk_path = match &self.config.base_image {
            Some(base) => self.image_store.create_overlay(&vm_id.to_string(), base).await,
            None => self.image_store.create_disk(&vm_id.to_string(), spec.storage_gb.unwrap_or(DEFAULT_DISK_GIB)).await,
        };
        let disk_path = match disk_path {
            Ok(p) => p,
            Err(e) => {
                self.ports.release(&all_allocated);
                self.unbind_vfio().await;
                return Err(AgentError::Hypervisor { op: "disk", message: e.to_string() });
            }
        };

        let socket_path = self.config.vm_run_dir.join(format!("{vm_id}.qmp"));
        let log_path = self.config.vm_run_dir.join(format!("{vm_id}.log"));
        if let Err(e) = tokio::fs::create_dir_all(&self.config.vm_run_dir).await {
            self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
            return Err(AgentError::Hypervisor { op: "spawn", message: e.to_string() });
        }

        let mut hostfwds = Vec::new();
        for (mapping, host_port) in spec.ports.iter().zip(allocated_app_ports.iter()) {
            hostfwds.push((mapping.proto, *host_port, mapping.guest_port));
        }
        if let Some(ssh_port) = ssh_host_port {
            hostfwds.push((PortProto::Tcp, ssh_port, 22));
        }

        let args = self.compose_qemu_args(&spec, &disk_path, &socket_path, &gpu_pci_addr, &hostfwds);
        let log_file = match std::fs::File::create(&log_path) {
            Ok(f) => f,
            Err(e) => {
                self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
                return Err(AgentError::Hypervisor { op: "spawn", message: e.to_string() });
            }
        };
        let stderr_file = match log_file.try_clone() {
            Ok(f) => f,
            Err(e) => {
                self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
                return Err(AgentError::Hypervisor { op: "spawn", message: e.to_string() });
            }
        };
        let mut child = match tokio::process::Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
                return Err(AgentError::Hypervisor { op: "spawn", message: e.to_string() });
            }
        };

        let deadline = tokio::time::Instant::now() + QMP_SOCKET_POLL_DEADLINE;
        loop {
            if socket_path.exists() {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
                return Err(AgentError::Hypervisor {
                    op: "spawn",
                    message: format!("qemu exited before QMP socket appeared: {status:?}"),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(%vm_id, "QMP socket did not appear within 30s; VM may still be booting");
                break;
            }
            tokio::time::sleep(QMP_SOCKET_POLL_INTERVAL).await;
        }

        let control_channel = match QmpClient::connect(socket_path.clone()).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let _ = child.start_kill();
                self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
                return Err(AgentError::Hypervisor { op: "control-channel", message: e.to_string() });
            }
        };

        let container_id = Arc::new(std::sync::Mutex::new(None));
        let guest_channel = ssh_host_port.map(|p| Arc::new(SshGuestChannel::new(p)));
        if let Some(ref gc) = guest_channel {
            let gc = Arc::clone(gc);
            let spec_clone = spec.clone();
            let container_id = Arc::clone(&container_id);
            tokio::spawn(async move {
                if gc.wait_for_boot().await.is_err() {
                    tracing::warn!("guest did not boot in time; skipping in-guest setup");
                    return;
                }
                if let (Some(registry), Some(user), Some(password)) =
                    (spec_clone.registry.as_ref(), spec_clone.login.as_ref(), spec_clone.password.as_ref())
                {
                    if let Err(e) = gc.docker_login(registry, user, password).await {
                        tracing::warn!(error = %e, "docker login failed");
                        return;
                    }
                }
                if let Err(e) = gc.docker_pull(&spec_clone.image, &spec_clone.image_tag).await {
                    tracing::warn!(error = %e, "docker pull failed");
                    return;
                }
                let opts = DockerRunOptions {
                    image: spec_clone.image.clone(),
                    tag: spec_clone.image_tag.clone(),
                    gpu_enabled: true,
                    cpu: spec_clone.cpu.clone(),
                    memory: spec_clone.memory.clone(),
                    env: spec_clone.env_variables.clone(),
                    ports: spec_clone.ports.iter().map(|p| p.guest_port).collect(),
                    command: spec_clone.command.clone(),
                };
                match gc.docker_run(opts).await {
                    Ok(id) => {
                        *container_id.lock().expect("container id mutex poisoned") = Some(id.clone());
                        tracing::info!(container_id = %id, "guest container started");
                    }
                    Err(e) => tracing::warn!(error = %e, "docker run failed"),
                }
            });
        }

        let mut ports: InstancePorts = BTreeMap::new();
        let mut proxies = Vec::new();
        for (mapping, host_port) in spec.ports.iter().zip(allocated_app_ports.iter()) {
            ports.insert(mapping.guest_port.to_string(), host_port.to_string());
            let entry = match mapping.proto {
                PortProto::Tcp => ProxyEntry {
                    name: mapping.name.clone().unwrap_or_else(|| format!("vm-{}", mapping.guest_port)),
                    proto: PortProto::Tcp,
                    local_port: *host_port,
                    remote_port: mapping.remote_port,
                    custom_domain: None,
                },
                PortProto::Http => ProxyEntry {
                    name: mapping.name.clone().unwrap_or_else(|| format!("vm-{}", mapping.guest_port)),
                    proto: PortProto::Http,
                    local_port: *host_port,
                    remote_port: None,
                    custom_domain: Some(match mapping.remote_port {
                        Some(rp) => format!("{}:{}", self.config.tunnel_subdomain, rp),
                        None => self.config.tunnel_subdomain.clone(),
                    }),
                },
            };
            proxies.push(entry);
        }
        if let Some(ssh_port) = ssh_host_port {
            ports.insert("22".to_string(), ssh_port.to_string());
            proxies.push(ProxyEntry {
                name: "vm-ssh".into(),
                proto: PortProto::Tcp,
                local_port: ssh_port,
                remote_port: Some(11000),
                custom_domain: None,
            });
        }

        if let Err(e) = self.tunnel.update_instance_proxies(proxies.clone()).await {
            let _ = child.start_kill();
            self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
            return Err(AgentError::Tunnel { op: "update", message: e.to_string() });
        }

        let state = InstanceState {
            vm_id,
            image: spec.image.clone(),
            image_tag: spec.image_tag.clone(),
            ports: ports.clone(),
            proxies,
            ssh_enabled: spec.ssh_enabled,
            gpu_pci_addr: gpu_pci_addr.clone(),
        };
        if let Err(e) = self.state_store.save_instance_state(&state).await {
            let _ = child.start_kill();
            let _ = self.tunnel.clear_instance_proxies().await;
            self.cleanup_disk_ports_vfio(&disk_path, &all_allocated).await;
            return Err(AgentError::Persistence(e.to_string()));
        }

        Ok((
            Live {
                control_channel,
                guest_channel,
                container_id,
                disk_path,
                socket_path,
                ports: ports.clone(),
                gpu_pci_addr,
                allocated_ports: all_allocated,
                child,
            },
            ports,
        ))
    }

    async fn unbind_vfio(&self) {
        self.vfio.lock().await.unbind().await;
    }

    async fn cleanup_disk_ports_vfio(&self, disk_path: &std::path::Path, ports: &[u16]) {
        let _ = self.image_store.remove_disk(disk_path).await;
        self.ports.release(ports);
        self.unbind_vfio().await;
    }

    /// Issues a start/stop/restart command over the live control channel.
    pub async fn manage(&self, command: InstanceCommand) -> Result<(), AgentError> {
        let state = self.state.lock().await;
        let Some(live) = &state.live else { return Err(AgentError::NoInstance) };
        let result = match command {
            InstanceCommand::Start => live.control_channel.cont().await,
            InstanceCommand::Stop => live.control_channel.stop().await,
            InstanceCommand::Restart => live.control_channel.system_reset().await,
            InstanceCommand::Delete => return Err(AgentError::UnknownCommand("delete via manage".into())),
        };
        result.map_err(|e| AgentError::Hypervisor { op: "manage", message: e.to_string() })
    }

    /// Appends a public key to the guest's `authorized_keys`.
    pub async fn add_ssh_key(&self, pubkey: &str) -> Result<(), AgentError> {
        let state = self.state.lock().await;
        let Some(live) = &state.live else { return Err(AgentError::NoInstance) };
        let Some(gc) = &live.guest_channel else {
            return Err(AgentError::BadRequest("instance was not created with SSH enabled".into()));
        };
        let pubkey = pubkey.trim();
        let cmd = format!(
            "mkdir -p ~/.ssh && chmod 700 ~/.ssh && grep -qxF {key} ~/.ssh/authorized_keys 2>/dev/null || echo {key} >> ~/.ssh/authorized_keys && chmod 600 ~/.ssh/authorized_keys",
            key = crate::guest_channel::shell_quote(pubkey)
        );
        gc.run(&cmd).await.map_err(|e| AgentError::Hypervisor { op: "ssh-add", message: e.to_string() })?;
        Ok(())
    }

    /// Removes a public key from the guest's `authorized_keys`.
    pub async fn remove_ssh_key(&self, pubkey: &str) -> Result<(), AgentError> {
        let state = self.state.lock().await;
        let Some(live) = &state.live else { return Err(AgentError::NoInstance) };
        let Some(gc) = &live.guest_channel else {
            return Err(AgentError::BadRequest("instance was not created with SSH enabled".into()));
        };
        let pubkey = pubkey.trim();
        let cmd = format!(
            "grep -vxF {key} ~/.ssh/authorized_keys > ~/.ssh/authorized_keys.tmp 2>/dev/null; mv ~/.ssh/authorized_keys.tmp ~/.ssh/authorized_keys",
            key = crate::guest_channel::shell_quote(pubkey)
        );
        gc.run(&cmd).await.map_err(|e| AgentError::Hypervisor { op: "ssh-remove", message: e.to_string() })?;
        Ok(())
    }

    /// Stop algorithm: tears the instance down and releases every resource it held.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        let Some(mut live) = state.live.take() else { return Err(AgentError::NoInstance) };
        drop(state);

        let container_id = live.container_id.lock().expect("container id mutex poisoned").clone();
        if let (Some(gc), Some(id)) = (&live.guest_channel, &container_id) {
            gc.docker_stop(id).await;
        }

        let _ = live.control_channel.system_powerdown().await;
        let wait = timeout(GRACEFUL_SHUTDOWN_WAIT, live.child.wait()).await;
        if wait.is_err() {
            let _ = live.child.start_kill();
        }

        self.unbind_vfio().await;
        let _ = self.image_store.remove_disk(&live.disk_path).await;
        let _ = tokio::fs::remove_file(&live.socket_path).await;

        let _ = self.tunnel.clear_instance_proxies().await;
        let _ = self.state_store.clear_instance_state().await;
        self.ports.release(&live.allocated_ports);

        Ok(())
    }

    /// Restore-from-disk algorithm, run once at agent startup.
    pub async fn restore_from_disk(&self) -> Result<(), AgentError> {
        let Some(saved) = self.state_store.load_instance_state().await.map_err(|e| AgentError::Persistence(e.to_string()))? else {
            return Ok(());
        };

        let socket_path = self.config.vm_run_dir.join(format!("{}.qmp", saved.vm_id));
        let disk_path = self.config.image_dir.join(format!("{}.qcow2", saved.vm_id));

        self.vfio.lock().await.restore_binding(&saved.gpu_pci_addr).await;

        let control_channel = QmpClient::connect(socket_path.clone()).await.ok();

        let Some(control_channel) = control_channel else {
            tracing::warn!(vm_id = %saved.vm_id, "failed to reconnect control channel on restore, clearing state");
            self.vfio.lock().await.unbind().await;
            self.state_store.clear_instance_state().await.map_err(|e| AgentError::Persistence(e.to_string()))?;
            let host_ports: Vec<u16> = saved.ports.values().filter_map(|p| p.parse().ok()).collect();
            self.ports.release(&host_ports);
            return Ok(());
        };
        let control_channel = Arc::new(control_channel);

        let status = match control_channel.query_status().await {
            Ok(qs) => InstanceStatus::from_qmp_status(&qs.status),
            Err(_) => InstanceStatus::Error,
        };
        if matches!(status, InstanceStatus::Destroyed | InstanceStatus::Error) {
            self.vfio.lock().await.unbind().await;
            self.state_store.clear_instance_state().await.map_err(|e| AgentError::Persistence(e.to_string()))?;
            let host_ports: Vec<u16> = saved.ports.values().filter_map(|p| p.parse().ok()).collect();
            self.ports.release(&host_ports);
            return Ok(());
        }

        let guest_channel = saved
            .ports
            .get("22")
            .and_then(|p| p.parse::<u16>().ok())
            .map(|port| Arc::new(SshGuestChannel::new(port)));

        if let Err(e) = self.tunnel.update_instance_proxies(saved.proxies.clone()).await {
            tracing::warn!(error = %e, "failed to re-apply tunnel proxies on restore");
        }

        let allocated_ports: Vec<u16> = saved.ports.values().filter_map(|p| p.parse().ok()).collect();
        let mut state = self.state.lock().await;
        state.live = Some(Live {
            control_channel,
            guest_channel,
            container_id: Arc::new(std::sync::Mutex::new(None)),
            disk_path,
            socket_path,
            ports: saved.ports,
            gpu_pci_addr: saved.gpu_pci_addr,
            allocated_ports,
            // This agent didn't spawn this process itself, so there's no real child
            // handle to reattach to; shutdown still goes through the control channel.
            child: spawn_noop_child(),
        });
        Ok(())
    }
}

fn proto_prefix(proto: PortProto) -> &'static str {
    match proto {
        PortProto::Tcp => "tcp",
        PortProto::Http => "tcp",
    }
}

fn spawn_noop_child() -> tokio::process::Child {
    tokio::process::Command::new("true")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn placeholder child")
}

#[async_trait]
impl GpuMetricsProvider for InstanceManager {
    async fn gpu_metrics(&self) -> Option<crate::guest_channel::GpuMetrics> {
        let state = self.state.lock().await;
        let live = state.live.as_ref()?;
        let gc = live.guest_channel.as_ref()?;
        gc.get_gpu_metrics().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_prefix_maps_http_to_tcp_hostfwd() {
        assert_eq!(proto_prefix(PortProto::Http), "tcp");
        assert_eq!(proto_prefix(PortProto::Tcp), "tcp");
    }
}
