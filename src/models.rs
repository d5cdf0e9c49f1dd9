use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Protocol of a single forwarded port.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortProto {
    Tcp,
    Http,
}

/// One guest port the caller wants forwarded.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub guest_port: u16,
    pub remote_port: Option<u16>,
    pub proto: PortProto,
    pub name: Option<String>,
}

/// Request contract for creating an instance.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub image: String,
    pub image_tag: String,
    pub registry: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    pub command: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
    pub storage_gb: Option<u32>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub gpu_pci_addr: Option<String>,
    pub tunnel_token: String,
}

impl fmt::Debug for InstanceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted_env: BTreeMap<_, _> = self.env_variables.keys().map(|k| (k, "...")).collect();
        f.debug_struct("InstanceSpec")
            .field("image", &self.image)
            .field("image_tag", &self.image_tag)
            .field("registry", &self.registry)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "..."))
            .field("ports", &self.ports.len())
            .field("env_variables", &redacted_env)
            .field("command", &self.command)
            .field("ssh_enabled", &self.ssh_enabled)
            .field("storage_gb", &self.storage_gb)
            .field("cpu", &self.cpu)
            .field("memory", &self.memory)
            .field("gpu_pci_addr", &self.gpu_pci_addr)
            .finish()
    }
}

impl fmt::Debug for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortMapping")
            .field("guest_port", &self.guest_port)
            .field("remote_port", &self.remote_port)
            .field("proto", &self.proto)
            .field("name", &self.name)
            .finish()
    }
}

/// Lifecycle status of the managed instance.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    #[default]
    Destroyed,
    Pending,
    Running,
    Paused,
    Rebooting,
    Error,
}

impl InstanceStatus {
    /// Maps a Control-Channel `query-status` result onto our lifecycle status.
    pub fn from_qmp_status(status: &str) -> Self {
        match status {
            "running" => InstanceStatus::Running,
            "paused" => InstanceStatus::Paused,
            "prelaunch" | "inmigrate" => InstanceStatus::Pending,
            "shutdown" | "postmigrate" => InstanceStatus::Destroyed,
            _ => InstanceStatus::Error,
        }
    }
}

/// Commands accepted by `PUT /instances`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceCommand {
    Start,
    Stop,
    Restart,
    Delete,
}

/// Mapping from guest-port string to the allocated host-port string.
pub type InstancePorts = BTreeMap<String, String>;

/// One line of the tunnel configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub proto: PortProto,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub custom_domain: Option<String>,
}

/// Durable record of the single instance this agent may host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub vm_id: Uuid,
    pub image: String,
    pub image_tag: String,
    pub ports: InstancePorts,
    pub proxies: Vec<ProxyEntry>,
    pub ssh_enabled: bool,
    pub gpu_pci_addr: String,
}

/// Resolved `InitAgentResponse` tunnel wire shape (flat `secretDomain`, see DESIGN.md).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub secret_domain: String,
}

/// Persistent agent identity.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub agent_id: Uuid,
    pub agent_api_port: u16,
    pub public_ip: String,
    pub fingerprint: String,
    pub fingerprint_quality: FingerprintQuality,
    pub tunnel: Option<TunnelInfo>,
    pub secret: String,
}

impl fmt::Debug for AgentMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentMetadata")
            .field("agent_id", &self.agent_id)
            .field("agent_api_port", &self.agent_api_port)
            .field("public_ip", &self.public_ip)
            .field("fingerprint", &self.fingerprint)
            .field("fingerprint_quality", &self.fingerprint_quality)
            .field("tunnel", &self.tunnel)
            .field("secret", &"...")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FingerprintQuality {
    MachineId,
    HostnameFallback,
}

/// `POST /init` response (flat wire shape, see DESIGN.md's Open Question decision).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitAgentResponse {
    pub agent_created: bool,
    pub host_exists: bool,
    pub secret_key: String,
    pub secret_domain: String,
    pub instance_running: bool,
}

/// `POST /init/host` payload: this host's hardware, gathered by the host probe.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResources {
    pub hostname: String,
    pub memory_mb: u32,
    pub disk_space_gb: u32,
    pub cpus: u32,
    pub gpu_model: Option<String>,
    pub gpu_pci_addrs: Vec<String>,
}

/// Body of `POST /ssh` and `DELETE /ssh`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyRequest {
    pub ssh_pubkey: String,
}

/// Body of `PUT /instances`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageInstanceRequest {
    pub command: InstanceCommand,
}

/// `{status}` response of `GET /instances`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusResponse {
    pub status: InstanceStatus,
}

/// `{ports}` response of `POST /instances`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    pub ports: InstancePorts,
}

/// Generic envelope every route handler returns: `{ok, data?}` on success, `{ok, error}`
/// (see `errors::ApiErrorBody`) on failure.
#[derive(Clone, Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { ok: true, data: Some(data) }
    }
}

impl ApiResponse<()> {
    pub fn empty_ok() -> Self {
        Self { ok: true, data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_roundtrips_through_json() {
        let state = InstanceState {
            vm_id: Uuid::new_v4(),
            image: "cuda".into(),
            image_tag: "12.4".into(),
            ports: InstancePorts::from([("22".to_string(), "10042".to_string())]),
            proxies: vec![ProxyEntry {
                name: "vm-ssh".into(),
                proto: PortProto::Tcp,
                local_port: 10042,
                remote_port: Some(11000),
                custom_domain: None,
            }],
            ssh_enabled: true,
            gpu_pci_addr: "0000:01:00.0".into(),
        };
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: InstanceState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn qmp_status_mapping_matches_spec_table() {
        assert_eq!(InstanceStatus::from_qmp_status("running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_qmp_status("paused"), InstanceStatus::Paused);
        assert_eq!(InstanceStatus::from_qmp_status("prelaunch"), InstanceStatus::Pending);
        assert_eq!(InstanceStatus::from_qmp_status("inmigrate"), InstanceStatus::Pending);
        assert_eq!(InstanceStatus::from_qmp_status("shutdown"), InstanceStatus::Destroyed);
        assert_eq!(InstanceStatus::from_qmp_status("postmigrate"), InstanceStatus::Destroyed);
        assert_eq!(InstanceStatus::from_qmp_status("watchdog"), InstanceStatus::Error);
    }
}
