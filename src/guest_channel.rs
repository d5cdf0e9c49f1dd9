//! Guest Channel: execute commands inside the guest over SSH once it is reachable
//! through the hypervisor's forwarded port.

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{process::Command, time::sleep};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const WAIT_FOR_BOOT_MAX: Duration = Duration::from_secs(180);
const WAIT_FOR_BOOT_POLL: Duration = Duration::from_secs(2);
const DOCKER_STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GuestChannelError {
    #[error("guest did not become reachable within {0:?}")]
    BootTimeout(Duration),

    #[error("command failed (exit {code:?}): {output}")]
    CommandFailed { code: Option<i32>, output: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuMetrics {
    pub utilization_pct: u32,
    pub temperature_c: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

/// Quotes a single shell argument: anything outside `[A-Za-z0-9\-_.:/@]+` gets wrapped
/// in single quotes with embedded quotes escaped.
pub fn shell_quote(arg: &str) -> String {
    let is_safe = !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_.:/@".contains(c));
    if is_safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuestChannel: Send + Sync {
    async fn wait_for_boot(&self) -> Result<(), GuestChannelError>;
    async fn run(&self, cmd: &str) -> Result<String, GuestChannelError>;
    async fn run_with_stdin(&self, cmd: &str, stdin: &str) -> Result<String, GuestChannelError>;
    async fn write_file(&self, path: &str, content: &str, mode: &str) -> Result<(), GuestChannelError>;
    async fn docker_login(&self, registry: &str, user: &str, password: &str) -> Result<(), GuestChannelError>;
    async fn docker_pull(&self, image: &str, tag: &str) -> Result<(), GuestChannelError>;
    async fn docker_run(&self, opts: DockerRunOptions) -> Result<String, GuestChannelError>;
    async fn docker_stop(&self, id: &str);
    async fn get_gpu_metrics(&self) -> Result<GpuMetrics, GuestChannelError>;
}

#[derive(Clone, Debug)]
pub struct DockerRunOptions {
    pub image: String,
    pub tag: String,
    pub gpu_enabled: bool,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub command: Option<String>,
}

pub struct SshGuestChannel {
    ssh_host_port: u16,
}

impl SshGuestChannel {
    pub fn new(ssh_host_port: u16) -> Self {
        Self { ssh_host_port }
    }

    fn ssh_base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-p".into(),
            self.ssh_host_port.to_string(),
            "root@127.0.0.1".into(),
        ]
    }

    async fn run_raw(&self, remote_command: &str, stdin_data: Option<&str>) -> Result<String, GuestChannelError> {
        let mut args = self.ssh_base_args();
        args.push(remote_command.to_string());
        let mut command = Command::new("ssh");
        command.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin_data.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }
        let mut child = command.spawn()?;
        if let Some(data) = stdin_data {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(GuestChannelError::CommandFailed { code: output.status.code(), output: combined });
        }
        Ok(combined.trim().to_string())
    }
}

#[async_trait]
impl GuestChannel for SshGuestChannel {
    async fn wait_for_boot(&self) -> Result<(), GuestChannelError> {
        let deadline = tokio::time::Instant::now() + WAIT_FOR_BOOT_MAX;
        loop {
            if self.run_raw("true", None).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GuestChannelError::BootTimeout(WAIT_FOR_BOOT_MAX));
            }
            sleep(WAIT_FOR_BOOT_POLL).await;
        }
    }

    async fn run(&self, cmd: &str) -> Result<String, GuestChannelError> {
        self.run_raw(cmd, None).await
    }

    async fn run_with_stdin(&self, cmd: &str, stdin: &str) -> Result<String, GuestChannelError> {
        self.run_raw(cmd, Some(stdin)).await
    }

    async fn write_file(&self, path: &str, content: &str, mode: &str) -> Result<(), GuestChannelError> {
        let parent_mkdir = if let Some(idx) = path.rfind('/') {
            format!("mkdir -p {} && ", shell_quote(&path[..idx]))
        } else {
            String::new()
        };
        let sentinel = "__NILCC_AGENT_EOF__";
        let remote_command = format!(
            "{parent_mkdir}cat > {path} <<'{sentinel}'\n{content}\n{sentinel}\nchmod {mode} {path}",
            path = shell_quote(path),
            mode = shell_quote(mode),
        );
        self.run_raw(&remote_command, None).await.map(|_| ())
    }

    async fn docker_login(&self, registry: &str, user: &str, password: &str) -> Result<(), GuestChannelError> {
        let cmd = format!(
            "docker login {} -u {} --password-stdin",
            shell_quote(registry),
            shell_quote(user)
        );
        self.run_raw(&cmd, Some(password)).await.map(|_| ())
    }

    async fn docker_pull(&self, image: &str, tag: &str) -> Result<(), GuestChannelError> {
        let cmd = format!("docker pull {}:{}", shell_quote(image), shell_quote(tag));
        self.run_raw(&cmd, None).await.map(|_| ())
    }

    async fn docker_run(&self, opts: DockerRunOptions) -> Result<String, GuestChannelError> {
        let mut cmd = String::from("docker run -d --restart=unless-stopped");
        if opts.gpu_enabled {
            cmd.push_str(" --gpus=all -e NVIDIA_VISIBLE_DEVICES=all -e NVIDIA_DRIVER_CAPABILITIES=all");
        }
        if let Some(cpu) = &opts.cpu {
            cmd.push_str(&format!(" --cpus={}", shell_quote(cpu)));
        }
        if let Some(memory) = &opts.memory {
            cmd.push_str(&format!(" --memory={}", shell_quote(memory)));
        }
        for (key, value) in &opts.env {
            cmd.push_str(&format!(" -e {}={}", shell_quote(key), shell_quote(value)));
        }
        for port in &opts.ports {
            cmd.push_str(&format!(" -p 0.0.0.0:{port}:{port}"));
        }
        cmd.push_str(" -v /data:/data");
        cmd.push_str(&format!(" {}:{}", shell_quote(&opts.image), shell_quote(&opts.tag)));
        if let Some(user_command) = &opts.command {
            cmd.push_str(&format!(" sh -c {}", shell_quote(&format!("trap 'exit 0' SIGTERM; {user_command} & wait"))));
        }
        self.run_raw(&cmd, None).await
    }

    async fn docker_stop(&self, id: &str) {
        let stop_cmd = format!("docker stop -t {} {}", DOCKER_STOP_GRACE.as_secs(), shell_quote(id));
        if self.run_raw(&stop_cmd, None).await.is_err() {
            let _ = self.run_raw(&format!("docker rm -f {}", shell_quote(id)), None).await;
        }
    }

    async fn get_gpu_metrics(&self) -> Result<GpuMetrics, GuestChannelError> {
        let output = self
            .run_raw("nvidia-smi --query-gpu=utilization.gpu,temperature.gpu,memory.used,memory.total --format=csv,noheader,nounits", None)
            .await?;
        let first_line = output.lines().next().unwrap_or_default();
        let fields: Vec<u64> = first_line.split(',').map(|f| f.trim().parse().unwrap_or(0)).collect();
        Ok(GpuMetrics {
            utilization_pct: fields.first().copied().unwrap_or(0) as u32,
            temperature_c: fields.get(1).copied().unwrap_or(0) as u32,
            memory_used_mb: fields.get(2).copied().unwrap_or(0),
            memory_total_mb: fields.get(3).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_characters_pass_through_unquoted() {
        assert_eq!(shell_quote("my-image_1.0:latest"), "my-image_1.0:latest");
    }

    #[test]
    fn unsafe_characters_get_single_quoted() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
    }

    #[test]
    fn embedded_single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn empty_string_is_quoted() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn gpu_metrics_missing_fields_default_to_zero() {
        let first_line = "";
        let fields: Vec<u64> = first_line.split(',').map(|f| f.trim().parse().unwrap_or(0)).collect();
        assert_eq!(fields.first().copied().unwrap_or(0), 0);
    }
}
