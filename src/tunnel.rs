//! Tunnel Process: supervises the reverse-proxy subprocess that exposes the agent's own
//! API port and the current instance's ports to the remote control plane.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use tokio::{process::Command, sync::Notify, time::sleep};

use crate::models::ProxyEntry;

/// Minimal cooperative-cancellation primitive: a one-shot flag plus a `Notify` so
/// `cancelled()` can be `.await`ed instead of polled, scoped to one tunnel run.
#[derive(Clone)]
struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

const TEMPLATE: &str = include_str!("templates/frpc.toml.j2");
const RESTART_BACKOFF: Duration = Duration::from_secs(3);
const STARTUP_HEALTH_WINDOW: Duration = Duration::from_millis(500);
const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel binary not found at {0}")]
    BinaryMissing(PathBuf),

    #[error("failed to render config: {0}")]
    Render(#[from] tera::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel exited immediately after spawn with status {0:?}")]
    ImmediateExit(Option<i32>),
}

#[derive(Serialize)]
struct TemplateProxy {
    name: String,
    proto: String,
    local_port: u16,
    remote_port: Option<u16>,
    custom_domain: Option<String>,
}

impl From<&ProxyEntry> for TemplateProxy {
    fn from(entry: &ProxyEntry) -> Self {
        Self {
            name: entry.name.clone(),
            proto: entry.proto.to_string(),
            local_port: entry.local_port,
            remote_port: entry.remote_port,
            custom_domain: entry.custom_domain.clone(),
        }
    }
}

struct TunnelState {
    process: Option<tokio::process::Child>,
    cancellation: CancellationToken,
    instance_proxies: Vec<ProxyEntry>,
}

/// Supervises the tunnel subprocess: regenerates its config file and restarts it on
/// every proxy-list change, and auto-restarts it on unexpected crash.
pub struct TunnelProcess {
    binary: PathBuf,
    config_path: PathBuf,
    server_addr: String,
    server_port: u16,
    token: String,
    agent_port: std::sync::atomic::AtomicU16,
    state: Arc<Mutex<TunnelState>>,
}

impl TunnelProcess {
    pub fn new(binary: PathBuf, config_path: PathBuf, server_addr: String, server_port: u16, token: String) -> Self {
        Self {
            binary,
            config_path,
            server_addr,
            server_port,
            token,
            agent_port: std::sync::atomic::AtomicU16::new(0),
            state: Arc::new(Mutex::new(TunnelState {
                process: None,
                cancellation: CancellationToken::new(),
                instance_proxies: Vec::new(),
            })),
        }
    }

    fn render_config(&self, instance_proxies: &[ProxyEntry]) -> Result<String, TunnelError> {
        let mut proxies = vec![TemplateProxy {
            name: "agent-api".into(),
            proto: "http".into(),
            local_port: self.agent_port.load(std::sync::atomic::Ordering::SeqCst),
            remote_port: None,
            custom_domain: None,
        }];
        proxies.extend(instance_proxies.iter().map(TemplateProxy::from));

        let mut context = Context::new();
        context.insert("server_addr", &self.server_addr);
        context.insert("server_port", &self.server_port);
        context.insert("token", &self.token);
        context.insert("proxies", &proxies);
        Ok(Tera::one_off(TEMPLATE, &context, false)?)
    }

    async fn write_config(&self, instance_proxies: &[ProxyEntry]) -> Result<(), TunnelError> {
        let rendered = self.render_config(instance_proxies)?;
        tokio::fs::write(&self.config_path, rendered).await?;
        Ok(())
    }

    async fn spawn_process(&self) -> Result<tokio::process::Child, TunnelError> {
        if !self.binary.exists() {
            return Err(TunnelError::BinaryMissing(self.binary.clone()));
        }
        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        sleep(STARTUP_HEALTH_WINDOW).await;
        if let Some(status) = child.try_wait()? {
            return Err(TunnelError::ImmediateExit(status.code()));
        }
        Ok(child)
    }

    /// Starts the subprocess for the first time, writing the config first and spawning
    /// the crash-monitor task.
    pub async fn start(self: &Arc<Self>, agent_port: u16) -> Result<(), TunnelError> {
        self.agent_port.store(agent_port, std::sync::atomic::Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            state.cancellation = CancellationToken::new();
        }
        self.write_config(&[]).await?;
        let child = self.spawn_process().await?;
        {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            state.process = Some(child);
        }
        self.spawn_monitor();
        Ok(())
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let cancellation = { this.state.lock().expect("tunnel mutex poisoned").cancellation.clone() };
                let wait_result = {
                    let mut state = this.state.lock().expect("tunnel mutex poisoned");
                    state.process.take()
                };
                let Some(mut child) = wait_result else { break };

                tokio::select! {
                    _ = child.wait() => {}
                    _ = cancellation.cancelled() => {
                        tracing::info!("tunnel monitor cancelled, not restarting");
                        return;
                    }
                }

                if cancellation.is_cancelled() {
                    tracing::info!("tunnel exited during intentional stop, not restarting");
                    return;
                }

                tokio::select! {
                    _ = sleep(RESTART_BACKOFF) => {}
                    _ = cancellation.cancelled() => {
                        tracing::info!("tunnel monitor cancelled during backoff, not restarting");
                        return;
                    }
                }

                let mut state = this.state.lock().expect("tunnel mutex poisoned");
                if state.cancellation.is_cancelled() {
                    return;
                }
                match this.spawn_process().await {
                    Ok(child) => state.process = Some(child),
                    Err(e) => tracing::warn!(error = %e, "failed to auto-restart tunnel"),
                }
            }
        });
    }

    /// Replaces the instance proxy list, rewrites the config, and restarts the process.
    pub async fn update_instance_proxies(&self, proxies: Vec<ProxyEntry>) -> Result<(), TunnelError> {
        self.write_config(&proxies).await?;
        {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            state.instance_proxies = proxies;
        }
        self.restart_process().await
    }

    /// Drops all instance proxies, keeping only `agent-api`.
    pub async fn clear_instance_proxies(&self) -> Result<(), TunnelError> {
        self.write_config(&[]).await?;
        {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            state.instance_proxies.clear();
        }
        self.restart_process().await
    }

    async fn restart_process(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            if let Some(mut child) = state.process.take() {
                let _ = child.start_kill();
            }
        }
        let child = self.spawn_process().await?;
        let mut state = self.state.lock().expect("tunnel mutex poisoned");
        state.process = Some(child);
        Ok(())
    }

    /// Cancels the monitor, signals graceful termination, waits up to 5s, force-kills.
    pub async fn stop(&self) {
        let (cancellation, mut child) = {
            let mut state = self.state.lock().expect("tunnel mutex poisoned");
            (state.cancellation.clone(), state.process.take())
        };
        cancellation.cancel();
        let Some(child) = child.as_mut() else { return };
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        let wait = tokio::time::timeout(GRACEFUL_STOP_WAIT, child.wait()).await;
        if wait.is_err() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_process() -> TunnelProcess {
        TunnelProcess::new(
            "/usr/local/bin/frpc".into(),
            "/tmp/frpc.toml".into(),
            "tunnel.example.com".into(),
            7000,
            "secret-token".into(),
        )
    }

    #[test]
    fn rendered_config_always_includes_agent_api_proxy() {
        let tunnel = make_process();
        let rendered = tunnel.render_config(&[]).unwrap();
        assert!(rendered.contains("agent-api"));
        assert!(rendered.contains("tunnel.example.com"));
    }

    #[test]
    fn rendered_config_includes_instance_proxies() {
        let tunnel = make_process();
        let proxies = vec![ProxyEntry {
            name: "vm-ssh".into(),
            proto: crate::models::PortProto::Tcp,
            local_port: 10042,
            remote_port: Some(11000),
            custom_domain: None,
        }];
        let rendered = tunnel.render_config(&proxies).unwrap();
        assert!(rendered.contains("vm-ssh"));
        assert!(rendered.contains("11000"));
    }

    #[test]
    fn http_proxy_renders_custom_domain_instead_of_remote_port() {
        let tunnel = make_process();
        let proxies = vec![ProxyEntry {
            name: "vm-http".into(),
            proto: crate::models::PortProto::Http,
            local_port: 15001,
            remote_port: None,
            custom_domain: Some("workload.nilcc.com".into()),
        }];
        let rendered = tunnel.render_config(&proxies).unwrap();
        assert!(rendered.contains("workload.nilcc.com"));
    }
}
