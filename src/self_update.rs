//! Self-update: downloads a new agent binary and swaps it in, then exits so the host's
//! supervisor (systemd, in production) restarts the process on the new version.

use std::{os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

use tempfile::Builder;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SelfUpdateError {
    #[error("failed to download new binary: {0}")]
    Download(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads the binary at `download_url`, swaps it in for the currently running
/// executable, then schedules a process exit after `grace_period` so the caller's HTTP
/// response has time to flush.
pub async fn trigger(download_url: &str, grace_period: Duration) -> Result<(), SelfUpdateError> {
    let agent_path = std::env::current_exe()?;
    info!(download_url, agent_path = %agent_path.display(), "downloading new agent binary");

    let bytes = reqwest::get(download_url).await?.error_for_status()?.bytes().await?;

    let temp_file = Builder::new().prefix("nilcc-agent-node-update").tempfile()?;
    tokio::fs::write(temp_file.path(), &bytes).await?;
    let mut perms = tokio::fs::metadata(temp_file.path()).await?.permissions();
    perms.set_mode(0o700);
    tokio::fs::set_permissions(temp_file.path(), perms).await?;

    let temp_path: PathBuf = temp_file.path().to_path_buf();
    tokio::fs::rename(&temp_path, &agent_path).await?;
    std::mem::forget(temp_file);

    tokio::spawn(async move {
        tokio::time::sleep(grace_period).await;
        info!("exiting for supervisor restart after self-update");
        std::process::exit(0);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_variants_format_with_context() {
        let io_err = SelfUpdateError::Io(std::io::Error::other("disk full"));
        assert!(io_err.to_string().contains("disk full"));
    }
}
