//! Image Store: manages qcow2 disk images for the single instance this agent hosts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, process::Command};

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("qemu-img failed: {0}")]
    QemuImg(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base image does not exist: {0}")]
    BaseImageMissing(PathBuf),

    #[error("could not parse qemu-img output: {0}")]
    UnparsableOutput(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn create_disk(&self, name: &str, size_gib: u32) -> Result<PathBuf, ImageStoreError>;
    async fn create_overlay(&self, name: &str, base_image: &Path) -> Result<PathBuf, ImageStoreError>;
    async fn resize_disk(&self, path: &Path, size_gib: u32) -> Result<(), ImageStoreError>;
    async fn remove_disk(&self, path: &Path) -> Result<(), ImageStoreError>;
    async fn virtual_size_bytes(&self, path: &Path) -> Result<u64, ImageStoreError>;
}

pub struct DefaultImageStore {
    qemu_img_bin: PathBuf,
    image_dir: PathBuf,
}

impl DefaultImageStore {
    pub fn new(qemu_img_bin: PathBuf, image_dir: PathBuf) -> Self {
        Self { qemu_img_bin, image_dir }
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.image_dir.join(format!("{name}.qcow2"))
    }

    async fn qemu_img(&self, args: &[&str]) -> Result<String, ImageStoreError> {
        let output = Command::new(&self.qemu_img_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| ImageStoreError::QemuImg(e.to_string()))?;
        if !output.status.success() {
            return Err(ImageStoreError::QemuImg(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ImageStore for DefaultImageStore {
    async fn create_disk(&self, name: &str, size_gib: u32) -> Result<PathBuf, ImageStoreError> {
        fs::create_dir_all(&self.image_dir).await?;
        let path = self.disk_path(name);
        self.qemu_img(&["create", "-f", "qcow2", &path.to_string_lossy(), &format!("{size_gib}G")]).await?;
        Ok(path)
    }

    async fn create_overlay(&self, name: &str, base_image: &Path) -> Result<PathBuf, ImageStoreError> {
        if !base_image.exists() {
            return Err(ImageStoreError::BaseImageMissing(base_image.to_path_buf()));
        }
        fs::create_dir_all(&self.image_dir).await?;
        let path = self.disk_path(name);
        self.qemu_img(&[
            "create",
            "-f",
            "qcow2",
            "-b",
            &base_image.to_string_lossy(),
            "-F",
            "qcow2",
            &path.to_string_lossy(),
        ])
        .await?;
        Ok(path)
    }

    async fn resize_disk(&self, path: &Path, size_gib: u32) -> Result<(), ImageStoreError> {
        let current = self.virtual_size_bytes(path).await?;
        let target = u64::from(size_gib) * 1024 * 1024 * 1024;
        if current >= target {
            return Ok(());
        }
        self.qemu_img(&["resize", &path.to_string_lossy(), &format!("{size_gib}G")]).await?;
        Ok(())
    }

    async fn remove_disk(&self, path: &Path) -> Result<(), ImageStoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn virtual_size_bytes(&self, path: &Path) -> Result<u64, ImageStoreError> {
        let output = self.qemu_img(&["info", "--output=json", &path.to_string_lossy()]).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&output).map_err(|e| ImageStoreError::UnparsableOutput(e.to_string()))?;
        parsed
            .get("virtual-size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ImageStoreError::UnparsableOutput(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_path_uses_vm_id_as_name() {
        let store = DefaultImageStore::new("/usr/bin/qemu-img".into(), "/var/lib/images".into());
        assert_eq!(store.disk_path("abc-123"), PathBuf::from("/var/lib/images/abc-123.qcow2"));
    }

    #[tokio::test]
    async fn remove_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DefaultImageStore::new("/usr/bin/qemu-img".into(), dir.path().to_path_buf());
        let path = dir.path().join("does-not-exist.qcow2");
        assert!(store.remove_disk(&path).await.is_ok());
    }
}
