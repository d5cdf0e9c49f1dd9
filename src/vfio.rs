//! VFIO Binder: detach a PCI device tree (GPU plus companion audio function) from host
//! drivers and bind it to `vfio-pci`, restoring the original driver on release.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
const VFIO_DRIVERS_DIR: &str = "/sys/bus/pci/drivers/vfio-pci";
const NVIDIA_MODULES_UNLOAD_ORDER: &[&str] = &["nvidia_uvm", "nvidia_drm", "nvidia_modeset", "nvidia"];

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("device {0} not present in sysfs")]
    DeviceNotFound(String),

    #[error("iommu not enabled for device {0}")]
    IommuNotEnabled(String),

    #[error("iommu group of {0} contains a device bound to another driver: {1}")]
    GroupConflict(String, String),

    #[error("failed to unload nvidia module {0}: in use")]
    ModuleInUse(String),

    #[error("io error on {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("/dev/vfio/{0} did not appear after bind")]
    VfioNodeMissing(String),
}

fn io_err(path: impl AsRef<Path>, source: std::io::Error) -> VfioError {
    VfioError::Io { path: path.as_ref().display().to_string(), source }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PciClass {
    Gpu,
    Audio,
    Bridge,
    Other,
}

fn classify(class_hex: &str) -> PciClass {
    // class_hex is e.g. "0x030000"; classify by the top two hex digits.
    let trimmed = class_hex.trim_start_matches("0x");
    match &trimmed[..trimmed.len().min(4)] {
        s if s.starts_with("03") => PciClass::Gpu,
        s if s.starts_with("0403") => PciClass::Audio,
        s if s.starts_with("0604") => PciClass::Bridge,
        _ => PciClass::Other,
    }
}

async fn read_sysfs_attr(addr: &str, attr: &str) -> Result<String, VfioError> {
    let path = PathBuf::from(SYSFS_PCI_DEVICES).join(addr).join(attr);
    fs::read_to_string(&path).await.map(|s| s.trim().to_string()).map_err(|e| io_err(&path, e))
}

async fn current_driver(addr: &str) -> Option<String> {
    let path = PathBuf::from(SYSFS_PCI_DEVICES).join(addr).join("driver");
    let link = fs::read_link(&path).await.ok()?;
    link.file_name().map(|n| n.to_string_lossy().into_owned())
}

async fn iommu_group(addr: &str) -> Result<String, VfioError> {
    let path = PathBuf::from(SYSFS_PCI_DEVICES).join(addr).join("iommu_group");
    let link = fs::read_link(&path).await.map_err(|_| VfioError::IommuNotEnabled(addr.to_string()))?;
    link.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VfioError::IommuNotEnabled(addr.to_string()))
}

async fn group_siblings(group: &str) -> Result<Vec<String>, VfioError> {
    let devices_dir = PathBuf::from(format!("/sys/kernel/iommu_groups/{group}/devices"));
    let mut entries = fs::read_dir(&devices_dir).await.map_err(|e| io_err(&devices_dir, e))?;
    let mut siblings = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&devices_dir, e))? {
        siblings.push(entry.file_name().to_string_lossy().into_owned());
    }
    siblings.sort();
    Ok(siblings)
}

async fn write_sysfs(path: impl AsRef<Path>, value: &str) -> Result<(), VfioError> {
    fs::write(path.as_ref(), value).await.map_err(|e| io_err(path.as_ref(), e))
}

/// Manages PCI passthrough binding for a single GPU device tree.
pub struct VfioBinder {
    /// Addresses currently bound by this binder, in bind order, so Unbind can reverse it.
    bound: Vec<String>,
}

impl Default for VfioBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl VfioBinder {
    pub fn new() -> Self {
        Self { bound: Vec::new() }
    }

    /// Reconstructs binder state after an agent restart by checking sysfs: marks
    /// `address` bound if its current driver is `vfio-pci`.
    pub async fn restore_binding(&mut self, address: &str) {
        if current_driver(address).await.as_deref() == Some("vfio-pci") {
            self.bound = vec![address.to_string()];
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.is_empty()
    }

    /// Binds `address` and any same-vendor audio companion in its IOMMU group to
    /// `vfio-pci`, rejecting groups containing other kinds of devices bound elsewhere.
    pub async fn bind(&mut self, address: &str) -> Result<(), VfioError> {
        if !PathBuf::from(SYSFS_PCI_DEVICES).join(address).exists() {
            return Err(VfioError::DeviceNotFound(address.to_string()));
        }
        let vendor = read_sysfs_attr(address, "vendor").await?;
        let class = read_sysfs_attr(address, "class").await?;
        if classify(&class) != PciClass::Gpu {
            tracing::warn!(%address, %class, "binding a non-GPU-classed device");
        }
        let group = iommu_group(address).await?;
        let siblings = group_siblings(&group).await?;

        let mut to_bind = Vec::new();
        for sibling in &siblings {
            let sibling_class = read_sysfs_attr(sibling, "class").await?;
            let kind = classify(&sibling_class);
            match kind {
                PciClass::Bridge => continue,
                PciClass::Gpu if sibling == address => to_bind.push(sibling.clone()),
                PciClass::Audio => {
                    let sibling_vendor = read_sysfs_attr(sibling, "vendor").await?;
                    if sibling_vendor == vendor {
                        to_bind.push(sibling.clone());
                    } else if current_driver(sibling).await.is_some_and(|d| d != "vfio-pci") {
                        return Err(VfioError::GroupConflict(address.to_string(), sibling.clone()));
                    }
                }
                PciClass::Gpu | PciClass::Other => {
                    if sibling != address && current_driver(sibling).await.is_some_and(|d| d != "vfio-pci") {
                        return Err(VfioError::GroupConflict(address.to_string(), sibling.clone()));
                    }
                }
            }
        }
        if to_bind.is_empty() {
            to_bind.push(address.to_string());
        }

        if let Some(driver) = current_driver(address).await {
            if driver.starts_with("nvidia") {
                self.unload_nvidia_modules().await?;
            }
        }

        let mut bound_so_far = Vec::new();
        for dev in &to_bind {
            if let Err(e) = self.bind_one(dev).await {
                for already in bound_so_far.iter().rev() {
                    let _ = self.unbind_one(already).await;
                }
                return Err(e);
            }
            bound_so_far.push(dev.clone());
        }

        let vfio_node = PathBuf::from("/dev/vfio").join(&group);
        if !vfio_node.exists() {
            for already in bound_so_far.iter().rev() {
                let _ = self.unbind_one(already).await;
            }
            return Err(VfioError::VfioNodeMissing(group));
        }

        self.bound = bound_so_far;
        Ok(())
    }

    async fn unload_nvidia_modules(&self) -> Result<(), VfioError> {
        for module in NVIDIA_MODULES_UNLOAD_ORDER {
            let status = tokio::process::Command::new("modprobe").arg("-r").arg(module).status().await;
            match status {
                Ok(s) if s.success() => {}
                Ok(_) => return Err(VfioError::ModuleInUse(module.to_string())),
                Err(e) => return Err(io_err(format!("modprobe -r {module}"), e)),
            }
        }
        Ok(())
    }

    async fn bind_one(&self, addr: &str) -> Result<(), VfioError> {
        let dev_dir = PathBuf::from(SYSFS_PCI_DEVICES).join(addr);
        if let Some(driver) = current_driver(addr).await {
            let unbind_path = dev_dir.join("driver").join("unbind");
            let _ = driver;
            write_sysfs(&unbind_path, addr).await?;
        }
        write_sysfs(dev_dir.join("driver_override"), "vfio-pci").await?;
        write_sysfs("/sys/bus/pci/drivers_probe", addr).await?;
        Ok(())
    }

    async fn unbind_one(&self, addr: &str) -> Result<(), VfioError> {
        let dev_dir = PathBuf::from(SYSFS_PCI_DEVICES).join(addr);
        let vfio_unbind = PathBuf::from(VFIO_DRIVERS_DIR).join("unbind");
        let _ = write_sysfs(&vfio_unbind, addr).await;
        let _ = write_sysfs(dev_dir.join("driver_override"), "").await;
        let _ = write_sysfs("/sys/bus/pci/drivers_probe", addr).await;
        Ok(())
    }

    /// Reverses binding in reverse order. Best-effort: VM is already gone by the time
    /// this runs, so individual failures are logged, not propagated.
    pub async fn unbind(&mut self) {
        for addr in self.bound.clone().into_iter().rev() {
            if let Err(e) = self.unbind_one(&addr).await {
                tracing::warn!(address = %addr, error = %e, "failed to unbind vfio device");
            }
        }
        self.bound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gpu_class_code() {
        assert_eq!(classify("0x030000"), PciClass::Gpu);
    }

    #[test]
    fn classifies_audio_class_code() {
        assert_eq!(classify("0x040300"), PciClass::Audio);
    }

    #[test]
    fn classifies_bridge_class_code() {
        assert_eq!(classify("0x060400"), PciClass::Bridge);
    }

    #[test]
    fn classifies_other_class_code() {
        assert_eq!(classify("0x020000"), PciClass::Other);
    }

    #[tokio::test]
    async fn bind_fails_fast_for_missing_device() {
        let mut binder = VfioBinder::new();
        let result = binder.bind("0000:ff:ff.9").await;
        assert!(matches!(result, Err(VfioError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn restore_binding_leaves_unbound_when_driver_is_missing() {
        let mut binder = VfioBinder::new();
        binder.restore_binding("0000:ff:ff.9").await;
        assert!(!binder.is_bound());
    }
}
