//! State Store: durable JSON-blob persistence for `InstanceState`, agent identity, and
//! the bearer secret. Every file lives under the configured data directory at mode 0600.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::models::{AgentMetadata, InstanceState};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StateStoreError {
    StateStoreError::Io { path: path.into(), source }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_instance_state(&self) -> Result<Option<InstanceState>, StateStoreError>;
    async fn save_instance_state(&self, state: &InstanceState) -> Result<(), StateStoreError>;
    async fn clear_instance_state(&self) -> Result<(), StateStoreError>;
    async fn load_or_init_metadata(&self, public_ip: String, fingerprint: String, fingerprint_quality: crate::models::FingerprintQuality) -> Result<AgentMetadata, StateStoreError>;
}

pub struct FileStateStore {
    data_dir: PathBuf,
    management_key_path: Option<PathBuf>,
}

impl FileStateStore {
    /// `management_key_path` (the `MANAGEMENT_KEY` config value), when set and readable,
    /// seeds the persisted bearer secret on first run instead of a random one — lets an
    /// operator pin the agent's local secret across reinstalls.
    pub fn new(data_dir: PathBuf, management_key_path: Option<PathBuf>) -> Self {
        Self { data_dir, management_key_path }
    }

    fn instance_state_path(&self) -> PathBuf {
        self.data_dir.join("instance_state.json")
    }

    fn agent_id_path(&self) -> PathBuf {
        self.data_dir.join("agent_id")
    }

    fn agent_secret_path(&self) -> PathBuf {
        self.data_dir.join("agent_secret")
    }

    async fn write_private_file(&self, path: &Path, contents: &str) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.data_dir).await.map_err(|e| io_err(&self.data_dir, e))?;
        fs::write(path, contents).await.map_err(|e| io_err(path, e))?;
        let mut perms = fs::metadata(path).await.map_err(|e| io_err(path, e))?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).await.map_err(|e| io_err(path, e))?;
        Ok(())
    }

    async fn read_optional_file(&self, path: &Path) -> Result<Option<String>, StateStoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_instance_state(&self) -> Result<Option<InstanceState>, StateStoreError> {
        let path = self.instance_state_path();
        match self.read_optional_file(&path).await? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    async fn save_instance_state(&self, state: &InstanceState) -> Result<(), StateStoreError> {
        let serialized = serde_json::to_string_pretty(state)?;
        self.write_private_file(&self.instance_state_path(), &serialized).await
    }

    async fn clear_instance_state(&self) -> Result<(), StateStoreError> {
        let path = self.instance_state_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn load_or_init_metadata(
        &self,
        public_ip: String,
        fingerprint: String,
        fingerprint_quality: crate::models::FingerprintQuality,
    ) -> Result<AgentMetadata, StateStoreError> {
        let agent_id = match self.read_optional_file(&self.agent_id_path()).await? {
            Some(existing) => Uuid::parse_str(&existing).unwrap_or_else(|_| Uuid::new_v4()),
            None => {
                let id = Uuid::new_v4();
                self.write_private_file(&self.agent_id_path(), &id.to_string()).await?;
                id
            }
        };
        let secret = match self.read_optional_file(&self.agent_secret_path()).await? {
            Some(existing) => existing,
            None => {
                let seeded = match &self.management_key_path {
                    Some(path) => self.read_optional_file(path).await?,
                    None => None,
                };
                let secret = seeded.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                self.write_private_file(&self.agent_secret_path(), &secret).await?;
                secret
            }
        };
        Ok(AgentMetadata {
            agent_id,
            agent_api_port: 0,
            public_ip,
            fingerprint,
            fingerprint_quality,
            tunnel: None,
            secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instance_state_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf(), None);
        assert!(store.load_instance_state().await.unwrap().is_none());

        let state = InstanceState {
            vm_id: Uuid::new_v4(),
            image: "cuda".into(),
            image_tag: "12.4".into(),
            ports: Default::default(),
            proxies: vec![],
            ssh_enabled: false,
            gpu_pci_addr: "0000:01:00.0".into(),
        };
        store.save_instance_state(&state).await.unwrap();
        assert_eq!(store.load_instance_state().await.unwrap(), Some(state));

        store.clear_instance_state().await.unwrap();
        assert!(store.load_instance_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn instance_state_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf(), None);
        let state = InstanceState {
            vm_id: Uuid::new_v4(),
            image: "cuda".into(),
            image_tag: "12.4".into(),
            ports: Default::default(),
            proxies: vec![],
            ssh_enabled: false,
            gpu_pci_addr: "0000:01:00.0".into(),
        };
        store.save_instance_state(&state).await.unwrap();
        let perms = std::fs::metadata(store.instance_state_path()).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn agent_id_is_created_lazily_and_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf(), None);
        let first = store
            .load_or_init_metadata("1.2.3.4".into(), "fp".into(), crate::models::FingerprintQuality::MachineId)
            .await
            .unwrap();
        let second = store
            .load_or_init_metadata("1.2.3.4".into(), "fp".into(), crate::models::FingerprintQuality::MachineId)
            .await
            .unwrap();
        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(first.secret, second.secret);
    }

    #[tokio::test]
    async fn management_key_seeds_the_secret_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("pinned-secret");
        std::fs::write(&key_file, "pinned-bearer-secret\n").unwrap();
        let store = FileStateStore::new(dir.path().join("data"), Some(key_file));

        let metadata = store
            .load_or_init_metadata("1.2.3.4".into(), "fp".into(), crate::models::FingerprintQuality::MachineId)
            .await
            .unwrap();
        assert_eq!(metadata.secret, "pinned-bearer-secret");
    }

    #[tokio::test]
    async fn management_key_does_not_override_an_already_persisted_secret() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let key_file = dir.path().join("pinned-secret");
        std::fs::write(&key_file, "pinned-bearer-secret").unwrap();

        let first_run = FileStateStore::new(data_dir.clone(), None);
        let first = first_run
            .load_or_init_metadata("1.2.3.4".into(), "fp".into(), crate::models::FingerprintQuality::MachineId)
            .await
            .unwrap();

        let second_run = FileStateStore::new(data_dir, Some(key_file));
        let second = second_run
            .load_or_init_metadata("1.2.3.4".into(), "fp".into(), crate::models::FingerprintQuality::MachineId)
            .await
            .unwrap();
        assert_eq!(first.secret, second.secret);
        assert_ne!(second.secret, "pinned-bearer-secret");
    }
}
