//! Saved-device store backed by a pretty-printed JSON file.

use std::path::{Path, PathBuf};

use devmux_types::SavedDevice;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn new_id() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(9).collect();
    format!("device_{}_{suffix}", chrono::Utc::now().timestamp_millis())
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<SavedDevice>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, devices: &[SavedDevice]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(devices)?;
        tokio::fs::write(&self.path, content).await?;
        debug!("Saved {} device(s) to {}", devices.len(), self.path.display());
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn list(&self) -> Result<Vec<SavedDevice>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Save a device keyed by `host:port`, updating the name of an existing
    /// entry. `connected` stamps `lastConnected` with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or written.
    pub async fn upsert(
        &self,
        name: &str,
        host: &str,
        port: u16,
        connected: bool,
    ) -> Result<SavedDevice, StoreError> {
        let _guard = self.lock.lock().await;
        let mut devices = self.read().await?;
        let stamp = connected.then(now_iso);

        let saved = if let Some(existing) = devices
            .iter_mut()
            .find(|d| d.host == host && d.port == port)
        {
            existing.name = name.to_string();
            if stamp.is_some() {
                existing.last_connected = stamp;
            }
            existing.clone()
        } else {
            let device = SavedDevice {
                id: new_id(),
                name: name.to_string(),
                host: host.to_string(),
                port,
                last_connected: stamp,
            };
            devices.push(device.clone());
            device
        };

        self.write(&devices).await?;
        Ok(saved)
    }

    /// Replace the whole list. Entries without an id get a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn replace(&self, mut devices: Vec<SavedDevice>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        for device in &mut devices {
            if device.id.is_empty() {
                device.id = new_id();
            }
        }
        self.write(&devices).await
    }

    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for unknown ids, or an I/O or JSON error.
    pub async fn remove(&self, id: &str) -> Result<SavedDevice, StoreError> {
        let _guard = self.lock.lock().await;
        let mut devices = self.read().await?;
        let Some(index) = devices.iter().position(|d| d.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let removed = devices.remove(index);
        self.write(&devices).await?;
        Ok(removed)
    }

    /// Like [`list`](Self::list), but a corrupt file reads as empty.
    pub async fn list_or_empty(&self) -> Vec<SavedDevice> {
        self.list().await.unwrap_or_else(|e| {
            warn!("Ignoring unreadable {}: {}", self.path.display(), e);
            Vec::new()
        })
    }
}
