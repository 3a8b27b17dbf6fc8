use crate::hypervisor::Hypervisor;
use crate::remote::RemoteChannel;
use crate::{MoveError, Result, log_info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// Moves a guest's definition document to the destination and registers it.
pub struct DefinitionTransport {
    local: Arc<dyn Hypervisor>,
    remote: Arc<dyn Hypervisor>,
    channel: Arc<dyn RemoteChannel>,
    definition_dir: PathBuf,
    settle: Duration,
}

impl DefinitionTransport {
    pub fn new(
        local: Arc<dyn Hypervisor>,
        remote: Arc<dyn Hypervisor>,
        channel: Arc<dyn RemoteChannel>,
        definition_dir: impl Into<PathBuf>,
        settle: Duration,
    ) -> Self {
        Self {
            local,
            remote,
            channel,
            definition_dir: definition_dir.into(),
            settle,
        }
    }

    pub fn definition_path(&self, guest: &str) -> PathBuf {
        self.definition_dir.join(format!("{}.xml", guest))
    }

    /// Write the guest's current definition to a local file.
    pub async fn export_definition(&self, guest: &str) -> Result<PathBuf> {
        let xml = self.local.definition(guest).await?;
        let path = self.definition_path(guest);
        tokio::fs::write(&path, xml)
            .await
            .map_err(|e| self.transport_error(guest, format!("writing {}: {}", path.display(), e)))?;
        log_info!("Dumped definition of {} to {}", guest, path.display());
        Ok(path)
    }

    /// Copy the exported file to the same path on the destination.
    pub async fn ship(&self, guest: &str, path: &Path) -> Result<()> {
        self.channel
            .put_file(path, path)
            .await
            .map_err(|e| self.transport_error(guest, e.to_string()))
    }

    /// Define the guest on the destination from the shipped file, then give
    /// the hypervisor time to finish registering it.
    pub async fn register_remote(&self, guest: &str, path: &Path) -> Result<()> {
        log_info!("Defining {} on remote", guest);
        self.remote
            .define(path)
            .await
            .map_err(|e| self.transport_error(guest, e.to_string()))?;
        sleep(self.settle).await;
        Ok(())
    }

    pub async fn transfer(&self, guest: &str) -> Result<PathBuf> {
        let path = self.export_definition(guest).await?;
        self.ship(guest, &path).await?;
        self.register_remote(guest, &path).await?;
        Ok(path)
    }

    fn transport_error(&self, guest: &str, reason: String) -> MoveError {
        MoveError::TransportError {
            guest: guest.to_string(),
            reason,
        }
    }
}
