//! Capacity reconciliation: every local disk needs a volume of exactly the
//! same size on the destination before anything is copied.

use crate::confirm::Confirm;
use crate::guest::Disk;
use crate::remote::RemoteChannel;
use crate::runner::{CommandRunner, command_line};
use crate::storage::StorageAdapter;
use crate::{MoveError, Result, log_info, log_warn};

pub struct CapacityReconciler<'a> {
    storage: &'a StorageAdapter,
    confirm: &'a dyn Confirm,
}

impl<'a> CapacityReconciler<'a> {
    pub fn new(storage: &'a StorageAdapter, confirm: &'a dyn Confirm) -> Self {
        Self { storage, confirm }
    }

    /// Make sure `remote` holds a volume at `disk.path` of exactly
    /// `required_bytes`, creating it with the operator's consent.
    pub async fn reconcile(
        &self,
        remote: &dyn RemoteChannel,
        disk: &Disk,
        required_bytes: u64,
    ) -> Result<Disk> {
        log_info!("Checking {} (size {}B)", disk.path, required_bytes);

        let size = match self.storage.size_of(remote, &disk.path, disk.backend).await? {
            Some(size) => size,
            None => {
                log_warn!("I can't find {} on {}", disk.path, remote.host());
                self.provision(remote, disk, required_bytes).await?
            }
        };

        if size != required_bytes {
            return Err(MoveError::SizeMismatch {
                disk: disk.path.clone(),
                expected: required_bytes,
                actual: size,
            });
        }

        Ok(Disk::new(disk.path.clone(), size, disk.backend))
    }

    /// Create the missing volume and return the size the backend reports
    /// for it afterwards.
    async fn provision(
        &self,
        remote: &dyn RemoteChannel,
        disk: &Disk,
        required_bytes: u64,
    ) -> Result<u64> {
        let argv = self
            .storage
            .creation_command(&disk.path, required_bytes, disk.backend)
            .ok_or_else(|| MoveError::NotFound {
                kind: "Remote volume",
                name: format!("{}:{}", remote.host(), disk.path),
            })?;
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let proposal = command_line(&argv);

        println!("{}", proposal);
        let prompt = format!("Should I run this command on {}?", remote.host());
        if !self.confirm.confirm(&prompt)? {
            return Err(MoveError::ProvisioningDeclined {
                disk: disk.path.clone(),
                host: remote.host().to_string(),
            });
        }

        self.storage
            .create(remote, &disk.path, required_bytes, disk.backend)
            .await
            .map_err(|e| MoveError::ProvisioningFailed {
                disk: disk.path.clone(),
                host: remote.host().to_string(),
                reason: e.to_string(),
            })?;

        self.storage
            .size_of(remote, &disk.path, disk.backend)
            .await?
            .ok_or_else(|| MoveError::ProvisioningFailed {
                disk: disk.path.clone(),
                host: remote.host().to_string(),
                reason: format!("`{}` succeeded but the volume is still missing", proposal),
            })
    }
}
