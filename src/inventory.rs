use crate::domain_xml::DomainDefinition;
use crate::guest::{Disk, Guest};
use crate::hypervisor::Hypervisor;
use crate::runner::CommandRunner;
use crate::storage::StorageAdapter;
use crate::{Result, log_debug, log_info, log_warn};
use std::collections::BTreeMap;

pub type Inventory = BTreeMap<String, Guest>;

/// Builds the guest manifest of the local host. Read-only.
pub struct InventoryBuilder<'a, R: ?Sized> {
    hypervisor: &'a dyn Hypervisor,
    storage: &'a StorageAdapter,
    runner: &'a R,
}

impl<'a, R: CommandRunner + ?Sized> InventoryBuilder<'a, R> {
    pub fn new(hypervisor: &'a dyn Hypervisor, storage: &'a StorageAdapter, runner: &'a R) -> Self {
        Self {
            hypervisor,
            storage,
            runner,
        }
    }

    pub async fn build(&self) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        for name in self.hypervisor.list_guests().await? {
            let guest = self.describe(&name).await?;
            inventory.insert(name, guest);
        }
        log_info!("Found {} guests on {}", inventory.len(), self.hypervisor.host());
        Ok(inventory)
    }

    /// Manifest of one guest. Disks whose size cannot be read are kept
    /// with size zero.
    pub async fn describe(&self, name: &str) -> Result<Guest> {
        let xml = self.hypervisor.definition(name).await?;
        let definition = DomainDefinition::parse(&xml)?;

        let mut disks = Vec::with_capacity(definition.disks.len());
        for source in definition.disks {
            let size = match self
                .storage
                .size_of(self.runner, &source.path, source.backend)
                .await
            {
                Ok(Some(size)) => size,
                Ok(None) => {
                    log_warn!("I can't find {} of '{}' on {}", source.path, name, self.runner.host());
                    0
                }
                Err(e) => {
                    log_warn!("Size of {} of '{}' unknown: {}", source.path, name, e);
                    0
                }
            };
            log_debug!("{}: {} ({}) {}B", name, source.path, source.backend, size);
            disks.push(Disk::new(source.path, size, source.backend));
        }

        Ok(Guest {
            name: name.to_string(),
            vcpus: definition.vcpus,
            memory_bytes: definition.memory_bytes,
            vnc_port: definition.vnc_port,
            disks,
        })
    }
}
