pub mod config;
pub mod confirm;
pub mod definition;
pub mod domain_xml;
pub mod error;
pub mod guest;
pub mod hypervisor;
pub mod inventory;
pub mod lifecycle;
pub mod logger;
pub mod migration;
pub mod reconcile;
pub mod remote;
pub mod replicate;
pub mod runner;
pub mod storage;

pub use error::MoveError;
pub use guest::{Disk, DiskBackend, Guest, MigrationPlan};

pub type Result<T> = std::result::Result<T, MoveError>;

// Convenience re-exports for the migration pipeline
pub use hypervisor::{Hypervisor, Virsh};
pub use migration::{MigrationManager, MigrationState, Phase};
pub use remote::{RemoteChannel, SshChannel};
