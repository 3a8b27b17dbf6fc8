use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage backend a disk lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskBackend {
    /// LVM logical volume, passed to the guest as a block device
    LogicalVolume,
    /// qcow2 image carrying its virtual size as metadata
    CopyOnWrite,
}

impl fmt::Display for DiskBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskBackend::LogicalVolume => write!(f, "lvm"),
            DiskBackend::CopyOnWrite => write!(f, "qcow2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub path: String,
    /// Size reported by the storage backend. Zero means unknown.
    pub size_bytes: u64,
    pub backend: DiskBackend,
}

impl Disk {
    pub fn new(path: impl Into<String>, size_bytes: u64, backend: DiskBackend) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            backend,
        }
    }

    pub fn is_known(&self) -> bool {
        self.size_bytes > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub name: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub vnc_port: Option<u16>,
    pub disks: Vec<Disk>,
}

impl Guest {
    pub fn total_disk_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.size_bytes).sum()
    }
}

/// A local disk and the remote volume it is copied onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPair {
    pub local: Disk,
    pub remote: Disk,
}

/// Everything one migration needs to carry between its steps.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub guest: Guest,
    pub destination: String,
    pub disk_pairs: Vec<DiskPair>,
    /// Captured once when the guest is quiesced
    pub was_running: Option<bool>,
    pub definition_path: Option<std::path::PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn new(guest: Guest, destination: impl Into<String>) -> Self {
        Self {
            guest,
            destination: destination.into(),
            disk_pairs: Vec::new(),
            was_running: None,
            definition_path: None,
            started_at: Utc::now(),
        }
    }

    pub fn guest_name(&self) -> &str {
        &self.guest.name
    }
}

/// Render a byte count for operator-facing output.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
