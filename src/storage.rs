//! Block-storage backends.
//!
//! Backends only know how to phrase their size query and creation command
//! and how to read the answer. Running the command is left to a
//! `CommandRunner`, so the same backend answers for either host.

use crate::guest::DiskBackend;
use crate::runner::{CommandRunner, run_checked};
use crate::{MoveError, Result, log_debug, log_warn};
use serde::Deserialize;

pub trait VolumeBackend: Send + Sync {
    fn kind(&self) -> DiskBackend;

    /// Command printing the size of the volume at `path`.
    fn size_query(&self, path: &str) -> Vec<String>;

    /// Read the size out of the query's stdout.
    fn parse_size(&self, stdout: &str) -> Result<u64>;

    /// Command creating a `size_bytes` volume at `path`, if this backend
    /// can create volumes at all.
    fn create_command(&self, path: &str, size_bytes: u64) -> Option<Vec<String>>;
}

/// LVM logical volumes.
#[derive(Debug, Clone)]
pub struct LvmBackend {
    default_volume_group: String,
    extent_bytes: u64,
}

impl LvmBackend {
    pub fn new(default_volume_group: impl Into<String>, extent_bytes: u64) -> Self {
        Self {
            default_volume_group: default_volume_group.into(),
            extent_bytes,
        }
    }

    /// Volume group and LV name for `path`. `/dev/<vg>/<lv>` names its own
    /// group, `/dev/mapper/<vg>-<lv>` is decoded, a bare name goes to the
    /// configured group. `None` for mapper names that hold no group.
    pub fn split_path(&self, path: &str) -> Option<(String, String)> {
        let parts: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        match parts.as_slice() {
            ["", "dev", "mapper", name] => split_mapper_name(name),
            ["", "dev", vg, lv] => Some((vg.to_string(), lv.to_string())),
            [lv] => Some((self.default_volume_group.clone(), lv.to_string())),
            _ => None,
        }
    }

    /// Size `lvcreate` will actually allocate for a request of `size_bytes`.
    pub fn allocated_size(&self, size_bytes: u64) -> u64 {
        if self.extent_bytes == 0 {
            return size_bytes;
        }
        size_bytes.div_ceil(self.extent_bytes) * self.extent_bytes
    }
}

impl VolumeBackend for LvmBackend {
    fn kind(&self) -> DiskBackend {
        DiskBackend::LogicalVolume
    }

    fn size_query(&self, path: &str) -> Vec<String> {
        [
            "lvs",
            path,
            "-o",
            "LV_SIZE",
            "--noheadings",
            "--units",
            "B",
            "--nosuffix",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn parse_size(&self, stdout: &str) -> Result<u64> {
        let text = stdout.trim();
        text.parse::<u64>()
            .map_err(|_| MoveError::Serde(format!("unexpected lvs size '{}'", text)))
    }

    fn create_command(&self, path: &str, size_bytes: u64) -> Option<Vec<String>> {
        let allocated = self.allocated_size(size_bytes);
        if allocated != size_bytes {
            log_warn!(
                "{}B is not a multiple of the {}B extent size, lvcreate will allocate {}B",
                size_bytes,
                self.extent_bytes,
                allocated
            );
        }
        let Some((vg, lv)) = self.split_path(path) else {
            log_warn!("{} does not name a volume group and logical volume", path);
            return None;
        };
        Some(vec![
            "lvcreate".to_string(),
            format!("-L{}B", size_bytes),
            format!("-n{}", lv),
            vg,
        ])
    }
}

/// Device-mapper joins group and volume with one `-` and doubles any `-`
/// inside either name.
fn split_mapper_name(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            if bytes.get(i + 1) == Some(&b'-') {
                i += 2;
                continue;
            }
            let (vg, lv) = (&name[..i], &name[i + 1..]);
            if vg.is_empty() || lv.is_empty() {
                return None;
            }
            return Some((vg.replace("--", "-"), lv.replace("--", "-")));
        }
        i += 1;
    }
    None
}

/// qcow2 images. Their virtual size lives in the image header.
#[derive(Debug, Clone, Default)]
pub struct Qcow2Backend;

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

impl VolumeBackend for Qcow2Backend {
    fn kind(&self) -> DiskBackend {
        DiskBackend::CopyOnWrite
    }

    fn size_query(&self, path: &str) -> Vec<String> {
        [
            "qemu-img",
            "info",
            "--output=json",
            "--force-share",
            path,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn parse_size(&self, stdout: &str) -> Result<u64> {
        let info: ImageInfo = serde_json::from_str(stdout)?;
        Ok(info.virtual_size)
    }

    fn create_command(&self, _path: &str, _size_bytes: u64) -> Option<Vec<String>> {
        None
    }
}

/// Dispatches to the backend matching a disk's kind.
pub struct StorageAdapter {
    lvm: LvmBackend,
    qcow2: Qcow2Backend,
}

impl StorageAdapter {
    pub fn new(lvm: LvmBackend) -> Self {
        Self {
            lvm,
            qcow2: Qcow2Backend,
        }
    }

    pub fn backend(&self, kind: DiskBackend) -> &dyn VolumeBackend {
        match kind {
            DiskBackend::LogicalVolume => &self.lvm,
            DiskBackend::CopyOnWrite => &self.qcow2,
        }
    }

    /// Size of the volume at `path` on `runner`'s host, `None` if it does
    /// not exist there.
    pub async fn size_of<R>(&self, runner: &R, path: &str, kind: DiskBackend) -> Result<Option<u64>>
    where
        R: CommandRunner + ?Sized,
    {
        let backend = self.backend(kind);
        let argv = backend.size_query(path);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let output = runner.run(&argv).await?;
        if !output.success() {
            log_debug!("{} not found on {}: {}", path, runner.host(), output.stderr.trim());
            return Ok(None);
        }
        backend.parse_size(&output.stdout).map(Some)
    }

    /// The creation command for `path`, as it would be run.
    pub fn creation_command(&self, path: &str, size_bytes: u64, kind: DiskBackend) -> Option<Vec<String>> {
        self.backend(kind).create_command(path, size_bytes)
    }

    pub async fn create<R>(&self, runner: &R, path: &str, size_bytes: u64, kind: DiskBackend) -> Result<()>
    where
        R: CommandRunner + ?Sized,
    {
        let argv = self
            .creation_command(path, size_bytes, kind)
            .ok_or_else(|| MoveError::ProvisioningFailed {
                disk: path.to_string(),
                host: runner.host().to_string(),
                reason: format!("{} volumes cannot be created", kind),
            })?;
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        run_checked(runner, &argv).await.map(drop)
    }
}
