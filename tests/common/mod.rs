// In-memory stand-ins for the hypervisor, the remote host, the block copier
// and the operator.
#![allow(dead_code)]

use async_trait::async_trait;
use kvmove::config::MoveConfig;
use kvmove::confirm::Confirm;
use kvmove::guest::{Disk, DiskBackend, Guest};
use kvmove::hypervisor::Hypervisor;
use kvmove::remote::RemoteChannel;
use kvmove::replicate::BlockCopier;
use kvmove::runner::{CommandOutput, CommandRunner};
use kvmove::{MoveError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const TEN_GIB: u64 = 10737418240;

/// Ordered record of side effects across every fake.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn contains(&self, event: &str) -> bool {
        self.position(event).is_some()
    }

    pub fn any_starts_with(&self, prefix: &str) -> bool {
        self.events().iter().any(|e| e.starts_with(prefix))
    }
}

pub fn domain_xml(name: &str, disks: &[(&str, DiskBackend)]) -> String {
    let devices: String = disks
        .iter()
        .map(|(path, backend)| match backend {
            DiskBackend::LogicalVolume => format!(
                "<disk type='block' device='disk'><driver name='qemu' type='raw'/>\
                 <source dev='{}'/><target dev='vda' bus='virtio'/></disk>",
                path
            ),
            DiskBackend::CopyOnWrite => format!(
                "<disk type='file' device='disk'><driver name='qemu' type='qcow2'/>\
                 <source file='{}'/><target dev='vdb' bus='virtio'/></disk>",
                path
            ),
        })
        .collect();
    format!(
        "<domain type='kvm'><name>{}</name><memory unit='KiB'>2097152</memory>\
         <vcpu placement='static'>2</vcpu><devices>{}\
         <graphics type='vnc' port='5901' autoport='no'/></devices></domain>",
        name, devices
    )
}

pub fn lvm_guest(name: &str, size_bytes: u64) -> Guest {
    Guest {
        name: name.to_string(),
        vcpus: 2,
        memory_bytes: 2 << 30,
        vnc_port: Some(5901),
        disks: vec![Disk::new(
            format!("/dev/ubuntu-vg/{}", name),
            size_bytes,
            DiskBackend::LogicalVolume,
        )],
    }
}

struct FakeGuest {
    xml: String,
    running: bool,
    /// Polls left before a requested shutdown completes
    stopping: Option<usize>,
}

/// A hypervisor holding guests in memory. Shutdowns complete after a
/// configurable number of state polls.
pub struct FakeHypervisor {
    host: String,
    guests: Mutex<BTreeMap<String, FakeGuest>>,
    polls_to_stop: usize,
    events: EventLog,
}

impl FakeHypervisor {
    pub fn new(host: &str, events: EventLog) -> Self {
        Self {
            host: host.to_string(),
            guests: Mutex::new(BTreeMap::new()),
            polls_to_stop: 2,
            events,
        }
    }

    pub fn with_guest(self, name: &str, xml: String, running: bool) -> Self {
        self.guests.lock().unwrap().insert(
            name.to_string(),
            FakeGuest {
                xml,
                running,
                stopping: None,
            },
        );
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.guests.lock().unwrap().contains_key(name)
    }

    pub fn running(&self, name: &str) -> bool {
        self.guests
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|g| g.running)
    }

    fn with<T>(&self, name: &str, f: impl FnOnce(&mut FakeGuest) -> T) -> Result<T> {
        let mut guests = self.guests.lock().unwrap();
        guests
            .get_mut(name)
            .map(f)
            .ok_or_else(|| MoveError::guest_not_found(name))
    }

    fn record(&self, action: &str, guest: &str) {
        self.events.push(format!("{} {} {}", self.host, action, guest));
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_guests(&self) -> Result<Vec<String>> {
        Ok(self.guests.lock().unwrap().keys().cloned().collect())
    }

    async fn definition(&self, guest: &str) -> Result<String> {
        self.with(guest, |g| g.xml.clone())
    }

    async fn is_running(&self, guest: &str) -> Result<bool> {
        self.with(guest, |g| {
            if let Some(left) = g.stopping {
                if left == 0 {
                    g.running = false;
                    g.stopping = None;
                } else {
                    g.stopping = Some(left - 1);
                }
            }
            g.running
        })
    }

    async fn shutdown(&self, guest: &str) -> Result<()> {
        let polls = self.polls_to_stop;
        self.with(guest, |g| g.stopping = Some(polls))?;
        self.record("shutdown", guest);
        Ok(())
    }

    async fn start(&self, guest: &str) -> Result<()> {
        self.with(guest, |g| g.running = true)?;
        self.record("start", guest);
        Ok(())
    }

    async fn destroy(&self, guest: &str) -> Result<()> {
        self.with(guest, |g| g.running = false)?;
        self.record("destroy", guest);
        Ok(())
    }

    async fn reboot(&self, guest: &str) -> Result<()> {
        self.with(guest, |_| ())?;
        self.record("reboot", guest);
        Ok(())
    }

    async fn undefine(&self, guest: &str) -> Result<()> {
        self.with(guest, |_| ())?;
        self.guests.lock().unwrap().remove(guest);
        self.record("undefine", guest);
        Ok(())
    }

    async fn define(&self, path: &Path) -> Result<()> {
        self.events
            .push(format!("{} define {}", self.host, path.display()));
        Ok(())
    }

    async fn migrate_live(&self, guest: &str, destination_uri: &str) -> Result<()> {
        self.with(guest, |_| ())?;
        self.guests.lock().unwrap().remove(guest);
        self.events
            .push(format!("{} migrate {} {}", self.host, guest, destination_uri));
        Ok(())
    }
}

/// A host answering the storage and `virsh` commands the mover issues,
/// usable as the remote channel or as a local runner.
pub struct FakeHost {
    host: String,
    volumes: Mutex<BTreeMap<String, u64>>,
    /// Size new volumes report instead of the requested one
    created_size: Mutex<Option<u64>>,
    guests: Mutex<BTreeMap<String, bool>>,
    files: Mutex<BTreeMap<PathBuf, String>>,
    fail_put: bool,
    fail_define: bool,
    events: EventLog,
}

impl FakeHost {
    pub fn new(host: &str, events: EventLog) -> Self {
        Self {
            host: host.to_string(),
            volumes: Mutex::new(BTreeMap::new()),
            created_size: Mutex::new(None),
            guests: Mutex::new(BTreeMap::new()),
            files: Mutex::new(BTreeMap::new()),
            fail_put: false,
            fail_define: false,
            events,
        }
    }

    /// File copies to this host fail.
    pub fn failing_put(mut self) -> Self {
        self.fail_put = true;
        self
    }

    /// `virsh define` on this host fails.
    pub fn failing_define(mut self) -> Self {
        self.fail_define = true;
        self
    }

    pub fn with_volume(self, path: &str, size: u64) -> Self {
        self.volumes.lock().unwrap().insert(path.to_string(), size);
        self
    }

    pub fn creating_volumes_of(self, size: u64) -> Self {
        *self.created_size.lock().unwrap() = Some(size);
        self
    }

    pub fn volume(&self, path: &str) -> Option<u64> {
        self.volumes.lock().unwrap().get(path).copied()
    }

    pub fn guest_running(&self, name: &str) -> Option<bool> {
        self.guests.lock().unwrap().get(name).copied()
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn ok(stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn fail(status: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn lvcreate(&self, argv: &[&str]) -> CommandOutput {
        let size = argv
            .iter()
            .find_map(|a| a.strip_prefix("-L").and_then(|s| s.strip_suffix('B')))
            .and_then(|s| s.parse::<u64>().ok());
        let name = argv.iter().find_map(|a| a.strip_prefix("-n"));
        let (Some(size), Some(name), Some(vg)) = (size, name, argv.last()) else {
            return Self::fail(3, "invalid lvcreate arguments");
        };
        let path = format!("/dev/{}/{}", vg, name);
        let mapper = format!(
            "/dev/mapper/{}-{}",
            vg.replace('-', "--"),
            name.replace('-', "--")
        );
        let actual = self.created_size.lock().unwrap().unwrap_or(size);
        let mut volumes = self.volumes.lock().unwrap();
        volumes.insert(path.clone(), actual);
        volumes.insert(mapper, actual);
        drop(volumes);
        self.events.push(format!("{} lvcreate {}", self.host, path));
        Self::ok(format!("  Logical volume \"{}\" created.\n", name))
    }

    fn virsh(&self, args: &[&str]) -> CommandOutput {
        let unknown = |name: &str| {
            Self::fail(
                1,
                &format!("error: failed to get domain '{}'\nerror: Domain not found", name),
            )
        };
        match args {
            ["define", path] => {
                let path = PathBuf::from(*path);
                if !self.files.lock().unwrap().contains_key(&path) {
                    return Self::fail(1, "error: Failed to open file: No such file or directory");
                }
                if self.fail_define {
                    return Self::fail(1, "error: Failed to define domain: operation failed");
                }
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.guests.lock().unwrap().insert(name, false);
                self.events
                    .push(format!("{} define {}", self.host, path.display()));
                Self::ok("Domain defined\n")
            }
            ["start", name] => match self.guests.lock().unwrap().get_mut(*name) {
                Some(running) => {
                    *running = true;
                    self.events.push(format!("{} start {}", self.host, name));
                    Self::ok(format!("Domain '{}' started\n", name))
                }
                None => unknown(*name),
            },
            ["domstate", name] => match self.guests.lock().unwrap().get(*name) {
                Some(true) => Self::ok("running\n\n"),
                Some(false) => Self::ok("shut off\n\n"),
                None => unknown(*name),
            },
            _ => Self::fail(1, "error: unsupported command"),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let output = match argv {
            ["lvs", path, ..] => match self.volume(path) {
                Some(size) => Self::ok(format!("  {}\n", size)),
                None => Self::fail(5, "Failed to find logical volume"),
            },
            ["lvcreate", ..] => self.lvcreate(argv),
            ["qemu-img", "info", .., path] => match self.volume(path) {
                Some(size) => Self::ok(format!("{{\"virtual-size\": {}, \"format\": \"qcow2\"}}", size)),
                None => Self::fail(1, "qemu-img: Could not open: No such file or directory"),
            },
            ["virsh", "-c", _, args @ ..] => self.virsh(args),
            _ => Self::fail(127, "command not found"),
        };
        Ok(output)
    }

    async fn run_attached(&self, argv: &[&str]) -> Result<i32> {
        Ok(self.run(argv).await?.status)
    }
}

#[async_trait]
impl RemoteChannel for FakeHost {
    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()> {
        if self.fail_put {
            return Err(MoveError::CommandFailed {
                host: self.host.clone(),
                command: format!("scp {}", local.display()),
                stderr: "scp: /root: Permission denied".to_string(),
            });
        }
        let contents = std::fs::read_to_string(local)?;
        self.files
            .lock()
            .unwrap()
            .insert(remote.to_path_buf(), contents);
        self.events
            .push(format!("{} put {}", self.host, remote.display()));
        Ok(())
    }
}

/// Records every copy; can be told to fail on the n-th disk.
pub struct FakeCopier {
    fail_on: Option<usize>,
    calls: Mutex<usize>,
    events: EventLog,
}

impl FakeCopier {
    pub fn new(events: EventLog) -> Self {
        Self {
            fail_on: None,
            calls: Mutex::new(0),
            events,
        }
    }

    pub fn failing_on(mut self, index: usize) -> Self {
        self.fail_on = Some(index);
        self
    }
}

#[async_trait]
impl BlockCopier for FakeCopier {
    async fn replicate(&self, local_path: &str, remote_path: &str, size_bytes: u64) -> Result<u64> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        if self.fail_on == Some(index) {
            self.events.push(format!("copy failed {}", local_path));
            return Err(MoveError::TransferError {
                disk: local_path.to_string(),
                reason: "remote writer exited with 1".to_string(),
            });
        }
        self.events
            .push(format!("copy {} -> {}", local_path, remote_path));
        Ok(size_bytes)
    }
}

/// Answers prompts from a script; runs out as "no".
pub struct ScriptedConfirm {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirm {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
    }
}

/// Defaults with fast polling and definitions written under a temp dir.
pub fn test_config(dir: &TempDir) -> MoveConfig {
    let mut config = MoveConfig::default();
    config.definition_dir = dir.path().to_path_buf();
    config.lifecycle.poll_interval_ms = 1;
    config.lifecycle.define_settle_ms = 1;
    config
}
