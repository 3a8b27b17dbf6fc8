//! Hypervisor control plane.
//!
//! `Virsh` drives libvirt through the `virsh` client on whichever host its
//! runner points at, so the same code controls the local hypervisor and,
//! over the remote channel, the destination.

use crate::runner::{CommandOutput, CommandRunner};
use crate::{MoveError, Result, log_debug, log_info};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Label of the host this hypervisor runs on.
    fn host(&self) -> &str;

    async fn list_guests(&self) -> Result<Vec<String>>;

    /// Current definition document of `guest`.
    async fn definition(&self, guest: &str) -> Result<String>;

    async fn is_running(&self, guest: &str) -> Result<bool>;

    async fn shutdown(&self, guest: &str) -> Result<()>;

    async fn start(&self, guest: &str) -> Result<()>;

    async fn destroy(&self, guest: &str) -> Result<()>;

    async fn reboot(&self, guest: &str) -> Result<()>;

    async fn undefine(&self, guest: &str) -> Result<()>;

    /// Register the definition stored at `path` on this host.
    async fn define(&self, path: &Path) -> Result<()>;

    /// Native live migration to `destination_uri`; the guest is defined
    /// there and undefined here once it completes.
    async fn migrate_live(&self, guest: &str, destination_uri: &str) -> Result<()>;
}

pub struct Virsh<R: ?Sized> {
    runner: Arc<R>,
    uri: String,
}

impl<R: CommandRunner + ?Sized> Virsh<R> {
    pub fn new(runner: Arc<R>, uri: impl Into<String>) -> Self {
        Self {
            runner,
            uri: uri.into(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = vec!["virsh", "-c", self.uri.as_str()];
        argv.extend_from_slice(args);
        self.runner.run(&argv).await
    }

    /// Run a virsh command about `guest`, mapping unknown-domain failures.
    async fn guest_command(&self, args: &[&str], guest: &str) -> Result<String> {
        let output = self.virsh(args).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if is_unknown_domain(&output.stderr) {
            return Err(MoveError::guest_not_found(guest));
        }
        Err(MoveError::Hypervisor {
            host: self.runner.host().to_string(),
            message: format!("virsh {}: {}", args.join(" "), output.stderr.trim()),
        })
    }
}

fn is_unknown_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

#[async_trait]
impl<R: CommandRunner + ?Sized + 'static> Hypervisor for Virsh<R> {
    fn host(&self) -> &str {
        self.runner.host()
    }

    async fn list_guests(&self) -> Result<Vec<String>> {
        let output = self.virsh(&["list", "--all", "--name"]).await?;
        if !output.success() {
            return Err(MoveError::Hypervisor {
                host: self.host().to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_guest_list(&output.stdout))
    }

    async fn definition(&self, guest: &str) -> Result<String> {
        self.guest_command(&["dumpxml", guest], guest).await
    }

    async fn is_running(&self, guest: &str) -> Result<bool> {
        let state = self.guest_command(&["domstate", guest], guest).await?;
        log_debug!("{} on {} is {}", guest, self.host(), state.trim());
        Ok(is_active_state(&state))
    }

    async fn shutdown(&self, guest: &str) -> Result<()> {
        log_info!("Shutting down {} on {}", guest, self.host());
        self.guest_command(&["shutdown", guest], guest).await.map(drop)
    }

    async fn start(&self, guest: &str) -> Result<()> {
        log_info!("Starting {} on {}", guest, self.host());
        self.guest_command(&["start", guest], guest).await.map(drop)
    }

    async fn destroy(&self, guest: &str) -> Result<()> {
        log_info!("Destroying {} on {}", guest, self.host());
        self.guest_command(&["destroy", guest], guest).await.map(drop)
    }

    async fn reboot(&self, guest: &str) -> Result<()> {
        log_info!("Rebooting {} on {}", guest, self.host());
        self.guest_command(&["reboot", guest], guest).await.map(drop)
    }

    async fn undefine(&self, guest: &str) -> Result<()> {
        log_info!("Undefining {} on {}", guest, self.host());
        self.guest_command(&["undefine", guest], guest).await.map(drop)
    }

    async fn define(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        log_info!("Defining {} on {}", path, self.host());
        let output = self.virsh(&["define", path.as_str()]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(MoveError::Hypervisor {
                host: self.host().to_string(),
                message: format!("virsh define {}: {}", path, output.stderr.trim()),
            })
        }
    }

    async fn migrate_live(&self, guest: &str, destination_uri: &str) -> Result<()> {
        log_info!("Live migrating {} to {}", guest, destination_uri);
        let argv = live_migrate_argv(&self.uri, guest, destination_uri);
        let status = self.runner.run_attached(&argv).await?;
        if status == 0 {
            Ok(())
        } else {
            Err(MoveError::Hypervisor {
                host: self.host().to_string(),
                message: format!("virsh migrate exited with {}", status),
            })
        }
    }
}

/// Whether a `domstate` answer means a QEMU process still exists. Paused,
/// suspended and shutting-down guests all count as running.
pub fn is_active_state(state: &str) -> bool {
    !matches!(state.trim(), "shut off" | "crashed")
}

pub fn parse_guest_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Copy storage, define on the destination, undefine here; `--verbose`
/// makes virsh print its progress.
pub fn live_migrate_argv<'a>(uri: &'a str, guest: &'a str, destination: &'a str) -> Vec<&'a str> {
    vec![
        "virsh",
        "-c",
        uri,
        "migrate",
        "--live",
        "--persistent",
        "--undefinesource",
        "--copy-storage-all",
        "--verbose",
        guest,
        destination,
    ]
}
