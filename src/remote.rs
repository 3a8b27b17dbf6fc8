//! The remote execution channel.
//!
//! One SSH master connection is opened per invocation and every later
//! command, file copy and transfer pipe is multiplexed over its control
//! socket. The socket is torn down when the channel is dropped.

use crate::config::RemoteConfig;
use crate::runner::{CommandOutput, CommandRunner, command_line};
use crate::{MoveError, Result, log_debug, log_error, log_info};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Command execution plus file delivery on the destination host.
#[async_trait]
pub trait RemoteChannel: CommandRunner {
    /// Copy `local` to `remote` on the peer.
    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()>;
}

pub struct SshChannel {
    host: String,
    destination: String,
    control_path: PathBuf,
    connect_timeout: Duration,
}

impl SshChannel {
    /// Authenticate to the peer and keep the master connection open.
    pub async fn open(config: &RemoteConfig) -> Result<Self> {
        let channel = Self {
            host: config.host.clone(),
            destination: format!("{}@{}", config.user, config.host),
            control_path: config
                .control_dir
                .join(format!("kvmove-{}.sock", uuid::Uuid::new_v4().simple())),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        };

        log_info!("Connecting to {}", channel.destination);

        // The backgrounded master keeps any inherited pipe open, so nothing
        // is captured from it.
        let mut master = Command::new("ssh");
        master
            .args(["-M", "-f", "-N", "-o", "ControlPersist=yes"])
            .args(channel.options())
            .arg(&channel.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let budget = channel.connect_timeout + Duration::from_secs(2);
        let child = master
            .spawn()
            .map_err(|e| channel.unreachable(&e.to_string()))?;
        let status = wait_or_kill(child, budget)
            .await
            .map_err(|e| channel.unreachable(&e.to_string()))?
            .ok_or_else(|| channel.unreachable("connection timed out"))?;

        if !status.success() {
            log_error!("NOPE, I can't ssh into {}", channel.destination);
            return Err(channel.unreachable(&format!("ssh exited with {}", status)));
        }

        let check = channel.run(&["true"]).await?;
        if !check.success() {
            return Err(channel.unreachable(check.stderr.trim()));
        }

        log_debug!("Control socket at {}", channel.control_path.display());
        Ok(channel)
    }

    fn unreachable(&self, reason: &str) -> MoveError {
        MoveError::Unreachable {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    fn options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options())
            .arg(&self.destination)
            .arg(remote_command)
            .stdin(Stdio::null());
        cmd
    }

    /// Start `remote_command` on the peer reading from `stdin`. Used as the
    /// far end of the replication pipeline.
    pub fn pipe_command(&self, remote_command: &str, stdin: Stdio) -> Result<std::process::Child> {
        log_debug!("{}: {}", self.host, remote_command);
        std::process::Command::new("ssh")
            .args(self.options())
            .arg(&self.destination)
            .arg(remote_command)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unreachable(&e.to_string()))
    }
}

#[async_trait]
impl CommandRunner for SshChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let line = command_line(argv);
        log_debug!("{}: {}", self.host, line);
        let output = self
            .ssh(&line)
            .output()
            .await
            .map_err(|e| self.unreachable(&e.to_string()))?;

        // ssh reports its own failures with 255
        let status = output.status.code().unwrap_or(-1);
        if status == 255 {
            return Err(self.unreachable(String::from_utf8_lossy(&output.stderr).trim()));
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_attached(&self, argv: &[&str]) -> Result<i32> {
        let status = self
            .ssh(&command_line(argv))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| self.unreachable(&e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn put_file(&self, local: &Path, remote: &Path) -> Result<()> {
        log_info!("Copying {} to {}:{}", local.display(), self.host, remote.display());
        let output = Command::new("scp")
            .arg("-q")
            .args(self.options())
            .arg(local)
            .arg(format!("{}:{}", self.destination, remote.display()))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.unreachable(&e.to_string()))?;

        if !output.status.success() {
            return Err(MoveError::CommandFailed {
                host: self.host.clone(),
                command: format!("scp {}", local.display()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Wait for `child` at most `budget`; past it the child is killed and
/// reaped and `None` is returned.
async fn wait_or_kill(mut child: Child, budget: Duration) -> std::io::Result<Option<ExitStatus>> {
    match tokio::time::timeout(budget, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_) => {
            child.kill().await?;
            Ok(None)
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        let _ = std::process::Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
