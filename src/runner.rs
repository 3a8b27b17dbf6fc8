use crate::{MoveError, Result, log_debug};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Somewhere commands can be executed: the local host or the remote peer.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Label used in logs and errors.
    fn host(&self) -> &str;

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Run with stdout and stderr attached to the operator's terminal,
    /// returning the exit status.
    async fn run_attached(&self, argv: &[&str]) -> Result<i32>;
}

/// Run `argv` and return its stdout, failing on a non-zero exit.
pub async fn run_checked<R>(runner: &R, argv: &[&str]) -> Result<String>
where
    R: CommandRunner + ?Sized,
{
    let output = runner.run(argv).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(MoveError::CommandFailed {
            host: runner.host().to_string(),
            command: argv.join(" "),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Join `argv` into one shell command line.
pub fn command_line(argv: &[&str]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands on this machine.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    label: String,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            label: "local".to_string(),
        }
    }

    fn command(argv: &[&str]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| MoveError::Config("empty command line".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        Ok(cmd)
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn host(&self) -> &str {
        &self.label
    }

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        log_debug!("local: {}", command_line(argv));
        let output = Self::command(argv)?
            .output()
            .await
            .map_err(|e| MoveError::CommandFailed {
                host: self.label.clone(),
                command: argv.join(" "),
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_attached(&self, argv: &[&str]) -> Result<i32> {
        log_debug!("local (attached): {}", command_line(argv));
        let status = Self::command(argv)?
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| MoveError::CommandFailed {
                host: self.label.clone(),
                command: argv.join(" "),
                stderr: e.to_string(),
            })?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("/dev/ubuntu-vg/db1"), "/dev/ubuntu-vg/db1");
        assert_eq!(shell_quote("-L10737418240B"), "-L10737418240B");
        assert_eq!(shell_quote("my disk"), "'my disk'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn joins_command_line() {
        assert_eq!(
            command_line(&["virsh", "define", "/root/web 2.xml"]),
            "virsh define '/root/web 2.xml'"
        );
    }

    #[tokio::test]
    async fn local_runner_captures_output_and_status() {
        let runner = LocalRunner::new();
        let ok = runner.run(&["sh", "-c", "echo hello; echo oops >&2"]).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");
        assert_eq!(ok.stderr.trim(), "oops");

        let failed = runner.run(&["sh", "-c", "exit 5"]).await.unwrap();
        assert_eq!(failed.status, 5);

        let err = run_checked(&runner, &["sh", "-c", "echo broken >&2; exit 1"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let runner = LocalRunner::new();
        assert!(runner.run(&["kvmove-no-such-binary"]).await.is_err());
        assert!(runner.run(&[]).await.is_err());
    }
}
