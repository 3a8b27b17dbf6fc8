//! Raw block replication.
//!
//! The local device is read in fixed-size blocks and fed to a local `zstd`,
//! whose output travels over the remote channel into `zstd -d | dd` on the
//! destination. Writes start at offset zero; there is no resume.

use crate::remote::SshChannel;
use crate::runner::shell_quote;
use crate::{MoveError, Result, log_info, log_warn};
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;

#[async_trait]
pub trait BlockCopier: Send + Sync {
    /// Copy `local_path` onto `remote_path`. `size_bytes` is only used to
    /// report progress. Returns the number of bytes read from the source.
    async fn replicate(&self, local_path: &str, remote_path: &str, size_bytes: u64) -> Result<u64>;
}

/// Percent-step progress over a known total.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    total: u64,
    transferred: u64,
    step: u8,
    next: u8,
}

impl TransferProgress {
    pub fn new(total: u64, step: u8) -> Self {
        Self {
            total,
            transferred: 0,
            step: step.max(1),
            next: step.max(1),
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.transferred.saturating_mul(100) / self.total).min(100) as u8
    }

    /// Account for `bytes` more; returns the percentage when a new step
    /// has been reached.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.transferred += bytes;
        let percent = self.percent();
        if self.total == 0 || percent < self.next {
            return None;
        }
        self.next = (percent / self.step + 1).saturating_mul(self.step);
        Some(percent)
    }
}

/// Copy `reader` into `writer` one block at a time.
pub fn pump<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    block_size: usize,
    progress: &mut TransferProgress,
    label: &str,
) -> io::Result<u64> {
    let mut block = vec![0u8; block_size];
    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&block[..read])?;
        if let Some(percent) = progress.advance(read as u64) {
            log_info!("{}: {}% ({}B)", label, percent, progress.transferred());
        }
    }
    writer.flush()?;
    Ok(progress.transferred())
}

/// `dd` from the source, `zstd` in transit, `dd` at the destination.
pub struct ZstdPipeline {
    channel: Arc<SshChannel>,
    block_size: usize,
    level: u8,
}

impl ZstdPipeline {
    pub fn new(channel: Arc<SshChannel>, block_size: usize, level: u8) -> Self {
        Self {
            channel,
            block_size,
            level,
        }
    }

    pub fn compressor_argv(level: u8) -> Vec<String> {
        vec!["zstd".to_string(), format!("-{}", level), "-q".to_string(), "-c".to_string()]
    }

    /// Shell command run on the destination to unpack and write the stream.
    pub fn receiver_command(remote_path: &str, block_size: usize) -> String {
        format!("zstd -d | dd of={} bs={}", shell_quote(remote_path), block_size)
    }

    fn run(
        channel: &SshChannel,
        local_path: &str,
        remote_path: &str,
        size_bytes: u64,
        block_size: usize,
        level: u8,
    ) -> Result<u64> {
        let failed = |reason: String| MoveError::TransferError {
            disk: local_path.to_string(),
            reason,
        };

        let mut source =
            File::open(local_path).map_err(|e| failed(format!("opening source: {}", e)))?;

        let argv = Self::compressor_argv(level);
        let mut compressor = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("starting zstd: {}", e)))?;

        let compressed = compressor
            .stdout
            .take()
            .ok_or_else(|| failed("zstd has no stdout".to_string()))?;
        let receiver = channel.pipe_command(
            &Self::receiver_command(remote_path, block_size),
            Stdio::from(compressed),
        )?;

        let mut progress = TransferProgress::new(size_bytes, 5);
        let pumped = match compressor.stdin.take() {
            Some(mut stdin) => pump(&mut source, &mut stdin, block_size, &mut progress, local_path),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "zstd has no stdin")),
        };

        // stdin is closed at this point, so both ends can drain and exit
        let compressor = compressor
            .wait_with_output()
            .map_err(|e| failed(format!("waiting for zstd: {}", e)))?;
        let receiver = receiver
            .wait_with_output()
            .map_err(|e| failed(format!("waiting for remote writer: {}", e)))?;

        if !receiver.status.success() {
            return Err(failed(format!(
                "remote writer exited with {}: {}",
                receiver.status,
                String::from_utf8_lossy(&receiver.stderr).trim()
            )));
        }
        if !compressor.status.success() {
            return Err(failed(format!(
                "zstd exited with {}: {}",
                compressor.status,
                String::from_utf8_lossy(&compressor.stderr).trim()
            )));
        }
        let copied = pumped.map_err(|e| failed(format!("reading source: {}", e)))?;

        if copied != size_bytes {
            log_warn!("{}: copied {}B, expected {}B", local_path, copied, size_bytes);
        }
        Ok(copied)
    }
}

#[async_trait]
impl BlockCopier for ZstdPipeline {
    async fn replicate(&self, local_path: &str, remote_path: &str, size_bytes: u64) -> Result<u64> {
        log_info!("Copying {}", local_path);
        let channel = self.channel.clone();
        let local = local_path.to_string();
        let remote = remote_path.to_string();
        let (block_size, level) = (self.block_size, self.level);

        tokio::task::spawn_blocking(move || {
            Self::run(&channel, &local, &remote, size_bytes, block_size, level)
        })
        .await
        .map_err(|e| MoveError::TransferError {
            disk: local_path.to_string(),
            reason: e.to_string(),
        })?
    }
}
