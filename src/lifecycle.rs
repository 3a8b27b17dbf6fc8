use crate::hypervisor::Hypervisor;
use crate::{MoveError, Result, log_debug, log_info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, Instant, sleep};

/// Shared flag an operator interrupt flips to stop a wait early.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long and how often to poll for a guest to stop.
#[derive(Debug, Clone)]
pub struct ShutdownWait {
    pub interval: Duration,
    /// `None` waits as long as the guest takes
    pub timeout: Option<Duration>,
}

impl Default for ShutdownWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Run-state transitions of guests on one host.
#[derive(Clone)]
pub struct LifecycleController {
    hypervisor: Arc<dyn Hypervisor>,
    wait: ShutdownWait,
    cancel: Cancellation,
}

impl LifecycleController {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, wait: ShutdownWait, cancel: Cancellation) -> Self {
        Self {
            hypervisor,
            wait,
            cancel,
        }
    }

    pub fn host(&self) -> &str {
        self.hypervisor.host()
    }

    pub async fn is_running(&self, guest: &str) -> Result<bool> {
        self.hypervisor.is_running(guest).await
    }

    /// Ask the guest to power off. Does not wait.
    pub async fn shutdown(&self, guest: &str) -> Result<()> {
        self.hypervisor.shutdown(guest).await?;
        log_info!("Guest {} has been asked to shut down", guest);
        Ok(())
    }

    pub async fn wait_until_stopped(&self, guest: &str) -> Result<()> {
        let started = Instant::now();
        while self.hypervisor.is_running(guest).await? {
            if self.cancel.is_cancelled() {
                return Err(MoveError::Cancelled(format!("waiting for {} to stop", guest)));
            }
            if let Some(timeout) = self.wait.timeout {
                if started.elapsed() >= timeout {
                    return Err(MoveError::Timeout {
                        guest: guest.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
            }
            log_debug!("{} still running", guest);
            sleep(self.wait.interval).await;
        }
        log_info!("Guest {} is down", guest);
        Ok(())
    }

    pub async fn shutdown_and_wait(&self, guest: &str) -> Result<()> {
        self.shutdown(guest).await?;
        self.wait_until_stopped(guest).await
    }

    pub async fn start(&self, guest: &str) -> Result<()> {
        self.hypervisor.start(guest).await
    }

    pub async fn force_stop(&self, guest: &str) -> Result<()> {
        self.hypervisor.destroy(guest).await
    }

    pub async fn reboot(&self, guest: &str) -> Result<()> {
        self.hypervisor.reboot(guest).await
    }

    /// Remove the guest's definition from this host.
    pub async fn undefine(&self, guest: &str) -> Result<()> {
        self.hypervisor.undefine(guest).await
    }
}
