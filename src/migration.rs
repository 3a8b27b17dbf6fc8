//! Migration orchestrator.
//!
//! An offline move walks `MigrationState` forward one transition at a time:
//!
//! ```text
//! Planning -> CapacityChecked -> Quiesced -> Replicated
//!          -> DefinitionTransferred -> Resumed -> SourceRetired
//! ```
//!
//! Any failing transition yields `Aborted`, which keeps the plan and the
//! phase it failed in. Nothing already done on the destination is undone.

use crate::config::MoveConfig;
use crate::confirm::Confirm;
use crate::definition::DefinitionTransport;
use crate::guest::{DiskPair, Guest, MigrationPlan, human_bytes};
use crate::hypervisor::{Hypervisor, Virsh};
use crate::lifecycle::{Cancellation, LifecycleController, ShutdownWait};
use crate::reconcile::CapacityReconciler;
use crate::remote::RemoteChannel;
use crate::replicate::BlockCopier;
use crate::storage::{LvmBackend, StorageAdapter};
use crate::{MoveError, Result, log_error, log_info, log_warn};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    CapacityChecked,
    Quiesced,
    Replicated,
    DefinitionTransferred,
    Resumed,
    SourceRetired,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Planning => "planning",
            Phase::CapacityChecked => "capacity checked",
            Phase::Quiesced => "quiesced",
            Phase::Replicated => "replicated",
            Phase::DefinitionTransferred => "definition transferred",
            Phase::Resumed => "resumed",
            Phase::SourceRetired => "source retired",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum MigrationState {
    Planning(MigrationPlan),
    CapacityChecked(MigrationPlan),
    Quiesced(MigrationPlan),
    Replicated(MigrationPlan),
    DefinitionTransferred(MigrationPlan),
    Resumed(MigrationPlan),
    SourceRetired(MigrationPlan),
    Aborted {
        /// Last phase reached before the failure
        phase: Phase,
        plan: MigrationPlan,
        error: MoveError,
    },
}

impl MigrationState {
    /// Phase reached so far; for `Aborted`, the phase it failed to leave.
    pub fn phase(&self) -> Phase {
        match self {
            MigrationState::Planning(_) => Phase::Planning,
            MigrationState::CapacityChecked(_) => Phase::CapacityChecked,
            MigrationState::Quiesced(_) => Phase::Quiesced,
            MigrationState::Replicated(_) => Phase::Replicated,
            MigrationState::DefinitionTransferred(_) => Phase::DefinitionTransferred,
            MigrationState::Resumed(_) => Phase::Resumed,
            MigrationState::SourceRetired(_) => Phase::SourceRetired,
            MigrationState::Aborted { phase, .. } => *phase,
        }
    }

    pub fn plan(&self) -> &MigrationPlan {
        match self {
            MigrationState::Planning(plan)
            | MigrationState::CapacityChecked(plan)
            | MigrationState::Quiesced(plan)
            | MigrationState::Replicated(plan)
            | MigrationState::DefinitionTransferred(plan)
            | MigrationState::Resumed(plan)
            | MigrationState::SourceRetired(plan) => plan,
            MigrationState::Aborted { plan, .. } => plan,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::SourceRetired(_) | MigrationState::Aborted { .. }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, MigrationState::Aborted { .. })
    }
}

/// Composes the reconciler, lifecycle controllers, replicator and
/// definition transport into the migration protocol.
pub struct MigrationManager {
    destination: String,
    live_destination_uri: String,
    channel: Arc<dyn RemoteChannel>,
    storage: StorageAdapter,
    confirm: Arc<dyn Confirm>,
    copier: Arc<dyn BlockCopier>,
    source: LifecycleController,
    target: LifecycleController,
    local_hypervisor: Arc<dyn Hypervisor>,
    definitions: DefinitionTransport,
    cancel: Cancellation,
}

impl MigrationManager {
    pub fn new(
        config: &MoveConfig,
        local_hypervisor: Arc<dyn Hypervisor>,
        channel: Arc<dyn RemoteChannel>,
        copier: Arc<dyn BlockCopier>,
        confirm: Arc<dyn Confirm>,
        cancel: Cancellation,
    ) -> Self {
        let remote_hypervisor: Arc<dyn Hypervisor> =
            Arc::new(Virsh::new(channel.clone(), config.remote.libvirt_uri.clone()));
        let wait = ShutdownWait {
            interval: config.poll_interval(),
            timeout: config.shutdown_timeout(),
        };

        Self {
            destination: config.remote.host.clone(),
            live_destination_uri: config.live_destination_uri(),
            storage: StorageAdapter::new(LvmBackend::new(
                config.volume_group.clone(),
                config.lvm_extent_bytes,
            )),
            confirm,
            copier,
            source: LifecycleController::new(local_hypervisor.clone(), wait.clone(), cancel.clone()),
            target: LifecycleController::new(remote_hypervisor.clone(), wait, cancel.clone()),
            definitions: DefinitionTransport::new(
                local_hypervisor.clone(),
                remote_hypervisor,
                channel.clone(),
                config.definition_dir.clone(),
                config.define_settle(),
            ),
            local_hypervisor,
            channel,
            cancel,
        }
    }

    pub fn plan(&self, guest: Guest) -> MigrationPlan {
        MigrationPlan::new(guest, self.destination.clone())
    }

    /// Move `guest` with the offline protocol. Returns the finished plan.
    pub async fn migrate_offline(&self, guest: Guest) -> Result<MigrationPlan> {
        log_info!("Moving {} to {}", guest.name, self.destination);
        let mut state = MigrationState::Planning(self.plan(guest));

        while !state.is_terminal() {
            state = self.advance(state).await;
            log_info!("{}: {}", state.plan().guest_name(), state.phase());
        }

        match state {
            MigrationState::SourceRetired(plan) => {
                let elapsed = chrono::Utc::now().signed_duration_since(plan.started_at);
                log_info!(
                    "{} moved to {} in {}s",
                    plan.guest_name(),
                    plan.destination,
                    elapsed.num_seconds()
                );
                Ok(plan)
            }
            MigrationState::Aborted { phase, plan, error } => {
                report_abort(phase, &plan, &error);
                Err(error)
            }
            _ => unreachable!("loop exits on terminal states only"),
        }
    }

    /// Capacity check, then hand everything else to the hypervisor's
    /// native live migration.
    pub async fn migrate_live(&self, guest: Guest) -> Result<MigrationPlan> {
        log_info!("Live moving {} to {}", guest.name, self.destination);
        if !self.source.is_running(&guest.name).await? {
            return Err(MoveError::PreconditionViolation {
                guest: guest.name,
                reason: "is not running, a live move needs a running guest".to_string(),
            });
        }
        let state = self.advance(MigrationState::Planning(self.plan(guest))).await;

        let plan = match state {
            MigrationState::CapacityChecked(plan) => plan,
            MigrationState::Aborted { phase, plan, error } => {
                report_abort(phase, &plan, &error);
                return Err(error);
            }
            other => unreachable!("planning cannot advance to {}", other.phase()),
        };

        self.local_hypervisor
            .migrate_live(plan.guest_name(), &self.live_destination_uri)
            .await?;
        log_info!("{} is now on {}", plan.guest_name(), plan.destination);
        Ok(plan)
    }

    /// Take one forward transition.
    pub async fn advance(&self, state: MigrationState) -> MigrationState {
        match state {
            MigrationState::Planning(mut plan) => {
                let result = self.check_capacity(&mut plan).await;
                settle(Phase::Planning, plan, result, MigrationState::CapacityChecked)
            }
            MigrationState::CapacityChecked(mut plan) => {
                let result = self.quiesce(&mut plan).await;
                settle(Phase::CapacityChecked, plan, result, MigrationState::Quiesced)
            }
            MigrationState::Quiesced(mut plan) => {
                let result = self.replicate(&mut plan).await;
                settle(Phase::Quiesced, plan, result, MigrationState::Replicated)
            }
            MigrationState::Replicated(mut plan) => {
                let result = self.transfer_definition(&mut plan).await;
                settle(
                    Phase::Replicated,
                    plan,
                    result,
                    MigrationState::DefinitionTransferred,
                )
            }
            MigrationState::DefinitionTransferred(mut plan) => {
                let result = self.resume(&mut plan).await;
                settle(
                    Phase::DefinitionTransferred,
                    plan,
                    result,
                    MigrationState::Resumed,
                )
            }
            MigrationState::Resumed(mut plan) => {
                let result = self.retire_source(&mut plan).await;
                settle(Phase::Resumed, plan, result, MigrationState::SourceRetired)
            }
            terminal => terminal,
        }
    }

    /// Every disk gets an equal-size counterpart on the destination.
    async fn check_capacity(&self, plan: &mut MigrationPlan) -> Result<()> {
        let reconciler = CapacityReconciler::new(&self.storage, self.confirm.as_ref());
        plan.disk_pairs.clear();

        for disk in &plan.guest.disks {
            if !disk.is_known() {
                return Err(MoveError::volume_not_found(format!(
                    "{} (of guest {})",
                    disk.path, plan.guest.name
                )));
            }
            let remote = reconciler
                .reconcile(self.channel.as_ref(), disk, disk.size_bytes)
                .await?;
            plan.disk_pairs.push(DiskPair {
                local: disk.clone(),
                remote,
            });
        }
        Ok(())
    }

    /// Record whether the guest runs, then make sure it does not.
    async fn quiesce(&self, plan: &mut MigrationPlan) -> Result<()> {
        let guest = plan.guest.name.clone();
        let running = self.source.is_running(&guest).await?;
        plan.was_running = Some(running);

        if running {
            log_info!("Guest is running, shutting it down");
            self.source.shutdown_and_wait(&guest).await
        } else {
            let prompt = format!("Guest {} is not running, continue with the move?", guest);
            if self.confirm.confirm(&prompt)? {
                Ok(())
            } else {
                Err(MoveError::Declined(format!("moving stopped guest {}", guest)))
            }
        }
    }

    /// Copy disks one after the other.
    async fn replicate(&self, plan: &mut MigrationPlan) -> Result<()> {
        let total = plan.disk_pairs.len();
        for (index, pair) in plan.disk_pairs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(MoveError::Cancelled(format!(
                    "replicating disk {} of {}",
                    index + 1,
                    total
                )));
            }
            log_info!(
                "Disk {}/{}: {} ({})",
                index + 1,
                total,
                pair.local.path,
                human_bytes(pair.local.size_bytes)
            );
            self.copier
                .replicate(&pair.local.path, &pair.remote.path, pair.local.size_bytes)
                .await?;
        }
        Ok(())
    }

    async fn transfer_definition(&self, plan: &mut MigrationPlan) -> Result<()> {
        let path = self.definitions.transfer(&plan.guest.name).await?;
        plan.definition_path = Some(path);
        Ok(())
    }

    /// Start on the destination only if the guest ran before the move.
    async fn resume(&self, plan: &mut MigrationPlan) -> Result<()> {
        let guest = plan.guest.name.as_str();
        if self.source.is_running(guest).await? {
            return Err(MoveError::PreconditionViolation {
                guest: guest.to_string(),
                reason: format!("is running again on {}", self.source.host()),
            });
        }

        match plan.was_running {
            Some(true) => {
                log_info!("Starting {} on remote", guest);
                self.target.start(guest).await
            }
            _ => {
                log_info!("{} was not running, leaving it stopped on remote", guest);
                Ok(())
            }
        }
    }

    async fn retire_source(&self, plan: &mut MigrationPlan) -> Result<()> {
        log_info!("Undefining {} on local", plan.guest.name);
        self.source.undefine(&plan.guest.name).await
    }
}

fn settle(
    phase: Phase,
    plan: MigrationPlan,
    result: Result<()>,
    next: fn(MigrationPlan) -> MigrationState,
) -> MigrationState {
    match result {
        Ok(()) => next(plan),
        Err(error) => MigrationState::Aborted { phase, plan, error },
    }
}

/// Tell the operator what is left behind after an abort.
fn report_abort(phase: Phase, plan: &MigrationPlan, error: &MoveError) {
    log_error!(
        "Moving {} aborted after '{}': {}",
        plan.guest_name(),
        phase,
        error
    );
    match phase {
        Phase::Planning => {
            log_warn!("Volumes created on {} so far are left in place", plan.destination);
        }
        Phase::CapacityChecked => {
            if plan.was_running == Some(true) {
                log_warn!("{} may be shutting down on local, check its state", plan.guest_name());
            }
        }
        Phase::Quiesced => {
            log_warn!(
                "{} is stopped on local; volumes on {} may be partially written and will be overwritten by a retry",
                plan.guest_name(),
                plan.destination
            );
        }
        Phase::Replicated => {
            log_warn!(
                "Disks are copied but {} is not defined on {}; it is still defined on local",
                plan.guest_name(),
                plan.destination
            );
        }
        Phase::DefinitionTransferred | Phase::Resumed => {
            log_warn!(
                "{} is defined on both hosts, undefine one of them by hand",
                plan.guest_name()
            );
        }
        Phase::SourceRetired => {}
    }
}
