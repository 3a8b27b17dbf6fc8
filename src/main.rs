use clap::{Args, Parser, Subcommand};
use kvmove::{
    MoveError, Result,
    config::{DEFAULT_CONFIG_PATH, MoveConfig},
    confirm::{AssumeYes, Confirm, ConsolePrompt},
    guest::{Guest, human_bytes},
    hypervisor::{Hypervisor, Virsh},
    inventory::{Inventory, InventoryBuilder},
    lifecycle::{Cancellation, LifecycleController, ShutdownWait},
    logger,
    migration::MigrationManager,
    remote::SshChannel,
    replicate::ZstdPipeline,
    runner::LocalRunner,
    storage::{LvmBackend, StorageAdapter},
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kvmove")]
#[command(about = "Move KVM guests and their disks to another host")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a guest to the remote host
    Move(MoveArgs),
    /// Start a stopped guest
    Start {
        /// Guest name
        guest: String,
    },
    /// Gracefully shut a guest down
    #[command(alias = "shutdown")]
    Stop {
        /// Guest name
        guest: String,
        /// Return as soon as the shutdown has been requested
        #[arg(long)]
        no_wait: bool,
    },
    /// Reboot a running guest
    Reboot {
        /// Guest name
        guest: String,
    },
    /// Force a running guest off
    #[command(alias = "destroy")]
    Crash {
        /// Guest name
        guest: String,
    },
    /// List guests with their disks
    #[command(alias = "ls")]
    List,
    /// Undefine a stopped guest; its volumes are kept
    #[command(alias = "rm")]
    Delete {
        /// Guest name
        guest: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct MoveArgs {
    /// Guest name
    guest: String,
    /// Shut the guest down, copy its disks, start it on the remote host
    #[arg(long, conflicts_with = "live", required_unless_present = "live")]
    offline: bool,
    /// Use the hypervisor's native live migration
    #[arg(long)]
    live: bool,
    /// Do not ring the terminal bell when done
    #[arg(long)]
    disable_bell: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "kvmove=debug");
        }
    }
    logger::init_logger();

    if let Err(e) = run(cli).await {
        logger::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = MoveConfig::load_or_default(&cli.config)?;

    let cancel = Cancellation::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger::warn!("Interrupted, stopping at the next checkpoint");
            on_interrupt.cancel();
        }
    });

    let local_runner = Arc::new(LocalRunner::new());
    let local: Arc<dyn Hypervisor> =
        Arc::new(Virsh::new(local_runner.clone(), config.libvirt_uri.clone()));
    let storage = StorageAdapter::new(LvmBackend::new(
        config.volume_group.clone(),
        config.lvm_extent_bytes,
    ));
    let lifecycle = LifecycleController::new(
        local.clone(),
        ShutdownWait {
            interval: config.poll_interval(),
            timeout: config.shutdown_timeout(),
        },
        cancel.clone(),
    );

    match cli.command {
        Commands::Move(args) => {
            let channel = Arc::new(SshChannel::open(&config.remote).await?);

            let inventory = InventoryBuilder::new(local.as_ref(), &storage, local_runner.as_ref())
                .build()
                .await?;
            let guest = inventory
                .get(&args.guest)
                .cloned()
                .ok_or_else(|| MoveError::guest_not_found(&args.guest))?;
            print_guest(&guest, None);

            let copier = Arc::new(ZstdPipeline::new(
                channel.clone(),
                config.transfer.block_size,
                config.transfer.zstd_level,
            ));
            let manager = MigrationManager::new(
                &config,
                local.clone(),
                channel,
                copier,
                Arc::new(ConsolePrompt),
                cancel,
            );

            let outcome = if args.live {
                manager.migrate_live(guest).await
            } else {
                manager.migrate_offline(guest).await
            };
            if !args.disable_bell {
                print!("\x07");
                io::stdout().flush().ok();
            }
            let plan = outcome?;
            println!("Guest '{}' is now on {}", plan.guest_name(), plan.destination);
        }
        Commands::Start { guest } => {
            if lifecycle.is_running(&guest).await? {
                return Err(already(&guest, "running"));
            }
            lifecycle.start(&guest).await?;
            println!("Guest '{}' started", guest);
        }
        Commands::Stop { guest, no_wait } => {
            if !lifecycle.is_running(&guest).await? {
                return Err(already(&guest, "stopped"));
            }
            if no_wait {
                lifecycle.shutdown(&guest).await?;
                println!("Guest '{}' is shutting down", guest);
            } else {
                lifecycle.shutdown_and_wait(&guest).await?;
                println!("Guest '{}' stopped", guest);
            }
        }
        Commands::Reboot { guest } => {
            require_running(&lifecycle, &guest).await?;
            lifecycle.reboot(&guest).await?;
            println!("Guest '{}' is rebooting", guest);
        }
        Commands::Crash { guest } => {
            require_running(&lifecycle, &guest).await?;
            lifecycle.force_stop(&guest).await?;
            println!("Guest '{}' forced off", guest);
        }
        Commands::List => {
            let inventory = InventoryBuilder::new(local.as_ref(), &storage, local_runner.as_ref())
                .build()
                .await?;
            print_inventory(&inventory, &lifecycle).await?;
        }
        Commands::Delete { guest, yes } => {
            if lifecycle.is_running(&guest).await? {
                return Err(already(&guest, "running"));
            }
            let confirm: Box<dyn Confirm> = if yes {
                Box::new(AssumeYes)
            } else {
                Box::new(ConsolePrompt)
            };
            if !confirm.confirm(&format!("Undefine guest {}? Its volumes are kept.", guest))? {
                return Err(MoveError::Declined(format!("deleting {}", guest)));
            }
            lifecycle.undefine(&guest).await?;
            println!("Guest '{}' undefined", guest);
        }
    }

    Ok(())
}

fn already(guest: &str, state: &str) -> MoveError {
    MoveError::PreconditionViolation {
        guest: guest.to_string(),
        reason: format!("is already {}", state),
    }
}

async fn require_running(lifecycle: &LifecycleController, guest: &str) -> Result<()> {
    if lifecycle.is_running(guest).await? {
        Ok(())
    } else {
        Err(MoveError::PreconditionViolation {
            guest: guest.to_string(),
            reason: "is not running".to_string(),
        })
    }
}

async fn print_inventory(inventory: &Inventory, lifecycle: &LifecycleController) -> Result<()> {
    if inventory.is_empty() {
        println!("No guests defined on {}", lifecycle.host());
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<6} {:<10} {:<6} {}",
        "NAME", "STATE", "VCPU", "RAM", "VNC", "DISKS"
    );
    println!("{}", "=".repeat(80));
    for guest in inventory.values() {
        let running = lifecycle.is_running(&guest.name).await?;
        print_guest(guest, Some(running));
    }
    Ok(())
}

fn print_guest(guest: &Guest, running: Option<bool>) {
    let state = match running {
        Some(true) => "running",
        Some(false) => "stopped",
        None => "-",
    };
    let vnc = guest
        .vnc_port
        .map(|port| port.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!(
        "{:<20} {:<10} {:<6} {:<10} {:<6} {}",
        guest.name,
        state,
        guest.vcpus,
        human_bytes(guest.memory_bytes),
        vnc,
        human_bytes(guest.total_disk_bytes())
    );
    for disk in &guest.disks {
        println!(
            "    {} ({}) {}",
            disk.path,
            disk.backend,
            human_bytes(disk.size_bytes)
        );
    }
}
