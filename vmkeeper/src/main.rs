mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use vmkeeper::events::EventHub;
use vmkeeper::machine::aggregates::{SlotKey, StorageBus};
use vmkeeper::registry::Registry;
use vmkeeper::storage::medium::MediumType;

#[derive(Parser)]
#[command(name = "vmkeeper", about = "Per-VM configuration store and session manager")]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a machine with default settings.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "Other")]
        ostype: String,
        /// Folder holding the machine directory (default: server.machines_dir).
        #[arg(long)]
        basefolder: Option<PathBuf>,
        /// Register the machine right away.
        #[arg(long)]
        register: bool,
    },
    /// Register an existing settings file.
    Register { settings_file: PathBuf },
    /// List registered machines.
    List,
    /// Show the configuration of a machine.
    Show { machine: String },
    /// Change identity and hardware settings.
    Modify {
        machine: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory size in MB.
        #[arg(long)]
        memory: Option<u32>,
    },
    /// Add or remove a storage controller.
    Storagectl {
        machine: String,
        #[arg(long)]
        name: String,
        /// Bus of the new controller.
        #[arg(long, conflicts_with = "remove")]
        add: Option<BusArg>,
        #[arg(long)]
        remove: bool,
    },
    /// Create a base hard disk image and register it.
    Createmedium {
        #[arg(long)]
        filename: PathBuf,
        /// Logical size in MB.
        #[arg(long)]
        size: u64,
        #[arg(long, value_enum, default_value = "normal")]
        variant: MediumTypeArg,
    },
    /// Attach a medium to a controller slot.
    Attach {
        machine: String,
        #[arg(long)]
        storagectl: String,
        #[arg(long, default_value = "0")]
        port: u32,
        #[arg(long, default_value = "0")]
        device: u32,
        #[arg(long, value_enum, default_value = "hdd")]
        r#type: DeviceArg,
        /// Medium UUID or location; "emptydrive" leaves a DVD/floppy slot empty.
        #[arg(long)]
        medium: String,
    },
    /// Detach whatever occupies a controller slot.
    Detach {
        machine: String,
        #[arg(long)]
        storagectl: String,
        #[arg(long, default_value = "0")]
        port: u32,
        #[arg(long, default_value = "0")]
        device: u32,
    },
    /// Insert a medium into a DVD or floppy drive.
    Mount {
        machine: String,
        #[arg(long)]
        storagectl: String,
        #[arg(long, default_value = "0")]
        port: u32,
        #[arg(long, default_value = "0")]
        device: u32,
        /// Medium UUID or image location.
        #[arg(long)]
        medium: String,
        /// Eject even if the guest holds the drive locked.
        #[arg(long)]
        force: bool,
    },
    /// Eject the medium from a DVD or floppy drive.
    Unmount {
        machine: String,
        #[arg(long)]
        storagectl: String,
        #[arg(long, default_value = "0")]
        port: u32,
        #[arg(long, default_value = "0")]
        device: u32,
        #[arg(long)]
        force: bool,
    },
    /// Take, restore or delete snapshots of a machine that is not running.
    Snapshot {
        machine: String,
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Launch a front-end for a machine and hand it a VM session.
    Startvm {
        machine: String,
        /// Front-end type (default: session.default_frontend).
        #[arg(long, default_value = "")]
        r#type: String,
        /// Control socket the front-end listens on.
        #[arg(long)]
        socket: PathBuf,
    },
    /// Unregister a machine.
    Unregister {
        machine: String,
        /// Detach all media and delete the settings file.
        #[arg(long)]
        delete: bool,
    },
    /// Verify configuration, registry and machine accessibility.
    Check,
    /// Run the session watcher and log machine events until interrupted.
    Serve,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Snapshot the current state.
    Take {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Return to a snapshot, discarding the current state.
    Restore { snapshot: String },
    /// Delete a snapshot; its children move up to its parent.
    Delete { snapshot: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum BusArg {
    Ide,
    Sata,
    Scsi,
    Floppy,
    Sas,
    Usb,
    Pcie,
    Virtio,
}

impl From<BusArg> for StorageBus {
    fn from(b: BusArg) -> Self {
        match b {
            BusArg::Ide => StorageBus::Ide,
            BusArg::Sata => StorageBus::Sata,
            BusArg::Scsi => StorageBus::Scsi,
            BusArg::Floppy => StorageBus::Floppy,
            BusArg::Sas => StorageBus::Sas,
            BusArg::Usb => StorageBus::Usb,
            BusArg::Pcie => StorageBus::PciExpress,
            BusArg::Virtio => StorageBus::VirtioScsi,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MediumTypeArg {
    Normal,
    Immutable,
    Shareable,
}

impl From<MediumTypeArg> for MediumType {
    fn from(t: MediumTypeArg) -> Self {
        match t {
            MediumTypeArg::Normal => MediumType::Normal,
            MediumTypeArg::Immutable => MediumType::Immutable,
            MediumTypeArg::Shareable => MediumType::Shareable,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Hdd,
    Dvd,
    Fdd,
}

impl From<DeviceArg> for vmkeeper_protocol::DeviceType {
    fn from(d: DeviceArg) -> Self {
        match d {
            DeviceArg::Hdd => Self::HardDisk,
            DeviceArg::Dvd => Self::Dvd,
            DeviceArg::Fdd => Self::Floppy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config)?;

    match cli.command {
        Commands::Check => cli::run_check(&config).await,
        command => {
            let events = Arc::new(EventHub::new());
            let registry = cli::open_registry(config, events.clone()).await?;
            run(command, registry, events).await
        }
    }
}

async fn run(command: Commands, registry: Arc<Registry>, events: Arc<EventHub>) -> Result<()> {
    match command {
        Commands::Create {
            name,
            ostype,
            basefolder,
            register,
        } => cli::run_create(&registry, &name, &ostype, basefolder.as_deref(), register).await,
        Commands::Register { settings_file } => cli::run_register(&registry, &settings_file).await,
        Commands::List => cli::run_list(&registry).await,
        Commands::Show { machine } => cli::run_show(&registry, &machine).await,
        Commands::Modify {
            machine,
            name,
            description,
            cpus,
            memory,
        } => {
            let changes = cli::Modify {
                name,
                description,
                cpus,
                memory_mb: memory,
            };
            cli::run_modify(&registry, &machine, changes).await
        }
        Commands::Storagectl {
            machine,
            name,
            add,
            remove,
        } => match (add, remove) {
            (Some(bus), false) => cli::run_storagectl_add(&registry, &machine, &name, bus.into()).await,
            (None, true) => cli::run_storagectl_remove(&registry, &machine, &name).await,
            _ => anyhow::bail!("storagectl needs exactly one of --add <bus> or --remove"),
        },
        Commands::Createmedium {
            filename,
            size,
            variant,
        } => cli::run_createmedium(&registry, filename, size, variant.into()).await,
        Commands::Attach {
            machine,
            storagectl,
            port,
            device,
            r#type,
            medium,
        } => {
            let slot = SlotKey::new(storagectl, port, device);
            cli::run_attach(&registry, &machine, slot, r#type.into(), &medium).await
        }
        Commands::Detach {
            machine,
            storagectl,
            port,
            device,
        } => {
            let slot = SlotKey::new(storagectl, port, device);
            cli::run_detach(&registry, &machine, slot).await
        }
        Commands::Mount {
            machine,
            storagectl,
            port,
            device,
            medium,
            force,
        } => {
            let slot = SlotKey::new(storagectl, port, device);
            cli::run_mount(&registry, &machine, slot, &medium, force).await
        }
        Commands::Unmount {
            machine,
            storagectl,
            port,
            device,
            force,
        } => {
            let slot = SlotKey::new(storagectl, port, device);
            cli::run_unmount(&registry, &machine, slot, force).await
        }
        Commands::Snapshot { machine, action } => match action {
            SnapshotAction::Take { name, description } => {
                cli::run_snapshot_take(&registry, &machine, &name, &description).await
            }
            SnapshotAction::Restore { snapshot } => cli::run_snapshot_restore(&registry, &machine, &snapshot).await,
            SnapshotAction::Delete { snapshot } => cli::run_snapshot_delete(&registry, &machine, &snapshot).await,
        },
        Commands::Startvm { machine, r#type, socket } => cli::run_startvm(registry, &machine, &r#type, &socket).await,
        Commands::Unregister { machine, delete } => cli::run_unregister(&registry, &machine, delete).await,
        Commands::Serve => cli::run_serve(registry, events).await,
        Commands::Check => cli::run_check(&registry.services().config).await,
    }
}
