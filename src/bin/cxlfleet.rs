use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cxl_fleet::fabric::{cleanup_shared_fabric, FabricTransportKind, SharedFabricConfig};
use cxl_fleet::network::NetworkMode;
use cxl_fleet::remote::RemoteGuest;
use cxl_fleet::{load_fleet_config, FleetConfig, HostRunner, VmLauncher};

/// Provision NUMA-pinned QEMU fleets with an emulated CXL fabric
#[derive(Parser)]
#[command(name = "cxlfleet", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or restart one VM of) a fleet
    #[command(name = "start_vm")]
    StartVm(StartVmArgs),
    /// Disable the MTRR covering the ivshmem BAR2 inside a guest
    #[command(name = "rm_bar2mtrr")]
    RmBar2Mtrr(GuestArgs),
    /// Print the PCI addresses of a guest's ivshmem devices
    #[command(name = "get_ivshmem_pci")]
    GetIvshmemPci(GuestArgs),
    /// Kill QEMU and fabric servers, then unmount the fabric
    #[command(name = "clean_ivshmem")]
    CleanIvshmem {
        #[arg(long = "shmem_dir")]
        shmem_dir: PathBuf,
    },
}

#[derive(Args)]
struct StartVmArgs {
    /// Fleet description (JSON or YAML); flags below are ignored except
    /// --restart_vm
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long = "qemu_bin", default_value = "qemu-system-x86_64")]
    qemu_bin: PathBuf,
    #[arg(long, requires = "initrd")]
    kernel: Option<PathBuf>,
    #[arg(long, requires = "kernel")]
    initrd: Option<PathBuf>,
    /// Golden disk image
    #[arg(long)]
    drive: Option<PathBuf>,
    #[arg(long = "num_cpus", default_value_t = 4)]
    num_cpus: usize,
    #[arg(long = "mem_size_mb", default_value_t = 4096)]
    mem_size_mb: u64,
    #[arg(long)]
    vmdir: Option<PathBuf>,
    #[arg(long = "num_vms", default_value_t = 1)]
    num_vms: usize,
    /// Forward host port 10022+id to each guest's ssh
    #[arg(long = "add_user_ssh")]
    add_user_ssh: bool,
    /// Shared fabric mount point; enables the fabric
    #[arg(long = "shmem_dir")]
    shmem_dir: Option<PathBuf>,
    #[arg(long = "shmem_dir_numa", num_args = 1.., default_values_t = [1u32])]
    shmem_dir_numa: Vec<u32>,
    #[arg(long = "shmem_size_mb", default_value_t = 4096)]
    shmem_size_mb: u64,
    #[arg(long = "vm_numa_node", num_args = 1.., default_values_t = [0u32])]
    vm_numa_node: Vec<u32>,
    /// Host directory exported to guests over 9p
    #[arg(long = "shared_dir")]
    shared_dir: Option<PathBuf>,
    #[arg(long = "msi_vectors", default_value_t = 8)]
    msi_vectors: u32,
    #[arg(long = "use-ivshmem-doorbell")]
    use_ivshmem_doorbell: bool,
    /// Local share of guest memory; omit to keep a single guest node
    #[arg(long = "mem_local_percent", value_parser = clap::value_parser!(u8).range(0..=100))]
    mem_local_percent: Option<u8>,
    #[arg(long = "pass_gpu")]
    pass_gpu: bool,
    #[arg(long = "use_mlnx_ib", conflicts_with = "use_mlnx_ether")]
    use_mlnx_ib: bool,
    #[arg(long = "use_mlnx_ether")]
    use_mlnx_ether: bool,
    #[arg(long = "num_ether_per_vm", default_value_t = 1)]
    num_ether_per_vm: usize,
    #[arg(long = "num_ib_per_vm", default_value_t = 1)]
    num_ib_per_vm: usize,
    #[arg(long = "host_id", default_value_t = 0)]
    host_id: usize,
    /// Relaunch only this VM of an already running fleet
    #[arg(long = "restart_vm")]
    restart_vm: Option<usize>,
    #[arg(long = "use_ovmf")]
    use_ovmf: bool,
    /// Directory overriding the built-in guest network templates
    #[arg(long = "template_dir")]
    template_dir: Option<PathBuf>,
    #[arg(long = "boot_timeout", value_parser = humantime::parse_duration, default_value = "120s")]
    boot_timeout: Duration,
    #[arg(long = "poll_interval", value_parser = humantime::parse_duration, default_value = "500ms")]
    poll_interval: Duration,
}

impl StartVmArgs {
    fn into_config(self) -> cxl_fleet::Result<FleetConfig> {
        if let Some(ref path) = self.config {
            let mut config = load_fleet_config(path)?;
            if let Some(id) = self.restart_vm {
                config = config.restart_vm(id);
                config.validate()?;
            }
            return Ok(config);
        }

        let network = if self.use_mlnx_ib {
            NetworkMode::MellanoxInfiniband {
                vfs_per_vm: self.num_ib_per_vm,
            }
        } else if self.use_mlnx_ether {
            NetworkMode::MellanoxEthernet {
                vfs_per_vm: self.num_ether_per_vm,
            }
        } else {
            NetworkMode::Bridge
        };

        let mut config = FleetConfig::new()
            .num_vms(self.num_vms)
            .num_cpus(self.num_cpus)
            .mem_size_mb(self.mem_size_mb)
            .network(network)
            .host_id(self.host_id)
            .pass_gpu(self.pass_gpu)
            .add_user_ssh(self.add_user_ssh)
            .use_ovmf(self.use_ovmf)
            .boot_polling(self.boot_timeout, self.poll_interval);
        config.qemu_bin = self.qemu_bin;
        config.kernel = self.kernel;
        config.initrd = self.initrd;
        config.vm_numa_node = self.vm_numa_node;
        config.mem_local_percent = self.mem_local_percent;
        config.restart_vm = self.restart_vm;
        config.shared_dir = self.shared_dir;
        config.template_dir = self.template_dir;
        if let Some(drive) = self.drive {
            config = config.drive(drive);
        }
        if let Some(vmdir) = self.vmdir {
            config = config.vmdir(vmdir);
        }
        if let Some(shmem_dir) = self.shmem_dir {
            config = config.fabric(SharedFabricConfig {
                shmem_dir,
                size_mb: self.shmem_size_mb,
                numa_nodes: self.shmem_dir_numa,
                msi_vectors: self.msi_vectors,
                transport: if self.use_ivshmem_doorbell {
                    FabricTransportKind::Doorbell
                } else {
                    FabricTransportKind::Plain
                },
                ..Default::default()
            });
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
struct GuestArgs {
    #[arg(long)]
    ip: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long, default_value = "root")]
    username: String,
    /// ssh identity file
    #[arg(long)]
    filename: Option<PathBuf>,
}

impl GuestArgs {
    fn guest(self) -> RemoteGuest {
        RemoteGuest::new(self.ip, self.port, self.username).identity(self.filename)
    }
}

/// Stderr logging filtered by `RUST_LOG`, plus a plain-text file under
/// `$CXLFLEET_LOG_DIR` when set. The guard must outlive `main`'s work.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match std::env::var_os("CXLFLEET_LOG_DIR") {
        Some(dir) => {
            let dir = PathBuf::from(dir);
            let _ = std::fs::create_dir_all(&dir);
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "cxlfleet.log"));
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _log_guard = init_logging();
    let runner = HostRunner::new();

    match cli.command {
        Commands::StartVm(args) => {
            let config = args.into_config()?;
            let has_fabric = config.fabric.is_some();
            let mut launcher = VmLauncher::new(&runner, config)?;
            let report = launcher.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if has_fabric {
                info!("run `cxlfleet rm_bar2mtrr --ip <ip> --port <port> --username <user>` in each guest");
            }
        }
        Commands::RmBar2Mtrr(args) => match args.guest().remove_bar2_mtrr(&runner).await? {
            Some(table) => print!("{}", table),
            None => println!("no MTRR register covers the ivshmem BAR2"),
        },
        Commands::GetIvshmemPci(args) => {
            for addr in args.guest().ivshmem_devices(&runner).await? {
                println!("{}", addr);
            }
        }
        Commands::CleanIvshmem { shmem_dir } => {
            let grace = SharedFabricConfig::default().kill_grace;
            cleanup_shared_fabric(&runner, &shmem_dir, grace).await?;
        }
    }

    Ok(())
}
