//! Fleet launcher.
//!
//! [`VmLauncher`] drives the fleet through
//! `Unprovisioned -> GloballySetUp -> PerVmPrepared -> Launched -> Pinned`.
//! Each stage checks the current state and refuses to run out of order.
//!
//! - [`config`]: the provisioning intent
//! - [`qemu`]: command line construction
//! - [`disk`]: per-VM images, firmware and guest file injection
//!
//! Restarting one VM ([`VmLauncher::resume`]) reloads the ledger written by
//! global setup and enters at `GloballySetUp`, so the network, fabric and
//! GPU inventory of the running fleet are reused untouched.

pub mod config;
pub mod disk;
pub mod qemu;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::devices::DeviceBinder;
use crate::fabric::SharedFabric;
use crate::ledger::HostResourceLedger;
use crate::network::guest::{render_guest_files, GuestTemplates};
use crate::network::{GuestAddresses, NetworkProvisioner, NetworkSettings};
use crate::pinner::{PinAssignment, Pinner};
use crate::runner::{CommandRunner, HostCommand};
use crate::topology::{detect_cpu_kind, discover_nodes};
use crate::{Error, Result};

use self::config::FleetConfig;
use self::qemu::{plan_memory, MemoryLayout, QemuCommandBuilder, VmResources};

/// UEFI code image, copied once into the fleet directory.
pub const OVMF_CODE: &str = "OVMF_CODE.fd";
/// UEFI variable store, one writable copy per VM.
pub const OVMF_VARS: &str = "OVMF_VARS.fd";
pub const MONITOR_SOCKET: &str = "qemu-monitor.sock";
pub const PIDFILE: &str = "pid";
pub const QEMU_LOG: &str = "qemu.log";
pub const MOUNT_DIR: &str = "mnt";

/// On-disk layout of one VM under `<vmdir>/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmPaths {
    pub dir: PathBuf,
    pub disk: PathBuf,
    pub monitor: PathBuf,
    pub pidfile: PathBuf,
    pub ovmf_vars: PathBuf,
    pub mnt: PathBuf,
    pub log: PathBuf,
}

impl VmPaths {
    pub fn new(config: &FleetConfig, vm_id: usize, drive_file_name: &str) -> Self {
        let dir = config.vm_dir(vm_id);
        Self {
            disk: dir.join(drive_file_name),
            monitor: dir.join(MONITOR_SOCKET),
            pidfile: dir.join(PIDFILE),
            ovmf_vars: dir.join(OVMF_VARS),
            mnt: dir.join(MOUNT_DIR),
            log: dir.join(QEMU_LOG),
            dir,
        }
    }
}

/// Launcher progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    Unprovisioned,
    GloballySetUp,
    PerVmPrepared,
    Launched,
    Pinned,
}

impl FleetState {
    pub fn name(&self) -> &'static str {
        match self {
            FleetState::Unprovisioned => "unprovisioned",
            FleetState::GloballySetUp => "globally_set_up",
            FleetState::PerVmPrepared => "per_vm_prepared",
            FleetState::Launched => "launched",
            FleetState::Pinned => "pinned",
        }
    }
}

impl fmt::Display for FleetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-VM record, created by the prepare stage.
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub id: usize,
    pub paths: VmPaths,
    pub addresses: GuestAddresses,
    pub memory: MemoryLayout,
    /// Launch command, once built
    pub command: Option<HostCommand>,
    /// QEMU pid read back from the pidfile after daemonizing
    pub pid: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub id: usize,
    pub dir: PathBuf,
    pub monitor: PathBuf,
    pub pid: Option<i32>,
    pub addresses: Vec<Ipv4Addr>,
}

/// What a run launched and where its vCPUs went.
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub fleet_id: Uuid,
    pub state: FleetState,
    pub vms: Vec<VmSummary>,
    pub pins: Vec<PinAssignment>,
}

/// Orchestrates one fleet run on this host.
pub struct VmLauncher<'a> {
    runner: &'a dyn CommandRunner,
    config: FleetConfig,
    network: NetworkProvisioner<'a>,
    ledger: HostResourceLedger,
    state: FleetState,
    vms: Vec<VmInstance>,
    pins: Vec<PinAssignment>,
}

impl<'a> VmLauncher<'a> {
    /// Validate `config` and create a launcher in `Unprovisioned`.
    pub fn new(runner: &'a dyn CommandRunner, config: FleetConfig) -> Result<Self> {
        Self::with_network_settings(runner, config, NetworkSettings::default())
    }

    pub fn with_network_settings(
        runner: &'a dyn CommandRunner,
        config: FleetConfig,
        settings: NetworkSettings,
    ) -> Result<Self> {
        config.validate()?;
        let network = NetworkProvisioner::new(runner, config.network, settings);
        Ok(Self {
            runner,
            config,
            network,
            ledger: HostResourceLedger::new(),
            state: FleetState::Unprovisioned,
            vms: Vec::new(),
            pins: Vec::new(),
        })
    }

    pub fn state(&self) -> FleetState {
        self.state
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn ledger(&self) -> &HostResourceLedger {
        &self.ledger
    }

    pub fn vms(&self) -> &[VmInstance] {
        &self.vms
    }

    fn expect_state(&self, expected: FleetState) -> Result<()> {
        if self.state != expected {
            return Err(Error::State {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, next: FleetState) {
        info!("fleet {}: {} -> {}", self.ledger.fleet_id, self.state, next);
        self.state = next;
    }

    /// Run every stage. A configured restart target resumes instead of
    /// doing global setup.
    pub async fn run(&mut self) -> Result<FleetReport> {
        match self.config.restart_vm {
            Some(vm_id) => self.resume(vm_id).await?,
            None => self.global_setup().await?,
        }
        self.prepare_vms().await?;
        self.launch_vms().await?;
        self.pin_vcpus().await?;
        Ok(self.report())
    }

    /// Refuse to touch the host while any QEMU is running on it.
    pub async fn preflight(&self) -> Result<()> {
        let out = self
            .runner
            .run_allow_fail(&HostCommand::new("pgrep").args(["-f", "qemu-system"]))
            .await;
        if out.success() && !out.stdout.trim().is_empty() {
            let pids: Vec<&str> = out.stdout.split_whitespace().collect();
            return Err(Error::Preflight(format!(
                "QEMU already running on this host (pids {})",
                pids.join(", ")
            )));
        }
        Ok(())
    }

    /// One-time host preparation for the whole fleet.
    pub async fn global_setup(&mut self) -> Result<()> {
        self.expect_state(FleetState::Unprovisioned)?;
        self.preflight().await?;
        let config = &self.config;
        tokio::fs::create_dir_all(&config.vmdir).await?;

        let binder = DeviceBinder::new(self.runner);
        binder.unset_all_overrides(&mut self.ledger).await?;

        self.network
            .provision(&config.vmdir, config.num_vms, &mut self.ledger)
            .await?;

        if config.use_ovmf {
            disk::install_firmware_code(config, &mut self.ledger).await?;
        }

        if config.pass_gpu {
            self.ledger.gpus = binder.find_gpus().await?;
        }

        if let Some(ref fabric) = config.fabric {
            SharedFabric::new(self.runner, fabric)
                .setup(&config.vmdir, config.num_vms, &mut self.ledger)
                .await?;
        }

        self.ledger.save(&config.vmdir)?;
        self.advance(FleetState::GloballySetUp);
        Ok(())
    }

    /// Re-enter an existing fleet to relaunch `vm_id` only.
    ///
    /// Fails if the fleet ledger is missing or the VM is still running.
    pub async fn resume(&mut self, vm_id: usize) -> Result<()> {
        self.expect_state(FleetState::Unprovisioned)?;
        if vm_id >= self.config.num_vms {
            return Err(Error::Config(format!(
                "restart target vm{} is outside a fleet of {}",
                vm_id, self.config.num_vms
            )));
        }
        self.ledger = HostResourceLedger::load(&self.config.vmdir)?;

        let paths = VmPaths::new(&self.config, vm_id, self.config.drive_file_name()?);
        if let Some(pid) = read_pid(&paths.pidfile).await {
            if pid_alive(pid) {
                return Err(Error::Preflight(format!(
                    "vm{} is still running as pid {}",
                    vm_id, pid
                )));
            }
        }
        info!("restarting vm{} of fleet {}", vm_id, self.ledger.fleet_id);
        self.advance(FleetState::GloballySetUp);
        Ok(())
    }

    /// Copy disks, then address and configure every target guest.
    pub async fn prepare_vms(&mut self) -> Result<()> {
        self.expect_state(FleetState::GloballySetUp)?;
        let config = &self.config;
        let targets = config.target_vms();
        disk::copy_vm_disks(self.runner, config, &targets).await?;

        let templates = GuestTemplates::load(config.template_dir.as_deref())?;
        let plan = config.ip_plan();
        let drive_name = config.drive_file_name()?;

        let mut vms = Vec::with_capacity(targets.len());
        for vm_id in targets {
            let paths = VmPaths::new(config, vm_id, drive_name);
            if config.use_ovmf {
                disk::install_firmware_vars(config, &paths).await?;
            }
            let addresses = plan.vm_addresses(vm_id)?;
            let files = render_guest_files(&templates, &addresses, config.add_user_ssh)?;
            disk::inject_guest_files(self.runner, &paths, &files).await?;
            info!("vm{}: prepared with {:?}", vm_id, addresses);

            vms.push(VmInstance {
                id: vm_id,
                paths,
                addresses,
                memory: plan_memory(
                    config.mem_size_mb,
                    config.mem_local_percent,
                    config.home_node,
                    config.remote_node,
                ),
                command: None,
                pid: None,
            });
        }
        self.vms = vms;
        self.advance(FleetState::PerVmPrepared);
        Ok(())
    }

    /// Build and launch every prepared VM, one after the other.
    pub async fn launch_vms(&mut self) -> Result<()> {
        self.expect_state(FleetState::PerVmPrepared)?;
        let cpu = detect_cpu_kind(self.runner).await?;
        info!("host CPU is {}", cpu);

        let binder = DeviceBinder::new(self.runner);
        let gpus = self.ledger.gpus.clone();
        for vm in &mut self.vms {
            let network_args = self.network.strategy().qemu_args(
                self.config.host_id,
                vm.id,
                &self.ledger,
            )?;
            let gpu_args = if self.config.pass_gpu {
                binder.attach_gpu(&gpus, vm.id, &mut self.ledger).await?
            } else {
                Vec::new()
            };
            let resources = VmResources {
                network_args,
                fabric: self.ledger.fabric.clone(),
                gpu_args,
            };
            let cmd = QemuCommandBuilder::new(&self.config, vm.id, cpu).build(&vm.paths, &resources);

            info!("launching vm{}", vm.id);
            self.runner.run(&cmd).await?;
            vm.pid = read_pid(&vm.paths.pidfile).await;
            vm.command = Some(cmd);
        }

        self.ledger.save(&self.config.vmdir)?;
        self.advance(FleetState::Launched);
        Ok(())
    }

    /// Wait for every monitor and pin the vCPU threads.
    pub async fn pin_vcpus(&mut self) -> Result<()> {
        self.expect_state(FleetState::Launched)?;
        let topology = discover_nodes(self.runner, &self.config.vm_numa_node).await?;
        let pinner = Pinner::new(self.runner, self.config.boot_timeout, self.config.poll_interval);

        let mut pins = Vec::new();
        for vm in &self.vms {
            let plan = pinner
                .pin_vm(&topology, vm.id, self.config.num_cpus, &vm.paths.monitor)
                .await?;
            if plan.len() != self.config.num_cpus {
                warn!(
                    "vm{}: monitor reported {} vCPUs, expected {}",
                    vm.id,
                    plan.len(),
                    self.config.num_cpus
                );
            }
            pins.extend(plan);
        }
        self.pins = pins;
        self.advance(FleetState::Pinned);
        Ok(())
    }

    pub fn report(&self) -> FleetReport {
        FleetReport {
            fleet_id: self.ledger.fleet_id,
            state: self.state,
            vms: self
                .vms
                .iter()
                .map(|vm| VmSummary {
                    id: vm.id,
                    dir: vm.paths.dir.clone(),
                    monitor: vm.paths.monitor.clone(),
                    pid: vm.pid,
                    addresses: vm
                        .addresses
                        .ether
                        .iter()
                        .chain(vm.addresses.ib.iter())
                        .copied()
                        .collect(),
                })
                .collect(),
            pins: self.pins.clone(),
        }
    }
}

async fn read_pid(path: &Path) -> Option<i32> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission check only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    fn config(vmdir: &Path) -> FleetConfig {
        FleetConfig::new()
            .num_vms(2)
            .vmdir(vmdir)
            .drive("/images/rootfs.img")
            .trace_events(None)
    }

    #[test]
    fn test_vm_paths_layout() {
        let config = config(Path::new("/vms"));
        let paths = VmPaths::new(&config, 3, "rootfs.img");
        assert_eq!(paths.disk, PathBuf::from("/vms/3/rootfs.img"));
        assert_eq!(paths.monitor, PathBuf::from("/vms/3/qemu-monitor.sock"));
        assert_eq!(paths.pidfile, PathBuf::from("/vms/3/pid"));
        assert_eq!(paths.ovmf_vars, PathBuf::from("/vms/3/OVMF_VARS.fd"));
        assert_eq!(paths.mnt, PathBuf::from("/vms/3/mnt"));
    }

    #[tokio::test]
    async fn test_preflight_refuses_running_qemu() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new().on_stdout("pgrep", "4242\n4243\n");
        let mut launcher = VmLauncher::new(&runner, config(dir.path())).unwrap();
        let err = launcher.global_setup().await.unwrap_err();
        match err {
            Error::Preflight(msg) => assert!(msg.contains("4242, 4243")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(launcher.state(), FleetState::Unprovisioned);
        assert!(runner.matching("driverctl").is_empty());
    }

    #[tokio::test]
    async fn test_stages_refuse_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new();
        let mut launcher = VmLauncher::new(&runner, config(dir.path())).unwrap();
        let err = launcher.launch_vms().await.unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                expected: "per_vm_prepared",
                actual: "unprovisioned"
            }
        ));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_resume_without_ledger_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new();
        let mut launcher = VmLauncher::new(&runner, config(dir.path())).unwrap();
        let err = launcher.resume(1).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_resume_refuses_live_vm() {
        let dir = tempfile::tempdir().unwrap();
        HostResourceLedger::new().save(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("0")).unwrap();
        std::fs::write(dir.path().join("0/pid"), format!("{}\n", std::process::id())).unwrap();

        let runner = MockRunner::new();
        let mut launcher = VmLauncher::new(&runner, config(dir.path())).unwrap();
        let err = launcher.resume(0).await.unwrap_err();
        assert!(matches!(err, Error::Preflight(_)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let runner = MockRunner::new();
        assert!(VmLauncher::new(&runner, FleetConfig::new().num_vms(0)).is_err());
    }
}
