//! Host-RAM surrogate for a CXL memory pool.
//!
//! The pool lives in a NUMA-bound tmpfs so the "remote" bytes are placed on
//! the node the experiment expects. Two transports expose it to guests:
//!
//! - [`PlainTransport`]: one backing file mapped by every VM through a shared
//!   `memory-backend-file` object and an `ivshmem-plain` device.
//! - [`DoorbellTransport`]: an external `ivshmem-server` owns the backing
//!   file and serves one unix socket per VM; guests attach an
//!   `ivshmem-doorbell` device that can also deliver inter-VM interrupts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::HostResourceLedger;
use crate::runner::{CommandRunner, HostCommand};
use crate::Result;

/// Extra tmpfs capacity on top of the pool size.
pub const MOUNT_MARGIN_MB: u64 = 512;

/// Backing file name inside the fabric mount.
pub const BACKING_FILE: &str = "mem_1";

/// Doorbell socket base name inside the VM directory.
pub const DOORBELL_SOCKET: &str = "ivshmem_sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricTransportKind {
    #[default]
    Plain,
    Doorbell,
}

/// Shared fabric parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedFabricConfig {
    /// tmpfs mount point
    pub shmem_dir: PathBuf,
    pub size_mb: u64,
    /// Host NUMA nodes the tmpfs is bound to
    pub numa_nodes: Vec<u32>,
    /// MSI vectors per doorbell device
    pub msi_vectors: u32,
    pub transport: FabricTransportKind,
    /// Doorbell server binary
    pub server_bin: PathBuf,
    /// Wait between killing fabric processes and unmounting
    #[serde(with = "crate::vmm::config::duration_str")]
    pub kill_grace: Duration,
}

impl Default for SharedFabricConfig {
    fn default() -> Self {
        Self {
            shmem_dir: PathBuf::from("/mnt/cxl"),
            size_mb: 4096,
            numa_nodes: vec![1],
            msi_vectors: 8,
            transport: FabricTransportKind::Plain,
            server_bin: PathBuf::from("ivshmem-server"),
            kill_grace: Duration::from_secs(3),
        }
    }
}

impl SharedFabricConfig {
    pub fn backing_file(&self) -> PathBuf {
        self.shmem_dir.join(BACKING_FILE)
    }
}

/// How VMs reach the fabric. Created once per fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SharedFabricHandle {
    Plain {
        backing_file: PathBuf,
        size_mb: u64,
    },
    Doorbell {
        /// Socket path template; VM `i` connects to `<socket>.<i+1>`
        socket: PathBuf,
        backing_file: PathBuf,
        size_mb: u64,
        vectors: u32,
    },
}

impl SharedFabricHandle {
    /// Doorbell socket of `vm_id`, if this is a doorbell fabric.
    pub fn vm_socket(&self, vm_id: usize) -> Option<PathBuf> {
        match self {
            SharedFabricHandle::Plain { .. } => None,
            SharedFabricHandle::Doorbell { socket, .. } => {
                let mut name = socket.clone().into_os_string();
                name.push(format!(".{}", vm_id + 1));
                Some(PathBuf::from(name))
            }
        }
    }

    /// QEMU arguments attaching `vm_id` to the fabric.
    pub fn qemu_args(&self, vm_id: usize) -> Vec<String> {
        match self {
            SharedFabricHandle::Plain {
                backing_file,
                size_mb,
            } => vec![
                "-device".into(),
                "ivshmem-plain,memdev=ivshmem".into(),
                "-object".into(),
                format!(
                    "memory-backend-file,size={}M,share=on,mem-path={},id=ivshmem",
                    size_mb,
                    backing_file.display()
                ),
            ],
            SharedFabricHandle::Doorbell { vectors, .. } => {
                let socket = self.vm_socket(vm_id).unwrap_or_default();
                vec![
                    "-device".into(),
                    format!("ivshmem-doorbell,vectors={},chardev=ivshmem-server", vectors),
                    "-chardev".into(),
                    format!("socket,path={},id=ivshmem-server", socket.display()),
                ]
            }
        }
    }
}

/// Transport-specific half of fabric setup, run after the mount exists.
#[async_trait::async_trait]
pub trait FabricTransport: Send + Sync {
    fn kind(&self) -> FabricTransportKind;

    async fn establish(
        &self,
        runner: &dyn CommandRunner,
        config: &SharedFabricConfig,
        vmdir: &Path,
        num_vms: usize,
    ) -> Result<SharedFabricHandle>;
}

pub struct PlainTransport;

#[async_trait::async_trait]
impl FabricTransport for PlainTransport {
    fn kind(&self) -> FabricTransportKind {
        FabricTransportKind::Plain
    }

    async fn establish(
        &self,
        runner: &dyn CommandRunner,
        config: &SharedFabricConfig,
        _vmdir: &Path,
        _num_vms: usize,
    ) -> Result<SharedFabricHandle> {
        let backing_file = config.backing_file();
        runner
            .run(
                &HostCommand::new("truncate")
                    .arg("-s")
                    .arg(format!("{}M", config.size_mb))
                    .arg(backing_file.display().to_string()),
            )
            .await?;
        Ok(SharedFabricHandle::Plain {
            backing_file,
            size_mb: config.size_mb,
        })
    }
}

pub struct DoorbellTransport;

#[async_trait::async_trait]
impl FabricTransport for DoorbellTransport {
    fn kind(&self) -> FabricTransportKind {
        FabricTransportKind::Doorbell
    }

    async fn establish(
        &self,
        runner: &dyn CommandRunner,
        config: &SharedFabricConfig,
        vmdir: &Path,
        num_vms: usize,
    ) -> Result<SharedFabricHandle> {
        let backing_file = config.backing_file();
        let socket = vmdir.join(DOORBELL_SOCKET);
        runner
            .run(
                &HostCommand::new("truncate")
                    .arg("-s")
                    .arg(format!("{}M", config.size_mb))
                    .arg(backing_file.display().to_string()),
            )
            .await?;

        info!(
            "starting {} for {} VMs on {}",
            config.server_bin.display(),
            num_vms,
            socket.display()
        );
        runner
            .spawn_detached(
                &HostCommand::new(config.server_bin.display().to_string())
                    .arg("--socket-path")
                    .arg(socket.display().to_string())
                    .arg("--memory-path")
                    .arg(backing_file.display().to_string())
                    .arg("--memory-size")
                    .arg(format!("{}M", config.size_mb))
                    .arg("--vector-count")
                    .arg(config.msi_vectors.to_string())
                    .arg("--vm-count")
                    .arg(num_vms.to_string())
                    .arg("--vm-offset"),
            )
            .await?;

        Ok(SharedFabricHandle::Doorbell {
            socket,
            backing_file,
            size_mb: config.size_mb,
            vectors: config.msi_vectors,
        })
    }
}

/// Transport for `kind`.
pub fn create_transport(kind: FabricTransportKind) -> Box<dyn FabricTransport> {
    match kind {
        FabricTransportKind::Plain => Box::new(PlainTransport),
        FabricTransportKind::Doorbell => Box::new(DoorbellTransport),
    }
}

async fn is_mounted(runner: &dyn CommandRunner, path: &Path) -> bool {
    runner
        .run_allow_fail(&HostCommand::new("mountpoint").arg("-q").arg(path.display().to_string()))
        .await
        .success()
}

/// (Re)create the NUMA-bound tmpfs at `path`, `size_mb` plus
/// [`MOUNT_MARGIN_MB`] large. An existing mount is unmounted first.
pub async fn mount_host_region(
    runner: &dyn CommandRunner,
    path: &Path,
    size_mb: u64,
    numa_nodes: &[u32],
) -> Result<()> {
    let dir = path.display().to_string();
    runner.run(&HostCommand::sudo("mkdir").args(["-p", &dir])).await?;
    if is_mounted(runner, path).await {
        info!("{} already mounted, remounting", dir);
        runner.run(&HostCommand::sudo("umount").arg(&dir)).await?;
    }

    let nodes = numa_nodes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    runner
        .run(
            &HostCommand::sudo("mount")
                .args(["-t", "tmpfs"])
                .arg("-o")
                .arg(format!("size={}M", size_mb + MOUNT_MARGIN_MB))
                .arg("-o")
                .arg(format!("mpol=bind:{}", nodes))
                .args(["-o", "rw,nosuid,nodev", "tmpfs"])
                .arg(&dir),
        )
        .await?;
    Ok(())
}

/// Kill every QEMU and fabric server, wait `grace`, then unmount `path`.
pub async fn cleanup_shared_fabric(
    runner: &dyn CommandRunner,
    path: &Path,
    grace: Duration,
) -> Result<()> {
    for pattern in ["qemu", "ivshmem"] {
        let out = runner
            .run_allow_fail(&HostCommand::new("pkill").args(["-9", pattern]))
            .await;
        if !out.success() {
            warn!("no {} processes to kill", pattern);
        }
    }
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }
    if is_mounted(runner, path).await {
        runner
            .run(&HostCommand::sudo("umount").arg(path.display().to_string()))
            .await?;
    }
    Ok(())
}

/// Fleet-wide shared fabric setup and teardown.
pub struct SharedFabric<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a SharedFabricConfig,
    transport: Box<dyn FabricTransport>,
}

impl<'a> SharedFabric<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a SharedFabricConfig) -> Self {
        Self {
            runner,
            config,
            transport: create_transport(config.transport),
        }
    }

    pub fn transport_kind(&self) -> FabricTransportKind {
        self.transport.kind()
    }

    /// Mount the pool and bring up the transport.
    pub async fn setup(
        &self,
        vmdir: &Path,
        num_vms: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<SharedFabricHandle> {
        mount_host_region(
            self.runner,
            &self.config.shmem_dir,
            self.config.size_mb,
            &self.config.numa_nodes,
        )
        .await?;
        ledger.fabric_mount = Some(self.config.shmem_dir.clone());

        let handle = self
            .transport
            .establish(self.runner, self.config, vmdir, num_vms)
            .await?;
        ledger.fabric = Some(handle.clone());
        Ok(handle)
    }

    pub async fn cleanup(&self, ledger: &mut HostResourceLedger) -> Result<()> {
        cleanup_shared_fabric(self.runner, &self.config.shmem_dir, self.config.kill_grace).await?;
        ledger.fabric_mount = None;
        ledger.fabric = None;
        Ok(())
    }
}
