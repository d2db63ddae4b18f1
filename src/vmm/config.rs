//! Configuration for a cxl-fleet run

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fabric::SharedFabricConfig;
use crate::network::{IpPlan, NetworkMode};
use crate::{Error, Result};

/// Largest fleet whose ids still fit in one MAC address byte.
const MAX_VMS: usize = 256;

/// The full provisioning intent of one run. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// QEMU binary (default: qemu-system-x86_64)
    pub qemu_bin: PathBuf,
    /// Kernel for direct boot; only used together with `initrd`
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// Kernel command line for direct boot
    pub kernel_append: String,
    /// Golden disk image copied into every VM directory
    pub drive: PathBuf,
    /// Top-level VM directory
    pub vmdir: PathBuf,
    pub num_vms: usize,
    /// vCPUs per VM (default: 4)
    pub num_cpus: usize,
    /// Memory per VM in MiB (default: 4096)
    pub mem_size_mb: u64,
    /// Add a user-mode NIC forwarding host port 10022+id to guest port 22
    pub add_user_ssh: bool,
    /// Shared CXL-surrogate fabric, if any
    pub fabric: Option<SharedFabricConfig>,
    /// Host sockets the QEMU processes run on and vCPUs are pinned to
    pub vm_numa_node: Vec<u32>,
    /// Share of guest memory on the home node, 0..=100. `None` keeps a
    /// single guest node.
    pub mem_local_percent: Option<u8>,
    /// Host NUMA node backing local guest memory
    pub home_node: u32,
    /// Host NUMA node backing remote guest memory
    pub remote_node: u32,
    /// Pass one GPU through to every VM
    pub pass_gpu: bool,
    pub network: NetworkMode,
    /// Index of this host in a multi-host emulation
    pub host_id: usize,
    /// Host directory exported to guests over 9p
    pub shared_dir: Option<PathBuf>,
    /// Relaunch only this VM, reusing fleet-wide resources
    pub restart_vm: Option<usize>,
    /// Boot with OVMF instead of SeaBIOS
    pub use_ovmf: bool,
    /// Directory holding OVMF_CODE.fd and OVMF_VARS.fd
    pub ovmf_dir: PathBuf,
    /// QEMU trace events file, passed through when it exists
    pub trace_events: Option<PathBuf>,
    /// Directory overriding the built-in guest network templates
    pub template_dir: Option<PathBuf>,
    /// How long to wait for each VM's monitor socket
    #[serde(with = "duration_str")]
    pub boot_timeout: Duration,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            qemu_bin: PathBuf::from("qemu-system-x86_64"),
            kernel: None,
            initrd: None,
            kernel_append: "selinux=0 audit=0 console=ttyS0 root=/dev/vda2 ignore_loglevel rw"
                .to_string(),
            drive: PathBuf::from("/var/lib/cxl-fleet/images/rootfs.img"),
            vmdir: PathBuf::from("/var/lib/cxl-fleet/vms"),
            num_vms: 1,
            num_cpus: 4,
            mem_size_mb: 4096,
            add_user_ssh: false,
            fabric: None,
            vm_numa_node: vec![0],
            mem_local_percent: None,
            home_node: 0,
            remote_node: 1,
            pass_gpu: false,
            network: NetworkMode::Bridge,
            host_id: 0,
            shared_dir: None,
            restart_vm: None,
            use_ovmf: false,
            ovmf_dir: PathBuf::from("/usr/share/OVMF"),
            trace_events: Some(PathBuf::from("/tmp/events")),
            template_dir: None,
            boot_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl FleetConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of VMs
    pub fn num_vms(mut self, count: usize) -> Self {
        self.num_vms = count;
        self
    }

    /// Set the number of vCPUs per VM
    pub fn num_cpus(mut self, count: usize) -> Self {
        self.num_cpus = count;
        self
    }

    /// Set the memory size per VM in MiB
    pub fn mem_size_mb(mut self, mb: u64) -> Self {
        self.mem_size_mb = mb;
        self
    }

    pub fn vmdir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.vmdir = path.into();
        self
    }

    pub fn drive<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.drive = path.into();
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.network = mode;
        self
    }

    pub fn fabric(mut self, fabric: SharedFabricConfig) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Set the local memory share in percent
    pub fn mem_local_percent(mut self, percent: u8) -> Self {
        self.mem_local_percent = Some(percent);
        self
    }

    pub fn host_id(mut self, id: usize) -> Self {
        self.host_id = id;
        self
    }

    pub fn pass_gpu(mut self, enable: bool) -> Self {
        self.pass_gpu = enable;
        self
    }

    pub fn add_user_ssh(mut self, enable: bool) -> Self {
        self.add_user_ssh = enable;
        self
    }

    pub fn use_ovmf(mut self, enable: bool) -> Self {
        self.use_ovmf = enable;
        self
    }

    pub fn shared_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.shared_dir = Some(path.into());
        self
    }

    pub fn restart_vm(mut self, vm_id: usize) -> Self {
        self.restart_vm = Some(vm_id);
        self
    }

    pub fn trace_events(mut self, path: Option<PathBuf>) -> Self {
        self.trace_events = path;
        self
    }

    /// Set the monitor readiness polling policy
    pub fn boot_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.boot_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// File name of every VM's disk copy
    pub fn drive_file_name(&self) -> Result<&str> {
        self.drive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("drive has no file name: {}", self.drive.display())))
    }

    /// Per-VM directory
    pub fn vm_dir(&self, vm_id: usize) -> PathBuf {
        self.vmdir.join(vm_id.to_string())
    }

    pub fn ip_plan(&self) -> IpPlan {
        IpPlan::new(self.network, self.host_id, self.num_vms)
    }

    /// VM ids this run operates on
    pub fn target_vms(&self) -> Vec<usize> {
        match self.restart_vm {
            Some(id) => vec![id],
            None => (0..self.num_vms).collect(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_vms == 0 {
            return Err(Error::Config("Must start at least 1 VM".into()));
        }
        if self.num_vms > MAX_VMS {
            return Err(Error::Config(format!("At most {} VMs supported", MAX_VMS)));
        }
        if self.num_cpus == 0 {
            return Err(Error::Config("Must have at least 1 vCPU".into()));
        }
        if self.mem_size_mb == 0 {
            return Err(Error::Config("Memory size must be nonzero".into()));
        }
        if let Some(percent) = self.mem_local_percent {
            if percent > 100 {
                return Err(Error::Config(format!(
                    "mem_local_percent must be within 0..=100, got {}",
                    percent
                )));
            }
        }
        if self.vm_numa_node.is_empty() {
            return Err(Error::Config("vm_numa_node must name at least one node".into()));
        }
        if self.host_id > 255 {
            return Err(Error::Config("host_id must fit in one byte".into()));
        }
        if self.network.uses_passthrough() && self.network.vfs_per_vm() == 0 {
            return Err(Error::Config("Mellanox networking needs at least 1 VF per VM".into()));
        }
        if self.kernel.is_some() != self.initrd.is_some() {
            return Err(Error::Config(
                "kernel and initrd must be given together".into(),
            ));
        }
        if let Some(id) = self.restart_vm {
            if id >= self.num_vms {
                return Err(Error::Config(format!(
                    "restart target vm{} is outside a fleet of {}",
                    id, self.num_vms
                )));
            }
        }
        if let Some(ref fabric) = self.fabric {
            if fabric.size_mb == 0 {
                return Err(Error::Config("Shared fabric size must be nonzero".into()));
            }
            if fabric.numa_nodes.is_empty() {
                return Err(Error::Config("Shared fabric needs at least one NUMA node".into()));
            }
            if fabric.msi_vectors == 0 {
                return Err(Error::Config("Doorbell fabric needs at least 1 MSI vector".into()));
            }
        }
        self.drive_file_name()?;
        self.ip_plan().validate()?;
        Ok(())
    }
}

/// Load a fleet configuration from JSON or YAML (by extension).
pub fn load_fleet_config(path: &Path) -> Result<FleetConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed reading {}: {e}", path.display())))?;
    let config: FleetConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        _ => serde_json::from_str(&raw)?,
    };
    config.validate()?;
    Ok(config)
}

/// `Duration` as a humantime string ("3s", "500ms").
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricTransportKind;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.num_vms, 1);
        assert_eq!(config.num_cpus, 4);
        assert_eq!(config.network, NetworkMode::Bridge);
        assert_eq!(config.boot_timeout, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = FleetConfig::new()
            .num_vms(4)
            .num_cpus(8)
            .mem_size_mb(8192)
            .mem_local_percent(50)
            .restart_vm(2);
        assert_eq!(config.target_vms(), vec![2]);
        assert!(config.validate().is_ok());
        assert_eq!(config.vm_dir(2), PathBuf::from("/var/lib/cxl-fleet/vms/2"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(FleetConfig::new().num_vms(0).validate().is_err());
        assert!(FleetConfig::new().num_cpus(0).validate().is_err());
        assert!(FleetConfig::new().mem_local_percent(101).validate().is_err());
        assert!(FleetConfig::new().num_vms(2).restart_vm(2).validate().is_err());
        assert!(FleetConfig::new()
            .network(NetworkMode::MellanoxEthernet { vfs_per_vm: 0 })
            .validate()
            .is_err());
        let mut config = FleetConfig::new();
        config.kernel = Some(PathBuf::from("/boot/vmlinuz"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_overflow_is_capacity_error() {
        let err = FleetConfig::new()
            .num_vms(200)
            .host_id(1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            r#"
num_vms: 2
mem_size_mb: 8192
mem_local_percent: 25
network:
  mode: mellanox_infiniband
  vfs_per_vm: 1
fabric:
  shmem_dir: /mnt/cxl
  size_mb: 4096
  transport: doorbell
  kill_grace: 1s
poll_interval: 250ms
"#,
        )
        .unwrap();
        let config = load_fleet_config(&path).unwrap();
        assert_eq!(config.num_vms, 2);
        assert_eq!(config.network, NetworkMode::MellanoxInfiniband { vfs_per_vm: 1 });
        let fabric = config.fabric.unwrap();
        assert_eq!(fabric.transport, FabricTransportKind::Doorbell);
        assert_eq!(fabric.msi_vectors, 8);
        assert_eq!(fabric.kill_grace, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_load_json_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, r#"{"num_vms": 0}"#).unwrap();
        assert!(matches!(load_fleet_config(&path), Err(Error::Config(_))));
    }
}
