//! GPU discovery and passthrough.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{DeviceBinder, PciAddress, VFIO_DRIVER};
use crate::ledger::HostResourceLedger;
use crate::runner::HostCommand;
use crate::{Error, Result};

/// NVIDIA modules, dependents first. `nvidia` refuses to unload while any of
/// the others holds a reference.
const NVIDIA_MODULES: &[&str] = &["nvidia_uvm", "nvidia_drm", "nvidia_modeset", "nvidia"];

const AMD_MODULES: &[&str] = &["amdgpu"];

const NVIDIA_PERSISTENCE_UNIT: &str = "nvidia-persistenced.service";

/// GPU vendor family found on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuKind {
    Nvidia,
    Amd,
    #[default]
    None,
}

/// Display-class devices found by [`DeviceBinder::find_gpus`].
///
/// The kind is taken from the first recognised device; mixed-vendor hosts
/// are not supported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInventory {
    pub devices: Vec<PciAddress>,
    pub kind: GpuKind,
}

impl GpuInventory {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() || self.kind == GpuKind::None
    }
}

/// Parse `lspci -Dmnn` output into a GPU inventory.
///
/// Display controllers carry a class id starting with `03` (`[0300]`,
/// `[0302]`, ...).
pub fn parse_lspci_gpus(text: &str) -> GpuInventory {
    let mut inventory = GpuInventory::default();
    for line in text.lines() {
        if !line.contains("[03") {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        let kind = if lower.contains("nvidia") {
            GpuKind::Nvidia
        } else if lower.contains("amd") {
            GpuKind::Amd
        } else {
            continue;
        };
        let Some(addr) = line.split_whitespace().next().and_then(|t| t.parse().ok()) else {
            continue;
        };
        if inventory.kind == GpuKind::None {
            inventory.kind = kind;
        }
        inventory.devices.push(addr);
    }
    inventory
}

impl DeviceBinder<'_> {
    /// Scan PCI devices for GPUs.
    pub async fn find_gpus(&self) -> Result<GpuInventory> {
        let out = self
            .runner()
            .run(&HostCommand::new("lspci").arg("-Dmnn"))
            .await
            .map_err(|e| Error::Discovery(format!("lspci failed: {}", e)))?;
        let inventory = parse_lspci_gpus(&out.stdout);
        info!(
            "found {} GPU(s) of kind {:?}",
            inventory.devices.len(),
            inventory.kind
        );
        Ok(inventory)
    }

    /// Unload the vendor driver stack. Each step is best-effort: a module
    /// that is not loaded is not an error.
    pub async fn unload_vendor_modules(&self, kind: GpuKind) {
        let modules = match kind {
            GpuKind::Nvidia => NVIDIA_MODULES,
            GpuKind::Amd => AMD_MODULES,
            GpuKind::None => return,
        };
        for module in modules {
            self.runner()
                .run_allow_fail(&HostCommand::sudo("modprobe").args(["-r", *module]))
                .await;
        }
    }

    /// Stop the NVIDIA persistence daemon, which otherwise pins the module.
    pub async fn stop_persistence_daemon(&self) {
        self.runner()
            .run_allow_fail(&HostCommand::sudo("systemctl").args(["stop", NVIDIA_PERSISTENCE_UNIT]))
            .await;
    }

    /// Hand GPU number `vm_id` to `vfio-pci` and return the QEMU arguments that
    /// attach it.
    ///
    /// Must run right before the VM's launch: the bind is exclusive host-wide
    /// state. The vendor stack is torn down before vfio loads, otherwise the
    /// bind fails with a busy device.
    pub async fn attach_gpu(
        &self,
        inventory: &GpuInventory,
        vm_id: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<Vec<String>> {
        if inventory.is_empty() {
            return Err(Error::Capacity(
                "GPU passthrough requested but no GPU was discovered".into(),
            ));
        }
        let Some(addr) = inventory.devices.get(vm_id) else {
            return Err(Error::Capacity(format!(
                "not enough GPUs ({}) to pass one to vm{}",
                inventory.devices.len(),
                vm_id
            )));
        };

        if inventory.kind == GpuKind::Nvidia {
            info!("stopping NVIDIA persistence daemon");
            self.stop_persistence_daemon().await;
        }
        self.unload_vendor_modules(inventory.kind).await;
        self.load_passthrough_modules().await?;
        self.bind_override(addr, VFIO_DRIVER, ledger).await?;

        Ok(vec!["-device".into(), format!("vfio-pci,host={}", addr)])
    }
}
