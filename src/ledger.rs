//! Record of the host state a fleet has touched.
//!
//! Driver overrides, bridge/TAP devices, VF counts and the fabric mount are
//! global host state. Every component that changes them writes the change
//! here, and the ledger is persisted next to the VMs so a later
//! `RestartVm` can reuse the fleet-wide resources without redoing global
//! setup. The kernel remains the source of truth; the ledger is what this
//! fleet believes it did.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::devices::gpu::GpuInventory;
use crate::devices::{BoundDevice, DriverBinding, PciAddress};
use crate::fabric::SharedFabricHandle;
use crate::{Error, Result};

/// File name of the persisted ledger inside the VM directory.
pub const LEDGER_FILE: &str = "ledger.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResourceLedger {
    pub fleet_id: Uuid,
    pub created_ms: u64,
    /// At most one entry per PCI address
    #[serde(default)]
    pub overrides: BTreeMap<PciAddress, BoundDevice>,
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub taps: Vec<String>,
    /// VF count found or written, per PF interface name
    #[serde(default)]
    pub vf_counts: BTreeMap<String, u32>,
    /// VFs handed to guests, indexed by `vm_id * vfs_per_vm + i`
    #[serde(default)]
    pub vf_assignments: Vec<PciAddress>,
    #[serde(default)]
    pub gpus: GpuInventory,
    #[serde(default)]
    pub fabric_mount: Option<PathBuf>,
    #[serde(default)]
    pub fabric: Option<SharedFabricHandle>,
    #[serde(default)]
    pub firmware_copied: bool,
    #[serde(default)]
    pub firewall_snapshot: Option<PathBuf>,
}

impl Default for HostResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HostResourceLedger {
    /// Empty ledger for a new fleet.
    pub fn new() -> Self {
        Self {
            fleet_id: Uuid::now_v7(),
            created_ms: now_ms(),
            overrides: BTreeMap::new(),
            bridge: None,
            taps: Vec::new(),
            vf_counts: BTreeMap::new(),
            vf_assignments: Vec::new(),
            gpus: GpuInventory::default(),
            fabric_mount: None,
            fabric: None,
            firmware_copied: false,
            firewall_snapshot: None,
        }
    }

    /// Record that `addr` now has `binding`, replacing any earlier entry.
    pub fn record_override(&mut self, addr: PciAddress, binding: DriverBinding) {
        self.overrides.insert(
            addr.clone(),
            BoundDevice {
                address: addr,
                binding,
            },
        );
    }

    pub fn clear_override(&mut self, addr: &PciAddress) {
        self.overrides.remove(addr);
    }

    pub fn active_override(&self, addr: &PciAddress) -> Option<&BoundDevice> {
        self.overrides.get(addr)
    }

    pub fn record_vf_count(&mut self, pf: &str, count: u32) {
        self.vf_counts.insert(pf.to_string(), count);
    }

    /// VFs assigned to `vm_id`, in NIC order.
    pub fn vfs_for(&self, vm_id: usize, vfs_per_vm: usize) -> &[PciAddress] {
        let start = (vm_id * vfs_per_vm).min(self.vf_assignments.len());
        let end = (start + vfs_per_vm).min(self.vf_assignments.len());
        &self.vf_assignments[start..end]
    }

    pub fn path(vmdir: &Path) -> PathBuf {
        vmdir.join(LEDGER_FILE)
    }

    /// Load the ledger written by an earlier global setup.
    pub fn load(vmdir: &Path) -> Result<Self> {
        let path = Self::path(vmdir);
        let data = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "no fleet ledger at {} (was the fleet started?): {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("invalid ledger file {}: {e}", path.display())))
    }

    pub fn save(&self, vmdir: &Path) -> Result<()> {
        fs::create_dir_all(vmdir)
            .map_err(|e| Error::Config(format!("failed to create {}: {e}", vmdir.display())))?;
        let path = Self::path(vmdir);
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Config(format!("serialize ledger failed: {e}")))?;
        fs::write(&path, data)
            .map_err(|e| Error::Config(format!("failed writing {}: {e}", path.display())))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
