//! Fleet network provisioning
//!
//! One of two mutually exclusive strategies is chosen per fleet:
//! - Bridge + TAP: a host bridge with one TAP per VM ([`bridge`])
//! - SR-IOV passthrough: ConnectX VFs handed to guests through vfio ([`sriov`])
//!
//! Guest addresses come from [`IpPlan`], a pure function of
//! `(host_id, vm_id, nic_index)`, so several hosts emulating one cluster
//! never collide. Guest-side config files are rendered in [`guest`].

pub mod bridge;
pub mod guest;
pub mod sriov;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::HostResourceLedger;
use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

/// Host bridge used in bridge mode
pub const BRIDGE_NAME: &str = "br0";

/// Host-side snapshot of the firewall taken before networking is touched.
pub const FIREWALL_SNAPSHOT: &str = "iptables.rules.old";

/// First host port of the optional user-mode SSH forward.
pub const USER_SSH_BASE_PORT: u16 = 10022;

/// Guest subnet, shared by every host of an emulated cluster.
pub fn fleet_subnet() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(192, 168, 100, 0), 24).unwrap_or_default()
}

/// Bridge address (first host of the subnet).
pub fn bridge_address() -> Ipv4Addr {
    let net = fleet_subnet();
    Ipv4Addr::from(u32::from(net.network()) + 1)
}

/// Networking strategy, chosen once per fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Bridge,
    MellanoxEthernet {
        vfs_per_vm: usize,
    },
    MellanoxInfiniband {
        vfs_per_vm: usize,
    },
}

impl NetworkMode {
    /// Statically addressed Ethernet NICs per guest
    pub fn ether_nics_per_vm(&self) -> usize {
        match self {
            NetworkMode::Bridge | NetworkMode::MellanoxInfiniband { .. } => 1,
            NetworkMode::MellanoxEthernet { vfs_per_vm } => *vfs_per_vm,
        }
    }

    /// Statically addressed InfiniBand NICs per guest
    pub fn ib_nics_per_vm(&self) -> usize {
        match self {
            NetworkMode::MellanoxInfiniband { vfs_per_vm } => *vfs_per_vm,
            _ => 0,
        }
    }

    pub fn vfs_per_vm(&self) -> usize {
        match self {
            NetworkMode::Bridge => 0,
            NetworkMode::MellanoxEthernet { vfs_per_vm }
            | NetworkMode::MellanoxInfiniband { vfs_per_vm } => *vfs_per_vm,
        }
    }

    /// Whether any host PCI device is handed to guests
    pub fn uses_passthrough(&self) -> bool {
        !matches!(self, NetworkMode::Bridge)
    }
}

/// Static address assignment for a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPlan {
    pub host_id: usize,
    pub num_vms: usize,
    pub ether_per_vm: usize,
    pub ib_per_vm: usize,
}

/// Addresses of one guest, in NIC order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuestAddresses {
    pub ether: Vec<Ipv4Addr>,
    pub ib: Vec<Ipv4Addr>,
}

impl GuestAddresses {
    /// Last address handed out; used for the guest's own `/etc/hosts` entry.
    pub fn last(&self) -> Option<Ipv4Addr> {
        self.ib.last().or(self.ether.last()).copied()
    }
}

impl IpPlan {
    pub fn new(mode: NetworkMode, host_id: usize, num_vms: usize) -> Self {
        Self {
            host_id,
            num_vms,
            ether_per_vm: mode.ether_nics_per_vm(),
            ib_per_vm: mode.ib_nics_per_vm(),
        }
    }

    pub fn nics_per_vm(&self) -> usize {
        self.ether_per_vm + self.ib_per_vm
    }

    /// Host part of NIC `nic_index` of `vm_id`. Ethernet NICs come first,
    /// then InfiniBand NICs.
    pub fn host_index(&self, vm_id: usize, nic_index: usize) -> usize {
        let per_vm = self.nics_per_vm();
        2 + self.host_id * self.num_vms * per_vm + vm_id * per_vm + nic_index
    }

    pub fn address(&self, vm_id: usize, nic_index: usize) -> Result<Ipv4Addr> {
        let net = fleet_subnet();
        let index = self.host_index(vm_id, nic_index);
        let last_host = u32::from(net.broadcast()) - u32::from(net.network()) - 1;
        if index as u64 > u64::from(last_host) {
            return Err(Error::Capacity(format!(
                "address index {} for host {} vm{} nic{} is outside {}",
                index, self.host_id, vm_id, nic_index, net
            )));
        }
        Ok(Ipv4Addr::from(u32::from(net.network()) + index as u32))
    }

    /// Every address of `vm_id`.
    pub fn vm_addresses(&self, vm_id: usize) -> Result<GuestAddresses> {
        let ether = (0..self.ether_per_vm)
            .map(|i| self.address(vm_id, i))
            .collect::<Result<Vec<_>>>()?;
        let ib = (0..self.ib_per_vm)
            .map(|i| self.address(vm_id, self.ether_per_vm + i))
            .collect::<Result<Vec<_>>>()?;
        Ok(GuestAddresses { ether, ib })
    }

    /// Check that the whole fleet fits in the subnet.
    pub fn validate(&self) -> Result<()> {
        if self.num_vms == 0 || self.nics_per_vm() == 0 {
            return Ok(());
        }
        self.address(self.num_vms - 1, self.nics_per_vm() - 1)
            .map(|_| ())
    }
}

/// Deterministic MAC of the primary NIC of `vm_id` on `host_id`.
pub fn mac_address(host_id: usize, vm_id: usize) -> String {
    format!("DE:AD:BE:EF:{:02X}:{:02X}", host_id & 0xff, vm_id & 0xff)
}

/// QEMU arguments for the optional user-mode NIC forwarding SSH.
pub fn user_ssh_args(vm_id: usize) -> Vec<String> {
    let port = USER_SSH_BASE_PORT as usize + vm_id;
    vec![
        "-device".into(),
        format!("virtio-net-pci,netdev=netssh{}", vm_id),
        "-netdev".into(),
        format!("user,id=netssh{},hostfwd=tcp::{}-:22", vm_id, port),
    ]
}

/// Knobs shared by the strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Owner of created TAP devices
    pub tap_owner: String,
    /// Upper bound on waiting for a TAP link to come up
    pub link_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            tap_owner: tap_owner_from_env(),
            link_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// `USERNAME`, then `USER`, then `root`.
pub fn tap_owner_from_env() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "root".to_string())
}

/// One fleet-wide networking strategy.
#[async_trait::async_trait]
pub trait NetworkStrategy: Send + Sync {
    fn mode(&self) -> NetworkMode;

    /// Create the host side of the network for `num_vms` guests.
    async fn provision(
        &self,
        runner: &dyn CommandRunner,
        num_vms: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<()>;

    /// QEMU arguments attaching `vm_id` to the provisioned network.
    fn qemu_args(
        &self,
        host_id: usize,
        vm_id: usize,
        ledger: &HostResourceLedger,
    ) -> Result<Vec<String>>;
}

/// Strategy for `mode`.
pub fn create_strategy(mode: NetworkMode, settings: NetworkSettings) -> Box<dyn NetworkStrategy> {
    match mode {
        NetworkMode::Bridge => Box::new(bridge::BridgeNetwork::new(settings)),
        NetworkMode::MellanoxEthernet { vfs_per_vm } => {
            Box::new(sriov::SriovNetwork::ethernet(vfs_per_vm))
        }
        NetworkMode::MellanoxInfiniband { vfs_per_vm } => {
            Box::new(sriov::SriovNetwork::infiniband(vfs_per_vm))
        }
    }
}

/// Runs the selected strategy with the common host preparation around it.
pub struct NetworkProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    strategy: Box<dyn NetworkStrategy>,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, mode: NetworkMode, settings: NetworkSettings) -> Self {
        Self {
            runner,
            strategy: create_strategy(mode, settings),
        }
    }

    pub fn strategy(&self) -> &dyn NetworkStrategy {
        self.strategy.as_ref()
    }

    /// Snapshot the firewall, enable forwarding, then provision.
    pub async fn provision(
        &self,
        vmdir: &Path,
        num_vms: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<()> {
        let snapshot = snapshot_firewall(self.runner, vmdir).await?;
        ledger.firewall_snapshot = Some(snapshot);
        self.runner
            .run(&HostCommand::sudo("sysctl").args(["-w", "net.ipv4.ip_forward=1"]))
            .await?;
        info!("provisioning {:?} network for {} VMs", self.strategy.mode(), num_vms);
        self.strategy.provision(self.runner, num_vms, ledger).await
    }
}

/// Save `iptables-save` output to `<vmdir>/iptables.rules.old`.
///
/// Nothing restores it automatically.
pub async fn snapshot_firewall(runner: &dyn CommandRunner, vmdir: &Path) -> Result<PathBuf> {
    let out = runner.run(&HostCommand::sudo("iptables-save")).await?;
    let path = vmdir.join(FIREWALL_SNAPSHOT);
    tokio::fs::write(&path, out.stdout.as_bytes()).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::runner::MockRunner;

    #[test]
    fn test_ip_plan_bridge_layout() {
        let plan = IpPlan::new(NetworkMode::Bridge, 0, 2);
        assert_eq!(plan.address(0, 0).unwrap(), Ipv4Addr::new(192, 168, 100, 2));
        assert_eq!(plan.address(1, 0).unwrap(), Ipv4Addr::new(192, 168, 100, 3));
        let host1 = IpPlan::new(NetworkMode::Bridge, 1, 2);
        assert_eq!(host1.address(0, 0).unwrap(), Ipv4Addr::new(192, 168, 100, 4));
    }

    #[test]
    fn test_ip_plan_is_injective_across_hosts() {
        let mode = NetworkMode::MellanoxInfiniband { vfs_per_vm: 2 };
        let mut seen = HashSet::new();
        for host_id in 0..4 {
            let plan = IpPlan::new(mode, host_id, 5);
            plan.validate().unwrap();
            for vm_id in 0..5 {
                for nic in 0..plan.nics_per_vm() {
                    let addr = plan.address(vm_id, nic).unwrap();
                    assert!(seen.insert(addr), "duplicate {addr}");
                    assert_ne!(addr, bridge_address());
                }
            }
        }
        assert_eq!(seen.len(), 4 * 5 * 3);
    }

    #[test]
    fn test_ip_plan_rejects_overflow() {
        let plan = IpPlan::new(NetworkMode::MellanoxEthernet { vfs_per_vm: 4 }, 1, 40);
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        // .254 is the last usable address.
        let edge = IpPlan::new(NetworkMode::Bridge, 0, 253);
        assert_eq!(edge.address(252, 0).unwrap(), Ipv4Addr::new(192, 168, 100, 254));
        assert!(edge.validate().is_ok());
        assert!(IpPlan::new(NetworkMode::Bridge, 0, 254).validate().is_err());
    }

    #[test]
    fn test_vm_addresses_orders_ether_before_ib() {
        let plan = IpPlan::new(NetworkMode::MellanoxInfiniband { vfs_per_vm: 1 }, 0, 2);
        let addrs = plan.vm_addresses(1).unwrap();
        assert_eq!(addrs.ether, vec![Ipv4Addr::new(192, 168, 100, 4)]);
        assert_eq!(addrs.ib, vec![Ipv4Addr::new(192, 168, 100, 5)]);
        assert_eq!(addrs.last(), Some(Ipv4Addr::new(192, 168, 100, 5)));
    }

    #[test]
    fn test_mac_is_deterministic() {
        assert_eq!(mac_address(1, 10), "DE:AD:BE:EF:01:0A");
        assert_eq!(mac_address(1, 10), mac_address(1, 10));
        assert_ne!(mac_address(0, 1), mac_address(1, 0));
    }

    #[test]
    fn test_user_ssh_port() {
        let args = user_ssh_args(3);
        assert_eq!(args[3], "user,id=netssh3,hostfwd=tcp::10025-:22");
    }

    #[tokio::test]
    async fn test_snapshot_firewall_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new().on_stdout("iptables-save", "*filter\n:INPUT ACCEPT [0:0]\nCOMMIT\n");
        let path = snapshot_firewall(&runner, dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join(FIREWALL_SNAPSHOT));
        let saved = std::fs::read_to_string(path).unwrap();
        assert!(saved.starts_with("*filter"));
    }
}
