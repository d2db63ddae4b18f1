//! Mellanox ConnectX SR-IOV physical and virtual functions.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{is_connectx, DeviceBinder, PciAddress, MLX5_DRIVER, VFIO_DRIVER};
use crate::ledger::HostResourceLedger;
use crate::runner::HostCommand;
use crate::{Error, Result};

/// Number of VFs written to a PF that has none yet.
pub const VF_PROVISION_COUNT: u32 = 16;

/// Link layer of a physical function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Ethernet,
    Infiniband,
}

/// An SR-IOV capable ConnectX port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalFunction {
    pub address: PciAddress,
    pub ifname: String,
    pub link: LinkKind,
}

impl PhysicalFunction {
    /// sysfs attribute holding the VF count.
    ///
    /// InfiniBand ports use the mlx5-specific attribute; Ethernet ports the
    /// generic one.
    pub fn vf_count_attr(&self) -> String {
        let attr = match self.link {
            LinkKind::Ethernet => "sriov_numvfs",
            LinkKind::Infiniband => "mlx5_num_vfs",
        };
        format!("/sys/class/net/{}/device/{}", self.ifname, attr)
    }
}

/// A virtual function belonging to some ConnectX PF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFunction {
    pub address: PciAddress,
    pub ifname: String,
}

/// One ConnectX row of `lshw -c network -businfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LshwNic {
    pub address: PciAddress,
    pub ifname: String,
    pub virtual_function: bool,
}

/// Parse `lshw -c network -businfo`, keeping only ConnectX rows that have a
/// network interface.
pub fn parse_lshw_connectx(text: &str) -> Vec<LshwNic> {
    text.lines()
        .filter(|line| is_connectx(line))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let bus = cols.next()?;
            let ifname = cols.next()?;
            if !bus.starts_with("pci@") || ifname == "network" {
                return None;
            }
            Some(LshwNic {
                address: bus.parse().ok()?,
                ifname: ifname.to_string(),
                virtual_function: line.to_ascii_lowercase().contains("virtual function"),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    link_type: String,
}

/// Interface name with a trailing `v<N>` VF suffix removed.
fn vf_stem(ifname: &str) -> &str {
    let without_digits = ifname.trim_end_matches(|c: char| c.is_ascii_digit());
    without_digits.strip_suffix('v').unwrap_or(ifname)
}

impl DeviceBinder<'_> {
    async fn lshw_connectx(&self) -> Result<Vec<LshwNic>> {
        let out = self
            .runner()
            .run(&HostCommand::sudo("lshw").args(["-c", "network", "-businfo"]))
            .await
            .map_err(|e| Error::Discovery(format!("lshw failed: {}", e)))?;
        Ok(parse_lshw_connectx(&out.stdout))
    }

    /// Find ConnectX physical functions, split into (Ethernet, InfiniBand).
    pub async fn find_physical_functions(
        &self,
    ) -> Result<(Vec<PhysicalFunction>, Vec<PhysicalFunction>)> {
        let mut ether = Vec::new();
        let mut ib = Vec::new();
        for nic in self.lshw_connectx().await? {
            if nic.virtual_function {
                continue;
            }
            let out = self
                .runner()
                .run(&HostCommand::new("ip").args(["-j", "address", "show"]).arg(&nic.ifname))
                .await?;
            let links: Vec<IpLink> = serde_json::from_str(&out.stdout).map_err(|e| {
                Error::Discovery(format!("unparsable `ip -j` output for {}: {}", nic.ifname, e))
            })?;
            let Some(link) = links.into_iter().next() else {
                continue;
            };
            let kind = match link.link_type.as_str() {
                "ether" => LinkKind::Ethernet,
                "infiniband" => LinkKind::Infiniband,
                _ => continue,
            };
            let pf = PhysicalFunction {
                address: nic.address,
                ifname: link.ifname,
                link: kind,
            };
            match kind {
                LinkKind::Ethernet => ether.push(pf),
                LinkKind::Infiniband => ib.push(pf),
            }
        }
        Ok((ether, ib))
    }

    /// Find the VFs spawned by `pf`, in lshw order.
    pub async fn find_virtual_functions(
        &self,
        pf: &PhysicalFunction,
    ) -> Result<Vec<VirtualFunction>> {
        Ok(self
            .lshw_connectx()
            .await?
            .into_iter()
            .filter(|nic| nic.virtual_function && pf.ifname.contains(vf_stem(&nic.ifname)))
            .map(|nic| VirtualFunction {
                address: nic.address,
                ifname: nic.ifname,
            })
            .collect())
    }

    /// Make sure `pf` exposes at least `desired` VFs and return the count.
    ///
    /// A PF with no VFs gets [`VF_PROVISION_COUNT`] written. A PF that is
    /// already provisioned is never re-provisioned (VFs may be in use), so an
    /// undersupply is a capacity error and nothing is written.
    pub async fn provision_virtual_functions(
        &self,
        pf: &PhysicalFunction,
        desired: u32,
        ledger: &mut HostResourceLedger,
    ) -> Result<u32> {
        let attr = pf.vf_count_attr();
        let out = self.runner().run(&HostCommand::sudo("cat").arg(&attr)).await?;
        let current: u32 = out.stdout.trim().parse().map_err(|_| {
            Error::Discovery(format!("unexpected VF count {:?} in {}", out.stdout.trim(), attr))
        })?;

        if current == 0 {
            if desired > VF_PROVISION_COUNT {
                return Err(Error::Capacity(format!(
                    "{} VFs requested but {} provisions only {}",
                    desired, pf.ifname, VF_PROVISION_COUNT
                )));
            }
            info!("provisioning {} VFs on {}", VF_PROVISION_COUNT, pf.ifname);
            self.runner()
                .run(&HostCommand::sudo_shell(format!(
                    "echo {} > {}",
                    VF_PROVISION_COUNT, attr
                )))
                .await?;
            ledger.record_vf_count(&pf.ifname, VF_PROVISION_COUNT);
            return Ok(VF_PROVISION_COUNT);
        }

        if desired > current {
            return Err(Error::Capacity(format!(
                "{} already has {} VFs but {} are needed",
                pf.ifname, current, desired
            )));
        }
        ledger.record_vf_count(&pf.ifname, current);
        Ok(current)
    }

    /// Enable the first `count` VFs of `pf` and hand them to `vfio-pci`.
    ///
    /// Returns their PCI addresses in assignment order. The vfio modules must
    /// already be loaded.
    pub async fn passthrough_virtual_functions(
        &self,
        pf: &PhysicalFunction,
        vfs: &[VirtualFunction],
        count: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<Vec<PciAddress>> {
        if vfs.len() < count {
            return Err(Error::Capacity(format!(
                "{} exposes {} VFs but {} are needed",
                pf.ifname,
                vfs.len(),
                count
            )));
        }

        let mut assigned = Vec::with_capacity(count);
        for (i, vf) in vfs.iter().take(count).enumerate() {
            self.runner()
                .run(
                    &HostCommand::sudo("ip")
                        .args(["link", "set", &pf.ifname, "vf"])
                        .arg(i.to_string())
                        .args(["state", "enable"]),
                )
                .await?;
            self.unbind_from(&vf.address, MLX5_DRIVER, ledger).await?;
            self.bind_override(&vf.address, VFIO_DRIVER, ledger).await?;
            assigned.push(vf.address.clone());
        }
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    const LSHW: &str = "Bus info          Device          Class          Description
=============================================================
pci@0000:21:00.0  eno1            network        I350 Gigabit Network Connection
pci@0000:41:00.0  enp65s0f0np0    network        MT28908 Family [ConnectX-6]
pci@0000:41:00.1  ibp65s0f1       network        MT28908 Family [ConnectX-6]
pci@0000:41:00.2  enp65s0f0v0     network        ConnectX Family mlx5Gen Virtual Function
pci@0000:41:00.3  enp65s0f0v1     network        ConnectX Family mlx5Gen Virtual Function
pci@0000:41:00.4                  network        ConnectX Family mlx5Gen Virtual Function
";

    fn ether_pf() -> PhysicalFunction {
        PhysicalFunction {
            address: "0000:41:00.0".parse().unwrap(),
            ifname: "enp65s0f0np0".into(),
            link: LinkKind::Ethernet,
        }
    }

    #[test]
    fn test_parse_lshw_connectx() {
        let nics = parse_lshw_connectx(LSHW);
        assert_eq!(nics.len(), 4);
        assert!(!nics[0].virtual_function);
        assert!(nics[2].virtual_function);
        assert_eq!(nics[3].ifname, "enp65s0f0v1");
    }

    #[test]
    fn test_vf_stem() {
        assert_eq!(vf_stem("enp65s0f0v12"), "enp65s0f0");
        assert_eq!(vf_stem("enp65s0f0np0"), "enp65s0f0np0");
    }

    #[tokio::test]
    async fn test_find_physical_functions_splits_by_link_type() {
        let runner = MockRunner::new()
            .on_stdout("lshw", LSHW)
            .on_stdout(
                "show enp65s0f0np0",
                r#"[{"ifindex":4,"ifname":"enp65s0f0np0","link_type":"ether","addr_info":[]}]"#,
            )
            .on_stdout(
                "show ibp65s0f1",
                r#"[{"ifindex":5,"ifname":"ibp65s0f1","link_type":"infiniband","addr_info":[]}]"#,
            );
        let (ether, ib) = DeviceBinder::new(&runner)
            .find_physical_functions()
            .await
            .unwrap();
        assert_eq!(ether, vec![ether_pf()]);
        assert_eq!(ib.len(), 1);
        assert_eq!(ib[0].ifname, "ibp65s0f1");
        assert_eq!(
            ib[0].vf_count_attr(),
            "/sys/class/net/ibp65s0f1/device/mlx5_num_vfs"
        );
    }

    #[tokio::test]
    async fn test_find_virtual_functions_matches_stem() {
        let runner = MockRunner::new().on_stdout("lshw", LSHW);
        let vfs = DeviceBinder::new(&runner)
            .find_virtual_functions(&ether_pf())
            .await
            .unwrap();
        let names: Vec<&str> = vfs.iter().map(|v| v.ifname.as_str()).collect();
        assert_eq!(names, vec!["enp65s0f0v0", "enp65s0f0v1"]);
    }

    #[tokio::test]
    async fn test_provision_fresh_pf_writes_fixed_count() {
        let runner = MockRunner::new().on_stdout("sudo cat", "0\n");
        let mut ledger = HostResourceLedger::new();
        let n = DeviceBinder::new(&runner)
            .provision_virtual_functions(&ether_pf(), 4, &mut ledger)
            .await
            .unwrap();
        assert_eq!(n, VF_PROVISION_COUNT);
        assert_eq!(
            runner.matching("echo 16 >"),
            vec!["sudo sh -c 'echo 16 > /sys/class/net/enp65s0f0np0/device/sriov_numvfs'"]
        );
        assert_eq!(ledger.vf_counts.get("enp65s0f0np0"), Some(&16));
    }

    #[tokio::test]
    async fn test_provision_undersupply_fails_without_write() {
        let runner = MockRunner::new().on_stdout("sudo cat", "4\n");
        let mut ledger = HostResourceLedger::new();
        let err = DeviceBinder::new(&runner)
            .provision_virtual_functions(&ether_pf(), 8, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(runner.matching("echo").is_empty());
        assert!(ledger.vf_counts.is_empty());
    }

    #[tokio::test]
    async fn test_provision_oversupply_is_accepted() {
        let runner = MockRunner::new().on_stdout("sudo cat", "16\n");
        let mut ledger = HostResourceLedger::new();
        let n = DeviceBinder::new(&runner)
            .provision_virtual_functions(&ether_pf(), 2, &mut ledger)
            .await
            .unwrap();
        assert_eq!(n, 16);
        assert!(runner.matching("echo").is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_tolerates_already_unbound() {
        let runner = MockRunner::new().on_fail("drivers/mlx5_core/unbind", "No such device");
        let mut ledger = HostResourceLedger::new();
        let vfs = vec![
            VirtualFunction {
                address: "0000:41:00.2".parse().unwrap(),
                ifname: "enp65s0f0v0".into(),
            },
            VirtualFunction {
                address: "0000:41:00.3".parse().unwrap(),
                ifname: "enp65s0f0v1".into(),
            },
        ];
        let assigned = DeviceBinder::new(&runner)
            .passthrough_virtual_functions(&ether_pf(), &vfs, 2, &mut ledger)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(runner.matching("set-override").len(), 2);
        assert_eq!(
            runner.matching("vf 1 state enable"),
            vec!["sudo ip link set enp65s0f0np0 vf 1 state enable"]
        );
    }

    #[tokio::test]
    async fn test_passthrough_needs_enough_vfs() {
        let runner = MockRunner::new();
        let mut ledger = HostResourceLedger::new();
        let err = DeviceBinder::new(&runner)
            .passthrough_virtual_functions(&ether_pf(), &[], 1, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }
}
