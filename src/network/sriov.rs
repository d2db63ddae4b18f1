//! SR-IOV passthrough networking on Mellanox ConnectX adapters.

use tracing::info;

use super::{NetworkMode, NetworkStrategy};
use crate::devices::sriov::LinkKind;
use crate::devices::DeviceBinder;
use crate::ledger::HostResourceLedger;
use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

/// Hands `vfs_per_vm` VFs of the first matching PF to every guest.
pub struct SriovNetwork {
    link: LinkKind,
    vfs_per_vm: usize,
}

impl SriovNetwork {
    pub fn ethernet(vfs_per_vm: usize) -> Self {
        Self {
            link: LinkKind::Ethernet,
            vfs_per_vm,
        }
    }

    pub fn infiniband(vfs_per_vm: usize) -> Self {
        Self {
            link: LinkKind::Infiniband,
            vfs_per_vm,
        }
    }
}

#[async_trait::async_trait]
impl NetworkStrategy for SriovNetwork {
    fn mode(&self) -> NetworkMode {
        match self.link {
            LinkKind::Ethernet => NetworkMode::MellanoxEthernet {
                vfs_per_vm: self.vfs_per_vm,
            },
            LinkKind::Infiniband => NetworkMode::MellanoxInfiniband {
                vfs_per_vm: self.vfs_per_vm,
            },
        }
    }

    async fn provision(
        &self,
        runner: &dyn CommandRunner,
        num_vms: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<()> {
        let binder = DeviceBinder::new(runner);
        let (ether, ib) = binder.find_physical_functions().await?;
        let candidates = match self.link {
            LinkKind::Ethernet => ether,
            LinkKind::Infiniband => ib,
        };
        let Some(pf) = candidates.into_iter().next() else {
            return Err(Error::Discovery(format!(
                "no ConnectX {:?} physical function found",
                self.link
            )));
        };
        info!("using {} ({}) as the VF source", pf.ifname, pf.address);

        let needed = num_vms * self.vfs_per_vm;
        binder
            .provision_virtual_functions(&pf, needed as u32, ledger)
            .await?;
        runner
            .run(&HostCommand::sudo("ip").args(["link", "set", &pf.ifname, "up"]))
            .await?;

        let vfs = binder.find_virtual_functions(&pf).await?;
        binder.load_passthrough_modules().await?;
        let assigned = binder
            .passthrough_virtual_functions(&pf, &vfs, needed, ledger)
            .await?;
        ledger.vf_assignments = assigned;
        Ok(())
    }

    fn qemu_args(
        &self,
        _host_id: usize,
        vm_id: usize,
        ledger: &HostResourceLedger,
    ) -> Result<Vec<String>> {
        let vfs = ledger.vfs_for(vm_id, self.vfs_per_vm);
        if vfs.len() < self.vfs_per_vm {
            return Err(Error::Capacity(format!(
                "vm{} needs {} VFs but only {} are assigned",
                vm_id,
                self.vfs_per_vm,
                vfs.len()
            )));
        }
        Ok(vfs
            .iter()
            .flat_map(|vf| {
                [
                    "-device".to_string(),
                    format!("vfio-pci,host={}", vf),
                    "-nic".to_string(),
                    "none".to_string(),
                ]
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    const LSHW: &str = "pci@0000:41:00.0  enp65s0f0np0    network        MT28908 Family [ConnectX-6]
pci@0000:41:00.2  enp65s0f0v0     network        ConnectX Family mlx5Gen Virtual Function
pci@0000:41:00.3  enp65s0f0v1     network        ConnectX Family mlx5Gen Virtual Function
pci@0000:41:00.4  enp65s0f0v2     network        ConnectX Family mlx5Gen Virtual Function
pci@0000:41:00.5  enp65s0f0v3     network        ConnectX Family mlx5Gen Virtual Function
";

    fn runner(current_vfs: &str) -> MockRunner {
        MockRunner::new()
            .on_stdout("lshw", LSHW)
            .on_stdout(
                "address show enp65s0f0np0",
                r#"[{"ifname":"enp65s0f0np0","link_type":"ether"}]"#,
            )
            .on_stdout("sudo cat", current_vfs)
    }

    #[tokio::test]
    async fn test_provision_assigns_vfs_sequentially() {
        let runner = runner("16\n");
        let mut ledger = HostResourceLedger::new();
        let net = SriovNetwork::ethernet(2);
        net.provision(&runner, 2, &mut ledger).await.unwrap();

        assert_eq!(ledger.vf_assignments.len(), 4);
        let args = net.qemu_args(0, 1, &ledger).unwrap();
        assert_eq!(
            args,
            vec![
                "-device",
                "vfio-pci,host=0000:41:00.4",
                "-nic",
                "none",
                "-device",
                "vfio-pci,host=0000:41:00.5",
                "-nic",
                "none"
            ]
        );
        let cmds = runner.commands();
        let pos = |c: &str| cmds.iter().position(|x| x.contains(c)).unwrap();
        assert!(pos("link set enp65s0f0np0 up") < pos("modprobe vfio"));
        assert!(pos("modprobe vfio_iommu_type1") < pos("vf 0 state enable"));
    }

    #[tokio::test]
    async fn test_provision_without_pf_is_discovery_error() {
        let runner = runner("16\n");
        let mut ledger = HostResourceLedger::new();
        let err = SriovNetwork::infiniband(1)
            .provision(&runner, 1, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[tokio::test]
    async fn test_too_few_vfs_found_is_capacity_error() {
        let runner = runner("16\n");
        let mut ledger = HostResourceLedger::new();
        let err = SriovNetwork::ethernet(3)
            .provision(&runner, 2, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(runner.matching("set-override").is_empty());
    }

    #[test]
    fn test_qemu_args_without_assignment_fail() {
        let err = SriovNetwork::ethernet(1)
            .qemu_args(0, 0, &HostResourceLedger::new())
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }
}
