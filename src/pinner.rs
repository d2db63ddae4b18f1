//! vCPU thread pinning.
//!
//! vCPU `cpu_index` of VM `vm_id` is the fleet-global vCPU
//! `vm_id * num_cpus + cpu_index` and is pinned to entry
//! `global % len` of the flattened host topology. The wrap-around lets the
//! fleet hold more vCPUs than there are host CPUs to pin to.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::qmp::protocol::CpuInfoFast;
use crate::qmp::QmpClient;
use crate::runner::{CommandRunner, HostCommand};
use crate::topology::CpuLine;
use crate::{Error, Result};

/// Where one vCPU thread ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAssignment {
    pub vm_id: usize,
    pub cpu_index: u32,
    pub thread_id: i64,
    pub host_cpu: u32,
}

/// Map the vCPUs of `vm_id` onto `topology`.
pub fn plan_pinning(
    topology: &[CpuLine],
    vm_id: usize,
    num_cpus: usize,
    vcpus: &[CpuInfoFast],
) -> Result<Vec<PinAssignment>> {
    if topology.is_empty() {
        return Err(Error::Discovery("no host CPUs available for pinning".into()));
    }
    Ok(vcpus
        .iter()
        .map(|vcpu| {
            let global = vm_id * num_cpus + vcpu.cpu_index as usize;
            PinAssignment {
                vm_id,
                cpu_index: vcpu.cpu_index,
                thread_id: vcpu.thread_id,
                host_cpu: topology[global % topology.len()].cpu,
            }
        })
        .collect())
}

/// Apply `plan` with `taskset`. Each thread is pinned independently; a
/// failure is logged and the rest still get pinned. Returns how many
/// threads were pinned.
pub async fn apply_pinning(runner: &dyn CommandRunner, plan: &[PinAssignment]) -> usize {
    let mut pinned = 0;
    for pin in plan {
        let out = runner
            .run_allow_fail(&HostCommand::new("taskset").args([
                "-pc".to_string(),
                pin.host_cpu.to_string(),
                pin.thread_id.to_string(),
            ]))
            .await;
        if out.success() {
            pinned += 1;
        } else {
            warn!(
                "vm{}: failed to pin vCPU {} (tid {}) to CPU {}: {}",
                pin.vm_id,
                pin.cpu_index,
                pin.thread_id,
                pin.host_cpu,
                out.stderr.trim()
            );
        }
    }
    pinned
}

/// Queries a VM's monitor and pins its vCPU threads.
pub struct Pinner<'a> {
    runner: &'a dyn CommandRunner,
    boot_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> Pinner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, boot_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            runner,
            boot_timeout,
            poll_interval,
        }
    }

    /// Wait for the monitor at `monitor` and list the VM's vCPUs.
    pub async fn query_vcpus(&self, monitor: &Path) -> Result<Vec<CpuInfoFast>> {
        let mut client = QmpClient::wait_ready(monitor, self.boot_timeout, self.poll_interval).await?;
        client.query_cpus_fast().await
    }

    /// Pin every vCPU of `vm_id`.
    pub async fn pin_vm(
        &self,
        topology: &[CpuLine],
        vm_id: usize,
        num_cpus: usize,
        monitor: &Path,
    ) -> Result<Vec<PinAssignment>> {
        let vcpus = self.query_vcpus(monitor).await?;
        let plan = plan_pinning(topology, vm_id, num_cpus, &vcpus)?;
        let pinned = apply_pinning(self.runner, &plan).await;
        info!("vm{}: pinned {}/{} vCPU threads", vm_id, pinned, plan.len());
        Ok(plan)
    }
}
