//! Host CPU topology discovery.
//!
//! Logical CPUs are grouped by *socket*, not by NUMA node. On some BIOS
//! configurations the NUMA node column numbers sub-socket chiplets while the
//! socket column stays stable, so socket is the portable grouping key.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

/// One row of `lscpu -p`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLine {
    pub cpu: u32,
    pub core: u32,
    pub socket: u32,
    pub node: u32,
}

/// Parse `lscpu -p` and keep the CPUs on `socket`, ordered by core id.
///
/// The sort is stable, so hyperthread siblings keep their enumeration order.
pub fn parse_lscpu(text: &str, socket: u32) -> Result<Vec<CpuLine>> {
    let mut cpus = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let mut next = |name: &str| -> Result<u32> {
            let raw = fields.next().unwrap_or_default();
            raw.parse().map_err(|_| {
                Error::Discovery(format!("bad {} field {:?} in lscpu line {:?}", name, raw, line))
            })
        };
        let cpu = CpuLine {
            cpu: next("cpu")?,
            core: next("core")?,
            socket: next("socket")?,
            node: next("node")?,
        };
        if cpu.socket == socket {
            cpus.push(cpu);
        }
    }
    cpus.sort_by_key(|c| c.core);
    Ok(cpus)
}

/// CPUs on `socket` of the running host.
pub async fn discover_node(runner: &dyn CommandRunner, socket: u32) -> Result<Vec<CpuLine>> {
    let out = runner
        .run(&HostCommand::new("lscpu").arg("-p"))
        .await
        .map_err(|e| Error::Discovery(format!("lscpu failed: {}", e)))?;
    let cpus = parse_lscpu(&out.stdout, socket)?;
    debug!("socket {} has {} logical CPUs", socket, cpus.len());
    Ok(cpus)
}

/// Concatenate the per-socket lists of `sockets`, in the order given.
pub async fn discover_nodes(runner: &dyn CommandRunner, sockets: &[u32]) -> Result<Vec<CpuLine>> {
    let out = runner
        .run(&HostCommand::new("lscpu").arg("-p"))
        .await
        .map_err(|e| Error::Discovery(format!("lscpu failed: {}", e)))?;
    let mut all = Vec::new();
    for socket in sockets {
        all.extend(parse_lscpu(&out.stdout, *socket)?);
    }
    Ok(all)
}

/// Host CPU family, as far as the guest CPU model is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuKind {
    Intel,
    AmdEpyc,
    Other,
}

impl CpuKind {
    /// Value for QEMU's `-cpu`. EPYC hosts need the topology extensions
    /// spelled out for SMT to be visible in the guest.
    pub fn qemu_model(&self) -> &'static str {
        match self {
            CpuKind::AmdEpyc => "EPYC,topoext",
            CpuKind::Intel | CpuKind::Other => "host",
        }
    }
}

impl fmt::Display for CpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuKind::Intel => write!(f, "Intel"),
            CpuKind::AmdEpyc => write!(f, "AMD EPYC"),
            CpuKind::Other => write!(f, "other"),
        }
    }
}

/// Classify the output of plain `lscpu`.
pub fn parse_cpu_kind(text: &str) -> CpuKind {
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Vendor ID" if value.contains("Intel") => return CpuKind::Intel,
            "Model name" if value.contains("EPYC") => return CpuKind::AmdEpyc,
            _ => {}
        }
    }
    CpuKind::Other
}

pub async fn detect_cpu_kind(runner: &dyn CommandRunner) -> Result<CpuKind> {
    let out = runner
        .run(&HostCommand::new("lscpu"))
        .await
        .map_err(|e| Error::Discovery(format!("lscpu failed: {}", e)))?;
    Ok(parse_cpu_kind(&out.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    const LSCPU_P: &str = "# The following is the parsable format, which can be fed to other
# programs. Each different item in every column has an unique ID
# starting from zero.
# CPU,Core,Socket,Node,,L1d,L1i,L2,L3
0,0,0,0,,0,0,0,0
1,1,0,1,,1,1,1,0
2,0,1,4,,2,2,2,1
3,1,1,5,,3,3,3,1
4,0,0,0,,0,0,0,0
5,1,0,1,,1,1,1,0
";

    #[test]
    fn test_parse_lscpu_filters_by_socket_and_sorts_by_core() {
        let cpus = parse_lscpu(LSCPU_P, 0).unwrap();
        let ids: Vec<u32> = cpus.iter().map(|c| c.cpu).collect();
        // Siblings on the same core keep enumeration order.
        assert_eq!(ids, vec![0, 4, 1, 5]);
        assert!(cpus.iter().all(|c| c.socket == 0));
        assert!(cpus.windows(2).all(|w| w[0].core <= w[1].core));
    }

    #[test]
    fn test_parse_lscpu_uses_socket_not_node() {
        let cpus = parse_lscpu(LSCPU_P, 1).unwrap();
        let nodes: Vec<u32> = cpus.iter().map(|c| c.node).collect();
        assert_eq!(nodes, vec![4, 5]);
    }

    #[test]
    fn test_parse_lscpu_rejects_garbage() {
        let err = parse_lscpu("0,zero,0,0\n", 0).unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(parse_lscpu("0,0\n", 0).is_err());
    }

    #[test]
    fn test_parse_cpu_kind() {
        let amd = "Architecture: x86_64\nVendor ID: AuthenticAMD\nModel name: AMD EPYC 7763 64-Core Processor\n";
        assert_eq!(parse_cpu_kind(amd), CpuKind::AmdEpyc);
        assert_eq!(CpuKind::AmdEpyc.qemu_model(), "EPYC,topoext");
        let intel = "Vendor ID: GenuineIntel\nModel name: Intel(R) Xeon(R) Gold 6240R\n";
        assert_eq!(parse_cpu_kind(intel), CpuKind::Intel);
        assert_eq!(parse_cpu_kind("Vendor ID: AuthenticAMD\nModel name: AMD Ryzen 9\n"), CpuKind::Other);
        assert_eq!(CpuKind::Other.qemu_model(), "host");
    }

    #[tokio::test]
    async fn test_discover_nodes_concatenates_in_order() {
        let runner = MockRunner::new().on_stdout("lscpu -p", LSCPU_P);
        let cpus = discover_nodes(&runner, &[1, 0]).await.unwrap();
        let ids: Vec<u32> = cpus.iter().map(|c| c.cpu).collect();
        assert_eq!(ids, vec![2, 3, 0, 4, 1, 5]);
    }

    #[tokio::test]
    async fn test_discover_node_missing_tool_is_discovery_error() {
        let runner = MockRunner::new().on_fail("lscpu", "lscpu: not found");
        let err = discover_node(&runner, 0).await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }
}
