//! QEMU command line construction.
//!
//! The command is a pure function of the fleet configuration, the VM id and
//! the resources assigned to it, so two runs with the same inputs produce
//! identical command lines.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::config::FleetConfig;
use super::VmPaths;
use crate::fabric::SharedFabricHandle;
use crate::runner::HostCommand;
use crate::topology::CpuKind;

/// First gdb stub port; VM `i` listens on `GDB_BASE_PORT + i`.
pub const GDB_BASE_PORT: u16 = 1234;

/// One guest NUMA node and the host node backing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeBackend {
    pub vnode: u32,
    pub host_node: u32,
    pub size_mb: u64,
    /// Whether the guest vCPUs live on this node
    pub has_cpus: bool,
}

/// Guest memory topology of one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryLayout {
    /// One guest node backed by the home node
    Single { host_node: u32, size_mb: u64 },
    /// One or two guest nodes, each bound to a host node
    Split(Vec<VnodeBackend>),
}

impl MemoryLayout {
    pub fn total_mb(&self) -> u64 {
        match self {
            MemoryLayout::Single { size_mb, .. } => *size_mb,
            MemoryLayout::Split(nodes) => nodes.iter().map(|n| n.size_mb).sum(),
        }
    }
}

/// Split `total_mb` between the home and remote host nodes.
///
/// The local share is `floor(total * percent / 100)` and the remote node
/// gets the remainder, so the two always add up to `total_mb`. A share that
/// rounds to zero on either side collapses to a single guest node.
pub fn plan_memory(total_mb: u64, percent: Option<u8>, home: u32, remote: u32) -> MemoryLayout {
    let Some(percent) = percent else {
        return MemoryLayout::Single {
            host_node: home,
            size_mb: total_mb,
        };
    };
    let local = total_mb * u64::from(percent.min(100)) / 100;
    let remote_mb = total_mb - local;
    let whole = |host_node| {
        MemoryLayout::Split(vec![VnodeBackend {
            vnode: 0,
            host_node,
            size_mb: total_mb,
            has_cpus: true,
        }])
    };
    if remote_mb == 0 {
        return whole(home);
    }
    if local == 0 {
        return whole(remote);
    }
    MemoryLayout::Split(vec![
        VnodeBackend {
            vnode: 0,
            host_node: home,
            size_mb: local,
            has_cpus: true,
        },
        VnodeBackend {
            vnode: 1,
            host_node: remote,
            size_mb: remote_mb,
            has_cpus: false,
        },
    ])
}

/// Memory backend and NUMA arguments for `layout`.
pub fn memory_args(layout: &MemoryLayout, num_cpus: usize) -> Vec<String> {
    match layout {
        MemoryLayout::Single { host_node, size_mb } => vec![
            "-object".into(),
            format!(
                "memory-backend-ram,id=mem0,size={}M,prealloc=on,host-nodes={},policy=bind,merge=off",
                size_mb, host_node
            ),
            "-numa".into(),
            "node,nodeid=0,memdev=mem0".into(),
            "-numa".into(),
            "cpu,node-id=0,socket-id=0".into(),
            "-numa".into(),
            "dist,src=0,dst=0,val=10".into(),
        ],
        MemoryLayout::Split(nodes) => {
            let mut args: Vec<String> = Vec::new();
            for node in nodes {
                args.push("-object".into());
                args.push(format!(
                    "memory-backend-ram,id=ram-node{},size={}M,policy=bind,host-nodes={},prealloc=on,prealloc-threads={},merge=off",
                    node.vnode, node.size_mb, node.host_node, num_cpus
                ));
                let mut numa = format!("node,nodeid={},", node.vnode);
                if node.has_cpus {
                    numa.push_str(&format!("cpus=0-{},", num_cpus.saturating_sub(1)));
                }
                numa.push_str(&format!("memdev=ram-node{}", node.vnode));
                args.push("-numa".into());
                args.push(numa);
            }
            args
        }
    }
}

/// Everything assigned to one VM before its command is built.
#[derive(Debug, Clone, Default)]
pub struct VmResources {
    pub network_args: Vec<String>,
    pub fabric: Option<SharedFabricHandle>,
    pub gpu_args: Vec<String>,
}

/// Builds the launch command of one VM.
pub struct QemuCommandBuilder<'a> {
    config: &'a FleetConfig,
    vm_id: usize,
    cpu: CpuKind,
    argv: Vec<String>,
}

impl<'a> QemuCommandBuilder<'a> {
    pub fn new(config: &'a FleetConfig, vm_id: usize, cpu: CpuKind) -> Self {
        Self {
            config,
            vm_id,
            cpu,
            argv: Vec::new(),
        }
    }

    fn push<S: Into<String>>(&mut self, args: impl IntoIterator<Item = S>) {
        self.argv.extend(args.into_iter().map(Into::into));
    }

    fn base(&mut self, paths: &VmPaths) {
        let config = self.config;
        let nodes = config
            .vm_numa_node
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mem = config.mem_size_mb;
        let n = config.num_cpus;

        self.push([
            "numactl".to_string(),
            format!("--cpunodebind={}", nodes),
            "--".to_string(),
            config.qemu_bin.display().to_string(),
        ]);
        if let Some(events) = config.trace_events.as_deref().filter(|p| p.exists()) {
            self.push(["--trace".to_string(), format!("events={}", events.display())]);
        }
        self.push([
            "-machine".to_string(),
            "q35,accel=kvm,mem-merge=off".to_string(),
            "-cpu".to_string(),
            self.cpu.qemu_model().to_string(),
            "-D".to_string(),
            paths.log.display().to_string(),
            "-m".to_string(),
            format!("{}M,maxmem={}M", mem, mem),
            "--overcommit".to_string(),
            "mem-lock=on".to_string(),
            "--overcommit".to_string(),
            "cpu-pm=on".to_string(),
            "-smp".to_string(),
            format!("{},maxcpus={},sockets=1,cores={}", n, n, n),
            "-enable-kvm".to_string(),
            "-display".to_string(),
            "none".to_string(),
            "-daemonize".to_string(),
            "-device".to_string(),
            "virtio-rng-pci".to_string(),
            "-qmp".to_string(),
            format!("unix:{},server,nowait", paths.monitor.display()),
            "-gdb".to_string(),
            format!("tcp::{}", GDB_BASE_PORT as usize + self.vm_id),
            "-pidfile".to_string(),
            paths.pidfile.display().to_string(),
        ]);

        if config.use_ovmf {
            self.push([
                "-drive".to_string(),
                format!(
                    "if=pflash,format=raw,file={},readonly=on",
                    config.vmdir.join(super::OVMF_CODE).display()
                ),
                "-drive".to_string(),
                format!("if=pflash,format=raw,file={}", paths.ovmf_vars.display()),
            ]);
        }

        if let (Some(kernel), Some(initrd)) = (&config.kernel, &config.initrd) {
            self.push([
                "-kernel".to_string(),
                kernel.display().to_string(),
                "-initrd".to_string(),
                initrd.display().to_string(),
                "-append".to_string(),
                config.kernel_append.clone(),
            ]);
        }
    }

    fn disk(&mut self, disk: &Path) {
        self.push([
            "-device".to_string(),
            "virtio-blk-pci,packed=on,num-queues=1,drive=drive0,id=virblk0".to_string(),
            "-drive".to_string(),
            format!(
                "if=none,file={},format=raw,media=disk,id=drive0,cache=none,aio=native",
                disk.display()
            ),
        ]);
    }

    /// Assemble the full command. Ordering is fixed: base, disk, network,
    /// user SSH, fabric, shared dir, memory, GPU.
    pub fn build(mut self, paths: &VmPaths, resources: &VmResources) -> HostCommand {
        self.base(paths);
        self.disk(&paths.disk);
        self.push(resources.network_args.iter().cloned());
        if self.config.add_user_ssh {
            self.push(crate::network::user_ssh_args(self.vm_id));
        }
        if let Some(ref fabric) = resources.fabric {
            self.push(fabric.qemu_args(self.vm_id));
        }
        if let Some(ref dir) = self.config.shared_dir {
            self.push([
                "-virtfs".to_string(),
                format!("local,path={},mount_tag=host,security_model=none", dir.display()),
            ]);
        }
        let layout = plan_memory(
            self.config.mem_size_mb,
            self.config.mem_local_percent,
            self.config.home_node,
            self.config.remote_node,
        );
        self.push(memory_args(&layout, self.config.num_cpus));
        self.push(resources.gpu_args.iter().cloned());

        let mut argv = self.argv.into_iter();
        HostCommand {
            program: argv.next().unwrap_or_default(),
            args: argv.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> FleetConfig {
        FleetConfig::new()
            .num_vms(2)
            .num_cpus(4)
            .mem_size_mb(8192)
            .vmdir("/vms")
            .drive("/images/rootfs.img")
            .trace_events(None)
    }

    #[test]
    fn test_plan_memory_sums_to_total() {
        for percent in 0..=100u8 {
            for total in [1u64, 99, 1000, 4096, 16385] {
                let layout = plan_memory(total, Some(percent), 0, 1);
                assert_eq!(layout.total_mb(), total, "{percent}% of {total}");
            }
        }
    }

    #[test]
    fn test_plan_memory_extremes() {
        assert_eq!(
            plan_memory(4096, Some(100), 0, 1),
            MemoryLayout::Split(vec![VnodeBackend {
                vnode: 0,
                host_node: 0,
                size_mb: 4096,
                has_cpus: true
            }])
        );
        match plan_memory(4096, Some(0), 0, 1) {
            MemoryLayout::Split(nodes) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].host_node, 1);
            }
            other => panic!("unexpected layout {other:?}"),
        }
        match plan_memory(1000, Some(33), 0, 1) {
            MemoryLayout::Split(nodes) => {
                assert_eq!(nodes[0].size_mb, 330);
                assert_eq!(nodes[1].size_mb, 670);
                assert!(!nodes[1].has_cpus);
            }
            other => panic!("unexpected layout {other:?}"),
        }
        assert_eq!(
            plan_memory(512, None, 0, 1),
            MemoryLayout::Single {
                host_node: 0,
                size_mb: 512
            }
        );
    }

    #[test]
    fn test_split_args_disable_merge_on_every_backend() {
        let args = memory_args(&plan_memory(8192, Some(50), 0, 1), 4);
        let backends: Vec<&String> = args.iter().filter(|a| a.starts_with("memory-backend-ram")).collect();
        assert_eq!(backends.len(), 2);
        assert!(backends.iter().all(|b| b.ends_with("merge=off")));
        assert!(args.contains(&"node,nodeid=0,cpus=0-3,memdev=ram-node0".to_string()));
        assert!(args.contains(&"node,nodeid=1,memdev=ram-node1".to_string()));
        assert!(!args.iter().any(|a| a.contains('$')));
    }

    #[test]
    fn test_build_orders_sections() {
        let config = config().mem_local_percent(100).use_ovmf(true);
        let paths = VmPaths::new(&config, 1, "rootfs.img");
        let resources = VmResources {
            network_args: vec!["-device".into(), "virtio-net-pci,netdev=network1".into()],
            fabric: Some(SharedFabricHandle::Plain {
                backing_file: PathBuf::from("/mnt/cxl/mem_1"),
                size_mb: 1024,
            }),
            gpu_args: vec!["-device".into(), "vfio-pci,host=0000:61:00.0".into()],
        };
        let cmd = QemuCommandBuilder::new(&config, 1, CpuKind::AmdEpyc).build(&paths, &resources);
        assert_eq!(cmd.program, "numactl");
        let a = &cmd.args;
        let pos = |s: &str| a.iter().position(|x| x.contains(s)).unwrap();
        let flag = |s: &str| a.iter().position(|x| x == s).unwrap();
        assert_eq!(a[0], "--cpunodebind=0");
        assert_eq!(a[2], "qemu-system-x86_64");
        assert_eq!(a[flag("-cpu") + 1], "EPYC,topoext");
        assert_eq!(a[flag("-gdb") + 1], "tcp::1235");
        assert_eq!(a[flag("-qmp") + 1], "unix:/vms/1/qemu-monitor.sock,server,nowait");
        assert!(a.contains(&"if=pflash,format=raw,file=/vms/OVMF_CODE.fd,readonly=on".to_string()));
        assert!(pos("virtio-blk-pci") < pos("virtio-net-pci"));
        assert!(pos("virtio-net-pci") < pos("ivshmem-plain"));
        assert!(pos("ivshmem-plain") < pos("memory-backend-ram"));
        assert_eq!(a.last().unwrap(), "vfio-pci,host=0000:61:00.0");
        assert!(!a.iter().any(|x| x == "-kernel"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = config();
        let paths = VmPaths::new(&config, 0, "rootfs.img");
        let a = QemuCommandBuilder::new(&config, 0, CpuKind::Intel).build(&paths, &VmResources::default());
        let b = QemuCommandBuilder::new(&config, 0, CpuKind::Intel).build(&paths, &VmResources::default());
        assert_eq!(a, b);
        assert!(a.args.contains(&"host".to_string()));
    }
}
