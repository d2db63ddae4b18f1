//! cxl-fleet: NUMA-pinned QEMU fleets with an emulated CXL memory fabric
//!
//! Provisions a fleet of VMs on one host to stand in for a multi-host,
//! disaggregated-memory testbed. Host resources (split NUMA memory, SR-IOV
//! NICs, GPUs, a shared-memory fabric surrogate) are bound, wired into a
//! deterministic per-VM QEMU command, launched, and the vCPU threads pinned
//! to host cores once the monitors answer.
//!
//! # Key Features
//!
//! - **Explicit state machine**: `Unprovisioned -> GloballySetUp ->
//!   PerVmPrepared -> Launched -> Pinned`, with single-VM restart
//! - **Host state ledger**: every driver override, TAP and mount is recorded
//! - **Testable host access**: all tooling goes through [`runner::CommandRunner`]
//!
//! # Example
//!
//! ```no_run
//! use cxl_fleet::{FleetConfig, HostRunner, VmLauncher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FleetConfig::new()
//!         .num_vms(2)
//!         .mem_size_mb(8192)
//!         .mem_local_percent(50)
//!         .drive("/images/rootfs.img");
//!
//!     let runner = HostRunner::new();
//!     let mut launcher = VmLauncher::new(&runner, config)?;
//!     let report = launcher.run().await?;
//!     println!("fleet {} pinned {} vCPUs", report.fleet_id, report.pins.len());
//!     Ok(())
//! }
//! ```

// Host access
pub mod error;
pub mod ledger;
pub mod runner;
pub mod topology;

// Resources
pub mod devices;
pub mod fabric;
pub mod network;

// VMs
pub mod pinner;
pub mod qmp;
pub mod remote;
pub mod vmm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use ledger::HostResourceLedger;
pub use runner::{CommandRunner, HostRunner, MockRunner};
pub use vmm::config::{load_fleet_config, FleetConfig};
pub use vmm::{FleetReport, FleetState, VmLauncher};
