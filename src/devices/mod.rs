//! PCI passthrough device binding for cxl-fleet VMs
//!
//! This module moves host PCI devices between their native kernel driver and
//! `vfio-pci` using `driverctl` overrides:
//! - GPU discovery and vendor-module teardown ([`gpu`])
//! - Mellanox ConnectX SR-IOV physical/virtual functions ([`sriov`])
//!
//! Overrides are global host state. Every override set or cleared here is
//! mirrored into the [`HostResourceLedger`].

pub mod gpu;
pub mod sriov;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::HostResourceLedger;
use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

/// Passthrough driver used for every device handed to a VM.
pub const VFIO_DRIVER: &str = "vfio-pci";

/// Native driver of Mellanox ConnectX devices.
pub const MLX5_DRIVER: &str = "mlx5_core";

/// Modules required before any device can be bound to `vfio-pci`.
const VFIO_MODULES: &[&str] = &["vfio", "vfio_pci", "vfio_iommu_type1"];

/// A PCI address in `dddd:bb:dd.f` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Accepts `bb:dd.f`, `dddd:bb:dd.f` and the `pci@` prefix used by lshw.
    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().trim_start_matches("pci@");
        let full = if raw.matches(':').count() == 1 {
            format!("0000:{}", raw)
        } else {
            raw.to_string()
        };

        let bad = || Error::Discovery(format!("malformed PCI address: {:?}", s));
        let (domain_bus, devfn) = full.rsplit_once(':').ok_or_else(bad)?;
        let (domain, bus) = domain_bus.split_once(':').ok_or_else(bad)?;
        let (dev, func) = devfn.split_once('.').ok_or_else(bad)?;
        let hex = |part: &str, len: usize| {
            part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit())
        };
        if !(hex(domain, 4) && hex(bus, 2) && hex(dev, 2) && func.len() == 1 && hex(func, 1)) {
            return Err(bad());
        }
        Ok(Self(full.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Driver a device is currently bound to, as far as this fleet knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverBinding {
    /// Whatever the kernel probed on its own
    Native,
    /// Overridden to `vfio-pci`
    VfioPci,
    /// Overridden back to `mlx5_core`
    Mlx5Core,
    /// Explicitly unbound from its driver
    Unbound,
}

impl DriverBinding {
    fn from_driver(driver: &str) -> Self {
        match driver {
            VFIO_DRIVER => DriverBinding::VfioPci,
            MLX5_DRIVER => DriverBinding::Mlx5Core,
            _ => DriverBinding::Native,
        }
    }
}

/// A physical PCI device and its binding state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundDevice {
    pub address: PciAddress,
    pub binding: DriverBinding,
}

/// Drives the driver-override state machine through a [`CommandRunner`].
pub struct DeviceBinder<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> DeviceBinder<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub(crate) fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    /// Load the vfio modules. Failure is fatal: nothing can be passed through
    /// without them.
    pub async fn load_passthrough_modules(&self) -> Result<()> {
        for module in VFIO_MODULES {
            self.runner
                .run(&HostCommand::sudo("modprobe").arg(*module))
                .await?;
        }
        Ok(())
    }

    /// Force `addr` onto `driver` (non-persistent override). Fatal on failure.
    pub async fn bind_override(
        &self,
        addr: &PciAddress,
        driver: &str,
        ledger: &mut HostResourceLedger,
    ) -> Result<()> {
        info!("binding {} to {}", addr, driver);
        self.runner
            .run(
                &HostCommand::sudo("driverctl")
                    .args(["--nosave", "set-override"])
                    .arg(addr.as_str())
                    .arg(driver),
            )
            .await?;
        ledger.record_override(addr.clone(), DriverBinding::from_driver(driver));
        Ok(())
    }

    /// Unbind `addr` from `driver` through sysfs. Already-unbound devices are
    /// tolerated.
    pub async fn unbind_from(
        &self,
        addr: &PciAddress,
        driver: &str,
        ledger: &mut HostResourceLedger,
    ) -> Result<()> {
        let out = self
            .runner
            .run_allow_fail(&HostCommand::sudo_shell(format!(
                "echo {} > /sys/bus/pci/drivers/{}/unbind",
                addr, driver
            )))
            .await;
        if out.success() {
            ledger.record_override(addr.clone(), DriverBinding::Unbound);
        } else {
            info!("{} was not bound to {}, continuing", addr, driver);
        }
        Ok(())
    }

    /// Clear every active driver override on the host.
    ///
    /// Mellanox devices get `mlx5_core` re-applied explicitly because removing
    /// the override alone does not make the kernel re-probe them with the
    /// right driver. Safe to run repeatedly.
    pub async fn unset_all_overrides(&self, ledger: &mut HostResourceLedger) -> Result<()> {
        let listing = self
            .runner
            .run_allow_fail(&HostCommand::new("driverctl").arg("list-overrides"))
            .await;
        if !listing.success() {
            warn!("driverctl list-overrides failed, assuming no overrides");
        }

        for addr in parse_override_list(&listing.stdout) {
            info!("clearing driver override on {}", addr);
            self.runner
                .run(
                    &HostCommand::sudo("driverctl")
                        .arg("unset-override")
                        .arg(addr.as_str()),
                )
                .await?;
            ledger.clear_override(&addr);

            let desc = self
                .runner
                .run(&HostCommand::new("lspci").arg("-s").arg(addr.as_str()))
                .await?;
            if is_connectx(&desc.stdout) {
                self.bind_override(&addr, MLX5_DRIVER, ledger).await?;
            }
        }
        Ok(())
    }
}

/// Parse `driverctl list-overrides` output (`<addr> <driver>` per line).
pub fn parse_override_list(text: &str) -> Vec<PciAddress> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| match token.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!("skipping unrecognised override entry {:?}", token);
                None
            }
        })
        .collect()
}

pub(crate) fn is_connectx(text: &str) -> bool {
    text.to_ascii_lowercase().contains("connectx")
}
