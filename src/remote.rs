//! Helpers run inside a booted guest over ssh.
//!
//! The ivshmem BAR2 window is covered by a firmware-created MTRR that makes
//! it uncacheable in the guest; [`RemoteGuest::remove_bar2_mtrr`] disables
//! that register so the shared region is mapped write-back.

use std::path::PathBuf;

use tracing::info;

use crate::devices::PciAddress;
use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

const IVSHMEM_NAME: &str = "Inter-VM shared memory";

/// ssh coordinates of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteGuest {
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
}

/// One `/proc/mtrr` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrEntry {
    pub reg: u32,
    pub base: u64,
}

impl RemoteGuest {
    pub fn new(ip: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            user: user.into(),
            identity: None,
        }
    }

    pub fn identity(mut self, key: Option<PathBuf>) -> Self {
        self.identity = key;
        self
    }

    /// `remote` as an ssh invocation against this guest.
    pub fn command(&self, remote: &str) -> HostCommand {
        let mut cmd = HostCommand::new("ssh")
            .args(["-q", "-oStrictHostKeyChecking=no", "-p"])
            .arg(self.port.to_string());
        if let Some(ref key) = self.identity {
            cmd = cmd.arg("-i").arg(key.display().to_string());
        }
        cmd.arg(format!("{}@{}", self.user, self.ip))
            .arg("--")
            .arg(remote)
    }

    async fn run(&self, runner: &dyn CommandRunner, remote: &str) -> Result<String> {
        Ok(runner.run(&self.command(remote)).await?.stdout)
    }

    /// PCI addresses of the guest's ivshmem devices.
    pub async fn ivshmem_devices(&self, runner: &dyn CommandRunner) -> Result<Vec<PciAddress>> {
        let out = self.run(runner, "lspci").await?;
        Ok(parse_ivshmem_devices(&out))
    }

    /// Guest-physical base of the first ivshmem device's BAR2.
    pub async fn ivshmem_bar2(&self, runner: &dyn CommandRunner) -> Result<u64> {
        let devices = self.ivshmem_devices(runner).await?;
        let Some(dev) = devices.first() else {
            return Err(Error::Discovery(format!(
                "no ivshmem device in guest {}",
                self.ip
            )));
        };
        let out = self.run(runner, &format!("lspci -vvs {}", dev)).await?;
        parse_region2(&out).ok_or_else(|| {
            Error::Discovery(format!("{} on {} has no Region 2", dev, self.ip))
        })
    }

    /// Disable the MTRR covering BAR2. Returns the resulting `/proc/mtrr`
    /// table, or `None` when no register starts at BAR2.
    pub async fn remove_bar2_mtrr(&self, runner: &dyn CommandRunner) -> Result<Option<String>> {
        let bar2 = self.ivshmem_bar2(runner).await?;
        let table = self.run(runner, "cat /proc/mtrr").await?;
        let Some(entry) = parse_mtrr(&table).into_iter().find(|e| e.base == bar2) else {
            info!("no MTRR register starts at {:#x} on {}", bar2, self.ip);
            return Ok(None);
        };
        info!("disabling MTRR reg{:02} ({:#x}) on {}", entry.reg, bar2, self.ip);
        self.run(
            runner,
            &format!("sudo sh -c 'echo -n disable={} > /proc/mtrr'", entry.reg),
        )
        .await?;
        Ok(Some(self.run(runner, "cat /proc/mtrr").await?))
    }
}

/// Addresses of ivshmem devices in guest `lspci` output.
pub fn parse_ivshmem_devices(text: &str) -> Vec<PciAddress> {
    text.lines()
        .filter(|l| l.contains(IVSHMEM_NAME))
        .filter_map(|l| l.split_whitespace().next())
        .filter_map(|a| a.parse().ok())
        .collect()
}

/// `Region 2: Memory at <hex> (...)` from `lspci -vv`.
pub fn parse_region2(text: &str) -> Option<u64> {
    text.lines()
        .filter(|l| l.contains("Region 2"))
        .find_map(|l| {
            let hex = l.split_whitespace().nth(4)?;
            u64::from_str_radix(hex, 16).ok()
        })
}

/// `regNN: base=0x...` lines of `/proc/mtrr`.
pub fn parse_mtrr(text: &str) -> Vec<MtrrEntry> {
    text.lines()
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            let reg = fields
                .next()?
                .strip_prefix("reg")?
                .trim_end_matches(':')
                .parse()
                .ok()?;
            let base = fields.next()?.strip_prefix("base=0x")?;
            Some(MtrrEntry {
                reg,
                base: u64::from_str_radix(base, 16).ok()?,
            })
        })
        .collect()
}
