//! Bridge + TAP networking.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    bridge_address, fleet_subnet, mac_address, NetworkMode, NetworkSettings, NetworkStrategy,
    BRIDGE_NAME,
};
use crate::error::CommandFailure;
use crate::ledger::HostResourceLedger;
use crate::runner::{CommandRunner, HostCommand};
use crate::{Error, Result};

/// TAP device of `vm_id`.
pub fn tap_name(vm_id: usize) -> String {
    format!("tap{}", vm_id)
}

#[derive(Debug, Deserialize)]
struct LinkState {
    #[serde(default)]
    flags: Vec<String>,
}

pub struct BridgeNetwork {
    settings: NetworkSettings,
}

impl BridgeNetwork {
    pub fn new(settings: NetworkSettings) -> Self {
        Self { settings }
    }

    async fn link_exists(runner: &dyn CommandRunner, name: &str) -> bool {
        runner
            .run_allow_fail(&HostCommand::new("ip").args(["link", "show", name]))
            .await
            .success()
    }

    async fn ensure_bridge(&self, runner: &dyn CommandRunner) -> Result<()> {
        if Self::link_exists(runner, BRIDGE_NAME).await {
            debug!("{} already exists", BRIDGE_NAME);
        } else {
            info!("creating {}", BRIDGE_NAME);
            runner
                .run(&HostCommand::sudo("ip").args(["link", "add", BRIDGE_NAME, "type", "bridge"]))
                .await?;
        }
        runner
            .run(&HostCommand::sudo("ip").args(["link", "set", BRIDGE_NAME, "down"]))
            .await?;

        let net = fleet_subnet();
        let cmd = HostCommand::sudo("ip")
            .args(["addr", "add"])
            .arg(format!("{}/{}", bridge_address(), net.prefix_len()))
            .arg("broadcast")
            .arg(net.broadcast().to_string())
            .args(["dev", BRIDGE_NAME]);
        let out = runner.run_allow_fail(&cmd).await;
        if !out.success() && !out.stderr.contains("File exists") {
            return Err(Error::Command(CommandFailure {
                command: cmd.to_string(),
                status: out.status,
                stderr: out.stderr,
            }));
        }
        Ok(())
    }

    /// Poll until `tap` reports UP, bounded by the link timeout.
    async fn wait_link_up(&self, runner: &dyn CommandRunner, tap: &str) -> Result<()> {
        let deadline = Instant::now() + self.settings.link_timeout;
        loop {
            let out = runner
                .run_allow_fail(&HostCommand::new("ip").args(["-j", "link", "show", tap]))
                .await;
            if out.success() {
                let states: Vec<LinkState> = serde_json::from_str(&out.stdout).unwrap_or_default();
                if states.iter().any(|s| s.flags.iter().any(|f| f == "UP")) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} did not come up within {:?}",
                    tap, self.settings.link_timeout
                )));
            }
            tokio::time::sleep(self.settings.poll_interval.max(Duration::from_millis(1))).await;
        }
    }
}

#[async_trait::async_trait]
impl NetworkStrategy for BridgeNetwork {
    fn mode(&self) -> NetworkMode {
        NetworkMode::Bridge
    }

    async fn provision(
        &self,
        runner: &dyn CommandRunner,
        num_vms: usize,
        ledger: &mut HostResourceLedger,
    ) -> Result<()> {
        runner.run(&HostCommand::sudo("modprobe").arg("tun")).await?;
        self.ensure_bridge(runner).await?;
        ledger.bridge = Some(BRIDGE_NAME.to_string());

        for vm_id in 0..num_vms {
            let tap = tap_name(vm_id);
            if !Self::link_exists(runner, &tap).await {
                info!("creating {} owned by {}", tap, self.settings.tap_owner);
                runner
                    .run(
                        &HostCommand::sudo("ip")
                            .args(["tuntap", "add", "dev", &tap, "mode", "tap", "user"])
                            .arg(&self.settings.tap_owner),
                    )
                    .await?;
            }
            runner
                .run(&HostCommand::sudo("ip").args(["link", "set", &tap, "up"]))
                .await?;
            self.wait_link_up(runner, &tap).await?;
            runner
                .run(&HostCommand::sudo("ip").args(["link", "set", &tap, "master", BRIDGE_NAME]))
                .await?;
            if !ledger.taps.contains(&tap) {
                ledger.taps.push(tap);
            }
        }

        runner
            .run(&HostCommand::sudo("ip").args(["link", "set", BRIDGE_NAME, "up"]))
            .await?;
        Ok(())
    }

    fn qemu_args(
        &self,
        host_id: usize,
        vm_id: usize,
        _ledger: &HostResourceLedger,
    ) -> Result<Vec<String>> {
        Ok(vec![
            "-device".into(),
            format!(
                "virtio-net-pci,mq=on,packed=on,netdev=network{},mac={},romfile=",
                vm_id,
                mac_address(host_id, vm_id)
            ),
            "-netdev".into(),
            format!(
                "tap,id=network{},vhost=on,ifname={},script=no,downscript=no",
                vm_id,
                tap_name(vm_id)
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockRunner};

    fn settings() -> NetworkSettings {
        NetworkSettings {
            tap_owner: "alice".into(),
            link_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    const TAP_UP: &str = r#"[{"ifindex":9,"ifname":"tap0","flags":["NO-CARRIER","BROADCAST","MULTICAST","UP"],"operstate":"DOWN"}]"#;

    #[tokio::test]
    async fn test_provision_creates_missing_devices() {
        let runner = MockRunner::new()
            .on("ip link show", CommandOutput::failed(1, "Device does not exist"))
            .on_stdout("ip -j link show", TAP_UP);
        let mut ledger = HostResourceLedger::new();
        BridgeNetwork::new(settings())
            .provision(&runner, 2, &mut ledger)
            .await
            .unwrap();

        let cmds = runner.commands();
        let pos = |c: &str| cmds.iter().position(|x| x == c).unwrap();
        assert!(pos("sudo ip link add br0 type bridge") < pos("sudo ip addr add 192.168.100.1/24 broadcast 192.168.100.255 dev br0"));
        assert!(pos("sudo ip tuntap add dev tap1 mode tap user alice") < pos("sudo ip link set tap1 master br0"));
        assert!(pos("sudo ip link set tap0 up") < pos("sudo ip link set tap0 master br0"));
        assert_eq!(cmds.last().unwrap(), "sudo ip link set br0 up");
        assert_eq!(ledger.taps, vec!["tap0", "tap1"]);
        assert_eq!(ledger.bridge.as_deref(), Some("br0"));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_on_existing_bridge() {
        let runner = MockRunner::new()
            .on_fail("ip addr add", "RTNETLINK answers: File exists")
            .on_stdout("ip -j link show", TAP_UP);
        let mut ledger = HostResourceLedger::new();
        BridgeNetwork::new(settings())
            .provision(&runner, 1, &mut ledger)
            .await
            .unwrap();
        assert!(runner.matching("link add").is_empty());
        assert!(runner.matching("tuntap add").is_empty());
    }

    #[tokio::test]
    async fn test_address_failure_other_than_exists_is_fatal() {
        let runner = MockRunner::new().on_fail("ip addr add", "Cannot find device");
        let mut ledger = HostResourceLedger::new();
        let err = BridgeNetwork::new(settings())
            .provision(&runner, 1, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command(_)));
    }

    #[tokio::test]
    async fn test_tap_that_never_comes_up_times_out() {
        let runner = MockRunner::new().on_stdout(
            "ip -j link show",
            r#"[{"ifname":"tap0","flags":["BROADCAST","MULTICAST"]}]"#,
        );
        let mut ledger = HostResourceLedger::new();
        let err = BridgeNetwork::new(settings())
            .provision(&runner, 1, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(runner.matching("master br0").is_empty());
    }

    #[test]
    fn test_qemu_args_bind_tap_and_mac() {
        let args = BridgeNetwork::new(settings())
            .qemu_args(0, 1, &HostResourceLedger::new())
            .unwrap();
        assert_eq!(
            args[1],
            "virtio-net-pci,mq=on,packed=on,netdev=network1,mac=DE:AD:BE:EF:00:01,romfile="
        );
        assert!(args[3].contains("ifname=tap1"));
    }
}
