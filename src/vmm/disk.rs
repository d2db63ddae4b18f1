//! Per-VM disk images, firmware and guest file injection.

use std::path::Path;

use tracing::{info, warn};

use super::config::FleetConfig;
use super::{VmPaths, OVMF_CODE, OVMF_VARS};
use crate::ledger::HostResourceLedger;
use crate::network::guest::GuestFile;
use crate::runner::{CommandRunner, HostCommand};
use crate::Result;

/// Direct, unbuffered, sparse-preserving copy of `src` to `dst`.
pub fn disk_copy_command(src: &Path, dst: &Path) -> HostCommand {
    HostCommand::new("dd")
        .arg(format!("if={}", src.display()))
        .arg(format!("of={}", dst.display()))
        .args(["iflag=direct", "oflag=direct", "bs=64K", "conv=sparse"])
}

/// Copy the golden image into every VM of `vm_ids` that has no copy yet.
///
/// Copies run concurrently and are all joined before any failure is
/// reported. Returns the number of copies issued.
pub async fn copy_vm_disks(
    runner: &dyn CommandRunner,
    config: &FleetConfig,
    vm_ids: &[usize],
) -> Result<usize> {
    let drive_name = config.drive_file_name()?;
    let mut cmds = Vec::new();
    for &vm_id in vm_ids {
        let paths = VmPaths::new(config, vm_id, drive_name);
        tokio::fs::create_dir_all(&paths.dir).await?;
        if tokio::fs::try_exists(&paths.disk).await? {
            info!("vm{}: reusing {}", vm_id, paths.disk.display());
            continue;
        }
        cmds.push(disk_copy_command(&config.drive, &paths.disk));
    }
    if !cmds.is_empty() {
        info!("copying {} disk image(s)", cmds.len());
        runner.run_all(&cmds).await?;
    }
    Ok(cmds.len())
}

/// Copy the UEFI code image to the fleet directory, once.
pub async fn install_firmware_code(
    config: &FleetConfig,
    ledger: &mut HostResourceLedger,
) -> Result<()> {
    let dst = config.vmdir.join(OVMF_CODE);
    tokio::fs::copy(config.ovmf_dir.join(OVMF_CODE), &dst).await?;
    ledger.firmware_copied = true;
    Ok(())
}

/// Give `paths` its own UEFI variable store unless it already has one.
pub async fn install_firmware_vars(config: &FleetConfig, paths: &VmPaths) -> Result<()> {
    if tokio::fs::try_exists(&paths.ovmf_vars).await? {
        return Ok(());
    }
    tokio::fs::copy(config.ovmf_dir.join(OVMF_VARS), &paths.ovmf_vars).await?;
    Ok(())
}

/// Write `files` into the guest image of `paths` through a guestmount.
///
/// Files are staged in the VM directory and moved into the mounted image
/// with sudo. The image is always unmounted and flushed, even on failure.
pub async fn inject_guest_files(
    runner: &dyn CommandRunner,
    paths: &VmPaths,
    files: &[GuestFile],
) -> Result<()> {
    tokio::fs::create_dir_all(&paths.mnt).await?;
    let mnt = paths.mnt.display().to_string();

    let mut staged = Vec::with_capacity(files.len());
    for file in files {
        let path = paths.dir.join(&file.name);
        tokio::fs::write(&path, file.contents.as_bytes()).await?;
        staged.push((path, paths.mnt.join(file.dir.relative())));
    }

    runner
        .run(
            &HostCommand::sudo("guestmount")
                .arg("-a")
                .arg(paths.disk.display().to_string())
                .arg("-i")
                .arg(&mnt),
        )
        .await?;

    let mut result = Ok(());
    for (src, dst) in &staged {
        let mv = HostCommand::sudo("mv")
            .arg(src.display().to_string())
            .arg(dst.display().to_string());
        if let Err(e) = runner.run(&mv).await {
            result = Err(e);
            break;
        }
    }

    let unmounted = runner.run(&HostCommand::sudo("umount").arg(&mnt)).await;
    if result.is_err() {
        if let Err(e) = unmounted {
            warn!("failed to unmount {} after injection error: {}", mnt, e);
        }
        return result;
    }
    unmounted?;
    runner.run(&HostCommand::new("sync")).await?;
    Ok(())
}
