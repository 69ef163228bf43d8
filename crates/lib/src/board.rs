//! Single-board computers with board-specific firmware and kernel arguments.
//!
//! Both supported boards are Rockchip RK3588 based and boot U-Boot from a raw
//! image written at a fixed sector offset of the boot disk.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::constants::{DTB_ASSET_DIR, UBOOT_ASSET_DIR};

const SECTOR_SIZE: u64 = 512;
/// Byte offset at which U-Boot is written to the disk; the same number of
/// leading bytes of the image are skipped.
pub(crate) const UBOOT_OFFSET: u64 = SECTOR_SIZE * 0x40;

/// Boards run arm64 exclusively.
const BOARD_ARCH: &str = "arm64";

const RK3588_OVERLAYS: &[&str] = &["rockchip/overlay/rk3588-uart7-m2.dtbo"];

/// A supported board.
#[derive(Debug)]
pub(crate) struct Board {
    pub(crate) name: &'static str,
    /// Kernel arguments; these replace any earlier values of the same key.
    pub(crate) kernel_args: &'static [&'static str],
    /// Device tree blob, relative to the device tree asset directory.
    dtb: &'static str,
    /// Device tree overlays, relative to the device tree asset directory.
    overlays: &'static [&'static str],
}

// See https://github.com/radxa/debos-radxa/blob/6f5aaf4e62796b31082d62ca3c606259cf624667/rootfs/fs-overlay/rk3588/overlays/boot/config-rock-5b.txt
const ROCK_5B: Board = Board {
    name: "rock5b",
    kernel_args: &[
        "earlycon=uart8250,mmio32,0xfeb50000",
        "console=ttyFIQ0",
        "console=tty1",
        "sysctl.kernel.kexec_load_disabled=1",
        "bootslot.dashboard.disabled=1",
        "modprobe.blacklist=pgdrv",
        "irqchip.gicv3_pseudo_nmi=0",
        "switolb=1",
        "coherent_pool=2M",
        "cgroup_enable=cpuset",
        "cgroup_enable=memory",
        "cgroup_memory=1",
        "swapaccount=1",
    ],
    dtb: "rockchip/rk3588-rock-5b.dtb",
    overlays: RK3588_OVERLAYS,
};

const ROCK_5A: Board = Board {
    name: "rock5a",
    kernel_args: &[
        "console=tty0",
        "console=ttyS2,1500000n8",
        "sysctl.kernel.kexec_load_disabled=1",
        "bootslot.dashboard.disabled=1",
    ],
    dtb: "rockchip/rk3588s-rock-5a.dtb",
    overlays: RK3588_OVERLAYS,
};

/// All supported boards.
pub(crate) const BOARDS: &[Board] = &[ROCK_5A, ROCK_5B];

impl Board {
    pub(crate) fn lookup(name: &str) -> Result<&'static Board> {
        BOARDS.iter().find(|b| b.name == name).ok_or_else(|| {
            let known = BOARDS.iter().map(|b| b.name).collect::<Vec<_>>().join(", ");
            anyhow::anyhow!("Unsupported board {name:?} (supported: {known})")
        })
    }

    fn dtb_root(assets_root: &Utf8Path) -> Utf8PathBuf {
        assets_root.join(BOARD_ARCH).join(DTB_ASSET_DIR)
    }

    /// Path of the board's device tree blob in the installer assets.
    pub(crate) fn device_tree_blob(&self, assets_root: &Utf8Path) -> Utf8PathBuf {
        Self::dtb_root(assets_root).join(self.dtb)
    }

    /// Paths of the board's device tree overlays in the installer assets.
    pub(crate) fn device_tree_overlays(&self, assets_root: &Utf8Path) -> Vec<Utf8PathBuf> {
        let root = Self::dtb_root(assets_root);
        self.overlays.iter().map(|o| root.join(o)).collect()
    }

    fn uboot_image(&self, assets_root: &Utf8Path) -> Utf8PathBuf {
        assets_root
            .join(BOARD_ARCH)
            .join(UBOOT_ASSET_DIR)
            .join(self.name)
            .join("u-boot.img")
    }

    /// Write the board firmware to `disk`.
    pub(crate) fn install(&self, disk: &Utf8Path, assets_root: &Utf8Path) -> Result<()> {
        let image = self.uboot_image(assets_root);
        write_uboot(&image, disk, UBOOT_OFFSET)
            .with_context(|| format!("Installing U-Boot for {}", self.name))?;
        Ok(())
    }
}

/// Write `image` (minus its first `offset` bytes) to `disk` at `offset`.
fn write_uboot(image: &Utf8Path, disk: &Utf8Path, offset: u64) -> Result<usize> {
    let uboot = std::fs::read(image).with_context(|| format!("Reading {image}"))?;
    let skip = usize::try_from(offset)?;
    let payload = uboot.get(skip..).ok_or_else(|| {
        anyhow::anyhow!(
            "U-Boot image {image} ({} bytes) is smaller than the write offset {offset}",
            uboot.len()
        )
    })?;
    let f = OpenOptions::new()
        .write(true)
        .open(disk)
        .with_context(|| format!("Opening {disk}"))?;
    println!("writing {image} ({} bytes) at offset {offset}", payload.len());
    f.write_all_at(payload, offset)
        .with_context(|| format!("Writing to {disk}"))?;
    // The disk may be a loopback device about to be detached
    f.sync_all().with_context(|| format!("Syncing {disk}"))?;
    tracing::debug!("wrote {} bytes", payload.len());
    Ok(payload.len())
}
