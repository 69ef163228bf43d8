//! Well-known names and paths shared across the installer.

/// Partition label of the boot partition holding both slots.
pub(crate) const BOOT_PARTITION_LABEL: &str = "BOOT";
/// Partition label of the EFI system partition.
pub(crate) const EFI_PARTITION_LABEL: &str = "EFI";
/// Partition label of the small raw partition backing the tag store.
pub(crate) const META_PARTITION_LABEL: &str = "META";

/// Filesystem type used for the boot partition.
pub(crate) const BOOT_FILESYSTEM: &str = "ext4";
/// Filesystem type used for the EFI system partition.
pub(crate) const EFI_FILESYSTEM: &str = "vfat";

/// Where the boot partition is mounted for modification.
pub(crate) const BOOT_MOUNTPOINT: &str = "/run/bootslot/boot";
/// Directory (relative to the boot mount) where the EFI partition is mounted.
pub(crate) const EFI_SUBDIR: &str = "EFI";

/// Root of the installation assets shipped in the installer image.
pub(crate) const ASSETS_ROOT: &str = "/usr/install";
/// File name of the kernel, both in the assets root and in a slot directory.
pub(crate) const KERNEL_ASSET: &str = "vmlinuz";
/// File name of the initramfs, both in the assets root and in a slot directory.
pub(crate) const INITRAMFS_ASSET: &str = "initramfs.xz";
/// Directory holding device trees.
pub(crate) const DTB_ASSET_DIR: &str = "dtb";
/// Directory holding device trees within a slot directory.
pub(crate) const SLOT_DTBS_DIR: &str = "dtbs";
/// Directory holding device tree overlays within a slot's `dtbs`.
pub(crate) const SLOT_OVERLAY_DIR: &str = "overlay";
/// Directory holding U-Boot images, one subdirectory per board.
pub(crate) const UBOOT_ASSET_DIR: &str = "u-boot";
/// Directory holding system extension images.
pub(crate) const EXTENSIONS_ASSET_DIR: &str = "extensions";

/// Kernel parameter naming the platform.
pub(crate) const KERNEL_PARAM_PLATFORM: &str = "bootslot.platform";
/// Kernel parameter naming the configuration source.
pub(crate) const KERNEL_PARAM_CONFIG: &str = "bootslot.config";
/// Kernel parameter naming the board.
pub(crate) const KERNEL_PARAM_BOARD: &str = "bootslot.board";
/// Kernel parameter disabling the console dashboard.
pub(crate) const KERNEL_PARAM_DASHBOARD_DISABLED: &str = "bootslot.dashboard.disabled";
/// Kernel parameter selecting the console.
pub(crate) const KERNEL_PARAM_CONSOLE: &str = "console";
/// Interface naming scheme switch.
pub(crate) const KERNEL_PARAM_NET_IFNAMES: &str = "net.ifnames";
