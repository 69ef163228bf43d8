//! Slot-based bootloader backends.
//!
//! The boot partition holds two slots, `A` and `B`, each a directory with a
//! kernel, initramfs and optionally device trees. A backend owns a config file
//! naming the default slot (booted next) and the fallback slot. Installing
//! flips the slots, copies the new assets into the new default slot only, and
//! then atomically replaces the config. That replacement is the single commit
//! point: any failure before it leaves the on-disk config untouched and the
//! previous slot bootable.

use std::fmt::Display;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::constants::{INITRAMFS_ASSET, KERNEL_ASSET, SLOT_DTBS_DIR, SLOT_OVERLAY_DIR};

mod extlinux;
mod grub;

/// One of the two boot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum BootLabel {
    A,
    B,
}

impl BootLabel {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// The other slot.
    pub(crate) fn toggle(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl Display for BootLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            o => anyhow::bail!("Invalid boot label: {o:?}"),
        }
    }
}

/// Which slot boots next, and which one is kept as the known-good fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotState {
    pub(crate) default: BootLabel,
    pub(crate) fallback: Option<BootLabel>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            default: BootLabel::A,
            fallback: None,
        }
    }
}

impl SlotState {
    /// The state after an install. When no entry exists yet (a fresh config)
    /// the first install simply populates the default slot.
    pub(crate) fn flipped(self, has_entry: bool) -> Self {
        if !has_entry {
            return self;
        }
        Self {
            default: self.default.toggle(),
            fallback: Some(self.default),
        }
    }

    /// The state with `label` as default and the current default as fallback.
    pub(crate) fn activated(self, label: BootLabel) -> Self {
        if self.default == label {
            return self;
        }
        Self {
            default: label,
            fallback: Some(self.default),
        }
    }
}

/// Source files to install into a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootAssets {
    pub(crate) kernel: Utf8PathBuf,
    pub(crate) initramfs: Utf8PathBuf,
    /// Device tree blob
    pub(crate) dtb: Option<Utf8PathBuf>,
    /// Device tree overlays
    pub(crate) dtos: Vec<Utf8PathBuf>,
}

impl BootAssets {
    /// The kernel and initramfs shipped for `arch` under `assets_root`.
    pub(crate) fn defaults_for(assets_root: &Utf8Path, arch: &str) -> Self {
        let root = assets_root.join(arch);
        Self {
            kernel: root.join(KERNEL_ASSET),
            initramfs: root.join(INITRAMFS_ASSET),
            dtb: None,
            dtos: Vec::new(),
        }
    }
}

/// Parameters for [`Bootloader::install`].
#[derive(Debug)]
pub(crate) struct InstallOptions<'a> {
    /// Whole-disk device; located from the boot partition label if unset.
    pub(crate) boot_disk: Option<&'a Utf8Path>,
    /// Where the boot partition is mounted.
    pub(crate) boot_path: &'a Utf8Path,
    /// Where the EFI system partition is mounted, if there is one.
    pub(crate) efi_path: Option<&'a Utf8Path>,
    pub(crate) arch: &'a str,
    pub(crate) cmdline: &'a str,
    pub(crate) version: &'a str,
    /// Building a disk image rather than installing on the running machine.
    pub(crate) image_mode: bool,
    pub(crate) assets: &'a BootAssets,
}

/// The supported configuration formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootloaderKind {
    Extlinux,
    Grub,
}

impl BootloaderKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Extlinux => "extlinux",
            Self::Grub => "grub",
        }
    }
}

/// Absolute (boot partition relative) paths of a populated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotFiles {
    pub(crate) kernel: String,
    pub(crate) initrd: String,
    pub(crate) dtb_dir: String,
    pub(crate) fdt: Option<String>,
    pub(crate) overlays: Vec<String>,
}

/// Copy `src` into the boot partition at `dest`.
#[context("Copying {src} to {dest}")]
fn copy_asset(boot: &Dir, src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let mut f = std::fs::File::open(src)?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_str().is_empty()) {
        boot.create_dir_all(parent)?;
    }
    println!("copying {src} to /{dest}");
    boot.atomic_replace_with(dest, |w| std::io::copy(&mut f, w).map(drop))?;
    Ok(())
}

fn file_name(p: &Utf8Path) -> Result<&str> {
    p.file_name()
        .ok_or_else(|| anyhow::anyhow!("Asset path {p} has no file name"))
}

/// Copy `assets` into the directory of `slot`, returning the resulting paths.
#[context("Placing boot assets in slot {slot}")]
pub(crate) fn place_assets(boot: &Dir, slot: BootLabel, assets: &BootAssets) -> Result<SlotFiles> {
    let slot_dir = Utf8Path::new(slot.as_str());
    let kernel = slot_dir.join(KERNEL_ASSET);
    copy_asset(boot, &assets.kernel, &kernel)?;
    let initrd = slot_dir.join(INITRAMFS_ASSET);
    copy_asset(boot, &assets.initramfs, &initrd)?;

    let dtbs = slot_dir.join(SLOT_DTBS_DIR);
    let fdt = assets
        .dtb
        .as_deref()
        .map(|src| -> Result<_> {
            let dest = dtbs.join(file_name(src)?);
            copy_asset(boot, src, &dest)?;
            Ok(format!("/{dest}"))
        })
        .transpose()?;
    let overlays = assets
        .dtos
        .iter()
        .map(|src| -> Result<_> {
            let dest = dtbs.join(SLOT_OVERLAY_DIR).join(file_name(src)?);
            copy_asset(boot, src, &dest)?;
            Ok(format!("/{dest}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SlotFiles {
        kernel: format!("/{kernel}"),
        initrd: format!("/{initrd}"),
        dtb_dir: format!("/{dtbs}"),
        fdt,
        overlays,
    })
}

/// Durably replace the file at `path` with `contents`.
///
/// Everything already written to the filesystem (in particular slot assets)
/// is synced first, so the new config never references incomplete files.
#[context("Writing {path}")]
pub(crate) fn write_config(boot: &Dir, path: &Utf8Path, contents: &str) -> Result<()> {
    let name = file_name(path)?;
    let dir = match path.parent().filter(|p| !p.as_str().is_empty()) {
        Some(parent) => {
            boot.create_dir_all(parent)?;
            boot.open_dir(parent)?
        }
        None => boot.try_clone()?,
    };
    rustix::fs::syncfs(boot.reopen_as_ownedfd()?).context("syncfs")?;
    let tmpname = format!(".{name}.tmp");
    {
        let mut f = dir.create(&tmpname)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all().context("fsync")?;
    }
    dir.rename(&tmpname, &dir, name)?;
    rustix::fs::fsync(dir.reopen_as_ownedfd()?).context("fsync")?;
    tracing::debug!("committed {path}");
    Ok(())
}

/// The format-specific half of a backend; [`Bootloader`] is implemented once
/// on top of it.
pub(crate) trait BootConfig: std::fmt::Debug + Sized + Send + 'static {
    const KIND: BootloaderKind;
    /// Config path relative to the boot partition root.
    const PATH: &'static str;
    /// Whether this format boots via UEFI and needs an EFI system partition.
    const UEFI_BOOT: bool;

    /// A config that has never been installed.
    fn fresh() -> Self;
    fn parse(contents: &str) -> Result<Self>;
    fn render(&self) -> String;

    fn slots(&self) -> SlotState;
    /// Whether there is a boot entry for the current default slot.
    fn has_entry(&self) -> bool;

    /// Reject assets this format cannot boot, before anything is written.
    fn check_assets(_assets: &BootAssets) -> Result<()> {
        Ok(())
    }
    /// The next config: `slots`, with the default slot booting `files`.
    fn with_entry(&self, slots: SlotState, files: SlotFiles, opts: &InstallOptions) -> Self;
    /// The next config: `slots`, booting the default slot's existing files.
    fn with_slots(&self, slots: SlotState) -> Result<Self>;
    /// The slot [`Bootloader::revert`] switches to; `None` if this format
    /// does not revert on its own.
    fn revert_target(&self) -> Result<Option<BootLabel>>;
    /// Work that must follow a committed config, such as installing the
    /// bootloader binaries.
    fn post_commit(&self, _opts: &InstallOptions) -> Result<()> {
        Ok(())
    }
}

/// A bootloader backend bound to the config found on (or destined for) a
/// boot partition.
pub(crate) trait Bootloader: std::fmt::Debug + Send {
    fn kind(&self) -> BootloaderKind;
    /// Flip slots, populate the new default slot and commit the config.
    fn install(&mut self, boot: &Dir, opts: &InstallOptions) -> Result<()>;
    fn uefi_boot(&self) -> bool;
    fn default_label(&self) -> BootLabel;
    /// The fallback recorded by the last flip.
    fn previous_label(&self) -> Option<BootLabel>;
    /// Make `label` the default slot; returns whether the config changed.
    fn activate(&mut self, boot: &Dir, label: BootLabel) -> Result<bool>;
    /// Switch back to the fallback slot, where the format supports it.
    fn revert(&mut self, boot: &Dir) -> Result<()>;
}

impl<C: BootConfig> Bootloader for C {
    fn kind(&self) -> BootloaderKind {
        C::KIND
    }

    fn install(&mut self, boot: &Dir, opts: &InstallOptions) -> Result<()> {
        C::check_assets(opts.assets)?;
        let slots = self.slots().flipped(self.has_entry());
        tracing::debug!("installing into slot {} ({:?})", slots.default, slots);
        let files = place_assets(boot, slots.default, opts.assets)?;
        let next = self.with_entry(slots, files, opts);
        write_config(boot, Utf8Path::new(C::PATH), &next.render())?;
        *self = next;
        self.post_commit(opts)
    }

    fn uefi_boot(&self) -> bool {
        C::UEFI_BOOT
    }

    fn default_label(&self) -> BootLabel {
        self.slots().default
    }

    fn previous_label(&self) -> Option<BootLabel> {
        self.slots().fallback
    }

    fn activate(&mut self, boot: &Dir, label: BootLabel) -> Result<bool> {
        let slots = self.slots();
        if slots.default == label {
            return Ok(false);
        }
        let next = self.with_slots(slots.activated(label))?;
        write_config(boot, Utf8Path::new(C::PATH), &next.render())?;
        *self = next;
        Ok(true)
    }

    fn revert(&mut self, boot: &Dir) -> Result<()> {
        match self.revert_target()? {
            Some(label) => {
                self.activate(boot, label)?;
            }
            None => tracing::debug!("{:?} does not revert on its own", C::KIND),
        }
        Ok(())
    }
}

/// How to recognize and load one config format.
pub(crate) struct Strategy {
    pub(crate) kind: BootloaderKind,
    pub(crate) path: &'static str,
    load: fn(&str) -> Result<Box<dyn Bootloader>>,
    fresh: fn() -> Box<dyn Bootloader>,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

fn load_config<C: BootConfig>(contents: &str) -> Result<Box<dyn Bootloader>> {
    Ok(Box::new(C::parse(contents)?))
}

fn fresh_config<C: BootConfig>() -> Box<dyn Bootloader> {
    Box::new(C::fresh())
}

impl Strategy {
    const fn of<C: BootConfig>() -> Self {
        Self {
            kind: C::KIND,
            path: C::PATH,
            load: load_config::<C>,
            fresh: fresh_config::<C>,
        }
    }

    /// A backend with a fresh config of this format.
    pub(crate) fn fresh(&self) -> Box<dyn Bootloader> {
        (self.fresh)()
    }

    fn load(&self, contents: &str) -> Result<Box<dyn Bootloader>> {
        (self.load)(contents).with_context(|| format!("Parsing {}", self.path))
    }
}

/// Probe order; the first config found wins.
pub(crate) const STRATEGIES: &[Strategy] = &[
    Strategy::of::<grub::GrubConfig>(),
    Strategy::of::<extlinux::ExtlinuxConfig>(),
];

/// Used when a boot partition carries no recognizable config.
pub(crate) const FALLBACK_STRATEGY: Strategy = Strategy::of::<extlinux::ExtlinuxConfig>();

/// Find the bootloader config on a mounted boot partition.
#[context("Probing bootloader configuration")]
pub(crate) fn probe(boot: &Dir) -> Result<Option<Box<dyn Bootloader>>> {
    for strategy in STRATEGIES {
        let Some(mut f) = boot.open_optional(strategy.path)? else {
            continue;
        };
        let mut contents = String::new();
        f.read_to_string(&mut contents)
            .with_context(|| format!("Reading {}", strategy.path))?;
        tracing::debug!("found {:?} configuration at {}", strategy.kind, strategy.path);
        return strategy.load(&contents).map(Some);
    }
    Ok(None)
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_label_toggle() {
        assert_eq!(BootLabel::A.toggle(), BootLabel::B);
        assert_eq!(BootLabel::B.toggle(), BootLabel::A);
        assert_eq!("B".parse::<BootLabel>().unwrap(), BootLabel::B);
        assert!("C".parse::<BootLabel>().is_err());
        assert!("a".parse::<BootLabel>().is_err());
    }

    #[test]
    fn test_flip() {
        let fresh = SlotState::default();
        assert_eq!(fresh.flipped(false), fresh);
        let s = fresh.flipped(true);
        assert_eq!(s.default, BootLabel::B);
        assert_eq!(s.fallback, Some(BootLabel::A));
        let s = s.flipped(true);
        assert_eq!(s.default, BootLabel::A);
        assert_eq!(s.fallback, Some(BootLabel::B));
        assert_ne!(Some(s.default), s.fallback);
    }

    #[test]
    fn test_activated() {
        let s = SlotState {
            default: BootLabel::B,
            fallback: Some(BootLabel::A),
        };
        assert_eq!(s.activated(BootLabel::B), s);
        let r = s.activated(BootLabel::A);
        assert_eq!(r.default, BootLabel::A);
        assert_eq!(r.fallback, Some(BootLabel::B));
    }

    #[test]
    fn test_probe_empty() -> Result<()> {
        let td = boot_dir()?;
        assert!(probe(&td)?.is_none());
        // An unrelated file does not count
        td.create_dir_all("loader")?;
        td.atomic_write("loader/loader.conf", "timeout 3\n")?;
        assert!(probe(&td)?.is_none());
        Ok(())
    }

    #[test]
    fn test_probe_order() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(true)?;
        let mut b = FALLBACK_STRATEGY.fresh();
        assert_eq!(b.kind(), BootloaderKind::Extlinux);
        b.install(&td, &fixture.options("v1"))?;
        assert_eq!(probe(&td)?.unwrap().kind(), BootloaderKind::Extlinux);

        // grub takes precedence when both exist
        td.create_dir_all("grub")?;
        td.atomic_write(
            "grub/grub.cfg",
            indoc::indoc! { r#"
                set default="B - bootslot v1"
                set timeout=3

                menuentry "B - bootslot v1" {
                  linux /B/vmlinuz console=tty0
                  initrd /B/initramfs.xz
                }
            "# },
        )?;
        let found = probe(&td)?.unwrap();
        assert_eq!(found.kind(), BootloaderKind::Grub);
        assert_eq!(found.default_label(), BootLabel::B);
        Ok(())
    }

    #[test]
    fn test_probe_corrupt_config() -> Result<()> {
        let td = boot_dir()?;
        td.create_dir_all("extlinux")?;
        td.atomic_write("extlinux/extlinux.conf", "default C\n")?;
        assert!(probe(&td).is_err());
        Ok(())
    }

    #[test]
    fn test_place_assets_layout() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(true)?;
        let files = place_assets(&td, BootLabel::B, &fixture.assets)?;
        assert_eq!(files.kernel, "/B/vmlinuz");
        assert_eq!(files.initrd, "/B/initramfs.xz");
        assert_eq!(files.dtb_dir, "/B/dtbs");
        assert_eq!(files.fdt.as_deref(), Some("/B/dtbs/rk3588-rock-5b.dtb"));
        assert_eq!(files.overlays, ["/B/dtbs/overlay/rk3588-uart7-m2.dtbo"]);
        assert_eq!(td.read_to_string("B/vmlinuz")?, "kernel-0");
        assert_eq!(td.read_to_string("B/dtbs/overlay/rk3588-uart7-m2.dtbo")?, "dto");
        assert!(!td.exists("A"));
        Ok(())
    }

    #[test]
    fn test_write_config_replaces() -> Result<()> {
        let td = boot_dir()?;
        let p = Utf8Path::new("extlinux/extlinux.conf");
        write_config(&td, p, "one\n")?;
        write_config(&td, p, "two\n")?;
        assert_eq!(td.read_to_string(p)?, "two\n");
        assert!(!td.exists("extlinux/.extlinux.conf.tmp"));
        Ok(())
    }

    #[test]
    fn test_write_config_ambient_dir() -> Result<()> {
        // Opened the same way as a mounted boot partition
        let td = tempfile::tempdir()?;
        let boot = Dir::open_ambient_dir(td.path(), cap_std_ext::cap_std::ambient_authority())?;
        write_config(&boot, Utf8Path::new("top.conf"), "top\n")?;
        write_config(&boot, Utf8Path::new("grub/grub.cfg"), "nested\n")?;
        assert_eq!(std::fs::read_to_string(td.path().join("top.conf"))?, "top\n");
        assert_eq!(
            std::fs::read_to_string(td.path().join("grub/grub.cfg"))?,
            "nested\n"
        );
        Ok(())
    }
}
