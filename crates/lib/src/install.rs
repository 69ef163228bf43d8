//! # Installing and upgrading the boot slots of a disk
//!
//! An install formats the boot partitions and populates slot `A`; an upgrade
//! keeps everything in place, populates the inactive slot and records the
//! slot it replaced so that the next boot can be reverted if it fails. Image
//! mode is an install into a disk image that will boot on another machine.
//!
//! Every stage either completes or aborts the whole run; nothing is retried.

mod aleph;
pub(crate) mod config;
pub(crate) mod manifest;
pub(crate) mod preflight;

use std::fmt::Display;
use std::str::FromStr;

use aleph::InstallAleph;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use manifest::Manifest;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::board::Board;
use crate::bootloader::{BootAssets, Bootloader, InstallOptions, FALLBACK_STRATEGY};
use crate::constants::{
    ASSETS_ROOT, BOOT_PARTITION_LABEL, EXTENSIONS_ASSET_DIR, KERNEL_PARAM_BOARD,
    KERNEL_PARAM_CONFIG, KERNEL_PARAM_CONSOLE, KERNEL_PARAM_NET_IFNAMES, KERNEL_PARAM_PLATFORM,
};
use crate::disk::DiskAccess;
use crate::kernel_cmdline::{Cmdline, KernelCmdline, DEFAULT_ARGS};
use crate::platform::{host_arch, Platform};
use crate::tagstore::{TagStore, UPGRADE_TAG};

/// What kind of run this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Mode {
    /// First install onto a disk.
    Install,
    /// Install into the inactive slot of an installed disk.
    Upgrade,
    /// Build a disk image for another machine.
    Image,
}

impl Mode {
    pub(crate) fn is_image(&self) -> bool {
        matches!(self, Self::Image)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Image => "image",
        })
    }
}

/// A tag to record in the tag store, given as `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetaValue {
    pub(crate) key: String,
    pub(crate) value: String,
}

impl FromStr for MetaValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, found {s:?}"))?;
        if key.is_empty() {
            anyhow::bail!("Empty tag key in {s:?}");
        }
        if key == UPGRADE_TAG {
            anyhow::bail!("Tag {UPGRADE_TAG} is reserved");
        }
        Ok(Self {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }
}

/// Options shared by `install` and `upgrade`.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// The disk to install to.
    #[clap(long)]
    pub(crate) disk: Utf8PathBuf,

    /// The platform the installed system runs on; defaults to `metal`.
    #[clap(long)]
    pub(crate) platform: Option<String>,

    /// Target architecture (`amd64` or `arm64`); defaults to that of this machine.
    #[clap(long)]
    pub(crate) arch: Option<String>,

    /// Single-board computer to install firmware for.
    #[clap(long)]
    pub(crate) board: Option<String>,

    /// Add a kernel argument. This option can be provided multiple times.
    ///
    /// `console` and `bootslot.platform` given here replace the values
    /// implied by the platform.
    #[clap(long = "extra-kernel-arg")]
    pub(crate) extra_kernel_args: Vec<String>,

    /// Overwrite an existing installation.
    #[clap(long)]
    pub(crate) force: bool,

    /// Zero the partitions before formatting, and ignore any existing
    /// bootloader configuration.
    #[clap(long)]
    pub(crate) zero: bool,

    /// Record a tag in the tag store. This option can be provided multiple times.
    #[clap(long = "meta", value_name = "KEY=VALUE")]
    pub(crate) meta_values: Vec<MetaValue>,

    /// URL the installed system fetches its configuration from.
    #[clap(long)]
    pub(crate) config_source: Option<String>,

    /// Kernel to install.
    #[clap(long)]
    pub(crate) kernel: Option<Utf8PathBuf>,

    /// Initramfs to install.
    #[clap(long)]
    pub(crate) initramfs: Option<Utf8PathBuf>,

    /// Device tree blob to install; defaults to the board's.
    #[clap(long)]
    pub(crate) dtb: Option<Utf8PathBuf>,

    /// Device tree overlay to install. This option can be provided multiple times.
    #[clap(long = "dto")]
    pub(crate) dtos: Vec<Utf8PathBuf>,

    /// Build a disk image for another machine rather than installing on this one.
    #[clap(long)]
    pub(crate) image_mode: bool,

    /// Version recorded for this install.
    #[clap(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub(crate) version: String,
}

/// Fully resolved install parameters.
#[derive(Debug, Clone)]
pub(crate) struct State {
    pub(crate) mode: Mode,
    pub(crate) disk: Utf8PathBuf,
    pub(crate) platform: Platform,
    pub(crate) arch: String,
    pub(crate) board: Option<&'static Board>,
    pub(crate) config_source: Option<String>,
    pub(crate) extra_kernel_args: Vec<String>,
    pub(crate) force: bool,
    pub(crate) zero: bool,
    pub(crate) meta_values: Vec<MetaValue>,
    pub(crate) version: String,
    pub(crate) assets: BootAssets,
    /// Where board firmware and device trees are shipped.
    pub(crate) assets_root: Utf8PathBuf,
}

impl InstallOpts {
    /// Resolve the options, filling in what is unset from `config` and then
    /// from built-in defaults.
    #[context("Resolving install options")]
    pub(crate) fn into_state(
        self,
        mode: Mode,
        config: Option<config::InstallConfiguration>,
        assets_root: &Utf8Path,
    ) -> Result<State> {
        let config = config.unwrap_or_default();
        let platform = self
            .platform
            .or(config.platform)
            .as_deref()
            .unwrap_or(Platform::Metal.name())
            .parse::<Platform>()?;
        let arch = self
            .arch
            .or(config.arch)
            .unwrap_or_else(|| host_arch().to_owned());
        let board = self
            .board
            .or(config.board)
            .map(|b| Board::lookup(&b))
            .transpose()?;
        if let Some(board) = board {
            if arch != "arm64" {
                anyhow::bail!("Board {} requires arm64, not {arch}", board.name);
            }
        }

        let mut extra_kernel_args = config.extra_kernel_args.unwrap_or_default();
        extra_kernel_args.extend(self.extra_kernel_args);

        let defaults = BootAssets::defaults_for(assets_root, &arch);
        let assets = BootAssets {
            kernel: self.kernel.unwrap_or(defaults.kernel),
            initramfs: self.initramfs.unwrap_or(defaults.initramfs),
            dtb: self
                .dtb
                .or_else(|| board.map(|b| b.device_tree_blob(assets_root))),
            dtos: match (self.dtos.is_empty(), board) {
                (true, Some(b)) => b.device_tree_overlays(assets_root),
                _ => self.dtos,
            },
        };

        Ok(State {
            mode,
            disk: self.disk,
            platform,
            arch,
            board,
            config_source: self.config_source.or(config.config_source),
            extra_kernel_args,
            force: self.force,
            zero: self.zero,
            meta_values: self.meta_values,
            version: self.version,
            assets,
            assets_root: assets_root.to_owned(),
        })
    }
}

impl State {
    /// Assemble the kernel command line of the installed system.
    #[context("Building kernel command line")]
    pub(crate) fn build_cmdline(&self) -> Result<KernelCmdline> {
        let mut cmdline = KernelCmdline::new();
        cmdline.append(KERNEL_PARAM_PLATFORM, Some(self.platform.name()));
        if let Some(source) = self.config_source.as_deref() {
            cmdline.append(KERNEL_PARAM_CONFIG, Some(source));
        }
        cmdline.set_all(self.platform.kernel_args(&self.arch))?;
        cmdline.append_all(DEFAULT_ARGS, &[])?;
        if let Some(board) = self.board {
            cmdline.append(KERNEL_PARAM_BOARD, Some(board.name));
            cmdline.set_all(board.kernel_args)?;
        }
        cmdline.append_all(
            &self.extra_kernel_args,
            &[KERNEL_PARAM_CONSOLE, KERNEL_PARAM_PLATFORM],
        )?;
        Ok(cmdline)
    }
}

/// The parts of an install that reach outside the boot partition.
pub(crate) trait InstallHooks: std::fmt::Debug {
    /// Fixups for known hardware and kernel quirks. Best effort: problems are
    /// logged, never fatal.
    fn apply_errata(&self, mode: Mode, cmdline: &mut KernelCmdline);
    /// Install system extensions, possibly replacing `assets` with extended
    /// copies.
    fn install_extensions(&self, assets: &mut BootAssets) -> Result<()>;
    /// Create filesystems and wipe partitions as the manifest says.
    fn execute_manifest(&self, manifest: &Manifest) -> Result<()>;
}

/// Keep `net.ifnames=0` of the running system across an upgrade so that
/// network interfaces keep their names.
fn errata_net_ifnames(running: &Cmdline, cmdline: &mut KernelCmdline) -> Result<()> {
    if cmdline.contains(KERNEL_PARAM_NET_IFNAMES) {
        return Ok(());
    }
    let Some(param) = running.find(KERNEL_PARAM_NET_IFNAMES) else {
        return Ok(());
    };
    if param.value_str()? == Some("0") {
        println!("keeping {KERNEL_PARAM_NET_IFNAMES}=0 of the running system");
        cmdline.append(KERNEL_PARAM_NET_IFNAMES, Some("0"));
    }
    Ok(())
}

/// Append the extension archives found in `dir` (in name order) to the
/// initramfs, writing the result into `workdir`.
#[context("Installing system extensions")]
fn append_extensions(dir: &Utf8Path, workdir: &Dir, assets: &mut BootAssets) -> Result<()> {
    let mut extensions = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    let path = Utf8PathBuf::try_from(entry.path())?;
                    extensions.push(path);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Reading {dir}")),
    }
    if extensions.is_empty() {
        tracing::debug!("no system extensions in {dir}");
        return Ok(());
    }
    extensions.sort();

    let mut base = std::fs::File::open(&assets.initramfs)
        .with_context(|| format!("Opening {}", assets.initramfs))?;
    let name = crate::constants::INITRAMFS_ASSET;
    workdir.atomic_replace_with(name, |w| -> Result<()> {
        std::io::copy(&mut base, w)?;
        for ext in &extensions {
            println!("installing extension {ext}");
            let mut f = std::fs::File::open(ext).with_context(|| format!("Opening {ext}"))?;
            std::io::copy(&mut f, w)?;
        }
        Ok(())
    })?;
    Ok(())
}

/// The collaborators of a real install.
#[derive(Debug)]
pub(crate) struct SystemHooks {
    extensions: Utf8PathBuf,
    workdir: tempfile::TempDir,
}

impl SystemHooks {
    pub(crate) fn new(assets_root: &Utf8Path) -> Result<Self> {
        Ok(Self {
            extensions: assets_root.join(EXTENSIONS_ASSET_DIR),
            workdir: tempfile::tempdir()?,
        })
    }
}

impl InstallHooks for SystemHooks {
    fn apply_errata(&self, mode: Mode, cmdline: &mut KernelCmdline) {
        if !std::path::Path::new("/sys/kernel/btf/vmlinux").exists() {
            tracing::warn!("kernel BTF is unavailable; eBPF based tools may not work");
        }
        if mode == Mode::Upgrade {
            let r = Cmdline::from_proc().and_then(|running| errata_net_ifnames(&running, cmdline));
            if let Err(e) = r {
                tracing::warn!("checking interface naming of the running system: {e:#}");
            }
        }
    }

    fn install_extensions(&self, assets: &mut BootAssets) -> Result<()> {
        let workdir_path = Utf8Path::from_path(self.workdir.path())
            .context("Temporary directory is not UTF-8")?;
        let workdir =
            Dir::open_ambient_dir(workdir_path, cap_std_ext::cap_std::ambient_authority())?;
        let before = assets.initramfs.clone();
        append_extensions(&self.extensions, &workdir, assets)?;
        if workdir.exists(crate::constants::INITRAMFS_ASSET) {
            assets.initramfs = workdir_path.join(crate::constants::INITRAMFS_ASSET);
            tracing::debug!("initramfs {before} extended into {}", assets.initramfs);
        }
        Ok(())
    }

    fn execute_manifest(&self, manifest: &Manifest) -> Result<()> {
        manifest::execute(manifest)
    }
}

fn check_cancelled(cancel: &CancellationToken, stage: &str) -> Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("Interrupted before {stage}");
    }
    Ok(())
}

/// One install, upgrade or image build.
#[derive(Debug)]
pub(crate) struct Installer<'a> {
    state: &'a State,
    disk: &'a dyn DiskAccess,
    hooks: &'a dyn InstallHooks,
    cmdline: KernelCmdline,
    assets: BootAssets,
    manifest: Manifest,
    bootloader: Box<dyn Bootloader>,
}

impl<'a> Installer<'a> {
    /// Build the command line, find the current bootloader and decide what
    /// happens to each partition. Nothing is written yet.
    #[context("Preparing installation")]
    pub(crate) fn new(
        state: &'a State,
        disk: &'a dyn DiskAccess,
        hooks: &'a dyn InstallHooks,
    ) -> Result<Self> {
        let cmdline = state.build_cmdline()?;
        let probed = if state.zero {
            None
        } else {
            disk.probe_bootloader()?
        };
        let present = probed.is_some();
        let bootloader = probed.unwrap_or_else(|| FALLBACK_STRATEGY.fresh());
        tracing::debug!(
            "using {:?} bootloader (existing: {present})",
            bootloader.kind()
        );
        let manifest = Manifest::new(
            state.mode,
            &state.disk,
            bootloader.uefi_boot(),
            present,
            state.force,
            state.zero,
        )?;
        Ok(Self {
            state,
            disk,
            hooks,
            cmdline,
            assets: state.assets.clone(),
            manifest,
            bootloader,
        })
    }

    /// Run every stage in order.
    pub(crate) fn install(mut self, cancel: &CancellationToken) -> Result<()> {
        let mode = self.state.mode;
        self.hooks.apply_errata(mode, &mut self.cmdline);

        if mode == Mode::Upgrade {
            preflight::run_checks(
                &preflight::PreflightContext {
                    disk: &self.state.disk,
                    assets: &self.assets,
                    disk_access: self.disk,
                },
                cancel,
            )?;
        }

        check_cancelled(cancel, "installing extensions")?;
        self.hooks
            .install_extensions(&mut self.assets)
            .context("Installing extensions")?;
        check_cancelled(cancel, "executing the manifest")?;
        self.hooks
            .execute_manifest(&self.manifest)
            .context("Executing manifest")?;

        self.manifest
            .device_for_label(BOOT_PARTITION_LABEL)
            .with_context(|| format!("Failed to detect {BOOT_PARTITION_LABEL} target device"))?;
        // Past this point the bootloader commits; the tags must follow it.
        check_cancelled(cancel, "installing the bootloader")?;
        let boot = self
            .disk
            .mount_boot(false)?
            .with_context(|| format!("No {BOOT_PARTITION_LABEL} partition on {}", self.state.disk))?;

        self.install_bootloader(boot.dir(), boot.path(), boot.efi_path())?;

        if let Some(board) = self.state.board {
            println!("installing U-Boot for {}", board.name);
            board.install(&self.state.disk, &self.state.assets_root)?;
        }

        self.commit_tags()?;

        InstallAleph::new(&self.state.version, mode, self.bootloader.as_ref())?
            .write_to(boot.dir())?;
        drop(boot);

        println!("{mode} of {} complete", self.state.version);
        Ok(())
    }

    #[context("Installing bootloader")]
    fn install_bootloader(
        &mut self,
        boot: &Dir,
        boot_path: &Utf8Path,
        efi_path: Option<&Utf8Path>,
    ) -> Result<()> {
        let cmdline = self.cmdline.to_string();
        let opts = InstallOptions {
            boot_disk: Some(&self.state.disk),
            boot_path,
            efi_path,
            arch: &self.state.arch,
            cmdline: &cmdline,
            version: &self.state.version,
            image_mode: self.state.mode.is_image(),
            assets: &self.assets,
        };
        self.bootloader.install(boot, &opts)
    }

    /// Record the upgrade and any user tags.
    #[context("Committing tags")]
    fn commit_tags(&self) -> Result<()> {
        let upgrade = self.state.mode == Mode::Upgrade;
        if !upgrade && self.state.meta_values.is_empty() {
            return Ok(());
        }
        let mut store: TagStore = self
            .disk
            .open_tag_store()?
            .context("No META partition to record tags in")?;
        if upgrade {
            let previous = self
                .bootloader
                .previous_label()
                .map(|l| l.as_str())
                .unwrap_or_default();
            store.set_tag(UPGRADE_TAG, previous)?;
        }
        for v in &self.state.meta_values {
            store.set_tag(&v.key, &v.value)?;
        }
        store.flush()
    }
}

/// Install (or upgrade) `state` onto the disk behind `disk`.
pub(crate) fn run(
    state: &State,
    disk: &dyn DiskAccess,
    hooks: &dyn InstallHooks,
    cancel: &CancellationToken,
) -> Result<()> {
    Installer::new(state, disk, hooks)?.install(cancel)
}

/// The default location of shipped assets.
pub(crate) fn assets_root() -> &'static Utf8Path {
    Utf8Path::new(ASSETS_ROOT)
}
