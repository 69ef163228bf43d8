//! Multi-entry GRUB configuration.
//!
//! Unlike extlinux, GRUB keeps a menuentry per slot and knows about a
//! fallback entry natively, so the inactive slot stays selectable from the
//! boot menu.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use bootslot_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use super::{BootConfig, BootLabel, BootloaderKind, InstallOptions, SlotFiles, SlotState};
use crate::constants::{BOOT_PARTITION_LABEL, EFI_SUBDIR};
use crate::parsers::grub_menuconfig::{parse_grub_menuentry_file, MenuEntry, MenuentryBody};
use crate::platform::host_arch;

const TIMEOUT_SECS: u32 = 3;
const ENTRY_SETTINGS: &[(&str, &str)] = &[("set", "gfxmode=auto"), ("set", "gfxpayload=text")];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    /// Human readable part of the title, e.g. `bootslot v1.8.0`
    name: String,
    linux: String,
    cmdline: String,
    initrd: String,
}

impl Entry {
    fn title(&self, label: BootLabel) -> String {
        format!("{label} - {}", self.name)
    }
}

/// Parsed `grub/grub.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GrubConfig {
    slots: SlotState,
    entries: BTreeMap<BootLabel, Entry>,
}

/// Split a menuentry title into its slot label and name.
fn parse_title(title: &str) -> Result<(BootLabel, &str)> {
    match title.split_once(" - ") {
        Some((label, name)) => Ok((label.parse()?, name)),
        None => Ok((title.parse()?, "")),
    }
}

fn set_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"(?m)^\s*set\s+(default|fallback)="([^"]*)"\s*$"#).unwrap())
}

impl GrubConfig {
    fn title_for(&self, label: BootLabel) -> String {
        match self.entries.get(&label) {
            Some(e) => e.title(label),
            None => label.to_string(),
        }
    }
}

impl BootConfig for GrubConfig {
    const KIND: BootloaderKind = BootloaderKind::Grub;
    const PATH: &'static str = "grub/grub.cfg";
    const UEFI_BOOT: bool = true;

    fn fresh() -> Self {
        Self {
            slots: SlotState::default(),
            entries: BTreeMap::new(),
        }
    }

    fn parse(contents: &str) -> Result<Self> {
        let mut default = None;
        let mut fallback = None;
        for cap in set_regex().captures_iter(contents) {
            let (label, _) = parse_title(&cap[2])?;
            match &cap[1] {
                "default" => default = Some(label),
                _ => fallback = Some(label),
            }
        }
        let default = default.context("No default entry in grub configuration")?;
        if fallback == Some(default) {
            anyhow::bail!("Fallback entry equals the default entry {default}");
        }

        let mut entries = BTreeMap::new();
        for menuentry in parse_grub_menuentry_file(contents)? {
            let (label, name) = parse_title(&menuentry.title)?;
            let (linux, cmdline) = menuentry
                .body
                .linux
                .split_once(char::is_whitespace)
                .unwrap_or((menuentry.body.linux, ""));
            if linux.is_empty() {
                anyhow::bail!("Entry {label} has no linux command");
            }
            let entry = Entry {
                name: name.to_owned(),
                linux: linux.to_owned(),
                cmdline: cmdline.trim().to_owned(),
                initrd: menuentry.body.initrd.to_owned(),
            };
            if entries.insert(label, entry).is_some() {
                anyhow::bail!("Duplicate entry for slot {label}");
            }
        }

        Ok(Self {
            slots: SlotState { default, fallback },
            entries,
        })
    }

    fn render(&self) -> String {
        let mut r = format!("set default=\"{}\"\n", self.title_for(self.slots.default));
        if let Some(fallback) = self.slots.fallback {
            r.push_str(&format!("set fallback=\"{}\"\n", self.title_for(fallback)));
        }
        r.push_str(&format!("set timeout={TIMEOUT_SECS}\n"));
        r.push_str("\ninsmod all_video\n\nterminal_input console\nterminal_output console\n");
        for (label, entry) in &self.entries {
            let linux = match entry.cmdline.as_str() {
                "" => entry.linux.clone(),
                cmdline => format!("{} {cmdline}", entry.linux),
            };
            let menuentry = MenuEntry {
                title: entry.title(*label),
                body: MenuentryBody {
                    linux: &linux,
                    initrd: &entry.initrd,
                    extra: ENTRY_SETTINGS.to_vec(),
                },
            };
            r.push('\n');
            r.push_str(&menuentry.to_string());
        }
        r
    }

    fn slots(&self) -> SlotState {
        self.slots
    }

    fn has_entry(&self) -> bool {
        self.entries.contains_key(&self.slots.default)
    }

    fn with_entry(&self, slots: SlotState, files: SlotFiles, opts: &InstallOptions) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(
            slots.default,
            Entry {
                name: format!("bootslot {}", opts.version),
                linux: files.kernel,
                cmdline: opts.cmdline.to_owned(),
                initrd: files.initrd,
            },
        );
        Self { slots, entries }
    }

    fn with_slots(&self, slots: SlotState) -> Result<Self> {
        if !self.entries.contains_key(&slots.default) {
            anyhow::bail!("No boot entry for slot {}", slots.default);
        }
        Ok(Self {
            slots,
            entries: self.entries.clone(),
        })
    }

    fn revert_target(&self) -> Result<Option<BootLabel>> {
        self.slots
            .fallback
            .map(Some)
            .context("No fallback entry to revert to")
    }

    fn post_commit(&self, opts: &InstallOptions) -> Result<()> {
        let disk = resolve_boot_disk(opts.boot_disk)?;
        let efi = opts
            .efi_path
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| opts.boot_path.join(EFI_SUBDIR));
        for target in target_platforms(opts.arch, host_arch(), opts.image_mode)? {
            let args = grub_install_args(opts.boot_path, &efi, &disk, *target, opts.image_mode);
            let mut cmd = Command::new("grub-install");
            cmd.args(&args);
            println!("executing: {}", cmd.to_string_pretty());
            cmd.log_debug()
                .run_capture_stderr()
                .context("Running grub-install")?;
        }
        Ok(())
    }
}

/// Firmware platforms to install for; `None` lets grub-install pick the
/// platform of the running machine.
fn target_platforms(
    arch: &str,
    host_arch: &str,
    image_mode: bool,
) -> Result<&'static [Option<&'static str>]> {
    if arch == "amd64" && host_arch == "amd64" && !image_mode {
        return Ok(&[None]);
    }
    match arch {
        "amd64" => Ok(&[Some("x86_64-efi"), Some("i386-pc")]),
        "arm64" => Ok(&[Some("arm64-efi")]),
        o => anyhow::bail!("Unsupported architecture for grub: {o}"),
    }
}

fn grub_install_args(
    boot: &Utf8Path,
    efi: &Utf8Path,
    disk: &Utf8Path,
    target: Option<&str>,
    image_mode: bool,
) -> Vec<String> {
    let mut args = vec![
        format!("--boot-directory={boot}"),
        format!("--efi-directory={efi}"),
        "--removable".to_owned(),
    ];
    if image_mode {
        args.push("--no-nvram".to_owned());
    }
    if let Some(target) = target {
        args.push(format!("--target={target}"));
    }
    args.push(disk.to_string());
    args
}

/// The whole-disk device carrying the boot partition.
#[context("Locating boot disk")]
fn resolve_boot_disk(disk: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
    match disk {
        Some(disk) => {
            let dev = bootslot_blockdev::list_dev(disk)?;
            if dev.find_partition_labeled(BOOT_PARTITION_LABEL).is_none() {
                anyhow::bail!("{disk} has no {BOOT_PARTITION_LABEL} partition");
            }
            Ok(dev.path())
        }
        None => bootslot_blockdev::find_disk_for_label(BOOT_PARTITION_LABEL)?
            .with_context(|| format!("No disk with a {BOOT_PARTITION_LABEL} partition found")),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{place_assets, write_config, Bootloader};
    use super::*;
    use cap_std_ext::cap_std::fs::Dir;

    const CONFIG: &str = "grub/grub.cfg";

    fn load(boot: &Dir) -> Result<GrubConfig> {
        GrubConfig::parse(&boot.read_to_string(CONFIG)?)
    }

    /// Run the install sequence up to (and including) the commit; the
    /// grub-install step needs a real disk.
    fn install_config(boot: &Dir, c: &GrubConfig, fixture: &Fixture, version: &str) -> Result<GrubConfig> {
        let opts = fixture.options(version);
        let slots = c.slots().flipped(c.has_entry());
        let files = place_assets(boot, slots.default, &fixture.assets)?;
        let next = c.with_entry(slots, files, &opts);
        write_config(boot, Utf8Path::new(CONFIG), &next.render())?;
        Ok(next)
    }

    #[test]
    fn test_render_two_slots() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(false)?;
        let c = install_config(&td, &GrubConfig::fresh(), &fixture, "v1.7.0")?;
        let c = install_config(&td, &c, &fixture, "v1.8.0")?;
        similar_asserts::assert_eq!(
            td.read_to_string(CONFIG)?,
            indoc::indoc! { r#"
                set default="B - bootslot v1.8.0"
                set fallback="A - bootslot v1.7.0"
                set timeout=3

                insmod all_video

                terminal_input console
                terminal_output console

                menuentry "A - bootslot v1.7.0" {
                  set gfxmode=auto
                  set gfxpayload=text
                  linux /A/vmlinuz console=tty0
                  initrd /A/initramfs.xz
                }

                menuentry "B - bootslot v1.8.0" {
                  set gfxmode=auto
                  set gfxpayload=text
                  linux /B/vmlinuz console=tty0
                  initrd /B/initramfs.xz
                }
            "# }
        );
        assert_eq!(load(&td)?, c);
        Ok(())
    }

    #[test]
    fn test_alternating_upgrades() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(false)?;
        let mut c = GrubConfig::fresh();
        let mut expected = BootLabel::A;
        for i in 0..5 {
            c = install_config(&td, &load(&td).unwrap_or(c), &fixture, &format!("v{i}"))?;
            assert_eq!(c.default_label(), expected);
            assert_eq!(c.previous_label(), (i > 0).then(|| expected.toggle()));
            assert_eq!(c.entries.len(), if i == 0 { 1 } else { 2 });
            expected = expected.toggle();
        }
        Ok(())
    }

    #[test]
    fn test_flip_without_default_entry() -> Result<()> {
        // A default with no matching menuentry is treated as fresh
        let c = GrubConfig::parse("set default=\"B\"\n")?;
        assert!(!c.has_entry());
        assert_eq!(c.slots().flipped(c.has_entry()).default, BootLabel::B);
        Ok(())
    }

    #[test]
    fn test_revert_and_activate() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(false)?;
        let c = install_config(&td, &GrubConfig::fresh(), &fixture, "v1")?;
        let mut c = install_config(&td, &c, &fixture, "v2")?;
        assert_eq!(c.default_label(), BootLabel::B);

        c.revert(&td)?;
        let on_disk = load(&td)?;
        assert_eq!(on_disk.slots().default, BootLabel::A);
        assert_eq!(on_disk.slots().fallback, Some(BootLabel::B));
        // Both entries are kept
        assert_eq!(on_disk.entries.len(), 2);

        assert!(!c.activate(&td, BootLabel::A)?);
        assert!(c.activate(&td, BootLabel::B)?);
        assert_eq!(load(&td)?.slots().default, BootLabel::B);
        Ok(())
    }

    #[test]
    fn test_revert_without_fallback() -> Result<()> {
        let td = boot_dir()?;
        let fixture = Fixture::new(false)?;
        let mut c = install_config(&td, &GrubConfig::fresh(), &fixture, "v1")?;
        let before = td.read_to_string(CONFIG)?;
        assert!(c.revert(&td).is_err());
        assert!(c.activate(&td, BootLabel::B).is_err());
        assert_eq!(td.read_to_string(CONFIG)?, before);
        Ok(())
    }

    #[test]
    fn test_failed_copy_leaves_config() -> Result<()> {
        let td = boot_dir()?;
        let mut fixture = Fixture::new(false)?;
        let c = install_config(&td, &GrubConfig::fresh(), &fixture, "v1")?;
        let before = td.read_to_string(CONFIG)?;
        fixture.assets.kernel = "/nonexistent/vmlinuz".into();
        let mut b = c.clone();
        assert!(b.install(&td, &fixture.options("v2")).is_err());
        assert_eq!(b, c);
        assert_eq!(td.read_to_string(CONFIG)?, before);
        Ok(())
    }

    #[test]
    fn test_uefi() {
        assert!(GrubConfig::fresh().uefi_boot());
    }

    #[test]
    fn test_target_platforms() -> Result<()> {
        assert_eq!(target_platforms("amd64", "amd64", false)?, [None::<&str>]);
        assert_eq!(
            target_platforms("amd64", "amd64", true)?,
            [Some("x86_64-efi"), Some("i386-pc")]
        );
        assert_eq!(
            target_platforms("amd64", "arm64", false)?,
            [Some("x86_64-efi"), Some("i386-pc")]
        );
        assert_eq!(target_platforms("arm64", "amd64", false)?, [Some("arm64-efi")]);
        assert!(target_platforms("riscv64", "amd64", false).is_err());
        Ok(())
    }

    #[test]
    fn test_grub_install_args() {
        let args = grub_install_args(
            Utf8Path::new("/run/bootslot/boot"),
            Utf8Path::new("/run/bootslot/boot/EFI"),
            Utf8Path::new("/dev/loop0"),
            Some("arm64-efi"),
            true,
        );
        assert_eq!(
            args,
            [
                "--boot-directory=/run/bootslot/boot",
                "--efi-directory=/run/bootslot/boot/EFI",
                "--removable",
                "--no-nvram",
                "--target=arm64-efi",
                "/dev/loop0",
            ]
        );
        let args = grub_install_args(
            Utf8Path::new("/boot"),
            Utf8Path::new("/boot/EFI"),
            Utf8Path::new("/dev/sda"),
            None,
            false,
        );
        assert_eq!(
            args,
            ["--boot-directory=/boot", "--efi-directory=/boot/EFI", "--removable", "/dev/sda"]
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "set timeout=3\n",
            "set default=\"C - bootslot v1\"\n",
            "set default=\"A - x\"\nset fallback=\"A - x\"\n",
            "set default=\"A - x\"\nmenuentry \"A - x\" {\n  linux /A/vmlinuz\n}\nmenuentry \"A - y\" {\n  linux /A/vmlinuz\n}\n",
        ] {
            assert!(GrubConfig::parse(bad).is_err(), "{bad}");
        }
    }
}
