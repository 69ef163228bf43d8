//! `extlinux.conf`, as read by U-Boot's distro boot.
//!
//! U-Boot has no notion of a fallback entry, so the fallback is recorded in
//! a comment that the next flip (and the revert agent) can find. The stanza
//! of the fallback slot is kept after the default one, so switching back
//! restores it exactly as it was installed:
//!
//! ```text
//! # fallback A
//! default B
//!
//! label B
//!     kernel /B/vmlinuz
//!     ...
//!
//! label A
//!     kernel /A/vmlinuz
//!     ...
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::{BootAssets, BootConfig, BootLabel, BootloaderKind, InstallOptions, SlotFiles, SlotState};

/// Arguments U-Boot needs in front of the kernel command line.
const APPEND_PREFIX: &[&str] = &["rootwait", "keepinitrd", "retain_initrd"];

const FALLBACK_MARKER: &str = "fallback";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    kernel: String,
    initrd: String,
    fdtdir: Option<String>,
    fdt: Option<String>,
    fdtoverlays: Vec<String>,
    /// The kernel command line, without [`APPEND_PREFIX`]
    cmdline: String,
}

impl Entry {
    fn render(&self, label: BootLabel, r: &mut String) {
        r.push_str(&format!("\nlabel {label}\n"));
        r.push_str(&format!("    kernel {}\n", self.kernel));
        r.push_str(&format!("    initrd {}\n", self.initrd));
        if let Some(fdtdir) = &self.fdtdir {
            r.push_str(&format!("    devicetreedir {fdtdir}\n"));
        }
        if let Some(fdt) = &self.fdt {
            r.push_str(&format!("    fdt {fdt}\n"));
        }
        if !self.fdtoverlays.is_empty() {
            r.push_str(&format!("    fdtoverlays {}\n", self.fdtoverlays.join(" ")));
        }
        let mut append = APPEND_PREFIX.join(" ");
        if !self.cmdline.is_empty() {
            append.push(' ');
            append.push_str(&self.cmdline);
        }
        r.push_str(&format!("    append {append}\n"));
    }
}

/// Parsed `extlinux/extlinux.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtlinuxConfig {
    slots: SlotState,
    entries: BTreeMap<BootLabel, Entry>,
}

#[derive(Debug)]
struct PartialEntry<'a> {
    label: BootLabel,
    kernel: Option<&'a str>,
    initrd: Option<&'a str>,
    fdtdir: Option<&'a str>,
    fdt: Option<&'a str>,
    fdtoverlays: Vec<String>,
    append: Option<&'a str>,
}

impl<'a> PartialEntry<'a> {
    fn new(label: BootLabel) -> Self {
        Self {
            label,
            kernel: None,
            initrd: None,
            fdtdir: None,
            fdt: None,
            fdtoverlays: Vec::new(),
            append: None,
        }
    }

    fn finish(self) -> Result<Entry> {
        let label = self.label;
        Ok(Entry {
            kernel: self
                .kernel
                .with_context(|| format!("Entry {label} has no kernel"))?
                .to_owned(),
            initrd: self
                .initrd
                .with_context(|| format!("Entry {label} has no initrd"))?
                .to_owned(),
            fdtdir: self.fdtdir.map(ToOwned::to_owned),
            fdt: self.fdt.map(ToOwned::to_owned),
            fdtoverlays: self.fdtoverlays,
            cmdline: self.append.map(strip_append_prefix).unwrap_or_default(),
        })
    }
}

fn strip_append_prefix(append: &str) -> String {
    let mut words = append.split_whitespace().peekable();
    while words.next_if(|w| APPEND_PREFIX.contains(w)).is_some() {}
    words.collect::<Vec<_>>().join(" ")
}

impl BootConfig for ExtlinuxConfig {
    const KIND: BootloaderKind = BootloaderKind::Extlinux;
    const PATH: &'static str = "extlinux/extlinux.conf";
    const UEFI_BOOT: bool = false;

    fn fresh() -> Self {
        Self {
            slots: SlotState::default(),
            entries: BTreeMap::new(),
        }
    }

    fn parse(contents: &str) -> Result<Self> {
        let mut default = None;
        let mut fallback = None;
        let mut stanzas: Vec<PartialEntry> = Vec::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if let Some((FALLBACK_MARKER, word)) = comment.trim().split_once(' ') {
                    match word.trim().parse::<BootLabel>() {
                        Ok(label) => fallback = Some(label),
                        Err(_) => tracing::debug!("ignoring comment {line:?}"),
                    }
                }
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((line, ""));
            match key {
                "default" => default = Some(value.parse::<BootLabel>()?),
                "label" => {
                    let label = value.parse::<BootLabel>()?;
                    if stanzas.iter().any(|e| e.label == label) {
                        anyhow::bail!("Multiple stanzas for label {label}");
                    }
                    stanzas.push(PartialEntry::new(label));
                }
                key => {
                    let Some(e) = stanzas.last_mut() else {
                        tracing::debug!("ignoring global extlinux directive {key}");
                        continue;
                    };
                    match key {
                        "kernel" | "linux" => e.kernel = Some(value),
                        "initrd" => e.initrd = Some(value),
                        "devicetreedir" | "fdtdir" => e.fdtdir = Some(value),
                        "fdt" | "devicetree" => e.fdt = Some(value),
                        "fdtoverlays" => {
                            e.fdtoverlays =
                                value.split_whitespace().map(ToOwned::to_owned).collect()
                        }
                        "append" => e.append = Some(value),
                        o => tracing::debug!("ignoring extlinux directive {o}"),
                    }
                }
            }
        }

        let default = default
            .or(stanzas.first().map(|e| e.label))
            .context("No default label in extlinux configuration")?;
        if fallback == Some(default) {
            anyhow::bail!("Fallback label equals the default label {default}");
        }
        let entries = stanzas
            .into_iter()
            .map(|e| -> Result<_> { Ok((e.label, e.finish()?)) })
            .collect::<Result<BTreeMap<_, _>>>()?;
        if !entries.is_empty() && !entries.contains_key(&default) {
            anyhow::bail!("No entry for the default label {default}");
        }
        Ok(Self {
            slots: SlotState { default, fallback },
            entries,
        })
    }

    fn render(&self) -> String {
        let mut r = String::new();
        if let Some(fallback) = self.slots.fallback {
            r.push_str(&format!("# {FALLBACK_MARKER} {fallback}\n"));
        }
        r.push_str(&format!("default {}\n", self.slots.default));
        // Default first; U-Boot falls back to the first stanza when the
        // default label is unknown to it.
        let default = self.slots.default;
        if let Some(e) = self.entries.get(&default) {
            e.render(default, &mut r);
        }
        for (label, e) in self.entries.iter().filter(|(l, _)| **l != default) {
            e.render(*label, &mut r);
        }
        r
    }

    fn slots(&self) -> SlotState {
        self.slots
    }

    fn has_entry(&self) -> bool {
        self.entries.contains_key(&self.slots.default)
    }

    fn check_assets(assets: &BootAssets) -> Result<()> {
        if assets.dtb.is_none() {
            anyhow::bail!("extlinux requires a device tree blob");
        }
        Ok(())
    }

    fn with_entry(&self, slots: SlotState, files: SlotFiles, opts: &InstallOptions) -> Self {
        let mut entries = BTreeMap::new();
        // The replaced slot keeps its stanza; anything else is overwritten.
        if let Some(fallback) = slots.fallback {
            if let Some(e) = self.entries.get(&fallback) {
                entries.insert(fallback, e.clone());
            }
        }
        entries.insert(
            slots.default,
            Entry {
                kernel: files.kernel,
                initrd: files.initrd,
                fdtdir: Some(files.dtb_dir),
                fdt: files.fdt,
                fdtoverlays: files.overlays,
                cmdline: opts.cmdline.to_owned(),
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

    /// The default can only be switched by [`super::Bootloader::activate`]
    /// with a known target slot; there is nothing to revert to by itself.
    fn revert_target(&self) -> Result<Option<BootLabel>> {
        Ok(None)
    }
}
