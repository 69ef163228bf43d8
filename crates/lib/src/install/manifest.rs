//! The partitions an install touches and what happens to each.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::process::Command;

use anyhow::{Context, Result};
use bootslot_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::Mode;
use crate::constants::{
    BOOT_FILESYSTEM, BOOT_PARTITION_LABEL, EFI_FILESYSTEM, EFI_PARTITION_LABEL,
    META_PARTITION_LABEL,
};

/// One step applied to a target partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instruction {
    /// Create a filesystem labeled like the partition.
    Format { fstype: &'static str },
    /// Overwrite the whole partition with zeroes.
    Zero,
    /// Leave the contents alone.
    Preserve,
}

/// A partition, identified by label, and its instructions in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) label: &'static str,
    pub(crate) instructions: Vec<Instruction>,
}

/// Targets keyed by the disk holding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Manifest {
    pub(crate) targets: BTreeMap<Utf8PathBuf, Vec<Target>>,
}

impl Manifest {
    /// Decide what to do with each partition of `disk`.
    ///
    /// Installing over an existing bootloader requires `force`. Upgrades
    /// preserve everything; the bootloader only writes into the inactive slot.
    #[context("Creating installation manifest")]
    pub(crate) fn new(
        mode: Mode,
        disk: &Utf8Path,
        uefi: bool,
        bootloader_present: bool,
        force: bool,
        zero: bool,
    ) -> Result<Self> {
        if mode == Mode::Install && bootloader_present && !force {
            anyhow::bail!("{disk} already has a bootloader installed; use --force to overwrite it");
        }
        let fresh = mode != Mode::Upgrade;
        let wipe = |fstype| {
            let mut v = Vec::new();
            if zero {
                v.push(Instruction::Zero);
            }
            v.push(Instruction::Format { fstype });
            v
        };
        let mut targets = Vec::new();
        if uefi {
            targets.push(Target {
                label: EFI_PARTITION_LABEL,
                instructions: if fresh {
                    wipe(EFI_FILESYSTEM)
                } else {
                    vec![Instruction::Preserve]
                },
            });
        }
        targets.push(Target {
            label: BOOT_PARTITION_LABEL,
            instructions: if fresh {
                wipe(BOOT_FILESYSTEM)
            } else {
                vec![Instruction::Preserve]
            },
        });
        targets.push(Target {
            label: META_PARTITION_LABEL,
            instructions: vec![if fresh {
                Instruction::Zero
            } else {
                Instruction::Preserve
            }],
        });
        Ok(Self {
            targets: BTreeMap::from([(disk.to_owned(), targets)]),
        })
    }

    /// The disk holding the partition labeled `label`.
    pub(crate) fn device_for_label(&self, label: &str) -> Option<&Utf8Path> {
        self.targets
            .iter()
            .find(|(_, targets)| targets.iter().any(|t| t.label == label))
            .map(|(dev, _)| dev.as_path())
    }
}

/// The `mkfs` invocation creating a `fstype` filesystem labeled `label`.
fn mkfs_command(fstype: &str, label: &str, dev: &Utf8Path) -> Result<Command> {
    let mut cmd = match fstype {
        "ext4" => {
            let mut c = Command::new("mkfs.ext4");
            c.args(["-F", "-L", label]);
            c
        }
        "vfat" => {
            let mut c = Command::new("mkfs.vfat");
            c.args(["-F", "32", "-n", label]);
            c
        }
        o => anyhow::bail!("Unsupported filesystem type: {o}"),
    };
    cmd.arg(dev);
    Ok(cmd)
}

const ZERO_CHUNK: usize = 1024 * 1024;

/// Overwrite all of `dev` with zeroes.
#[context("Zeroing {dev}")]
pub(crate) fn zero_device(dev: &Utf8Path) -> Result<()> {
    let mut f = OpenOptions::new().write(true).open(dev)?;
    // Block devices report a zero length in their metadata
    let size = f.seek(SeekFrom::End(0))?;
    let buf = vec![0u8; ZERO_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let n = (size - offset).min(ZERO_CHUNK as u64) as usize;
        f.write_all_at(&buf[..n], offset)?;
        offset += n as u64;
    }
    f.sync_all()?;
    Ok(())
}

#[context("Applying {instruction:?} to {label} at {dev}")]
fn apply(dev: &Utf8Path, label: &str, instruction: Instruction) -> Result<()> {
    match instruction {
        Instruction::Format { fstype } => {
            println!("formatting {label} partition {dev} as {fstype}");
            mkfs_command(fstype, label, dev)?
                .log_debug()
                .run_capture_stderr()
        }
        Instruction::Zero => {
            println!("zeroing {label} partition {dev}");
            zero_device(dev)
        }
        Instruction::Preserve => {
            tracing::debug!("preserving {label} partition {dev}");
            Ok(())
        }
    }
}

/// Apply the manifest to the partitions that already exist on its disks.
#[context("Executing installation manifest")]
pub(crate) fn execute(manifest: &Manifest) -> Result<()> {
    for (disk, targets) in &manifest.targets {
        let dev = bootslot_blockdev::list_dev(disk)?;
        for target in targets {
            let part = dev.find_partition_labeled(target.label).with_context(|| {
                format!("{disk} has no {} partition", target.label)
            })?;
            let part = part.path();
            for instruction in &target.instructions {
                apply(&part, target.label, *instruction)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(m: &Manifest) -> Vec<(&str, Vec<Instruction>)> {
        m.targets
            .values()
            .flatten()
            .map(|t| (t.label, t.instructions.clone()))
            .collect()
    }

    #[test]
    fn test_install_manifest() -> Result<()> {
        let disk = Utf8Path::new("/dev/vda");
        let m = Manifest::new(Mode::Install, disk, false, false, false, false)?;
        assert_eq!(
            labels(&m),
            [
                ("BOOT", vec![Instruction::Format { fstype: "ext4" }]),
                ("META", vec![Instruction::Zero]),
            ]
        );
        assert_eq!(m.device_for_label("BOOT"), Some(disk));
        assert_eq!(m.device_for_label("EFI"), None);

        let m = Manifest::new(Mode::Image, disk, true, false, false, true)?;
        assert_eq!(
            labels(&m),
            [
                (
                    "EFI",
                    vec![Instruction::Zero, Instruction::Format { fstype: "vfat" }]
                ),
                (
                    "BOOT",
                    vec![Instruction::Zero, Instruction::Format { fstype: "ext4" }]
                ),
                ("META", vec![Instruction::Zero]),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_existing_bootloader() -> Result<()> {
        let disk = Utf8Path::new("/dev/vda");
        let e = Manifest::new(Mode::Install, disk, false, true, false, false).unwrap_err();
        assert!(format!("{e:#}").contains("--force"));
        Manifest::new(Mode::Install, disk, false, true, true, false)?;

        let m = Manifest::new(Mode::Upgrade, disk, true, true, false, false)?;
        assert!(labels(&m)
            .iter()
            .all(|(_, i)| i == &[Instruction::Preserve]));
        Ok(())
    }

    #[test]
    fn test_mkfs_command() -> Result<()> {
        let dev = Utf8Path::new("/dev/vda2");
        let cmd = mkfs_command("ext4", "BOOT", dev)?;
        assert_eq!(cmd.get_program(), "mkfs.ext4");
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            ["-F", "-L", "BOOT", "/dev/vda2"]
        );
        let cmd = mkfs_command("vfat", "EFI", dev)?;
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            ["-F", "32", "-n", "EFI", "/dev/vda2"]
        );
        assert!(mkfs_command("btrfs", "BOOT", dev).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_device() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8Path::from_path(td.path()).unwrap().join("part.img");
        let size = ZERO_CHUNK * 2 + 123;
        std::fs::write(&path, vec![0xa5u8; size])?;
        zero_device(&path)?;
        let contents = std::fs::read(&path)?;
        assert_eq!(contents.len(), size);
        assert!(contents.iter().all(|&b| b == 0));
        Ok(())
    }
}
