//! Helpers for interacting with mountpoints

use std::process::Command;

use anyhow::{Context, Result};
use bootslot_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

/// A single mounted filesystem as reported by `findmnt --json`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// The mount source
    pub source: String,
    /// The mount target
    pub target: String,
    /// The filesystem type
    pub fstype: String,
    /// Mount options
    pub options: String,
    /// Filesystem UUID, if any
    pub uuid: Option<String>,
    /// Nested mounts
    pub children: Option<Vec<Filesystem>>,
}

/// The output of `findmnt --json`.
#[derive(Deserialize, Debug)]
pub struct Findmnt {
    /// All matched filesystems
    pub filesystems: Vec<Filesystem>,
}

/// Run `findmnt` with the provided extra arguments and optional path.
pub fn run_findmnt(args: &[&str], path: Option<&str>) -> Result<Findmnt> {
    let mut cmd = Command::new("findmnt");
    cmd.args([
        "-J",
        "-v",
        // If you change this you probably also want to change the Filesystem struct above
        "--output=SOURCE,TARGET,FSTYPE,OPTIONS,UUID",
    ])
    .args(args)
    .args(path);
    cmd.log_debug().run_and_parse_json()
}

fn mount_targets_of<'a>(mounts: &'a Findmnt, source: &'a str) -> impl Iterator<Item = &'a str> {
    mounts
        .filesystems
        .iter()
        .filter(move |fs| fs.source == source)
        .map(|fs| fs.target.as_str())
}

/// Return the first mount point of the given device, if it is mounted.
#[context("Checking mounts of {source}")]
pub fn mounted_at(source: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let mounts = run_findmnt(&["--list"], None)?;
    let r = mount_targets_of(&mounts, source.as_str())
        .next()
        .map(Utf8PathBuf::from);
    Ok(r)
}

/// A scoped mount: the filesystem is unmounted when this value is dropped,
/// on every exit path.
#[derive(Debug)]
pub struct MountGuard {
    target: Utf8PathBuf,
    mounted: bool,
}

/// Options for [`MountGuard::mount`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MountOptions<'a> {
    /// Filesystem type; autodetected if unset.
    pub fstype: Option<&'a str>,
    /// Mount read-only.
    pub readonly: bool,
}

impl MountGuard {
    /// Mount `source` at `target`, creating the target directory if needed.
    #[context("Mounting {source} at {target}")]
    pub fn mount(source: &Utf8Path, target: &Utf8Path, opts: MountOptions) -> Result<Self> {
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        let mut cmd = Command::new("mount");
        if let Some(fstype) = opts.fstype {
            cmd.args(["-t", fstype]);
        }
        if opts.readonly {
            cmd.args(["-o", "ro"]);
        }
        cmd.arg(source).arg(target);
        cmd.log_debug().run_capture_stderr()?;
        Ok(Self {
            target: target.to_owned(),
            mounted: true,
        })
    }

    fn impl_unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        Command::new("umount")
            .arg(self.target.as_str())
            .log_debug()
            .run_capture_stderr()
            .with_context(|| format!("Unmounting {}", self.target))
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(e) = self.impl_unmount() {
            tracing::warn!("failed to unmount: {e:#}");
        }
    }
}
