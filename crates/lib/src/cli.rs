//! # bootslot command line
//!
//! Command line tool to install, upgrade and revert the boot slots of a disk.

use std::ffi::OsString;

use anyhow::{Context, Result};
use bootslot_blockdev::LoopbackDevice;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::disk::{DiskAccess, SystemDisk};
use crate::install::config::InstallConfiguration;
use crate::install::{self, InstallOpts, Mode, SystemHooks};
use crate::revert::{revert_bootloader, RevertOutcome};

/// Options selecting the disk for commands run on an installed system.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct DiskOpts {
    /// Only look for partitions on this disk.
    #[clap(long)]
    pub(crate) disk: Option<Utf8PathBuf>,
}

/// Operations on the tag store.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum TagsOpts {
    /// Print the value of a tag.
    Read { key: String },
    /// Set a tag.
    Write { key: String, value: String },
    /// Remove a tag.
    Delete { key: String },
    /// Print all tags as `KEY=VALUE`.
    List,
}

/// Install, upgrade and revert the boot slots of a disk.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "bootslot")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) enum Opt {
    /// Install onto a disk, formatting its boot partitions.
    Install(InstallOpts),
    /// Install into the inactive boot slot and boot it next.
    ///
    /// The slot booted before stays in place; if the next boot is not
    /// confirmed with `bootslot confirm`, `bootslot revert` returns to it.
    Upgrade(InstallOpts),
    /// Return to the previous boot slot if the last upgrade was never confirmed.
    ///
    /// This is intended to run early at boot; it never fails.
    Revert(DiskOpts),
    /// Mark the running upgrade as good.
    Confirm(DiskOpts),
    /// Inspect and modify the tag store.
    Tags {
        #[clap(flatten)]
        disk: DiskOpts,
        #[clap(subcommand)]
        cmd: TagsOpts,
    },
}

/// Resolve options and run the install pipeline. Runs on a blocking thread.
fn install_blocking(
    opts: InstallOpts,
    mode: Mode,
    config: Option<InstallConfiguration>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mode = match (mode, opts.image_mode) {
        (Mode::Upgrade, true) => anyhow::bail!("--image-mode cannot be used for upgrades"),
        (Mode::Install, true) => Mode::Image,
        (m, _) => m,
    };
    let assets_root = install::assets_root();
    let mut state = opts.into_state(mode, config, assets_root)?;

    // Disk images are installed through a loopback device
    let loopback = if mode.is_image() && std::fs::metadata(&state.disk)?.is_file() {
        let dev = LoopbackDevice::new(state.disk.as_std_path())?;
        tracing::debug!("attached {} to {}", state.disk, dev.path());
        state.disk = dev.path().to_owned();
        Some(dev)
    } else {
        None
    };

    let disk = SystemDisk::new(Some(&state.disk));
    let hooks = SystemHooks::new(assets_root)?;
    install::run(&state, &disk, &hooks, cancel)?;
    if let Some(dev) = loopback {
        dev.close()?;
    }
    Ok(())
}

async fn run_install(opts: InstallOpts, mode: Mode) -> Result<()> {
    let config = install::config::load_config()?;
    let cancel = CancellationToken::new();
    let mut task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || install_blocking(opts, mode, config, &cancel)
    });
    tokio::select! {
        r = &mut task => r?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; stopping before the next install stage");
            cancel.cancel();
            task.await?
        }
    }
}

fn require_tag_store(disk: &dyn DiskAccess) -> Result<crate::tagstore::TagStore> {
    disk.open_tag_store()?
        .context("No META partition found")
}

fn run_tags(disk: &dyn DiskAccess, cmd: TagsOpts) -> Result<()> {
    let mut store = require_tag_store(disk)?;
    match cmd {
        TagsOpts::Read { key } => {
            let value = store
                .read_tag(&key)
                .with_context(|| format!("Tag {key} is not set"))?;
            println!("{value}");
        }
        TagsOpts::Write { key, value } => {
            store.set_tag(&key, &value)?;
            store.flush()?;
        }
        TagsOpts::Delete { key } => {
            if !store.delete_tag(&key) {
                anyhow::bail!("Tag {key} is not set");
            }
            store.flush()?;
        }
        TagsOpts::List => {
            for (k, v) in store.tags() {
                println!("{k}={v}");
            }
        }
    }
    Ok(())
}

fn run_confirm(disk: &dyn DiskAccess) -> Result<()> {
    let mut store = require_tag_store(disk)?;
    if store.clear_upgrade_confirmation()? {
        println!("upgrade confirmed");
    } else {
        println!("no upgrade pending confirmation");
    }
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Install(opts) => run_install(opts, Mode::Install).await,
        Opt::Upgrade(opts) => run_install(opts, Mode::Upgrade).await,
        Opt::Revert(opts) => {
            let outcome = revert_bootloader(&SystemDisk::new(opts.disk.as_deref()));
            if let RevertOutcome::Reverted(label) = outcome {
                println!("reverted to boot slot {label}");
            }
            Ok(())
        }
        Opt::Confirm(opts) => run_confirm(&SystemDisk::new(opts.disk.as_deref())),
        Opt::Tags { disk, cmd } => run_tags(&SystemDisk::new(disk.disk.as_deref()), cmd),
    }
}
