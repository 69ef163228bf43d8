//! Boot-time recovery from an upgrade that never confirmed success.
//!
//! An upgrade records the slot it replaced in the `upgrade-fallback` tag. A
//! healthy boot clears the tag (see `bootslot confirm`); if it is still set
//! when the revert agent runs, the boot after the upgrade did not make it
//! and the recorded slot becomes the default again.

use anyhow::Result;
use bootslot_utils::ResultExt;

use crate::bootloader::{self, BootLabel};
use crate::disk::DiskAccess;
use crate::tagstore::{TagStore, UPGRADE_TAG};

/// What [`revert_bootloader`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevertOutcome {
    /// There is no tag store on this machine.
    NoTagStore,
    /// No upgrade is waiting for confirmation.
    NotPending,
    /// The pending upgrade had no previous slot; the tag was cleared.
    ClearedEmpty,
    /// No boot partition or no bootloader config; nothing was changed.
    NoBootloader,
    /// The recorded slot is already the default; the tag was cleared.
    AlreadyActive(BootLabel),
    /// The recorded slot was made the default and the tag cleared.
    Reverted(BootLabel),
    /// Something went wrong; the error has been logged.
    Failed,
}

fn clear_tag(store: &mut TagStore) -> Result<()> {
    store.delete_tag(UPGRADE_TAG);
    store.flush()
}

fn impl_revert(disk: &dyn DiskAccess) -> Result<RevertOutcome> {
    let Some(mut store) = disk.open_tag_store()? else {
        return Ok(RevertOutcome::NoTagStore);
    };
    let Some(value) = store.read_tag(UPGRADE_TAG).map(ToOwned::to_owned) else {
        return Ok(RevertOutcome::NotPending);
    };
    if value.is_empty() {
        tracing::debug!("pending upgrade has no previous slot");
        clear_tag(&mut store)?;
        return Ok(RevertOutcome::ClearedEmpty);
    }
    let label: BootLabel = value.parse()?;

    if !disk.boot_formatted()? {
        tracing::warn!("no formatted boot partition; cannot revert to slot {label}");
        return Ok(RevertOutcome::NoBootloader);
    }
    let Some(boot) = disk.mount_boot(false)? else {
        tracing::warn!("no boot partition; cannot revert to slot {label}");
        return Ok(RevertOutcome::NoBootloader);
    };
    let Some(mut bl) = bootloader::probe(boot.dir())? else {
        tracing::warn!("no bootloader configuration; cannot revert to slot {label}");
        return Ok(RevertOutcome::NoBootloader);
    };
    if bl.default_label() == label {
        clear_tag(&mut store)?;
        return Ok(RevertOutcome::AlreadyActive(label));
    }

    println!("reverting default boot slot to {label}");
    bl.activate(boot.dir(), label)?;
    drop(boot);
    clear_tag(&mut store)?;
    Ok(RevertOutcome::Reverted(label))
}

/// Undo an unconfirmed upgrade. Never fails: errors are logged and reported
/// as [`RevertOutcome::Failed`].
pub(crate) fn revert_bootloader(disk: &dyn DiskAccess) -> RevertOutcome {
    let r = impl_revert(disk)
        .log_err("Reverting bootloader")
        .unwrap_or(RevertOutcome::Failed);
    tracing::debug!("revert outcome: {r:?}");
    r
}
