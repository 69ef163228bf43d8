//! Access to the partitions of the boot disk.
//!
//! Both the installer and the revert agent go through [`DiskAccess`]; the
//! production implementation finds partitions by label with `lsblk` and
//! mounts them on demand.

use anyhow::{Context, Result};
use bootslot_mount::{MountGuard, MountOptions};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use fn_error_context::context;

use crate::bootloader::{self, Bootloader};
use crate::constants::{
    BOOT_FILESYSTEM, BOOT_MOUNTPOINT, BOOT_PARTITION_LABEL, EFI_FILESYSTEM,
    EFI_PARTITION_LABEL, EFI_SUBDIR, META_PARTITION_LABEL,
};
use crate::tagstore::TagStore;

/// The partitions the boot slot machinery needs.
pub(crate) trait DiskAccess: std::fmt::Debug {
    /// Open the tag store; `None` if there is no `META` partition.
    fn open_tag_store(&self) -> Result<Option<TagStore>>;

    /// Make the boot partition available; `None` if there is no `BOOT`
    /// partition. The mount lasts as long as the returned value.
    fn mount_boot(&self, readonly: bool) -> Result<Option<BootMount>>;

    /// Whether there is a boot partition carrying a filesystem to mount. A
    /// partition that was never formatted holds no config.
    fn boot_formatted(&self) -> Result<bool>;

    /// Load the bootloader config from the boot partition, if any.
    fn probe_bootloader(&self) -> Result<Option<Box<dyn Bootloader>>> {
        if !self.boot_formatted()? {
            tracing::debug!("no formatted boot partition to probe");
            return Ok(None);
        }
        let Some(boot) = self.mount_boot(true)? else {
            tracing::debug!("no boot partition to probe");
            return Ok(None);
        };
        bootloader::probe(boot.dir())
    }
}

/// A boot partition made available at [`BootMount::path`].
///
/// Fields drop in declaration order: the directory handle is closed before
/// the EFI partition is unmounted, which happens before the boot partition is.
#[derive(Debug)]
pub(crate) struct BootMount {
    dir: Dir,
    path: Utf8PathBuf,
    efi_path: Option<Utf8PathBuf>,
    _efi: Option<MountGuard>,
    _boot: Option<MountGuard>,
}

impl BootMount {
    /// Use a boot partition that something else mounted (or a plain
    /// directory); nothing is unmounted on drop.
    pub(crate) fn unmanaged(path: &Utf8Path, efi_path: Option<Utf8PathBuf>) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("Opening {path}"))?;
        Ok(Self {
            dir,
            path: path.to_owned(),
            efi_path,
            _efi: None,
            _boot: None,
        })
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn efi_path(&self) -> Option<&Utf8Path> {
        self.efi_path.as_deref()
    }
}

/// The disk of the running machine (or the one named on the command line).
#[derive(Debug)]
pub(crate) struct SystemDisk {
    /// Restrict partition lookups to this disk.
    disk: Option<Utf8PathBuf>,
    mountpoint: Utf8PathBuf,
}

impl SystemDisk {
    pub(crate) fn new(disk: Option<&Utf8Path>) -> Self {
        Self {
            disk: disk.map(ToOwned::to_owned),
            mountpoint: BOOT_MOUNTPOINT.into(),
        }
    }

    fn find(&self, label: &str) -> Result<Option<bootslot_blockdev::Device>> {
        bootslot_blockdev::find_partition_by_label(label, self.disk.as_deref())
    }

    fn partition(&self, label: &str) -> Result<Option<Utf8PathBuf>> {
        Ok(self.find(label)?.map(|p| p.path()))
    }
}

impl DiskAccess for SystemDisk {
    #[context("Opening tag store")]
    fn open_tag_store(&self) -> Result<Option<TagStore>> {
        let Some(dev) = self.partition(META_PARTITION_LABEL)? else {
            tracing::debug!("no {META_PARTITION_LABEL} partition");
            return Ok(None);
        };
        TagStore::open(&dev).map(Some)
    }

    #[context("Mounting boot partition")]
    fn mount_boot(&self, readonly: bool) -> Result<Option<BootMount>> {
        let Some(boot_dev) = self.partition(BOOT_PARTITION_LABEL)? else {
            return Ok(None);
        };
        let efi_dev = self.partition(EFI_PARTITION_LABEL)?;

        if let Some(existing) = bootslot_mount::mounted_at(&boot_dev)? {
            tracing::debug!("{boot_dev} is already mounted at {existing}");
            let efi_path = match efi_dev.as_deref() {
                Some(dev) => bootslot_mount::mounted_at(dev)?,
                None => None,
            };
            return BootMount::unmanaged(&existing, efi_path).map(Some);
        }

        let boot = MountGuard::mount(
            &boot_dev,
            &self.mountpoint,
            MountOptions {
                fstype: Some(BOOT_FILESYSTEM),
                readonly,
            },
        )?;
        // Probing only reads the boot partition itself.
        let (efi_path, efi) = match efi_dev.filter(|_| !readonly) {
            Some(dev) => {
                let target = self.mountpoint.join(EFI_SUBDIR);
                let guard = MountGuard::mount(
                    &dev,
                    &target,
                    MountOptions {
                        fstype: Some(EFI_FILESYSTEM),
                        readonly,
                    },
                )?;
                (Some(target), Some(guard))
            }
            None => (None, None),
        };
        let dir = Dir::open_ambient_dir(&self.mountpoint, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.mountpoint))?;
        Ok(Some(BootMount {
            dir,
            path: self.mountpoint.clone(),
            efi_path,
            _efi: efi,
            _boot: Some(boot),
        }))
    }

    fn boot_formatted(&self) -> Result<bool> {
        let Some(part) = self.find(BOOT_PARTITION_LABEL)? else {
            return Ok(false);
        };
        let fstype = part.fstype.as_deref();
        if fstype != Some(BOOT_FILESYSTEM) {
            tracing::debug!("{} has filesystem {fstype:?}", part.path());
            return Ok(false);
        }
        Ok(true)
    }
}
