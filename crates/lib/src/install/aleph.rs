use anyhow::{Context as _, Result};
use canon_json::CanonJsonSerialize as _;
use cap_std_ext::{cap_std::fs::Dir, dirext::CapStdExtDirExt as _};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use super::Mode;
use crate::bootloader::{BootLabel, Bootloader};

/// Path to the record of the last install, relative to the boot partition.
pub(crate) const BOOTSLOT_ALEPH_PATH: &str = ".bootslot-aleph.json";

/// The "aleph" records what the last install or upgrade put on the boot
/// partition and which kernel did it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct InstallAleph {
    /// The installed version
    pub(crate) version: String,
    pub(crate) mode: Mode,
    pub(crate) bootloader: String,
    /// The slot that will boot next
    pub(crate) slot: BootLabel,
    /// The slot that was replaced, if any
    pub(crate) previous_slot: Option<BootLabel>,
    /// The timestamp
    pub(crate) timestamp: chrono::DateTime<chrono::Utc>,
    /// The `uname -r` of the kernel doing the installation
    pub(crate) kernel: String,
}

impl InstallAleph {
    #[context("Creating aleph data")]
    pub(crate) fn new(version: &str, mode: Mode, bootloader: &dyn Bootloader) -> Result<Self> {
        let uname = rustix::system::uname();
        let r = InstallAleph {
            version: version.to_owned(),
            mode,
            bootloader: bootloader.kind().as_str().to_owned(),
            slot: bootloader.default_label(),
            previous_slot: bootloader.previous_label(),
            timestamp: chrono::Utc::now(),
            kernel: uname.release().to_str()?.to_string(),
        };
        Ok(r)
    }

    /// Serialize to a file in the boot partition.
    pub(crate) fn write_to(&self, root: &Dir) -> Result<()> {
        root.atomic_replace_with(BOOTSLOT_ALEPH_PATH, |f| {
            anyhow::Ok(self.to_canon_json_writer(f)?)
        })
        .context("Writing aleph version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::test_util::boot_dir;
    use crate::bootloader::FALLBACK_STRATEGY;

    #[test]
    fn test_write() -> Result<()> {
        let td = boot_dir()?;
        let bl = FALLBACK_STRATEGY.fresh();
        let aleph = InstallAleph::new("v1.2.3", Mode::Image, bl.as_ref())?;
        assert_eq!(aleph.slot, BootLabel::A);
        assert_eq!(aleph.previous_slot, None);
        aleph.write_to(&td)?;

        let contents = td.read_to_string(BOOTSLOT_ALEPH_PATH)?;
        assert!(contents.contains(r#""bootloader":"extlinux""#));
        assert!(contents.contains(r#""mode":"image""#));
        assert!(contents.contains(r#""previous-slot":null"#));
        let parsed: InstallAleph = serde_json::from_str(&contents)?;
        assert_eq!(parsed, aleph);
        Ok(())
    }
}
