//! Checks that must pass before an upgrade touches the disk.

use std::os::unix::fs::FileTypeExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::bootloader::BootAssets;
use crate::disk::DiskAccess;

/// The checks run before an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreflightCheck {
    /// The target disk exists.
    TargetDevice,
    /// The kernel and initramfs to install are readable.
    BootAssets,
    /// There is a tag store to record the upgrade in.
    TagStore,
}

/// What the checks look at.
#[derive(Debug)]
pub(crate) struct PreflightContext<'a> {
    pub(crate) disk: &'a Utf8Path,
    pub(crate) assets: &'a BootAssets,
    pub(crate) disk_access: &'a dyn DiskAccess,
}

impl PreflightCheck {
    pub(crate) const ALL: &[Self] = &[Self::TargetDevice, Self::BootAssets, Self::TagStore];

    fn name(&self) -> &'static str {
        match self {
            Self::TargetDevice => "target device",
            Self::BootAssets => "boot assets",
            Self::TagStore => "tag store",
        }
    }

    fn run(&self, ctx: &PreflightContext) -> Result<()> {
        match self {
            Self::TargetDevice => {
                let meta = std::fs::metadata(ctx.disk)
                    .with_context(|| format!("Target disk {}", ctx.disk))?;
                let ft = meta.file_type();
                if !(ft.is_block_device() || ft.is_file()) {
                    anyhow::bail!("{} is not a block device", ctx.disk);
                }
            }
            Self::BootAssets => {
                for p in [&ctx.assets.kernel, &ctx.assets.initramfs]
                    .into_iter()
                    .chain(ctx.assets.dtb.as_ref())
                {
                    std::fs::File::open(p).with_context(|| format!("Opening {p}"))?;
                }
            }
            Self::TagStore => {
                ctx.disk_access
                    .open_tag_store()?
                    .context("No META partition to record the upgrade in")?;
            }
        }
        Ok(())
    }
}

/// Run `checks` in order, stopping at the first failure or when `cancel`
/// fires. Cancellation is observed between checks.
fn run_with(
    checks: &[PreflightCheck],
    cancel: &CancellationToken,
    mut f: impl FnMut(PreflightCheck) -> Result<()>,
) -> Result<()> {
    for check in checks {
        if cancel.is_cancelled() {
            anyhow::bail!("Preflight checks cancelled");
        }
        tracing::debug!("running preflight check: {}", check.name());
        f(*check).with_context(|| format!("Preflight check failed: {}", check.name()))?;
    }
    Ok(())
}

#[context("Running preflight checks")]
pub(crate) fn run_checks(ctx: &PreflightContext, cancel: &CancellationToken) -> Result<()> {
    run_with(PreflightCheck::ALL, cancel, |check| check.run(ctx))?;
    println!("preflight checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::test_util::Fixture;
    use crate::disk::test_util::ScratchDisk;

    #[test]
    fn test_checks() -> Result<()> {
        let fixture = Fixture::new(false)?;
        let disk = ScratchDisk::new()?;
        let meta = disk.meta.clone().unwrap();
        let ctx = PreflightContext {
            disk: &meta,
            assets: &fixture.assets,
            disk_access: &disk,
        };
        run_checks(&ctx, &CancellationToken::new())?;

        let e = run_checks(
            &PreflightContext {
                disk: Utf8Path::new("/dev/nonexistent-disk"),
                ..ctx
            },
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("target device"));

        let no_store = ScratchDisk::new()?.without_tag_store();
        let e = run_checks(
            &PreflightContext {
                disk_access: &no_store,
                ..ctx
            },
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("META"));
        Ok(())
    }

    #[test]
    fn test_missing_assets() -> Result<()> {
        let mut fixture = Fixture::new(false)?;
        fixture.assets.initramfs = "/nonexistent/initramfs.xz".into();
        let disk = ScratchDisk::new()?;
        let meta = disk.meta.clone().unwrap();
        let ctx = PreflightContext {
            disk: &meta,
            assets: &fixture.assets,
            disk_access: &disk,
        };
        let e = run_checks(&ctx, &CancellationToken::new()).unwrap_err();
        assert!(format!("{e:#}").contains("boot assets"));
        Ok(())
    }

    #[test]
    fn test_cancel() {
        let cancel = CancellationToken::new();
        let mut ran = Vec::new();
        let r = run_with(PreflightCheck::ALL, &cancel, |check| {
            ran.push(check);
            cancel.cancel();
            Ok(())
        });
        assert!(format!("{:#}", r.unwrap_err()).contains("cancelled"));
        assert_eq!(ran, [PreflightCheck::TargetDevice]);

        let mut ran = 0;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(run_with(PreflightCheck::ALL, &cancel, |_| {
            ran += 1;
            Ok(())
        })
        .is_err());
        assert_eq!(ran, 0);
    }
}
