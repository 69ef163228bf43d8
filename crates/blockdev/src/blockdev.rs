//! Helpers for inspecting block devices via `lsblk`, and for attaching
//! disk image files as loopback devices.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

use bootslot_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk --json`.
#[derive(Debug, Deserialize, Clone)]
pub struct Device {
    /// Kernel name, e.g. `vda2`
    pub name: String,
    /// Device type, e.g. `disk`, `part`, `loop`
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    /// GPT partition name
    pub partlabel: Option<String>,
    /// Partition type GUID
    pub parttype: Option<String>,
    /// Child devices (partitions, holders)
    pub children: Option<Vec<Device>>,
    /// Size in bytes
    pub size: u64,
    /// Kernel name of the parent device
    pub pkname: Option<String>,

    // Filesystem-related properties
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem type
    pub fstype: Option<String>,
    /// Full device path; older util-linux lacks this.
    pub path: Option<String>,
    /// Current mount point, if any
    pub mountpoint: Option<String>,
}

impl Device {
    /// The path to the device node.
    // RHEL8's lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", &self.name))
            .into()
    }

    /// True if either the GPT partition name or the filesystem label matches.
    pub fn is_labeled(&self, label: &str) -> bool {
        self.partlabel.as_deref() == Some(label) || self.label.as_deref() == Some(label)
    }

    /// Find a direct child partition carrying the given label.
    pub fn find_partition_labeled(&self, label: &str) -> Option<&Device> {
        self.children
            .iter()
            .flatten()
            .find(|child| child.is_labeled(label))
    }
}

/// Query a single device (and its children).
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Query every block device on the system.
#[context("Listing block devices")]
pub fn list() -> Result<Vec<Device>> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .log_debug()
        .run_and_parse_json()?;
    Ok(devs.blockdevices)
}

fn find_labeled_in(devices: Vec<Device>, label: &str) -> Option<Device> {
    devices.into_iter().find_map(|dev| {
        if let Some(part) = dev.find_partition_labeled(label) {
            return Some(part.clone());
        }
        dev.is_labeled(label).then_some(dev)
    })
}

/// Locate a partition by its label.
///
/// If `disk` is provided only that disk is searched, otherwise all block
/// devices are. Returns `None` if no such partition exists.
#[context("Finding partition labeled {label}")]
pub fn find_partition_by_label(label: &str, disk: Option<&Utf8Path>) -> Result<Option<Device>> {
    let devices = match disk {
        Some(disk) => vec![list_dev(disk)?],
        None => list()?,
    };
    let r = find_labeled_in(devices, label);
    if let Some(dev) = r.as_ref() {
        tracing::debug!("Found {label} at {}", dev.path());
    }
    Ok(r)
}

/// Parse key-value pairs from lsblk --pairs.
/// Newer versions of lsblk support JSON but the one in CentOS 7 doesn't.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r#"([A-Z-_]+)="([^"]+)""#).unwrap());
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in regex.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

fn parse_parent_devices(device: &str, output: &str) -> Result<Vec<String>> {
    let mut parents = Vec::new();
    // skip first line, which is the device itself
    for line in output.lines().skip(1) {
        let dev = split_lsblk_line(line);
        let name = dev
            .get("NAME")
            .with_context(|| format!("device in hierarchy of {device} missing NAME"))?;
        let kind = dev
            .get("TYPE")
            .with_context(|| format!("device in hierarchy of {device} missing TYPE"))?;
        if kind == "disk" || kind == "loop" {
            parents.push(name.clone());
        } else if kind == "mpath" {
            parents.push(name.clone());
            // we don't need to know what disks back the multipath
            break;
        }
    }
    Ok(parents)
}

/// This will return every block device in the parent hierarchy of `device`
/// capable of containing other partitions. So e.g. parent devices of type
/// "part" doesn't match, but "disk" and "mpath" does.
#[context("Finding parent devices of {device}")]
pub fn find_parent_devices(device: &str) -> Result<Vec<String>> {
    let output = Command::new("lsblk")
        // Older lsblk, e.g. in CentOS 7.6, doesn't support PATH, but --paths option
        .arg("--pairs")
        .arg("--paths")
        .arg("--inverse")
        .arg("--output")
        .arg("NAME,TYPE")
        .arg(device)
        .run_get_string()?;
    parse_parent_devices(device, &output)
}

/// Find the whole-disk device holding the partition with the given label.
#[context("Finding disk holding {label}")]
pub fn find_disk_for_label(label: &str) -> Result<Option<Utf8PathBuf>> {
    let Some(part) = find_partition_by_label(label, None)? else {
        return Ok(None);
    };
    let parents = find_parent_devices(part.path().as_str())?;
    Ok(parents.into_iter().next().map(Utf8PathBuf::from))
}

/// A disk image file attached as a partitioned loopback device.
#[derive(Debug)]
pub struct LoopbackDevice {
    /// The allocated device node; taken when the device is released.
    pub dev: Option<Utf8PathBuf>,
}

impl LoopbackDevice {
    /// Create a new loopback block device targeting the provided file path.
    pub fn new(path: &Path) -> Result<Self> {
        let dev = Command::new("losetup")
            .args(["--show", "-P", "--find"])
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev}");
        Ok(Self { dev: Some(dev) })
    }

    /// Access the path to the loopback block device.
    pub fn path(&self) -> &Utf8Path {
        // SAFETY: The option cannot be destructured until we are dropped
        self.dev.as_deref().unwrap()
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };
        Command::new("losetup")
            .args(["-d", dev.as_str()])
            .run_capture_stderr()
    }

    /// Consume this device, detaching it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        // Best effort to detach if we're dropped without invoking `close`
        let _ = self.impl_close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LSBLK_FIXTURE: &str = indoc::indoc! { r#"
    {
       "blockdevices": [
          {
             "name": "vda",
             "type": "disk",
             "size": 10737418240,
             "pkname": null,
             "partlabel": null,
             "parttype": null,
             "label": null,
             "fstype": null,
             "path": "/dev/vda",
             "mountpoint": null,
             "children": [
                {
                   "name": "vda1",
                   "type": "part",
                   "size": 104857600,
                   "pkname": "vda",
                   "partlabel": "EFI",
                   "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
                   "label": "EFI",
                   "fstype": "vfat",
                   "path": "/dev/vda1",
                   "mountpoint": null
                },
                {
                   "name": "vda2",
                   "type": "part",
                   "size": 1048576000,
                   "pkname": "vda",
                   "partlabel": "BOOT",
                   "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4",
                   "label": null,
                   "fstype": "ext4",
                   "path": "/dev/vda2",
                   "mountpoint": "/boot"
                },
                {
                   "name": "vda3",
                   "type": "part",
                   "size": 1048576,
                   "pkname": "vda",
                   "partlabel": "META",
                   "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4",
                   "label": null,
                   "fstype": null,
                   "path": "/dev/vda3",
                   "mountpoint": null
                }
             ]
          },
          {
             "name": "vdb",
             "type": "disk",
             "size": 1073741824,
             "label": "scratch",
             "fstype": "xfs",
             "mountpoint": null
          }
       ]
    }
    "# };

    fn fixture() -> Vec<Device> {
        let devs: DevicesOutput = serde_json::from_str(LSBLK_FIXTURE).unwrap();
        devs.blockdevices
    }

    #[test]
    fn test_parse_lsblk() {
        let devs = fixture();
        assert_eq!(devs.len(), 2);
        let vda = &devs[0];
        assert_eq!(vda.children.as_deref().unwrap().len(), 3);
        let vdb = &devs[1];
        assert!(vdb.children.is_none());
        // No PATH property, so it is synthesized
        assert_eq!(vdb.path(), "/dev/vdb");
    }

    #[test]
    fn test_find_partition_labeled() {
        let devs = fixture();
        let vda = &devs[0];
        let boot = vda.find_partition_labeled("BOOT").unwrap();
        assert_eq!(boot.path(), "/dev/vda2");
        assert_eq!(boot.mountpoint.as_deref(), Some("/boot"));
        // Filesystem labels match too
        let efi = vda.find_partition_labeled("EFI").unwrap();
        assert_eq!(efi.fstype.as_deref(), Some("vfat"));
        assert!(vda.find_partition_labeled("STATE").is_none());
    }

    #[test]
    fn test_find_labeled_in() {
        let meta = find_labeled_in(fixture(), "META").unwrap();
        assert_eq!(meta.path(), "/dev/vda3");
        assert_eq!(meta.pkname.as_deref(), Some("vda"));
        // Whole devices can carry a filesystem label too
        let scratch = find_labeled_in(fixture(), "scratch").unwrap();
        assert_eq!(scratch.name, "vdb");
        assert!(find_labeled_in(fixture(), "nope").is_none());
    }

    #[test]
    fn test_parse_parent_devices() -> Result<()> {
        let output = indoc::indoc! { r#"
            NAME="/dev/vda2" TYPE="part"
            NAME="/dev/vda" TYPE="disk"
        "# };
        let parents = parse_parent_devices("/dev/vda2", output)?;
        assert_eq!(parents, vec!["/dev/vda".to_string()]);

        let output = indoc::indoc! { r#"
            NAME="/dev/mapper/mpatha2" TYPE="part"
            NAME="/dev/mapper/mpatha" TYPE="mpath"
            NAME="/dev/sda" TYPE="disk"
            NAME="/dev/sdb" TYPE="disk"
        "# };
        let parents = parse_parent_devices("/dev/mapper/mpatha2", output)?;
        assert_eq!(parents, vec!["/dev/mapper/mpatha".to_string()]);

        let output = "NAME=\"/dev/vda2\" TYPE=\"part\"\nTYPE=\"disk\"\n";
        assert!(parse_parent_devices("/dev/vda2", output).is_err());
        Ok(())
    }
}
