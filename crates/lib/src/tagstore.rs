//! A small persisted key/value store on a dedicated raw partition.
//!
//! The backing area is split into two equal halves. Each half may hold one
//! copy of the full tag set:
//!
//! ```text
//! offset  size  field
//! 0       8     magic "BSLTAGS1"
//! 8       8     generation (u64 LE)
//! 16      4     payload length (u32 LE)
//! 20      4     reserved, zero
//! 24      32    SHA-256 of the payload
//! 56      len   payload: JSON object, keys sorted
//! ```
//!
//! A flush writes the next generation into the half that does not hold the
//! current copy and syncs it; the current copy is never overwritten in place.
//! Loading picks the valid copy with the highest generation, so a torn write
//! simply leaves the previous set in effect.
//!
//! Staged changes are visible to [`TagStore::read_tag`] immediately; they
//! only reach the disk on [`TagStore::flush`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// Tag holding the slot to revert to; present iff an upgrade has not yet
/// been confirmed.
pub(crate) const UPGRADE_TAG: &str = "upgrade-fallback";

/// Maximum length of a tag key in bytes.
pub(crate) const MAX_KEY_LEN: usize = 64;
/// Maximum length of a tag value in bytes.
pub(crate) const MAX_VALUE_LEN: usize = 1024;

const MAGIC: &[u8; 8] = b"BSLTAGS1";
const HEADER_LEN: usize = 56;
const CHECKSUM_OFFSET: usize = 24;

/// Validation failures for tag updates.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum TagError {
    #[error("Invalid tag key {0:?}: must be 1-{MAX_KEY_LEN} bytes without whitespace or '='")]
    InvalidKey(String),
    #[error("Value for tag {key:?} is {len} bytes, exceeding the limit of {MAX_VALUE_LEN}")]
    ValueTooLarge { key: String, len: usize },
    #[error("Tag set of {needed} bytes does not fit the store capacity of {capacity} bytes")]
    StoreFull { needed: usize, capacity: usize },
}

fn validate_key(key: &str) -> Result<(), TagError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.chars().any(|c| c.is_whitespace() || c.is_control() || c == '=');
    if valid {
        Ok(())
    } else {
        Err(TagError::InvalidKey(key.to_owned()))
    }
}

/// A decoded copy.
#[derive(Debug)]
struct TagCopy {
    generation: u64,
    tags: BTreeMap<String, String>,
}

fn encode_copy(generation: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).context("Tag payload too large")?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&generation.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&openssl::sha::sha256(payload));
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one half; `None` for anything that is not a complete valid copy.
fn decode_copy(half: &[u8]) -> Option<TagCopy> {
    let header = half.get(..HEADER_LEN)?;
    if &header[..8] != MAGIC {
        return None;
    }
    let generation = u64::from_le_bytes(header[8..16].try_into().ok()?);
    let len = u32::from_le_bytes(header[16..20].try_into().ok()?) as usize;
    let checksum = &header[CHECKSUM_OFFSET..HEADER_LEN];
    let payload = half.get(HEADER_LEN..HEADER_LEN.checked_add(len)?)?;
    if openssl::sha::sha256(payload) != checksum {
        tracing::debug!("tag copy generation {generation} has a bad checksum");
        return None;
    }
    match serde_json::from_slice(payload) {
        Ok(tags) => Some(TagCopy { generation, tags }),
        Err(e) => {
            tracing::debug!("tag copy generation {generation} is not valid JSON: {e}");
            None
        }
    }
}

/// An open tag store, held exclusively until dropped.
#[derive(Debug)]
pub(crate) struct TagStore {
    file: File,
    path: Utf8PathBuf,
    half_len: u64,
    /// Half holding the current on-disk copy, if any.
    active: Option<u64>,
    generation: u64,
    tags: BTreeMap<String, String>,
    dirty: bool,
}

impl TagStore {
    /// Open the store backed by `path` (a partition or a regular file).
    #[context("Opening tag store {path}")]
    pub(crate) fn open(path: &Utf8Path) -> Result<Self> {
        let is_blockdev = std::fs::metadata(path)?.file_type().is_block_device();
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if is_blockdev {
            // Refuse to share the partition with a mounted filesystem
            opts.custom_flags(libc::O_EXCL);
        }
        let mut file = opts.open(path)?;
        rustix::fs::flock(&file, rustix::fs::FlockOperation::NonBlockingLockExclusive)
            .context("Tag store is in use")?;
        // Block devices report a zero length in their metadata
        let size = file.seek(SeekFrom::End(0))?;
        let half_len = size / 2;
        if half_len <= HEADER_LEN as u64 + 2 {
            anyhow::bail!("Backing area of {size} bytes is too small");
        }

        let mut halves = [None, None];
        let mut written = false;
        for (i, slot) in halves.iter_mut().enumerate() {
            let mut buf = vec![0u8; usize::try_from(half_len)?];
            file.read_exact_at(&mut buf, i as u64 * half_len)?;
            written |= buf.starts_with(MAGIC);
            *slot = decode_copy(&buf);
        }
        let current = halves
            .into_iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|c| (i as u64, c)))
            .max_by_key(|(_, c)| c.generation);

        let (active, generation, tags) = match current {
            Some((i, c)) => {
                tracing::debug!("loaded tag copy generation {} from half {i}", c.generation);
                (Some(i), c.generation, c.tags)
            }
            None if written => {
                anyhow::bail!("Tag store is corrupt: no copy passes validation")
            }
            None => {
                tracing::debug!("tag store was never written; starting empty");
                (None, 0, BTreeMap::new())
            }
        };
        Ok(Self {
            file,
            path: path.to_owned(),
            half_len,
            active,
            generation,
            tags,
            dirty: false,
        })
    }

    fn capacity(&self) -> usize {
        (self.half_len as usize).saturating_sub(HEADER_LEN)
    }

    fn encoded_len(tags: &BTreeMap<String, String>) -> Result<usize> {
        Ok(serde_json::to_vec(tags)?.len())
    }

    /// Read a tag, including staged changes.
    pub(crate) fn read_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Stage setting `key` to `value`.
    pub(crate) fn set_tag(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(TagError::ValueTooLarge {
                key: key.to_owned(),
                len: value.len(),
            }
            .into());
        }
        let mut next = self.tags.clone();
        next.insert(key.to_owned(), value.to_owned());
        let needed = Self::encoded_len(&next)?;
        let capacity = self.capacity();
        if needed > capacity {
            return Err(TagError::StoreFull { needed, capacity }.into());
        }
        self.tags = next;
        self.dirty = true;
        Ok(())
    }

    /// Stage removal of `key`, returning whether it was present.
    pub(crate) fn delete_tag(&mut self, key: &str) -> bool {
        let existed = self.tags.remove(key).is_some();
        self.dirty |= existed;
        existed
    }

    /// Iterate all tags, including staged changes.
    pub(crate) fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Persist staged changes.
    #[context("Flushing tag store")]
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let payload = serde_json::to_vec(&self.tags)?;
        let generation = self.generation + 1;
        let target = match self.active {
            Some(i) => 1 - i,
            None => 0,
        };
        let buf = encode_copy(generation, &payload)?;
        self.file
            .write_all_at(&buf, target * self.half_len)
            .with_context(|| format!("Writing {}", self.path))?;
        self.file.sync_all()?;
        tracing::debug!(
            "wrote tag copy generation {generation} to half {target} (sha256 {})",
            hex::encode(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8])
        );
        self.active = Some(target);
        self.generation = generation;
        self.dirty = false;
        Ok(())
    }

    /// Mark the last upgrade as good: delete the upgrade tag and flush.
    ///
    /// Returns whether an unconfirmed upgrade was pending.
    pub(crate) fn clear_upgrade_confirmation(&mut self) -> Result<bool> {
        let pending = self.delete_tag(UPGRADE_TAG);
        self.flush()?;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store(dir: &tempfile::TempDir, size: u64) -> Result<Utf8PathBuf> {
        let path = Utf8Path::from_path(dir.path()).unwrap().join("meta.img");
        let f = File::create(&path)?;
        f.set_len(size)?;
        Ok(path)
    }

    #[test]
    fn test_fresh_store_is_empty() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 64 * 1024)?;
        let store = TagStore::open(&path)?;
        assert_eq!(store.tags().count(), 0);
        assert_eq!(store.read_tag(UPGRADE_TAG), None);
        Ok(())
    }

    #[test]
    fn test_coherent_reads_and_reopen() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 64 * 1024)?;
        {
            let mut store = TagStore::open(&path)?;
            store.set_tag(UPGRADE_TAG, "A")?;
            store.set_tag("owner", "ops team")?;
            // Visible before flush
            assert_eq!(store.read_tag(UPGRADE_TAG), Some("A"));
            assert!(store.delete_tag("owner"));
            assert!(!store.delete_tag("owner"));
            store.flush()?;
        }
        let mut store = TagStore::open(&path)?;
        assert_eq!(store.read_tag(UPGRADE_TAG), Some("A"));
        assert_eq!(store.read_tag("owner"), None);

        // Unflushed changes are lost
        store.set_tag("pending", "1")?;
        drop(store);
        let store = TagStore::open(&path)?;
        assert_eq!(store.read_tag("pending"), None);
        Ok(())
    }

    #[test]
    fn test_copies_alternate() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 8 * 1024)?;
        let mut store = TagStore::open(&path)?;
        for i in 0..5u64 {
            store.set_tag("counter", &i.to_string())?;
            store.flush()?;
            assert_eq!(store.active, Some(i % 2));
            assert_eq!(store.generation, i + 1);
        }
        drop(store);
        let store = TagStore::open(&path)?;
        assert_eq!(store.generation, 5);
        assert_eq!(store.read_tag("counter"), Some("4"));
        Ok(())
    }

    #[test]
    fn test_torn_write_keeps_previous_set() -> Result<()> {
        let td = tempfile::tempdir()?;
        let size = 8 * 1024u64;
        let path = scratch_store(&td, size)?;
        {
            let mut store = TagStore::open(&path)?;
            store.set_tag("k", "first")?;
            store.flush()?;
            store.set_tag("k", "second")?;
            store.flush()?;
            assert_eq!(store.active, Some(1));
        }
        // Corrupt the payload of the newest copy, as a torn write would
        let f = OpenOptions::new().write(true).open(&path)?;
        f.write_all_at(b"garbage", size / 2 + HEADER_LEN as u64)?;
        drop(f);

        let mut store = TagStore::open(&path)?;
        assert_eq!(store.read_tag("k"), Some("first"));
        // The next flush must not overwrite the surviving copy
        store.set_tag("k", "third")?;
        store.flush()?;
        assert_eq!(store.active, Some(1));
        drop(store);
        let store = TagStore::open(&path)?;
        assert_eq!(store.read_tag("k"), Some("third"));
        Ok(())
    }

    #[test]
    fn test_corrupt_store_is_error() -> Result<()> {
        let td = tempfile::tempdir()?;
        let size = 8 * 1024u64;
        let path = scratch_store(&td, size)?;
        {
            let mut store = TagStore::open(&path)?;
            store.set_tag(UPGRADE_TAG, "A")?;
            store.flush()?;
            store.set_tag("owner", "ops")?;
            store.flush()?;
        }
        let f = OpenOptions::new().write(true).open(&path)?;
        for half in [0, size / 2] {
            f.write_all_at(b"X", half + HEADER_LEN as u64 + 2)?;
        }
        drop(f);
        let e = TagStore::open(&path).unwrap_err();
        assert!(format!("{e:#}").contains("corrupt"));
        // Nothing was rewritten by the failed open
        let contents = std::fs::read(&path)?;
        assert_eq!(&contents[..MAGIC.len()], MAGIC);
        Ok(())
    }

    #[test]
    fn test_validation() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 1024)?;
        let mut store = TagStore::open(&path)?;
        let long = "k".repeat(MAX_KEY_LEN + 1);
        for key in ["", "has space", "a=b", long.as_str()] {
            let e = store.set_tag(key, "v").unwrap_err();
            assert_eq!(
                e.downcast_ref::<TagError>(),
                Some(&TagError::InvalidKey(key.to_owned()))
            );
        }
        store.set_tag(&"k".repeat(MAX_KEY_LEN), "v")?;

        let e = store
            .set_tag("big", &"v".repeat(MAX_VALUE_LEN + 1))
            .unwrap_err();
        assert!(matches!(
            e.downcast_ref::<TagError>(),
            Some(TagError::ValueTooLarge { .. })
        ));

        // 512 bytes per half leaves room for only a small payload
        let e = store.set_tag("large", &"v".repeat(MAX_VALUE_LEN)).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<TagError>(),
            Some(TagError::StoreFull { .. })
        ));
        assert_eq!(store.read_tag("large"), None);
        Ok(())
    }

    #[test]
    fn test_exclusive() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 4096)?;
        let store = TagStore::open(&path)?;
        assert!(TagStore::open(&path).is_err());
        drop(store);
        TagStore::open(&path)?;
        Ok(())
    }

    #[test]
    fn test_clear_upgrade_confirmation() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 4096)?;
        let mut store = TagStore::open(&path)?;
        store.set_tag(UPGRADE_TAG, "B")?;
        store.set_tag("site", "lab")?;
        store.flush()?;
        assert!(store.clear_upgrade_confirmation()?);
        assert!(!store.clear_upgrade_confirmation()?);
        drop(store);
        let store = TagStore::open(&path)?;
        assert_eq!(store.read_tag(UPGRADE_TAG), None);
        assert_eq!(store.read_tag("site"), Some("lab"));
        Ok(())
    }

    #[test]
    fn test_too_small() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = scratch_store(&td, 100)?;
        assert!(TagStore::open(&path).is_err());
        Ok(())
    }
}
