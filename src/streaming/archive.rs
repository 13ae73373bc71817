//! Region archive container: named byte blobs in one file
//!
//! The container is an rkyv-serialized list of `(name, bytes)` entries sorted
//! by name, so the same entries always produce the same file. Replacing an
//! archive writes a sibling `.tmp` file and renames it over the original; the
//! original is copied to `.bak` first and restored if the replace fails.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::{Error, Result};

/// Current container version
pub const ARCHIVE_VERSION: u32 = 1;

/// Reserved entry holding the region's object-id counter (u64 LE)
pub const OBJECT_ID_ENTRY: &str = "__object_ids";

#[derive(Archive, Deserialize, Serialize)]
struct ArchiveEntry {
    name: String,
    bytes: Vec<u8>,
}

#[derive(Archive, Deserialize, Serialize)]
struct ArchiveData {
    version: u32,
    entries: Vec<ArchiveEntry>,
}

/// In-memory view of one region archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl RegionArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an archive file. A missing file is `Ok(None)`.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::from_bytes(&bytes).map(Some)
    }

    /// Decode a serialized container
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // rkyv validates alignment; file buffers carry no guarantee
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let data = rkyv::from_bytes::<ArchiveData, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Archive(e.to_string()))?;
        if data.version > ARCHIVE_VERSION {
            return Err(Error::Archive(format!(
                "unsupported archive version {}",
                data.version
            )));
        }

        let entries = data
            .entries
            .into_iter()
            .map(|entry| (entry.name, entry.bytes))
            .collect();
        Ok(Self { entries })
    }

    /// Serialize the container
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = ArchiveData {
            version: ARCHIVE_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(name, bytes)| ArchiveEntry {
                    name: name.clone(),
                    bytes: bytes.clone(),
                })
                .collect(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
            .map_err(|e| Error::Archive(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(name.into(), bytes)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate entries in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored object-id counter, if present and well formed
    pub fn object_id_counter(&self) -> Option<u64> {
        let bytes = self.get(OBJECT_ID_ENTRY)?;
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(raw))
    }

    pub fn set_object_id_counter(&mut self, next_id: u64) {
        self.insert(OBJECT_ID_ENTRY, next_id.to_le_bytes().to_vec());
    }

    /// Atomically replace the archive at `path` with this container.
    ///
    /// Readers see either the old file or the new one, never a partial write.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = sibling(path, "tmp");
        let backup_path = sibling(path, "bak");
        let had_original = path.exists();
        if had_original {
            fs::copy(path, &backup_path)?;
        }

        let result = write_and_sync(&tmp_path, &bytes).and_then(|()| fs::rename(&tmp_path, path));

        match result {
            Ok(()) => {
                if had_original {
                    let _ = fs::remove_file(&backup_path);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to replace archive {}: {}", path.display(), e);
                let _ = fs::remove_file(&tmp_path);
                if had_original {
                    if let Err(restore) = fs::rename(&backup_path, path) {
                        log::error!(
                            "Failed to restore {} from backup: {}",
                            path.display(),
                            restore
                        );
                    }
                }
                Err(e.into())
            }
        }
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
