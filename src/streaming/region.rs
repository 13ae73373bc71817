//! Regions: persistent groups of chunks backed by one archive file
//!
//! A region owns every chunk of its X/Z square that is resident in memory
//! (`loaded`), whether or not the chunk is currently active. The resident list
//! is shared with background load jobs, so it sits behind a mutex; archive
//! reads and writes are serialized by a second lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::Result;
use crate::streaming::archive::RegionArchive;
use crate::streaming::chunk::{SharedChunk, read_chunk, write_chunk};
use crate::streaming::codec::{compress_chunk, decompress_chunk};
use crate::streaming::coord::{ChunkCoord, RegionCoord};

/// Derive a region's seed from the world seed (splitmix64 over the coordinate)
pub fn derive_seed(world_seed: u64, coord: RegionCoord) -> u64 {
    let mut z = world_seed
        ^ (coord.x as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (coord.z as u32 as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F).rotate_left(32);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug)]
struct ObjectIds {
    next: u64,
    synced: bool,
}

/// A bounded square of chunks and its archive
pub struct Region {
    coord: RegionCoord,
    region_chunks: u32,
    seed: u64,
    dir: Option<PathBuf>,
    loaded: Mutex<Vec<(ChunkCoord, SharedChunk)>>,
    object_ids: Mutex<ObjectIds>,
    io: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Region {
    /// Create a region. `dir` is where its archive lives; `None` keeps it in memory.
    pub fn new(coord: RegionCoord, region_chunks: u32, seed: u64, dir: Option<PathBuf>) -> Self {
        Self {
            coord,
            region_chunks,
            seed,
            dir,
            loaded: Mutex::new(Vec::new()),
            object_ids: Mutex::new(ObjectIds {
                next: 1,
                synced: false,
            }),
            io: Mutex::new(()),
        }
    }

    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn region_chunks(&self) -> u32 {
        self.region_chunks
    }

    /// Whether `coord` lies in this region's X/Z square
    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.coord.contains(coord, self.region_chunks)
    }

    /// Path of this region's archive inside `dir`
    pub fn archive_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.coord.file_name())
    }

    fn own_archive_path(&self) -> Option<PathBuf> {
        self.dir.as_deref().map(|dir| self.archive_path(dir))
    }

    /// Resident chunk at `coord`, if any
    pub fn get_chunk(&self, coord: ChunkCoord) -> Option<SharedChunk> {
        lock(&self.loaded)
            .iter()
            .find(|(c, _)| *c == coord)
            .map(|(_, chunk)| Arc::clone(chunk))
    }

    /// Number of resident chunks
    pub fn loaded_len(&self) -> usize {
        lock(&self.loaded).len()
    }

    /// Coordinates of every resident chunk
    pub fn loaded_coords(&self) -> Vec<ChunkCoord> {
        lock(&self.loaded).iter().map(|(c, _)| *c).collect()
    }

    /// Make a chunk resident without touching the archive (freshly generated chunks).
    ///
    /// Returns the resident instance: `chunk` itself, or the chunk already
    /// resident at the same coordinate, which wins.
    pub fn adopt(&self, chunk: &SharedChunk) -> SharedChunk {
        let coord = read_chunk(chunk).coord();
        let mut loaded = lock(&self.loaded);
        if let Some((_, existing)) = loaded.iter().find(|(c, _)| *c == coord) {
            return Arc::clone(existing);
        }
        loaded.push((coord, Arc::clone(chunk)));
        Arc::clone(chunk)
    }

    /// Load one chunk from the archive. See [`Region::load_chunks`].
    pub fn load_chunk(&self, chunk: &SharedChunk) -> bool {
        self.load_chunks(std::slice::from_ref(chunk))[0]
    }

    /// Fill each chunk from its archive entry and make it resident.
    ///
    /// A chunk with no entry (or no archive, or an unreadable one) is left
    /// untouched and reported `false`: it has to be generated.
    pub fn load_chunks(&self, chunks: &[SharedChunk]) -> Vec<bool> {
        let mut results = vec![false; chunks.len()];
        let Some(path) = self.own_archive_path() else {
            return results;
        };

        let archive = {
            let _io = lock(&self.io);
            match RegionArchive::open(&path) {
                Ok(Some(archive)) => archive,
                Ok(None) => return results,
                Err(e) => {
                    log::warn!("Failed to open region archive {}: {}", path.display(), e);
                    return results;
                }
            }
        };

        for (chunk, result) in chunks.iter().zip(results.iter_mut()) {
            let coord = read_chunk(chunk).coord();
            let Some(bytes) = archive.get(&coord.name()) else {
                continue;
            };
            let decoded = match decompress_chunk(bytes) {
                Ok(decoded) if decoded.coord() == coord => decoded,
                Ok(decoded) => {
                    log::warn!(
                        "Archive entry {} in region {} holds chunk {}",
                        coord,
                        self.coord,
                        decoded.coord()
                    );
                    continue;
                }
                Err(e) => {
                    log::warn!("Failed to decode chunk {} in region {}: {}", coord, self.coord, e);
                    continue;
                }
            };

            write_chunk(chunk).replace_contents(decoded);
            self.adopt(chunk);
            *result = true;
        }

        let count = results.iter().filter(|&&r| r).count();
        log::debug!("Region {} loaded {}/{} chunks", self.coord, count, chunks.len());
        results
    }

    /// Reserve the next object id of this region.
    ///
    /// The counter is synced from the archive before the first allocation so
    /// ids stay unique across sessions.
    pub fn allocate_object_id(&self) -> u64 {
        // Read outside the counter lock; `save` takes io before object_ids
        let needs_sync = !lock(&self.object_ids).synced;
        let stored = if needs_sync { self.stored_object_counter() } else { None };

        let mut ids = lock(&self.object_ids);
        if !ids.synced {
            if let Some(stored) = stored {
                ids.next = ids.next.max(stored);
            }
            ids.synced = true;
        }
        let id = ids.next;
        ids.next += 1;
        id
    }

    fn stored_object_counter(&self) -> Option<u64> {
        let path = self.own_archive_path()?;
        let _io = lock(&self.io);
        match RegionArchive::open(&path) {
            Ok(archive) => archive?.object_id_counter(),
            Err(e) => {
                log::warn!("Failed to read object ids from {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write every resident chunk into the archive in `dir`.
    ///
    /// Entries for chunks that are not resident are carried forward from the
    /// previous archive unchanged. Returns the number of chunks written.
    pub fn save(&self, dir: &Path) -> Result<usize> {
        let path = self.archive_path(dir);
        let _io = lock(&self.io);

        let mut archive = match RegionArchive::open(&path) {
            Ok(Some(previous)) => previous,
            Ok(None) => RegionArchive::new(),
            Err(e) => {
                let aside = path.with_extension("rgn.corrupt");
                log::error!(
                    "Region archive {} is unreadable ({}); moving it to {}",
                    path.display(),
                    e,
                    aside.display()
                );
                std::fs::rename(&path, &aside)?;
                RegionArchive::new()
            }
        };

        let chunks: Vec<_> = lock(&self.loaded).clone();
        for (coord, chunk) in &chunks {
            let blob = compress_chunk(&read_chunk(chunk))?;
            archive.insert(coord.name(), blob);
        }

        {
            let mut ids = lock(&self.object_ids);
            if !ids.synced {
                if let Some(stored) = archive.object_id_counter() {
                    ids.next = ids.next.max(stored);
                }
                ids.synced = true;
            }
            archive.set_object_id_counter(ids.next);
        }

        archive.write_atomic(&path)?;
        log::info!(
            "Saved region {} ({} resident chunks, {} entries) to {}",
            self.coord,
            chunks.len(),
            archive.len(),
            path.display()
        );
        Ok(chunks.len())
    }

    /// Whether an archive for this region exists in its directory
    pub fn has_archive(&self) -> bool {
        self.own_archive_path().is_some_and(|p| p.exists())
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("coord", &self.coord)
            .field("seed", &self.seed)
            .field("loaded", &self.loaded_len())
            .finish()
    }
}
