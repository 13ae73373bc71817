//! Chunk data: a dense byte grid plus attached objects and lifecycle flags

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::{Error, Result};
use crate::streaming::codec::MAX_KIND_LEN;
use crate::streaming::coord::ChunkCoord;
use crate::streaming::external::{GeometryHandle, ShapeHandle};
use crate::streaming::objects::AttachedObject;

/// Semantic slots of the Y axis for flat (tile) chunks.
///
/// Tile chunks overload Y as a layer axis; a chunk needs at least
/// [`layer::COUNT`] layers for the object and explored slots to be used.
pub mod layer {
    /// Surface (ground) type
    pub const SURFACE: usize = 0;
    /// Overlay type drawn above the surface (roads, decals, ...)
    pub const OVERLAY: usize = 1;
    /// Bitmask of same-type neighbors, maintained by the mesher side
    pub const NEIGHBOR_MASK: usize = 2;
    /// Non-zero once the cell has been discovered
    pub const EXPLORED: usize = 3;
    /// Low byte of the attached-object address
    pub const OBJECT_LO: usize = 4;
    /// High byte of the attached-object address
    pub const OBJECT_HI: usize = 5;
    /// Number of semantic slots
    pub const COUNT: usize = 6;
}

/// Value returned for reads outside the grid or before dimensioning
pub const NO_DATA: u8 = 0;

/// A chunk shared between its region, the active set and in-flight jobs
pub type SharedChunk = Arc<RwLock<ChunkData>>;

/// Wrap a chunk for sharing
pub fn share(chunk: ChunkData) -> SharedChunk {
    Arc::new(RwLock::new(chunk))
}

/// Read-lock a shared chunk. A poisoned lock still yields the data.
pub fn read_chunk(chunk: &SharedChunk) -> RwLockReadGuard<'_, ChunkData> {
    chunk.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a shared chunk. A poisoned lock still yields the data.
pub fn write_chunk(chunk: &SharedChunk) -> RwLockWriteGuard<'_, ChunkData> {
    chunk.write().unwrap_or_else(PoisonError::into_inner)
}

/// One chunk of world data
#[derive(Debug)]
pub struct ChunkData {
    coord: ChunkCoord,
    dims: Option<[usize; 3]>,
    data: Vec<u8>,
    objects: Vec<AttachedObject>,
    /// Next object address to hand out (0 is "no object")
    next_address: u32,

    /// Participating in the live world
    pub active: bool,
    /// Kept only as a sampling neighbor; never rebuilt
    pub restricted: bool,
    /// Data came from the archive or a generator
    pub loaded: bool,
    /// No non-zero cell has been written
    pub empty: bool,
    /// Render geometry matches the data
    pub updated: bool,
    pub needs_mesh_update: bool,
    pub needs_object_update: bool,
    /// At least one cell has been discovered
    pub explored: bool,

    /// Distance from the last viewpoint, world units
    pub distance: f32,
    /// Level of detail derived from `distance`
    pub lod: u32,
    /// Installed render geometry
    pub geometry: Option<GeometryHandle>,
    /// Installed collision proxy
    pub shape: Option<ShapeHandle>,
}

impl ChunkData {
    /// Create an undimensioned, empty chunk
    pub fn new(coord: ChunkCoord) -> Self {
        Self {
            coord,
            dims: None,
            data: Vec::new(),
            objects: Vec::new(),
            next_address: 1,
            active: false,
            restricted: false,
            loaded: false,
            empty: true,
            updated: false,
            needs_mesh_update: false,
            needs_object_update: false,
            explored: false,
            distance: f32::MAX,
            lod: 0,
            geometry: None,
            shape: None,
        }
    }

    /// Create and dimension in one step
    pub fn with_dims(coord: ChunkCoord, dims: [usize; 3]) -> Result<Self> {
        let mut chunk = Self::new(coord);
        chunk.set_dimensions(dims)?;
        Ok(chunk)
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn dims(&self) -> Option<[usize; 3]> {
        self.dims
    }

    pub fn is_dimensioned(&self) -> bool {
        self.dims.is_some()
    }

    /// Set the grid extent. Allowed exactly once per chunk.
    pub fn set_dimensions(&mut self, dims: [usize; 3]) -> Result<()> {
        if let Some(existing) = self.dims {
            return Err(Error::Dimensions(format!(
                "chunk {} already dimensioned as {:?}",
                self.coord, existing
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::Dimensions(format!(
                "chunk {} given zero extent {:?}",
                self.coord, dims
            )));
        }
        self.dims = Some(dims);
        self.data = vec![NO_DATA; dims[0] * dims[1] * dims[2]];
        Ok(())
    }

    /// Raw cell bytes, x-fastest then z then y
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether Y is wide enough to carry the semantic layer slots
    pub fn has_layers(&self) -> bool {
        matches!(self.dims, Some([_, y, _]) if y >= layer::COUNT)
    }

    fn index(&self, x: i32, y: i32, z: i32) -> Option<usize> {
        let [sx, sy, sz] = self.dims?;
        if x < 0 || y < 0 || z < 0 {
            return None;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= sx || y >= sy || z >= sz {
            return None;
        }
        Some(x + z * sx + y * sx * sz)
    }

    /// Read a local cell. Out-of-bounds or undimensioned reads return [`NO_DATA`].
    pub fn get(&self, x: i32, y: i32, z: i32) -> u8 {
        match self.index(x, y, z) {
            Some(i) => self.data[i],
            None => NO_DATA,
        }
    }

    /// Write a local cell. Out-of-bounds writes are dropped.
    ///
    /// Returns true if the stored value changed. A change marks the chunk for a
    /// mesh rebuild; a non-zero write clears `empty` for good.
    pub fn set(&mut self, x: i32, y: i32, z: i32, value: u8) -> bool {
        let Some(i) = self.index(x, y, z) else {
            return false;
        };
        if self.data[i] == value {
            return false;
        }
        self.data[i] = value;
        if value != NO_DATA {
            self.empty = false;
        }
        self.mark_dirty();
        true
    }

    /// Read one semantic slot of a tile column
    pub fn get_layer(&self, x: i32, z: i32, slot: usize) -> u8 {
        self.get(x, slot as i32, z)
    }

    /// Write one semantic slot of a tile column
    pub fn set_layer(&mut self, x: i32, z: i32, slot: usize, value: u8) -> bool {
        self.set(x, slot as i32, z, value)
    }

    /// Request a mesh rebuild
    pub fn mark_dirty(&mut self) {
        self.needs_mesh_update = true;
        self.updated = false;
    }

    /// Mark a tile cell as discovered
    pub fn mark_explored(&mut self, x: i32, z: i32) {
        if self.has_layers() && self.set_layer(x, z, layer::EXPLORED, 1) {
            self.explored = true;
        }
    }

    /// Recompute `empty` from the grid, as on a full reload
    pub fn recompute_empty(&mut self) {
        self.empty = self.data.iter().all(|&b| b == NO_DATA);
    }

    /// Copy of the grid for off-thread readers
    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            coord: self.coord,
            dims: self.dims.unwrap_or([0, 0, 0]),
            data: Arc::from(self.data.as_slice()),
        }
    }

    // --- Objects ---

    pub fn objects(&self) -> &[AttachedObject] {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut [AttachedObject] {
        &mut self.objects
    }

    pub fn object(&self, id: u64) -> Option<&AttachedObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// Attach an object at tile column (x, z).
    ///
    /// The object gets the next per-chunk address; on tile chunks the address
    /// is written into the `OBJECT_LO`/`OBJECT_HI` slots of that column.
    /// Addresses are never reclaimed, so a chunk holds at most 65535 objects
    /// over its lifetime. Kind names longer than [`MAX_KIND_LEN`] bytes are
    /// rejected since they cannot be persisted.
    pub fn attach_object(&mut self, x: i32, z: i32, mut object: AttachedObject) -> Result<u16> {
        if object.kind.len() > MAX_KIND_LEN {
            return Err(Error::Codec(format!(
                "object {} kind is {} bytes, limit is {}",
                object.id,
                object.kind.len(),
                MAX_KIND_LEN
            )));
        }
        if self.next_address > u16::MAX as u32 {
            return Err(Error::AddressSpace(self.coord));
        }
        let address = self.next_address as u16;
        self.next_address += 1;
        object.address = address;
        object.visual = None;

        if self.has_layers() {
            let [lo, hi] = address.to_le_bytes();
            self.set_layer(x, z, layer::OBJECT_LO, lo);
            self.set_layer(x, z, layer::OBJECT_HI, hi);
        }

        self.objects.push(object);
        self.needs_object_update = true;
        Ok(address)
    }

    /// Remove an object by id, clearing its address cells
    pub fn detach_object(&mut self, id: u64) -> Option<AttachedObject> {
        let pos = self.objects.iter().position(|o| o.id == id)?;
        let object = self.objects.remove(pos);
        if self.has_layers() {
            let [sx, _, sz] = self.dims.unwrap_or([0, 0, 0]);
            for z in 0..sz as i32 {
                for x in 0..sx as i32 {
                    if self.object_address_at(x, z) == Some(object.address) {
                        self.set_layer(x, z, layer::OBJECT_LO, 0);
                        self.set_layer(x, z, layer::OBJECT_HI, 0);
                    }
                }
            }
        }
        self.needs_object_update = true;
        Some(object)
    }

    fn object_address_at(&self, x: i32, z: i32) -> Option<u16> {
        let lo = self.get_layer(x, z, layer::OBJECT_LO);
        let hi = self.get_layer(x, z, layer::OBJECT_HI);
        let address = u16::from_le_bytes([lo, hi]);
        (address != 0).then_some(address)
    }

    /// Object whose address is stored in tile column (x, z)
    pub fn object_at(&self, x: i32, z: i32) -> Option<&AttachedObject> {
        if !self.has_layers() {
            return None;
        }
        let address = self.object_address_at(x, z)?;
        self.objects.iter().find(|o| o.address == address)
    }

    // --- Persistence support ---

    /// Next address that `attach_object` will assign
    pub fn next_address(&self) -> u32 {
        self.next_address
    }

    /// Rebuild a chunk from decoded parts. Used by the codec.
    pub(crate) fn from_parts(
        coord: ChunkCoord,
        dims: [usize; 3],
        data: Vec<u8>,
        objects: Vec<AttachedObject>,
        explored: bool,
    ) -> Self {
        let next_address = objects
            .iter()
            .map(|o| o.address as u32 + 1)
            .max()
            .unwrap_or(1);
        let mut chunk = Self::new(coord);
        chunk.dims = Some(dims);
        chunk.data = data;
        chunk.objects = objects;
        chunk.next_address = next_address;
        chunk.explored = explored;
        chunk.recompute_empty();
        chunk
    }

    /// Take over the persistent contents of `decoded`, as after a reload.
    ///
    /// Runtime flags are reset so the chunk is rebuilt and its objects prepared.
    pub fn replace_contents(&mut self, decoded: ChunkData) {
        self.dims = decoded.dims;
        self.data = decoded.data;
        self.objects = decoded.objects;
        self.next_address = decoded.next_address;
        self.explored = decoded.explored;
        self.recompute_empty();
        self.loaded = true;
        self.mark_dirty();
        self.needs_object_update = !self.objects.is_empty();
    }
}

impl PartialEq for ChunkData {
    /// Persistent contents only; runtime flags and handles are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.coord == other.coord
            && self.dims == other.dims
            && self.data == other.data
            && self.objects == other.objects
            && self.empty == other.empty
            && self.explored == other.explored
    }
}

/// Immutable copy of a chunk's grid handed to worker jobs
#[derive(Clone, Debug)]
pub struct ChunkSnapshot {
    pub coord: ChunkCoord,
    pub dims: [usize; 3],
    pub data: Arc<[u8]>,
}

impl ChunkSnapshot {
    /// Read a local cell, [`NO_DATA`] out of bounds
    pub fn get(&self, x: i32, y: i32, z: i32) -> u8 {
        let [sx, sy, sz] = self.dims;
        if x < 0 || y < 0 || z < 0 {
            return NO_DATA;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= sx || y >= sy || z >= sz {
            return NO_DATA;
        }
        self.data[x + z * sx + y * sx * sz]
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == NO_DATA)
    }
}
