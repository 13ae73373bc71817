//! Per-volume strategy: how chunks are created, meshed, walked and measured
//!
//! A volume is one concrete type; what differs between a voxel world and a
//! flat tile map is injected as a [`VolumeFlavor`].

use std::collections::HashSet;
use std::sync::Arc;

use crate::streaming::chunk::{ChunkData, ChunkSnapshot, NO_DATA, layer};
use crate::streaming::coord::ChunkCoord;
use crate::streaming::external::{GeometryHandle, MeshBuilder, NullMeshBuilder};
use crate::streaming::region::Region;
use crate::streaming::volume::VolumeSampler;

/// Strategy selected per volume instance
pub trait VolumeFlavor: Send + Sync {
    fn name(&self) -> &str;

    /// Construct a blank chunk. `None` means the flavor cannot make one; the
    /// volume then falls back to an empty-but-loaded chunk.
    fn create_chunk(&self, coord: ChunkCoord, _region: &Region, dims: [usize; 3]) -> Option<ChunkData> {
        ChunkData::with_dims(coord, dims).ok()
    }

    /// Build render geometry. Runs on worker threads.
    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle>;

    /// Whether the pathfinder may enter global cell (x, y, z)
    fn is_passable(&self, _sampler: &VolumeSampler, _x: i32, _y: i32, _z: i32) -> bool {
        true
    }

    /// Walkable surface height of column (x, z), world units
    fn get_height(&self, _sampler: &VolumeSampler, _x: i32, _z: i32) -> f32 {
        0.0
    }
}

/// Dense 3D voxel data
///
/// A cell is passable when it is empty. The surface height of a column is
/// the top face of its highest solid cell.
pub struct VoxelFlavor {
    mesher: Arc<dyn MeshBuilder>,
    column_height: i32,
}

impl VoxelFlavor {
    pub fn new(mesher: Arc<dyn MeshBuilder>) -> Self {
        Self {
            mesher,
            column_height: 256,
        }
    }

    /// Highest cell (exclusive) scanned when measuring column height
    pub fn with_column_height(mut self, column_height: i32) -> Self {
        self.column_height = column_height;
        self
    }
}

impl Default for VoxelFlavor {
    fn default() -> Self {
        Self::new(Arc::new(NullMeshBuilder))
    }
}

impl VolumeFlavor for VoxelFlavor {
    fn name(&self) -> &str {
        "voxel"
    }

    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        self.mesher.build_mesh(snapshot)
    }

    fn is_passable(&self, sampler: &VolumeSampler, x: i32, y: i32, z: i32) -> bool {
        sampler.get_value(x, y, z) == NO_DATA
    }

    fn get_height(&self, sampler: &VolumeSampler, x: i32, z: i32) -> f32 {
        (0..self.column_height)
            .rev()
            .find(|&y| sampler.get_value(x, y, z) != NO_DATA)
            .map_or(0.0, |y| (y + 1) as f32)
    }
}

/// Flat tile map with layered cells
///
/// Surface types listed as blocking (walls, water, containers, ...) are
/// impassable. Height is always zero.
pub struct TileFlavor {
    mesher: Arc<dyn MeshBuilder>,
    blocking: HashSet<u8>,
}

impl TileFlavor {
    pub fn new(mesher: Arc<dyn MeshBuilder>) -> Self {
        Self {
            mesher,
            blocking: HashSet::new(),
        }
    }

    /// Mark surface types as impassable
    pub fn with_blocking(mut self, surfaces: impl IntoIterator<Item = u8>) -> Self {
        self.blocking.extend(surfaces);
        self
    }

    pub fn is_blocking(&self, surface: u8) -> bool {
        self.blocking.contains(&surface)
    }
}

impl Default for TileFlavor {
    fn default() -> Self {
        Self::new(Arc::new(NullMeshBuilder))
    }
}

impl VolumeFlavor for TileFlavor {
    fn name(&self) -> &str {
        "tile"
    }

    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        self.mesher.build_mesh(snapshot)
    }

    fn is_passable(&self, sampler: &VolumeSampler, x: i32, _y: i32, z: i32) -> bool {
        !self.is_blocking(sampler.get_value(x, layer::SURFACE as i32, z))
    }
}
