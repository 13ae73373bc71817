//! Chunk and region coordinates

use std::fmt;
use std::str::FromStr;

use glam::{IVec3, Vec3};

/// Integer coordinate identifying a chunk in the world chunk grid
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing the global cell `cell` for the given chunk extent
    pub fn from_cell(cell: IVec3, dims: [usize; 3]) -> Self {
        Self {
            x: cell.x.div_euclid(dims[0] as i32),
            y: cell.y.div_euclid(dims[1] as i32),
            z: cell.z.div_euclid(dims[2] as i32),
        }
    }

    /// Canonical archive key, `"x_y_z"`
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.x, self.y, self.z)
    }

    /// Global cell coordinate of this chunk's minimum corner
    pub fn origin_cell(&self, dims: [usize; 3]) -> IVec3 {
        IVec3::new(
            self.x * dims[0] as i32,
            self.y * dims[1] as i32,
            self.z * dims[2] as i32,
        )
    }

    /// World-space center of this chunk
    pub fn world_center(&self, dims: [usize; 3]) -> Vec3 {
        let origin = self.origin_cell(dims).as_vec3();
        origin + Vec3::new(dims[0] as f32, dims[1] as f32, dims[2] as f32) * 0.5
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.x, self.y, self.z)
    }
}

/// Error returned when a canonical chunk name does not parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChunkCoordError(pub String);

impl fmt::Display for ParseChunkCoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid chunk name '{}'", self.0)
    }
}

impl std::error::Error for ParseChunkCoordError {}

impl FromStr for ChunkCoord {
    type Err = ParseChunkCoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<i32>().ok())
                .ok_or_else(|| ParseChunkCoordError(s.to_string()))
        };
        let coord = ChunkCoord::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ParseChunkCoordError(s.to_string()));
        }
        Ok(coord)
    }
}

/// Coordinate of a region on the X/Z plane, in region units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoord {
    pub x: i32,
    pub z: i32,
}

impl RegionCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region owning a chunk
    pub fn of_chunk(coord: ChunkCoord, region_chunks: u32) -> Self {
        let n = region_chunks as i32;
        Self {
            x: coord.x.div_euclid(n),
            z: coord.z.div_euclid(n),
        }
    }

    /// Minimum chunk (x, z) covered by this region
    pub fn min_chunk(&self, region_chunks: u32) -> (i32, i32) {
        let n = region_chunks as i32;
        (self.x * n, self.z * n)
    }

    /// Whether `coord` lies inside this region
    pub fn contains(&self, coord: ChunkCoord, region_chunks: u32) -> bool {
        Self::of_chunk(coord, region_chunks) == *self
    }

    /// Archive file name for this region
    pub fn file_name(&self) -> String {
        format!("region_{}_{}.rgn", self.x, self.z)
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_name() {
        assert_eq!(ChunkCoord::new(5, 10, -3).name(), "5_10_-3");
        assert_eq!(ChunkCoord::new(0, 0, 0).to_string(), "0_0_0");
    }

    #[test]
    fn test_parse_chunk_name() {
        let coord: ChunkCoord = "5_10_-3".parse().unwrap();
        assert_eq!(coord, ChunkCoord::new(5, 10, -3));

        assert!("5_10".parse::<ChunkCoord>().is_err());
        assert!("5_10_3_4".parse::<ChunkCoord>().is_err());
        assert!("a_b_c".parse::<ChunkCoord>().is_err());
        assert!("__object_ids".parse::<ChunkCoord>().is_err());
    }

    #[test]
    fn test_from_cell_floors_negative() {
        let dims = [32, 32, 32];
        assert_eq!(ChunkCoord::from_cell(IVec3::new(0, 0, 0), dims), ChunkCoord::new(0, 0, 0));
        assert_eq!(ChunkCoord::from_cell(IVec3::new(31, 31, 31), dims), ChunkCoord::new(0, 0, 0));
        assert_eq!(ChunkCoord::from_cell(IVec3::new(32, 0, 0), dims), ChunkCoord::new(1, 0, 0));
        assert_eq!(ChunkCoord::from_cell(IVec3::new(-1, 0, -33), dims), ChunkCoord::new(-1, 0, -2));
    }

    #[test]
    fn test_origin_and_center() {
        let dims = [16, 8, 16];
        let coord = ChunkCoord::new(1, 0, -1);
        assert_eq!(coord.origin_cell(dims), IVec3::new(16, 0, -16));
        assert_eq!(coord.world_center(dims), Vec3::new(24.0, 4.0, -8.0));
    }

    #[test]
    fn test_region_of_chunk() {
        assert_eq!(RegionCoord::of_chunk(ChunkCoord::new(0, 0, 0), 65), RegionCoord::new(0, 0));
        assert_eq!(RegionCoord::of_chunk(ChunkCoord::new(64, 3, 64), 65), RegionCoord::new(0, 0));
        assert_eq!(RegionCoord::of_chunk(ChunkCoord::new(65, 0, 0), 65), RegionCoord::new(1, 0));
        assert_eq!(RegionCoord::of_chunk(ChunkCoord::new(-1, 0, -66), 65), RegionCoord::new(-1, -2));
    }

    #[test]
    fn test_region_contains_and_file_name() {
        let region = RegionCoord::new(-1, 2);
        assert_eq!(region.min_chunk(65), (-65, 130));
        assert!(region.contains(ChunkCoord::new(-65, 0, 130), 65));
        assert!(!region.contains(ChunkCoord::new(0, 0, 130), 65));
        assert_eq!(region.file_name(), "region_-1_2.rgn");
    }
}
