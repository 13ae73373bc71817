//! Level of Detail (LOD) selection for active chunks
//!
//! Each active chunk gets a detail tier from its distance to the viewpoint.
//! The tier is recomputed every tick and consumed by the mesh builder; the
//! engine itself does not change behavior per tier.

/// Default tier thresholds in world units
/// - LOD 0: 0-64
/// - LOD 1: 64-128
/// - LOD 2: 128-256
/// - LOD 3: 256-512
/// - LOD 4: 512-1024
/// - LOD 5: 1024+
pub const LOD_DISTANCES: [f32; 6] = [64.0, 128.0, 256.0, 512.0, 1024.0, f32::MAX];

/// Maximum LOD level with the default table
pub const MAX_LOD: u32 = 5;

/// Configuration for LOD selection
#[derive(Clone, Debug, PartialEq)]
pub struct LodConfig {
    /// Upper distance bound (exclusive) of each tier, ascending
    pub distances: Vec<f32>,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            distances: LOD_DISTANCES.to_vec(),
        }
    }
}

impl LodConfig {
    pub fn new(distances: Vec<f32>) -> Self {
        Self { distances }
    }

    /// Highest tier this table can produce
    pub fn max_lod(&self) -> u32 {
        self.distances.len().saturating_sub(1) as u32
    }
}

/// Calculate LOD level from distance
///
/// Distances past the last threshold clamp to the last tier.
///
/// # Examples
/// ```
/// use strata::streaming::lod::{lod_from_distance, LodConfig};
///
/// let config = LodConfig::default();
/// assert_eq!(lod_from_distance(&config, 32.0), 0);
/// assert_eq!(lod_from_distance(&config, 96.0), 1);
/// assert_eq!(lod_from_distance(&config, 200.0), 2);
/// assert_eq!(lod_from_distance(&config, 2000.0), 5);
/// ```
pub fn lod_from_distance(config: &LodConfig, distance: f32) -> u32 {
    for (level, &max_dist) in config.distances.iter().enumerate() {
        if distance < max_dist {
            return level as u32;
        }
    }
    config.max_lod()
}
