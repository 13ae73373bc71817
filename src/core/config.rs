//! Volume configuration
//!
//! Loaded from / saved to JSON. A volume with a save directory writes its
//! config next to the region archives as `volume.json`.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::streaming::lod::LOD_DISTANCES;

/// File name of the persisted config inside a save directory
pub const VOLUME_CONFIG_FILENAME: &str = "volume.json";

/// Configuration for a streamed volume
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Chunk extent in cells (x, y, z). For flat volumes `y` is the layer count.
    pub chunk_size: [u32; 3],
    /// Chunks per region side (regions are square on X/Z)
    pub region_chunks: u32,
    /// Regions exist for region coordinates in `-world_regions..world_regions` on X and Z
    pub world_regions: u32,
    /// Flat (height-field / tile) volume: chunk Y coordinate is always 0
    pub flat: bool,
    /// World seed; region seeds are derived from it
    pub seed: u64,
    /// Interest radius around the viewpoint, in world units
    pub view_radius: f32,
    /// Worker threads for the job pool (0 = available parallelism)
    pub worker_threads: usize,
    /// Distance thresholds for level-of-detail tiers
    pub lod_distances: Vec<f32>,
    /// Directory holding region archives (None = purely in-memory volume)
    pub save_dir: Option<PathBuf>,
    /// Maximum closed-set size of a single A* search
    pub path_search_limit: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            chunk_size: [32, 32, 32],
            region_chunks: 65,
            world_regions: 1,
            flat: false,
            seed: 12345,
            view_radius: 64.0,
            worker_threads: 0,
            lod_distances: LOD_DISTANCES.to_vec(),
            save_dir: None,
            path_search_limit: 4096,
        }
    }
}

impl VolumeConfig {
    /// Config for a flat tile volume with `layers` semantic slots per cell column
    pub fn flat(chunk_xz: u32, layers: u32) -> Self {
        Self {
            chunk_size: [chunk_xz, layers, chunk_xz],
            flat: true,
            ..Default::default()
        }
    }

    /// Builder-style save directory
    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    /// Chunk extent as `usize` triple
    pub fn chunk_dims(&self) -> [usize; 3] {
        [
            self.chunk_size[0] as usize,
            self.chunk_size[1] as usize,
            self.chunk_size[2] as usize,
        ]
    }

    /// Reject configurations the engine cannot stream
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size.iter().any(|&s| s == 0) {
            return Err(Error::Config(format!(
                "chunk_size must be non-zero, got {:?}",
                self.chunk_size
            )));
        }
        if self.region_chunks == 0 {
            return Err(Error::Config("region_chunks must be non-zero".into()));
        }
        if self.world_regions == 0 {
            return Err(Error::Config("world_regions must be non-zero".into()));
        }
        if self.lod_distances.is_empty() {
            return Err(Error::Config("lod_distances must not be empty".into()));
        }
        if !(self.view_radius >= 0.0) {
            return Err(Error::Config(format!(
                "view_radius must be a non-negative number, got {}",
                self.view_radius
            )));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
