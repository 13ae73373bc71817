//! Streaming demo: walks a viewpoint across a noise-generated voxel volume,
//! saves it, reloads it from disk and plans a path over the surface.
//!
//! Usage: cargo run --release --bin stream_demo -- [OPTIONS]
//!
//! Options:
//!   --seed <SEED>      World seed (default: 12345)
//!   --dir <DIR>        Save directory (default: "saves/demo")
//!   --steps <N>        Viewpoint steps (default: 16)
//!   --stride <UNITS>   Distance moved per step (default: 8.0)
//!   --radius <UNITS>   Interest radius (default: 48.0)
//!   --chunk <CELLS>    Chunk edge in cells (default: 16)
//!   --scale <SCALE>    Terrain noise scale (default: 60.0)
//!   --height <H>       Terrain height scale (default: 24.0)
//!   --jobs <N>         Worker threads (default: 4)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use glam::{IVec2, Vec3};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

use strata::core::VolumeConfig;
use strata::streaming::{
    ChunkData, ChunkSnapshot, Generator, GeometryHandle, MeshBuilder, Region, VolumeBuilder,
    VoxelFlavor,
};

const STONE: u8 = 1;
const GRASS: u8 = 2;

/// Height-field generator: stone below the surface, one grass cell on top
struct NoiseTerrain {
    noise: Fbm<Perlin>,
    scale: f64,
    height_scale: f64,
}

impl NoiseTerrain {
    fn new(seed: u32, scale: f32, height_scale: f32) -> Self {
        let noise = Fbm::<Perlin>::new(seed)
            .set_octaves(4)
            .set_persistence(0.5)
            .set_lacunarity(2.0);
        Self {
            noise,
            scale: scale as f64,
            height_scale: height_scale as f64,
        }
    }

    fn height_at(&self, x: i32, z: i32) -> i32 {
        let n = self.noise.get([x as f64 / self.scale, z as f64 / self.scale]);
        (((n + 1.0) * 0.5) * self.height_scale) as i32 + 1
    }
}

impl Generator for NoiseTerrain {
    fn generate(&self, chunk: &mut ChunkData, _region: &Region) {
        let Some(dims) = chunk.dims() else {
            return;
        };
        let origin = chunk.coord().origin_cell(dims);
        for lx in 0..dims[0] as i32 {
            for lz in 0..dims[2] as i32 {
                let top = self.height_at(origin.x + lx, origin.z + lz);
                for ly in 0..dims[1] as i32 {
                    let y = origin.y + ly;
                    if y < top - 1 {
                        chunk.set(lx, ly, lz, STONE);
                    } else if y == top - 1 {
                        chunk.set(lx, ly, lz, GRASS);
                    }
                }
            }
        }
        chunk.loaded = true;
    }
}

/// Stand-in mesher: hands out a fresh handle per build
#[derive(Default)]
struct SequenceMesher {
    next: AtomicU64,
}

impl MeshBuilder for SequenceMesher {
    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        if snapshot.is_empty() {
            return None;
        }
        Some(GeometryHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

fn main() -> strata::core::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let args: Vec<String> = std::env::args().collect();
    let seed = parse_u32_arg(&args, "--seed").unwrap_or(12345);
    let dir = parse_str_arg(&args, "--dir").unwrap_or_else(|| "saves/demo".to_string());
    let steps = parse_usize_arg(&args, "--steps").unwrap_or(16);
    let stride = parse_f32_arg(&args, "--stride").unwrap_or(8.0);
    let radius = parse_f32_arg(&args, "--radius").unwrap_or(48.0);
    let chunk = parse_u32_arg(&args, "--chunk").unwrap_or(16);
    let scale = parse_f32_arg(&args, "--scale").unwrap_or(60.0);
    let height_scale = parse_f32_arg(&args, "--height").unwrap_or(24.0);
    let jobs = parse_usize_arg(&args, "--jobs").unwrap_or(4);

    println!("=== Strata Stream Demo ===");
    println!("Seed: {}, chunk: {}^3, radius: {:.1}", seed, chunk, radius);
    println!("Save dir: {}", dir);
    println!();

    let config = VolumeConfig {
        chunk_size: [chunk, chunk, chunk],
        region_chunks: 8,
        world_regions: 2,
        seed: seed as u64,
        view_radius: radius,
        worker_threads: jobs,
        ..Default::default()
    }
    .with_save_dir(&dir);

    let mesher: Arc<SequenceMesher> = Arc::new(SequenceMesher::default());
    let terrain = Arc::new(NoiseTerrain::new(seed, scale, height_scale));
    let column_height = height_scale as i32 + 2;

    let mut volume = VolumeBuilder::new(config)
        .flavor(Arc::new(VoxelFlavor::new(mesher.clone()).with_column_height(column_height)))
        .generator(terrain.clone())
        .build()?;

    let start = Instant::now();
    let mut viewpoint = Vec3::new(0.0, height_scale * 0.5, 0.0);
    for step in 0..steps {
        let report = volume.tick(viewpoint);
        let installed = volume.finish_loading();
        log::info!(
            "[{}/{}] at ({:.0}, {:.0}): wanted {}, active {}, +{} -{}, installed {}, meshes {}",
            step + 1,
            steps,
            viewpoint.x,
            viewpoint.z,
            report.wanted,
            report.active,
            report.activated,
            report.swept,
            report.loads_installed + installed,
            report.applied.meshes,
        );
        viewpoint.x += stride;
    }

    // Let outstanding rebuilds land
    let settle = volume.tick(viewpoint);
    log::info!(
        "Settled: {} active, {} jobs pending",
        settle.active,
        volume.pending_jobs()
    );

    let surface = volume.get_height(0, 0);
    println!("Surface height at origin: {:.1}", surface);

    let saved = volume.save_all()?;
    println!(
        "Streamed {} steps in {:.2}s, saved {} regions",
        steps,
        start.elapsed().as_secs_f64(),
        saved
    );
    drop(volume);

    // Reload purely from what is on disk
    let mut reloaded = VolumeBuilder::from_save_dir(&dir)?
        .flavor(Arc::new(VoxelFlavor::new(mesher).with_column_height(column_height)))
        .generator(terrain)
        .build()?;
    reloaded.tick(Vec3::new(0.0, height_scale * 0.5, 0.0));
    reloaded.finish_loading();
    reloaded.tick(Vec3::new(0.0, height_scale * 0.5, 0.0));

    let reloaded_surface = reloaded.get_height(0, 0);
    if reloaded_surface != surface {
        log::warn!(
            "Surface changed across reload: {:.1} -> {:.1}",
            surface,
            reloaded_surface
        );
    }

    let target = IVec2::new(chunk as i32 * 2, chunk as i32);
    let path = reloaded.get_path(IVec2::ZERO, target).wait()?;
    if path.is_empty() {
        println!("No path from (0, 0) to ({}, {})", target.x, target.y);
    } else {
        println!(
            "Path to ({}, {}): {} steps, cost {}",
            target.x,
            target.y,
            path.len(),
            path.cost
        );
        for waypoint in path.waypoints.iter().step_by(4) {
            println!("  ({:.0}, {:.1}, {:.0})", waypoint.x, waypoint.y, waypoint.z);
        }
    }

    println!();
    println!("=== Done ===");
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
