//! The volume: regions, the active chunk set, and the per-tick streaming cycle
//!
//! One thread (the owner of the [`Volume`]) mutates the active set, applies
//! job results and talks to the scene. Background work reaches the volume
//! only through job handles and the update pipeline's result channel.
//!
//! Each tick runs mark-and-sweep activation: every active chunk is marked
//! inactive, chunks inside the interest radius are re-activated, and whatever
//! is still inactive afterwards is detached and dropped from the active set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path as FsPath;
use std::sync::Arc;

use glam::{IVec2, IVec3, Vec3};

use crate::core::config::VOLUME_CONFIG_FILENAME;
use crate::core::{Error, Result, VolumeConfig};
use crate::streaming::chunk::{ChunkData, NO_DATA, SharedChunk, read_chunk, share, write_chunk};
use crate::streaming::coord::{ChunkCoord, RegionCoord};
use crate::streaming::external::{
    ActivationContext, ActivationHook, Generator, NullScene, PhysicsFactory, SceneGraph,
};
use crate::streaming::flavor::{VolumeFlavor, VoxelFlavor};
use crate::streaming::jobs::{JobHandle, WorkerPool};
use crate::streaming::lod::LodConfig;
use crate::streaming::objects::{AttachedObject, ObjectRegistry};
use crate::streaming::path::{Path, PathGrid, find_path};
use crate::streaming::pipeline::{ApplyStats, ScheduleStats, UpdatePipeline};
use crate::streaming::priority::ActivationQueue;
use crate::streaming::region::{Region, derive_seed};

/// Every region of a volume, created up front, addressable by coordinate
pub struct RegionGrid {
    regions: Vec<Arc<Region>>,
    world_regions: i32,
    region_chunks: u32,
}

impl RegionGrid {
    fn new(config: &VolumeConfig) -> Self {
        let w = config.world_regions as i32;
        let mut regions = Vec::with_capacity((2 * w * 2 * w) as usize);
        for x in -w..w {
            for z in -w..w {
                let coord = RegionCoord::new(x, z);
                regions.push(Arc::new(Region::new(
                    coord,
                    config.region_chunks,
                    derive_seed(config.seed, coord),
                    config.save_dir.clone(),
                )));
            }
        }
        Self {
            regions,
            world_regions: w,
            region_chunks: config.region_chunks,
        }
    }

    pub fn get(&self, coord: RegionCoord) -> Option<&Arc<Region>> {
        let w = self.world_regions;
        if coord.x < -w || coord.x >= w || coord.z < -w || coord.z >= w {
            return None;
        }
        let index = (coord.x + w) * 2 * w + (coord.z + w);
        self.regions.get(index as usize)
    }

    /// Region owning a chunk, if the chunk lies inside the world
    pub fn for_chunk(&self, coord: ChunkCoord) -> Option<&Arc<Region>> {
        self.get(RegionCoord::of_chunk(coord, self.region_chunks))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Region>> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Cheap, cloneable, thread-safe read view of a volume's resident data
#[derive(Clone)]
pub struct VolumeSampler {
    regions: Arc<RegionGrid>,
    dims: [usize; 3],
    flat: bool,
    flavor: Arc<dyn VolumeFlavor>,
}

impl VolumeSampler {
    /// Chunk coordinate and local cell of a global cell
    pub fn locate(&self, x: i32, y: i32, z: i32) -> (ChunkCoord, IVec3) {
        let cell = IVec3::new(x, y, z);
        if self.flat {
            // Y is the layer axis; all chunks sit at chunk Y = 0
            let coord = ChunkCoord::from_cell(IVec3::new(x, 0, z), self.dims);
            let origin = coord.origin_cell(self.dims);
            (coord, IVec3::new(x - origin.x, y, z - origin.z))
        } else {
            let coord = ChunkCoord::from_cell(cell, self.dims);
            (coord, cell - coord.origin_cell(self.dims))
        }
    }

    /// Resident chunk holding a global cell
    pub fn chunk_at(&self, x: i32, y: i32, z: i32) -> Option<SharedChunk> {
        let (coord, _) = self.locate(x, y, z);
        self.regions.for_chunk(coord)?.get_chunk(coord)
    }

    /// Value of a global cell, [`NO_DATA`] where nothing is resident
    pub fn get_value(&self, x: i32, y: i32, z: i32) -> u8 {
        let (coord, local) = self.locate(x, y, z);
        let Some(chunk) = self
            .regions
            .for_chunk(coord)
            .and_then(|region| region.get_chunk(coord))
        else {
            return NO_DATA;
        };
        read_chunk(&chunk).get(local.x, local.y, local.z)
    }

    pub fn is_passable(&self, x: i32, y: i32, z: i32) -> bool {
        self.flavor.is_passable(self, x, y, z)
    }

    pub fn get_height(&self, x: i32, z: i32) -> f32 {
        self.flavor.get_height(self, x, z)
    }
}

impl PathGrid for VolumeSampler {
    fn is_passable(&self, x: i32, z: i32) -> bool {
        let y = self.get_height(x, z).floor() as i32;
        VolumeSampler::is_passable(self, x, y, z)
    }

    fn height(&self, x: i32, z: i32) -> f32 {
        self.get_height(x, z)
    }
}

/// Summary of one `tick`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Chunks inside the interest radius
    pub wanted: usize,
    /// Chunks that entered the active set this tick
    pub activated: usize,
    /// Chunks swept out of the active set
    pub swept: usize,
    /// Size of the bulk load submitted this tick (0 if none)
    pub load_submitted: usize,
    /// Chunks made resident by a bulk load that finished this tick
    pub loads_installed: usize,
    /// Active set size after the sweep
    pub active: usize,
    pub schedule: ScheduleStats,
    pub applied: ApplyStats,
}

/// Output of a bulk load job
#[derive(Default)]
struct BulkLoad {
    loaded: usize,
    generated: Vec<SharedChunk>,
}

/// Builder for [`Volume`]
pub struct VolumeBuilder {
    config: VolumeConfig,
    flavor: Option<Arc<dyn VolumeFlavor>>,
    generator: Option<Arc<dyn Generator>>,
    hook: Option<Arc<dyn ActivationHook>>,
    scene: Arc<dyn SceneGraph>,
    physics: Option<Arc<dyn PhysicsFactory>>,
    registry: Arc<ObjectRegistry>,
}

impl VolumeBuilder {
    pub fn new(config: VolumeConfig) -> Self {
        Self {
            config,
            flavor: None,
            generator: None,
            hook: None,
            scene: Arc::new(NullScene),
            physics: None,
            registry: Arc::new(ObjectRegistry::new()),
        }
    }

    /// Builder for a volume previously saved in `dir` (reads `volume.json`)
    pub fn from_save_dir(dir: impl AsRef<FsPath>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = VolumeConfig::load_sync(&dir.join(VOLUME_CONFIG_FILENAME))?;
        Ok(Self::new(config.with_save_dir(dir)))
    }

    pub fn flavor(mut self, flavor: Arc<dyn VolumeFlavor>) -> Self {
        self.flavor = Some(flavor);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn ActivationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn scene(mut self, scene: Arc<dyn SceneGraph>) -> Self {
        self.scene = scene;
        self
    }

    pub fn physics(mut self, physics: Arc<dyn PhysicsFactory>) -> Self {
        self.physics = Some(physics);
        self
    }

    pub fn registry(mut self, registry: Arc<ObjectRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Result<Volume> {
        self.config.validate()?;

        let flavor = self
            .flavor
            .unwrap_or_else(|| Arc::new(VoxelFlavor::default()));
        let pool = Arc::new(WorkerPool::new(self.config.worker_threads)?);
        let regions = Arc::new(RegionGrid::new(&self.config));
        let pipeline = UpdatePipeline::new(
            Arc::clone(&pool),
            Arc::clone(&flavor),
            Arc::clone(&self.registry),
            LodConfig::new(self.config.lod_distances.clone()),
        );

        log::info!(
            "Created {} volume: {} regions, chunk {:?}, save dir {:?}",
            flavor.name(),
            regions.len(),
            self.config.chunk_size,
            self.config.save_dir
        );

        Ok(Volume {
            dims: self.config.chunk_dims(),
            queue: ActivationQueue::new(self.config.view_radius),
            config: self.config,
            regions,
            active: Vec::new(),
            active_index: HashMap::new(),
            fresh: HashSet::new(),
            flavor,
            generator: self.generator,
            hook: self.hook,
            scene: self.scene,
            physics: self.physics,
            pool,
            pipeline,
            bulk: None,
        })
    }
}

/// A streamed world
pub struct Volume {
    config: VolumeConfig,
    dims: [usize; 3],
    regions: Arc<RegionGrid>,
    active: Vec<SharedChunk>,
    active_index: HashMap<ChunkCoord, usize>,
    /// Generated this session and not yet activated
    fresh: HashSet<ChunkCoord>,
    flavor: Arc<dyn VolumeFlavor>,
    generator: Option<Arc<dyn Generator>>,
    hook: Option<Arc<dyn ActivationHook>>,
    scene: Arc<dyn SceneGraph>,
    physics: Option<Arc<dyn PhysicsFactory>>,
    pool: Arc<WorkerPool>,
    pipeline: UpdatePipeline,
    queue: ActivationQueue,
    bulk: Option<JobHandle<BulkLoad>>,
}

impl Volume {
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn regions(&self) -> &RegionGrid {
        &self.regions
    }

    /// The active set, in activation order
    pub fn active(&self) -> &[SharedChunk] {
        &self.active
    }

    pub fn is_active(&self, coord: ChunkCoord) -> bool {
        self.active_index.contains_key(&coord)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Rebuild jobs still running
    pub fn pending_jobs(&self) -> usize {
        self.pipeline.pending()
    }

    /// Read view for off-thread consumers
    pub fn sampler(&self) -> VolumeSampler {
        VolumeSampler {
            regions: Arc::clone(&self.regions),
            dims: self.dims,
            flat: self.config.flat,
            flavor: Arc::clone(&self.flavor),
        }
    }

    // --- Coordinate resolution ---

    /// Chunk coordinate owning a global cell
    pub fn chunk_coord_for(&self, x: i32, y: i32, z: i32) -> ChunkCoord {
        self.sampler().locate(x, y, z).0
    }

    /// Region owning a global cell
    pub fn region_for(&self, x: i32, y: i32, z: i32) -> Option<&Arc<Region>> {
        self.regions.for_chunk(self.chunk_coord_for(x, y, z))
    }

    /// Resident chunk holding a global cell
    pub fn chunk_for(&self, x: i32, y: i32, z: i32) -> Option<SharedChunk> {
        self.sampler().chunk_at(x, y, z)
    }

    fn in_world(&self, coord: ChunkCoord) -> bool {
        (!self.config.flat || coord.y == 0) && self.regions.for_chunk(coord).is_some()
    }

    // --- Activation ---

    /// Bring `coord` into the active set and return it.
    ///
    /// Already-active chunks are returned as is. Otherwise the chunk is taken
    /// from its region if resident, loaded from the archive, or created and
    /// generated. Returns `None` for coordinates outside the world.
    pub fn activate_chunk(&mut self, coord: ChunkCoord) -> Option<SharedChunk> {
        if let Some(&i) = self.active_index.get(&coord) {
            let chunk = Arc::clone(&self.active[i]);
            write_chunk(&chunk).active = true;
            return Some(chunk);
        }
        if !self.in_world(coord) {
            log::trace!("Chunk {} is outside the world", coord);
            return None;
        }
        let region = Arc::clone(self.regions.for_chunk(coord)?);

        let (chunk, first_visit) = match region.get_chunk(coord) {
            Some(chunk) => (chunk, self.fresh.remove(&coord)),
            None => self.make_resident(coord, &region),
        };

        {
            let mut data = write_chunk(&chunk);
            if let Some(hook) = &self.hook {
                let ctx = ActivationContext {
                    first_visit,
                    region: &region,
                };
                hook.before_activate(&mut data, &ctx);
            }
            data.active = true;
            data.restricted = false;
            self.scene.attach(&data);
        }

        self.active_index.insert(coord, self.active.len());
        self.active.push(Arc::clone(&chunk));
        log::trace!("Activated chunk {} (first visit: {})", coord, first_visit);
        Some(chunk)
    }

    /// Load or generate a chunk synchronously and make it resident
    fn make_resident(&self, coord: ChunkCoord, region: &Region) -> (SharedChunk, bool) {
        let candidate = share(ChunkData::new(coord));
        if region.load_chunk(&candidate) {
            let resident = region.get_chunk(coord).unwrap_or(candidate);
            return (resident, false);
        }

        let generated = share(materialize(
            coord,
            region,
            self.dims,
            self.flavor.as_ref(),
            self.generator.as_deref(),
        ));
        let resident = region.adopt(&generated);
        let first_visit = Arc::ptr_eq(&resident, &generated);
        (resident, first_visit)
    }

    /// Make `coord` resident as a sampling neighbor without activating it.
    ///
    /// New chunks are marked `restricted` so they are never rebuilt; a later
    /// `activate_chunk` lifts that.
    pub fn ensure_resident(&mut self, coord: ChunkCoord) -> Option<SharedChunk> {
        if !self.in_world(coord) {
            return None;
        }
        let region = Arc::clone(self.regions.for_chunk(coord)?);
        if let Some(chunk) = region.get_chunk(coord) {
            return Some(chunk);
        }

        let (chunk, first_visit) = self.make_resident(coord, &region);
        if first_visit {
            self.fresh.insert(coord);
        }
        {
            let mut data = write_chunk(&chunk);
            if !data.active {
                data.restricted = true;
            }
        }
        Some(chunk)
    }

    /// Phase 1 of mark-and-sweep: clear `active` on every active chunk
    pub fn mark_inactive(&mut self) {
        for chunk in &self.active {
            write_chunk(chunk).active = false;
        }
    }

    /// Phase 2 of mark-and-sweep: drop and detach chunks still inactive.
    ///
    /// Returns the number of chunks removed.
    pub fn move_inactive(&mut self) -> usize {
        let before = self.active.len();
        let scene = Arc::clone(&self.scene);
        self.active.retain(|chunk| {
            let data = read_chunk(chunk);
            if data.active {
                true
            } else {
                scene.detach(&data);
                false
            }
        });

        self.active_index = self
            .active
            .iter()
            .enumerate()
            .map(|(i, chunk)| (read_chunk(chunk).coord(), i))
            .collect();

        let swept = before - self.active.len();
        if swept > 0 {
            log::debug!("Swept {} chunks, {} remain active", swept, self.active.len());
        }
        swept
    }

    // --- Data access ---

    /// Value of a global cell, [`NO_DATA`] where nothing is resident
    pub fn get_value(&self, x: i32, y: i32, z: i32) -> u8 {
        self.sampler().get_value(x, y, z)
    }

    /// Write a global cell. Dropped if no chunk is resident there.
    ///
    /// Returns whether the stored value changed.
    pub fn set_value(&mut self, x: i32, y: i32, z: i32, value: u8) -> bool {
        let (coord, local) = self.sampler().locate(x, y, z);
        let Some(chunk) = self
            .regions
            .for_chunk(coord)
            .and_then(|region| region.get_chunk(coord))
        else {
            return false;
        };
        write_chunk(&chunk).set(local.x, local.y, local.z, value)
    }

    pub fn get_height(&self, x: i32, z: i32) -> f32 {
        self.sampler().get_height(x, z)
    }

    pub fn is_passable(&self, x: i32, y: i32, z: i32) -> bool {
        self.sampler().is_passable(x, y, z)
    }

    /// Start an A* search on the worker pool
    pub fn get_path(&self, source: IVec2, target: IVec2) -> JobHandle<Path> {
        let sampler = self.sampler();
        let limit = self.config.path_search_limit;
        self.pool
            .spawn(move || find_path(&sampler, source, target, limit))
    }

    // --- Objects ---

    /// Attach a new object at a global cell column.
    ///
    /// Returns the object's region-unique id, or `None` if no chunk is resident
    /// there.
    pub fn attach_object(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<Option<u64>> {
        let (coord, local) = self.sampler().locate(x, y, z);
        let Some(region) = self.regions.for_chunk(coord) else {
            return Ok(None);
        };
        let Some(chunk) = region.get_chunk(coord) else {
            return Ok(None);
        };

        let id = region.allocate_object_id();
        write_chunk(&chunk).attach_object(local.x, local.z, AttachedObject::new(id, kind, payload))?;
        Ok(Some(id))
    }

    /// Remove an object from the chunk holding a global cell
    pub fn detach_object(&mut self, x: i32, y: i32, z: i32, id: u64) -> Option<AttachedObject> {
        let chunk = self.chunk_for(x, y, z)?;
        let mut data = write_chunk(&chunk);
        let object = data.detach_object(id)?;
        if object.visual.is_some() && data.active {
            self.scene.detach_object(data.coord(), id);
        }
        Some(object)
    }

    // --- Persistence ---

    /// Save every region with resident chunks or an existing archive, and the
    /// volume config. Returns the number of regions written.
    pub fn save_all(&self) -> Result<usize> {
        let dir = self
            .config
            .save_dir
            .as_deref()
            .ok_or_else(|| Error::Config("volume has no save_dir".into()))?;

        let mut saved = 0;
        let mut first_error = None;
        for region in self.regions.iter() {
            if region.loaded_len() == 0 && !region.has_archive() {
                continue;
            }
            match region.save(dir) {
                Ok(_) => saved += 1,
                Err(e) => {
                    log::error!("Failed to save region {}: {}", region.coord(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.config.save_sync(&dir.join(VOLUME_CONFIG_FILENAME))?;
        log::info!("Saved {} regions to {}", saved, dir.display());

        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    // --- Streaming cycle ---

    /// Advance streaming one step around `viewpoint`.
    ///
    /// Chunks already resident are activated at once; the rest are handed to
    /// a single background load job and activated on the tick after it lands.
    pub fn tick(&mut self, viewpoint: Vec3) -> TickReport {
        let mut report = TickReport {
            loads_installed: self.poll_bulk_load(),
            ..Default::default()
        };

        self.queue.update(viewpoint, self.dims, self.config.flat);
        let wanted = self.queue.drain_ordered();
        report.wanted = wanted.len();

        self.mark_inactive();
        let mut to_load = Vec::new();
        for coord in wanted {
            let resident = self.is_active(coord)
                || self
                    .regions
                    .for_chunk(coord)
                    .is_some_and(|region| region.get_chunk(coord).is_some());
            if resident {
                let was_active = self.is_active(coord);
                if self.activate_chunk(coord).is_some() && !was_active {
                    report.activated += 1;
                }
            } else if self.in_world(coord) {
                to_load.push(coord);
            }
        }

        if !to_load.is_empty() && self.bulk.is_none() {
            report.load_submitted = to_load.len();
            self.submit_bulk_load(to_load);
        }

        report.swept = self.move_inactive();
        report.active = self.active.len();

        report.schedule = self
            .pipeline
            .schedule(&self.active, viewpoint, self.dims, self.config.flat);
        report.applied = self
            .pipeline
            .apply_results(self.scene.as_ref(), self.physics.as_deref());

        log::trace!("Tick at {}: {:?}", viewpoint, report);
        report
    }

    fn submit_bulk_load(&mut self, coords: Vec<ChunkCoord>) {
        log::debug!("Submitting bulk load of {} chunks", coords.len());
        let regions = Arc::clone(&self.regions);
        let flavor = Arc::clone(&self.flavor);
        let generator = self.generator.clone();
        let dims = self.dims;
        self.bulk = Some(self.pool.spawn(move || {
            bulk_load(&regions, coords, dims, flavor.as_ref(), generator.as_deref())
        }));
    }

    /// Install a finished bulk load, if any. Returns chunks made resident.
    fn poll_bulk_load(&mut self) -> usize {
        let Some(handle) = self.bulk.as_mut() else {
            return 0;
        };
        match handle.poll_ready() {
            None => 0,
            Some(result) => {
                self.bulk = None;
                self.install_bulk_load(result)
            }
        }
    }

    /// Block until the in-flight bulk load (if any) finishes and install it.
    ///
    /// For tools and tests driving the volume outside a frame loop.
    pub fn finish_loading(&mut self) -> usize {
        match self.bulk.take() {
            Some(handle) => self.install_bulk_load(handle.wait()),
            None => 0,
        }
    }

    fn install_bulk_load(&mut self, result: Result<BulkLoad>) -> usize {
        let bulk = match result {
            Ok(bulk) => bulk,
            Err(e) => {
                log::error!("Bulk chunk load failed: {}", e);
                return 0;
            }
        };

        let mut installed = bulk.loaded;
        for chunk in bulk.generated {
            let coord = read_chunk(&chunk).coord();
            let Some(region) = self.regions.for_chunk(coord) else {
                continue;
            };
            if Arc::ptr_eq(&region.adopt(&chunk), &chunk) {
                self.fresh.insert(coord);
                installed += 1;
            }
        }
        log::debug!("Bulk load installed {} chunks", installed);
        installed
    }
}

/// Create and populate a chunk that was not found in its archive.
///
/// Never fails: a missing factory result or generator yields an empty chunk
/// that still counts as loaded.
fn materialize(
    coord: ChunkCoord,
    region: &Region,
    dims: [usize; 3],
    flavor: &dyn VolumeFlavor,
    generator: Option<&dyn Generator>,
) -> ChunkData {
    let mut chunk = flavor.create_chunk(coord, region, dims).unwrap_or_else(|| {
        log::warn!("Flavor '{}' produced no chunk for {}", flavor.name(), coord);
        ChunkData::new(coord)
    });
    if !chunk.is_dimensioned() {
        if let Err(e) = chunk.set_dimensions(dims) {
            log::warn!("Chunk {} left undimensioned: {}", coord, e);
        }
    }

    match generator {
        Some(generator) => generator.generate(&mut chunk, region),
        None => log::trace!("No generator; chunk {} stays empty", coord),
    }
    if !chunk.loaded {
        chunk.loaded = true;
    }
    chunk.mark_dirty();
    chunk
}

/// Worker side of a bulk load: read what the archives have, generate the rest.
///
/// Loaded chunks become resident in their regions right away; generated ones
/// are handed back so the main thread can note them as first visits.
fn bulk_load(
    regions: &RegionGrid,
    coords: Vec<ChunkCoord>,
    dims: [usize; 3],
    flavor: &dyn VolumeFlavor,
    generator: Option<&dyn Generator>,
) -> BulkLoad {
    let mut by_region: BTreeMap<RegionCoord, Vec<ChunkCoord>> = BTreeMap::new();
    for coord in coords {
        by_region
            .entry(RegionCoord::of_chunk(coord, regions.region_chunks))
            .or_default()
            .push(coord);
    }

    let mut out = BulkLoad::default();
    for (region_coord, coords) in by_region {
        let Some(region) = regions.get(region_coord) else {
            continue;
        };
        let pending: Vec<SharedChunk> = coords
            .into_iter()
            .filter(|&c| region.get_chunk(c).is_none())
            .map(|c| share(ChunkData::new(c)))
            .collect();

        let results = region.load_chunks(&pending);
        for (chunk, loaded) in pending.iter().zip(results) {
            if loaded {
                out.loaded += 1;
                continue;
            }
            let coord = read_chunk(chunk).coord();
            out.generated
                .push(share(materialize(coord, region, dims, flavor, generator)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::chunk::layer;
    use crate::streaming::external::VisualHandle;
    use crate::streaming::flavor::TileFlavor;
    use crate::streaming::testing::{CountingMesher, RecordingScene, SceneEvent, eventually};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Fills the bottom layer with 1 and counts calls
    #[derive(Default)]
    struct FloorGenerator {
        calls: AtomicUsize,
    }

    impl Generator for FloorGenerator {
        fn generate(&self, chunk: &mut ChunkData, _region: &Region) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let [sx, _, sz] = chunk.dims().unwrap();
            for z in 0..sz as i32 {
                for x in 0..sx as i32 {
                    chunk.set(x, 0, z, 1);
                }
            }
            chunk.loaded = true;
        }
    }

    /// Generator that forgets to set `loaded`
    struct ForgetfulGenerator;

    impl Generator for ForgetfulGenerator {
        fn generate(&self, chunk: &mut ChunkData, _region: &Region) {
            chunk.set(0, 0, 0, 3);
        }
    }

    #[derive(Default)]
    struct VisitLog {
        visits: Mutex<Vec<(ChunkCoord, bool)>>,
    }

    impl ActivationHook for VisitLog {
        fn before_activate(&self, chunk: &mut ChunkData, ctx: &ActivationContext<'_>) {
            self.visits.lock().unwrap().push((chunk.coord(), ctx.first_visit));
        }
    }

    fn small_config() -> VolumeConfig {
        VolumeConfig {
            chunk_size: [8, 8, 8],
            region_chunks: 4,
            worker_threads: 2,
            view_radius: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_activation_generates_missing_chunk() {
        let generator = Arc::new(FloorGenerator::default());
        let mut volume = VolumeBuilder::new(small_config())
            .generator(generator.clone())
            .build()
            .unwrap();

        let chunk = volume.activate_chunk(ChunkCoord::new(0, 0, 0)).unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        let data = read_chunk(&chunk);
        assert!(data.loaded);
        assert!(data.active);
        assert!(!data.empty);
        drop(data);
        assert_eq!(volume.active().len(), 1);
        assert!(volume.is_active(ChunkCoord::new(0, 0, 0)));
    }

    #[test]
    fn test_activation_is_deduplicated() {
        let scene = Arc::new(RecordingScene::default());
        let mut volume = VolumeBuilder::new(small_config())
            .scene(scene.clone())
            .build()
            .unwrap();

        let a = volume.activate_chunk(ChunkCoord::new(1, 0, 1)).unwrap();
        let b = volume.activate_chunk(ChunkCoord::new(1, 0, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(volume.active().len(), 1);
        assert_eq!(scene.count(&SceneEvent::Attach(ChunkCoord::new(1, 0, 1))), 1);
    }

    #[test]
    fn test_mark_and_sweep_detaches_once() {
        let scene = Arc::new(RecordingScene::default());
        let mut volume = VolumeBuilder::new(small_config())
            .scene(scene.clone())
            .build()
            .unwrap();
        let keep = ChunkCoord::new(0, 0, 0);
        let drop_me = ChunkCoord::new(1, 0, 0);
        volume.activate_chunk(keep);
        volume.activate_chunk(drop_me);

        volume.mark_inactive();
        volume.activate_chunk(keep);
        assert_eq!(volume.move_inactive(), 1);
        assert!(volume.is_active(keep));
        assert!(!volume.is_active(drop_me));

        // A second sweep with nothing to remove detaches nothing
        volume.mark_inactive();
        volume.activate_chunk(keep);
        assert_eq!(volume.move_inactive(), 0);

        assert_eq!(scene.count(&SceneEvent::Detach(drop_me)), 1);
        assert_eq!(scene.count(&SceneEvent::Detach(keep)), 0);
        assert_eq!(scene.count(&SceneEvent::Attach(keep)), 1);
    }

    #[test]
    fn test_reactivation_keeps_edits() {
        let hook = Arc::new(VisitLog::default());
        let mut volume = VolumeBuilder::new(small_config())
            .hook(hook.clone())
            .build()
            .unwrap();
        let coord = ChunkCoord::new(0, 0, 0);
        let first = volume.activate_chunk(coord).unwrap();
        assert!(volume.set_value(3, 2, 1, 5));

        volume.mark_inactive();
        volume.move_inactive();
        assert!(volume.active().is_empty());
        // Still resident, so reads keep working
        assert_eq!(volume.get_value(3, 2, 1), 5);

        let second = volume.activate_chunk(coord).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(volume.get_value(3, 2, 1), 5);
        assert_eq!(
            *hook.visits.lock().unwrap(),
            vec![(coord, true), (coord, false)]
        );
    }

    #[test]
    fn test_outside_world_is_none() {
        let mut volume = VolumeBuilder::new(small_config()).build().unwrap();
        // world_regions = 1, region_chunks = 4: chunks -4..4 exist
        assert!(volume.activate_chunk(ChunkCoord::new(-4, 0, 3)).is_some());
        assert!(volume.activate_chunk(ChunkCoord::new(4, 0, 0)).is_none());
        assert!(volume.activate_chunk(ChunkCoord::new(0, 0, -5)).is_none());
    }

    #[test]
    fn test_data_access_without_chunk() {
        let mut volume = VolumeBuilder::new(small_config()).build().unwrap();
        assert_eq!(volume.get_value(1, 1, 1), NO_DATA);
        assert!(!volume.set_value(1, 1, 1, 9));
        assert!(volume.chunk_for(1, 1, 1).is_none());
        assert_eq!(volume.regions().iter().map(|r| r.loaded_len()).sum::<usize>(), 0);
    }

    #[test]
    fn test_negative_coordinates_resolve() {
        let mut volume = VolumeBuilder::new(small_config()).build().unwrap();
        assert_eq!(volume.chunk_coord_for(-1, -1, -9), ChunkCoord::new(-1, -1, -2));
        assert_eq!(
            volume.region_for(-1, 0, 0).map(|r| r.coord()),
            Some(RegionCoord::new(-1, 0))
        );
        volume.activate_chunk(ChunkCoord::new(-1, -1, -2)).unwrap();
        assert!(volume.set_value(-1, -1, -9, 4));
        let chunk = volume.chunk_for(-1, -1, -9).unwrap();
        assert_eq!(read_chunk(&chunk).get(7, 7, 7), 4);
    }

    #[test]
    fn test_flat_volume_uses_layer_axis() {
        let mut volume = VolumeBuilder::new(VolumeConfig {
            region_chunks: 4,
            ..VolumeConfig::flat(8, layer::COUNT as u32)
        })
        .flavor(Arc::new(TileFlavor::default()))
        .build()
        .unwrap();

        assert_eq!(volume.chunk_coord_for(9, 5, 3), ChunkCoord::new(1, 0, 0));
        assert!(volume.activate_chunk(ChunkCoord::new(1, 1, 0)).is_none());
        volume.activate_chunk(ChunkCoord::new(1, 0, 0)).unwrap();
        assert!(volume.set_value(9, layer::OVERLAY as i32, 3, 7));
        let chunk = volume.chunk_for(9, 0, 3).unwrap();
        assert_eq!(read_chunk(&chunk).get_layer(1, 3, layer::OVERLAY), 7);
    }

    #[test]
    fn test_missing_generator_yields_empty_loaded_chunk() {
        let mut volume = VolumeBuilder::new(small_config()).build().unwrap();
        let chunk = volume.activate_chunk(ChunkCoord::new(2, 0, 2)).unwrap();
        let data = read_chunk(&chunk);
        assert!(data.loaded);
        assert!(data.empty);
        assert_eq!(data.dims(), Some([8, 8, 8]));
    }

    #[test]
    fn test_generator_loaded_flag_is_enforced() {
        let mut volume = VolumeBuilder::new(small_config())
            .generator(Arc::new(ForgetfulGenerator))
            .build()
            .unwrap();
        let chunk = volume.activate_chunk(ChunkCoord::new(0, 0, 0)).unwrap();
        assert!(read_chunk(&chunk).loaded);
        assert_eq!(volume.get_value(0, 0, 0), 3);
    }

    #[test]
    fn test_ensure_resident_is_restricted_until_activated() {
        let scene = Arc::new(RecordingScene::default());
        let hook = Arc::new(VisitLog::default());
        let mut volume = VolumeBuilder::new(small_config())
            .scene(scene.clone())
            .hook(hook.clone())
            .build()
            .unwrap();
        let coord = ChunkCoord::new(1, 1, 1);

        let neighbor = volume.ensure_resident(coord).unwrap();
        assert!(read_chunk(&neighbor).restricted);
        assert!(!read_chunk(&neighbor).active);
        assert!(volume.active().is_empty());
        assert!(scene.events().is_empty());

        let active = volume.activate_chunk(coord).unwrap();
        assert!(Arc::ptr_eq(&neighbor, &active));
        assert!(!read_chunk(&active).restricted);
        // First activation of a chunk generated as a neighbor is still a first visit
        assert_eq!(*hook.visits.lock().unwrap(), vec![(coord, true)]);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = small_config().with_save_dir(temp_dir.path());
        let coord = ChunkCoord::new(0, 0, 0);

        let first_id = {
            let mut volume = VolumeBuilder::new(config.clone())
                .generator(Arc::new(FloorGenerator::default()))
                .build()
                .unwrap();
            volume.activate_chunk(coord).unwrap();
            volume.activate_chunk(ChunkCoord::new(-1, 0, 0)).unwrap();
            volume.set_value(2, 3, 4, 42);
            let id = volume.attach_object(1, 0, 1, "chest", vec![7]).unwrap().unwrap();
            assert_eq!(volume.save_all().unwrap(), 2);
            id
        };
        assert!(temp_dir.path().join(VOLUME_CONFIG_FILENAME).exists());

        let generator = Arc::new(FloorGenerator::default());
        let mut volume = VolumeBuilder::from_save_dir(temp_dir.path())
            .unwrap()
            .generator(generator.clone())
            .build()
            .unwrap();
        assert_eq!(volume.config(), &config);

        let chunk = volume.activate_chunk(coord).unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(volume.get_value(2, 3, 4), 42);
        assert_eq!(volume.get_value(5, 0, 5), 1);
        {
            let data = read_chunk(&chunk);
            assert!(data.loaded);
            assert_eq!(data.object(first_id).map(|o| o.kind.as_str()), Some("chest"));
        }

        // Ids keep counting up across sessions
        let next_id = volume.attach_object(2, 0, 2, "chest", vec![]).unwrap().unwrap();
        assert!(next_id > first_id);
    }

    #[test]
    fn test_save_without_dir_is_config_error() {
        let volume = VolumeBuilder::new(small_config()).build().unwrap();
        assert!(matches!(volume.save_all(), Err(Error::Config(_))));
    }

    #[test]
    fn test_attach_object_requires_resident_chunk() {
        let mut volume = VolumeBuilder::new(small_config()).build().unwrap();
        assert_eq!(volume.attach_object(0, 0, 0, "lamp", vec![]).unwrap(), None);
    }

    #[test]
    fn test_detach_object_notifies_scene() {
        let scene = Arc::new(RecordingScene::default());
        let mut registry = ObjectRegistry::new();
        registry.register("lamp", Arc::new(|_: &AttachedObject| Some(VisualHandle(1))));
        let mut volume = VolumeBuilder::new(small_config())
            .scene(scene.clone())
            .registry(Arc::new(registry))
            .build()
            .unwrap();

        let coord = ChunkCoord::new(0, 0, 0);
        let chunk = volume.activate_chunk(coord).unwrap();
        let id = volume.attach_object(1, 0, 1, "lamp", vec![]).unwrap().unwrap();
        assert!(eventually(|| {
            volume.tick(Vec3::new(4.0, 4.0, 4.0));
            read_chunk(&chunk).object(id).is_some_and(|o| o.is_initialized())
        }));

        assert!(volume.detach_object(1, 0, 1, id).is_some());
        assert_eq!(scene.count(&SceneEvent::DetachObject(coord, id)), 1);
    }

    #[test]
    fn test_tick_streams_around_viewpoint() {
        let mesher = Arc::new(CountingMesher::default());
        let scene = Arc::new(RecordingScene::default());
        let mut volume = VolumeBuilder::new(small_config())
            .flavor(Arc::new(VoxelFlavor::new(mesher.clone())))
            .generator(Arc::new(FloorGenerator::default()))
            .scene(scene.clone())
            .build()
            .unwrap();

        // Viewpoint in the middle of chunk 0 with radius 2: only chunk 0 wanted
        let viewpoint = Vec3::new(4.0, 4.0, 4.0);
        let report = volume.tick(viewpoint);
        assert_eq!(report.wanted, 1);
        assert_eq!(report.load_submitted, 1);
        assert_eq!(report.active, 0);

        assert_eq!(volume.finish_loading(), 1);
        let report = volume.tick(viewpoint);
        assert_eq!(report.activated, 1);
        assert_eq!(report.active, 1);
        assert_eq!(report.schedule.mesh_jobs, 1);

        assert!(eventually(|| {
            volume.tick(viewpoint);
            volume.pending_jobs() == 0
        }));
        let chunk = volume.active()[0].clone();
        assert!(read_chunk(&chunk).updated);
        assert!(read_chunk(&chunk).geometry.is_some());

        // Moving away sweeps the chunk
        let far = Vec3::new(20.0, 4.0, 4.0);
        let report = volume.tick(far);
        assert_eq!(report.swept, 1);
        assert_eq!(scene.count(&SceneEvent::Detach(ChunkCoord::new(0, 0, 0))), 1);
    }

    #[test]
    fn test_path_query_runs_on_pool() {
        let mut volume = VolumeBuilder::new(VolumeConfig {
            region_chunks: 4,
            ..VolumeConfig::flat(16, layer::COUNT as u32)
        })
        .flavor(Arc::new(TileFlavor::default().with_blocking([9])))
        .build()
        .unwrap();
        volume.activate_chunk(ChunkCoord::new(0, 0, 0)).unwrap();
        for z in 0..=4 {
            volume.set_value(3, layer::SURFACE as i32, z, 9);
        }
        assert!(!volume.is_passable(3, 0, 0));

        let path = volume
            .get_path(IVec2::new(1, 2), IVec2::new(6, 2))
            .wait()
            .unwrap();
        assert_eq!(path.destination(), Some(IVec2::new(6, 2)));
        assert!(path.cells.iter().all(|c| volume.is_passable(c.x, 0, c.y)));
        assert!(path.cost > 50);

        let straight = volume
            .get_path(IVec2::new(8, 8), IVec2::new(13, 13))
            .wait()
            .unwrap();
        assert_eq!(straight.cost, 70);
    }
}
