//! Per-tick rebuild scheduling for active chunks
//!
//! `schedule` walks the active set, refreshes distance and LOD, and hands
//! dirty chunks to the worker pool. Workers never touch the active set or
//! chunk flags: they send a [`PipelineResult`] over a channel, and
//! `apply_results` installs them on the main thread.
//!
//! A flag is cleared before its job is dispatched. A write that lands while
//! the job runs sets the flag again and the chunk is rebuilt once that job's
//! result has been applied. At most one mesh job and one object job per chunk
//! are in flight at any time, so results never arrive out of order.
//!
//! A job whose builder panics reports back as failed and its flag is set
//! again, so the chunk is retried on a later tick.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use glam::Vec3;
use tokio::sync::mpsc;

use crate::streaming::chunk::{SharedChunk, read_chunk, write_chunk};
use crate::streaming::coord::ChunkCoord;
use crate::streaming::external::{GeometryHandle, PhysicsFactory, SceneGraph, VisualHandle};
use crate::streaming::flavor::VolumeFlavor;
use crate::streaming::jobs::WorkerPool;
use crate::streaming::lod::{LodConfig, lod_from_distance};
use crate::streaming::objects::{AttachedObject, ObjectRegistry};
use crate::streaming::priority::ChunkPriority;

/// Finished worker output, applied on the main thread
pub enum PipelineResult {
    Mesh {
        chunk: SharedChunk,
        geometry: Option<GeometryHandle>,
    },
    Objects {
        chunk: SharedChunk,
        visuals: Vec<(u64, VisualHandle)>,
    },
    /// The mesh builder panicked
    MeshFailed { chunk: SharedChunk },
    /// An object factory panicked
    ObjectsFailed { chunk: SharedChunk },
}

/// What one `schedule` pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub mesh_jobs: usize,
    pub object_jobs: usize,
    /// Empty chunks marked up to date without a job
    pub skipped_empty: usize,
    /// Dirty chunks left alone because they are restricted
    pub restricted: usize,
    /// Dirty chunks waiting for their previous job to be applied
    pub in_flight: usize,
}

/// What one `apply_results` pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub meshes: usize,
    pub objects: usize,
    pub failed: usize,
}

pub struct UpdatePipeline {
    pool: Arc<WorkerPool>,
    flavor: Arc<dyn VolumeFlavor>,
    registry: Arc<ObjectRegistry>,
    lod: LodConfig,
    tx: mpsc::UnboundedSender<PipelineResult>,
    rx: mpsc::UnboundedReceiver<PipelineResult>,
    pending: usize,
    mesh_in_flight: HashSet<ChunkCoord>,
    objects_in_flight: HashSet<ChunkCoord>,
}

impl UpdatePipeline {
    pub fn new(
        pool: Arc<WorkerPool>,
        flavor: Arc<dyn VolumeFlavor>,
        registry: Arc<ObjectRegistry>,
        lod: LodConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool,
            flavor,
            registry,
            lod,
            tx,
            rx,
            pending: 0,
            mesh_in_flight: HashSet::new(),
            objects_in_flight: HashSet::new(),
        }
    }

    /// Jobs dispatched whose results have not been applied yet
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Refresh distance/LOD for every active chunk and dispatch rebuild jobs
    pub fn schedule(
        &mut self,
        active: &[SharedChunk],
        viewpoint: Vec3,
        dims: [usize; 3],
        flat: bool,
    ) -> ScheduleStats {
        let mut stats = ScheduleStats::default();

        for shared in active {
            let mut chunk = write_chunk(shared);
            let coord = chunk.coord();
            let distance = ChunkPriority::calculate(coord, viewpoint, dims, flat).distance;
            chunk.distance = distance;
            chunk.lod = lod_from_distance(&self.lod, distance);

            if chunk.needs_mesh_update {
                if chunk.restricted {
                    stats.restricted += 1;
                } else if self.mesh_in_flight.contains(&coord) {
                    stats.in_flight += 1;
                } else if chunk.empty {
                    chunk.needs_mesh_update = false;
                    stats.skipped_empty += 1;
                    if chunk.geometry.is_some() {
                        // Stale geometry has to come off through the scene
                        self.mesh_in_flight.insert(coord);
                        self.pending += 1;
                        let _ = self.tx.send(PipelineResult::Mesh {
                            chunk: Arc::clone(shared),
                            geometry: None,
                        });
                    } else {
                        chunk.updated = true;
                    }
                } else {
                    chunk.needs_mesh_update = false;
                    let snapshot = chunk.snapshot();
                    log::trace!("Dispatching mesh build for chunk {}", coord);

                    let flavor = Arc::clone(&self.flavor);
                    let tx = self.tx.clone();
                    let target = Arc::clone(shared);
                    self.pool.spawn_detached(move || {
                        let built =
                            panic::catch_unwind(AssertUnwindSafe(|| flavor.build_mesh(&snapshot)));
                        let _ = tx.send(match built {
                            Ok(geometry) => PipelineResult::Mesh {
                                chunk: target,
                                geometry,
                            },
                            Err(_) => PipelineResult::MeshFailed { chunk: target },
                        });
                    });
                    self.mesh_in_flight.insert(coord);
                    self.pending += 1;
                    stats.mesh_jobs += 1;
                }
            }

            if chunk.needs_object_update {
                if self.objects_in_flight.contains(&coord) {
                    stats.in_flight += 1;
                    continue;
                }
                chunk.needs_object_update = false;
                let uninitialized: Vec<AttachedObject> = chunk
                    .objects()
                    .iter()
                    .filter(|o| !o.is_initialized())
                    .cloned()
                    .collect();
                if uninitialized.is_empty() {
                    continue;
                }

                let registry = Arc::clone(&self.registry);
                let tx = self.tx.clone();
                let target = Arc::clone(shared);
                self.pool.spawn_detached(move || {
                    let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
                        uninitialized
                            .iter()
                            .filter_map(|o| registry.prepare(o).map(|v| (o.id, v)))
                            .collect::<Vec<_>>()
                    }));
                    let _ = tx.send(match prepared {
                        Ok(visuals) => PipelineResult::Objects {
                            chunk: target,
                            visuals,
                        },
                        Err(_) => PipelineResult::ObjectsFailed { chunk: target },
                    });
                });
                self.objects_in_flight.insert(coord);
                self.pending += 1;
                stats.object_jobs += 1;
            }
        }

        if stats.mesh_jobs + stats.object_jobs > 0 {
            log::debug!(
                "Scheduled {} mesh and {} object jobs ({} in flight)",
                stats.mesh_jobs,
                stats.object_jobs,
                self.pending
            );
        }
        stats
    }

    /// Install every finished result. Main thread only.
    ///
    /// Results for chunks deactivated since dispatch are still applied.
    pub fn apply_results(
        &mut self,
        scene: &dyn SceneGraph,
        physics: Option<&dyn PhysicsFactory>,
    ) -> ApplyStats {
        let mut stats = ApplyStats::default();

        while let Ok(result) = self.rx.try_recv() {
            self.pending = self.pending.saturating_sub(1);
            match result {
                PipelineResult::Mesh { chunk, geometry } => {
                    let mut chunk = write_chunk(&chunk);
                    self.mesh_in_flight.remove(&chunk.coord());
                    chunk.geometry = geometry;
                    // A write during the build leaves the chunk stale
                    chunk.updated = !chunk.needs_mesh_update;
                    if let Some(physics) = physics {
                        chunk.shape = physics.collision_shape(&chunk);
                    }
                    if chunk.active {
                        scene.refresh(&chunk);
                    }
                    stats.meshes += 1;
                }
                PipelineResult::Objects { chunk, visuals } => {
                    let mut chunk = write_chunk(&chunk);
                    let coord = chunk.coord();
                    self.objects_in_flight.remove(&coord);
                    let active = chunk.active;
                    for (id, visual) in visuals {
                        // Object may have been detached while the job ran
                        let Some(object) = chunk.objects_mut().iter_mut().find(|o| o.id == id)
                        else {
                            continue;
                        };
                        if object.visual.is_some() {
                            continue;
                        }
                        object.visual = Some(visual);
                        if active {
                            scene.attach_object(coord, id, visual);
                        }
                        stats.objects += 1;
                    }
                }
                PipelineResult::MeshFailed { chunk } => {
                    let mut chunk = write_chunk(&chunk);
                    let coord = chunk.coord();
                    self.mesh_in_flight.remove(&coord);
                    log::error!("Mesh build for chunk {} panicked; retrying next tick", coord);
                    chunk.mark_dirty();
                    stats.failed += 1;
                }
                PipelineResult::ObjectsFailed { chunk } => {
                    let mut chunk = write_chunk(&chunk);
                    let coord = chunk.coord();
                    self.objects_in_flight.remove(&coord);
                    log::error!("Object preparation for chunk {} panicked; retrying next tick", coord);
                    chunk.needs_object_update = true;
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    /// Whether any chunk in `active` still awaits a rebuild
    pub fn is_settled(&self, active: &[SharedChunk]) -> bool {
        self.pending == 0
            && active.iter().all(|c| {
                let chunk = read_chunk(c);
                chunk.restricted || !chunk.needs_mesh_update
            })
    }
}
