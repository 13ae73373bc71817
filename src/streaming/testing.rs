//! Test doubles for the external collaborators

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::streaming::chunk::{ChunkData, ChunkSnapshot};
use crate::streaming::coord::ChunkCoord;
use crate::streaming::external::{
    GeometryHandle, MeshBuilder, PhysicsFactory, SceneGraph, ShapeHandle, VisualHandle,
};

/// Scene that records every notification
#[derive(Default)]
pub struct RecordingScene {
    pub events: Mutex<Vec<SceneEvent>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SceneEvent {
    Attach(ChunkCoord),
    Detach(ChunkCoord),
    Refresh(ChunkCoord),
    AttachObject(ChunkCoord, u64, VisualHandle),
    DetachObject(ChunkCoord, u64),
}

impl RecordingScene {
    pub fn events(&self) -> Vec<SceneEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, event: &SceneEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn push(&self, event: SceneEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl SceneGraph for RecordingScene {
    fn attach(&self, chunk: &ChunkData) {
        self.push(SceneEvent::Attach(chunk.coord()));
    }

    fn detach(&self, chunk: &ChunkData) {
        self.push(SceneEvent::Detach(chunk.coord()));
    }

    fn refresh(&self, chunk: &ChunkData) {
        self.push(SceneEvent::Refresh(chunk.coord()));
    }

    fn attach_object(&self, chunk: ChunkCoord, object_id: u64, visual: VisualHandle) {
        self.push(SceneEvent::AttachObject(chunk, object_id, visual));
    }

    fn detach_object(&self, chunk: ChunkCoord, object_id: u64) {
        self.push(SceneEvent::DetachObject(chunk, object_id));
    }
}

/// Mesher that hands out sequential geometry handles for non-empty snapshots
#[derive(Default)]
pub struct CountingMesher {
    pub builds: AtomicUsize,
    next: AtomicU64,
}

impl MeshBuilder for CountingMesher {
    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if snapshot.is_empty() {
            return None;
        }
        Some(GeometryHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// Mesher that blocks until the test releases it
pub struct GatedMesher {
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl GatedMesher {
    pub fn new() -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { gate: Mutex::new(rx) }, tx)
    }
}

impl MeshBuilder for GatedMesher {
    fn build_mesh(&self, _snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        let _ = self.gate.lock().unwrap_or_else(PoisonError::into_inner).recv();
        Some(GeometryHandle(99))
    }
}

/// Physics factory returning one shape per call
#[derive(Default)]
pub struct CountingPhysics {
    pub shapes: AtomicU64,
}

impl PhysicsFactory for CountingPhysics {
    fn collision_shape(&self, _chunk: &ChunkData) -> Option<ShapeHandle> {
        Some(ShapeHandle(self.shapes.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// Poll `done` until it holds or a few seconds pass
pub fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}
