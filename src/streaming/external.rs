//! Narrow interfaces to the systems the streaming engine drives but does not own
//!
//! Rendering, physics, scene attachment and terrain generation live outside this
//! crate. The engine talks to them only through these traits and the opaque
//! handles they hand back.

use crate::streaming::chunk::{ChunkData, ChunkSnapshot};
use crate::streaming::coord::ChunkCoord;
use crate::streaming::region::Region;

/// Opaque render geometry produced by a [`MeshBuilder`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryHandle(pub u64);

/// Opaque collision shape produced by a [`PhysicsFactory`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeHandle(pub u64);

/// Opaque presentation object for an attached object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VisualHandle(pub u64);

/// Builds render geometry from a chunk snapshot.
///
/// Called on worker threads. Must not touch chunk state.
pub trait MeshBuilder: Send + Sync {
    fn build_mesh(&self, snapshot: &ChunkSnapshot) -> Option<GeometryHandle>;
}

/// Mesh builder that never produces geometry
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMeshBuilder;

impl MeshBuilder for NullMeshBuilder {
    fn build_mesh(&self, _snapshot: &ChunkSnapshot) -> Option<GeometryHandle> {
        None
    }
}

/// Derives collision proxies. Main thread only, after geometry is installed.
pub trait PhysicsFactory: Send + Sync {
    fn collision_shape(&self, chunk: &ChunkData) -> Option<ShapeHandle>;
}

/// The live scene chunks are attached to while active
///
/// All methods are invoked on the main thread.
pub trait SceneGraph: Send + Sync {
    /// A chunk entered the active set
    fn attach(&self, chunk: &ChunkData);

    /// A chunk left the active set
    fn detach(&self, chunk: &ChunkData);

    /// New geometry was installed on an attached chunk
    fn refresh(&self, _chunk: &ChunkData) {}

    fn attach_object(&self, _chunk: ChunkCoord, _object_id: u64, _visual: VisualHandle) {}

    fn detach_object(&self, _chunk: ChunkCoord, _object_id: u64) {}
}

/// Scene that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScene;

impl SceneGraph for NullScene {
    fn attach(&self, _chunk: &ChunkData) {}
    fn detach(&self, _chunk: &ChunkData) {}
}

/// Populates a freshly created chunk that was not found in its region archive.
///
/// Implementations must leave `loaded = true` on completion; the volume
/// enforces this if they forget.
pub trait Generator: Send + Sync {
    fn generate(&self, chunk: &mut ChunkData, region: &Region);
}

/// Context handed to [`ActivationHook::before_activate`]
pub struct ActivationContext<'a> {
    /// The chunk was generated this session rather than loaded or reactivated
    pub first_visit: bool,
    /// Region owning the chunk (object ids come from here)
    pub region: &'a Region,
}

/// Extension point run just before a chunk joins the active set
pub trait ActivationHook: Send + Sync {
    fn before_activate(&self, chunk: &mut ChunkData, ctx: &ActivationContext<'_>);
}
