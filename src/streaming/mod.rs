//! Chunk streaming: persistence, activation, background rebuilds and pathfinding

pub mod coord;
pub mod chunk;
pub mod objects;
pub mod external;
pub mod codec;
pub mod archive;
pub mod region;
pub mod lod;
pub mod priority;
pub mod jobs;
pub mod flavor;
pub mod pipeline;
pub mod path;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use coord::{ChunkCoord, RegionCoord};
pub use chunk::{ChunkData, ChunkSnapshot, SharedChunk, NO_DATA, layer, read_chunk, write_chunk};
pub use objects::{AttachedObject, ObjectFactory, ObjectRegistry};
pub use external::{
    ActivationContext, ActivationHook, Generator, GeometryHandle, MeshBuilder, NullMeshBuilder,
    NullScene, PhysicsFactory, SceneGraph, ShapeHandle, VisualHandle,
};
pub use codec::{compress_chunk, decompress_chunk, decode_chunk, encode_chunk};
pub use archive::RegionArchive;
pub use region::Region;
pub use lod::{LodConfig, lod_from_distance, LOD_DISTANCES, MAX_LOD};
pub use priority::{ActivationQueue, ChunkPriority};
pub use jobs::{JobHandle, WorkerPool};
pub use flavor::{TileFlavor, VolumeFlavor, VoxelFlavor};
pub use pipeline::{ApplyStats, PipelineResult, ScheduleStats, UpdatePipeline};
pub use path::{Path, PathGrid, PathNode, find_path};
pub use volume::{RegionGrid, TickReport, Volume, VolumeBuilder, VolumeSampler};
