//! Error types for the streaming engine

use thiserror::Error;

use crate::streaming::coord::ChunkCoord;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk codec error: {0}")]
    Codec(String),

    #[error("Region archive error: {0}")]
    Archive(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Chunk dimension error: {0}")]
    Dimensions(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Job was dropped before producing a result")]
    JobAborted,

    #[error("Object address space exhausted in chunk {0}")]
    AddressSpace(ChunkCoord),
}
