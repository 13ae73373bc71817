//! Strata - chunked world streaming with persistent regions

pub mod core;
pub mod streaming;
