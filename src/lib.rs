//! This crate provides a streaming reduction engine for very large
//! pixelated scanning-detector datasets: 4D-STEM scans and similar
//! multidimensional detector data that are far too large to fit in memory.
//! A dataset is split into independently-readable partitions, each
//! partition is streamed as a sequence of smaller tiles, and a reduction
//! (frame summation or linear mask projection) folds the tiles into
//! partial results that merge incrementally into a caller-owned buffer,
//! potentially across a pool of workers. Partial results arrive as they
//! complete, so a UI can display the result progressively.
//!
//! The engine is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, drives
//!   dispatch and the partial-result streams.
//! * [Rayon](rayon) executes the CPU-bound per-partition reductions.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional
//!   arrays used in numerical computation.
//! * [Serde](serde) performs (de)serialisation of the geometry types.
//!
//! Concrete file formats plug in behind the
//! [DatasetReader](crate::reader::DatasetReader) capability; distributed
//! execution substrates plug in behind
//! [JobExecutor](crate::executor::JobExecutor).

pub mod blo;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod job;
pub mod jobs;
pub mod masks;
pub mod partition;
pub mod raw;
pub mod reader;
pub mod resource_manager;
pub mod result;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
