//! Durable stores for jobs and chunks.
//!
//! Each store owns its collection exclusively: jobs are mutated only
//! through guarded transitions and atomic counter increments, chunks
//! only by the worker holding their lease.

pub mod chunks;
pub mod jobs;

pub use chunks::{ChunkStore, ChunkStoreError};
pub use jobs::{ChunkCounts, JobStore, JobStoreError, NewJob};
