//! Intake Engine Library
//!
//! Bulk upload job processing engine: ingests large tabular files
//! (invoice/order extracts, potentially millions of rows) into a
//! downstream store with at-most-once row processing under concurrent
//! retries.
//!
//! # Architecture
//!
//! A submitted file becomes an [`models::UploadJob`]. The planner splits
//! it into fixed-size chunks, each wrapped in a lease-based
//! [`queue::WorkQueue`] entry. Independent workers claim entries with a
//! time-boxed lease (crash recovery comes from lease expiry, not from
//! any central scheduler), run the chunk processor over the chunk's
//! rows, and report per-severity counts back to the job store. The
//! deduplication index is the sole arbiter of "first writer wins" for
//! repeated rows; every state transition is mirrored into the
//! append-only audit log.
//!
//! Business interpretation of a row is external: callers supply a
//! [`processor::RowProcessor`] implementation and the engine stays
//! agnostic to row content.
//!
//! # Example
//!
//! ```no_run
//! use intake_engine::config::EngineConfig;
//! use intake_engine::engine::{Engine, SubmitRequest};
//! use intake_engine::models::UploadStrategy;
//!
//! # async fn run(engine: Engine) -> anyhow::Result<()> {
//! let job_id = engine
//!     .submit(SubmitRequest {
//!         file_name: "invoices_2024.csv".into(),
//!         file_size_bytes: 1_048_576,
//!         strategy: UploadStrategy::Parallel,
//!         priority: 5,
//!         max_retries: 2,
//!     })
//!     .await?;
//! let snapshot = engine.status(&job_id).await?;
//! tracing::info!(job_id = %job_id, status = %snapshot.status, "submitted");
//! # Ok(())
//! # }
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod audit;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod ledger;
pub mod models;
pub mod planner;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use engine::{Engine, EngineError, SubmitError, SubmitRequest};
pub use models::{JobSnapshot, JobStatus, UploadStrategy};
pub use processor::{RowError, RowProcessor, RowSource};
