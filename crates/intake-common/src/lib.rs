//! Intake Common Library
//!
//! Shared types, utilities, and error handling for the Intake project.
//!
//! # Overview
//!
//! This crate provides common functionality used across all Intake workspace
//! members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Hashing**: Content fingerprinting for files and rows
//! - **Logging**: Structured logging configuration and initialization
//!
//! # Example
//!
//! ```no_run
//! use intake_common::{Result, IntakeError};
//! use intake_common::hash::hash_file;
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let mut file = std::fs::File::open(path)?;
//!     let hash = hash_file(&mut file)?;
//!     tracing::info!(%hash, "file fingerprinted");
//!     Ok(())
//! }
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod hash;
pub mod logging;

// Re-export commonly used types
pub use error::{IntakeError, Result};
pub use hash::{FileHash, RowHash};
