//! Core domain types for the kiln build orchestrator.
//!
//! This crate contains:
//! - Build identifiers
//! - Content-addressed store paths
//! - Build status codes shared between the queue core and the database layer

pub mod id;
pub mod path;
pub mod status;

pub use id::BuildId;
pub use path::StorePath;
pub use status::{BuildStatus, BuildStepStatus};
