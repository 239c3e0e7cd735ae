//! Derivation store access for kiln.
//!
//! The queue core consumes the store through the [`Store`] trait: path
//! validity checks and derivation reads. [`CliStore`] backs the trait with
//! the local `nix` command line for the daemon; tests supply their own
//! in-memory implementations.

pub mod cli;
pub mod derivation;
pub mod error;
pub mod output;
pub mod store;

pub use cli::CliStore;
pub use derivation::{Derivation, DerivationOutput};
pub use error::{StoreError, StoreResult};
pub use output::{get_build_output, BuildOutput, BuildProduct};
pub use store::Store;
