//! The store interface consumed by the queue core.

use async_trait::async_trait;
use kiln_core::StorePath;

use crate::{Derivation, StoreResult};

/// Read access to the derivation store.
///
/// The queue monitor only ever asks two questions of the store: does a path
/// exist, and what does a derivation say. Everything else (building,
/// substitution, garbage collection) belongs to the workers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether `path` currently exists in the store.
    async fn is_valid_path(&self, path: &StorePath) -> StoreResult<bool>;

    /// Read and parse the derivation at `path`.
    async fn read_derivation(&self, path: &StorePath) -> StoreResult<Derivation>;
}
