//! Content-addressed store paths.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Path of a store object: a derivation or one of its outputs.
///
/// Store paths are content-addressed, so two derivations with the same path
/// are the same derivation. The queue core relies on this for step
/// deduplication.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for StorePath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl From<&str> for StorePath {
    fn from(path: &str) -> Self {
        Self(path.to_owned())
    }
}

impl AsRef<str> for StorePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
