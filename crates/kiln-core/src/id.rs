//! Build identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Database-assigned id of a queued build.
///
/// Ids are handed out by the queue's serial column, so ordering by id is
/// ordering by queue-insertion time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display,
)]
#[display("{_0}")]
pub struct BuildId(i32);

impl BuildId {
    /// Sentinel larger than any real build id.
    pub const MAX: BuildId = BuildId(i32::MAX);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<i32> for BuildId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl From<BuildId> for i32 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}
