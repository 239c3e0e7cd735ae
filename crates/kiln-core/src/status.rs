//! Status codes recorded in the database when a build or step completes.

use serde::{Deserialize, Serialize};

/// Final status of a build, written to the `builds` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Success,
    Failed,
    /// A dependency of the requested derivation failed.
    DepFailed,
    Aborted,
    /// Failed without running because a previous failure for one of the
    /// step's outputs is on record.
    CachedFailure,
    /// No build machine can run the step.
    Unsupported,
}

impl BuildStatus {
    /// Numeric code stored in the `build_status` column.
    pub const fn code(self) -> i32 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::Failed => 1,
            BuildStatus::DepFailed => 2,
            BuildStatus::Aborted => 3,
            BuildStatus::CachedFailure => 8,
            BuildStatus::Unsupported => 9,
        }
    }
}

impl From<BuildStatus> for i32 {
    fn from(status: BuildStatus) -> Self {
        status.code()
    }
}

/// Status of an individual build step, written to the `build_steps` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStepStatus {
    Success,
    Failed,
    Unsupported,
}

impl BuildStepStatus {
    pub const fn code(self) -> i32 {
        match self {
            BuildStepStatus::Success => 0,
            BuildStepStatus::Failed => 1,
            BuildStepStatus::Unsupported => 9,
        }
    }
}

impl From<BuildStepStatus> for i32 {
    fn from(status: BuildStepStatus) -> Self {
        status.code()
    }
}
