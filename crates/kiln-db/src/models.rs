//! Row models for the queue tables.

use serde::{Deserialize, Serialize};

/// A queued build as selected from the `builds` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRow {
    pub id: i32,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub drv_path: String,
    pub max_silent: i32,
    pub timeout: i32,
    pub timestamp: i64,
    pub global_priority: i32,
    pub priority: i32,
}

/// Start/stop times of a historical build step, used to seed jobset
/// share accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepTiming {
    pub start_time: i64,
    pub stop_time: i64,
}

/// One output of a succeeded build, written to `build_outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProductRow {
    pub name: String,
    pub path: String,
}
