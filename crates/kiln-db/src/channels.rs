//! Notification channels raised by the web frontend and listened to by the
//! queue monitor.

pub const BUILDS_ADDED: &str = "builds_added";
pub const BUILDS_RESTARTED: &str = "builds_restarted";
pub const BUILDS_CANCELLED: &str = "builds_cancelled";
pub const BUILDS_DELETED: &str = "builds_deleted";
pub const BUILDS_BUMPED: &str = "builds_bumped";

/// Every channel the queue monitor subscribes to.
pub const ALL: [&str; 5] = [
    BUILDS_ADDED,
    BUILDS_RESTARTED,
    BUILDS_CANCELLED,
    BUILDS_DELETED,
    BUILDS_BUMPED,
];
