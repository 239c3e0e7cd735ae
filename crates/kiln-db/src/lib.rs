//! Database layer for kiln.
//!
//! Provides the queue repository trait and its PostgreSQL implementation,
//! plus the notification channel names the queue monitor subscribes to.

pub mod channels;
pub mod error;
pub mod models;
pub mod repo;

pub use error::{DbError, DbResult};
pub use models::{BuildProductRow, BuildRow, StepTiming};
pub use repo::{PgQueueRepo, QueueRepo};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}
