//! Queue-monitor error types.

use kiln_core::BuildId;
use kiln_db::DbError;
use kiln_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("notification listener error: {0}")]
    Listener(#[from] sqlx::Error),

    #[error("while loading build {id}: {source}")]
    LoadBuild {
        id: BuildId,
        #[source]
        source: Box<QueueError>,
    },

    // A queued build always has a jobset row; its absence means the queue
    // and the jobsets table disagree.
    #[error("missing jobset {project}:{name} - can't happen")]
    MissingJobset { project: String, name: String },

    #[error("invalid machines file: {0}")]
    Machines(String),
}

impl QueueError {
    /// Wrap an error with the id of the build whose loading failed.
    pub fn while_loading(id: BuildId, source: QueueError) -> Self {
        QueueError::LoadBuild {
            id,
            source: Box::new(source),
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
