//! Queue repository: the database operations the queue monitor issues.

use async_trait::async_trait;
use kiln_core::{BuildId, BuildStatus, BuildStepStatus};
use sqlx::PgPool;

use crate::{BuildProductRow, BuildRow, DbResult, StepTiming};

/// Database surface of the queue monitor.
///
/// Every completion write keeps an `AND NOT finished` predicate so a
/// concurrent writer marking the build finished first wins and the
/// monitor's write becomes a no-op.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Unfinished builds with `id > last`, highest global priority first,
    /// oldest first within a priority.
    async fn queued_builds_after(&self, last: BuildId) -> DbResult<Vec<BuildRow>>;

    /// `(id, global_priority)` of every unfinished build.
    async fn unfinished_builds(&self) -> DbResult<Vec<(BuildId, i32)>>;

    /// Scheduling shares of a jobset, or `None` if the row is missing.
    async fn jobset_shares(&self, project: &str, jobset: &str) -> DbResult<Option<i32>>;

    /// Step timings of a jobset's builds with `stop_time > since`.
    async fn recent_jobset_steps(
        &self,
        project: &str,
        jobset: &str,
        since: i64,
    ) -> DbResult<Vec<StepTiming>>;

    /// Whether any of `paths` has a recorded failure.
    async fn has_failed_path(&self, paths: &[String]) -> DbResult<bool>;

    /// Mark a build aborted before it ever ran (e.g. its derivation was
    /// garbage-collected).
    async fn abort_build(&self, id: BuildId, now: i64, error_msg: &str) -> DbResult<()>;

    /// Record a pre-flight failure: one build step plus the final build row,
    /// in a single transaction.
    async fn finish_build_with_step(
        &self,
        id: BuildId,
        drv_path: &str,
        build_status: BuildStatus,
        step_status: BuildStepStatus,
        now: i64,
        is_cached: bool,
    ) -> DbResult<()>;

    /// Record a successful completion along with its outputs.
    async fn succeed_build(
        &self,
        id: BuildId,
        products: &[BuildProductRow],
        release_name: Option<&str>,
        is_cached: bool,
        start_time: i64,
        stop_time: i64,
    ) -> DbResult<()>;
}

/// PostgreSQL implementation of [`QueueRepo`].
pub struct PgQueueRepo {
    pool: PgPool,
}

impl PgQueueRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueRepo for PgQueueRepo {
    async fn queued_builds_after(&self, last: BuildId) -> DbResult<Vec<BuildRow>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT id, project, jobset, job, drv_path, max_silent, timeout,
                   timestamp, global_priority, priority
            FROM builds
            WHERE id > $1 AND NOT finished
            ORDER BY global_priority DESC, id
            "#,
        )
        .bind(last.as_i32())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn unfinished_builds(&self) -> DbResult<Vec<(BuildId, i32)>> {
        let rows = sqlx::query_as::<_, (i32, i32)>(
            "SELECT id, global_priority FROM builds WHERE NOT finished",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, priority)| (BuildId::from(id), priority))
            .collect())
    }

    async fn jobset_shares(&self, project: &str, jobset: &str) -> DbResult<Option<i32>> {
        let shares = sqlx::query_scalar::<_, i32>(
            "SELECT scheduling_shares FROM jobsets WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(jobset)
        .fetch_optional(&self.pool)
        .await?;
        Ok(shares)
    }

    async fn recent_jobset_steps(
        &self,
        project: &str,
        jobset: &str,
        since: i64,
    ) -> DbResult<Vec<StepTiming>> {
        let rows = sqlx::query_as::<_, StepTiming>(
            r#"
            SELECT s.start_time, s.stop_time
            FROM build_steps s JOIN builds b ON s.build = b.id
            WHERE s.start_time IS NOT NULL AND s.stop_time > $1
              AND b.project = $2 AND b.jobset = $3
            "#,
        )
        .bind(since)
        .bind(project)
        .bind(jobset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn has_failed_path(&self, paths: &[String]) -> DbResult<bool> {
        let failed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM failed_paths WHERE path = ANY($1))",
        )
        .bind(paths)
        .fetch_one(&self.pool)
        .await?;
        Ok(failed)
    }

    async fn abort_build(&self, id: BuildId, now: i64, error_msg: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE builds
            SET finished = TRUE, busy = FALSE, build_status = $2,
                start_time = $3, stop_time = $3, error_msg = $4
            WHERE id = $1 AND NOT finished
            "#,
        )
        .bind(id.as_i32())
        .bind(BuildStatus::Aborted.code())
        .bind(now)
        .bind(error_msg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_build_with_step(
        &self,
        id: BuildId,
        drv_path: &str,
        build_status: BuildStatus,
        step_status: BuildStepStatus,
        now: i64,
        is_cached: bool,
    ) -> DbResult<()> {
        let mut txn = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO build_steps (build, step_nr, drv_path, busy, status,
                                     start_time, stop_time, machine)
            VALUES ($1, 0, $2, FALSE, $3, $4, $4, '')
            "#,
        )
        .bind(id.as_i32())
        .bind(drv_path)
        .bind(step_status.code())
        .bind(now)
        .execute(&mut *txn)
        .await?;
        sqlx::query(
            r#"
            UPDATE builds
            SET finished = TRUE, busy = FALSE, build_status = $2,
                start_time = $3, stop_time = $3, is_cached_build = $4
            WHERE id = $1 AND NOT finished
            "#,
        )
        .bind(id.as_i32())
        .bind(build_status.code())
        .bind(now)
        .bind(is_cached)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn succeed_build(
        &self,
        id: BuildId,
        products: &[BuildProductRow],
        release_name: Option<&str>,
        is_cached: bool,
        start_time: i64,
        stop_time: i64,
    ) -> DbResult<()> {
        let mut txn = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE builds
            SET finished = TRUE, busy = FALSE, build_status = $2,
                start_time = $3, stop_time = $4, is_cached_build = $5,
                release_name = $6
            WHERE id = $1 AND NOT finished
            "#,
        )
        .bind(id.as_i32())
        .bind(BuildStatus::Success.code())
        .bind(start_time)
        .bind(stop_time)
        .bind(is_cached)
        .bind(release_name)
        .execute(&mut *txn)
        .await?;
        sqlx::query("DELETE FROM build_outputs WHERE build = $1")
            .bind(id.as_i32())
            .execute(&mut *txn)
            .await?;
        for product in products {
            sqlx::query("INSERT INTO build_outputs (build, name, path) VALUES ($1, $2, $3)")
                .bind(id.as_i32())
                .bind(&product.name)
                .bind(&product.path)
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }
}
