//! The queue monitor: loading queued builds and reacting to queue changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use kiln_core::{BuildId, BuildStatus, BuildStepStatus, StorePath};
use kiln_db::{channels, BuildProductRow, PgQueueRepo, QueueRepo};
use kiln_store::{get_build_output, Store};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::build::Build;
use crate::error::{QueueError, QueueResult};
use crate::jobset::Jobset;
use crate::state::State;
use crate::step::Step;

/// Builds fetched by one queue scan, indexed for the expansion phase.
#[derive(Default)]
struct NewBuilds {
    /// Processing order: highest global priority first, oldest first within
    /// a priority (the fetch query's order).
    ids: Vec<BuildId>,
    by_id: HashMap<BuildId, Arc<Build>>,
    /// Top-level derivation path -> queued builds requesting it. Several
    /// builds can share one derivation.
    by_path: HashMap<StorePath, Vec<BuildId>>,
}

impl State {
    /// Run the queue monitor until the process exits. A failed loop
    /// iteration is logged and retried after a pause (usually a database
    /// problem); no in-memory state is discarded.
    pub async fn run(&self, pool: PgPool, store: Arc<dyn Store>) {
        loop {
            if let Err(err) = self.monitor_loop(&pool, store.as_ref()).await {
                error!(error = %err, "queue monitor failed, retrying in 10s");
                sleep(Duration::from_secs(10)).await;
            }
        }
    }

    async fn monitor_loop(&self, pool: &PgPool, store: &dyn Store) -> QueueResult<()> {
        let repo = PgQueueRepo::new(pool.clone());

        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(channels::ALL).await?;

        let mut last_build_id = BuildId::default();

        loop {
            self.get_queued_builds(&repo, store, &mut last_build_id)
                .await?;

            // Sleep until the frontend notifies us about a queue event.
            let notification = listener.recv().await?;
            self.nr_queue_wakeups.fetch_add(1, Ordering::Relaxed);

            let mut seen = vec![notification.channel().to_owned()];
            // Drain whatever else is already buffered so one scan covers
            // the whole batch.
            while let Some(Ok(Some(next))) = listener.try_recv().now_or_never() {
                seen.push(next.channel().to_owned());
            }

            let mut queue_changed = false;
            for channel in &seen {
                match channel.as_str() {
                    channels::BUILDS_ADDED => {
                        debug!("got notification: new builds added to the queue");
                    }
                    channels::BUILDS_RESTARTED => {
                        debug!("got notification: builds restarted");
                        // Finished builds may be unfinished again; rescan
                        // the whole queue.
                        last_build_id = BuildId::default();
                    }
                    channels::BUILDS_CANCELLED
                    | channels::BUILDS_DELETED
                    | channels::BUILDS_BUMPED => {
                        queue_changed = true;
                    }
                    other => debug!(channel = other, "ignoring unexpected notification"),
                }
            }

            if queue_changed {
                debug!("got notification: builds cancelled or bumped");
                self.process_queue_change(&repo).await?;
            }
        }
    }

    /// Load every unfinished build with an id above `last_build_id`,
    /// expand each into build steps, and publish the steps that are
    /// immediately runnable.
    pub async fn get_queued_builds(
        &self,
        repo: &dyn QueueRepo,
        store: &dyn Store,
        last_build_id: &mut BuildId,
    ) -> QueueResult<()> {
        info!(after = %last_build_id, "checking the queue for builds");

        // Fetch phase: materialise the rows, but don't touch the store yet.
        let rows = repo.queued_builds_after(*last_build_id).await?;

        let mut new = NewBuilds::default();
        for row in rows {
            let id = BuildId::from(row.id);
            if id > *last_build_id {
                *last_build_id = id;
            }
            if self.config.build_one.is_some_and(|one| one != id) {
                continue;
            }
            if self.builds.lock().contains_key(&id) {
                continue;
            }

            let jobset = self.create_jobset(repo, &row.project, &row.jobset).await?;
            let build = Arc::new(Build::new(row, jobset));

            new.ids.push(id);
            new.by_path
                .entry(build.drv_path.clone())
                .or_default()
                .push(id);
            new.by_id.insert(id, build);
        }

        // Expansion phase. Runnable steps are published per build, so the
        // workers can already start while later builds are still loading.
        let ids = std::mem::take(&mut new.ids);
        let mut new_runnable = Vec::new();
        for id in ids {
            let Some(build) = new.by_id.get(&id).cloned() else {
                // Already handled through sibling co-expansion below.
                continue;
            };

            new_runnable.clear();
            let mut nr_added = 0usize;
            self.create_build(
                repo,
                store,
                build.clone(),
                &mut new,
                &mut new_runnable,
                &mut nr_added,
            )
            .await
            .map_err(|err| QueueError::while_loading(build.id, err))?;

            debug!(
                new_runnable = new_runnable.len(),
                new_builds = nr_added,
                "expanded queued builds"
            );
            for step in &new_runnable {
                self.make_runnable(step);
            }
            self.nr_builds_read.fetch_add(nr_added as u64, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Expand one fetched build: validate its derivation, create its step
    /// graph, co-expand batch siblings that own one of the new steps, and
    /// either register the build or complete it in the database right away.
    fn create_build<'a>(
        &'a self,
        repo: &'a dyn QueueRepo,
        store: &'a dyn Store,
        build: Arc<Build>,
        new: &'a mut NewBuilds,
        new_runnable: &'a mut Vec<Arc<Step>>,
        nr_added: &'a mut usize,
    ) -> BoxFuture<'a, QueueResult<()>> {
        async move {
            debug!(build_id = %build.id, job = %build.full_job_name(), "loading build");
            *nr_added += 1;
            // Taken out up front so sibling co-expansion can't re-enter us.
            new.by_id.remove(&build.id);

            if !store.is_valid_path(&build.drv_path).await? {
                // The derivation was garbage-collected before we got here.
                error!(build_id = %build.id, "aborting GC'ed build");
                if !build.finished_in_db() {
                    let now = Utc::now().timestamp();
                    repo.abort_build(
                        build.id,
                        now,
                        "derivation was garbage-collected prior to build",
                    )
                    .await?;
                    build.set_finished_in_db(true);
                    self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }

            let mut finished_drvs = HashSet::new();
            let mut new_steps = Vec::new();
            let toplevel = self
                .create_step(
                    store,
                    build.drv_path.clone(),
                    Some(build.clone()),
                    None,
                    &mut finished_drvs,
                    &mut new_steps,
                    &mut *new_runnable,
                )
                .await?;

            // Some of the new steps may be the top level of builds we
            // haven't processed yet. Load those now: when build A depends
            // on build B's derivation, B must be accounted to the shared
            // step before A's pre-flight examines it.
            for step in &new_steps {
                let waiting: Vec<BuildId> = match new.by_path.get(step.drv_path()) {
                    Some(ids) => ids.clone(),
                    None => continue,
                };
                for id in waiting {
                    let Some(other) = new.by_id.get(&id).cloned() else {
                        continue;
                    };
                    self.create_build(
                        repo,
                        store,
                        other,
                        &mut *new,
                        &mut *new_runnable,
                        &mut *nr_added,
                    )
                    .await?;
                }
            }

            // No step at all means every output is already valid: record a
            // finished, cached build.
            let Some(toplevel) = toplevel else {
                let drv = store.read_derivation(&build.drv_path).await?;
                let output = get_build_output(store, &drv).await?;
                let products: Vec<BuildProductRow> = output
                    .products
                    .iter()
                    .map(|p| BuildProductRow {
                        name: p.name.clone(),
                        path: p.path.to_string(),
                    })
                    .collect();
                let now = Utc::now().timestamp();
                repo.succeed_build(
                    build.id,
                    &products,
                    output.release_name.as_deref(),
                    true,
                    now,
                    now,
                )
                .await?;
                build.set_finished_in_db(true);
                self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };

            // Pre-flight: a step with a recorded failure or no capable
            // machine completes the build right away, unpublished.
            for step in &new_steps {
                let mut build_status = BuildStatus::Success;
                let mut step_status = BuildStepStatus::Failed;

                if self.check_cached_failure(repo, step).await? {
                    error!(
                        build_id = %build.id,
                        drv = %step.drv_path(),
                        "marking build as cached failure"
                    );
                    build_status = if Arc::ptr_eq(step, &toplevel) {
                        BuildStatus::Failed
                    } else {
                        BuildStatus::DepFailed
                    };
                    step_status = BuildStepStatus::Failed;
                }

                if build_status == BuildStatus::Success && !self.supports_step(step) {
                    error!(
                        build_id = %build.id,
                        drv = %step.drv_path(),
                        platform = step.platform().unwrap_or_default(),
                        "aborting unsupported build"
                    );
                    build_status = BuildStatus::Unsupported;
                    step_status = BuildStepStatus::Unsupported;
                }

                if build_status != BuildStatus::Success {
                    if !build.finished_in_db() {
                        let now = Utc::now().timestamp();
                        repo.finish_build_with_step(
                            build.id,
                            step.drv_path().as_str(),
                            build_status,
                            step_status,
                            now,
                            build_status != BuildStatus::Unsupported,
                        )
                        .await?;
                        build.set_finished_in_db(true);
                        self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
            }

            // Register the build. Were we to bail out before this point,
            // the build and all its fresh steps would simply be dropped.
            {
                let mut builds = self.builds.lock();
                if !build.finished_in_db() {
                    builds.insert(build.id, build.clone());
                }
                *build.toplevel.lock() = Some(toplevel.clone());
            }

            build.propagate_priorities();

            debug!(
                build_id = %build.id,
                toplevel = %toplevel.drv_path(),
                new_steps = new_steps.len(),
                "added build"
            );
            Ok(())
        }
        .boxed()
    }

    /// Whether any output of `step` has a failure on record.
    async fn check_cached_failure(
        &self,
        repo: &dyn QueueRepo,
        step: &Arc<Step>,
    ) -> QueueResult<bool> {
        let paths: Vec<String> = step
            .output_paths()
            .iter()
            .map(ToString::to_string)
            .collect();
        if paths.is_empty() {
            return Ok(false);
        }
        Ok(repo.has_failed_path(&paths).await?)
    }

    /// Fetch the jobset for `(project, name)`, loading its share weight and
    /// recent step history on first use.
    pub(crate) async fn create_jobset(
        &self,
        repo: &dyn QueueRepo,
        project: &str,
        name: &str,
    ) -> QueueResult<Arc<Jobset>> {
        let key = (project.to_owned(), name.to_owned());
        if let Some(jobset) = self.jobsets.lock().get(&key) {
            return Ok(jobset.clone());
        }

        let shares = repo.jobset_shares(project, name).await?.ok_or_else(|| {
            QueueError::MissingJobset {
                project: project.to_owned(),
                name: name.to_owned(),
            }
        })?;
        let jobset = Arc::new(Jobset::new(shares.max(0) as u32));

        // Seed the share window from recent build-step history.
        let since = Utc::now().timestamp() - Jobset::SCHEDULING_WINDOW * 10;
        for timing in repo.recent_jobset_steps(project, name, since).await? {
            jobset.add_step(timing.start_time, timing.stop_time - timing.start_time);
        }

        // Two loaders can race across the awaits above; the first insert
        // wins and both callers get the same jobset.
        Ok(self.jobsets.lock().entry(key).or_insert(jobset).clone())
    }

    /// Reconcile the in-memory build set against the database: drop builds
    /// whose row is gone (cancelled or deleted) and pick up raised global
    /// priorities.
    pub async fn process_queue_change(&self, repo: &dyn QueueRepo) -> QueueResult<()> {
        let current: HashMap<BuildId, i32> =
            repo.unfinished_builds().await?.into_iter().collect();

        let mut builds = self.builds.lock();
        builds.retain(|id, build| match current.get(id) {
            None => {
                info!(build_id = %id, "discarding cancelled build");
                // TODO: interrupt the build's in-flight steps when no other
                // build needs them.
                false
            }
            Some(&priority) => {
                if build.global_priority() < priority {
                    info!(build_id = %id, priority, "priority of build increased");
                    build.set_global_priority(priority);
                    build.propagate_priorities();
                }
                true
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::config::Config;
    use crate::dispatch::Dispatcher;
    use crate::machine::Machine;
    use crate::testing::{
        drv, drv_on, CompletionWrite, MemRepo, MemStore, RecordingDispatcher,
    };

    fn test_state(dispatcher: Arc<dyn Dispatcher>) -> Arc<State> {
        let config = Config {
            local_platforms: BTreeSet::from(["x86_64-linux".to_owned()]),
            build_one: None,
        };
        let state = State::new(config, dispatcher);
        state.set_machines(vec![Machine::local(["x86_64-linux".to_owned()])]);
        state
    }

    async fn scan(state: &State, repo: &MemRepo, store: &MemStore) -> QueueResult<BuildId> {
        let mut last = BuildId::default();
        state.get_queued_builds(repo, store, &mut last).await?;
        Ok(last)
    }

    fn build_ids(step: &Arc<Step>) -> Vec<BuildId> {
        step.state
            .lock()
            .builds
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|build| build.id)
            .collect()
    }

    #[tokio::test]
    async fn fresh_build_expands_into_a_chain_with_the_leaf_runnable() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let state = test_state(recorder.clone());
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(1, "/d/a.drv", 5);
        store.add(drv("/d/a.drv", "/out/a", &["/d/b.drv"]));
        store.add(drv("/d/b.drv", "/out/b", &["/d/c.drv"]));
        store.add(drv("/d/c.drv", "/out/c", &[]));

        let last = scan(&state, &repo, &store).await.unwrap();
        assert_eq!(last, BuildId::new(1));
        assert_eq!(state.steps.lock().len(), 3);

        let runnable = recorder.steps.lock();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].drv_path().as_str(), "/d/c.drv");

        let builds = state.builds.lock();
        let build = builds.get(&BuildId::new(1)).expect("build registered");
        let top = build.toplevel.lock().clone().expect("toplevel assigned");
        assert_eq!(top.drv_path().as_str(), "/d/a.drv");

        let a_state = top.state.lock();
        assert!(a_state.created);
        assert_eq!(a_state.highest_global_priority, 5);
        assert_eq!(a_state.lowest_build_id, BuildId::new(1));
        let b = a_state.deps.values().next().unwrap().clone();
        drop(a_state);
        assert_eq!(b.drv_path().as_str(), "/d/b.drv");
        let b_deps: Vec<String> = b
            .state
            .lock()
            .deps
            .keys()
            .map(|p| p.as_str().to_owned())
            .collect();
        assert_eq!(b_deps, vec!["/d/c.drv"]);
        assert_eq!(build_ids(&b), vec![BuildId::new(1)]);
    }

    #[tokio::test]
    async fn fully_cached_build_is_recorded_as_succeeded() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let state = test_state(recorder.clone());
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(2, "/d/x.drv", 0);
        store.add(drv("/d/x.drv", "/out/x", &[]));
        store.mark_valid("/out/x");

        scan(&state, &repo, &store).await.unwrap();

        assert!(state.builds.lock().is_empty());
        assert!(recorder.steps.lock().is_empty());
        let writes = repo.writes.lock();
        assert_eq!(writes.len(), 1);
        match &writes[0] {
            CompletionWrite::Succeeded {
                id,
                products,
                is_cached,
            } => {
                assert_eq!(*id, BuildId::new(2));
                assert!(*is_cached);
                assert_eq!(products.len(), 1);
                assert_eq!(products[0].path, "/out/x");
            }
            other => panic!("unexpected write {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_collected_derivation_aborts_the_build() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(3, "/d/y.drv", 0);

        scan(&state, &repo, &store).await.unwrap();

        assert!(state.builds.lock().is_empty());
        assert!(state.steps.lock().is_empty());
        let writes = repo.writes.lock();
        assert_eq!(
            writes[0],
            CompletionWrite::Aborted {
                id: BuildId::new(3),
                error_msg: "derivation was garbage-collected prior to build".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn shared_dependency_is_created_once_and_aggregates_both_builds() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(10, "/d/p.drv", 5);
        repo.queue_build(11, "/d/q.drv", 3);
        store.add(drv("/d/p.drv", "/out/p", &["/d/r.drv"]));
        store.add(drv("/d/q.drv", "/out/q", &["/d/r.drv"]));
        store.add(drv("/d/r.drv", "/out/r", &[]));

        scan(&state, &repo, &store).await.unwrap();

        let builds = state.builds.lock();
        assert_eq!(builds.len(), 2);
        let p_top = builds[&BuildId::new(10)].toplevel.lock().clone().unwrap();
        let q_top = builds[&BuildId::new(11)].toplevel.lock().clone().unwrap();
        drop(builds);

        let r_from_p = p_top.state.lock().deps.values().next().unwrap().clone();
        let r_from_q = q_top.state.lock().deps.values().next().unwrap().clone();
        assert!(Arc::ptr_eq(&r_from_p, &r_from_q));

        let mut ids = build_ids(&r_from_p);
        ids.sort();
        assert_eq!(ids, vec![BuildId::new(10), BuildId::new(11)]);

        let r_state = r_from_p.state.lock();
        assert_eq!(r_state.highest_global_priority, 5);
        assert_eq!(r_state.lowest_build_id, BuildId::new(10));
    }

    #[tokio::test]
    async fn sibling_build_is_co_expanded_and_accounted_first() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        // Build 20 depends on build 21's top-level derivation; the higher
        // priority makes 20 load first.
        repo.queue_build(20, "/d/top.drv", 9);
        repo.queue_build(21, "/d/sub.drv", 0);
        store.add(drv("/d/top.drv", "/out/top", &["/d/sub.drv"]));
        store.add(drv("/d/sub.drv", "/out/sub", &[]));

        scan(&state, &repo, &store).await.unwrap();

        let builds = state.builds.lock();
        assert_eq!(builds.len(), 2);
        let top = builds[&BuildId::new(20)].toplevel.lock().clone().unwrap();
        let sub = builds[&BuildId::new(21)].toplevel.lock().clone().unwrap();
        drop(builds);

        assert!(Arc::ptr_eq(
            &top.state.lock().deps.values().next().unwrap().clone(),
            &sub
        ));

        // Build 21 was registered while build 20 was still loading, so it
        // comes first in the shared step's back-references.
        assert_eq!(build_ids(&sub), vec![BuildId::new(21), BuildId::new(20)]);

        let sub_state = sub.state.lock();
        assert_eq!(sub_state.highest_global_priority, 9);
        assert_eq!(sub_state.lowest_build_id, BuildId::new(20));
        drop(sub_state);

        assert_eq!(state.nr_builds_read.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unsupported_platform_completes_the_build_without_publishing() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let state = test_state(recorder.clone());
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(5, "/d/exotic.drv", 0);
        store.add(drv_on("riscv64-linux", "/d/exotic.drv", "/out/exotic", &[]));

        scan(&state, &repo, &store).await.unwrap();

        assert!(state.builds.lock().is_empty());
        assert!(recorder.steps.lock().is_empty());
        let writes = repo.writes.lock();
        assert_eq!(
            writes[0],
            CompletionWrite::Finished {
                id: BuildId::new(5),
                drv_path: "/d/exotic.drv".to_owned(),
                build_status: BuildStatus::Unsupported,
                step_status: BuildStepStatus::Unsupported,
                is_cached: false,
            }
        );
    }

    #[tokio::test]
    async fn cached_failure_of_a_dependency_fails_the_build_as_dep_failed() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let state = test_state(recorder.clone());
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(6, "/d/a.drv", 0);
        store.add(drv("/d/a.drv", "/out/a", &["/d/b.drv"]));
        store.add(drv("/d/b.drv", "/out/b", &[]));
        repo.mark_failed_path("/out/b");

        scan(&state, &repo, &store).await.unwrap();

        assert!(state.builds.lock().is_empty());
        assert!(recorder.steps.lock().is_empty());
        let writes = repo.writes.lock();
        assert_eq!(
            writes[0],
            CompletionWrite::Finished {
                id: BuildId::new(6),
                drv_path: "/d/b.drv".to_owned(),
                build_status: BuildStatus::DepFailed,
                step_status: BuildStepStatus::Failed,
                is_cached: true,
            }
        );
    }

    #[tokio::test]
    async fn cached_failure_of_the_toplevel_fails_the_build_outright() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(7, "/d/a.drv", 0);
        store.add(drv("/d/a.drv", "/out/a", &[]));
        repo.mark_failed_path("/out/a");

        scan(&state, &repo, &store).await.unwrap();

        let writes = repo.writes.lock();
        match &writes[0] {
            CompletionWrite::Finished { build_status, .. } => {
                assert_eq!(*build_status, BuildStatus::Failed);
            }
            other => panic!("unexpected write {other:?}"),
        }
    }

    #[tokio::test]
    async fn rescanning_an_unchanged_queue_is_a_no_op() {
        let recorder = Arc::new(RecordingDispatcher::default());
        let state = test_state(recorder.clone());
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(1, "/d/a.drv", 0);
        store.add(drv("/d/a.drv", "/out/a", &[]));

        scan(&state, &repo, &store).await.unwrap();
        scan(&state, &repo, &store).await.unwrap();

        assert_eq!(state.builds.lock().len(), 1);
        assert_eq!(state.steps.lock().len(), 1);
        assert_eq!(recorder.steps.lock().len(), 1);
        assert_eq!(state.nr_builds_read.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn build_one_skips_everything_else_but_advances_the_cursor() {
        let state = State::new(
            Config {
                local_platforms: BTreeSet::from(["x86_64-linux".to_owned()]),
                build_one: Some(BuildId::new(2)),
            },
            Arc::new(RecordingDispatcher::default()),
        );
        state.set_machines(vec![Machine::local(["x86_64-linux".to_owned()])]);
        let repo = MemRepo::new();
        let store = MemStore::new();

        for id in 1..=3 {
            let path = format!("/d/{id}.drv");
            repo.queue_build(id, &path, 0);
            store.add(drv(&path, &format!("/out/{id}"), &[]));
        }

        let last = scan(&state, &repo, &store).await.unwrap();
        assert_eq!(last, BuildId::new(3));

        let builds = state.builds.lock();
        assert_eq!(builds.len(), 1);
        assert!(builds.contains_key(&BuildId::new(2)));
    }

    #[tokio::test]
    async fn missing_jobset_row_is_fatal() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(1, "/d/a.drv", 0);
        repo.shares.lock().clear();
        store.add(drv("/d/a.drv", "/out/a", &[]));

        let err = scan(&state, &repo, &store).await.unwrap_err();
        assert!(matches!(err, QueueError::MissingJobset { .. }));
    }

    #[tokio::test]
    async fn expansion_errors_carry_the_build_id() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(1, "/d/a.drv", 0);
        // The dependency's derivation is unreadable.
        store.add(drv("/d/a.drv", "/out/a", &["/d/gone.drv"]));

        let err = scan(&state, &repo, &store).await.unwrap_err();
        match &err {
            QueueError::LoadBuild { id, source } => {
                assert_eq!(*id, BuildId::new(1));
                assert!(matches!(**source, QueueError::Store(_)));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().starts_with("while loading build 1: "));
        assert!(state.builds.lock().is_empty());
    }

    #[tokio::test]
    async fn jobset_share_window_is_seeded_from_history() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(1, "/d/a.drv", 0);
        store.add(drv("/d/a.drv", "/out/a", &[]));
        let start = Utc::now().timestamp() - 600;
        repo.timings.lock().push(kiln_db::StepTiming {
            start_time: start,
            stop_time: start + 240,
        });

        scan(&state, &repo, &store).await.unwrap();

        let jobsets = state.jobsets.lock();
        let jobset = jobsets
            .get(&("test".to_owned(), "main".to_owned()))
            .expect("jobset cached");
        assert!((jobset.share_used() - 240.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cancelled_builds_are_discarded_by_the_reconciler() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        for id in 1..=3 {
            let path = format!("/d/{id}.drv");
            repo.queue_build(id, &path, 0);
            store.add(drv(&path, &format!("/out/{id}"), &[]));
        }
        scan(&state, &repo, &store).await.unwrap();
        assert_eq!(state.builds.lock().len(), 3);

        repo.set_unfinished(vec![(BuildId::new(1), 0), (BuildId::new(3), 0)]);
        state.process_queue_change(&repo).await.unwrap();

        let builds = state.builds.lock();
        let mut ids: Vec<BuildId> = builds.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![BuildId::new(1), BuildId::new(3)]);
        assert_eq!(repo.writes.lock().len(), 0);
    }

    #[tokio::test]
    async fn priority_bumps_reach_every_step_of_the_build() {
        let state = test_state(Arc::new(RecordingDispatcher::default()));
        let repo = MemRepo::new();
        let store = MemStore::new();

        repo.queue_build(4, "/d/a.drv", 2);
        store.add(drv("/d/a.drv", "/out/a", &["/d/b.drv"]));
        store.add(drv("/d/b.drv", "/out/b", &[]));
        scan(&state, &repo, &store).await.unwrap();

        repo.set_unfinished(vec![(BuildId::new(4), 7)]);
        state.process_queue_change(&repo).await.unwrap();

        let builds = state.builds.lock();
        let build = &builds[&BuildId::new(4)];
        assert_eq!(build.global_priority(), 7);

        let top = build.toplevel.lock().clone().unwrap();
        assert_eq!(top.state.lock().highest_global_priority, 7);
        let dep = top.state.lock().deps.values().next().unwrap().clone();
        assert_eq!(dep.state.lock().highest_global_priority, 7);
    }
}
