//! In-memory fakes shared by this crate's tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{BuildId, BuildStatus, BuildStepStatus, StorePath};
use kiln_db::{BuildProductRow, BuildRow, DbResult, QueueRepo, StepTiming};
use kiln_store::{Derivation, DerivationOutput, Store, StoreError, StoreResult};
use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::step::Step;

/// A derivation with a single `out` output on x86_64-linux.
pub(crate) fn drv(drv_path: &str, out_path: &str, inputs: &[&str]) -> (StorePath, Derivation) {
    drv_on("x86_64-linux", drv_path, out_path, inputs)
}

pub(crate) fn drv_on(
    platform: &str,
    drv_path: &str,
    out_path: &str,
    inputs: &[&str],
) -> (StorePath, Derivation) {
    let derivation = Derivation {
        platform: platform.to_owned(),
        outputs: BTreeMap::from([(
            "out".to_owned(),
            DerivationOutput {
                path: StorePath::from(out_path),
            },
        )]),
        input_drvs: inputs
            .iter()
            .map(|input| (StorePath::from(*input), BTreeSet::from(["out".to_owned()])))
            .collect(),
        env: HashMap::new(),
    };
    (StorePath::from(drv_path), derivation)
}

/// Store whose contents are set up by the test. A path is valid if it was
/// marked valid or holds a derivation.
#[derive(Default)]
pub(crate) struct MemStore {
    drvs: Mutex<HashMap<StorePath, Derivation>>,
    valid: Mutex<HashSet<StorePath>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, (path, derivation): (StorePath, Derivation)) {
        self.drvs.lock().insert(path, derivation);
    }

    pub fn mark_valid(&self, path: &str) {
        self.valid.lock().insert(StorePath::from(path));
    }
}

#[async_trait]
impl Store for MemStore {
    async fn is_valid_path(&self, path: &StorePath) -> StoreResult<bool> {
        Ok(self.valid.lock().contains(path) || self.drvs.lock().contains_key(path))
    }

    async fn read_derivation(&self, path: &StorePath) -> StoreResult<Derivation> {
        self.drvs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::MissingDerivation(path.clone()))
    }
}

/// A completion write the monitor issued against the fake database.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompletionWrite {
    Aborted {
        id: BuildId,
        error_msg: String,
    },
    Finished {
        id: BuildId,
        drv_path: String,
        build_status: BuildStatus,
        step_status: BuildStepStatus,
        is_cached: bool,
    },
    Succeeded {
        id: BuildId,
        products: Vec<BuildProductRow>,
        is_cached: bool,
    },
}

/// In-memory [`QueueRepo`]: a vector of queued rows plus a log of every
/// completion write.
#[derive(Default)]
pub(crate) struct MemRepo {
    pub queued: Mutex<Vec<BuildRow>>,
    pub shares: Mutex<HashMap<(String, String), i32>>,
    pub timings: Mutex<Vec<StepTiming>>,
    pub failed_paths: Mutex<HashSet<String>>,
    /// When set, `unfinished_builds` returns exactly this (reconciler
    /// tests); otherwise it is derived from `queued` minus completions.
    pub unfinished_override: Mutex<Option<Vec<(BuildId, i32)>>>,
    pub writes: Mutex<Vec<CompletionWrite>>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a build under `test:main` with scheduling shares in place.
    pub fn queue_build(&self, id: i32, drv_path: &str, global_priority: i32) {
        self.shares
            .lock()
            .entry(("test".to_owned(), "main".to_owned()))
            .or_insert(1);
        self.queued.lock().push(BuildRow {
            id,
            project: "test".to_owned(),
            jobset: "main".to_owned(),
            job: format!("job-{id}"),
            drv_path: drv_path.to_owned(),
            max_silent: 3600,
            timeout: 36000,
            timestamp: 1_700_000_000,
            global_priority,
            priority: 0,
        });
    }

    pub fn mark_failed_path(&self, path: &str) {
        self.failed_paths.lock().insert(path.to_owned());
    }

    pub fn set_unfinished(&self, builds: Vec<(BuildId, i32)>) {
        *self.unfinished_override.lock() = Some(builds);
    }

    fn finished_ids(&self) -> HashSet<BuildId> {
        self.writes
            .lock()
            .iter()
            .map(|write| match write {
                CompletionWrite::Aborted { id, .. }
                | CompletionWrite::Finished { id, .. }
                | CompletionWrite::Succeeded { id, .. } => *id,
            })
            .collect()
    }
}

#[async_trait]
impl QueueRepo for MemRepo {
    async fn queued_builds_after(&self, last: BuildId) -> DbResult<Vec<BuildRow>> {
        let finished = self.finished_ids();
        let mut rows: Vec<BuildRow> = self
            .queued
            .lock()
            .iter()
            .filter(|row| {
                BuildId::from(row.id) > last && !finished.contains(&BuildId::from(row.id))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.global_priority
                .cmp(&a.global_priority)
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn unfinished_builds(&self) -> DbResult<Vec<(BuildId, i32)>> {
        if let Some(explicit) = self.unfinished_override.lock().clone() {
            return Ok(explicit);
        }
        let finished = self.finished_ids();
        Ok(self
            .queued
            .lock()
            .iter()
            .filter(|row| !finished.contains(&BuildId::from(row.id)))
            .map(|row| (BuildId::from(row.id), row.global_priority))
            .collect())
    }

    async fn jobset_shares(&self, project: &str, jobset: &str) -> DbResult<Option<i32>> {
        Ok(self
            .shares
            .lock()
            .get(&(project.to_owned(), jobset.to_owned()))
            .copied())
    }

    async fn recent_jobset_steps(
        &self,
        _project: &str,
        _jobset: &str,
        since: i64,
    ) -> DbResult<Vec<StepTiming>> {
        Ok(self
            .timings
            .lock()
            .iter()
            .filter(|timing| timing.stop_time > since)
            .copied()
            .collect())
    }

    async fn has_failed_path(&self, paths: &[String]) -> DbResult<bool> {
        let failed = self.failed_paths.lock();
        Ok(paths.iter().any(|path| failed.contains(path)))
    }

    async fn abort_build(&self, id: BuildId, _now: i64, error_msg: &str) -> DbResult<()> {
        self.writes.lock().push(CompletionWrite::Aborted {
            id,
            error_msg: error_msg.to_owned(),
        });
        Ok(())
    }

    async fn finish_build_with_step(
        &self,
        id: BuildId,
        drv_path: &str,
        build_status: BuildStatus,
        step_status: BuildStepStatus,
        _now: i64,
        is_cached: bool,
    ) -> DbResult<()> {
        self.writes.lock().push(CompletionWrite::Finished {
            id,
            drv_path: drv_path.to_owned(),
            build_status,
            step_status,
            is_cached,
        });
        Ok(())
    }

    async fn succeed_build(
        &self,
        id: BuildId,
        products: &[BuildProductRow],
        _release_name: Option<&str>,
        is_cached: bool,
        _start_time: i64,
        _stop_time: i64,
    ) -> DbResult<()> {
        self.writes.lock().push(CompletionWrite::Succeeded {
            id,
            products: products.to_vec(),
            is_cached,
        });
        Ok(())
    }
}

/// Dispatcher that drops everything.
pub(crate) struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn make_runnable(&self, _step: &Arc<Step>) {}
}

/// Dispatcher that records every published step.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    pub steps: Mutex<Vec<Arc<Step>>>,
}

impl Dispatcher for RecordingDispatcher {
    fn make_runnable(&self, step: &Arc<Step>) {
        self.steps.lock().push(step.clone());
    }
}
