//! Queued builds.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use kiln_core::{BuildId, StorePath};
use kiln_db::BuildRow;
use parking_lot::Mutex;

use crate::jobset::Jobset;
use crate::step::Step;

/// A user-queued request to realise one derivation.
///
/// Holds its top-level step strongly; steps refer back to builds weakly
/// (see [`crate::Step`] for the ownership contract).
pub struct Build {
    pub id: BuildId,
    pub drv_path: StorePath,
    pub project_name: String,
    pub jobset_name: String,
    pub job_name: String,
    pub max_silent_time: i32,
    pub build_timeout: i32,
    /// Queued-at time, epoch seconds.
    pub timestamp: i64,
    pub local_priority: i32,
    /// Bumped by the reconciler while workers read it.
    global_priority: AtomicI32,
    pub jobset: Arc<Jobset>,
    /// Assigned once the build's graph has been fully expanded.
    pub toplevel: Mutex<Option<Arc<Step>>>,
    /// Whether a completion row has already been written for this build.
    finished_in_db: AtomicBool,
}

impl Build {
    pub fn new(row: BuildRow, jobset: Arc<Jobset>) -> Self {
        Self {
            id: BuildId::from(row.id),
            drv_path: StorePath::from(row.drv_path),
            project_name: row.project,
            jobset_name: row.jobset,
            job_name: row.job,
            max_silent_time: row.max_silent,
            build_timeout: row.timeout,
            timestamp: row.timestamp,
            local_priority: row.priority,
            global_priority: AtomicI32::new(row.global_priority),
            jobset,
            toplevel: Mutex::new(None),
            finished_in_db: AtomicBool::new(false),
        }
    }

    pub fn full_job_name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.project_name, self.jobset_name, self.job_name
        )
    }

    pub fn global_priority(&self) -> i32 {
        self.global_priority.load(Ordering::Relaxed)
    }

    pub fn set_global_priority(&self, priority: i32) {
        self.global_priority.store(priority, Ordering::Relaxed);
    }

    pub fn finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::Relaxed)
    }

    pub fn set_finished_in_db(&self, finished: bool) {
        self.finished_in_db.store(finished, Ordering::Relaxed);
    }

    /// Fold this build into every step reachable from its top level: the
    /// priority and id aggregates the dispatcher orders by (descending
    /// global priority, ascending build id), the jobset set, and the
    /// build back-reference itself. The updates are monotonic and run
    /// again after a priority bump.
    pub fn propagate_priorities(self: &Arc<Self>) {
        let Some(toplevel) = self.toplevel.lock().clone() else {
            return;
        };

        // Derivation graphs are DAGs; a step can still be reached along
        // several paths, so track what we've seen per call.
        let mut visited: HashSet<StorePath> = HashSet::new();
        let mut pending = vec![toplevel];

        while let Some(step) = pending.pop() {
            if !visited.insert(step.drv_path().clone()) {
                continue;
            }
            let mut state = step.state.lock();
            state.highest_global_priority =
                state.highest_global_priority.max(self.global_priority());
            state.highest_local_priority =
                state.highest_local_priority.max(self.local_priority);
            state.lowest_build_id = state.lowest_build_id.min(self.id);
            state.jobsets.insert(
                (self.project_name.clone(), self.jobset_name.clone()),
                self.jobset.clone(),
            );
            let already_listed = state
                .builds
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|b| b.id == self.id));
            if !already_listed {
                state.builds.push(Arc::downgrade(self));
            }
            pending.extend(state.deps.values().cloned());
        }
    }
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("id", &self.id)
            .field("drv_path", &self.drv_path)
            .field("job", &self.full_job_name())
            .field("global_priority", &self.global_priority())
            .finish_non_exhaustive()
    }
}
