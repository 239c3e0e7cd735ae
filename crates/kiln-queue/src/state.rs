//! Process-wide queue-monitor state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kiln_core::{BuildId, StorePath};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::build::Build;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::jobset::{Jobset, JobsetKey};
use crate::machine::Machine;
use crate::step::Step;

/// All shared state of the queue monitor, passed explicitly to everything
/// that needs it.
///
/// Each collection has its own lock; none is ever held across an `.await`.
/// The only nested acquisition is `steps` -> `step.state` inside
/// [`State::lookup_or_create_step`].
pub struct State {
    pub config: Config,

    /// Queued builds that made it through expansion, by id.
    pub builds: Mutex<HashMap<BuildId, Arc<Build>>>,

    /// Step registry: derivation path -> weak step handle. Pure lookup
    /// index; stale entries are purged on the next lookup of their path.
    pub steps: Mutex<HashMap<StorePath, Weak<Step>>>,

    /// Jobset cache, loaded on first use of a `(project, jobset)` pair.
    pub jobsets: Mutex<HashMap<JobsetKey, Arc<Jobset>>>,

    /// Build machine registry, read-mostly.
    pub machines: RwLock<HashMap<String, Arc<Machine>>>,

    dispatcher: Arc<dyn Dispatcher>,

    /// Times the monitor woke up on a database notification.
    pub nr_queue_wakeups: AtomicU64,
    /// Builds read from the queue and expanded.
    pub nr_builds_read: AtomicU64,
    /// Builds completed by the monitor itself (cached, aborted, failed
    /// pre-flight).
    pub nr_builds_done: AtomicU64,
}

impl State {
    pub fn new(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            builds: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            jobsets: Mutex::new(HashMap::new()),
            machines: RwLock::new(HashMap::new()),
            dispatcher,
            nr_queue_wakeups: AtomicU64::new(0),
            nr_builds_read: AtomicU64::new(0),
            nr_builds_done: AtomicU64::new(0),
        })
    }

    /// Replace the machine registry.
    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self.machines.write() = machines
            .into_iter()
            .map(|m| (m.name.clone(), Arc::new(m)))
            .collect();
    }

    /// Whether any registered machine can run `step`.
    pub fn supports_step(&self, step: &Step) -> bool {
        self.machines
            .read()
            .values()
            .any(|m| m.supports_step(step))
    }

    /// Find the step for `drv_path` or create a fresh one, and link it to
    /// its referrer, all under one acquisition of the registry lock.
    ///
    /// The atomic fold of lookup/create + link is what keeps a step from
    /// going unreachable between its creation and the installation of the
    /// back-reference: a worker finishing the step concurrently either sees
    /// the referrer or never hands out the dying step again.
    pub(crate) fn lookup_or_create_step(
        &self,
        drv_path: &StorePath,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Step>>,
    ) -> (Arc<Step>, bool) {
        let mut steps = self.steps.lock();

        let mut step = None;
        if let Some(weak) = steps.get(drv_path) {
            step = weak.upgrade();
            if step.is_none() {
                // The last owner dropped it since the entry was written.
                steps.remove(drv_path);
            }
        }

        let is_new = step.is_none();
        let step = step.unwrap_or_else(|| Arc::new(Step::new(drv_path.clone())));

        {
            let mut state = step.state.lock();

            assert!(
                state.created != is_new,
                "step registry corrupt: {} has created={} but is_new={}",
                drv_path,
                state.created,
                is_new
            );

            if let Some(build) = referring_build {
                state.builds.push(Arc::downgrade(build));
            }
            if let Some(rdep) = referring_step {
                state.rdeps.push(Arc::downgrade(rdep));
            }
        }

        steps.insert(drv_path.clone(), Arc::downgrade(&step));
        (step, is_new)
    }

    /// Publish a fully created, dependency-free step to the dispatcher.
    pub fn make_runnable(&self, step: &Arc<Step>) {
        debug!(drv = %step.drv_path(), "step is runnable");
        {
            let state = step.state.lock();
            assert!(state.created, "uncreated step published as runnable");
        }
        self.dispatcher.make_runnable(step);
    }
}
