//! Build steps: shared nodes of the derivation build graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, Weak};

use kiln_core::{BuildId, StorePath};
use kiln_store::Derivation;
use parking_lot::Mutex;

use crate::build::Build;
use crate::jobset::{Jobset, JobsetKey};

/// One derivation that needs building, shared by every build whose graph
/// contains it.
///
/// Ownership: dependents hold strong references through [`StepState::deps`],
/// and builds hold their top-level step strongly; everything pointing the
/// other way (`rdeps`, `builds`) is weak, and the registry in
/// [`crate::State`] only keeps weak handles. A step therefore lives exactly
/// as long as something still needs it.
pub struct Step {
    drv_path: StorePath,
    init: OnceLock<StepInit>,
    pub state: Mutex<StepState>,
}

/// Immutable facts established while the step is being initialized, before
/// `created` flips to true. Other threads never look at these earlier: an
/// uncreated step is never runnable.
struct StepInit {
    drv: Derivation,
    required_system_features: BTreeSet<String>,
    prefer_local_build: bool,
}

/// Mutable step state, guarded by the step's own lock.
pub struct StepState {
    /// False while the creating thread is still reading the derivation and
    /// wiring dependencies. An uncreated step has no outgoing edges and is
    /// in no runnable set.
    pub created: bool,

    /// Steps this step needs built first (strong edges).
    pub deps: BTreeMap<StorePath, Arc<Step>>,

    /// Steps that need this step (back-references).
    pub rdeps: Vec<Weak<Step>>,

    /// Builds whose graph contains this step (back-references).
    pub builds: Vec<Weak<Build>>,

    /// Max global priority over all reachable builds.
    pub highest_global_priority: i32,

    /// Max local priority over all reachable builds.
    pub highest_local_priority: i32,

    /// Min id over all reachable builds.
    pub lowest_build_id: BuildId,

    /// Jobsets this step contributes to, for fair-share dispatch.
    pub jobsets: HashMap<JobsetKey, Arc<Jobset>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            created: false,
            deps: BTreeMap::new(),
            rdeps: Vec::new(),
            builds: Vec::new(),
            highest_global_priority: 0,
            highest_local_priority: 0,
            lowest_build_id: BuildId::MAX,
            jobsets: HashMap::new(),
        }
    }
}

impl Step {
    pub fn new(drv_path: StorePath) -> Self {
        Self {
            drv_path,
            init: OnceLock::new(),
            state: Mutex::new(StepState::default()),
        }
    }

    pub fn drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    /// Install the parsed derivation. Called exactly once, by the thread
    /// that created the step, before `created` is set.
    pub(crate) fn initialize(&self, drv: Derivation, prefer_local_build: bool) {
        let required_system_features = drv.required_system_features();
        let _ = self.init.set(StepInit {
            drv,
            required_system_features,
            prefer_local_build,
        });
    }

    /// The parsed derivation, once initialized.
    pub fn derivation(&self) -> Option<&Derivation> {
        self.init.get().map(|init| &init.drv)
    }

    pub fn platform(&self) -> Option<&str> {
        self.init.get().map(|init| init.drv.platform.as_str())
    }

    pub fn required_system_features(&self) -> Option<&BTreeSet<String>> {
        self.init.get().map(|init| &init.required_system_features)
    }

    pub fn prefer_local_build(&self) -> bool {
        self.init
            .get()
            .is_some_and(|init| init.prefer_local_build)
    }

    /// Paths of the step's declared outputs (empty before initialization).
    pub fn output_paths(&self) -> Vec<StorePath> {
        self.init
            .get()
            .map(|init| init.drv.output_paths().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Step")
            .field("drv_path", &self.drv_path)
            .field("created", &state.created)
            .field("deps", &state.deps.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
