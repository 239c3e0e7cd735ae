//! Build-graph expansion: turning one derivation into linked build steps.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kiln_core::StorePath;
use kiln_store::Store;
use tracing::debug;

use crate::build::Build;
use crate::error::QueueResult;
use crate::state::State;
use crate::step::Step;

impl State {
    /// Create (or reuse) the step for `drv_path` and recursively for its
    /// input derivations, linking each step to the one that needs it.
    ///
    /// Returns `None` when nothing needs building: the path is in the
    /// `finished_drvs` memo, or all of its outputs are already valid (the
    /// path is then added to the memo).
    ///
    /// A freshly created step is visible in the registry before its
    /// dependencies are wired, but with `created == false`, so nothing
    /// treats it as runnable until this function flips the flag with `deps`
    /// fully populated. The parent link is installed *before* children are
    /// expanded; a step never dangles unreachable mid-expansion.
    pub(crate) fn create_step<'a>(
        &'a self,
        store: &'a dyn Store,
        drv_path: StorePath,
        referring_build: Option<Arc<Build>>,
        referring_step: Option<Arc<Step>>,
        finished_drvs: &'a mut HashSet<StorePath>,
        new_steps: &'a mut Vec<Arc<Step>>,
        new_runnable: &'a mut Vec<Arc<Step>>,
    ) -> BoxFuture<'a, QueueResult<Option<Arc<Step>>>> {
        async move {
            if finished_drvs.contains(&drv_path) {
                return Ok(None);
            }

            let (step, is_new) = self.lookup_or_create_step(
                &drv_path,
                referring_build.as_ref(),
                referring_step.as_ref(),
            );

            // An existing step already has its graph, either from a prior
            // build or from earlier in this same expansion.
            if !is_new {
                return Ok(Some(step));
            }

            debug!(drv = %drv_path, "considering derivation");

            let drv = store.read_derivation(&drv_path).await?;
            let input_drvs: Vec<StorePath> = drv.input_drvs.keys().cloned().collect();
            let output_paths: Vec<StorePath> = drv.output_paths().cloned().collect();
            let prefer_local =
                drv.prefers_local_build() && self.config.local_platforms.contains(&drv.platform);
            step.initialize(drv, prefer_local);

            let mut all_valid = true;
            for path in &output_paths {
                if !store.is_valid_path(path).await? {
                    all_valid = false;
                    break;
                }
            }
            if all_valid {
                // Nothing to do; the uncreated step is dropped here and its
                // registry entry goes stale.
                finished_drvs.insert(drv_path);
                return Ok(None);
            }

            debug!(drv = %drv_path, "creating build step");
            new_steps.push(step.clone());

            for input in input_drvs {
                let dep = self
                    .create_step(
                        store,
                        input,
                        None,
                        Some(step.clone()),
                        &mut *finished_drvs,
                        &mut *new_steps,
                        &mut *new_runnable,
                    )
                    .await?;
                if let Some(dep) = dep {
                    let mut state = step.state.lock();
                    state.deps.insert(dep.drv_path().clone(), dep);
                }
            }

            {
                let mut state = step.state.lock();
                assert!(!state.created);
                state.created = true;
                if state.deps.is_empty() {
                    new_runnable.push(step.clone());
                }
            }

            Ok(Some(step))
        }
        .boxed()
    }
}
