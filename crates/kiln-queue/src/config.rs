//! Queue-monitor configuration.

use std::collections::BTreeSet;

use kiln_core::BuildId;

/// Settings the monitor needs at runtime. Assembled by the daemon from
/// flags and environment; tests build it directly.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Platforms the local machine can build for. A derivation asking for
    /// `preferLocalBuild` is only pinned to the local machine when its
    /// platform is in this set.
    pub local_platforms: BTreeSet<String>,

    /// Process only this build id, skipping everything else in the queue.
    /// Debugging aid.
    pub build_one: Option<BuildId>,
}
