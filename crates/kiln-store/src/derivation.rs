//! In-memory model of a parsed derivation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kiln_core::StorePath;
use serde::{Deserialize, Serialize};

/// A build recipe read from the store.
///
/// `input_drvs` maps each prerequisite derivation to the output names this
/// derivation consumes from it; those edges are what the queue core expands
/// into step dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    pub platform: String,
    pub outputs: BTreeMap<String, DerivationOutput>,
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationOutput {
    pub path: StorePath,
}

impl Derivation {
    /// System features the builder machine must provide, taken from the
    /// `requiredSystemFeatures` environment entry (whitespace-separated).
    pub fn required_system_features(&self) -> BTreeSet<String> {
        self.env
            .get("requiredSystemFeatures")
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Whether the derivation asks to be built locally rather than shipped
    /// to a remote machine. The queue core additionally requires the
    /// platform to be buildable locally before honouring this.
    pub fn prefers_local_build(&self) -> bool {
        self.env.get("preferLocalBuild").is_some_and(|v| v == "1")
    }

    /// Release name advertised by the derivation, if any.
    pub fn release_name(&self) -> Option<&str> {
        self.env.get("releaseName").map(String::as_str)
    }

    /// Paths of all declared outputs.
    pub fn output_paths(&self) -> impl Iterator<Item = &StorePath> {
        self.outputs.values().map(|o| &o.path)
    }
}
