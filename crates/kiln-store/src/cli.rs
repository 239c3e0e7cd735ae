//! Store access through the `nix` command line.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::StorePath;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{Derivation, DerivationOutput, Store, StoreError, StoreResult};

/// A [`Store`] backed by the local `nix` / `nix-store` binaries.
///
/// One process is spawned per query. The queue monitor's store traffic is
/// light (validity probes and derivation reads during expansion), so this
/// keeps the daemon free of a daemon-socket protocol implementation.
#[derive(Debug, Clone, Default)]
pub struct CliStore;

impl CliStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Store for CliStore {
    async fn is_valid_path(&self, path: &StorePath) -> StoreResult<bool> {
        let status = Command::new("nix-store")
            .arg("--check-validity")
            .arg(path.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn read_derivation(&self, path: &StorePath) -> StoreResult<Derivation> {
        debug!(drv = %path, "reading derivation");
        let output = Command::new("nix")
            .args(["--extra-experimental-features", "nix-command"])
            .args(["derivation", "show"])
            .arg(path.as_str())
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(StoreError::Command(format!(
                "nix derivation show {} exited with {}: {}",
                path,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_derivation_json(path, &output.stdout)
    }
}

/// JSON document emitted by `nix derivation show`: a map from derivation
/// path to the derivation body.
#[derive(Debug, Deserialize)]
struct ShownDerivation {
    system: String,
    #[serde(default)]
    outputs: BTreeMap<String, ShownOutput>,
    #[serde(default, rename = "inputDrvs")]
    input_drvs: BTreeMap<String, ShownInputDrv>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ShownOutput {
    path: String,
}

/// `inputDrvs` values changed shape across nix releases: older output a bare
/// list of output names, newer wrap it in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShownInputDrv {
    Outputs(BTreeSet<String>),
    Detailed { outputs: BTreeSet<String> },
}

impl ShownInputDrv {
    fn into_outputs(self) -> BTreeSet<String> {
        match self {
            ShownInputDrv::Outputs(outputs) | ShownInputDrv::Detailed { outputs } => outputs,
        }
    }
}

fn parse_derivation_json(path: &StorePath, json: &[u8]) -> StoreResult<Derivation> {
    let mut shown: HashMap<String, ShownDerivation> = serde_json::from_slice(json)?;
    let body = shown
        .remove(path.as_str())
        .or_else(|| {
            // `nix derivation show` may key by an output-qualified path;
            // fall back to the sole entry.
            let mut values = shown.drain().map(|(_, v)| v);
            let first = values.next();
            if values.next().is_none() {
                first
            } else {
                None
            }
        })
        .ok_or_else(|| StoreError::MissingDerivation(path.clone()))?;

    Ok(Derivation {
        platform: body.system,
        outputs: body
            .outputs
            .into_iter()
            .map(|(name, out)| (name, DerivationOutput { path: out.path.into() }))
            .collect(),
        input_drvs: body
            .input_drvs
            .into_iter()
            .map(|(drv, input)| (drv.into(), input.into_outputs()))
            .collect(),
        env: body.env,
    })
}
