//! Extraction of a finished build's outputs.

use kiln_core::StorePath;
use serde::{Deserialize, Serialize};

use crate::{Derivation, Store, StoreResult};

/// What a successful build produced, as recorded in the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub release_name: Option<String>,
    pub products: Vec<BuildProduct>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProduct {
    pub name: String,
    pub path: StorePath,
}

/// Collect the output record for `drv`, listing every declared output that
/// is present in the store. Used on the cached-success path, where all
/// outputs are expected to be valid already.
pub async fn get_build_output(store: &dyn Store, drv: &Derivation) -> StoreResult<BuildOutput> {
    let mut products = Vec::with_capacity(drv.outputs.len());
    for (name, out) in &drv.outputs {
        if store.is_valid_path(&out.path).await? {
            products.push(BuildProduct {
                name: name.clone(),
                path: out.path.clone(),
            });
        }
    }
    Ok(BuildOutput {
        release_name: drv.release_name().map(str::to_owned),
        products,
    })
}
