// SPDX-License-Identifier: AGPL-3.0

//! Build artifact input.
//!
//! Compilation is out of scope: the driver consumes a JSON file holding,
//! per contract, the runtime bytecode, ABI, source map, source ids, and
//! method selectors.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

use symx_calldata::AbiEntry;
use symx_errors::{SymxError, SymxResult};

#[derive(Debug, Deserialize)]
pub struct Artifact {
    pub contracts: IndexMap<String, ContractArtifact>,
}

#[derive(Debug, Deserialize)]
pub struct ContractArtifact {
    /// Runtime bytecode as a hex string.
    pub hexcode: String,
    #[serde(default)]
    pub abi: Vec<AbiEntry>,
    #[serde(default)]
    pub srcmap: String,
    #[serde(default)]
    pub srcs: IndexMap<String, SrcFile>,
    /// Function signature -> 4-byte selector hex.
    #[serde(rename = "methodIdentifiers", default)]
    pub method_identifiers: IndexMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SrcFile {
    pub id: i64,
}

impl Artifact {
    pub fn load(path: &Path) -> SymxResult<Artifact> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SymxError::Artifact(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SymxError::Artifact(format!("{}: {}", path.display(), e)))
    }
}

impl ContractArtifact {
    /// Test signatures matching the function prefix, in artifact order.
    pub fn test_signatures(&self, prefix: &str) -> Vec<String> {
        self.method_identifiers
            .keys()
            .filter(|sig| sig.starts_with(prefix))
            .cloned()
            .collect()
    }
}
