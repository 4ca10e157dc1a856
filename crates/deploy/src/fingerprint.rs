use alloy_core::primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifacts::Artifact;

/// The inputs that, when changed, make a recorded deployment out of date.
///
/// Only what ends up on chain is included: the creation bytecode and the resolved
/// arguments. Renaming a plan entry or reordering the plan does not change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFingerprint {
    /// Artifact name the contract was built from.
    pub artifact: String,
    /// keccak256 of the creation bytecode.
    pub bytecode_hash: B256,
    /// Constructor arguments, or initializer arguments behind a proxy.
    pub args: Vec<String>,
    pub upgradeable: bool,
    /// Initializer called through the proxy, for upgradeable contracts.
    pub initializer: Option<String>,
}

impl SpecFingerprint {
    pub fn new(artifact: &Artifact, args: &[String]) -> Self {
        Self {
            artifact: artifact.contract_name.clone(),
            bytecode_hash: keccak256(&artifact.bytecode),
            args: args.to_vec(),
            upgradeable: false,
            initializer: None,
        }
    }

    pub fn behind_proxy(mut self, initializer: &str) -> Self {
        self.upgradeable = true;
        self.initializer = Some(initializer.to_string());
        self
    }

    /// Compute a SHA-256 hash of this fingerprint.
    ///
    /// The same inputs always produce the same hash. Struct fields serialize in
    /// declaration order, so the JSON form is stable.
    pub fn compute_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}
