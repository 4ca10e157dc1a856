//! The persisted record of what a plan has already done on chain.
//!
//! The ledger is read before every step and checkpointed after every successful one,
//! which is what makes runs resumable. It is stored as pretty JSON and rewritten
//! atomically (temp file, then rename).

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256, Bytes};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::executor::ConfirmedTx;

/// Ledger persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to access ledger {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse ledger {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("ledger {0} is locked by another run")]
    Locked(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Source verification progress of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    /// Submitted; `job` is the explorer's id for the request.
    Pending { job: String },
    Verified,
    Failed { reason: String },
}

impl VerificationStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unverified => write!(f, "unverified"),
            Self::Pending { job } => write!(f, "pending ({job})"),
            Self::Verified => write!(f, "verified"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// One deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub contract_name: String,
    /// Artifact the deployed code came from.
    pub artifact: String,
    pub address: Address,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub confirmations: u64,
    /// ABI-encoded constructor arguments.
    #[serde(default)]
    pub constructor_args: Bytes,
    /// Fingerprint of the plan entry this record was deployed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    /// Unix timestamp of the deployment.
    pub deployed_at: i64,
    #[serde(default)]
    pub verified: VerificationStatus,
}

impl DeploymentRecord {
    pub fn new(
        contract_name: &str,
        artifact: &str,
        address: Address,
        confirmed: &ConfirmedTx,
        constructor_args: Bytes,
    ) -> Self {
        Self {
            contract_name: contract_name.to_string(),
            artifact: artifact.to_string(),
            address,
            transaction_hash: confirmed.receipt.transaction_hash,
            block_number: confirmed.receipt.block_number,
            confirmations: confirmed.confirmations,
            constructor_args,
            spec_hash: None,
            deployed_at: chrono::Utc::now().timestamp(),
            verified: VerificationStatus::Unverified,
        }
    }

    pub fn with_spec_hash(mut self, spec_hash: String) -> Self {
        self.spec_hash = Some(spec_hash);
        self
    }

    /// A contract created by `parent`'s constructor, sharing its transaction.
    pub fn derived(
        parent: &DeploymentRecord,
        contract_name: &str,
        artifact: &str,
        address: Address,
        constructor_args: Bytes,
    ) -> Self {
        Self {
            contract_name: contract_name.to_string(),
            artifact: artifact.to_string(),
            address,
            transaction_hash: parent.transaction_hash,
            block_number: parent.block_number,
            confirmations: parent.confirmations,
            constructor_args,
            spec_hash: None,
            deployed_at: parent.deployed_at,
            verified: VerificationStatus::Unverified,
        }
    }
}

/// One implementation switch of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRecord {
    pub from: Address,
    pub to: Address,
    /// Ledger key of the new implementation's record.
    pub implementation_record: String,
    pub transaction_hash: B256,
}

/// A contract living behind an upgradeable proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDeployment {
    /// Never changes once recorded.
    pub proxy_address: Address,
    pub implementation_address: Address,
    /// Ledger key of the current implementation's record.
    pub implementation_record: String,
    /// Flips to true exactly once.
    pub initialized: bool,
    #[serde(default)]
    pub upgrade_history: Vec<UpgradeRecord>,
}

impl ProxyDeployment {
    pub fn new(proxy_address: Address, implementation: &DeploymentRecord, key: String) -> Self {
        Self {
            proxy_address,
            implementation_address: implementation.address,
            implementation_record: key,
            initialized: false,
            upgrade_history: Vec::new(),
        }
    }

    /// Generation of the next implementation: 0 is the first, n the n-th upgrade.
    pub fn next_generation(&self) -> usize {
        self.upgrade_history.len() + 1
    }
}

/// A completed wiring step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringRecord {
    pub transaction_hash: B256,
    /// keccak256 of the calldata sent; a step with different calldata runs again.
    pub calldata_hash: B256,
}

/// Everything deployed, wired and verified so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLedger {
    #[serde(default)]
    pub records: BTreeMap<String, DeploymentRecord>,
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyDeployment>,
    /// Keyed by wiring slot, `<target>.<method>` unless the step names one.
    #[serde(default)]
    pub wiring: BTreeMap<String, WiringRecord>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl DeploymentLedger {
    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the ledger at `path`, starting empty when the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let mut ledger = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::info!(path = %path.display(), "No ledger found, starting a new one");
            Self::default()
        };
        ledger.path = Some(path.to_path_buf());
        Ok(ledger)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, LedgerError> {
        let content = std::fs::read_to_string(path).map_err(io_error(path))?;
        let ledger: Self = serde_json::from_str(&content).map_err(|source| LedgerError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!(
            path = %path.display(),
            records = ledger.records.len(),
            proxies = ledger.proxies.len(),
            wiring = ledger.wiring.len(),
            "Ledger loaded"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the ledger to `path` atomically.
    pub fn save_to_file(&self, path: &Path) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let tmp = temp_path(path);
        std::fs::write(&tmp, json).map_err(io_error(&tmp))?;
        std::fs::rename(&tmp, path).map_err(io_error(path))?;
        Ok(())
    }

    /// Persist to the ledger's own file, if it has one.
    pub fn checkpoint(&self) -> Result<(), LedgerError> {
        match &self.path {
            Some(path) => self.save_to_file(path),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.proxies.is_empty() && self.wiring.is_empty()
    }

    pub fn record(&self, name: &str) -> Option<&DeploymentRecord> {
        self.records.get(name)
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.record(name).map(|r| r.address)
    }

    pub fn insert_record(&mut self, key: impl Into<String>, record: DeploymentRecord) {
        self.records.insert(key.into(), record);
    }

    /// Drop a record whose contract no longer exists on chain.
    pub fn remove_record(&mut self, key: &str) -> Option<DeploymentRecord> {
        self.records.remove(key)
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyDeployment> {
        self.proxies.get(name)
    }

    pub fn proxy_mut(&mut self, name: &str) -> Option<&mut ProxyDeployment> {
        self.proxies.get_mut(name)
    }

    /// Name of the plan contract whose proxy lives at `address`.
    pub fn proxy_named_at(&self, address: Address) -> Option<&str> {
        self.proxies
            .iter()
            .find(|(_, p)| p.proxy_address == address)
            .map(|(name, _)| name.as_str())
    }

    pub fn set_proxy(&mut self, name: impl Into<String>, proxy: ProxyDeployment) {
        self.proxies.insert(name.into(), proxy);
    }

    /// Drop a proxy that no longer exists on chain, with its record and the implementations
    /// it was upgraded to. The first implementation is kept for a new proxy to reuse.
    pub fn remove_proxy(&mut self, name: &str) -> Option<ProxyDeployment> {
        self.records.remove(name);
        let proxy = self.proxies.remove(name)?;
        for upgrade in &proxy.upgrade_history {
            self.records.remove(&upgrade.implementation_record);
        }
        Some(proxy)
    }

    pub fn wiring_record(&self, key: &str) -> Option<&WiringRecord> {
        self.wiring.get(key)
    }

    pub fn record_wiring(&mut self, key: impl Into<String>, record: WiringRecord) {
        self.wiring.insert(key.into(), record);
    }

    pub fn set_verification(&mut self, key: &str, status: VerificationStatus) {
        if let Some(record) = self.records.get_mut(key) {
            record.verified = status;
        }
    }

    /// Ledger key of the `generation`-th implementation behind `name`'s proxy.
    pub fn implementation_key(name: &str, generation: usize) -> String {
        format!("{name}.impl.{generation}")
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Exclusive advisory lock on `<ledger>.lock`, held for the lifetime of a run.
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

impl LedgerLock {
    pub fn acquire(ledger_path: &Path) -> Result<Self, LedgerError> {
        let mut name = ledger_path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let path = ledger_path.with_file_name(name);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let file = File::create(&path).map_err(io_error(&path))?;
        file.try_lock_exclusive()
            .map_err(|_| LedgerError::Locked(ledger_path.to_path_buf()))?;

        tracing::debug!(path = %path.display(), "Ledger lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release ledger lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn record(name: &str, last_byte: u8) -> DeploymentRecord {
        DeploymentRecord {
            contract_name: name.to_string(),
            artifact: name.to_string(),
            address: Address::with_last_byte(last_byte),
            transaction_hash: B256::with_last_byte(last_byte),
            block_number: 10,
            confirmations: 5,
            constructor_args: Bytes::new(),
            spec_hash: Some("abc".to_string()),
            deployed_at: 1737316800,
            verified: VerificationStatus::Pending {
                job: "guid".to_string(),
            },
        }
    }

    #[test]
    fn test_ledger_save_and_load() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("deployments/ledger.json");

        let mut ledger = DeploymentLedger::open(&path).expect("Failed to open ledger");
        assert!(ledger.is_empty());

        ledger.insert_record("A", record("A", 1));
        let implementation = record("B.impl.0", 2);
        ledger.set_proxy(
            "B",
            ProxyDeployment::new(Address::with_last_byte(3), &implementation, "B.impl.0".into()),
        );
        ledger.insert_record("B.impl.0", implementation);
        ledger.record_wiring(
            "A.setB",
            WiringRecord {
                transaction_hash: B256::with_last_byte(4),
                calldata_hash: B256::with_last_byte(5),
            },
        );
        ledger.checkpoint().expect("Failed to save ledger");
        assert!(!temp_path(&path).exists(), "Temp file should be renamed away");

        let loaded = DeploymentLedger::open(&path).expect("Failed to reopen ledger");
        assert_eq!(loaded, ledger);
        assert_eq!(loaded.address_of("A"), Some(Address::with_last_byte(1)));
        assert_eq!(loaded.proxy_named_at(Address::with_last_byte(3)), Some("B"));
    }

    #[test]
    fn test_ledger_json_shape() {
        let mut ledger = DeploymentLedger::in_memory();
        ledger.insert_record("A", record("A", 1));

        let json: serde_json::Value = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["records"]["A"]["verified"]["status"], "pending");
        assert_eq!(json["records"]["A"]["verified"]["job"], "guid");
        assert_eq!(
            json["records"]["A"]["address"],
            "0x0000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_ledger_load_corrupted_file() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("ledger.json");
        std::fs::write(&path, "{ invalid json }").expect("Failed to write corrupted file");

        assert!(matches!(
            DeploymentLedger::open(&path),
            Err(LedgerError::Parse { .. })
        ));
    }

    #[test]
    fn test_in_memory_checkpoint_is_noop() {
        let ledger = DeploymentLedger::in_memory();
        assert!(ledger.path().is_none());
        assert!(ledger.checkpoint().is_ok());
    }

    #[test]
    fn test_set_verification() {
        let mut ledger = DeploymentLedger::in_memory();
        ledger.insert_record("A", record("A", 1));
        ledger.set_verification("A", VerificationStatus::Verified);
        assert!(ledger.record("A").unwrap().verified.is_verified());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("ledger.json");

        let lock = LedgerLock::acquire(&path).expect("First lock should succeed");
        assert!(matches!(
            LedgerLock::acquire(&path),
            Err(LedgerError::Locked(_))
        ));

        drop(lock);
        assert!(LedgerLock::acquire(&path).is_ok());
    }
}
