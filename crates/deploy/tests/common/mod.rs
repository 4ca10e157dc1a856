//! Shared fixtures: an in-memory chain, a scripted explorer and test artifacts.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256, Bytes, U256, keccak256},
};
use keel_deploy::{
    Artifact, BackendError, ChainBackend, ContractRegistry, IMPLEMENTATION_SLOT, JobStatus,
    OrchestratorConfig, RetryPolicy, ServiceError, Submission, TxReceipt, TxRequest,
    VerificationRequest, VerificationService,
};
use serde_json::json;

pub const DEPLOYER: Address = Address::new([0xde; 20]);

pub const PROXY_CODE: [u8; 2] = [0x60, 0xff];

/// Function selector of `signature`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A transaction that was accepted by the chain.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub to: Option<Address>,
    pub data: Bytes,
    pub created: Option<Address>,
}

impl SentTx {
    pub fn selector(&self) -> Option<[u8; 4]> {
        (self.data.len() >= 4).then(|| [self.data[0], self.data[1], self.data[2], self.data[3]])
    }
}

#[derive(Default)]
struct ChainState {
    block: u64,
    nonce: u64,
    code: HashMap<Address, Bytes>,
    storage: HashMap<(Address, B256), B256>,
    receipts: HashMap<B256, TxReceipt>,
    sent: Vec<SentTx>,
    attempts: Vec<Bytes>,
    /// Errors returned to submissions whose data starts with the prefix, in order.
    failures: VecDeque<(Vec<u8>, BackendError)>,
    /// Data prefixes whose transactions are included with status 0.
    reverting: HashSet<Vec<u8>>,
    views: HashMap<[u8; 4], Address>,
    proxies: HashSet<Address>,
    ignore_upgrades: bool,
    destroy_on_upgrade: bool,
    hide_receipts: bool,
}

/// An in-memory chain. Every confirmation poll mines a block.
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Fail the next submissions whose data starts with `prefix`, once per error.
    pub fn fail_submissions(&self, prefix: &[u8], errors: Vec<BackendError>) {
        let mut state = self.state();
        for error in errors {
            state.failures.push_back((prefix.to_vec(), error));
        }
    }

    /// Include transactions whose data starts with `prefix` with a failed status.
    pub fn revert_on(&self, prefix: &[u8]) {
        self.state().reverting.insert(prefix.to_vec());
    }

    pub fn clear_reverts(&self) {
        self.state().reverting.clear();
    }

    /// Answer `eth_call`s with `selector` with `address`.
    pub fn set_view(&self, selector: [u8; 4], address: Address) {
        self.state().views.insert(selector, address);
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state().code.insert(address, code);
    }

    /// Remove the code at `address`, as after a chain reset.
    pub fn wipe(&self, address: Address) {
        self.state().code.remove(&address);
    }

    /// Accept upgrade calls without moving the implementation slot.
    pub fn ignore_upgrades(&self) {
        self.state().ignore_upgrades = true;
    }

    /// Remove a proxy's code when it is upgraded, as if the new implementation self-destructed.
    pub fn destroy_on_upgrade(&self) {
        self.state().destroy_on_upgrade = true;
    }

    /// Never report receipts.
    pub fn hide_receipts(&self) {
        self.state().hide_receipts = true;
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    pub fn transaction_count(&self) -> usize {
        self.state().sent.len()
    }

    /// Submissions, successful or not, whose data starts with `prefix`.
    pub fn attempts_for(&self, prefix: &[u8]) -> usize {
        self.state()
            .attempts
            .iter()
            .filter(|data| data.starts_with(prefix))
            .count()
    }

    pub fn total_attempts(&self) -> usize {
        self.state().attempts.len()
    }

    /// Contracts created from `code`, in creation order.
    pub fn created_from(&self, code: &[u8]) -> Vec<Address> {
        self.state()
            .sent
            .iter()
            .filter(|tx| tx.to.is_none() && tx.data.starts_with(code))
            .filter_map(|tx| tx.created)
            .collect()
    }

    /// Calls sent with `selector`.
    pub fn calls_with(&self, selector: [u8; 4]) -> Vec<SentTx> {
        self.state()
            .sent
            .iter()
            .filter(|tx| tx.to.is_some() && tx.selector() == Some(selector))
            .cloned()
            .collect()
    }

    pub fn implementation_of(&self, proxy: Address) -> Address {
        let word = self
            .state()
            .storage
            .get(&(proxy, IMPLEMENTATION_SLOT))
            .copied()
            .unwrap_or_default();
        Address::from_word(word)
    }
}

fn word_address(data: &[u8], offset: usize) -> Address {
    Address::from_word(B256::from_slice(&data[offset..offset + 32]))
}

impl ChainBackend for MockChain {
    async fn submit_transaction(&self, tx: &TxRequest) -> Result<B256, BackendError> {
        let mut state = self.state();
        state.attempts.push(tx.data.clone());

        if let Some(index) = state
            .failures
            .iter()
            .position(|(prefix, _)| tx.data.starts_with(prefix))
        {
            let (_, error) = state.failures.remove(index).unwrap();
            return Err(error);
        }

        state.nonce += 1;
        state.block += 1;
        let nonce = state.nonce;
        let block = state.block;
        let tx_hash = keccak256(format!("tx-{nonce}"));

        let status = !state
            .reverting
            .iter()
            .any(|prefix| tx.data.starts_with(prefix));

        let mut created = None;
        if status {
            match tx.to {
                None => {
                    let address = Address::from_word(keccak256(format!("contract-{nonce}")));
                    state.code.insert(address, tx.data.clone());
                    if tx.data.starts_with(&PROXY_CODE) {
                        let implementation = word_address(&tx.data, PROXY_CODE.len());
                        state.proxies.insert(address);
                        state
                            .storage
                            .insert((address, IMPLEMENTATION_SLOT), implementation.into_word());
                    }
                    created = Some(address);
                }
                Some(to) => {
                    let is_upgrade = tx.data.len() >= 36
                        && (tx.data.starts_with(&selector("upgradeToAndCall(address,bytes)"))
                            || tx.data.starts_with(&selector("upgradeTo(address)")));
                    if is_upgrade && state.proxies.contains(&to) && !state.ignore_upgrades {
                        let implementation = word_address(&tx.data, 4);
                        state
                            .storage
                            .insert((to, IMPLEMENTATION_SLOT), implementation.into_word());
                    }
                    if is_upgrade && state.destroy_on_upgrade {
                        state.code.remove(&to);
                    }
                }
            }
        }

        state.sent.push(SentTx {
            to: tx.to,
            data: tx.data.clone(),
            created,
        });
        state.receipts.insert(
            tx_hash,
            TxReceipt {
                transaction_hash: tx_hash,
                status,
                block_number: block,
                to: tx.to,
                contract_address: created,
            },
        );
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, BackendError> {
        let state = self.state();
        if state.hide_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn get_confirmations(&self, tx_hash: B256) -> Result<u64, BackendError> {
        let mut state = self.state();
        state.block += 1;
        let block = state.block;
        Ok(state
            .receipts
            .get(&tx_hash)
            .map_or(0, |r| block - r.block_number + 1))
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, BackendError> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }

    async fn get_storage_at(&self, address: Address, slot: B256) -> Result<B256, BackendError> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, BackendError> {
        let state = self.state();
        let selector = [data[0], data[1], data[2], data[3]];
        state
            .views
            .get(&selector)
            .map(|address| Bytes::from(address.into_word().to_vec()))
            .ok_or_else(|| BackendError::Reverted("no such view".to_string()))
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, BackendError> {
        Ok(U256::from(10u64).pow(U256::from(18u64)))
    }
}

#[derive(Default)]
struct ExplorerState {
    submissions: usize,
    status_checks: usize,
    rate_limited: usize,
    pending_polls: usize,
    rejected: HashSet<String>,
}

/// A verification service with scripted answers.
#[derive(Clone, Default)]
pub struct MockExplorer {
    state: Arc<Mutex<ExplorerState>>,
}

impl MockExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ExplorerState> {
        self.state.lock().unwrap()
    }

    /// Answer the next `n` requests with a rate limit.
    pub fn rate_limit(&self, n: usize) {
        self.state().rate_limited = n;
    }

    /// Report the next `n` status checks as pending.
    pub fn pending_for(&self, n: usize) {
        self.state().pending_polls = n;
    }

    /// Fail verification of contracts built from `contract_name`.
    pub fn reject(&self, contract_name: &str) {
        self.state().rejected.insert(contract_name.to_string());
    }

    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    pub fn status_checks(&self) -> usize {
        self.state().status_checks
    }

    pub fn calls(&self) -> usize {
        let state = self.state();
        state.submissions + state.status_checks
    }
}

impl VerificationService for MockExplorer {
    async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<Submission, ServiceError> {
        let mut state = self.state();
        state.submissions += 1;
        if state.rate_limited > 0 {
            state.rate_limited -= 1;
            return Err(ServiceError::RateLimited("Max rate limit reached".to_string()));
        }
        let prefix = if state.rejected.contains(&request.source.contract_name) {
            "fail"
        } else {
            "job"
        };
        Ok(Submission::Queued(format!("{prefix}-{}", request.address)))
    }

    async fn get_verification_status(&self, job: &str) -> Result<JobStatus, ServiceError> {
        let mut state = self.state();
        state.status_checks += 1;
        if state.rate_limited > 0 {
            state.rate_limited -= 1;
            return Err(ServiceError::RateLimited("Max rate limit reached".to_string()));
        }
        if job.starts_with("fail") {
            return Ok(JobStatus::Failed("Fail - Unable to verify".to_string()));
        }
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(JobStatus::Pending);
        }
        Ok(JobStatus::Verified)
    }
}

fn function(name: &str, inputs: &[&str], outputs: &[&str]) -> serde_json::Value {
    let params = |types: &[&str]| {
        types
            .iter()
            .enumerate()
            .map(|(i, ty)| json!({ "name": format!("arg{i}"), "type": ty }))
            .collect::<Vec<_>>()
    };
    json!({
        "type": "function",
        "name": name,
        "inputs": params(inputs),
        "outputs": params(outputs),
        "stateMutability": "nonpayable",
    })
}

fn constructor(inputs: &[&str]) -> serde_json::Value {
    let inputs: Vec<_> = inputs
        .iter()
        .enumerate()
        .map(|(i, ty)| json!({ "name": format!("arg{i}"), "type": ty }))
        .collect();
    json!({ "type": "constructor", "inputs": inputs, "stateMutability": "nonpayable" })
}

fn artifact(name: &str, code: [u8; 2], abi: Vec<serde_json::Value>) -> Artifact {
    let abi: JsonAbi = serde_json::from_value(serde_json::Value::Array(abi)).unwrap();
    Artifact::new(name, abi, Bytes::from(code.to_vec()))
}

pub const A_CODE: [u8; 2] = [0x60, 0x01];
pub const B_CODE: [u8; 2] = [0x60, 0x02];
pub const C_CODE: [u8; 2] = [0x60, 0x03];
pub const FACTORY_V1_CODE: [u8; 2] = [0x60, 0x10];
pub const FACTORY_V2_CODE: [u8; 2] = [0x60, 0x11];
pub const MINTER_CODE: [u8; 2] = [0x60, 0x20];
pub const KEY_CODE: [u8; 2] = [0x60, 0x21];
pub const TOKEN_CODE: [u8; 2] = [0x60, 0x30];

/// Artifacts for every contract used by the tests.
pub fn registry() -> ContractRegistry {
    let factory_abi = || {
        vec![
            function("initialize", &["address"], &[]),
            function("upgradeToAndCall", &["address", "bytes"], &[]),
            function("setBadge", &["address"], &[]),
        ]
    };

    ContractRegistry::from_artifacts([
        artifact(
            "A",
            A_CODE,
            vec![
                function("setBAddress", &["address"], &[]),
                function("setCAddress", &["address"], &[]),
                function("grantRole", &["bytes32", "address"], &[]),
            ],
        ),
        artifact("B", B_CODE, vec![constructor(&["address"])]),
        artifact("C", C_CODE, vec![constructor(&["address", "address"])]),
        artifact(
            "ERC1967Proxy",
            PROXY_CODE,
            vec![constructor(&["address", "bytes"])],
        ),
        artifact("FactoryV1", FACTORY_V1_CODE, factory_abi()),
        artifact("FactoryV2", FACTORY_V2_CODE, factory_abi()),
        artifact(
            "Minter",
            MINTER_CODE,
            vec![function("keyToken", &[], &["address"])],
        ),
        artifact("Key", KEY_CODE, vec![constructor(&["address"])]),
        artifact("Token", TOKEN_CODE, vec![constructor(&["address", "uint256"])]),
    ])
}

/// A config with millisecond delays so retries and polls do not slow tests down.
pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        deployer: DEPLOYER,
        retry: RetryPolicy {
            base_delay_ms: 1,
            factor: 2.0,
            max_attempts: 5,
            max_delay_ms: 4,
        },
        poll_interval_ms: 1,
        inclusion_timeout_secs: 1,
        confirmation_timeout_secs: 5,
        verify: false,
        verification_poll_attempts: 5,
        ..OrchestratorConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
