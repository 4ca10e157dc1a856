//! The chain a plan is deployed to.

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes, U256};

mod rpc;
pub use alloy_signer_local::PrivateKeySigner;
pub use rpc::JsonRpcBackend;

/// A transaction to submit from the signing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    /// `None` creates a contract from `data`.
    pub to: Option<Address>,
    pub data: Bytes,
}

impl TxRequest {
    pub fn create(from: Address, data: Bytes) -> Self {
        Self {
            from,
            to: None,
            data,
        }
    }

    pub fn call(from: Address, to: Address, data: Bytes) -> Self {
        Self {
            from,
            to: Some(to),
            data,
        }
    }
}

/// The receipt of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    /// `false` when execution reverted.
    pub status: bool,
    pub block_number: u64,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
}

/// A backend failure, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Timeouts, unreachable nodes, rate limits, nonce races.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The transaction or call was rejected by execution.
    #[error("execution reverted: {0}")]
    Reverted(String),

    /// Any other failure that will not go away on retry.
    #[error("backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Everything the orchestrator needs from a chain.
///
/// Implementations classify their failures into [`BackendError`] variants; the executor
/// decides what to retry from that classification alone.
pub trait ChainBackend: Send + Sync {
    /// Submit a transaction signed by `tx.from`, returning its hash.
    fn submit_transaction(
        &self,
        tx: &TxRequest,
    ) -> impl Future<Output = Result<B256, BackendError>> + Send;

    /// The receipt of `tx_hash`, or `None` while it is not yet included.
    fn get_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<TxReceipt>, BackendError>> + Send;

    /// Blocks mined on top of, and including, the block containing `tx_hash`.
    fn get_confirmations(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<u64, BackendError>> + Send;

    fn get_code(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Bytes, BackendError>> + Send;

    fn get_storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = Result<B256, BackendError>> + Send;

    /// Execute a read-only call against the latest block.
    fn call(
        &self,
        to: Address,
        data: Bytes,
    ) -> impl Future<Output = Result<Bytes, BackendError>> + Send;

    fn get_balance(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<U256, BackendError>> + Send;
}
