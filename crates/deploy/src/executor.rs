//! Submitting transactions and waiting for them to become final.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use alloy_core::primitives::{Address, B256, Bytes, U256, b256};
use backon::Retryable;

use crate::{
    artifacts::Artifact,
    backend::{BackendError, ChainBackend, TxReceipt, TxRequest},
    config::{OrchestratorConfig, RetryPolicy},
    error::ConfigurationError,
    ledger::DeploymentRecord,
};

/// ERC-1967 storage slot holding a proxy's implementation address.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// Failure of a single transaction or read.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxError {
    #[error("{label} reverted: {reason}")]
    ExecutionReverted { label: String, reason: String },

    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries { attempts: u32, last: BackendError },

    #[error("transaction {tx_hash} was not included within {timeout:?}")]
    InclusionTimeout { tx_hash: B256, timeout: Duration },

    #[error(
        "transaction {tx_hash} reached {confirmations}/{required} confirmations within {timeout:?}"
    )]
    ConfirmationTimeout {
        tx_hash: B256,
        confirmations: u64,
        required: u64,
        timeout: Duration,
    },

    #[error("deploy transaction {0} created no contract")]
    MissingContractAddress(B256),

    #[error("{0} returned malformed data")]
    MalformedResponse(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Backend(BackendError),
}

impl TxError {
    fn from_backend(label: &str, error: BackendError, attempts: u32) -> Self {
        match error {
            BackendError::Transient(_) => Self::ExhaustedRetries {
                attempts,
                last: error,
            },
            BackendError::Reverted(reason) => Self::ExecutionReverted {
                label: label.to_string(),
                reason,
            },
            BackendError::Permanent(_) => Self::Backend(error),
        }
    }
}

pub type DeployError = TxError;
pub type CallError = TxError;

/// An included transaction that reached the confirmation threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTx {
    pub receipt: TxReceipt,
    pub confirmations: u64,
    /// Submissions it took, the successful one included.
    pub attempts: u32,
}

/// Sends transactions from the signing identity, one at a time.
///
/// Transient backend failures are retried under the [`RetryPolicy`]; everything else is
/// surfaced immediately. The executor never touches the ledger.
#[derive(Debug, Clone)]
pub struct TransactionExecutor<B> {
    backend: B,
    deployer: Address,
    confirmations: u64,
    retry: RetryPolicy,
    poll_interval: Duration,
    inclusion_timeout: Duration,
    confirmation_timeout: Duration,
}

impl<B: ChainBackend> TransactionExecutor<B> {
    pub fn new(backend: B, config: &OrchestratorConfig) -> Self {
        Self {
            backend,
            deployer: config.deployer,
            confirmations: config.confirmations,
            retry: config.retry.clone(),
            poll_interval: config.poll_interval(),
            inclusion_timeout: config.inclusion_timeout(),
            confirmation_timeout: config.confirmation_timeout(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn deployer(&self) -> Address {
        self.deployer
    }

    /// Deploy `artifact` with textual constructor arguments.
    pub async fn deploy(
        &self,
        name: &str,
        artifact: &Artifact,
        args: &[String],
    ) -> Result<DeploymentRecord, DeployError> {
        let data = artifact.encode_deploy(args)?;
        let constructor_args = artifact.encode_constructor_args(args)?;
        self.deploy_encoded(name, artifact, data, constructor_args)
            .await
    }

    /// Deploy already encoded creation code.
    ///
    /// `constructor_args` is kept on the record for source verification.
    pub async fn deploy_encoded(
        &self,
        name: &str,
        artifact: &Artifact,
        data: Bytes,
        constructor_args: Bytes,
    ) -> Result<DeploymentRecord, DeployError> {
        tracing::info!(contract = %name, artifact = %artifact.contract_name, "Deploying contract");

        let confirmed = self
            .execute(name, TxRequest::create(self.deployer, data))
            .await?;
        let address = confirmed
            .receipt
            .contract_address
            .ok_or(TxError::MissingContractAddress(
                confirmed.receipt.transaction_hash,
            ))?;

        tracing::info!(
            contract = %name,
            address = %address,
            tx_hash = %confirmed.receipt.transaction_hash,
            "Contract deployed"
        );

        Ok(DeploymentRecord::new(
            name,
            &artifact.contract_name,
            address,
            &confirmed,
            constructor_args,
        ))
    }

    /// Call `method` on the contract at `address` with textual arguments.
    pub async fn call(
        &self,
        address: Address,
        artifact: &Artifact,
        method: &str,
        args: &[String],
    ) -> Result<TxReceipt, CallError> {
        let data = artifact.encode_call(method, args)?;
        let label = format!("{}.{}", artifact.contract_name, method);
        self.send(&label, address, data)
            .await
            .map(|confirmed| confirmed.receipt)
    }

    /// Send encoded calldata to `to`.
    pub async fn send(&self, label: &str, to: Address, data: Bytes) -> Result<ConfirmedTx, CallError> {
        self.execute(label, TxRequest::call(self.deployer, to, data))
            .await
    }

    /// Submit, wait for inclusion, then wait for the confirmation threshold.
    async fn execute(&self, label: &str, tx: TxRequest) -> Result<ConfirmedTx, TxError> {
        let (tx_hash, attempts) = self
            .with_retry(label, || self.backend.submit_transaction(&tx))
            .await?;

        let receipt = self.wait_for_receipt(tx_hash).await?;
        if !receipt.status {
            return Err(TxError::ExecutionReverted {
                label: label.to_string(),
                reason: format!("receipt status 0 for {}", tx_hash),
            });
        }

        let confirmations = self.wait_for_confirmations(tx_hash).await?;

        tracing::info!(
            step = %label,
            tx_hash = %tx_hash,
            block = receipt.block_number,
            confirmations,
            attempts,
            "Transaction confirmed"
        );

        Ok(ConfirmedTx {
            receipt,
            confirmations,
            attempts,
        })
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<(T, u32), TxError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = AtomicU32::new(0);

        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            op()
        })
        .retry(self.retry.backoff())
        .when(BackendError::is_transient)
        .notify(|error, delay| {
            tracing::warn!(
                step = %label,
                attempt = attempts.load(Ordering::Relaxed),
                delay = ?delay,
                error = %error,
                "Transient failure, retrying"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        result
            .map(|value| (value, attempts))
            .map_err(|e| TxError::from_backend(label, e, attempts))
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt, TxError> {
        let start = Instant::now();

        loop {
            match self.backend.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {
                    tracing::trace!(tx_hash = %tx_hash, "Transaction not yet included");
                }
                Err(e) if e.is_transient() => {
                    tracing::trace!(tx_hash = %tx_hash, error = %e, "Receipt poll failed, retrying...");
                }
                Err(e) => return Err(TxError::from_backend("receipt", e, 1)),
            }

            if start.elapsed() > self.inclusion_timeout {
                return Err(TxError::InclusionTimeout {
                    tx_hash,
                    timeout: self.inclusion_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_confirmations(&self, tx_hash: B256) -> Result<u64, TxError> {
        let start = Instant::now();
        let mut confirmations = 0;

        loop {
            match self.backend.get_confirmations(tx_hash).await {
                Ok(current) => {
                    confirmations = current;
                    if confirmations >= self.confirmations {
                        return Ok(confirmations);
                    }
                    tracing::debug!(
                        tx_hash = %tx_hash,
                        confirmations,
                        required = self.confirmations,
                        "Waiting for confirmations"
                    );
                }
                Err(e) if e.is_transient() => {
                    tracing::trace!(tx_hash = %tx_hash, error = %e, "Confirmation poll failed, retrying...");
                }
                Err(e) => return Err(TxError::from_backend("confirmations", e, 1)),
            }

            if start.elapsed() > self.confirmation_timeout {
                return Err(TxError::ConfirmationTimeout {
                    tx_hash,
                    confirmations,
                    required: self.confirmations,
                    timeout: self.confirmation_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Deployed code at `address`; empty when nothing lives there.
    pub async fn code_at(&self, address: Address) -> Result<Bytes, TxError> {
        self.with_retry("eth_getCode", || self.backend.get_code(address))
            .await
            .map(|(code, _)| code)
    }

    /// Whether a contract is deployed at `address`.
    pub async fn is_live(&self, address: Address) -> Result<bool, TxError> {
        Ok(!self.code_at(address).await?.is_empty())
    }

    /// The implementation an ERC-1967 proxy currently points at.
    pub async fn implementation_of(&self, proxy: Address) -> Result<Address, TxError> {
        let (word, _) = self
            .with_retry("implementation slot", || {
                self.backend.get_storage_at(proxy, IMPLEMENTATION_SLOT)
            })
            .await?;
        Ok(Address::from_word(word))
    }

    /// Call a zero-argument getter returning an address.
    pub async fn read_address(
        &self,
        address: Address,
        artifact: &Artifact,
        getter: &str,
    ) -> Result<Address, TxError> {
        let data = artifact.encode_call(getter, &[])?;
        let label = format!("{}.{}", artifact.contract_name, getter);
        let (output, _) = self
            .with_retry(&label, || self.backend.call(address, data.clone()))
            .await?;

        if output.len() < 32 {
            return Err(TxError::MalformedResponse(label));
        }
        Ok(Address::from_word(B256::from_slice(&output[..32])))
    }

    pub async fn balance(&self, address: Address) -> Result<U256, TxError> {
        self.with_retry("eth_getBalance", || self.backend.get_balance(address))
            .await
            .map(|(balance, _)| balance)
    }
}
