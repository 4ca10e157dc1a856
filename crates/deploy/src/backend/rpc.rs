//! Ethereum JSON-RPC backend.

use std::time::Duration;

use alloy_consensus::{SignableTransaction, Signed, TxEip1559, TxEnvelope};
use alloy_core::primitives::{Address, B256, Bytes, TxKind, U64, U128, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use tokio::sync::OnceCell;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{BackendError, ChainBackend, TxReceipt, TxRequest};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error messages a node returns for conditions that clear up on their own.
const TRANSIENT_MESSAGES: &[&str] = &[
    "nonce too low",
    "replacement transaction underpriced",
    "already known",
    "header not found",
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
];

/// Error messages a node returns when execution itself failed.
const REVERT_MESSAGES: &[&str] = &["execution reverted", "revert", "out of gas", "invalid opcode"];

/// Headroom added on top of `eth_estimateGas`, in percent.
const GAS_LIMIT_MARGIN: u64 = 20;

/// A [`ChainBackend`] talking JSON-RPC over HTTP.
///
/// With a local signer, transactions are signed here and sent with `eth_sendRawTransaction`.
/// Without one they are sent with `eth_sendTransaction`, so the node must hold the key of the
/// `from` account (anvil, a hardhat node, or geth behind Clef).
#[derive(Debug, Clone)]
pub struct JsonRpcBackend {
    client: reqwest::Client,
    url: Url,
    signer: Option<PrivateKeySigner>,
    chain_id: OnceCell<u64>,
}

/// Chain and fee fields of a locally signed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxParams {
    chain_id: u64,
    nonce: u64,
    gas_limit: u64,
    max_fee_per_gas: u128,
    max_priority_fee_per_gas: u128,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    status: Option<U64>,
    block_number: Option<U64>,
    to: Option<Address>,
    contract_address: Option<Address>,
}

impl JsonRpcBackend {
    pub fn new(url: Url) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url,
            signer: None,
            chain_id: OnceCell::new(),
        })
    }

    /// Sign transactions locally with `signer` instead of asking the node to.
    pub fn with_signer(mut self, signer: PrivateKeySigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The address transactions are signed for locally, if any.
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(PrivateKeySigner::address)
    }

    async fn chain_id(&self) -> Result<u64, BackendError> {
        self.chain_id
            .get_or_try_init(|| async {
                let id: U64 = self.request("eth_chainId", vec![]).await?;
                Ok(id.to::<u64>())
            })
            .await
            .copied()
    }

    /// Fill nonce, gas and fees for `tx` from the node.
    async fn tx_params(&self, tx: &TxRequest) -> Result<TxParams, BackendError> {
        let chain_id = self.chain_id().await?;
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                vec![json!(tx.from), json!("pending")],
            )
            .await?;

        let mut estimate_request = json!({ "from": tx.from, "data": tx.data });
        if let Some(to) = tx.to {
            estimate_request["to"] = json!(to);
        }
        let estimate: U64 = self
            .request("eth_estimateGas", vec![estimate_request])
            .await?;

        let gas_price: U128 = self.request("eth_gasPrice", vec![]).await?;
        let priority_fee = match self
            .request::<U128>("eth_maxPriorityFeePerGas", vec![])
            .await
        {
            Ok(fee) => fee.to::<u128>(),
            // Nodes without EIP-1559 fee estimation.
            Err(BackendError::Permanent(_)) => 0,
            Err(e) => return Err(e),
        };

        let estimate = estimate.to::<u64>();
        let max_fee_per_gas = gas_price
            .to::<u128>()
            .saturating_mul(2)
            .saturating_add(priority_fee);
        Ok(TxParams {
            chain_id,
            nonce: nonce.to::<u64>(),
            gas_limit: estimate.saturating_add(estimate * GAS_LIMIT_MARGIN / 100),
            max_fee_per_gas,
            max_priority_fee_per_gas: priority_fee.min(max_fee_per_gas),
        })
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(method, status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("{method}: malformed response: {e}")))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let data = error.get("data").map(Value::to_string);
            return Err(classify_rpc_error(method, message, data.as_deref()));
        }

        let result = body.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| BackendError::Permanent(format!("{method}: unexpected result: {e}")))
    }
}

/// Classify a non-success HTTP status.
fn classify_status(method: &str, status: u16) -> BackendError {
    let message = format!("{method}: HTTP {status}");
    if status == 429 || status >= 500 {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

/// Classify a JSON-RPC error object by its message.
fn classify_rpc_error(method: &str, message: &str, data: Option<&str>) -> BackendError {
    let lower = message.to_lowercase();
    let detail = match data {
        Some(data) => format!("{method}: {message} ({data})"),
        None => format!("{method}: {message}"),
    };

    if REVERT_MESSAGES.iter().any(|m| lower.contains(m)) {
        BackendError::Reverted(detail)
    } else if TRANSIENT_MESSAGES.iter().any(|m| lower.contains(m)) {
        BackendError::Transient(detail)
    } else {
        BackendError::Permanent(detail)
    }
}

/// Sign `tx` as an EIP-1559 transaction.
fn sign_transaction(
    signer: &PrivateKeySigner,
    tx: &TxRequest,
    params: TxParams,
) -> Result<Signed<TxEip1559>, BackendError> {
    if tx.from != signer.address() {
        return Err(BackendError::Permanent(format!(
            "transaction from {} cannot be signed with the key of {}",
            tx.from,
            signer.address()
        )));
    }

    let unsigned = TxEip1559 {
        chain_id: params.chain_id,
        nonce: params.nonce,
        gas_limit: params.gas_limit,
        max_fee_per_gas: params.max_fee_per_gas,
        max_priority_fee_per_gas: params.max_priority_fee_per_gas,
        to: tx.to.map_or(TxKind::Create, TxKind::Call),
        value: U256::ZERO,
        input: tx.data.clone(),
        ..Default::default()
    };
    let signature = signer
        .sign_hash_sync(&unsigned.signature_hash())
        .map_err(|e| BackendError::Permanent(format!("failed to sign transaction: {e}")))?;
    Ok(unsigned.into_signed(signature))
}

impl ChainBackend for JsonRpcBackend {
    async fn submit_transaction(&self, tx: &TxRequest) -> Result<B256, BackendError> {
        if let Some(signer) = &self.signer {
            let params = self.tx_params(tx).await?;
            let signed = sign_transaction(signer, tx, params)?;
            let raw = Bytes::from(TxEnvelope::from(signed).encoded_2718());

            let hash: B256 = self
                .request("eth_sendRawTransaction", vec![json!(raw)])
                .await?;
            tracing::debug!(
                tx_hash = %hash,
                from = %tx.from,
                nonce = params.nonce,
                gas_limit = params.gas_limit,
                "Signed transaction submitted"
            );
            return Ok(hash);
        }

        let mut payload = json!({
            "from": tx.from,
            "data": tx.data,
        });
        if let Some(to) = tx.to {
            payload["to"] = json!(to);
        }

        let hash: B256 = self.request("eth_sendTransaction", vec![payload]).await?;
        tracing::debug!(tx_hash = %hash, from = %tx.from, "Transaction submitted");
        Ok(hash)
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, BackendError> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;

        // Pending receipts (no block number yet) count as not included.
        Ok(raw.and_then(|raw| {
            let block_number = raw.block_number?.to::<u64>();
            Some(TxReceipt {
                transaction_hash: raw.transaction_hash,
                status: raw.status.is_none_or(|s| s == U64::from(1)),
                block_number,
                to: raw.to,
                contract_address: raw.contract_address,
            })
        }))
    }

    async fn get_confirmations(&self, tx_hash: B256) -> Result<u64, BackendError> {
        let Some(receipt) = self.get_receipt(tx_hash).await? else {
            return Ok(0);
        };
        let latest: U64 = self.request("eth_blockNumber", vec![]).await?;
        Ok(latest
            .to::<u64>()
            .saturating_sub(receipt.block_number)
            .saturating_add(1))
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, BackendError> {
        self.request("eth_getCode", vec![json!(address), json!("latest")])
            .await
    }

    async fn get_storage_at(&self, address: Address, slot: B256) -> Result<B256, BackendError> {
        self.request(
            "eth_getStorageAt",
            vec![json!(address), json!(slot), json!("latest")],
        )
        .await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, BackendError> {
        self.request(
            "eth_call",
            vec![json!({ "to": to, "data": data }), json!("latest")],
        )
        .await
    }

    async fn get_balance(&self, address: Address) -> Result<U256, BackendError> {
        self.request("eth_getBalance", vec![json!(address), json!("latest")])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(classify_status("eth_call", 429).is_transient());
        assert!(classify_status("eth_call", 502).is_transient());
        assert!(classify_status("eth_call", 503).is_transient());
        assert!(matches!(
            classify_status("eth_call", 401),
            BackendError::Permanent(_)
        ));
    }

    #[test]
    fn test_rpc_error_classification() {
        assert!(classify_rpc_error("eth_sendTransaction", "nonce too low", None).is_transient());
        assert!(
            classify_rpc_error(
                "eth_sendTransaction",
                "replacement transaction underpriced",
                None
            )
            .is_transient()
        );
        assert!(matches!(
            classify_rpc_error(
                "eth_sendTransaction",
                "execution reverted: Ownable: caller is not the owner",
                Some("\"0x08c379a0\"")
            ),
            BackendError::Reverted(_)
        ));
        assert!(matches!(
            classify_rpc_error("eth_sendTransaction", "Out of gas", None),
            BackendError::Reverted(_)
        ));
        assert!(matches!(
            classify_rpc_error("eth_sendTransaction", "insufficient funds for gas * price + value", None),
            BackendError::Permanent(_)
        ));
    }

    #[test]
    fn test_receipt_parsing() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "status": "0x0",
            "blockNumber": "0x10",
            "to": null,
            "contractAddress": "0x0000000000000000000000000000000000000002",
        }))
        .unwrap();

        assert_eq!(raw.status, Some(U64::ZERO));
        assert_eq!(raw.block_number, Some(U64::from(16)));
        assert_eq!(raw.contract_address, Some(Address::with_last_byte(2)));
    }

    #[test]
    fn test_new_backend() {
        let backend = JsonRpcBackend::new(Url::parse("http://localhost:8545").unwrap()).unwrap();
        assert_eq!(backend.url().as_str(), "http://localhost:8545/");
        assert_eq!(backend.signer_address(), None);
    }

    // Well-known development key (anvil/hardhat account 0).
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn params() -> TxParams {
        TxParams {
            chain_id: 421613,
            nonce: 7,
            gas_limit: 120_000,
            max_fee_per_gas: 200_000_000,
            max_priority_fee_per_gas: 1_000_000,
        }
    }

    #[test]
    fn test_local_signing() {
        let signer: PrivateKeySigner = DEV_KEY.parse().unwrap();
        assert_eq!(
            signer.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );

        let backend = JsonRpcBackend::new(Url::parse("https://arb1.arbitrum.io/rpc").unwrap())
            .unwrap()
            .with_signer(signer.clone());
        assert_eq!(backend.signer_address(), Some(signer.address()));

        let to = Address::with_last_byte(0xaa);
        let tx = TxRequest::call(signer.address(), to, Bytes::from(vec![1, 2, 3, 4]));
        let signed = sign_transaction(&signer, &tx, params()).unwrap();

        assert_eq!(signed.tx().chain_id, 421613);
        assert_eq!(signed.tx().nonce, 7);
        assert_eq!(signed.tx().to, TxKind::Call(to));
        assert_eq!(
            signed
                .signature()
                .recover_address_from_prehash(&signed.signature_hash())
                .unwrap(),
            signer.address()
        );

        // EIP-2718 typed envelope, type 2.
        let raw = TxEnvelope::from(signed).encoded_2718();
        assert_eq!(raw[0], 0x02);
    }

    #[test]
    fn test_local_signing_creates_contracts() {
        let signer: PrivateKeySigner = DEV_KEY.parse().unwrap();
        let tx = TxRequest::create(signer.address(), Bytes::from(vec![0x60, 0x01]));

        let signed = sign_transaction(&signer, &tx, params()).unwrap();
        assert_eq!(signed.tx().to, TxKind::Create);
        assert_eq!(signed.tx().input, tx.data);
    }

    #[test]
    fn test_local_signing_rejects_other_senders() {
        let signer: PrivateKeySigner = DEV_KEY.parse().unwrap();
        let tx = TxRequest::create(Address::with_last_byte(1), Bytes::new());

        assert!(matches!(
            sign_transaction(&signer, &tx, params()),
            Err(BackendError::Permanent(_))
        ));
    }
}
