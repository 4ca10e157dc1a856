//! Upgradeable contracts behind ERC-1967 proxies.
//!
//! Every upgradeable plan contract moves through
//! `NotDeployed -> ImplementationDeployed -> ProxyDeployed -> Initialized -> Upgraded(n)`.
//! The current state is not stored as such; it is read off the ledger:
//!
//! - no `<name>.impl.0` record and no proxy: not deployed,
//! - `<name>.impl.0` recorded but no proxy entry: implementation deployed,
//! - proxy entry with `initialized == false`: proxy deployed,
//! - proxy entry with `initialized == true`: initialized, upgraded `upgrade_history.len()` times.
//!
//! Each transition is checkpointed as soon as its transaction is final, so an interrupted
//! run resumes at the next transition.

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes},
};

use crate::{
    artifacts::{Artifact, ContractRegistry},
    backend::ChainBackend,
    config::ProxySettings,
    error::ConfigurationError,
    executor::{TransactionExecutor, TxError},
    fingerprint::SpecFingerprint,
    ledger::{DeploymentLedger, DeploymentRecord, LedgerError, ProxyDeployment, UpgradeRecord},
    plan::ContractSpec,
};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("cannot deploy a proxy for {0}: no implementation has been deployed")]
    ProxyWithoutImplementation(String),

    #[error("{0} has no proxy yet")]
    NotDeployed(String),

    #[error("{0} is already initialized")]
    AlreadyInitialized(String),

    #[error("proxy of {name} moved from {expected} to {actual:?}")]
    ProxyAddressChanged {
        name: String,
        expected: Address,
        actual: Option<Address>,
    },

    #[error("proxy of {name} points at {actual} after upgrading to {expected}")]
    ImplementationMismatch {
        name: String,
        expected: Address,
        actual: Address,
    },

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result of [`ProxyUpgradeManager::upgrade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded {
        from: Address,
        to: Address,
        generation: usize,
    },
    /// The proxy already runs this implementation.
    AlreadyCurrent,
}

/// Drives the proxy state machine on top of a [`TransactionExecutor`].
pub struct ProxyUpgradeManager<'a, B> {
    executor: &'a TransactionExecutor<B>,
    registry: &'a ContractRegistry,
    settings: &'a ProxySettings,
}

impl<'a, B: ChainBackend> ProxyUpgradeManager<'a, B> {
    pub fn new(
        executor: &'a TransactionExecutor<B>,
        registry: &'a ContractRegistry,
        settings: &'a ProxySettings,
    ) -> Self {
        Self {
            executor,
            registry,
            settings,
        }
    }

    /// Walk `spec` from whatever state the ledger shows up to `Initialized`.
    ///
    /// Returns whether any transaction was sent.
    pub async fn ensure_initialized(
        &self,
        spec: &ContractSpec,
        init_args: &[String],
        spec_hash: &str,
        ledger: &mut DeploymentLedger,
    ) -> Result<bool, ProxyError> {
        let mut executed = false;
        let implementation_key = DeploymentLedger::implementation_key(&spec.name, 0);

        if ledger.proxy(&spec.name).is_none() {
            if ledger.record(&implementation_key).is_none() {
                self.deploy_implementation(spec, ledger).await?;
            } else {
                tracing::info!(
                    contract = %spec.name,
                    "Resuming at proxy deployment, implementation already recorded"
                );
            }
            self.deploy_proxy(spec, spec_hash, ledger).await?;
            executed = true;
        }

        if ledger.proxy(&spec.name).is_some_and(|p| !p.initialized) {
            self.initialize(spec, init_args, ledger).await?;
            executed = true;
        }

        Ok(executed)
    }

    /// Deploy the first implementation of `spec`, without constructor arguments.
    pub async fn deploy_implementation(
        &self,
        spec: &ContractSpec,
        ledger: &mut DeploymentLedger,
    ) -> Result<DeploymentRecord, ProxyError> {
        let artifact = self.registry.get_artifact(spec.artifact_name())?;
        let key = DeploymentLedger::implementation_key(&spec.name, 0);

        let record = self
            .executor
            .deploy(&key, artifact, &[])
            .await?
            .with_spec_hash(SpecFingerprint::new(artifact, &[]).compute_hash());

        ledger.insert_record(&key, record.clone());
        ledger.checkpoint()?;
        Ok(record)
    }

    /// Deploy the proxy in front of the recorded first implementation.
    pub async fn deploy_proxy(
        &self,
        spec: &ContractSpec,
        spec_hash: &str,
        ledger: &mut DeploymentLedger,
    ) -> Result<ProxyDeployment, ProxyError> {
        let key = DeploymentLedger::implementation_key(&spec.name, 0);
        let implementation = ledger
            .record(&key)
            .cloned()
            .ok_or_else(|| ProxyError::ProxyWithoutImplementation(spec.name.clone()))?;

        let proxy_artifact = self
            .registry
            .get_artifact(&self.settings.artifact)
            .map_err(|_| ConfigurationError::MissingProxyArtifact(self.settings.artifact.clone()))?;

        let data = proxy_artifact.encode_deploy_values(&[
            DynSolValue::Address(implementation.address),
            DynSolValue::Bytes(Vec::new()),
        ])?;
        let constructor_args = Bytes::copy_from_slice(&data[proxy_artifact.bytecode.len()..]);

        let record = self
            .executor
            .deploy_encoded(&spec.name, proxy_artifact, data, constructor_args)
            .await?
            .with_spec_hash(spec_hash.to_string());
        let proxy = ProxyDeployment::new(record.address, &implementation, key);

        tracing::info!(
            contract = %spec.name,
            proxy = %proxy.proxy_address,
            implementation = %proxy.implementation_address,
            "Proxy deployed"
        );

        ledger.insert_record(&spec.name, record);
        ledger.set_proxy(&spec.name, proxy.clone());
        ledger.checkpoint()?;
        Ok(proxy)
    }

    /// Call the initializer through the proxy. Allowed exactly once.
    pub async fn initialize(
        &self,
        spec: &ContractSpec,
        init_args: &[String],
        ledger: &mut DeploymentLedger,
    ) -> Result<(), ProxyError> {
        let proxy = ledger
            .proxy(&spec.name)
            .ok_or_else(|| ProxyError::NotDeployed(spec.name.clone()))?;
        if proxy.initialized {
            return Err(ProxyError::AlreadyInitialized(spec.name.clone()));
        }
        let proxy_address = proxy.proxy_address;

        let artifact = self.registry.get_artifact(spec.artifact_name())?;
        self.executor
            .call(proxy_address, artifact, spec.initializer_name(), init_args)
            .await?;

        if let Some(proxy) = ledger.proxy_mut(&spec.name) {
            proxy.initialized = true;
        }
        ledger.checkpoint()?;

        tracing::info!(
            contract = %spec.name,
            proxy = %proxy_address,
            initializer = %spec.initializer_name(),
            "Proxy initialized"
        );
        Ok(())
    }

    /// Point `name`'s proxy at a freshly deployed `artifact`.
    pub async fn upgrade(
        &self,
        name: &str,
        artifact: &Artifact,
        ledger: &mut DeploymentLedger,
    ) -> Result<UpgradeOutcome, ProxyError> {
        let proxy = ledger
            .proxy(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotDeployed(name.to_string()))?;
        let implementation_hash = SpecFingerprint::new(artifact, &[]).compute_hash();

        let current = ledger.record(&proxy.implementation_record).cloned();
        if current
            .as_ref()
            .is_some_and(|r| r.spec_hash.as_deref() == Some(implementation_hash.as_str()))
        {
            tracing::info!(
                contract = %name,
                artifact = %artifact.contract_name,
                implementation = %proxy.implementation_address,
                "Proxy already runs this implementation, nothing to upgrade"
            );
            return Ok(UpgradeOutcome::AlreadyCurrent);
        }

        self.ensure_proxy_at(name, proxy.proxy_address, ledger).await?;

        let generation = proxy.next_generation();
        let key = DeploymentLedger::implementation_key(name, generation);
        let implementation = self
            .resume_or_deploy_implementation(&key, artifact, &implementation_hash, ledger)
            .await?;

        // UUPS proxies expose the upgrade entry point on the implementation they run.
        let abi_source = current
            .as_ref()
            .and_then(|r| self.registry.get_artifact(&r.artifact).ok())
            .unwrap_or(artifact);
        let data = self.encode_upgrade(abi_source, implementation.address)?;

        let label = format!("{}.{}", name, self.settings.upgrade_method);
        let confirmed = self
            .executor
            .send(&label, proxy.proxy_address, data)
            .await?;

        self.ensure_proxy_at(name, proxy.proxy_address, ledger).await?;

        let actual = self.executor.implementation_of(proxy.proxy_address).await?;
        if actual != implementation.address {
            return Err(ProxyError::ImplementationMismatch {
                name: name.to_string(),
                expected: implementation.address,
                actual,
            });
        }

        let from = proxy.implementation_address;
        if let Some(entry) = ledger.proxy_mut(name) {
            entry.upgrade_history.push(UpgradeRecord {
                from,
                to: implementation.address,
                implementation_record: key.clone(),
                transaction_hash: confirmed.receipt.transaction_hash,
            });
            entry.implementation_address = implementation.address;
            entry.implementation_record = key;
        }
        ledger.checkpoint()?;

        tracing::info!(
            contract = %name,
            proxy = %proxy.proxy_address,
            from = %from,
            to = %implementation.address,
            generation,
            "Proxy upgraded"
        );

        Ok(UpgradeOutcome::Upgraded {
            from,
            to: implementation.address,
            generation,
        })
    }

    /// Check that `name`'s proxy is still recorded at `expected` and still has code there.
    async fn ensure_proxy_at(
        &self,
        name: &str,
        expected: Address,
        ledger: &DeploymentLedger,
    ) -> Result<(), ProxyError> {
        let recorded = ledger.proxy(name).map(|p| p.proxy_address);
        if recorded != Some(expected) {
            return Err(ProxyError::ProxyAddressChanged {
                name: name.to_string(),
                expected,
                actual: recorded,
            });
        }
        if !self.executor.is_live(expected).await? {
            return Err(ProxyError::ProxyAddressChanged {
                name: name.to_string(),
                expected,
                actual: None,
            });
        }
        Ok(())
    }

    /// Reuse an implementation left behind by an interrupted upgrade, or deploy a new one.
    async fn resume_or_deploy_implementation(
        &self,
        key: &str,
        artifact: &Artifact,
        implementation_hash: &str,
        ledger: &mut DeploymentLedger,
    ) -> Result<DeploymentRecord, ProxyError> {
        if let Some(record) = ledger.record(key) {
            if record.spec_hash.as_deref() == Some(implementation_hash)
                && self.executor.is_live(record.address).await?
            {
                tracing::info!(
                    record = %key,
                    address = %record.address,
                    "Resuming upgrade with recorded implementation"
                );
                return Ok(record.clone());
            }
        }

        let record = self
            .executor
            .deploy(key, artifact, &[])
            .await?
            .with_spec_hash(implementation_hash.to_string());
        ledger.insert_record(key, record.clone());
        ledger.checkpoint()?;
        Ok(record)
    }

    /// Calldata for the configured upgrade method, with or without the trailing `bytes`.
    fn encode_upgrade(&self, artifact: &Artifact, implementation: Address) -> Result<Bytes, ConfigurationError> {
        let method = &self.settings.upgrade_method;
        if artifact.function(method, 2).is_ok() {
            artifact.encode_call_values(
                method,
                &[
                    DynSolValue::Address(implementation),
                    DynSolValue::Bytes(Vec::new()),
                ],
            )
        } else {
            artifact.encode_call_values(method, &[DynSolValue::Address(implementation)])
        }
    }
}
