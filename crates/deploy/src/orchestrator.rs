//! Executing a [`DeploymentPlan`] against a chain.

use alloy_core::primitives::{Address, B256, keccak256, utils::format_ether};
use futures::StreamExt;

use crate::{
    artifacts::ContractRegistry,
    backend::ChainBackend,
    config::{OrchestratorConfig, StaleRecordPolicy},
    error::{ConfigurationError, PlanError},
    executor::{TransactionExecutor, TxError},
    fingerprint::SpecFingerprint,
    ledger::{DeploymentLedger, DeploymentRecord, LedgerError, VerificationStatus, WiringRecord},
    plan::{ContractSpec, DeploymentPlan, WiringStep},
    proxy::{ProxyError, ProxyUpgradeManager, UpgradeOutcome},
    resolve::ParamTable,
    validate::PlanValidator,
    verify::{NoVerifier, VerificationService, Verifier},
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("deploying {contract} failed: {source}")]
    Deploy { contract: String, source: TxError },

    #[error("proxy step for {contract} failed: {source}")]
    Proxy {
        contract: String,
        source: ProxyError,
    },

    #[error("wiring step {step} failed: {source}")]
    Wiring { step: String, source: TxError },

    #[error("recorded {contract} at {address} has no code on chain")]
    StaleRecord { contract: String, address: Address },

    #[error("no proxy recorded at {0}")]
    UnknownProxy(Address),

    #[error("chain read failed: {0}")]
    Chain(TxError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What happened to a single step of a run.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepOutcome {
    /// At least one transaction was sent.
    Executed,
    /// The ledger already had the step's result.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub outcome: StepOutcome,
}

/// Verification results of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub verified: usize,
    pub pending: usize,
    pub failed: usize,
    /// Left unverified because the service could not be reached.
    pub unverified: usize,
}

impl VerificationSummary {
    fn count(&mut self, status: &VerificationStatus) {
        match status {
            VerificationStatus::Verified => self.verified += 1,
            VerificationStatus::Pending { .. } => self.pending += 1,
            VerificationStatus::Failed { .. } => self.failed += 1,
            VerificationStatus::Unverified => self.unverified += 1,
        }
    }
}

/// Per-step outcomes of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub verification: Option<VerificationSummary>,
}

impl RunReport {
    pub fn executed(&self) -> impl Iterator<Item = &str> {
        self.steps_with(StepOutcome::Executed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.steps_with(StepOutcome::Skipped)
    }

    fn steps_with(&self, outcome: StepOutcome) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .filter(move |s| s.outcome == outcome)
            .map(|s| s.step.as_str())
    }

    fn push(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        self.steps.push(StepReport {
            step: step.into(),
            outcome,
        });
    }
}

/// Topologically deploys a plan, wires it, then verifies what was deployed.
///
/// The ledger is consulted before and checkpointed after every step, so a failed run can
/// be re-invoked with the same plan and ledger to pick up where it stopped.
pub struct DeploymentOrchestrator<B, S = NoVerifier> {
    executor: TransactionExecutor<B>,
    registry: ContractRegistry,
    verifier: Option<Verifier<S>>,
    config: OrchestratorConfig,
}

impl<B: ChainBackend> DeploymentOrchestrator<B> {
    pub fn new(backend: B, registry: ContractRegistry, config: OrchestratorConfig) -> Self {
        Self {
            executor: TransactionExecutor::new(backend, &config),
            registry,
            verifier: None,
            config,
        }
    }
}

impl<B: ChainBackend, S: VerificationService> DeploymentOrchestrator<B, S> {
    /// Verify deployments through `service` after each run.
    pub fn with_verifier<T: VerificationService>(self, service: T) -> DeploymentOrchestrator<B, T> {
        DeploymentOrchestrator {
            verifier: Some(Verifier::new(service, &self.config)),
            executor: self.executor,
            registry: self.registry,
            config: self.config,
        }
    }

    pub fn executor(&self) -> &TransactionExecutor<B> {
        &self.executor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `plan` and hand back the updated ledger.
    pub async fn run(
        &self,
        plan: &DeploymentPlan,
        mut ledger: DeploymentLedger,
    ) -> Result<DeploymentLedger, OrchestratorError> {
        self.run_in_place(plan, &mut ledger).await?;
        Ok(ledger)
    }

    /// Run `plan`, updating `ledger` step by step.
    ///
    /// On error, `ledger` holds every step that completed before the failure.
    pub async fn run_in_place(
        &self,
        plan: &DeploymentPlan,
        ledger: &mut DeploymentLedger,
    ) -> Result<RunReport, OrchestratorError> {
        PlanValidator::validate(plan)?;
        PlanValidator::preflight(plan, &self.registry, &self.config)?;
        let order = PlanValidator::topological_order(plan)?;
        let params = ParamTable::new(plan, &self.config.params);

        tracing::info!(
            contracts = plan.contracts.len(),
            wiring_steps = plan.wiring.len(),
            deployer = %self.config.deployer,
            "Starting deployment"
        );
        self.log_balance("before").await;

        let mut report = RunReport::default();

        for spec in order {
            let outcome = if spec.upgradeable {
                self.deploy_upgradeable(spec, &params, ledger).await
            } else {
                self.deploy_contract(spec, &params, ledger).await
            };
            let outcome = outcome.inspect_err(|e| {
                tracing::error!(step = %spec.name, outcome = %StepOutcome::Failed, error = %e, "Deploy step failed");
            })?;

            tracing::info!(step = %spec.name, outcome = %outcome, "Deploy step finished");
            report.push(&spec.name, outcome);
        }

        for step in &plan.wiring {
            let key = step.key();
            let outcome = self
                .wire(plan, step, &params, ledger)
                .await
                .inspect_err(|e| {
                    tracing::error!(step = %key, outcome = %StepOutcome::Failed, error = %e, "Wiring step failed");
                })?;

            tracing::info!(step = %key, outcome = %outcome, "Wiring step finished");
            report.push(key, outcome);
        }

        if self.config.verify {
            report.verification = self.verify_pass(ledger, false).await?;
        }

        self.log_balance("after").await;
        tracing::info!(
            executed = report.executed().count(),
            skipped = report.skipped().count(),
            "Deployment complete"
        );
        Ok(report)
    }

    /// Upgrade the plan contract whose proxy lives at `proxy_address`.
    ///
    /// `implementation` names the new artifact; without it, the plan's current artifact for
    /// that contract is used.
    pub async fn upgrade(
        &self,
        plan: &DeploymentPlan,
        ledger: &mut DeploymentLedger,
        proxy_address: Address,
        implementation: Option<&str>,
    ) -> Result<UpgradeOutcome, OrchestratorError> {
        PlanValidator::validate(plan)?;

        let name = ledger
            .proxy_named_at(proxy_address)
            .ok_or(OrchestratorError::UnknownProxy(proxy_address))?
            .to_string();
        let artifact_name = implementation
            .or_else(|| plan.spec(&name).map(ContractSpec::artifact_name))
            .ok_or_else(|| ConfigurationError::UnknownContract(name.clone()))?;
        let artifact = self.registry.get_artifact(artifact_name)?;

        if !self.is_live(proxy_address).await? {
            return Err(OrchestratorError::StaleRecord {
                contract: name,
                address: proxy_address,
            });
        }

        self.log_balance("before").await;
        let outcome = self
            .proxy_manager()
            .upgrade(&name, artifact, ledger)
            .await
            .map_err(|source| OrchestratorError::Proxy {
                contract: name.clone(),
                source,
            })?;

        if self.config.verify && matches!(outcome, UpgradeOutcome::Upgraded { .. }) {
            self.verify_pass(ledger, false).await?;
        }
        self.log_balance("after").await;

        Ok(outcome)
    }

    /// Run verification over every record that is not verified yet, failed ones included.
    pub async fn verify_all(
        &self,
        ledger: &mut DeploymentLedger,
    ) -> Result<Option<VerificationSummary>, OrchestratorError> {
        self.verify_pass(ledger, true).await
    }

    fn proxy_manager(&self) -> ProxyUpgradeManager<'_, B> {
        ProxyUpgradeManager::new(&self.executor, &self.registry, &self.config.proxy)
    }

    async fn is_live(&self, address: Address) -> Result<bool, OrchestratorError> {
        self.executor
            .is_live(address)
            .await
            .map_err(OrchestratorError::Chain)
    }

    async fn log_balance(&self, when: &str) {
        match self.executor.balance(self.config.deployer).await {
            Ok(balance) => tracing::info!(
                deployer = %self.config.deployer,
                balance = %format_ether(balance),
                "Deployer balance {when} run"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to read deployer balance"),
        }
    }

    /// Decide what to do with an existing record whose code vanished.
    fn on_stale(&self, contract: &str, address: Address) -> Result<(), OrchestratorError> {
        match self.config.stale_records {
            StaleRecordPolicy::Fail => Err(OrchestratorError::StaleRecord {
                contract: contract.to_string(),
                address,
            }),
            StaleRecordPolicy::Redeploy => {
                tracing::warn!(
                    contract = %contract,
                    address = %address,
                    "Recorded contract has no code on chain, redeploying"
                );
                Ok(())
            }
        }
    }

    async fn deploy_contract(
        &self,
        spec: &ContractSpec,
        params: &ParamTable,
        ledger: &mut DeploymentLedger,
    ) -> Result<StepOutcome, OrchestratorError> {
        let context = format!("{} constructor", spec.name);
        let args = params.resolve(&context, &spec.constructor_args, |n| ledger.address_of(n))?;
        let artifact = self.registry.get_artifact(spec.artifact_name())?;
        let spec_hash = SpecFingerprint::new(artifact, &args).compute_hash();

        if let Some(record) = ledger.record(&spec.name).cloned() {
            if !self.is_live(record.address).await? {
                self.on_stale(&spec.name, record.address)?;
            } else if record.spec_hash.as_deref().is_some_and(|h| h != spec_hash) {
                if self.config.redeploy_on_change {
                    tracing::info!(contract = %spec.name, "Plan entry changed, redeploying");
                } else {
                    tracing::warn!(
                        contract = %spec.name,
                        address = %record.address,
                        "Plan entry changed since deployment, keeping the recorded contract"
                    );
                    self.resolve_derived(spec, params, ledger, false).await?;
                    return Ok(StepOutcome::Skipped);
                }
            } else {
                tracing::debug!(contract = %spec.name, address = %record.address, "Already deployed");
                self.resolve_derived(spec, params, ledger, false).await?;
                return Ok(StepOutcome::Skipped);
            }
        }

        let record = self
            .executor
            .deploy(&spec.name, artifact, &args)
            .await
            .map_err(|source| OrchestratorError::Deploy {
                contract: spec.name.clone(),
                source,
            })?
            .with_spec_hash(spec_hash);

        ledger.insert_record(&spec.name, record);
        ledger.checkpoint()?;

        self.resolve_derived(spec, params, ledger, true).await?;
        Ok(StepOutcome::Executed)
    }

    async fn deploy_upgradeable(
        &self,
        spec: &ContractSpec,
        params: &ParamTable,
        ledger: &mut DeploymentLedger,
    ) -> Result<StepOutcome, OrchestratorError> {
        let context = format!("{} initializer", spec.name);
        let args = params.resolve(&context, &spec.constructor_args, |n| ledger.address_of(n))?;
        let artifact = self.registry.get_artifact(spec.artifact_name())?;
        let spec_hash = SpecFingerprint::new(artifact, &args)
            .behind_proxy(spec.initializer_name())
            .compute_hash();

        let implementation_key = DeploymentLedger::implementation_key(&spec.name, 0);
        if let Some(proxy) = ledger.proxy(&spec.name).cloned() {
            if !self.is_live(proxy.proxy_address).await? {
                self.on_stale(&spec.name, proxy.proxy_address)?;
                ledger.remove_proxy(&spec.name);
                ledger.checkpoint()?;
            }
        }
        // Without a proxy, the first implementation is reused only if it still has code.
        let orphan = match ledger.proxy(&spec.name) {
            Some(_) => None,
            None => ledger.record(&implementation_key).cloned(),
        };
        if let Some(implementation) = orphan {
            if !self.is_live(implementation.address).await? {
                self.on_stale(&implementation_key, implementation.address)?;
                ledger.remove_record(&implementation_key);
                ledger.checkpoint()?;
            }
        }

        let recorded_hash = ledger.record(&spec.name).and_then(|r| r.spec_hash.clone());
        let executed = self
            .proxy_manager()
            .ensure_initialized(spec, &args, &spec_hash, ledger)
            .await
            .map_err(|source| OrchestratorError::Proxy {
                contract: spec.name.clone(),
                source,
            })?;

        if !executed && recorded_hash.is_some_and(|h| h != spec_hash) {
            tracing::warn!(
                contract = %spec.name,
                "Plan entry changed since deployment, run an upgrade to move the proxy to it"
            );
        }

        self.resolve_derived(spec, params, ledger, executed).await?;
        Ok(if executed {
            StepOutcome::Executed
        } else {
            StepOutcome::Skipped
        })
    }

    /// Record the contracts `spec`'s constructor created.
    ///
    /// With `refresh`, derived records are read again even if present, since the parent
    /// was just (re)deployed.
    async fn resolve_derived(
        &self,
        spec: &ContractSpec,
        params: &ParamTable,
        ledger: &mut DeploymentLedger,
        refresh: bool,
    ) -> Result<(), OrchestratorError> {
        let Some(parent) = ledger.record(&spec.name).cloned() else {
            return Ok(());
        };
        let parent_artifact = self.registry.get_artifact(spec.artifact_name())?;

        for derived in &spec.derived {
            if !refresh && ledger.record(&derived.name).is_some() {
                continue;
            }

            let address = self
                .executor
                .read_address(parent.address, parent_artifact, &derived.getter)
                .await
                .map_err(OrchestratorError::Chain)?;

            let artifact = self.registry.get_artifact(derived.artifact_name())?;
            let context = format!("{} constructor", derived.name);
            let args = params.resolve(&context, &derived.args, |n| ledger.address_of(n))?;
            let constructor_args = artifact.encode_constructor_args(&args)?;

            tracing::info!(
                contract = %derived.name,
                parent = %spec.name,
                address = %address,
                "Derived contract resolved"
            );
            ledger.insert_record(
                &derived.name,
                DeploymentRecord::derived(
                    &parent,
                    &derived.name,
                    &artifact.contract_name,
                    address,
                    constructor_args,
                ),
            );
            ledger.checkpoint()?;
        }

        Ok(())
    }

    async fn wire(
        &self,
        plan: &DeploymentPlan,
        step: &WiringStep,
        params: &ParamTable,
        ledger: &mut DeploymentLedger,
    ) -> Result<StepOutcome, OrchestratorError> {
        let key = step.key();
        let target = ledger.address_of(&step.target).ok_or_else(|| {
            ConfigurationError::UnresolvedAddress {
                context: key.clone(),
                reference: step.target.clone(),
            }
        })?;
        let artifact_name = plan
            .artifact_of(&step.target)
            .ok_or_else(|| ConfigurationError::UnknownContract(step.target.clone()))?;
        let artifact = self.registry.get_artifact(artifact_name)?;

        let args = params.resolve(&key, &step.args, |n| ledger.address_of(n))?;
        let calldata = artifact.encode_call(&step.method, &args)?;
        let calldata_hash: B256 = keccak256(&calldata);

        match ledger.wiring_record(&key) {
            Some(record) if record.calldata_hash == calldata_hash => {
                tracing::debug!(step = %key, "Already wired");
                return Ok(StepOutcome::Skipped);
            }
            Some(_) => {
                tracing::info!(step = %key, "Wiring arguments changed, calling again");
            }
            None => {}
        }

        let confirmed = self
            .executor
            .send(&key, target, calldata)
            .await
            .map_err(|source| OrchestratorError::Wiring {
                step: key.clone(),
                source,
            })?;

        ledger.record_wiring(
            &key,
            WiringRecord {
                transaction_hash: confirmed.receipt.transaction_hash,
                calldata_hash,
            },
        );
        ledger.checkpoint()?;
        Ok(StepOutcome::Executed)
    }

    /// Verify records concurrently, applying each result to the ledger as it arrives.
    ///
    /// Returns `None` when no verification service is configured.
    async fn verify_pass(
        &self,
        ledger: &mut DeploymentLedger,
        retry_failed: bool,
    ) -> Result<Option<VerificationSummary>, OrchestratorError> {
        let Some(verifier) = &self.verifier else {
            tracing::debug!("No verification service configured, skipping verification");
            return Ok(None);
        };

        let candidates: Vec<_> = ledger
            .records
            .iter()
            .filter(|(_, record)| match record.verified {
                VerificationStatus::Verified => false,
                VerificationStatus::Failed { .. } => retry_failed,
                _ => true,
            })
            .filter_map(|(key, record)| match self.registry.get_artifact(&record.artifact) {
                Ok(artifact) => Some((key.clone(), record.clone(), artifact.source_ref())),
                Err(e) => {
                    tracing::warn!(record = %key, error = %e, "Cannot verify without an artifact");
                    None
                }
            })
            .collect();

        let mut summary = VerificationSummary::default();
        if candidates.is_empty() {
            return Ok(Some(summary));
        }
        tracing::info!(records = candidates.len(), "Verifying deployed contracts");

        let mut results = futures::stream::iter(candidates)
            .map(|(key, record, source)| async move {
                let result = verifier.verify(&record, &source).await;
                (key, record.verified, result)
            })
            .buffer_unordered(self.config.verify_concurrency.max(1));

        while let Some((key, previous, result)) = results.next().await {
            let status = result.unwrap_or_else(|e| {
                tracing::warn!(record = %key, error = %e, "Verification did not complete");
                e.to_status(&previous)
            });
            summary.count(&status);
            ledger.set_verification(&key, status);
            ledger.checkpoint()?;
        }

        tracing::info!(
            verified = summary.verified,
            pending = summary.pending,
            failed = summary.failed,
            unverified = summary.unverified,
            "Verification finished"
        );
        Ok(Some(summary))
    }
}
