//! keel-deploy - Data-driven smart contract deployment.
//!
//! This crate executes a declarative [`DeploymentPlan`] (contracts, their dependencies,
//! upgradeable proxies and post-deploy wiring calls) against a chain, recording progress
//! in a [`DeploymentLedger`] so that interrupted runs resume where they stopped.

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod proxy;
pub mod report;
pub mod resolve;
pub mod validate;
pub mod verify;

pub use artifacts::{Artifact, ContractRegistry, SourceRef};
pub use backend::{
    BackendError, ChainBackend, JsonRpcBackend, PrivateKeySigner, TxReceipt, TxRequest,
};
pub use config::{
    DEFAULT_CONFIRMATIONS, OrchestratorConfig, ProxySettings, RetryPolicy, StaleRecordPolicy,
};
pub use error::{ConfigurationError, PlanError};
pub use executor::{
    CallError, ConfirmedTx, DeployError, IMPLEMENTATION_SLOT, TransactionExecutor, TxError,
};
pub use ledger::{
    DeploymentLedger, DeploymentRecord, LedgerError, LedgerLock, ProxyDeployment, UpgradeRecord,
    VerificationStatus, WiringRecord,
};
pub use orchestrator::{
    DeploymentOrchestrator, OrchestratorError, RunReport, StepOutcome, StepReport,
    VerificationSummary,
};
pub use plan::{ContractSpec, DeploymentPlan, DerivedContract, Literal, PlanValue, WiringStep};
pub use proxy::{ProxyError, ProxyUpgradeManager, UpgradeOutcome};
pub use validate::PlanValidator;
pub use verify::{
    EtherscanClient, JobStatus, NoVerifier, ServiceError, Submission, VerificationRequest,
    VerificationService, Verifier, VerifyError,
};
