//! Source verification on block explorers.
//!
//! Verification runs after deploys and wiring and never fails a run. The [`Verifier`]
//! only reports statuses; the orchestrator writes them to the ledger.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes};
use backon::Retryable;

use crate::{
    artifacts::SourceRef,
    config::{OrchestratorConfig, RetryPolicy},
    ledger::{DeploymentRecord, VerificationStatus},
};

mod etherscan;
pub use etherscan::EtherscanClient;

/// What the explorer needs to match deployed code to its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub address: Address,
    pub source: SourceRef,
    /// ABI-encoded constructor arguments.
    pub constructor_args: Bytes,
}

/// Answer to a verification submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Queued under this job id.
    Queued(String),
    AlreadyVerified,
}

/// State of a submitted verification job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Verified,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient verification service error: {0}")]
    Transient(String),

    /// The request itself is unusable (missing build info, bad API key, ...).
    #[error("verification request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The explorer compiled the source and it does not match the deployed code.
    #[error("verification of {contract} failed: {reason}")]
    VerificationFailed { contract: String, reason: String },

    #[error("verification of {contract} gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        contract: String,
        attempts: u32,
        last: ServiceError,
    },

    #[error("verification of {contract}: {source}")]
    Service {
        contract: String,
        source: ServiceError,
    },
}

impl VerifyError {
    /// Whether the explorer judged the request itself, as opposed to being unreachable.
    pub fn is_conclusive(&self) -> bool {
        match self {
            Self::VerificationFailed { .. } => true,
            Self::Service { source, .. } => !source.is_retryable(),
            Self::ExhaustedRetries { .. } => false,
        }
    }

    /// The status to record for a record whose verification ended with this error.
    ///
    /// Only a conclusive failure is recorded as `Failed`; while the service is unavailable
    /// the record keeps its `previous` status, so a pending job stays resumable.
    pub fn to_status(&self, previous: &VerificationStatus) -> VerificationStatus {
        if self.is_conclusive() {
            VerificationStatus::Failed {
                reason: self.to_string(),
            }
        } else {
            previous.clone()
        }
    }
}

/// A block explorer accepting source verification requests.
pub trait VerificationService: Send + Sync {
    fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = Result<Submission, ServiceError>> + Send;

    fn get_verification_status(
        &self,
        job: &str,
    ) -> impl Future<Output = Result<JobStatus, ServiceError>> + Send;
}

/// Placeholder service for orchestrators that never verify.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVerifier;

impl VerificationService for NoVerifier {
    async fn submit_verification(
        &self,
        _request: &VerificationRequest,
    ) -> Result<Submission, ServiceError> {
        Err(ServiceError::Rejected("verification is disabled".to_string()))
    }

    async fn get_verification_status(&self, _job: &str) -> Result<JobStatus, ServiceError> {
        Err(ServiceError::Rejected("verification is disabled".to_string()))
    }
}

/// Submits records for verification and follows their jobs.
#[derive(Debug, Clone)]
pub struct Verifier<S> {
    service: S,
    retry: RetryPolicy,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl<S: VerificationService> Verifier<S> {
    pub fn new(service: S, config: &OrchestratorConfig) -> Self {
        Self {
            service,
            retry: config.retry.clone(),
            poll_interval: config.poll_interval(),
            poll_attempts: config.verification_poll_attempts,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Verify `record`, returning its new status.
    ///
    /// A `Verified` record is returned as is without contacting the service, and a
    /// `Pending` record resumes polling its job. A job still pending after the configured
    /// number of polls is returned as `Pending` so a later run can pick it up.
    pub async fn verify(
        &self,
        record: &DeploymentRecord,
        source: &SourceRef,
    ) -> Result<VerificationStatus, VerifyError> {
        let contract = record.contract_name.as_str();

        let job = match &record.verified {
            VerificationStatus::Verified => {
                tracing::debug!(contract = %contract, "Already verified, skipping");
                return Ok(VerificationStatus::Verified);
            }
            VerificationStatus::Pending { job } => {
                tracing::info!(contract = %contract, job = %job, "Resuming verification job");
                job.clone()
            }
            VerificationStatus::Unverified | VerificationStatus::Failed { .. } => {
                let request = VerificationRequest {
                    address: record.address,
                    source: source.clone(),
                    constructor_args: record.constructor_args.clone(),
                };
                let submission = self
                    .with_retry(contract, || self.service.submit_verification(&request))
                    .await?;

                match submission {
                    Submission::AlreadyVerified => {
                        tracing::info!(contract = %contract, address = %record.address, "Contract already verified");
                        return Ok(VerificationStatus::Verified);
                    }
                    Submission::Queued(job) => {
                        tracing::info!(
                            contract = %contract,
                            address = %record.address,
                            job = %job,
                            "Verification submitted"
                        );
                        job
                    }
                }
            }
        };

        for _ in 0..self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let status = match self
                .with_retry(contract, || self.service.get_verification_status(&job))
                .await
            {
                Ok(status) => status,
                Err(error) if !error.is_conclusive() => {
                    tracing::warn!(
                        contract = %contract,
                        job = %job,
                        error = %error,
                        "Verification service unavailable, keeping the job for the next run"
                    );
                    return Ok(VerificationStatus::Pending { job });
                }
                Err(error) => return Err(error),
            };

            match status {
                JobStatus::Pending => {
                    tracing::debug!(contract = %contract, job = %job, "Verification pending");
                }
                JobStatus::Verified => {
                    tracing::info!(contract = %contract, address = %record.address, "Contract verified");
                    return Ok(VerificationStatus::Verified);
                }
                JobStatus::Failed(reason) => {
                    return Err(VerifyError::VerificationFailed {
                        contract: contract.to_string(),
                        reason,
                    });
                }
            }
        }

        tracing::warn!(
            contract = %contract,
            job = %job,
            "Verification still pending, will resume on the next run"
        );
        Ok(VerificationStatus::Pending { job })
    }

    async fn with_retry<T, F, Fut>(&self, contract: &str, op: F) -> Result<T, VerifyError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let attempts = AtomicU32::new(0);

        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            op()
        })
        .retry(self.retry.backoff())
        .when(ServiceError::is_retryable)
        .notify(|error, delay| {
            tracing::warn!(
                contract = %contract,
                attempt = attempts.load(Ordering::Relaxed),
                delay = ?delay,
                error = %error,
                "Verification service unavailable, retrying"
            );
        })
        .await;

        result.map_err(|error| {
            if error.is_retryable() {
                VerifyError::ExhaustedRetries {
                    contract: contract.to_string(),
                    attempts: attempts.load(Ordering::Relaxed),
                    last: error,
                }
            } else {
                VerifyError::Service {
                    contract: contract.to_string(),
                    source: error,
                }
            }
        })
    }
}
