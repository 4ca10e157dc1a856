//! Source verification after a run.

mod common;

use alloy_core::primitives::{Address, B256, Bytes};
use common::*;
use keel_deploy::{
    ContractSpec, DeploymentLedger, DeploymentOrchestrator, DeploymentPlan, DeploymentRecord,
    PlanValue, SourceRef, VerificationStatus, VerificationSummary, Verifier, VerifyError,
};

fn plan() -> DeploymentPlan {
    DeploymentPlan::new()
        .contract(ContractSpec::new("A"))
        .contract(ContractSpec::new("B").arg(PlanValue::address_of("A")))
}

fn verifying(
    chain: &MockChain,
    explorer: &MockExplorer,
) -> DeploymentOrchestrator<MockChain, MockExplorer> {
    let mut config = config();
    config.verify = true;
    DeploymentOrchestrator::new(chain.clone(), registry(), config).with_verifier(explorer.clone())
}

fn record(verified: VerificationStatus) -> DeploymentRecord {
    DeploymentRecord {
        contract_name: "B".to_string(),
        artifact: "B".to_string(),
        address: Address::with_last_byte(0xb),
        transaction_hash: B256::with_last_byte(1),
        block_number: 1,
        confirmations: 5,
        constructor_args: Bytes::new(),
        spec_hash: None,
        deployed_at: 0,
        verified,
    }
}

fn source() -> SourceRef {
    SourceRef {
        contract_name: "B".to_string(),
        source_name: Some("contracts/B.sol".to_string()),
        build_info: None,
    }
}

#[tokio::test]
async fn test_run_verifies_every_record() {
    init_tracing();
    let chain = MockChain::new();
    let explorer = MockExplorer::new();
    let mut ledger = DeploymentLedger::in_memory();

    let report = verifying(&chain, &explorer)
        .run_in_place(&plan(), &mut ledger)
        .await
        .unwrap();

    assert_eq!(
        report.verification,
        Some(VerificationSummary {
            verified: 2,
            pending: 0,
            failed: 0,
            unverified: 0,
        })
    );
    assert!(ledger.records.values().all(|r| r.verified.is_verified()));
    assert_eq!(explorer.submissions(), 2);
}

#[tokio::test]
async fn test_verified_records_are_not_resubmitted() {
    let chain = MockChain::new();
    let explorer = MockExplorer::new();
    let orchestrator = verifying(&chain, &explorer);

    let mut ledger = DeploymentLedger::in_memory();
    orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();
    let calls = explorer.calls();

    orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();
    orchestrator.verify_all(&mut ledger).await.unwrap();

    assert_eq!(explorer.calls(), calls);
}

#[tokio::test]
async fn test_verification_failure_does_not_fail_the_run() {
    let chain = MockChain::new();
    let explorer = MockExplorer::new();
    explorer.reject("B");
    let orchestrator = verifying(&chain, &explorer);

    let mut ledger = DeploymentLedger::in_memory();
    let report = orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();

    assert_eq!(report.verification.as_ref().unwrap().failed, 1);
    assert!(ledger.record("A").unwrap().verified.is_verified());
    assert!(matches!(
        ledger.record("B").unwrap().verified,
        VerificationStatus::Failed { .. }
    ));

    // The automatic pass leaves failures alone; an explicit pass retries them.
    let submissions = explorer.submissions();
    orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();
    assert_eq!(explorer.submissions(), submissions);

    orchestrator.verify_all(&mut ledger).await.unwrap();
    assert_eq!(explorer.submissions(), submissions + 1);
}

#[tokio::test]
async fn test_already_verified_record_skips_the_service() {
    let explorer = MockExplorer::new();
    let verifier = Verifier::new(explorer.clone(), &config());

    let status = verifier
        .verify(&record(VerificationStatus::Verified), &source())
        .await
        .unwrap();

    assert_eq!(status, VerificationStatus::Verified);
    assert_eq!(explorer.calls(), 0);
}

#[tokio::test]
async fn test_pending_job_is_resumed() {
    let explorer = MockExplorer::new();
    let verifier = Verifier::new(explorer.clone(), &config());

    let status = verifier
        .verify(
            &record(VerificationStatus::Pending {
                job: "job-earlier".to_string(),
            }),
            &source(),
        )
        .await
        .unwrap();

    assert_eq!(status, VerificationStatus::Verified);
    assert_eq!(explorer.submissions(), 0);
    assert_eq!(explorer.status_checks(), 1);
}

#[tokio::test]
async fn test_rate_limits_are_retried() {
    let explorer = MockExplorer::new();
    explorer.rate_limit(2);
    let verifier = Verifier::new(explorer.clone(), &config());

    let status = verifier
        .verify(&record(VerificationStatus::Unverified), &source())
        .await
        .unwrap();

    assert_eq!(status, VerificationStatus::Verified);
    assert_eq!(explorer.submissions(), 3);
}

#[tokio::test]
async fn test_rate_limit_retries_are_bounded() {
    let explorer = MockExplorer::new();
    explorer.rate_limit(100);
    let verifier = Verifier::new(explorer.clone(), &config());

    let err = verifier
        .verify(&record(VerificationStatus::Unverified), &source())
        .await
        .unwrap_err();

    assert!(matches!(err, VerifyError::ExhaustedRetries { attempts: 5, .. }));
    assert_eq!(explorer.submissions(), 5);
    assert!(!err.is_conclusive());
    assert_eq!(
        err.to_status(&VerificationStatus::Unverified),
        VerificationStatus::Unverified
    );
}

#[tokio::test]
async fn test_service_outage_leaves_records_for_the_next_run() {
    let chain = MockChain::new();
    let explorer = MockExplorer::new();
    explorer.rate_limit(100);
    let orchestrator = verifying(&chain, &explorer);

    let mut ledger = DeploymentLedger::in_memory();
    let report = orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();

    assert_eq!(report.verification.as_ref().unwrap().unverified, 2);
    assert_eq!(report.verification.as_ref().unwrap().failed, 0);
    assert!(
        ledger
            .records
            .values()
            .all(|r| r.verified == VerificationStatus::Unverified)
    );

    // Once the explorer is back, the automatic pass picks both records up again.
    explorer.rate_limit(0);
    let submissions = explorer.submissions();
    let report = orchestrator.run_in_place(&plan(), &mut ledger).await.unwrap();

    assert_eq!(report.verification.as_ref().unwrap().verified, 2);
    assert_eq!(explorer.submissions(), submissions + 2);
    assert!(ledger.records.values().all(|r| r.verified.is_verified()));
}

#[tokio::test]
async fn test_service_outage_keeps_pending_job() {
    let explorer = MockExplorer::new();
    explorer.rate_limit(100);
    let verifier = Verifier::new(explorer.clone(), &config());

    let status = verifier
        .verify(
            &record(VerificationStatus::Pending {
                job: "job-123".to_string(),
            }),
            &source(),
        )
        .await
        .unwrap();

    assert_eq!(
        status,
        VerificationStatus::Pending {
            job: "job-123".to_string()
        }
    );
    assert_eq!(explorer.submissions(), 0);
}

#[tokio::test]
async fn test_slow_job_stays_pending() {
    let explorer = MockExplorer::new();
    explorer.pending_for(100);
    let verifier = Verifier::new(explorer.clone(), &config());

    let status = verifier
        .verify(&record(VerificationStatus::Unverified), &source())
        .await
        .unwrap();

    assert!(matches!(status, VerificationStatus::Pending { ref job } if job.starts_with("job-")));
    assert_eq!(explorer.status_checks(), config().verification_poll_attempts as usize);
}

#[tokio::test]
async fn test_rejected_job_fails() {
    let explorer = MockExplorer::new();
    explorer.reject("B");
    let verifier = Verifier::new(explorer.clone(), &config());

    let err = verifier
        .verify(&record(VerificationStatus::Unverified), &source())
        .await
        .unwrap_err();

    assert!(matches!(err, VerifyError::VerificationFailed { ref contract, .. } if contract == "B"));
    assert!(err.is_conclusive());
    assert!(matches!(
        err.to_status(&VerificationStatus::Unverified),
        VerificationStatus::Failed { .. }
    ));
}
