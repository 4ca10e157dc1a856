//! Orchestrator configuration.

use std::{collections::BTreeMap, time::Duration};

use alloy_core::primitives::Address;
use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

/// Default number of confirmations a transaction needs before it counts as final.
pub const DEFAULT_CONFIRMATIONS: u64 = 5;

/// Default proxy artifact deployed in front of upgradeable contracts.
pub const DEFAULT_PROXY_ARTIFACT: &str = "ERC1967Proxy";

/// Default UUPS upgrade entry point.
pub const DEFAULT_UPGRADE_METHOD: &str = "upgradeToAndCall";

/// Exponential backoff applied to transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    pub factor: f32,
    /// Total attempts, the first submission included.
    pub max_attempts: u32,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2.0,
            max_attempts: 5,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay_ms: 0,
            factor: 1.0,
            max_attempts,
            max_delay_ms: 0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    /// The backoff builder for this policy.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay())
            .with_max_delay(self.max_delay())
            .with_factor(self.factor.max(1.0))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// What to do with a ledger record whose address has no code on chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StaleRecordPolicy {
    /// Log a warning and deploy the contract again.
    #[default]
    Redeploy,
    /// Abort the run.
    Fail,
}

/// Proxy artifact and upgrade entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Artifact whose constructor takes `(address implementation, bytes data)`.
    pub artifact: String,
    /// `upgradeToAndCall(address,bytes)` or `upgradeTo(address)`.
    pub upgrade_method: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            artifact: DEFAULT_PROXY_ARTIFACT.to_string(),
            upgrade_method: DEFAULT_UPGRADE_METHOD.to_string(),
        }
    }
}

/// Everything the orchestrator needs besides the plan, the backend and the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// The signing identity every transaction is sent from.
    pub deployer: Address,
    /// Confirmations required before a transaction is considered final.
    pub confirmations: u64,
    pub retry: RetryPolicy,
    /// Interval between receipt and confirmation polls.
    pub poll_interval_ms: u64,
    pub inclusion_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    /// Run the verification post-pass after deploying.
    pub verify: bool,
    /// Maximum verification requests in flight.
    pub verify_concurrency: usize,
    /// Status polls per verification job before it is left pending.
    pub verification_poll_attempts: u32,
    pub stale_records: StaleRecordPolicy,
    /// Redeploy contracts whose plan entry changed since they were recorded.
    pub redeploy_on_change: bool,
    /// Parameters that must name an identity other than the deployer.
    pub distinct_from_deployer: Vec<String>,
    /// Parameter overrides, taking precedence over the plan's `[params]`.
    pub params: BTreeMap<String, String>,
    pub proxy: ProxySettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deployer: Address::ZERO,
            confirmations: DEFAULT_CONFIRMATIONS,
            retry: RetryPolicy::default(),
            poll_interval_ms: 2000,
            inclusion_timeout_secs: 300,
            confirmation_timeout_secs: 600,
            verify: true,
            verify_concurrency: 4,
            verification_poll_attempts: 20,
            stale_records: StaleRecordPolicy::default(),
            redeploy_on_change: false,
            distinct_from_deployer: vec!["default_admin".to_string()],
            params: BTreeMap::new(),
            proxy: ProxySettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_deployer(mut self, deployer: Address) -> Self {
        self.deployer = deployer;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_secs(self.inclusion_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}
