//! Errors raised before any transaction is sent.

use alloy_core::primitives::Address;

/// A structurally invalid plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("{from} references unknown contract {reference}")]
    UnresolvedReference { from: String, reference: String },

    #[error("contract {0} is declared more than once")]
    DuplicateContract(String),

    #[error("wiring slot {0} is written by more than one step")]
    DuplicateWiring(String),
}

/// A plan that is well-formed but cannot be executed with the given artifacts and config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no artifact for contract {0}")]
    UnknownContract(String),

    #[error("{contract} has no method {method} taking {arity} argument(s)")]
    UnknownMethod {
        contract: String,
        method: String,
        arity: usize,
    },

    #[error("{contract}.{method} is overloaded with {arity} argument(s), cannot pick one")]
    AmbiguousMethod {
        contract: String,
        method: String,
        arity: usize,
    },

    #[error("{context} expects {expected} argument(s), plan provides {actual}")]
    ArgumentCount {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("{context}: argument {index} ({value}) is not a valid {ty}: {reason}")]
    InvalidArgument {
        context: String,
        index: usize,
        value: String,
        ty: String,
        reason: String,
    },

    #[error("{context} uses undefined parameter {param}")]
    MissingParam { context: String, param: String },

    #[error("{context} references {reference} which has no recorded address")]
    UnresolvedAddress { context: String, reference: String },

    #[error("deployer {deployer} must not be the {param} identity")]
    DeployerIsPrivileged { param: String, deployer: Address },

    #[error("parameter {param} must be an address, got {value}")]
    InvalidAddressParam { param: String, value: String },

    #[error("proxy artifact {0} is required by upgradeable contracts but missing")]
    MissingProxyArtifact(String),
}
