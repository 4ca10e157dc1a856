//! Declarative deployment plans.
//!
//! A [`DeploymentPlan`] describes which contracts to deploy, what they depend on and
//! how they are wired together once deployed. It is pure data: nothing in this module
//! talks to a chain. Plans are usually authored as TOML:
//!
//! ```toml
//! [params]
//! service_admin = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
//!
//! [[contracts]]
//! name = "SpaceFactory"
//! artifact = "SpaceFactoryV1"
//! upgradeable = true
//! args = [{ param = "service_admin" }]
//!
//! [[contracts]]
//! name = "BadgeSBT"
//! args = [{ address_of = "SpaceFactory" }, { param = "service_admin" }]
//!
//! [[wiring]]
//! target = "SpaceFactory"
//! method = "setBadgeSBTAddress"
//! args = [{ address_of = "BadgeSBT" }]
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default initializer invoked through a freshly deployed proxy.
pub const DEFAULT_INITIALIZER: &str = "initialize";

/// A value passed to a constructor, an initializer or a wiring call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanValue {
    /// The resolved address of another contract in the plan.
    AddressOf { address_of: String },
    /// A named deployment parameter, looked up in the plan params and config overrides.
    Param { param: String },
    /// A literal, coerced to the ABI type of the parameter it fills.
    Literal(Literal),
}

impl PlanValue {
    pub fn address_of(name: impl Into<String>) -> Self {
        Self::AddressOf {
            address_of: name.into(),
        }
    }

    pub fn param(name: impl Into<String>) -> Self {
        Self::Param { param: name.into() }
    }

    pub fn literal(value: impl Into<Literal>) -> Self {
        Self::Literal(value.into())
    }

    /// The contract this value refers to, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::AddressOf { address_of } => Some(address_of),
            _ => None,
        }
    }
}

/// A literal argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Integer(i64),
    String(String),
    Array(Vec<Literal>),
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl Literal {
    /// Render the literal in the textual form accepted by ABI type coercion.
    ///
    /// Integers that do not fit an `i64` must be written as strings in the plan.
    pub fn to_abi_string(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::String(s) => s.clone(),
            Self::Array(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(Self::to_abi_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

/// A contract created by another contract's constructor.
///
/// Its address is learned after the parent is deployed by reading `getter` on the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedContract {
    /// Name of the derived contract in the plan namespace.
    pub name: String,
    /// Artifact the derived contract was built from. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Zero-argument getter on the parent returning the derived contract's address.
    pub getter: String,
    /// Constructor arguments the parent used, needed for source verification.
    #[serde(default)]
    pub args: Vec<PlanValue>,
}

impl DerivedContract {
    pub fn artifact_name(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.name)
    }
}

/// One node of the deployment graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Unique name of the contract within the plan.
    pub name: String,
    /// Artifact to deploy. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Constructor arguments, or initializer arguments for upgradeable contracts.
    #[serde(default, rename = "args")]
    pub constructor_args: Vec<PlanValue>,
    /// Contracts that must be deployed before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether the contract lives behind an upgradeable proxy.
    #[serde(default)]
    pub upgradeable: bool,
    /// Initializer called through the proxy. Only meaningful for upgradeable contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<String>,
    /// Contracts deployed by this contract's constructor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<DerivedContract>,
}

impl ContractSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact: None,
            constructor_args: Vec::new(),
            depends_on: Vec::new(),
            upgradeable: false,
            initializer: None,
            derived: Vec::new(),
        }
    }

    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn arg(mut self, value: PlanValue) -> Self {
        self.constructor_args.push(value);
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn upgradeable(mut self, upgradeable: bool) -> Self {
        self.upgradeable = upgradeable;
        self
    }

    pub fn initializer(mut self, method: impl Into<String>) -> Self {
        self.initializer = Some(method.into());
        self
    }

    pub fn derive(mut self, derived: DerivedContract) -> Self {
        self.derived.push(derived);
        self
    }

    pub fn artifact_name(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.name)
    }

    pub fn initializer_name(&self) -> &str {
        self.initializer.as_deref().unwrap_or(DEFAULT_INITIALIZER)
    }

    /// Every contract name referenced by this spec's arguments, including its derived contracts'.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.constructor_args
            .iter()
            .chain(self.derived.iter().flat_map(|d| d.args.iter()))
            .filter_map(PlanValue::reference)
    }

    /// Whether `name` is this spec or one of its derived contracts.
    pub fn owns(&self, name: &str) -> bool {
        self.name == name || self.derived.iter().any(|d| d.name == name)
    }
}

/// A post-deployment configuration call storing one contract's address in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringStep {
    /// Contract the call is sent to.
    pub target: String,
    /// Method name on the target's ABI.
    pub method: String,
    #[serde(default)]
    pub args: Vec<PlanValue>,
    /// Name of the setting this step writes. Defaults to `<target>.<method>`; steps calling
    /// one method several times (`grantRole` for different roles) each need their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

impl WiringStep {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            args: Vec::new(),
            slot: None,
        }
    }

    pub fn arg(mut self, value: PlanValue) -> Self {
        self.args.push(value);
        self
    }

    pub fn slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    /// The slot written by this step, used as its ledger key.
    pub fn key(&self) -> String {
        self.slot
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.target, self.method))
    }
}

/// The full description of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Named parameters referenced with `{ param = "..." }`.
    #[serde(default)]
    pub params: BTreeMap<String, Literal>,
    /// Contracts, in declaration order.
    #[serde(default)]
    pub contracts: Vec<ContractSpec>,
    /// Wiring steps, executed in this order after every deploy.
    #[serde(default)]
    pub wiring: Vec<WiringStep>,
}

impl DeploymentPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contract(mut self, spec: ContractSpec) -> Self {
        self.contracts.push(spec);
        self
    }

    pub fn wire(mut self, step: WiringStep) -> Self {
        self.wiring.push(step);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Literal>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Load a plan from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Plan file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read plan from {}", path.display()))?;
        let plan = Self::from_toml_str(&content)
            .context(format!("Failed to parse plan file {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            contracts = plan.contracts.len(),
            wiring_steps = plan.wiring.len(),
            "Plan loaded"
        );
        Ok(plan)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse plan as TOML")
    }

    pub fn spec(&self, name: &str) -> Option<&ContractSpec> {
        self.contracts.iter().find(|c| c.name == name)
    }

    /// The spec that deploys `name`, either directly or as a derived contract.
    pub fn owner_of(&self, name: &str) -> Option<&ContractSpec> {
        self.contracts.iter().find(|c| c.owns(name))
    }

    /// Whether `name` is a contract or derived contract of this plan.
    pub fn knows(&self, name: &str) -> bool {
        self.owner_of(name).is_some()
    }

    /// Artifact backing `name`, whether it is deployed directly or derived.
    pub fn artifact_of(&self, name: &str) -> Option<&str> {
        let owner = self.owner_of(name)?;
        if owner.name == name {
            return Some(owner.artifact_name());
        }
        owner
            .derived
            .iter()
            .find(|d| d.name == name)
            .map(DerivedContract::artifact_name)
    }

    /// Effective dependencies of `spec`: its `depends_on` entries plus every contract its
    /// arguments reference, mapped to the spec that deploys it.
    ///
    /// References to the spec itself or its own derived contracts are not dependencies.
    /// Unknown names are returned unchanged so the validator can report them.
    pub fn dependencies_of<'a>(&'a self, spec: &'a ContractSpec) -> BTreeSet<&'a str> {
        spec.depends_on
            .iter()
            .map(String::as_str)
            .chain(spec.references())
            .filter(|name| !spec.owns(name))
            .map(|name| self.owner_of(name).map_or(name, |owner| owner.name.as_str()))
            .filter(|name| *name != spec.name)
            .collect()
    }
}
