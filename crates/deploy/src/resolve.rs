//! Turning plan values into the textual arguments fed to ABI coercion.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;

use crate::{
    error::ConfigurationError,
    plan::{DeploymentPlan, PlanValue},
};

/// Deployment parameters: the plan's `[params]` overlaid with configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamTable {
    values: BTreeMap<String, String>,
}

impl ParamTable {
    pub fn new(plan: &DeploymentPlan, overrides: &BTreeMap<String, String>) -> Self {
        let mut values: BTreeMap<String, String> = plan
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.to_abi_string()))
            .collect();
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Parse parameter `name` as an address, if it is set.
    pub fn address(&self, name: &str) -> Result<Option<Address>, ConfigurationError> {
        self.get(name)
            .map(|value| {
                value
                    .parse::<Address>()
                    .map_err(|_| ConfigurationError::InvalidAddressParam {
                        param: name.to_string(),
                        value: value.to_string(),
                    })
            })
            .transpose()
    }

    /// Resolve `values` in order.
    ///
    /// `address_of` maps a contract name to its address; `None` means the contract has not
    /// been deployed yet.
    pub fn resolve<F>(
        &self,
        context: &str,
        values: &[PlanValue],
        address_of: F,
    ) -> Result<Vec<String>, ConfigurationError>
    where
        F: Fn(&str) -> Option<Address>,
    {
        values
            .iter()
            .map(|value| match value {
                PlanValue::AddressOf { address_of: name } => address_of(name)
                    .map(|address| address.to_string())
                    .ok_or_else(|| ConfigurationError::UnresolvedAddress {
                        context: context.to_string(),
                        reference: name.clone(),
                    }),
                PlanValue::Param { param } => self
                    .get(param)
                    .map(str::to_string)
                    .ok_or_else(|| ConfigurationError::MissingParam {
                        context: context.to_string(),
                        param: param.clone(),
                    }),
                PlanValue::Literal(literal) => Ok(literal.to_abi_string()),
            })
            .collect()
    }
}
