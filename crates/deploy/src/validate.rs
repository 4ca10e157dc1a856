//! Plan validation and preflight checks.
//!
//! [`PlanValidator::validate`] checks the plan's structure on its own. [`PlanValidator::preflight`]
//! additionally checks it against the available artifacts and the configuration. Neither
//! touches the chain, and both run to completion before any transaction is sent.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
};

use alloy_core::{dyn_abi::DynSolValue, primitives::Address};
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
};

use crate::{
    artifacts::ContractRegistry,
    config::OrchestratorConfig,
    error::{ConfigurationError, PlanError},
    plan::{ContractSpec, DeploymentPlan},
    resolve::ParamTable,
};

/// Checks plans before they are executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanValidator;

impl PlanValidator {
    /// Check that names are unique, references resolve, wiring slots are distinct and the
    /// dependency relation is acyclic.
    pub fn validate(plan: &DeploymentPlan) -> Result<(), PlanError> {
        Self::check_unique_names(plan)?;
        Self::check_references(plan)?;
        Self::check_wiring_slots(plan)?;
        Self::topological_order(plan).map(|_| ())
    }

    /// Deploy order: every contract after its dependencies, ties broken by declaration order.
    pub fn topological_order(plan: &DeploymentPlan) -> Result<Vec<&ContractSpec>, PlanError> {
        let graph = DependencyGraph::build(plan);

        let mut in_degree: Vec<usize> = graph
            .graph
            .node_indices()
            .map(|n| graph.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut order = Vec::with_capacity(plan.contracts.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(&plan.contracts[index]);
            for dependent in graph
                .graph
                .neighbors_directed(NodeIndex::new(index), Direction::Outgoing)
            {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependent.index()));
                }
            }
        }

        if order.len() < plan.contracts.len() {
            return Err(PlanError::CyclicDependency {
                cycle: graph.find_cycle(plan),
            });
        }

        Ok(order)
    }

    /// Check the plan against artifacts and configuration.
    ///
    /// Contract references are resolved to a placeholder address, so only the shape of
    /// every argument is checked here.
    pub fn preflight(
        plan: &DeploymentPlan,
        registry: &ContractRegistry,
        config: &OrchestratorConfig,
    ) -> Result<(), ConfigurationError> {
        let params = ParamTable::new(plan, &config.params);
        let placeholder = |_: &str| Some(Address::ZERO);

        for param in &config.distinct_from_deployer {
            if params.address(param)? == Some(config.deployer) {
                return Err(ConfigurationError::DeployerIsPrivileged {
                    param: param.clone(),
                    deployer: config.deployer,
                });
            }
        }

        if plan.contracts.iter().any(|c| c.upgradeable) {
            let proxy = registry
                .get_artifact(&config.proxy.artifact)
                .map_err(|_| ConfigurationError::MissingProxyArtifact(config.proxy.artifact.clone()))?;
            proxy.encode_deploy_values(&[
                DynSolValue::Address(Address::ZERO),
                DynSolValue::Bytes(Vec::new()),
            ])?;
        }

        for spec in &plan.contracts {
            let artifact = registry.get_artifact(spec.artifact_name())?;

            if spec.upgradeable {
                let context = format!("{} initializer", spec.name);
                let args = params.resolve(&context, &spec.constructor_args, placeholder)?;
                artifact.encode_deploy(&[])?;
                artifact.encode_call(spec.initializer_name(), &args)?;
            } else {
                let context = format!("{} constructor", spec.name);
                let args = params.resolve(&context, &spec.constructor_args, placeholder)?;
                artifact.encode_deploy(&args)?;
            }

            for derived in &spec.derived {
                artifact.function(&derived.getter, 0)?;
                let derived_artifact = registry.get_artifact(derived.artifact_name())?;
                let context = format!("{} constructor", derived.name);
                let args = params.resolve(&context, &derived.args, placeholder)?;
                derived_artifact.encode_constructor_args(&args)?;
            }
        }

        for step in &plan.wiring {
            let artifact_name = plan
                .artifact_of(&step.target)
                .ok_or_else(|| ConfigurationError::UnknownContract(step.target.clone()))?;
            let artifact = registry.get_artifact(artifact_name)?;
            let args = params.resolve(&step.key(), &step.args, placeholder)?;
            artifact.encode_call(&step.method, &args)?;
        }

        Ok(())
    }

    fn check_unique_names(plan: &DeploymentPlan) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        let names = plan
            .contracts
            .iter()
            .flat_map(|c| std::iter::once(&c.name).chain(c.derived.iter().map(|d| &d.name)));

        for name in names {
            if !seen.insert(name) {
                return Err(PlanError::DuplicateContract(name.clone()));
            }
        }
        Ok(())
    }

    fn check_references(plan: &DeploymentPlan) -> Result<(), PlanError> {
        let unresolved = |from: &str, reference: &str| PlanError::UnresolvedReference {
            from: from.to_string(),
            reference: reference.to_string(),
        };

        for spec in &plan.contracts {
            let names = spec
                .depends_on
                .iter()
                .map(String::as_str)
                .chain(spec.references());
            for name in names {
                if !plan.knows(name) {
                    return Err(unresolved(&spec.name, name));
                }
            }
        }

        for step in &plan.wiring {
            let key = step.key();
            if !plan.knows(&step.target) {
                return Err(unresolved(&key, &step.target));
            }
            if let Some(name) = step
                .args
                .iter()
                .filter_map(|a| a.reference())
                .find(|name| !plan.knows(name))
            {
                return Err(unresolved(&key, name));
            }
        }

        Ok(())
    }

    fn check_wiring_slots(plan: &DeploymentPlan) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for step in &plan.wiring {
            let slot = step.key();
            if seen.contains(&slot) {
                return Err(PlanError::DuplicateWiring(slot));
            }
            seen.insert(slot);
        }
        Ok(())
    }
}

/// Dependency edges between plan contracts. An edge `a -> b` means `b` depends on `a`.
///
/// Node `i` is `plan.contracts[i]`.
struct DependencyGraph {
    graph: DiGraph<(), ()>,
}

impl DependencyGraph {
    fn build(plan: &DeploymentPlan) -> Self {
        let mut graph = DiGraph::with_capacity(plan.contracts.len(), 0);
        let index: HashMap<&str, NodeIndex> = plan
            .contracts
            .iter()
            .map(|spec| (spec.name.as_str(), graph.add_node(())))
            .collect();

        for spec in &plan.contracts {
            let dependent = index[spec.name.as_str()];
            for dependency in plan.dependencies_of(spec) {
                // Unknown names are reported by the reference check.
                if let Some(&dependency) = index.get(dependency) {
                    graph.update_edge(dependency, dependent, ());
                }
            }
        }

        Self { graph }
    }

    /// Names along one cycle, starting and ending at the earliest declared contract on it.
    fn find_cycle(&self, plan: &DeploymentPlan) -> Vec<String> {
        let components = petgraph::algo::tarjan_scc(&self.graph);
        let Some(component) = components
            .into_iter()
            .filter(|c| c.len() > 1)
            .min_by_key(|c| c.iter().map(|n| n.index()).min())
        else {
            return Vec::new();
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let Some(&start) = component.iter().min_by_key(|n| n.index()) else {
            return Vec::new();
        };

        // Shortest path back to `start` inside the component.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut last = start;
        'search: while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by_key(|n| n.index());

            for neighbor in next {
                if neighbor == start {
                    last = node;
                    break 'search;
                }
                if !parent.contains_key(&neighbor) {
                    parent.insert(neighbor, node);
                    queue.push_back(neighbor);
                }
            }
        }

        let mut path = vec![last];
        while let Some(&previous) = path.last().and_then(|n| parent.get(n)) {
            path.push(previous);
        }
        path.reverse();
        if path.first() != Some(&start) {
            path.insert(0, start);
        }
        path.push(start);

        path.into_iter()
            .map(|n| plan.contracts[n.index()].name.clone())
            .collect()
    }
}
