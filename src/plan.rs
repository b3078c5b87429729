use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::DEFAULT_SCOPE;
use crate::error::{OrchestratorError, Result};
use crate::inputs;

/// Provisioning capabilities an adapter can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateRepository,
    PushFiles,
    SetEnvVars,
    TriggerDeploy,
    ConfigureDns,
    SendNotification,
    RunCi,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::CreateRepository,
        Capability::PushFiles,
        Capability::SetEnvVars,
        Capability::TriggerDeploy,
        Capability::ConfigureDns,
        Capability::SendNotification,
        Capability::RunCi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CreateRepository => "create_repository",
            Capability::PushFiles => "push_files",
            Capability::SetEnvVars => "set_env_vars",
            Capability::TriggerDeploy => "trigger_deploy",
            Capability::ConfigureDns => "configure_dns",
            Capability::SendNotification => "send_notification",
            Capability::RunCi => "run_ci",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_required() -> bool {
    true
}

/// One step as written in a plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub capability: Capability,
    pub provider: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Free-form label; defaults to the capability name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Declarative plan as loaded from YAML, JSON or TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl PlanDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            OrchestratorError::Config(format!("failed to read plan {}: {err}", path.display()))
        })?;
        Self::parse(&contents, path.extension().and_then(|ext| ext.to_str()))
    }

    pub fn parse(contents: &str, extension: Option<&str>) -> Result<Self> {
        let doc = match extension {
            Some("json") => serde_json::from_str(contents)?,
            Some("toml") => toml::from_str(contents)?,
            _ => serde_yaml_bw::from_str(contents)?,
        };
        Ok(doc)
    }
}

/// Validated, immutable provisioning step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningStep {
    pub id: String,
    pub provider: String,
    pub capability: Capability,
    pub scope: String,
    pub operation: String,
    pub inputs: Value,
    pub depends_on: IndexSet<String>,
    pub required: bool,
}

impl From<StepSpec> for ProvisioningStep {
    fn from(spec: StepSpec) -> Self {
        let inputs = match spec.inputs {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            operation: spec
                .operation
                .unwrap_or_else(|| spec.capability.as_str().to_string()),
            id: spec.id,
            provider: spec.provider,
            capability: spec.capability,
            scope: spec.scope,
            inputs,
            depends_on: spec.depends_on.into_iter().collect(),
            required: spec.required,
        }
    }
}

/// A validated DAG of provisioning steps.
#[derive(Debug, Clone)]
pub struct Plan {
    name: String,
    steps: IndexMap<String, Arc<ProvisioningStep>>,
    /// Declaration indices of each step's dependencies.
    dependencies: Vec<Vec<usize>>,
    /// Declaration indices of each step's direct dependents.
    dependents: Vec<Vec<usize>>,
    /// Declaration indices in topological order (ties broken by declaration order).
    order: Vec<usize>,
    /// Position of each declaration index within `order`.
    rank: Vec<usize>,
}

impl Plan {
    pub fn from_document(doc: PlanDocument) -> Result<Self> {
        Self::new(doc.name, doc.steps)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_document(PlanDocument::load(path)?)
    }

    pub fn new(name: impl Into<String>, specs: Vec<StepSpec>) -> Result<Self> {
        let mut steps = IndexMap::with_capacity(specs.len());
        for spec in specs {
            if steps.contains_key(&spec.id) {
                return Err(OrchestratorError::DuplicateStep(spec.id));
            }
            let step = ProvisioningStep::from(spec);
            steps.insert(step.id.clone(), Arc::new(step));
        }

        let mut dependencies = Vec::with_capacity(steps.len());
        let mut dependents = vec![Vec::new(); steps.len()];
        for (index, step) in steps.values().enumerate() {
            let mut deps = Vec::with_capacity(step.depends_on.len());
            for dependency in &step.depends_on {
                let dep_index = steps.get_index_of(dependency).ok_or_else(|| {
                    OrchestratorError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                deps.push(dep_index);
                dependents[dep_index].push(index);
            }
            dependencies.push(deps);

            let referenced = inputs::step_references(&step.inputs)
                .map_err(|err| OrchestratorError::Config(format!("step '{}': {err}", step.id)))?;
            if let Some(referenced) = referenced
                .into_iter()
                .find(|referenced| !step.depends_on.contains(referenced))
            {
                return Err(OrchestratorError::UndeclaredReference {
                    step: step.id.clone(),
                    referenced,
                });
            }
        }

        let order = topological_order(&steps, &dependencies, &dependents)?;
        let mut rank = vec![0; order.len()];
        for (position, index) in order.iter().enumerate() {
            rank[*index] = position;
        }

        Ok(Self {
            name: name.into(),
            steps,
            dependencies,
            dependents,
            order,
            rank,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &Arc<ProvisioningStep>> {
        self.steps.values()
    }

    pub fn step(&self, id: &str) -> Option<&Arc<ProvisioningStep>> {
        self.steps.get(id)
    }

    pub fn step_at(&self, index: usize) -> &Arc<ProvisioningStep> {
        &self.steps[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.get_index_of(id)
    }

    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Declaration indices in deterministic topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn rank_of(&self, index: usize) -> usize {
        self.rank[index]
    }

    pub fn topological_order(&self) -> Vec<&ProvisioningStep> {
        self.order.iter().map(|index| self.steps[*index].as_ref()).collect()
    }

    /// Every step reachable through `dependents` edges from `index`, in topological order.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<usize> = self.dependents[index].clone();
        while let Some(current) = stack.pop() {
            if seen[current] {
                continue;
            }
            seen[current] = true;
            stack.extend(self.dependents[current].iter().copied());
        }
        self.order
            .iter()
            .copied()
            .filter(|candidate| seen[*candidate])
            .collect()
    }

    /// Groups steps into waves whose members only depend on earlier waves.
    pub fn layers(&self) -> Vec<Vec<&str>> {
        let mut depth = vec![0usize; self.len()];
        for index in &self.order {
            depth[*index] = self.dependencies[*index]
                .iter()
                .map(|dep| depth[*dep] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut layers: Vec<Vec<&str>> = Vec::new();
        for index in &self.order {
            let level = depth[*index];
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(self.steps[*index].id.as_str());
        }
        layers
    }

    /// Providers referenced by the plan, deduplicated in declaration order.
    pub fn providers(&self) -> IndexSet<&str> {
        self.steps().map(|step| step.provider.as_str()).collect()
    }
}

fn topological_order(
    steps: &IndexMap<String, Arc<ProvisioningStep>>,
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for dependent in &dependents[index] {
            in_degree[*dependent] -= 1;
            if in_degree[*dependent] == 0 {
                ready.push(Reverse(*dependent));
            }
        }
    }

    if order.len() == steps.len() {
        return Ok(order);
    }

    // Every unprocessed step still waits on another unprocessed step, so walking
    // dependencies from any of them must revisit a node.
    let blocked: Vec<bool> = in_degree.iter().map(|degree| *degree > 0).collect();
    let Some(start) = blocked.iter().position(|b| *b) else {
        return Err(OrchestratorError::Other(
            "topological sort stalled without a blocked step".into(),
        ));
    };
    let mut path: Vec<usize> = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(at) = position.get(&current) {
            let mut cycle: Vec<String> = path[*at..]
                .iter()
                .map(|index| steps[*index].id.clone())
                .collect();
            cycle.push(steps[current].id.clone());
            return Err(OrchestratorError::CyclicDependency { cycle });
        }
        position.insert(current, path.len());
        path.push(current);
        match dependencies[current].iter().find(|dep| blocked[**dep]) {
            Some(next) => current = *next,
            None => {
                return Err(OrchestratorError::Other(format!(
                    "step '{}' blocked without a blocked dependency",
                    steps[current].id
                )));
            }
        }
    }
}
