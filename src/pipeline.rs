//! Derived variables computed on demand from stored or other derived ones

use crate::error::{Result, VdsError};
use crate::grid::Grid;
use crate::types::VarType;
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::sync::Arc;

/// One computation producing derived variables.
///
/// `calculate` receives the input grids in `inputs()` order and fills the
/// pre-allocated output grids in `outputs()` order. All outputs cover the
/// requested region; inputs cover the matching region of their own type.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<String>;

    fn outputs(&self) -> Vec<(String, VarType)>;

    fn calculate(
        &self,
        inputs: &[&Grid],
        outputs: &mut [Grid],
        timestep: usize,
        reflevel: usize,
        lod: usize,
    ) -> Result<()>;
}

impl fmt::Debug for dyn PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

type StageFn = dyn Fn(&[&Grid], &mut [Grid], usize, usize, usize) -> Result<()> + Send + Sync;

/// Stage backed by a closure
pub struct FnStage {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<(String, VarType)>,
    func: Box<StageFn>,
}

impl FnStage {
    pub fn new<F>(
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<(String, VarType)>,
        func: F,
    ) -> Self
    where
        F: Fn(&[&Grid], &mut [Grid], usize, usize, usize) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs,
            outputs,
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl PipelineStage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<(String, VarType)> {
        self.outputs.clone()
    }

    fn calculate(
        &self,
        inputs: &[&Grid],
        outputs: &mut [Grid],
        timestep: usize,
        reflevel: usize,
        lod: usize,
    ) -> Result<()> {
        (self.func)(inputs, outputs, timestep, reflevel, lod)
    }
}

/// Stages that could not be ordered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub involved_stages: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circular dependency among stages {}", self.involved_stages.join(", "))
    }
}

impl From<CycleError> for VdsError {
    fn from(err: CycleError) -> Self {
        VdsError::Pipeline(err.to_string())
    }
}

/// Registered stages, in registration order
#[derive(Default)]
pub struct PipelineRegistry {
    stages: IndexMap<String, Arc<dyn PipelineStage>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }

    pub fn stage(&self, name: &str) -> Option<Arc<dyn PipelineStage>> {
        self.stages.get(name).cloned()
    }

    /// Stage producing derived variable `var`
    pub fn stage_for_output(&self, var: &str) -> Option<Arc<dyn PipelineStage>> {
        self.stages
            .values()
            .find(|s| s.outputs().iter().any(|(name, _)| name == var))
            .cloned()
    }

    pub fn is_derived(&self, var: &str) -> bool {
        self.stage_for_output(var).is_some()
    }

    /// Type of derived variable `var`
    pub fn output_type(&self, var: &str) -> Option<VarType> {
        self.stages.values().find_map(|s| {
            s.outputs()
                .into_iter()
                .find(|(name, _)| name == var)
                .map(|(_, t)| t)
        })
    }

    /// Register `stage`, replacing a stage of the same name. `native` lists
    /// the variables stored in the dataset. Returns the replaced stage.
    pub fn add(
        &mut self,
        stage: Arc<dyn PipelineStage>,
        native: &[String],
    ) -> Result<Option<Arc<dyn PipelineStage>>> {
        let name = stage.name().to_string();
        let outputs = stage.outputs();
        if name.is_empty() {
            return Err(VdsError::Pipeline("stage name is empty".to_string()));
        }
        let Some((_, out_type)) = outputs.first() else {
            return Err(VdsError::Pipeline(format!("stage {} has no outputs", name)));
        };
        if outputs.iter().any(|(_, t)| t != out_type) {
            return Err(VdsError::Pipeline(format!(
                "outputs of stage {} must share one variable type",
                name
            )));
        }

        let mut seen = IndexSet::new();
        for (out, _) in &outputs {
            if !seen.insert(out.as_str()) {
                return Err(VdsError::Pipeline(format!(
                    "stage {} lists output {} twice",
                    name, out
                )));
            }
            if native.iter().any(|n| n == out) {
                return Err(VdsError::Pipeline(format!(
                    "output {} of stage {} collides with a stored variable",
                    out, name
                )));
            }
            if let Some(other) = self
                .stages
                .values()
                .filter(|s| s.name() != name)
                .find(|s| s.outputs().iter().any(|(o, _)| o == out))
            {
                return Err(VdsError::Pipeline(format!(
                    "output {} of stage {} is already produced by {}",
                    out,
                    name,
                    other.name()
                )));
            }
        }

        let mut candidate = self.stages.clone();
        candidate.insert(name.clone(), stage.clone());

        for input in stage.inputs() {
            let known = native.contains(&input)
                || candidate
                    .values()
                    .any(|s| s.outputs().iter().any(|(o, _)| *o == input));
            if !known {
                return Err(VdsError::Pipeline(format!(
                    "input {} of stage {} is neither stored nor derived",
                    input, name
                )));
            }
        }

        topological_order(&candidate)?;
        Ok(self.stages.insert(name, stage))
    }

    /// Unregister a stage, returning the names of its outputs
    pub fn remove(&mut self, name: &str) -> Result<Vec<String>> {
        let stage = self
            .stages
            .shift_remove(name)
            .ok_or_else(|| VdsError::Pipeline(format!("no stage named {}", name)))?;
        Ok(stage.outputs().into_iter().map(|(o, _)| o).collect())
    }

    /// Stage names ordered so every stage follows the stages it reads from
    pub fn execution_order(&self) -> Result<Vec<String>> {
        Ok(topological_order(&self.stages)?)
    }
}

/// Kahn's algorithm over the produces/consumes relation
fn topological_order(
    stages: &IndexMap<String, Arc<dyn PipelineStage>>,
) -> std::result::Result<Vec<String>, CycleError> {
    let mut producer: IndexMap<String, &str> = IndexMap::new();
    for (name, stage) in stages {
        for (out, _) in stage.outputs() {
            producer.insert(out, name.as_str());
        }
    }

    let mut in_degree: IndexMap<&str, usize> = stages.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for (name, stage) in stages {
        let mut seen = IndexSet::new();
        for input in stage.inputs() {
            if let Some(&from) = producer.get(&input) {
                if seen.insert(from) {
                    *in_degree.entry(name.as_str()).or_default() += 1;
                    dependents.entry(from).or_default().push(name.as_str());
                }
            }
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(name) = ready.pop() {
        order.push(name.to_string());
        for &dep in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dep) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dep);
                }
            }
        }
    }

    if order.len() != stages.len() {
        return Err(CycleError {
            involved_stages: in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(&n, _)| n.to_string())
                .collect(),
        });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<dyn PipelineStage> {
        Arc::new(FnStage::new(
            name,
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs.iter().map(|s| (s.to_string(), VarType::Var3D)).collect(),
            |_, _, _, _, _| Ok(()),
        ))
    }

    fn native() -> Vec<String> {
        vec!["u".to_string(), "v".to_string()]
    }

    #[test]
    fn test_execution_order_follows_dependencies() {
        let mut reg = PipelineRegistry::new();
        reg.add(stage("speed", &["u", "v"], &["mag"]), &native()).unwrap();
        reg.add(stage("scaled", &["mag"], &["mag2"]), &native()).unwrap();
        reg.add(stage("sum", &["mag2", "u"], &["s"]), &native()).unwrap();
        let order = reg.execution_order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("speed") < pos("scaled"));
        assert!(pos("scaled") < pos("sum"));
        assert_eq!(reg.stage_for_output("mag2").unwrap().name(), "scaled");
        assert_eq!(reg.output_type("s"), Some(VarType::Var3D));
    }

    #[test]
    fn test_rejects_collisions() {
        let mut reg = PipelineRegistry::new();
        assert!(reg.add(stage("bad", &["u"], &["v"]), &native()).is_err());
        reg.add(stage("a", &["u"], &["x"]), &native()).unwrap();
        assert!(reg.add(stage("b", &["v"], &["x"]), &native()).is_err());
        assert!(reg.add(stage("c", &["nope"], &["y"]), &native()).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_rejects_cycles() {
        let mut reg = PipelineRegistry::new();
        let err = reg.add(stage("self", &["z"], &["z"]), &native()).unwrap_err();
        assert!(matches!(err, VdsError::Pipeline(_)));

        reg.add(stage("a", &["u"], &["x"]), &native()).unwrap();
        reg.add(stage("b", &["x"], &["y"]), &native()).unwrap();
        // Replacing "a" so it reads "y" closes a loop
        assert!(reg.add(stage("a", &["y"], &["x"]), &native()).is_err());
        assert_eq!(reg.stage("a").unwrap().inputs(), vec!["u".to_string()]);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut reg = PipelineRegistry::new();
        reg.add(stage("a", &["u"], &["x"]), &native()).unwrap();
        let old = reg.add(stage("a", &["v"], &["x", "w"]), &native()).unwrap();
        assert!(old.is_some());
        assert_eq!(reg.len(), 1);
        assert!(reg.is_derived("w"));
        assert_eq!(reg.remove("a").unwrap(), vec!["x".to_string(), "w".to_string()]);
        assert!(reg.remove("a").is_err());
        assert!(reg.is_empty());
    }
}
