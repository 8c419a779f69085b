//! Fluent plan construction and plan files

use std::path::Path;

use weft_core::{Plan, Priority, Result, Step, StepId, WeftError};

use crate::graph::PlanGraph;

/// Builds a [`Plan`] step by step
///
/// ```
/// use weft_planning::PlanBuilder;
///
/// let graph = PlanBuilder::new("release")
///     .step("build", "compile artifacts", "cpu")
///     .step("test", "run the suite", "cpu")
///     .depends_on("build")
///     .step("publish", "upload", "network")
///     .depends_on("test")
///     .compile()
///     .unwrap();
///
/// assert_eq!(graph.batches().len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            plan: Plan::new(name),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.plan.id = id.into();
        self
    }

    /// Append a new step; later modifiers apply to it
    pub fn step(
        mut self,
        id: impl Into<StepId>,
        description: impl Into<String>,
        resource_category: impl Into<String>,
    ) -> Self {
        self.plan
            .add_step(Step::new(id, description, resource_category));
        self
    }

    /// Append a fully built step
    pub fn add(mut self, step: Step) -> Self {
        self.plan.add_step(step);
        self
    }

    /// Make the most recent step depend on `dependency`
    pub fn depends_on(mut self, dependency: impl Into<StepId>) -> Self {
        if let Some(step) = self.plan.steps.last_mut() {
            step.dependencies.insert(dependency.into());
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        if let Some(step) = self.plan.steps.last_mut() {
            step.priority = priority;
        }
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let Some(step) = self.plan.steps.last_mut() {
            step.inputs.insert(key.into(), value);
        }
        self
    }

    pub fn build(self) -> Plan {
        self.plan
    }

    /// Build and validate in one go
    pub fn compile(self) -> Result<PlanGraph> {
        PlanGraph::compile(&self.plan)
    }
}

/// Read a plan from a JSON file
pub fn load_plan(path: &Path) -> Result<Plan> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| WeftError::InvalidPlan(format!("{}: {}", path.display(), e)))
}

/// Write a plan as pretty JSON
pub fn save_plan(plan: &Plan, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(plan)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_modifiers_apply_to_last_step() {
        let plan = PlanBuilder::new("p")
            .step("a", "first", "io")
            .priority(Priority::High)
            .step("b", "second", "io")
            .depends_on("a")
            .input("command", serde_json::json!("true"))
            .build();

        assert_eq!(plan.step("a").unwrap().priority, Priority::High);
        assert!(plan.step("a").unwrap().dependencies.is_empty());
        assert!(plan.step("b").unwrap().dependencies.contains("a"));
        assert_eq!(plan.step("b").unwrap().inputs["command"], "true");
    }

    #[test]
    fn test_compile_surfaces_plan_errors() {
        let err = PlanBuilder::new("p")
            .step("a", "", "io")
            .depends_on("missing")
            .compile()
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_plan_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plans/p.json");
        let plan = PlanBuilder::new("p")
            .with_id("plan-fixed")
            .step("a", "", "io")
            .build();

        save_plan(&plan, &path).unwrap();
        let loaded = load_plan(&path).unwrap();
        assert_eq!(loaded.id, "plan-fixed");
        assert_eq!(loaded.steps, plan.steps);
    }

    #[test]
    fn test_malformed_plan_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"steps\": [{\"id\": 1}]}").unwrap();
        assert!(matches!(
            load_plan(&path).unwrap_err(),
            WeftError::InvalidPlan(_)
        ));
    }
}
