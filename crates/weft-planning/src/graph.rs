//! Plan graph compilation
//!
//! Turns a flat list of steps into a validated DAG. Validation is all or
//! nothing: duplicate ids, dangling dependency edges and cycles reject the
//! whole plan before any task is admitted.

use std::collections::{HashMap, VecDeque};

use tracing::debug;
use weft_core::{Plan, Result, Step, StepId, WeftError};

/// A validated, acyclic plan
#[derive(Debug, Clone)]
pub struct PlanGraph {
    plan_id: String,
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
    /// dependencies[i] = positions of the steps i waits on
    dependencies: Vec<Vec<usize>>,
    /// dependents[i] = positions of the steps waiting on i
    dependents: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
}

impl PlanGraph {
    /// Validate `plan` and build the graph
    pub fn compile(plan: &Plan) -> Result<Self> {
        let mut index = HashMap::with_capacity(plan.steps.len());

        for (pos, step) in plan.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(WeftError::InvalidPlan(format!(
                    "step at position {} has an empty id",
                    pos
                )));
            }
            if step.resource_category.trim().is_empty() {
                return Err(WeftError::InvalidPlan(format!(
                    "step {} has no resource category",
                    step.id
                )));
            }
            if index.insert(step.id.clone(), pos).is_some() {
                return Err(WeftError::DuplicateStep(step.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); plan.steps.len()];
        let mut dependents = vec![Vec::new(); plan.steps.len()];

        for (pos, step) in plan.steps.iter().enumerate() {
            for dep in &step.dependencies {
                let dep_pos = *index.get(dep).ok_or_else(|| WeftError::MissingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
                dependencies[pos].push(dep_pos);
                dependents[dep_pos].push(pos);
            }
        }

        let mut graph = Self {
            plan_id: plan.id.clone(),
            steps: plan.steps.clone(),
            index,
            dependencies,
            dependents,
            topo_order: Vec::new(),
        };
        graph.topo_order = graph.topological_sort()?;

        debug!(
            "Compiled plan {} with {} steps",
            graph.plan_id,
            graph.steps.len()
        );
        Ok(graph)
    }

    // Kahn's algorithm; leftovers mean a cycle
    fn topological_sort(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(pos) = queue.pop_front() {
            order.push(pos);
            for &dependent in &self.dependents[pos] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() == self.steps.len() {
            return Ok(order);
        }

        let remaining: Vec<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] > 0)
            .collect();
        Err(WeftError::Cycle {
            path: self.find_cycle(&remaining),
        })
    }

    /// Walk dependency edges from a stuck node until one repeats
    fn find_cycle(&self, remaining: &[usize]) -> Vec<String> {
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };

        let stuck: std::collections::HashSet<usize> = remaining.iter().copied().collect();
        let mut seen_at: HashMap<usize, usize> = HashMap::new();
        let mut walk = Vec::new();
        let mut current = start;

        loop {
            if let Some(&at) = seen_at.get(&current) {
                let mut path: Vec<String> = walk[at..]
                    .iter()
                    .map(|&i: &usize| self.steps[i].id.clone())
                    .collect();
                path.push(self.steps[current].id.clone());
                // Walked along "depends on" edges; report in execution order
                path.reverse();
                return path;
            }
            seen_at.insert(current, walk.len());
            walk.push(current);

            // Every stuck node has at least one stuck dependency
            match self.dependencies[current]
                .iter()
                .copied()
                .find(|d| stuck.contains(d))
            {
                Some(next) => current = next,
                None => return walk.iter().map(|&i| self.steps[i].id.clone()).collect(),
            }
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in insertion order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&pos| &self.steps[pos])
    }

    /// Insertion position, used as the FIFO tie-break
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&Step> {
        self.index
            .get(id)
            .map(|&pos| {
                self.dependencies[pos]
                    .iter()
                    .map(|&d| &self.steps[d])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<&Step> {
        self.index
            .get(id)
            .map(|&pos| self.dependents[pos].iter().map(|&d| &self.steps[d]).collect())
            .unwrap_or_default()
    }

    /// Every step reachable downstream of `id`
    pub fn descendants(&self, id: &str) -> Vec<StepId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };

        let mut seen = vec![false; self.steps.len()];
        let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
        let mut out = Vec::new();

        while let Some(pos) = queue.pop_front() {
            if std::mem::replace(&mut seen[pos], true) {
                continue;
            }
            out.push(self.steps[pos].id.clone());
            queue.extend(self.dependents[pos].iter().copied());
        }
        out
    }

    pub fn topological_order(&self) -> Vec<&Step> {
        self.topo_order.iter().map(|&i| &self.steps[i]).collect()
    }

    /// Static batch layering: a step sits one layer after its deepest dependency.
    ///
    /// Inside a batch steps are ordered by priority, then insertion order.
    /// When every task succeeds the scheduler dispatches exactly these batches.
    pub fn batches(&self) -> Vec<Vec<StepId>> {
        let mut depth = vec![0usize; self.steps.len()];
        for &pos in &self.topo_order {
            depth[pos] = self.dependencies[pos]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let layers = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut batches: Vec<Vec<usize>> = vec![Vec::new(); layers];
        for (pos, &d) in depth.iter().enumerate() {
            batches[d].push(pos);
        }

        batches
            .into_iter()
            .map(|mut batch| {
                batch.sort_by_key(|&pos| (self.steps[pos].priority, pos));
                batch
                    .into_iter()
                    .map(|pos| self.steps[pos].id.clone())
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Priority;

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new("test").with_steps(steps)
    }

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, format!("step {}", id), "default").with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_diamond_batches() {
        let graph = PlanGraph::compile(&plan(vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
        ]))
        .unwrap();

        assert_eq!(
            graph.batches(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(graph.dependents_of("a").len(), 1);
        assert_eq!(graph.dependencies_of("c").len(), 2);
    }

    #[test]
    fn test_dependencies_always_in_earlier_batches() {
        let graph = PlanGraph::compile(&plan(vec![
            step("e", &["d", "a"]),
            step("a", &[]),
            step("d", &["b", "c"]),
            step("b", &["a"]),
            step("c", &[]),
            step("f", &["e", "c"]),
        ]))
        .unwrap();

        let batches = graph.batches();
        let layer_of: HashMap<&str, usize> = batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for step in graph.steps() {
            for dep in &step.dependencies {
                assert!(layer_of[dep.as_str()] < layer_of[step.id.as_str()]);
            }
        }
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let err = PlanGraph::compile(&plan(vec![step("a", &["b"]), step("b", &["a"])]))
            .unwrap_err();

        match err {
            WeftError::Cycle { path } => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let err = PlanGraph::compile(&plan(vec![
            step("root", &[]),
            step("x", &["root", "z"]),
            step("y", &["x"]),
            step("z", &["y"]),
        ]))
        .unwrap_err();

        let WeftError::Cycle { path } = err else {
            panic!("expected cycle");
        };
        assert!(!path.contains(&"root".to_string()));
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = PlanGraph::compile(&plan(vec![step("a", &["a"])])).unwrap_err();
        assert!(matches!(err, WeftError::Cycle { .. }));
    }

    #[test]
    fn test_missing_dependency() {
        let err = PlanGraph::compile(&plan(vec![step("a", &["ghost"])])).unwrap_err();
        match err {
            WeftError::MissingDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_step() {
        let err = PlanGraph::compile(&plan(vec![step("a", &[]), step("a", &[])])).unwrap_err();
        assert!(matches!(err, WeftError::DuplicateStep(id) if id == "a"));
    }

    #[test]
    fn test_empty_category_rejected() {
        let err = PlanGraph::compile(&plan(vec![Step::new("a", "", "")])).unwrap_err();
        assert!(matches!(err, WeftError::InvalidPlan(_)));
    }

    #[test]
    fn test_priority_orders_within_batch() {
        let graph = PlanGraph::compile(&plan(vec![
            step("low", &[]).with_priority(Priority::Low),
            step("plain", &[]),
            step("urgent", &[]).with_priority(Priority::Critical),
        ]))
        .unwrap();

        assert_eq!(graph.batches()[0], vec!["urgent", "plain", "low"]);
    }

    #[test]
    fn test_descendants() {
        let graph = PlanGraph::compile(&plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ]))
        .unwrap();

        let mut down = graph.descendants("a");
        down.sort();
        assert_eq!(down, vec!["b", "c"]);
        assert!(graph.descendants("d").is_empty());
    }

    #[test]
    fn test_empty_plan() {
        let graph = PlanGraph::compile(&plan(vec![])).unwrap();
        assert!(graph.is_empty());
        assert!(graph.batches().is_empty());
    }
}
