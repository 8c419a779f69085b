//! Task-list snapshots
//!
//! A task list is the plan plus the live status of every task, written as
//! one JSON file. It carries enough of each step to rebuild the plan, so a
//! run can be resumed from the file alone.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use weft_core::{
    Plan, Priority, Result, Step, StepId, StepInputs, TaskExecution, TaskStatus, WeftError,
};
use weft_planning::PlanGraph;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    #[serde(default)]
    pub cancelled_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub id: StepId,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    pub resource_category: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub inputs: StepInputs,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub plan_id: String,
    #[serde(default)]
    pub plan_name: String,
    pub metadata: TaskListMetadata,
    pub tasks: Vec<TaskEntry>,
}

impl TaskList {
    /// Snapshot a run; `tasks` is indexed like `graph.steps()`
    pub fn from_run(
        graph: &PlanGraph,
        plan_name: &str,
        tasks: &[TaskExecution],
        created_at: DateTime<Utc>,
    ) -> Self {
        let entries: Vec<TaskEntry> = graph
            .steps()
            .iter()
            .zip(tasks)
            .map(|(step, exec)| TaskEntry {
                id: step.id.clone(),
                status: exec.status,
                dependencies: step.dependencies.iter().cloned().collect(),
                error: exec.error.clone(),
                started_at: exec.started_at,
                completed_at: exec.completed_at,
                description: step.description.clone(),
                resource_category: step.resource_category.clone(),
                priority: step.priority,
                inputs: step.inputs.clone(),
                retry_count: exec.retry_count,
                hint: exec.hint.clone(),
            })
            .collect();

        let count = |status: TaskStatus| entries.iter().filter(|t| t.status == status).count();
        let metadata = TaskListMetadata {
            created_at,
            updated_at: Utc::now(),
            total_tasks: entries.len(),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Failed),
            cancelled_tasks: count(TaskStatus::Cancelled),
        };

        Self {
            plan_id: graph.plan_id().to_string(),
            plan_name: plan_name.to_string(),
            metadata,
            tasks: entries,
        }
    }

    /// Write atomically (temp file + rename)
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(
            "Saved task list for {} ({}/{} completed)",
            self.plan_id, self.metadata.completed_tasks, self.metadata.total_tasks
        );
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WeftError::TaskList(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| WeftError::TaskList(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Rebuild the plan and the task states to resume from
    ///
    /// Tasks caught mid-flight (ready, assigned or running) go back to
    /// pending and lose their timestamps. Terminal tasks keep their status.
    pub fn into_plan(self) -> Result<(Plan, Vec<TaskExecution>)> {
        let mut steps = Vec::with_capacity(self.tasks.len());
        let mut executions = Vec::with_capacity(self.tasks.len());

        for entry in self.tasks {
            let mut exec = TaskExecution::new(entry.id.clone());
            exec.retry_count = entry.retry_count;
            exec.hint = entry.hint;
            if entry.status.is_terminal() {
                exec.status = entry.status;
                exec.error = entry.error;
                exec.started_at = entry.started_at;
                exec.completed_at = entry.completed_at;
            }
            executions.push(exec);

            let mut step = Step::new(entry.id, entry.description, entry.resource_category)
                .with_dependencies(entry.dependencies)
                .with_priority(entry.priority);
            step.inputs = entry.inputs;
            steps.push(step);
        }

        let mut plan = Plan::new(self.plan_name).with_steps(steps);
        plan.id = self.plan_id;
        plan.created_at = self.metadata.created_at;
        Ok((plan, executions))
    }

    /// First task that still has work to do, in plan order
    pub fn first_pending(&self) -> Option<&TaskEntry> {
        self.tasks.iter().find(|t| !t.status.is_terminal())
    }

    pub fn is_finished(&self) -> bool {
        self.first_pending().is_none()
    }
}
