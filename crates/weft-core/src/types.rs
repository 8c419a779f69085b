//! Core type definitions for Weft orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::{Result, WeftError};

/// Step identifier, unique within a plan
pub type StepId = String;

/// Free-form step inputs handed to the executor untouched
pub type StepInputs = serde_json::Map<String, serde_json::Value>;

/// Step priority levels, used to break ties inside a batch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Lifecycle status of a task execution
///
/// ```text
/// Pending -> Ready -> Assigned -> Running -> Completed
///                                         -> Failed -> (retry) Ready
/// Pending | Ready | Assigned | Running -> Cancelled
/// Ready -> Failed (no slot granted in time)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled end a task's run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Assigned)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Ready)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// One atomic unit of work, tagged with a resource category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub description: String,
    pub resource_category: String,
    #[serde(default)]
    pub dependencies: BTreeSet<StepId>,
    #[serde(default)]
    pub inputs: StepInputs,
    #[serde(default)]
    pub priority: Priority,
}

impl Step {
    pub fn new(
        id: impl Into<StepId>,
        description: impl Into<String>,
        resource_category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            resource_category: resource_category.into(),
            dependencies: BTreeSet::new(),
            inputs: StepInputs::new(),
            priority: Priority::default(),
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<StepId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A declarative set of steps submitted as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_plan_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_plan_id() -> String {
    format!("plan-{}", Uuid::new_v4())
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_plan_id(),
            name: name.into(),
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A granted slot binding a step to its resource category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub step_id: StepId,
    pub category: String,
    pub granted_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(step_id: impl Into<StepId>, category: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: step_id.into(),
            category: category.into(),
            granted_at: Utc::now(),
        }
    }
}

/// What the external executor reports for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl ExecutionReport {
    pub fn success(artifacts: Vec<String>, duration_seconds: f64) -> Self {
        Self {
            success: true,
            artifacts,
            error: None,
            duration_seconds,
        }
    }

    pub fn failure(error: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            error: Some(error.into()),
            duration_seconds,
        }
    }
}

/// Tagged outcome produced by the executor adapter
///
/// Error recovery consumes this directly. A `PermanentFailure` is never
/// retried; an `UnclassifiedFailure` is a failure nobody recognised and
/// gets the conservative retry for unknown errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Ok(ExecutionReport),
    TransientFailure {
        message: String,
        duration_seconds: f64,
    },
    PermanentFailure {
        message: String,
        duration_seconds: f64,
    },
    UnclassifiedFailure {
        message: String,
        duration_seconds: f64,
    },
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentFailure { .. })
    }

    pub fn duration_seconds(&self) -> f64 {
        match self {
            Self::Ok(report) => report.duration_seconds,
            Self::TransientFailure {
                duration_seconds, ..
            }
            | Self::PermanentFailure {
                duration_seconds, ..
            }
            | Self::UnclassifiedFailure {
                duration_seconds, ..
            } => *duration_seconds,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::TransientFailure { message, .. }
            | Self::PermanentFailure { message, .. }
            | Self::UnclassifiedFailure { message, .. } => Some(message),
        }
    }
}

/// Runtime state of one step as it moves through the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub step_id: StepId,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignment: Option<Assignment>,
    #[serde(default)]
    pub result: Option<ExecutionReport>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory fix attached by error recovery
    #[serde(default)]
    pub hint: Option<String>,
}

impl TaskExecution {
    pub fn new(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
            status: TaskStatus::Pending,
            assignment: None,
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            hint: None,
        }
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    ///
    /// Entering Running stamps `started_at` once; entering a terminal state
    /// stamps `completed_at`. Leaving Failed for a retry clears the
    /// completion stamp but keeps the last error for diagnostics.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidTransition {
                step: self.step_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            TaskStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            TaskStatus::Ready if self.status == TaskStatus::Failed => {
                self.retry_count += 1;
                self.completed_at = None;
            }
            _ => {}
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }

        self.status = next;
        Ok(())
    }

    /// Cancel with a reason, from any non-terminal status
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(reason.into());
        self.assignment = None;
        Ok(())
    }

    /// Mark failed with the error carried verbatim
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.assignment = None;
        Ok(())
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Diagnostics for one task inside a plan result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub step_id: StepId,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    pub artifacts: Vec<String>,
    pub hint: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskExecution> for TaskResult {
    fn from(execution: &TaskExecution) -> Self {
        Self {
            step_id: execution.step_id.clone(),
            status: execution.status,
            error: execution.error.clone(),
            retry_count: execution.retry_count,
            artifacts: execution
                .result
                .as_ref()
                .map(|r| r.artifacts.clone())
                .unwrap_or_default(),
            hint: execution.hint.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        }
    }
}

/// Overall outcome of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_id: String,
    pub success: bool,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub per_task_results: Vec<TaskResult>,
    pub duration_seconds: f64,
}

impl PlanResult {
    pub fn task(&self, step_id: &str) -> Option<&TaskResult> {
        self.per_task_results.iter().find(|r| r.step_id == step_id)
    }
}

impl std::fmt::Display for PlanResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Plan {}: {}",
            self.plan_id,
            if self.success { "success" } else { "failed" }
        )?;
        writeln!(
            f,
            "  Tasks: {} total, {} completed, {} failed, {} cancelled",
            self.total_tasks, self.completed_tasks, self.failed_tasks, self.cancelled_tasks
        )?;
        writeln!(f, "  Duration: {:.2}s", self.duration_seconds)?;
        for task in &self.per_task_results {
            write!(f, "  - {} [{}]", task.step_id, task.status)?;
            if task.retry_count > 0 {
                write!(f, " retries={}", task.retry_count)?;
            }
            if let Some(error) = &task.error {
                write!(f, ": {}", error)?;
            }
            writeln!(f)?;
            if let Some(hint) = &task.hint {
                writeln!(f, "      hint: {}", hint)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("running".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert_eq!("canceled".parse::<TaskStatus>().unwrap(), TaskStatus::Cancelled);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut exec = TaskExecution::new("a");
        exec.transition(TaskStatus::Ready).unwrap();
        exec.transition(TaskStatus::Assigned).unwrap();
        exec.transition(TaskStatus::Running).unwrap();
        assert!(exec.started_at.is_some());
        exec.transition(TaskStatus::Completed).unwrap();
        assert!(exec.completed_at.is_some());
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut exec = TaskExecution::new("a");
        exec.transition(TaskStatus::Ready).unwrap();
        exec.transition(TaskStatus::Assigned).unwrap();
        exec.transition(TaskStatus::Running).unwrap();
        exec.transition(TaskStatus::Completed).unwrap();

        let err = exec.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, WeftError::InvalidTransition { .. }));
        assert_eq!(exec.status, TaskStatus::Completed);
    }

    #[test]
    fn test_retry_reenters_ready_and_counts() {
        let mut exec = TaskExecution::new("a");
        exec.transition(TaskStatus::Ready).unwrap();
        exec.transition(TaskStatus::Assigned).unwrap();
        exec.transition(TaskStatus::Running).unwrap();
        exec.fail("connection reset").unwrap();
        let first_start = exec.started_at;

        exec.transition(TaskStatus::Ready).unwrap();
        assert_eq!(exec.retry_count, 1);
        assert!(exec.completed_at.is_none());
        assert_eq!(exec.error.as_deref(), Some("connection reset"));

        exec.transition(TaskStatus::Assigned).unwrap();
        exec.transition(TaskStatus::Running).unwrap();
        assert_eq!(exec.started_at, first_start);
    }

    #[test]
    fn test_pending_cannot_skip_to_running() {
        let mut exec = TaskExecution::new("a");
        assert!(exec.transition(TaskStatus::Running).is_err());
        assert!(exec.transition(TaskStatus::Completed).is_err());
        exec.cancel("dependency b failed").unwrap();
        assert_eq!(exec.status, TaskStatus::Cancelled);
        assert!(exec.cancel("again").is_err());
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new("c", "combine", "cpu")
            .with_dependencies(["a", "b"])
            .with_dependency("a")
            .with_input("command", serde_json::json!("echo"))
            .with_priority(Priority::High);

        assert_eq!(step.dependencies.len(), 2);
        assert_eq!(step.priority, Priority::High);
        assert_eq!(step.inputs["command"], "echo");
    }

    #[test]
    fn test_plan_deserializes_with_defaults() {
        let plan: Plan = serde_json::from_str(
            r#"{"steps": [{"id": "a", "resource_category": "io"},
                          {"id": "b", "resource_category": "io", "dependencies": ["a"]}]}"#,
        )
        .unwrap();

        assert!(plan.id.starts_with("plan-"));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.step("b").unwrap().priority, Priority::Medium);
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = TaskOutcome::TransientFailure {
            message: "timeout".into(),
            duration_seconds: 1.5,
        };
        assert!(!outcome.is_ok());
        assert_eq!(outcome.error_message(), Some("timeout"));
        assert_eq!(outcome.duration_seconds(), 1.5);
        assert!(!outcome.is_permanent());

        let odd = TaskOutcome::UnclassifiedFailure {
            message: "widget exploded".into(),
            duration_seconds: 0.2,
        };
        assert_eq!(odd.error_message(), Some("widget exploded"));
        assert!(!odd.is_permanent());
    }
}
