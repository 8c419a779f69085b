//! Result aggregation

use weft_core::{PlanResult, TaskExecution, TaskResult, TaskStatus};

/// Folds per-task states into one [`PlanResult`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator {
    allow_partial_success: bool,
}

impl ResultAggregator {
    pub fn new(allow_partial_success: bool) -> Self {
        Self {
            allow_partial_success,
        }
    }

    /// Success means no task failed, unless partial success is allowed.
    /// Duration spans the earliest start to the latest completion.
    pub fn aggregate(&self, plan_id: &str, tasks: &[TaskExecution]) -> PlanResult {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let failed_tasks = count(TaskStatus::Failed);

        let first_start = tasks.iter().filter_map(|t| t.started_at).min();
        let last_end = tasks.iter().filter_map(|t| t.completed_at).max();
        let duration_seconds = match (first_start, last_end) {
            (Some(start), Some(end)) if end > start => {
                (end - start).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        };

        PlanResult {
            plan_id: plan_id.to_string(),
            success: failed_tasks == 0 || self.allow_partial_success,
            total_tasks: tasks.len(),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks,
            cancelled_tasks: count(TaskStatus::Cancelled),
            per_task_results: tasks.iter().map(TaskResult::from).collect(),
            duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn finished(id: &str, status: TaskStatus, start_offset: i64, end_offset: i64) -> TaskExecution {
        let now = Utc::now();
        let mut exec = TaskExecution::new(id);
        exec.status = status;
        exec.started_at = Some(now + Duration::seconds(start_offset));
        exec.completed_at = Some(now + Duration::seconds(end_offset));
        exec
    }

    #[test]
    fn test_counts_and_verbatim_errors() {
        let mut failed = finished("b", TaskStatus::Failed, 0, 2);
        failed.error = Some("exit status 3: \"disk full\"".to_string());
        let mut cancelled = TaskExecution::new("c");
        cancelled.cancel("dependency b failed").unwrap();

        let result = ResultAggregator::default().aggregate(
            "p",
            &[finished("a", TaskStatus::Completed, 0, 1), failed, cancelled],
        );

        assert!(!result.success);
        assert_eq!(
            (result.completed_tasks, result.failed_tasks, result.cancelled_tasks),
            (1, 1, 1)
        );
        assert_eq!(
            result.task("b").unwrap().error.as_deref(),
            Some("exit status 3: \"disk full\"")
        );
    }

    #[test]
    fn test_partial_success_policy() {
        let tasks = [
            finished("a", TaskStatus::Completed, 0, 1),
            finished("b", TaskStatus::Failed, 0, 1),
        ];
        assert!(!ResultAggregator::new(false).aggregate("p", &tasks).success);
        assert!(ResultAggregator::new(true).aggregate("p", &tasks).success);
    }

    #[test]
    fn test_duration_spans_first_start_to_last_end() {
        let tasks = [
            finished("a", TaskStatus::Completed, 0, 3),
            finished("b", TaskStatus::Completed, 1, 5),
        ];
        let result = ResultAggregator::default().aggregate("p", &tasks);
        assert!((result.duration_seconds - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_plan_succeeds_with_zero_duration() {
        let result = ResultAggregator::default().aggregate("p", &[]);
        assert!(result.success);
        assert_eq!(result.total_tasks, 0);
        assert_eq!(result.duration_seconds, 0.0);
    }
}
