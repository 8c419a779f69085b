//! Task executor seam and the adapter that tags its results

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

use weft_core::{ExecutionReport, Step, TaskOutcome};

use crate::recovery::{ErrorCategory, ErrorClassifier};

/// Whatever actually performs a step
///
/// Implementations must be safe to call again for the same step after a
/// timeout or failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, step: &Step) -> ExecutionReport;
}

/// Runs the executor and turns its report into a [`TaskOutcome`]
///
/// A panicking executor becomes a permanent failure instead of taking the
/// scheduler down with it.
#[derive(Clone)]
pub struct ExecutorAdapter {
    executor: Arc<dyn TaskExecutor>,
    classifier: ErrorClassifier,
}

impl ExecutorAdapter {
    pub fn new(executor: Arc<dyn TaskExecutor>, classifier: ErrorClassifier) -> Self {
        Self {
            executor,
            classifier,
        }
    }

    pub async fn run(&self, step: &Step) -> TaskOutcome {
        let started = Instant::now();
        let result = AssertUnwindSafe(self.executor.execute(step))
            .catch_unwind()
            .await;

        match result {
            Ok(report) => self.adapt(report),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!("Executor panicked on step {}: {}", step.id, detail);
                TaskOutcome::PermanentFailure {
                    message: format!("executor crashed: {}", detail),
                    duration_seconds: started.elapsed().as_secs_f64(),
                }
            }
        }
    }

    /// Tag a raw report
    pub fn adapt(&self, report: ExecutionReport) -> TaskOutcome {
        if report.success {
            return TaskOutcome::Ok(report);
        }

        let message = report
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "executor reported failure without an error".to_string());
        let duration_seconds = report.duration_seconds;

        match self.classifier.classify(&message) {
            ErrorCategory::Transient | ErrorCategory::ResourceExhaustion => {
                debug!("Tagged failure as transient: {}", message);
                TaskOutcome::TransientFailure {
                    message,
                    duration_seconds,
                }
            }
            ErrorCategory::ValidationError | ErrorCategory::PermissionError => {
                TaskOutcome::PermanentFailure {
                    message,
                    duration_seconds,
                }
            }
            ErrorCategory::Unknown => TaskOutcome::UnclassifiedFailure {
                message,
                duration_seconds,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicky;

    #[async_trait]
    impl TaskExecutor for Panicky {
        async fn execute(&self, _step: &Step) -> ExecutionReport {
            panic!("boom");
        }
    }

    fn adapter(executor: impl TaskExecutor + 'static) -> ExecutorAdapter {
        ExecutorAdapter::new(Arc::new(executor), ErrorClassifier::new())
    }

    #[test]
    fn test_adapt_tags_reports() {
        let adapter = adapter(Panicky);

        let ok = adapter.adapt(ExecutionReport::success(vec!["out.txt".into()], 1.0));
        assert!(ok.is_ok());

        let transient = adapter.adapt(ExecutionReport::failure("connection reset", 0.5));
        assert!(matches!(transient, TaskOutcome::TransientFailure { .. }));

        let permanent = adapter.adapt(ExecutionReport::failure("invalid config", 0.5));
        assert!(matches!(permanent, TaskOutcome::PermanentFailure { .. }));
        assert_eq!(permanent.duration_seconds(), 0.5);

        let odd = adapter.adapt(ExecutionReport::failure("widget exploded", 0.5));
        assert!(matches!(odd, TaskOutcome::UnclassifiedFailure { .. }));
    }

    #[test]
    fn test_missing_error_text_gets_a_message() {
        let adapter = adapter(Panicky);
        let outcome = adapter.adapt(ExecutionReport {
            success: false,
            ..ExecutionReport::default()
        });
        assert!(outcome.error_message().unwrap().contains("without an error"));
    }

    #[tokio::test]
    async fn test_panic_becomes_permanent_failure() {
        let adapter = adapter(Panicky);
        let outcome = adapter.run(&Step::new("a", "", "cpu")).await;
        match outcome {
            TaskOutcome::PermanentFailure { message, .. } => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
