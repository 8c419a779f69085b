//! Resource handlers
//!
//! A handler knows how to run steps of one resource category. The registry
//! maps category names to handler factories and is itself a
//! [`TaskExecutor`], so the scheduler never needs to know which handler
//! ran a step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use weft_core::{ExecutionReport, ResourcesConfig, Result, Step, WeftError};

use crate::executor::TaskExecutor;

/// Output kept from a command before truncating
const MAX_OUTPUT: usize = 4000;

/// Runs steps of a single resource category
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one step; failures are reported, never raised
    async fn handle(&self, step: &Step) -> ExecutionReport;
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ResourceHandler> + Send + Sync>;

/// Explicit category -> handler factory table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in handler named in each category's `handler` field
    ///
    /// Commands run in `working_dir` unless a step sets its own `cwd`.
    pub fn from_config(config: &ResourcesConfig, working_dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for category in &config.categories {
            registry.register_builtin(&category.name, &category.handler, working_dir)?;
        }
        Ok(registry)
    }

    pub fn register<F>(&mut self, category: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ResourceHandler> + Send + Sync + 'static,
    {
        let category = category.into();
        debug!("Registered handler for category {}", category);
        self.factories.insert(category, Arc::new(factory));
    }

    /// Register `noop` or `command` for `category`
    pub fn register_builtin(
        &mut self,
        category: &str,
        kind: &str,
        working_dir: &Path,
    ) -> Result<()> {
        match kind {
            "noop" => self.register(category, || Box::new(NoopHandler)),
            "command" => {
                let handler = CommandHandler::new(working_dir);
                self.register(category, move || Box::new(handler.clone()))
            }
            other => {
                return Err(WeftError::Config(format!(
                    "unknown handler {:?} for category {}",
                    other, category
                )))
            }
        }
        Ok(())
    }

    pub fn contains(&self, category: &str) -> bool {
        self.factories.contains_key(category)
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl TaskExecutor for HandlerRegistry {
    async fn execute(&self, step: &Step) -> ExecutionReport {
        match self.factories.get(&step.resource_category) {
            Some(factory) => {
                let handler = factory();
                debug!("Step {} -> handler {}", step.id, handler.name());
                handler.handle(step).await
            }
            None => ExecutionReport::failure(
                format!(
                    "no handler registered for category {}",
                    step.resource_category
                ),
                0.0,
            ),
        }
    }
}

/// Succeeds immediately without doing anything
pub struct NoopHandler;

#[async_trait]
impl ResourceHandler for NoopHandler {
    fn name(&self) -> &str {
        "noop"
    }

    async fn handle(&self, step: &Step) -> ExecutionReport {
        debug!("noop: {}", step.id);
        ExecutionReport::success(Vec::new(), 0.0)
    }
}

/// Runs `inputs.command` with `inputs.args`
///
/// Optional inputs: `cwd` (working directory) and `timeout_secs`. Exit
/// status zero is success; stdout is returned as the single artifact.
#[derive(Debug, Clone, Default)]
pub struct CommandHandler {
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(working_dir.into()),
        }
    }
}

/// Failure report carrying the step id
fn failed(step: &Step, message: impl Into<String>, elapsed: f64) -> ExecutionReport {
    let error = WeftError::TaskExecution {
        step: step.id.clone(),
        message: message.into(),
    };
    ExecutionReport::failure(error.to_string(), elapsed)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &s[..end])
}

#[async_trait]
impl ResourceHandler for CommandHandler {
    fn name(&self) -> &str {
        "command"
    }

    async fn handle(&self, step: &Step) -> ExecutionReport {
        let started = Instant::now();

        let Some(program) = step.inputs.get("command").and_then(|v| v.as_str()) else {
            return failed(step, "missing 'command' input", 0.0);
        };
        let args: Vec<String> = match step.inputs.get("args") {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(_) => return failed(step, "invalid 'args' input, expected a list", 0.0),
        };

        let mut command = Command::new(program);
        command.args(&args).kill_on_drop(true);
        let cwd = step
            .inputs
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        info!("Running step {}: {} {}", step.id, program, args.join(" "));
        let output = match step.inputs.get("timeout_secs").and_then(|v| v.as_f64()) {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs_f64(secs.max(0.0)), command.output())
                    .await
                {
                    Ok(output) => output,
                    Err(_) => {
                        return failed(
                            step,
                            format!("{} timed out after {}s", program, secs),
                            started.elapsed().as_secs_f64(),
                        )
                    }
                }
            }
            None => command.output().await,
        };
        let elapsed = started.elapsed().as_secs_f64();

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if output.status.success() {
                    let artifacts = match stdout.trim() {
                        "" => Vec::new(),
                        text => vec![truncate(text, MAX_OUTPUT)],
                    };
                    ExecutionReport::success(artifacts, elapsed)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let code = output
                        .status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    failed(
                        step,
                        format!(
                            "{} {} exited with {}:\n\nSTDOUT:\n{}\n\nSTDERR:\n{}",
                            program,
                            args.join(" "),
                            code,
                            truncate(stdout.trim(), MAX_OUTPUT),
                            truncate(stderr.trim(), MAX_OUTPUT)
                        ),
                        elapsed,
                    )
                }
            }
            Err(e) => failed(step, format!("Failed to run {}: {}", program, e), elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::WeftConfig;

    fn command_step(command: &str, args: serde_json::Value) -> Step {
        Step::new("cmd", "", "shell")
            .with_input("command", json!(command))
            .with_input("args", args)
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_category() {
        let mut registry = HandlerRegistry::new();
        registry.register("cpu", || Box::new(NoopHandler));

        let report = registry.execute(&Step::new("a", "", "cpu")).await;
        assert!(report.success);

        let report = registry.execute(&Step::new("b", "", "gpu")).await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("no handler registered"));
    }

    #[test]
    fn test_from_config() {
        let mut config = WeftConfig::default().with_category("shell", 1).resources;
        config.categories[1].handler = "command".to_string();
        let registry = HandlerRegistry::from_config(&config, Path::new(".")).unwrap();
        assert_eq!(registry.categories(), vec!["default", "shell"]);

        config.categories[1].handler = "teleport".to_string();
        assert!(matches!(
            HandlerRegistry::from_config(&config, Path::new(".")),
            Err(WeftError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_success_captures_stdout() {
        let report = CommandHandler::default()
            .handle(&command_step("echo", json!(["hello", "weft"])))
            .await;
        assert!(report.success);
        assert_eq!(report.artifacts, vec!["hello weft"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_reports_exit_code() {
        let report = CommandHandler::default()
            .handle(&command_step("sh", json!(["-c", "echo oops >&2; exit 3"])))
            .await;
        assert!(!report.success);
        let error = report.error.unwrap();
        assert!(error.starts_with("Task cmd failed: sh -c"));
        assert!(error.contains("exited with 3"));
        assert!(error.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registered_command_runs_in_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found me").unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register_builtin("shell", "command", dir.path())
            .unwrap();
        let report = registry
            .execute(&command_step("cat", json!(["marker.txt"])))
            .await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.artifacts, vec!["found me"]);
    }

    #[tokio::test]
    async fn test_missing_command_input() {
        let report = CommandHandler::default()
            .handle(&Step::new("x", "", "shell"))
            .await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("missing 'command' input"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let step = command_step("sleep", json!(["5"])).with_input("timeout_secs", json!(0.1));
        let report = CommandHandler::default().handle(&step).await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééé";
        let t = truncate(s, 3);
        assert!(t.starts_with('é'));
        assert!(t.ends_with("[truncated]"));
    }
}
