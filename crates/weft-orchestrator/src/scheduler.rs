//! Task scheduler
//!
//! Walks a compiled plan batch by batch. A batch is every pending task
//! whose dependencies are settled; it is dispatched in (priority, insertion
//! order), runs concurrently under the per-category dispatcher limits and
//! the global worker pool, and must settle completely before the next
//! batch is built.
//!
//! Task failures never escape as errors: they are routed through error
//! recovery, retried or recorded, and the plan result reports them. Only a
//! plan that fails to compile makes [`Scheduler::submit_plan`] return `Err`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use weft_core::fail_open::{fail_open, fail_open_with_retries};
use weft_core::{
    DependencyFailurePolicy, MemoryRecord, Plan, PlanResult, Result, Step, TaskExecution,
    TaskOutcome, TaskStatus, WeftConfig, WeftError,
};
use weft_memory::MemoryStore;
use weft_planning::PlanGraph;

use crate::aggregator::ResultAggregator;
use crate::dispatcher::{ResourceDispatcher, SlotRequest};
use crate::executor::{ExecutorAdapter, TaskExecutor};
use crate::recovery::{ErrorClassifier, ErrorRecovery, RetryStrategy};
use crate::task_list::TaskList;

const PLAN_CATEGORY: &str = "plan";
const SNAPSHOT_ATTEMPTS: usize = 3;
const DISPATCHER_CATEGORY: &str = "dispatcher";
pub const DISPATCHER_STATS_TAG: &str = "dispatcher-stats";

/// Everything a spawned task needs, shared across one run
struct RunContext {
    dispatcher: ResourceDispatcher,
    adapter: ExecutorAdapter,
    recovery: ErrorRecovery,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    assignment_timeout: Duration,
    cancel_grace: Duration,
    fail_fast: bool,
}

/// Runs plans against a [`TaskExecutor`]
pub struct Scheduler {
    config: WeftConfig,
    dispatcher: ResourceDispatcher,
    executor: Arc<dyn TaskExecutor>,
    classifier: ErrorClassifier,
    memory: Option<MemoryStore>,
    task_list_path: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(config: WeftConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            dispatcher: ResourceDispatcher::from_config(&config.resources),
            task_list_path: config.scheduler.task_list_path.clone(),
            classifier: ErrorClassifier::from_config(&config.retry).unwrap_or_else(|e| {
                warn!("Ignoring [[retry.rules]]: {}", e);
                ErrorClassifier::new()
            }),
            memory: None,
            executor,
            config,
        }
    }

    /// Record plan events, recovery decisions and dispatcher statistics
    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Share a dispatcher, e.g. one with categories registered at runtime
    pub fn with_dispatcher(mut self, dispatcher: ResourceDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Replace the classifier built from `[[retry.rules]]`
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Snapshot task state to `path` after every batch
    pub fn with_task_list(mut self, path: impl Into<PathBuf>) -> Self {
        self.task_list_path = Some(path.into());
        self
    }

    pub fn dispatcher(&self) -> &ResourceDispatcher {
        &self.dispatcher
    }

    pub fn memory(&self) -> Option<&MemoryStore> {
        self.memory.as_ref()
    }

    pub fn config(&self) -> &WeftConfig {
        &self.config
    }

    /// Run a plan to completion
    ///
    /// Fails only when the plan itself is invalid; no task runs in that case.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id, steps = plan.len()))]
    pub async fn submit_plan(&self, plan: &Plan) -> Result<PlanResult> {
        let graph = PlanGraph::compile(plan).map_err(|e| {
            error!("Rejected plan {}: {}", plan.id, e);
            e
        })?;
        let tasks = graph
            .steps()
            .iter()
            .map(|step| TaskExecution::new(step.id.clone()))
            .collect();
        let path = self.task_list_path.clone();
        self.run(&graph, &plan.name, tasks, Utc::now(), path.as_deref())
            .await
    }

    /// Continue a run from a task-list file, writing progress back to it
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn resume_plan(&self, path: &Path) -> Result<PlanResult> {
        let list = TaskList::load(path).await?;
        let created_at = list.metadata.created_at;
        match list.first_pending() {
            Some(entry) => info!("Resuming plan {} at task {}", list.plan_id, entry.id),
            None => info!("Plan {} has no remaining tasks", list.plan_id),
        }

        let (plan, tasks) = list.into_plan()?;
        let graph = PlanGraph::compile(&plan)?;
        self.run(&graph, &plan.name, tasks, created_at, Some(path))
            .await
    }

    async fn run(
        &self,
        graph: &PlanGraph,
        plan_name: &str,
        mut tasks: Vec<TaskExecution>,
        created_at: DateTime<Utc>,
        task_list: Option<&Path>,
    ) -> Result<PlanResult> {
        if tasks.len() != graph.len() {
            return Err(WeftError::TaskList(format!(
                "{} task states for {} steps",
                tasks.len(),
                graph.len()
            )));
        }

        let started = Instant::now();
        let scheduler = &self.config.scheduler;
        info!(
            "Starting plan {} ({} steps, fail_fast={})",
            graph.plan_id(),
            graph.len(),
            scheduler.fail_fast
        );
        self.record_plan_event(graph, "started", json!({ "name": plan_name }))
            .await;

        let mut recovery = ErrorRecovery::new(
            self.classifier.clone(),
            RetryStrategy::new(self.config.retry.clone()),
        );
        if let Some(memory) = &self.memory {
            recovery = recovery.with_memory(memory.clone());
        }

        let ctx = Arc::new(RunContext {
            dispatcher: self.dispatcher.clone(),
            adapter: ExecutorAdapter::new(self.executor.clone(), self.classifier.clone()),
            recovery,
            workers: Arc::new(Semaphore::new(scheduler.max_workers.max(1))),
            cancel: CancellationToken::new(),
            assignment_timeout: Duration::from_secs(scheduler.assignment_timeout_secs),
            cancel_grace: Duration::from_secs(scheduler.cancel_grace_secs),
            fail_fast: scheduler.fail_fast,
        });

        let mut batch_number = 0;
        loop {
            if scheduler.on_dependency_failure == DependencyFailurePolicy::Cancel {
                cancel_blocked(graph, &mut tasks);
            }
            let batch = ready_batch(graph, &tasks, scheduler.on_dependency_failure);
            if batch.is_empty() {
                break;
            }

            batch_number += 1;
            debug!(
                "Batch {}: {:?}",
                batch_number,
                batch
                    .iter()
                    .map(|&pos| graph.steps()[pos].id.as_str())
                    .collect::<Vec<_>>()
            );
            let batch_failed = run_batch(&ctx, graph, &mut tasks, batch).await;

            if let Some(path) = task_list {
                self.snapshot(graph, plan_name, &tasks, created_at, path).await;
            }

            if batch_failed && ctx.fail_fast {
                warn!(
                    "Batch {} had a failure, stopping plan {} (fail-fast)",
                    batch_number,
                    graph.plan_id()
                );
                break;
            }
        }

        let reason = if ctx.cancel.is_cancelled() {
            "cancelled by fail-fast"
        } else {
            "never became ready"
        };
        for exec in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            if let Err(e) = exec.cancel(reason) {
                warn!("{}", e);
            }
        }

        let result = ResultAggregator::new(scheduler.allow_partial_success)
            .aggregate(graph.plan_id(), &tasks);
        info!(
            "Plan {} finished in {:.2}s: {} completed, {} failed, {} cancelled",
            result.plan_id,
            started.elapsed().as_secs_f64(),
            result.completed_tasks,
            result.failed_tasks,
            result.cancelled_tasks
        );

        if let Some(path) = task_list {
            self.snapshot(graph, plan_name, &tasks, created_at, path).await;
        }
        self.record_plan_event(
            graph,
            "finished",
            json!({
                "success": result.success,
                "completed": result.completed_tasks,
                "failed": result.failed_tasks,
                "cancelled": result.cancelled_tasks,
                "duration_seconds": result.duration_seconds,
            }),
        )
        .await;
        self.record_dispatcher_stats(graph).await;

        Ok(result)
    }

    async fn snapshot(
        &self,
        graph: &PlanGraph,
        plan_name: &str,
        tasks: &[TaskExecution],
        created_at: DateTime<Utc>,
        path: &Path,
    ) {
        let list = TaskList::from_run(graph, plan_name, tasks, created_at);
        fail_open_with_retries(
            "task_list::snapshot",
            || list.save(path),
            SNAPSHOT_ATTEMPTS,
            Duration::from_millis(50),
        )
        .await;
    }

    async fn record_plan_event(&self, graph: &PlanGraph, event: &str, details: serde_json::Value) {
        let Some(memory) = &self.memory else {
            return;
        };
        let record = MemoryRecord::episodic(
            PLAN_CATEGORY,
            json!({ "plan_id": graph.plan_id(), "event": event, "details": details }),
        )
        .with_tags([format!("plan:{}", graph.plan_id()), event.to_string()]);
        fail_open("scheduler::record_plan_event", memory.save(record)).await;
    }

    async fn record_dispatcher_stats(&self, graph: &PlanGraph) {
        let Some(memory) = &self.memory else {
            return;
        };
        let record = MemoryRecord::semantic(
            DISPATCHER_CATEGORY,
            json!({ "plan_id": graph.plan_id(), "categories": self.dispatcher.snapshot() }),
        )
        .with_tags([
            DISPATCHER_STATS_TAG.to_string(),
            format!("plan:{}", graph.plan_id()),
        ]);
        fail_open("scheduler::record_dispatcher_stats", memory.save(record)).await;
    }
}

/// Cancel pending tasks with a failed or cancelled dependency
///
/// Walks in topological order so cancellation reaches every descendant in
/// one pass.
fn cancel_blocked(graph: &PlanGraph, tasks: &mut [TaskExecution]) {
    for step in graph.topological_order() {
        let Some(pos) = graph.position(&step.id) else {
            continue;
        };
        if tasks[pos].status != TaskStatus::Pending {
            continue;
        }

        let blocker = step.dependencies.iter().find_map(|dep| {
            let status = tasks[graph.position(dep)?].status;
            matches!(status, TaskStatus::Failed | TaskStatus::Cancelled).then_some((dep, status))
        });
        if let Some((dep, status)) = blocker {
            let reason = match status {
                TaskStatus::Failed => format!("dependency {} failed", dep),
                _ => format!("dependency {} was cancelled", dep),
            };
            debug!("Cancelling {}: {}", step.id, reason);
            if let Err(e) = tasks[pos].cancel(reason) {
                warn!("{}", e);
            }
        }
    }
}

/// Pending tasks whose dependencies are settled, in dispatch order
fn ready_batch(
    graph: &PlanGraph,
    tasks: &[TaskExecution],
    policy: DependencyFailurePolicy,
) -> Vec<usize> {
    let mut batch: Vec<usize> = graph
        .steps()
        .iter()
        .enumerate()
        .filter(|(pos, _)| tasks[*pos].status == TaskStatus::Pending)
        .filter(|(_, step)| {
            step.dependencies.iter().all(|dep| {
                let status = graph.position(dep).map(|d| tasks[d].status);
                match policy {
                    DependencyFailurePolicy::Cancel => status == Some(TaskStatus::Completed),
                    DependencyFailurePolicy::Continue => status.is_some_and(|s| s.is_terminal()),
                }
            })
        })
        .map(|(pos, _)| pos)
        .collect();

    batch.sort_by_key(|&pos| (graph.steps()[pos].priority, pos));
    batch
}

/// Run one batch to completion; returns whether any task failed
async fn run_batch(
    ctx: &Arc<RunContext>,
    graph: &PlanGraph,
    tasks: &mut [TaskExecution],
    batch: Vec<usize>,
) -> bool {
    let mut set = JoinSet::new();
    let mut outstanding: HashSet<usize> = HashSet::with_capacity(batch.len());

    for &pos in &batch {
        let step = graph.steps()[pos].clone();
        if let Err(e) = tasks[pos].transition(TaskStatus::Ready) {
            warn!("{}", e);
            continue;
        }

        // Slots are requested here, in dispatch order, so queue order
        // inside a saturated category follows (priority, insertion order)
        let request = ctx.dispatcher.request(&step.id, &step.resource_category);
        let exec = tasks[pos].clone();
        let ctx = ctx.clone();
        outstanding.insert(pos);
        set.spawn(async move { (pos, run_task(ctx, step, exec, request).await) });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((pos, exec)) => {
                outstanding.remove(&pos);
                tasks[pos] = exec;
            }
            Err(e) => error!("Task panicked or was aborted: {}", e),
        }
    }

    for pos in outstanding {
        let exec = &mut tasks[pos];
        if let Err(e) = exec.fail("task runner panicked") {
            warn!("{}", e);
        }
    }

    batch
        .iter()
        .any(|&pos| tasks[pos].status == TaskStatus::Failed)
}

fn advance(exec: &mut TaskExecution, next: TaskStatus) {
    if let Err(e) = exec.transition(next) {
        warn!("{}", e);
    }
}

fn cancel_task(exec: &mut TaskExecution, reason: &str) {
    debug!("Cancelling {}: {}", exec.step_id, reason);
    if let Err(e) = exec.cancel(reason) {
        warn!("{}", e);
    }
}

/// Drive one task from Ready to a terminal status, retrying as recovery decides
async fn run_task(
    ctx: Arc<RunContext>,
    step: Step,
    mut exec: TaskExecution,
    request: SlotRequest,
) -> TaskExecution {
    let mut first_request = Some(request);
    let mut last_signature: Option<String> = None;

    loop {
        let request = first_request
            .take()
            .unwrap_or_else(|| ctx.dispatcher.request(&step.id, &step.resource_category));

        let outcome = if request.is_unknown() {
            TaskOutcome::PermanentFailure {
                message: format!(
                    "Unknown resource category {} for step {}",
                    step.resource_category, step.id
                ),
                duration_seconds: 0.0,
            }
        } else {
            let granted = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    cancel_task(&mut exec, "cancelled while waiting for a slot");
                    return exec;
                }
                granted = request.wait(ctx.assignment_timeout) => granted,
            };

            match granted {
                Some(assignment) => match execute(&ctx, &step, &mut exec, assignment).await {
                    Some(outcome) => outcome,
                    None => return exec,
                },
                None => TaskOutcome::TransientFailure {
                    message: WeftError::AssignmentTimeout {
                        step: step.id.clone(),
                        category: step.resource_category.clone(),
                    }
                    .to_string(),
                    duration_seconds: ctx.assignment_timeout.as_secs_f64(),
                },
            }
        };

        if let TaskOutcome::Ok(report) = outcome {
            exec.result = Some(report);
            exec.error = None;
            advance(&mut exec, TaskStatus::Completed);
            if exec.retry_count > 0 {
                if let Some(signature) = &last_signature {
                    ctx.recovery
                        .record_recovered_by_retry(&step, signature, exec.retry_count + 1)
                        .await;
                }
            }
            debug!("Step {} completed", step.id);
            return exec;
        }

        let message = outcome.error_message().unwrap_or("unknown failure").to_string();
        if let Err(e) = exec.fail(message) {
            warn!("{}", e);
        }

        let decision = ctx
            .recovery
            .handle_failure(&step, &outcome, exec.retry_count + 1)
            .await;
        if decision.hint.is_some() {
            exec.hint = decision.hint.clone();
        }
        last_signature = Some(decision.signature.clone());

        if !decision.retry.retry {
            if ctx.fail_fast && !ctx.cancel.is_cancelled() {
                warn!("Step {} failed, cancelling the rest of the batch", step.id);
                ctx.cancel.cancel();
            }
            return exec;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return exec,
            _ = tokio::time::sleep(decision.retry.delay()) => {}
        }
        advance(&mut exec, TaskStatus::Ready);
    }
}

/// Run a step that holds a slot
///
/// Returns `None` when the task was cancelled instead of producing an
/// outcome. The slot is always given back before returning.
async fn execute(
    ctx: &RunContext,
    step: &Step,
    exec: &mut TaskExecution,
    assignment: weft_core::Assignment,
) -> Option<TaskOutcome> {
    exec.assignment = Some(assignment.clone());
    advance(exec, TaskStatus::Assigned);

    let permit = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        permit = ctx.workers.clone().acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        ctx.dispatcher.abandon(&assignment);
        cancel_task(exec, "cancelled before execution started");
        return None;
    };

    advance(exec, TaskStatus::Running);
    let started = Instant::now();
    let grace = async {
        ctx.cancel.cancelled().await;
        tokio::time::sleep(ctx.cancel_grace).await;
    };

    tokio::select! {
        outcome = ctx.adapter.run(step) => {
            ctx.dispatcher
                .release(&assignment, outcome.is_ok(), started.elapsed().as_secs_f64());
            Some(outcome)
        }
        _ = grace => {
            ctx.dispatcher
                .release(&assignment, false, started.elapsed().as_secs_f64());
            cancel_task(exec, "cancelled after the grace period expired");
            None
        }
    }
}
