//! Resource dispatcher
//!
//! Bounds how many steps of each resource category hold a slot at once.
//! Callers that find a category saturated queue up FIFO and are handed a
//! slot directly by whoever releases one, so a newcomer can never barge
//! past a waiter.
//!
//! One `std::sync::Mutex` guards counters and wait queues. It is never held
//! across an `.await`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use weft_core::{Assignment, ResourcesConfig};

/// Point-in-time statistics for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: String,
    pub load: usize,
    pub max: usize,
    pub peak_load: usize,
    pub waiting: usize,
    pub utilization: f64,
    pub total_executions: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_seconds: f64,
}

struct Waiter {
    step_id: String,
    tx: oneshot::Sender<Assignment>,
}

struct CategoryState {
    /// Ceiling in force; never below `load`
    max: usize,
    /// Ceiling asked for; `max` steps down to it as slots drain
    target_max: usize,
    load: usize,
    peak_load: usize,
    total_executions: u64,
    success_count: u64,
    failure_count: u64,
    avg_duration_seconds: f64,
    waiters: VecDeque<Waiter>,
}

impl CategoryState {
    fn new(max: usize) -> Self {
        Self {
            max,
            target_max: max,
            load: 0,
            peak_load: 0,
            total_executions: 0,
            success_count: 0,
            failure_count: 0,
            avg_duration_seconds: 0.0,
            waiters: VecDeque::new(),
        }
    }

    fn stats(&self, category: &str) -> CategoryStats {
        CategoryStats {
            category: category.to_string(),
            load: self.load,
            max: self.max,
            peak_load: self.peak_load,
            waiting: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            utilization: if self.max == 0 {
                0.0
            } else {
                self.load as f64 / self.max as f64
            },
            total_executions: self.total_executions,
            success_count: self.success_count,
            failure_count: self.failure_count,
            avg_duration_seconds: self.avg_duration_seconds,
        }
    }

    fn take_slot(&mut self) {
        self.load += 1;
        self.peak_load = self.peak_load.max(self.load);
    }

    fn set_max(&mut self, max: usize) {
        self.target_max = max;
        self.max = max.max(self.load);
    }

    fn return_slot(&mut self) {
        self.load = self.load.saturating_sub(1);
        self.max = self.target_max.max(self.load);
    }
}

#[derive(Default)]
struct DispatcherState {
    categories: HashMap<String, CategoryState>,
    /// Assignments granted and not yet released
    active: HashSet<Uuid>,
}

impl DispatcherState {
    /// Hand free slots to queued waiters, oldest first
    fn fill_free_slots(&mut self, category: &str) {
        let DispatcherState { categories, active } = self;
        let Some(cat) = categories.get_mut(category) else {
            return;
        };

        while cat.load < cat.max {
            let Some(waiter) = cat.waiters.pop_front() else {
                break;
            };
            let grant = Assignment::new(waiter.step_id, category);
            let id = grant.id;
            // A closed receiver means the waiter gave up; try the next one
            if waiter.tx.send(grant).is_ok() {
                cat.take_slot();
                active.insert(id);
            }
        }
    }

    /// Free a slot; false when the assignment was already returned
    fn free_slot(&mut self, assignment: &Assignment) -> bool {
        if !self.active.remove(&assignment.id) {
            return false;
        }
        if let Some(cat) = self.categories.get_mut(&assignment.category) {
            cat.return_slot();
        }
        self.fill_free_slots(&assignment.category);
        true
    }
}

enum RequestState {
    Granted(Assignment),
    Waiting(oneshot::Receiver<Assignment>),
    Unknown,
    Done,
}

/// A place in a category's queue
///
/// Dropping a request that was granted (or is granted while being dropped)
/// returns the slot, so a cancelled waiter never leaks capacity.
pub struct SlotRequest {
    dispatcher: ResourceDispatcher,
    step_id: String,
    category: String,
    state: RequestState,
}

impl SlotRequest {
    /// The category was never registered
    pub fn is_unknown(&self) -> bool {
        matches!(self.state, RequestState::Unknown)
    }

    /// Wait up to `timeout` for a slot
    pub async fn wait(mut self, timeout: Duration) -> Option<Assignment> {
        let outcome = match &mut self.state {
            RequestState::Waiting(rx) => match tokio::time::timeout(timeout, &mut *rx).await {
                Ok(Ok(assignment)) => Some(assignment),
                Ok(Err(_)) => None,
                Err(_) => {
                    // A grant may have landed between the deadline and now
                    rx.close();
                    let late = rx.try_recv().ok();
                    if late.is_none() {
                        debug!(
                            "Step {} timed out after {:?} waiting for a {} slot",
                            self.step_id, timeout, self.category
                        );
                    }
                    late
                }
            },
            _ => None,
        };

        match std::mem::replace(&mut self.state, RequestState::Done) {
            RequestState::Granted(assignment) => Some(assignment),
            _ => outcome,
        }
    }
}

impl Drop for SlotRequest {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, RequestState::Done) {
            RequestState::Waiting(mut rx) => {
                rx.close();
                if let Ok(assignment) = rx.try_recv() {
                    self.dispatcher.abandon(&assignment);
                }
            }
            RequestState::Granted(assignment) => {
                self.dispatcher.abandon(&assignment);
            }
            RequestState::Unknown | RequestState::Done => {}
        }
    }
}

/// Per-category concurrency limiter; clones share state
#[derive(Clone, Default)]
pub struct ResourceDispatcher {
    state: Arc<Mutex<DispatcherState>>,
}

impl ResourceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every category declared under `[resources]`
    pub fn from_config(config: &ResourcesConfig) -> Self {
        let dispatcher = Self::new();
        for category in &config.categories {
            dispatcher.register_category(
                &category.name,
                category.effective_max(config.default_max_concurrency),
            );
        }
        dispatcher
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a category or change its ceiling
    ///
    /// Raising the ceiling immediately admits queued waiters. Lowering it
    /// never revokes a slot: the reported ceiling stays at the current load
    /// and steps down to the new value as slots are released.
    pub fn register_category(&self, category: &str, max_concurrency: usize) {
        let max = max_concurrency.max(1);
        let mut state = self.lock();
        state
            .categories
            .entry(category.to_string())
            .and_modify(|cat| cat.set_max(max))
            .or_insert_with(|| CategoryState::new(max));
        state.fill_free_slots(category);
        debug!("Registered category {} (max {})", category, max);
    }

    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().categories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn current_load(&self, category: &str) -> Option<usize> {
        self.lock().categories.get(category).map(|cat| cat.load)
    }

    /// Take a slot now or join the queue, without waiting
    ///
    /// Requests made in order are served in that order.
    pub fn request(&self, step_id: &str, category: &str) -> SlotRequest {
        let request_state = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.categories.get_mut(category) {
                None => RequestState::Unknown,
                Some(cat) => {
                    cat.waiters.retain(|w| !w.tx.is_closed());
                    if cat.load < cat.max && cat.waiters.is_empty() {
                        cat.take_slot();
                        let assignment = Assignment::new(step_id, category);
                        state.active.insert(assignment.id);
                        RequestState::Granted(assignment)
                    } else {
                        let (tx, rx) = oneshot::channel();
                        cat.waiters.push_back(Waiter {
                            step_id: step_id.to_string(),
                            tx,
                        });
                        RequestState::Waiting(rx)
                    }
                }
            }
        };

        if matches!(request_state, RequestState::Unknown) {
            warn!(
                "Step {} requested unknown resource category {}",
                step_id, category
            );
        }

        SlotRequest {
            dispatcher: self.clone(),
            step_id: step_id.to_string(),
            category: category.to_string(),
            state: request_state,
        }
    }

    /// Wait up to `timeout` for a slot in `category`
    ///
    /// Returns `None` on timeout, and immediately for an unknown category.
    pub async fn assign(
        &self,
        step_id: &str,
        category: &str,
        timeout: Duration,
    ) -> Option<Assignment> {
        self.request(step_id, category).wait(timeout).await
    }

    /// Return a slot after execution, recording the outcome
    ///
    /// A second release of the same assignment is logged and ignored.
    pub fn release(&self, assignment: &Assignment, success: bool, duration_seconds: f64) -> bool {
        let mut state = self.lock();
        if !state.active.contains(&assignment.id) {
            drop(state);
            warn!(
                "Ignoring repeated release of {} slot for step {}",
                assignment.category, assignment.step_id
            );
            return false;
        }

        if let Some(cat) = state.categories.get_mut(&assignment.category) {
            cat.total_executions += 1;
            if success {
                cat.success_count += 1;
            } else {
                cat.failure_count += 1;
            }
            cat.avg_duration_seconds +=
                (duration_seconds - cat.avg_duration_seconds) / cat.total_executions as f64;
        }
        state.free_slot(assignment)
    }

    /// Return a slot that was never used for execution
    pub fn abandon(&self, assignment: &Assignment) -> bool {
        let freed = self.lock().free_slot(assignment);
        if freed {
            debug!(
                "Returned unused {} slot for step {}",
                assignment.category, assignment.step_id
            );
        }
        freed
    }

    pub fn get_statistics(&self, category: &str) -> Option<CategoryStats> {
        self.lock()
            .categories
            .get(category)
            .map(|cat| cat.stats(category))
    }

    /// Statistics for every category, sorted by name
    pub fn snapshot(&self) -> Vec<CategoryStats> {
        let state = self.lock();
        let mut stats: Vec<CategoryStats> = state
            .categories
            .iter()
            .map(|(name, cat)| cat.stats(name))
            .collect();
        stats.sort_by(|a, b| a.category.cmp(&b.category));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(max: usize) -> ResourceDispatcher {
        let dispatcher = ResourceDispatcher::new();
        dispatcher.register_category("cpu", max);
        dispatcher
    }

    #[tokio::test]
    async fn test_grants_up_to_max_then_times_out() {
        let d = dispatcher(2);
        let short = Duration::from_millis(20);

        let a = d.assign("a", "cpu", short).await;
        let b = d.assign("b", "cpu", short).await;
        let c = d.assign("c", "cpu", short).await;

        assert!(a.is_some() && b.is_some());
        assert!(c.is_none());
        assert_eq!(d.current_load("cpu"), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_category_returns_none_immediately() {
        let d = dispatcher(1);
        let request = d.request("a", "gpu");
        assert!(request.is_unknown());
        assert!(request.wait(Duration::from_secs(60)).await.is_none());
    }

    #[tokio::test]
    async fn test_release_hands_slot_to_oldest_waiter() {
        let d = dispatcher(1);
        let held = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();

        let first = d.request("b", "cpu");
        let second = d.request("c", "cpu");
        assert!(d.release(&held, true, 0.5));

        let granted = first.wait(Duration::from_millis(50)).await.unwrap();
        assert_eq!(granted.step_id, "b");
        assert!(second.wait(Duration::from_millis(10)).await.is_none());
        assert_eq!(d.current_load("cpu"), Some(1));
    }

    #[tokio::test]
    async fn test_double_release_never_goes_negative() {
        let d = dispatcher(2);
        let a = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();

        assert!(d.release(&a, true, 1.0));
        assert!(!d.release(&a, true, 1.0));

        let stats = d.get_statistics("cpu").unwrap();
        assert_eq!(stats.load, 0);
        assert_eq!(stats.total_executions, 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let d = dispatcher(2);
        let a = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();
        let b = d.assign("b", "cpu", Duration::from_millis(10)).await.unwrap();

        let stats = d.get_statistics("cpu").unwrap();
        assert_eq!(stats.utilization, 1.0);

        d.release(&a, true, 1.0);
        d.release(&b, false, 3.0);

        let stats = d.get_statistics("cpu").unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.avg_duration_seconds - 2.0).abs() < 1e-9);
        assert_eq!(stats.utilization, 0.0);
        assert_eq!(stats.peak_load, 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let d = dispatcher(1);
        let held = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.assign("b", "cpu", Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        d.release(&held, true, 0.1);
        assert_eq!(d.current_load("cpu"), Some(0));
        assert!(d
            .assign("c", "cpu", Duration::from_millis(10))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_unused_grant_is_returned_on_drop() {
        let d = dispatcher(1);
        let request = d.request("a", "cpu");
        assert_eq!(d.current_load("cpu"), Some(1));
        drop(request);
        assert_eq!(d.current_load("cpu"), Some(0));
    }

    #[tokio::test]
    async fn test_raising_max_admits_waiters() {
        let d = dispatcher(1);
        let _held = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();
        let waiting = d.request("b", "cpu");

        d.register_category("cpu", 2);
        assert!(waiting.wait(Duration::from_millis(10)).await.is_some());
        assert_eq!(d.current_load("cpu"), Some(2));
    }

    #[tokio::test]
    async fn test_lowering_max_drains_without_overshoot() {
        let d = dispatcher(2);
        let a = d.assign("a", "cpu", Duration::from_millis(10)).await.unwrap();
        let b = d.assign("b", "cpu", Duration::from_millis(10)).await.unwrap();

        d.register_category("cpu", 1);
        let stats = d.get_statistics("cpu").unwrap();
        assert_eq!((stats.load, stats.max), (2, 2));
        assert!(stats.utilization <= 1.0);

        let waiting = d.request("c", "cpu");
        d.release(&a, true, 0.1);
        let stats = d.get_statistics("cpu").unwrap();
        assert_eq!((stats.load, stats.max), (1, 1));
        assert!(waiting.wait(Duration::from_millis(10)).await.is_none());

        d.release(&b, true, 0.1);
        assert_eq!(d.get_statistics("cpu").unwrap().max, 1);
        assert!(d
            .assign("d", "cpu", Duration::from_millis(10))
            .await
            .is_some());
        assert_eq!(d.current_load("cpu"), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_never_exceeds_max() {
        let d = dispatcher(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for n in 0..20 {
            let d = d.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let step = format!("s{}", n);
                let assignment = d.assign(&step, "cpu", Duration::from_secs(10)).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                d.release(&assignment, true, 0.005);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = d.get_statistics("cpu").unwrap();
        assert!(stats.peak_load <= 3);
        assert_eq!(stats.total_executions, 20);
        assert_eq!(stats.load, 0);
    }

    #[test]
    fn test_from_config_uses_default_ceiling() {
        let config = weft_core::WeftConfig::default()
            .with_category("gpu", 1)
            .resources;
        let d = ResourceDispatcher::from_config(&config);

        assert_eq!(d.categories(), vec!["default", "gpu"]);
        assert_eq!(d.get_statistics("default").unwrap().max, 2);
        assert_eq!(d.get_statistics("gpu").unwrap().max, 1);
    }
}
