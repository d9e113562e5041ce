//! The federation context: task submission, routing, dispatch and recovery
//!
//! One `Federation` owns the registry, task queue, learning store and metrics.
//! Every mutation of task state or worker counters goes through it. Worker
//! traffic arrives as [`InboundEvent`]s and is applied in order by
//! [`Federation::run`], which also drives the periodic scheduling tick.
//!
//! Lock order is tasks before registry; the learning store and metrics never
//! take either lock.

use super::queue::{QueueCounts, TaskQueue, TaskStatus};
use super::retry::RetryPolicy;
use crate::config::FederationConfig;
use crate::error::{sanitize_error_message, FederationError, FederationResult};
use crate::health::{HealthMonitor, HealthPolicy, HealthSnapshot, HealthTransition};
use crate::learning::{LearningRecord, LearningStore};
use crate::observability::MetricsCollector;
use crate::persistence::{Persistence, WriteBehind};
use crate::protocol::{
    validate_worker_id, AttemptOutcome, ErrorCode, ExecutionResult, TaskAssignment,
    TaskCompletion, TaskFailure, TaskRequest, TaskState, WorkerId, WorkerMessage,
};
use crate::registry::{CapabilityMatch, CapabilityRegistry, RollingStats, Worker, WorkerStatus};
use crate::routing::{RoutingDecision, Scorer};
use crate::transport::{InboundEvent, WorkerLink};
use crate::{task_span, tick_span, worker_span};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Upper bound on a single send to a worker
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// What to do after a failure has been recorded
#[derive(Debug)]
enum NextStep {
    Done,
    Dispatch(RoutingDecision),
}

/// Statistics exposed to dashboards
#[derive(Debug, Clone, Serialize)]
pub struct FederationStats {
    pub federation_id: String,
    pub total_workers: usize,
    pub online_workers: usize,
    pub total_tasks: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub queue: QueueCounts,
    pub learning_buckets: usize,
    pub per_worker: Vec<WorkerStatsView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsView {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub capabilities: Vec<String>,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub load: f64,
    pub samples: u64,
    pub success_rate: Option<f64>,
    pub avg_cost: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
}

impl From<&Worker> for WorkerStatsView {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id.clone(),
            status: worker.status(),
            capabilities: worker.capabilities.iter().cloned().collect(),
            in_flight: worker.in_flight,
            max_concurrency: worker.max_concurrency,
            load: worker.load(),
            samples: worker.stats.samples,
            success_rate: worker.stats.success_rate,
            avg_cost: worker.stats.avg_cost,
            avg_latency_ms: worker.stats.avg_latency_ms,
            consecutive_failures: worker.consecutive_failures,
        }
    }
}

pub struct Federation {
    config: FederationConfig,
    registry: CapabilityRegistry,
    learning: Arc<LearningStore>,
    tasks: Mutex<TaskQueue>,
    scorer: Scorer,
    health_policy: HealthPolicy,
    retry: RetryPolicy,
    link: Arc<dyn WorkerLink>,
    writer: Mutex<Option<WriteBehind>>,
    metrics: Arc<MetricsCollector>,
}

impl Federation {
    pub fn new(config: FederationConfig, link: Arc<dyn WorkerLink>) -> Self {
        Self::with_metrics(config, link, Arc::new(MetricsCollector::new()))
    }

    /// Share a metrics collector that the transport already reports into
    pub fn with_metrics(
        config: FederationConfig,
        link: Arc<dyn WorkerLink>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry: CapabilityRegistry::new(),
            learning: Arc::new(LearningStore::new(config.learning.confidence_samples)),
            tasks: Mutex::new(TaskQueue::new(config.scheduler.archive_capacity)),
            scorer: Scorer::from_config(&config.scoring),
            health_policy: HealthPolicy::from_config(&config.health),
            retry: RetryPolicy::from_config(&config.scheduler),
            link,
            writer: Mutex::new(None),
            metrics,
            config,
        }
    }

    /// Forward task and learning records to `store` in the background.
    /// Must be called inside a tokio runtime.
    pub fn with_persistence(self, store: Arc<dyn Persistence>) -> Self {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(WriteBehind::spawn(store, self.metrics.clone()));
        self
    }

    /// Attach `store`, then seed learning and re-admit unfinished tasks from it.
    ///
    /// Load failures are logged and the federation starts from what it could read.
    pub async fn resume_from(self, store: Arc<dyn Persistence>) -> Self {
        let federation = self.with_persistence(store.clone());
        if let Err(e) = federation.restore_learning(store.as_ref()).await {
            warn!(error = %e, "Could not restore learning records, starting cold");
        }
        if let Err(e) = federation.recover_pending(store.as_ref()).await {
            warn!(error = %e, "Could not recover unfinished tasks");
        }
        federation
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn learning(&self) -> &LearningStore {
        &self.learning
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskQueue> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Task API
    // ---------------------------------------------------------------------

    /// Admit a task. A task nobody can run is accepted and immediately
    /// resolved as `NoEligibleWorker`.
    pub fn submit(&self, request: TaskRequest) -> FederationResult<Uuid> {
        Self::validate_request(&request)?;
        let task_id = request.id;
        let _span = task_span!(task_id = %task_id, task_type = %request.task_type).entered();

        let no_worker = self.declared_candidates(&request).is_empty();
        let mut tasks = self.lock_tasks();
        self.admit(&mut tasks, request.clone(), Instant::now())?;

        if no_worker {
            self.terminate(
                &mut tasks,
                task_id,
                FederationError::no_eligible_worker(&request.task_type),
            );
        } else if let Some(entry) = tasks.get(&task_id) {
            self.persist_task(entry.to_record());
        }
        Ok(task_id)
    }

    /// Insert a validated request as PENDING, drainable from `not_before`
    fn admit(
        &self,
        tasks: &mut TaskQueue,
        request: TaskRequest,
        not_before: Instant,
    ) -> FederationResult<()> {
        let task_id = request.id;
        let max_retries = request
            .max_retries
            .unwrap_or(self.config.scheduler.default_max_retries);
        let (priority, complexity) = (request.priority, request.complexity);

        if !tasks.insert(request, max_retries, Instant::now()) {
            return Err(FederationError::invalid_input(format!(
                "Task {task_id} was already submitted"
            )));
        }
        if let Some(entry) = tasks.get_mut(&task_id) {
            entry.not_before = not_before;
        }
        self.metrics.task_submitted();
        info!(
            task_id = %task_id,
            priority = %priority,
            complexity = %complexity,
            max_retries,
            "Task submitted"
        );
        Ok(())
    }

    fn validate_request(request: &TaskRequest) -> FederationResult<()> {
        if request.task_type.trim().is_empty() {
            return Err(FederationError::invalid_input("Task type cannot be empty"));
        }
        if let Some(target) = &request.target_worker {
            validate_worker_id(target)
                .map_err(|e| FederationError::invalid_input(format!("Invalid target worker: {e}")))?;
        }
        if let Some(max_cost) = request.budget.max_cost {
            if !max_cost.is_finite() || max_cost < 0.0 {
                return Err(FederationError::invalid_input(format!(
                    "Cost budget must be a non-negative number, got {max_cost}"
                )));
            }
        }
        Ok(())
    }

    pub fn state(&self, task_id: Uuid) -> FederationResult<TaskState> {
        self.lock_tasks()
            .get(&task_id)
            .map(|e| e.state)
            .ok_or(FederationError::TaskNotFound(task_id))
    }

    pub fn status(&self, task_id: Uuid) -> FederationResult<TaskStatus> {
        self.lock_tasks()
            .get(&task_id)
            .map(|e| e.status())
            .ok_or(FederationError::TaskNotFound(task_id))
    }

    /// Wait until the task succeeds or fails permanently
    pub async fn wait_for_outcome(&self, task_id: Uuid) -> FederationResult<ExecutionResult> {
        let rx = {
            let mut tasks = self.lock_tasks();
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(FederationError::TaskNotFound(task_id))?;
            let (tx, rx) = oneshot::channel();
            entry.add_waiter(tx);
            rx
        };

        match rx.await {
            Ok(outcome) => outcome.map_err(FederationError::from),
            Err(_) => Err(FederationError::TaskNotFound(task_id)),
        }
    }

    // ---------------------------------------------------------------------
    // Worker API
    // ---------------------------------------------------------------------

    /// Register or refresh a worker. Returns `true` for a new worker.
    pub fn register_worker(&self, worker: Worker) -> FederationResult<bool> {
        validate_worker_id(&worker.id)
            .map_err(|e| FederationError::invalid_input(format!("Invalid worker id: {e}")))?;
        if worker.capabilities.is_empty() {
            return Err(FederationError::invalid_input(format!(
                "Worker '{}' declared no capabilities",
                worker.id
            )));
        }
        Ok(self.registry.register(worker))
    }

    /// Remove a worker, handing its in-flight tasks back to the queue first
    pub fn unregister_worker(&self, worker_id: &str) -> Option<Worker> {
        self.reassign_from(worker_id, "worker unregistered");
        self.registry.unregister(worker_id)
    }

    pub fn pause_worker(&self, worker_id: &str) -> bool {
        let paused = self.registry.update(worker_id, |w| w.paused = true).is_some();
        if paused {
            info!(worker_id = %worker_id, "Worker paused");
        }
        paused
    }

    pub fn resume_worker(&self, worker_id: &str) -> bool {
        let resumed = self.registry.update(worker_id, |w| w.paused = false).is_some();
        if resumed {
            info!(worker_id = %worker_id, "Worker resumed");
        }
        resumed
    }

    // ---------------------------------------------------------------------
    // Inbound worker traffic
    // ---------------------------------------------------------------------

    pub async fn handle_inbound(&self, event: InboundEvent) {
        let span = worker_span!(worker_id = %event.worker_id);
        self.apply_worker_message(event.worker_id, event.message)
            .instrument(span)
            .await
    }

    async fn apply_worker_message(&self, worker_id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::Register {
                capabilities,
                max_concurrency,
                description,
                success_rate,
                avg_cost,
                avg_latency_ms,
            } => {
                let mut worker = Worker::new(worker_id.as_str(), capabilities)
                    .with_max_concurrency(max_concurrency)
                    .with_stats(RollingStats::seeded(success_rate, avg_cost, avg_latency_ms));
                if let Some(description) = description {
                    worker = worker.with_description(description);
                }
                if let Err(e) = self.register_worker(worker) {
                    warn!(error = %e, "Rejected worker registration");
                }
            }
            WorkerMessage::Heartbeat { load, health_score } => {
                let now = Instant::now();
                let policy = &self.health_policy;
                let known = self.registry.update(&worker_id, |w| {
                    w.last_heartbeat = now;
                    w.disconnected = false;
                    w.reported_load = Some(load.clamp(0.0, 1.0));
                    w.health_score = Some(health_score);
                    HealthMonitor::refresh(w, now, policy)
                });
                if known.is_none() {
                    debug!("Heartbeat from unregistered worker ignored");
                }
            }
            WorkerMessage::TaskCompleted {
                task_id,
                attempt,
                result,
            } => {
                self.complete_task(&worker_id, task_id, attempt, result);
            }
            WorkerMessage::TaskFailed {
                task_id,
                attempt,
                error,
                cost,
                latency_ms,
            } => {
                let next = {
                    let mut tasks = self.lock_tasks();
                    let latency_ms = latency_ms.unwrap_or_else(|| {
                        tasks
                            .get(&task_id)
                            .and_then(|e| e.attempt_started)
                            .map_or(0, |started| started.elapsed().as_millis() as u64)
                    });
                    self.record_failure(
                        &mut tasks,
                        task_id,
                        &worker_id,
                        attempt,
                        FederationError::execution_error(
                            worker_id.as_str(),
                            sanitize_error_message(&error),
                        ),
                        Some((cost.unwrap_or(0.0), latency_ms as f64)),
                    )
                };
                if let NextStep::Dispatch(decision) = next {
                    self.dispatch(decision).await;
                }
            }
            WorkerMessage::CapabilityUpdate { capabilities } => {
                if !self.registry.update_capabilities(&worker_id, capabilities) {
                    debug!("Capability update from unregistered worker ignored");
                }
            }
            WorkerMessage::Disconnect { reason } => {
                let now = Instant::now();
                let policy = &self.health_policy;
                let transition = self.registry.update(&worker_id, |w| {
                    w.disconnected = true;
                    HealthMonitor::refresh(w, now, policy)
                });
                let reason = reason.unwrap_or_else(|| "worker disconnected".to_string());
                info!(reason = %reason, "Worker disconnected");
                if transition == Some(HealthTransition::WentOffline) {
                    self.reassign_from(&worker_id, &reason);
                }
            }
        }
    }

    fn complete_task(
        &self,
        worker_id: &str,
        task_id: Uuid,
        attempt: u32,
        completion: TaskCompletion,
    ) {
        let now = Instant::now();
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(&task_id) else {
            debug!(task_id = %task_id, "Result for unknown task discarded");
            self.metrics.result_discarded();
            return;
        };
        if !entry.accepts_result(worker_id, attempt) {
            info!(
                task_id = %task_id,
                attempt,
                state = %entry.state,
                "Discarding late or duplicate result"
            );
            self.metrics.result_discarded();
            return;
        }

        let latency_ms = completion.latency_ms.unwrap_or_else(|| {
            entry
                .attempt_started
                .map_or(0, |started| now.duration_since(started).as_millis() as u64)
        });
        let cost = completion.cost.max(0.0);

        self.registry.finish_task(worker_id, None);
        let policy = &self.health_policy;
        self.registry.update(worker_id, |w| {
            w.stats.observe(true, cost, latency_ms as f64);
            HealthMonitor::refresh(w, now, policy);
        });
        let record = self.learning.record_outcome(
            &entry.request.task_type,
            entry.request.complexity,
            worker_id,
            true,
            cost,
            latency_ms as f64,
        );
        self.persist_learning(record);

        entry.close_attempt(AttemptOutcome::Succeeded);
        entry.state = TaskState::Succeeded;
        entry.result = Some(ExecutionResult {
            task_id,
            worker_id: worker_id.to_string(),
            success: true,
            cost,
            latency_ms,
            output: Some(completion.output),
            error: None,
            tokens_used: completion.tokens_used,
        });
        entry.notify_waiters();
        self.metrics
            .task_succeeded(Duration::from_millis(latency_ms));
        info!(
            task_id = %task_id,
            worker_id = %worker_id,
            cost,
            latency_ms,
            attempts = entry.attempts.len(),
            "Task succeeded"
        );
        self.persist_task(entry.to_record());
        tasks.archive(task_id);
    }

    // ---------------------------------------------------------------------
    // Scheduling tick
    // ---------------------------------------------------------------------

    /// One scheduling pass: health, timeouts, deadlines, then assignment
    pub async fn tick(&self) {
        let span = tick_span!();
        self.run_tick().instrument(span).await
    }

    async fn run_tick(&self) {
        let now = Instant::now();
        let policy = &self.health_policy;

        let went_offline = self.registry.update_all(|w| {
            (HealthMonitor::refresh(w, now, policy) == HealthTransition::WentOffline)
                .then(|| w.id.clone())
        });
        for worker_id in went_offline {
            self.reassign_from(&worker_id, "heartbeat timeout");
        }

        let timed_out = self.lock_tasks().timed_out(now);
        for (task_id, worker_id, attempt) in timed_out {
            if let NextStep::Dispatch(decision) =
                self.handle_timeout(task_id, &worker_id, attempt, now)
            {
                self.dispatch(decision).await;
            }
        }

        {
            let mut tasks = self.lock_tasks();
            for task_id in tasks.past_deadline(now) {
                let attempts = tasks
                    .get(&task_id)
                    .map(|e| e.attempts.clone())
                    .unwrap_or_default();
                self.terminate(
                    &mut tasks,
                    task_id,
                    FederationError::DeadlineExceeded { task_id, attempts },
                );
            }
        }

        let ready = self
            .lock_tasks()
            .ready(now, self.config.scheduler.batch_size);
        if !ready.is_empty() {
            debug!(count = ready.len(), "Draining pending tasks");
        }
        for task_id in ready {
            self.assign(task_id).await;
        }
    }

    /// Fail the timed-out attempt and send the worker a cancellation.
    ///
    /// The cancellation runs on a detached task so a slow link cannot stall the tick.
    fn handle_timeout(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        now: Instant,
    ) -> NextStep {
        let next = {
            let mut tasks = self.lock_tasks();
            let Some(entry) = tasks
                .get(&task_id)
                .filter(|e| e.accepts_result(worker_id, attempt))
            else {
                return NextStep::Done;
            };
            let elapsed_ms = entry
                .attempt_started
                .map_or(0, |started| now.duration_since(started).as_millis() as u64);
            self.metrics.task_timed_out();
            self.record_failure(
                &mut tasks,
                task_id,
                worker_id,
                attempt,
                FederationError::Timeout {
                    worker_id: worker_id.to_string(),
                    elapsed_ms,
                },
                Some((0.0, elapsed_ms as f64)),
            )
        };

        let link = Arc::clone(&self.link);
        let worker = worker_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(SEND_TIMEOUT, link.send_cancel(&worker, task_id, "timeout"))
                .await
            {
                Ok(Ok(())) => debug!(task_id = %task_id, worker_id = %worker, "Sent cancellation"),
                Ok(Err(e)) => debug!(task_id = %task_id, error = %e, "Cancellation not delivered"),
                Err(_) => debug!(task_id = %task_id, "Cancellation send timed out"),
            }
        });

        next
    }

    /// Route one PENDING task and dispatch it
    async fn assign(&self, task_id: Uuid) {
        let decision = {
            let mut tasks = self.lock_tasks();
            self.route(&mut tasks, task_id)
        };
        if let Some(decision) = decision {
            self.dispatch(decision).await;
        }
    }

    /// Workers declaring the task's capability, narrowed to the explicit target
    fn declared_candidates(&self, request: &TaskRequest) -> Vec<Worker> {
        let mut candidates = self.registry.eligible_workers(&request.task_type);
        if let Some(target) = &request.target_worker {
            candidates.retain(|w| &w.id == target);
        }
        candidates
    }

    fn route(&self, tasks: &mut TaskQueue, task_id: Uuid) -> Option<RoutingDecision> {
        let entry = tasks.get(&task_id)?;
        if entry.state != TaskState::Pending {
            return None;
        }
        let request = entry.request.clone();
        let _span = task_span!(task_id = %task_id, task_type = %request.task_type).entered();

        let candidates = self.declared_candidates(&request);
        if candidates.is_empty() {
            self.terminate(
                tasks,
                task_id,
                FederationError::no_eligible_worker(&request.task_type),
            );
            return None;
        }

        let tried = entry.tried_workers();
        let schedulable: Vec<Worker> = candidates
            .into_iter()
            .filter(Worker::is_schedulable)
            .collect();
        let untried: Vec<Worker> = schedulable
            .iter()
            .filter(|w| !tried.contains(w.id.as_str()))
            .cloned()
            .collect();
        let pool = if untried.is_empty() {
            schedulable
        } else {
            untried
        };

        let record = self.learning.get(&request.task_type, request.complexity);
        let ranking = self.scorer.rank(&pool, &request, record.as_ref());
        match RoutingDecision::from_ranking(task_id, &ranking, self.config.scheduler.fallback_count)
        {
            Some(decision) => Some(decision),
            None => {
                self.defer_unavailable(tasks, task_id, &request.task_type);
                None
            }
        }
    }

    /// Workers declare the capability but none can take work right now
    fn defer_unavailable(&self, tasks: &mut TaskQueue, task_id: Uuid, task_type: &str) {
        let now = Instant::now();
        let error = FederationError::worker_unavailable(format!(
            "No schedulable worker for task type '{task_type}'"
        ));
        let Some(entry) = tasks.get_mut(&task_id) else {
            return;
        };
        let details = error.to_error_details();
        entry.last_error = Some(details.clone());

        if entry.retry_count >= entry.max_retries {
            let attempts = entry.attempts.clone();
            self.terminate(
                tasks,
                task_id,
                FederationError::RetriesExhausted {
                    task_id,
                    attempts,
                    last_error: details.message,
                },
            );
            return;
        }

        entry.retry_count += 1;
        let delay = self.retry.delay_for(entry.retry_count - 1);
        entry.not_before = now + delay;
        self.metrics.task_retried();
        warn!(
            task_id = %task_id,
            retry_count = entry.retry_count,
            delay_ms = delay.as_millis() as u64,
            "No schedulable worker, requeued with backoff"
        );
        self.persist_task(entry.to_record());
    }

    // ---------------------------------------------------------------------
    // Dispatch and failure handling
    // ---------------------------------------------------------------------

    /// Send the assignment, walking the fallback chain on send failures
    async fn dispatch(&self, mut decision: RoutingDecision) {
        let task_id = decision.task_id;
        loop {
            let assignment = {
                let mut tasks = self.lock_tasks();
                match self.begin_attempt(&mut tasks, &decision) {
                    Some(assignment) => assignment,
                    None => return,
                }
            };
            let worker_id = decision.worker_id.clone();
            let attempt = assignment.attempt;

            let sent = tokio::time::timeout(
                SEND_TIMEOUT,
                self.link.send_assignment(&worker_id, &assignment),
            )
            .await;
            let send_error = match sent {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("send timed out after {}s", SEND_TIMEOUT.as_secs())),
            };

            let mut tasks = self.lock_tasks();
            let Some(message) = send_error else {
                self.mark_running(&mut tasks, task_id, &worker_id, attempt);
                return;
            };

            let error = FederationError::worker_unavailable(format!(
                "Dispatch to '{worker_id}' failed: {message}"
            ));
            match self.record_failure(&mut tasks, task_id, &worker_id, attempt, error, None) {
                NextStep::Dispatch(next) => decision = next,
                NextStep::Done => return,
            }
        }
    }

    /// PENDING to ASSIGNED: record the decision and take a worker slot
    fn begin_attempt(
        &self,
        tasks: &mut TaskQueue,
        decision: &RoutingDecision,
    ) -> Option<TaskAssignment> {
        let entry = tasks.get_mut(&decision.task_id)?;
        if entry.state != TaskState::Pending {
            return None;
        }

        entry.state = TaskState::Assigned;
        entry.decision = Some(decision.clone());
        entry
            .attempts
            .push(crate::protocol::AttemptRecord::started(&decision.worker_id));
        entry.attempt_started = Some(Instant::now());
        self.registry.begin_task(&decision.worker_id);
        self.metrics.task_dispatched();
        let attempt = entry.attempts.len() as u32;

        info!(
            task_id = %decision.task_id,
            worker_id = %decision.worker_id,
            attempt,
            score = decision.score,
            fallbacks = ?decision.fallbacks,
            reason = %decision.reason,
            "Task assigned"
        );
        self.persist_task(entry.to_record());
        Some(TaskAssignment::from(&entry.request).with_attempt(attempt))
    }

    /// ASSIGNED to RUNNING once the worker has the assignment
    fn mark_running(&self, tasks: &mut TaskQueue, task_id: Uuid, worker_id: &str, attempt: u32) {
        let Some(entry) = tasks.get_mut(&task_id) else {
            return;
        };
        if entry.state != TaskState::Assigned || !entry.accepts_result(worker_id, attempt) {
            return;
        }

        let now = Instant::now();
        let mut budget = self.config.scheduler.task_timeout();
        if let Some(deadline) = entry.deadline {
            budget = budget.min(deadline.saturating_duration_since(now));
        }
        entry.state = TaskState::Running;
        entry.timeout_at = Some(now + budget);
        debug!(
            task_id = %task_id,
            worker_id = %worker_id,
            timeout_ms = budget.as_millis() as u64,
            "Task running"
        );
        self.persist_task(entry.to_record());
    }

    /// RUNNING or ASSIGNED to FAILED, then to a fallback, PENDING or FAILED_PERMANENT.
    ///
    /// `learn` carries cost and latency for failures that count as outcomes.
    fn record_failure(
        &self,
        tasks: &mut TaskQueue,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: FederationError,
        learn: Option<(f64, f64)>,
    ) -> NextStep {
        let now = Instant::now();
        let Some(entry) = tasks.get_mut(&task_id) else {
            self.metrics.result_discarded();
            return NextStep::Done;
        };
        if !entry.accepts_result(worker_id, attempt) {
            debug!(task_id = %task_id, worker_id = %worker_id, attempt, "Stale failure discarded");
            self.metrics.result_discarded();
            return NextStep::Done;
        }

        let details = error.to_error_details();
        self.registry.finish_task(worker_id, Some(&details.message));
        if let Some((cost, latency_ms)) = learn {
            self.registry
                .update(worker_id, |w| w.stats.observe(false, cost, latency_ms));
            let record = self.learning.record_outcome(
                &entry.request.task_type,
                entry.request.complexity,
                worker_id,
                false,
                cost,
                latency_ms,
            );
            self.persist_learning(record);
        }
        let policy = &self.health_policy;
        self.registry
            .update(worker_id, |w| HealthMonitor::refresh(w, now, policy));

        entry.close_attempt(AttemptOutcome::Failed {
            code: details.code,
            message: details.message.clone(),
        });
        entry.state = TaskState::Failed;
        entry.last_error = Some(details.clone());
        warn!(
            task_id = %task_id,
            worker_id = %worker_id,
            code = ?details.code,
            error = %details.message,
            retry_count = entry.retry_count,
            max_retries = entry.max_retries,
            "Task attempt failed"
        );

        if entry.retry_count >= entry.max_retries {
            let attempts = entry.attempts.clone();
            self.terminate(
                tasks,
                task_id,
                FederationError::RetriesExhausted {
                    task_id,
                    attempts,
                    last_error: details.message,
                },
            );
            return NextStep::Done;
        }

        entry.retry_count += 1;
        self.metrics.task_retried();

        if entry.deadline.is_some_and(|deadline| deadline <= now) {
            let attempts = entry.attempts.clone();
            self.terminate(
                tasks,
                task_id,
                FederationError::DeadlineExceeded { task_id, attempts },
            );
            return NextStep::Done;
        }

        let task_type = entry.request.task_type.clone();
        let fallback = entry.decision.as_ref().and_then(|decision| {
            decision.promote_fallback(|candidate| {
                self.registry.get(candidate).is_some_and(|w| {
                    w.is_schedulable() && w.capability_match(&task_type) != CapabilityMatch::None
                })
            })
        });

        entry.state = TaskState::Pending;
        match fallback {
            Some(decision) => {
                self.metrics.fallback_used();
                info!(
                    task_id = %task_id,
                    fallback = %decision.worker_id,
                    "Retrying on fallback worker"
                );
                entry.decision = Some(decision.clone());
                NextStep::Dispatch(decision)
            }
            None => {
                let delay = self.retry.delay_for(entry.retry_count - 1);
                entry.decision = None;
                entry.not_before = now + delay;
                info!(
                    task_id = %task_id,
                    delay_ms = delay.as_millis() as u64,
                    "Fallback chain exhausted, requeued with backoff"
                );
                self.persist_task(entry.to_record());
                NextStep::Done
            }
        }
    }

    /// Hand every in-flight task of a worker back to the queue.
    ///
    /// Does not consume retry budget and records no learning outcome.
    fn reassign_from(&self, worker_id: &str, reason: &str) -> usize {
        let now = Instant::now();
        let mut tasks = self.lock_tasks();
        let task_ids = tasks.in_flight_on(worker_id);

        for task_id in &task_ids {
            let Some(entry) = tasks.get_mut(task_id) else {
                continue;
            };
            entry.close_attempt(AttemptOutcome::Reassigned {
                reason: reason.to_string(),
            });
            entry.state = TaskState::Pending;
            entry.decision = None;
            entry.not_before = now;
            self.registry.finish_task(worker_id, Some(reason));
            self.metrics.task_reassigned();
            info!(
                task_id = %task_id,
                worker_id = %worker_id,
                reason = %reason,
                "Task requeued for reassignment"
            );
            self.persist_task(entry.to_record());
        }
        task_ids.len()
    }

    /// Move a task to FAILED_PERMANENT and tell everyone waiting on it
    fn terminate(&self, tasks: &mut TaskQueue, task_id: Uuid, error: FederationError) {
        let Some(entry) = tasks.get_mut(&task_id) else {
            return;
        };
        let details = error.to_error_details();

        if let Some(worker_id) = entry.current_worker().map(str::to_string) {
            self.registry.finish_task(&worker_id, Some(&details.message));
        }
        entry.close_attempt(AttemptOutcome::Failed {
            code: details.code,
            message: details.message.clone(),
        });
        entry.state = TaskState::FailedPermanent;
        entry.last_error = Some(details.clone());
        entry.failure = Some(TaskFailure {
            task_id,
            task_type: entry.request.task_type.clone(),
            error: details.clone(),
            attempts: entry.attempts.clone(),
        });
        entry.notify_waiters();
        self.metrics.task_failed_permanent();

        let workers: Vec<&str> = entry.attempts.iter().map(|a| a.worker_id.as_str()).collect();
        match details.code {
            ErrorCode::NoEligibleWorker => info!(
                task_id = %task_id,
                task_type = %entry.request.task_type,
                "No eligible worker, task failed"
            ),
            _ => warn!(
                task_id = %task_id,
                code = ?details.code,
                workers_attempted = ?workers,
                error = %details.message,
                "Task failed permanently"
            ),
        }

        self.persist_task(entry.to_record());
        tasks.archive(task_id);
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    fn persist_task(&self, record: crate::persistence::TaskRecord) {
        if let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            writer.save_task(record);
        }
    }

    fn persist_learning(&self, record: LearningRecord) {
        if let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            writer.save_learning(record);
        }
    }

    /// Re-admit tasks that were not finished when the process last stopped.
    ///
    /// Recovered tasks wait one heartbeat interval before their first routing
    /// pass so workers have a chance to re-register.
    /// Retry count and attempt history carry over from the stored record.
    pub async fn recover_pending(&self, store: &dyn Persistence) -> FederationResult<usize> {
        let pending = store.load_pending_tasks().await?;
        let not_before = Instant::now() + self.config.health.heartbeat_interval();
        let mut recovered = 0;

        let mut tasks = self.lock_tasks();
        for record in pending {
            let task_id = record.task_id;
            let admitted = Self::validate_request(&record.request)
                .and_then(|()| self.admit(&mut tasks, record.request, not_before));
            match admitted {
                Ok(()) => {
                    recovered += 1;
                    if let Some(entry) = tasks.get_mut(&task_id) {
                        entry.restore_history(record.retry_count, record.attempts, record.error);
                        self.persist_task(entry.to_record());
                    }
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Skipped unrecoverable task"),
            }
        }
        drop(tasks);

        info!(recovered, "Recovered pending tasks");
        Ok(recovered)
    }

    /// Seed the learning store from persisted records
    pub async fn restore_learning(&self, store: &dyn Persistence) -> FederationResult<usize> {
        let records = store.load_learning_records().await?;
        let count = records.len();
        self.learning.restore(records);
        info!(buckets = count, "Restored learning records");
        Ok(count)
    }

    /// Flush queued persistence writes
    pub async fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.shutdown().await;
        }
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> FederationStats {
        let queue = self.lock_tasks().counts();
        let workers = self.registry.all();
        let metrics = self.metrics.snapshot().scheduler;
        let finished = metrics.tasks_succeeded + metrics.tasks_failed_permanent;

        FederationStats {
            federation_id: self.config.federation.id.clone(),
            total_workers: workers.len(),
            online_workers: workers.iter().filter(|w| w.status().is_online()).count(),
            total_tasks: metrics.tasks_submitted,
            succeeded: metrics.tasks_succeeded,
            failed: metrics.tasks_failed_permanent,
            success_rate: if finished == 0 {
                0.0
            } else {
                metrics.tasks_succeeded as f64 / finished as f64
            },
            queue,
            learning_buckets: self.learning.len(),
            per_worker: workers.iter().map(WorkerStatsView::from).collect(),
        }
    }

    pub fn health_snapshots(&self) -> Vec<HealthSnapshot> {
        let now = Instant::now();
        self.registry
            .all()
            .iter()
            .map(|w| HealthMonitor::snapshot(w, now))
            .collect()
    }

    /// Drive the scheduler until shutdown is signalled or the inbound channel closes
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.scheduler.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            federation_id = %self.config.federation.id,
            tick_interval_ms = self.config.scheduler.tick_interval_ms,
            mode = ?self.scorer.mode(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                }
                event = inbound.recv() => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => {
                        info!("Inbound channel closed, stopping scheduler");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskCompletion;
    use crate::testing::mocks::MockWorkerLink;
    use serde_json::json;

    fn federation() -> (Arc<Federation>, Arc<MockWorkerLink>) {
        let link = Arc::new(MockWorkerLink::new());
        let federation = Federation::new(FederationConfig::test_config(), link.clone());
        (Arc::new(federation), link)
    }

    fn worker(id: &str, caps: &[&str]) -> Worker {
        Worker::new(id, caps.iter().map(|c| c.to_string()).collect())
    }

    fn completed(task_id: Uuid) -> WorkerMessage {
        WorkerMessage::TaskCompleted {
            task_id,
            attempt: 1,
            result: TaskCompletion {
                output: json!({"ok": true}),
                cost: 0.05,
                latency_ms: Some(120),
                tokens_used: None,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_dispatch_complete() {
        let (federation, link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();

        let task_id = federation
            .submit(TaskRequest::new("summarize", json!({"text": "hi"})))
            .unwrap();
        assert_eq!(federation.state(task_id).unwrap(), TaskState::Pending);

        federation.tick().await;
        assert_eq!(federation.state(task_id).unwrap(), TaskState::Running);
        let assignments = link.assignments_for("w1").await;
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].attempt, 1);
        assert_eq!(federation.registry().get("w1").unwrap().in_flight, 1);

        federation
            .handle_inbound(InboundEvent::new("w1", completed(task_id)))
            .await;

        let result = federation.wait_for_outcome(task_id).await.unwrap();
        assert_eq!(result.worker_id, "w1");
        assert_eq!(result.latency_ms, 120);
        assert_eq!(federation.registry().get("w1").unwrap().in_flight, 0);
        assert_eq!(federation.learning().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_invalid_and_duplicate_requests() {
        let (federation, _link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();

        let empty = TaskRequest::new("  ", json!({}));
        assert!(matches!(
            federation.submit(empty),
            Err(FederationError::InvalidInput { .. })
        ));

        let negative = TaskRequest::new("summarize", json!({})).with_cost_budget(-1.0);
        assert!(federation.submit(negative).is_err());

        let request = TaskRequest::new("summarize", json!({}));
        federation.submit(request.clone()).unwrap();
        assert!(federation.submit(request).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_task_is_not_found() {
        let (federation, _link) = federation();
        let id = Uuid::new_v4();
        assert!(matches!(
            federation.state(id),
            Err(FederationError::TaskNotFound(found)) if found == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_worker_validates_id_and_capabilities() {
        let (federation, _link) = federation();
        assert!(federation
            .register_worker(worker("bad/id", &["summarize"]))
            .is_err());
        assert!(federation.register_worker(worker("w1", &[])).is_err());
        assert!(federation.register_worker(worker("w1", &["x"])).unwrap());
        assert!(!federation.register_worker(worker("w1", &["y"])).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_worker_is_skipped() {
        let (federation, link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();
        federation.register_worker(worker("w2", &["summarize"])).unwrap();
        assert!(federation.pause_worker("w1"));
        // Heartbeats never un-pause
        federation
            .handle_inbound(InboundEvent::new(
                "w1",
                WorkerMessage::Heartbeat {
                    load: 0.0,
                    health_score: 100.0,
                },
            ))
            .await;

        let task_id = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        federation.tick().await;

        assert_eq!(federation.status(task_id).unwrap().worker_id.as_deref(), Some("w2"));
        assert!(link.assignments_for("w1").await.is_empty());
        assert_eq!(
            federation.registry().get("w1").unwrap().status(),
            WorkerStatus::Paused
        );

        assert!(federation.resume_worker("w1"));
        assert!(!federation.pause_worker("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_message_seeds_stats() {
        let (federation, _link) = federation();
        federation
            .handle_inbound(InboundEvent::new(
                "neuron-1",
                WorkerMessage::Register {
                    capabilities: vec!["Classify".to_string()],
                    max_concurrency: 4,
                    description: Some("GPU node".to_string()),
                    success_rate: Some(0.8),
                    avg_cost: Some(0.02),
                    avg_latency_ms: None,
                },
            ))
            .await;

        let worker = federation.registry().get("neuron-1").unwrap();
        assert_eq!(worker.max_concurrency, 4);
        assert!(worker.capabilities.contains("classify"));
        assert_eq!(worker.stats.success_rate, Some(0.8));
        assert_eq!(worker.stats.samples, 1);
        assert_eq!(worker.description.as_deref(), Some("GPU node"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_update_changes_eligibility() {
        let (federation, _link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();
        federation
            .handle_inbound(InboundEvent::new(
                "w1",
                WorkerMessage::CapabilityUpdate {
                    capabilities: vec!["translate".to_string()],
                },
            ))
            .await;

        let task_id = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        assert_eq!(
            federation.state(task_id).unwrap(),
            TaskState::FailedPermanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_requeues_in_flight_tasks() {
        let (federation, _link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();
        federation.register_worker(worker("w2", &["summarize"])).unwrap();
        let task_id = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        federation.tick().await;
        let first = federation.status(task_id).unwrap().worker_id.unwrap();

        assert!(federation.unregister_worker(&first).is_some());
        let status = federation.status(task_id).unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.retry_count, 0);

        federation.tick().await;
        let second = federation.status(task_id).unwrap().worker_id.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reflect_outcomes() {
        let (federation, _link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();

        let ok = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        federation
            .submit(TaskRequest::new("translate", json!({})))
            .unwrap();
        federation.tick().await;
        federation
            .handle_inbound(InboundEvent::new("w1", completed(ok)))
            .await;

        let stats = federation.stats();
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.online_workers, 1);
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.per_worker[0].worker_id, "w1");
        assert_eq!(stats.per_worker[0].samples, 1);
        assert_eq!(federation.health_snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_is_not_counted() {
        let (federation, link) = federation();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();

        let task_id = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        federation.tick().await;
        federation
            .handle_inbound(InboundEvent::new("w1", completed(task_id)))
            .await;

        // The attempt already finished by the time its timeout is handled
        let next = federation.handle_timeout(task_id, "w1", 1, Instant::now());
        assert!(matches!(next, NextStep::Done));
        tokio::task::yield_now().await;

        let metrics = federation.metrics().snapshot();
        assert_eq!(metrics.scheduler.timeouts, 0);
        assert_eq!(metrics.scheduler.results_discarded, 0);
        assert!(link.cancels().await.is_empty());
        assert_eq!(federation.state(task_id).unwrap(), TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_cancellation_does_not_hold_the_tick() {
        let (federation, link) = federation();
        link.stall_cancels();
        federation.register_worker(worker("w1", &["summarize"])).unwrap();
        federation.register_worker(worker("w2", &["summarize"])).unwrap();

        let first = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        let second = federation
            .submit(TaskRequest::new("summarize", json!({})))
            .unwrap();
        federation.tick().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        let before = Instant::now();
        federation.tick().await;

        // A paused clock only moves if the tick waits on a send timeout
        assert_eq!(Instant::now(), before);
        assert_eq!(federation.metrics().snapshot().scheduler.timeouts, 2);
        for task_id in [first, second] {
            assert_ne!(federation.state(task_id).unwrap(), TaskState::Failed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (federation, _link) = federation();
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(federation.clone().run(inbound_rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
