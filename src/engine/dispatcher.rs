//! Step Dispatcher
//!
//! Drives exactly one step to a terminal status:
//! - retries the planned executor with exponential backoff
//! - escalates once to GENERIC, then once to HUMAN
//! - records every attempt and escalation in the audit trail
//!
//! `attempt_count` grows by one per primary-tier attempt and by one per
//! escalation hop, so it never exceeds `max_attempts + 2`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::recovery::{escalation_chain, EscalationTier, RetryPolicy};
use super::registry::{Executor, ExecutorRegistry};
use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::models::{
    ActionRequest, ActionResult, ActionStatus, ExecutorKind, Plan, Session, Step, StepStatus,
    StoredMessage,
};
use crate::store::Store;

const SOURCE: &str = "orchestrator";

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    /// Timeout per executor invocation (HUMAN waits are not bounded)
    pub executor_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            executor_timeout: Duration::from_secs(30),
        }
    }
}

/// Cooperative cancellation signal observed between steps and while
/// waiting on a human
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sending side of a `CancelToken`
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_, token) = CancelHandle::new();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Exclusive write access to one step
pub struct StepLease {
    leases: Arc<Mutex<HashSet<String>>>,
    step_id: String,
}

impl Drop for StepLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.step_id);
    }
}

/// Counters for dispatch operations
#[derive(Default)]
struct DispatchMetrics {
    dispatched: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    escalations: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub attempts: u64,
    pub retries: u64,
    pub escalations: u64,
    pub completed: u64,
    pub failed: u64,
}

/// How one tier ended
enum TierOutcome {
    Completed(ActionResult),
    Exhausted,
    Failed(String),
    Cancelled,
}

/// Executes single steps against the executor registry
pub struct StepDispatcher {
    store: Arc<dyn Store>,
    registry: Arc<ExecutorRegistry>,
    session: Session,
    config: DispatchConfig,
    leases: Arc<Mutex<HashSet<String>>>,
    metrics: DispatchMetrics,
}

impl StepDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ExecutorRegistry>,
        session: Session,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            session,
            config,
            leases: Arc::new(Mutex::new(HashSet::new())),
            metrics: DispatchMetrics::default(),
        }
    }

    /// Take the write lease for a step
    pub fn claim(&self, step_id: &str) -> EngineResult<StepLease> {
        let mut leases = self.leases.lock();
        if !leases.insert(step_id.to_string()) {
            return Err(EngineError::InvalidState(format!(
                "Step {} is already being dispatched",
                step_id
            )));
        }
        Ok(StepLease {
            leases: Arc::clone(&self.leases),
            step_id: step_id.to_string(),
        })
    }

    /// Run a pending step to a terminal status and return it
    pub async fn dispatch(&self, step_id: &str, mut cancel: CancelToken) -> EngineResult<Step> {
        let _lease = self.claim(step_id)?;

        let mut step = self.store.get_step(step_id).await?;
        if step.status != StepStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "Step {} is {}, only pending steps can be dispatched",
                step.id,
                step.status.as_str()
            )));
        }

        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);

        let plan = self.store.get_plan(&step.plan_id).await?;
        let prior: Vec<Step> = self
            .store
            .list_steps_for_plan(&plan.id)
            .await?
            .into_iter()
            .filter(|s| s.sequence_index < step.sequence_index)
            .collect();
        let context = build_context(&plan, &prior);

        info!(
            "Dispatching step {} ({}) of plan {}",
            step.sequence_index + 1,
            step.executor_kind,
            plan.id
        );

        for (hop, (tier, kind)) in escalation_chain(step.executor_kind).into_iter().enumerate() {
            let executor = match self.registry.resolve(kind) {
                Ok(executor) => executor,
                Err(e) => {
                    // Wiring faults are fatal for the step; no further tiers
                    return self.finish_failed(step, kind, e.to_string()).await;
                }
            };

            if hop > 0 {
                self.metrics.escalations.fetch_add(1, Ordering::Relaxed);
                warn!("Escalating step {} to {} tier ({})", step.id, tier.as_str(), kind);
                self.record(
                    &step,
                    SOURCE,
                    format!("Escalating to {} after retries were exhausted", kind.display_name()),
                )
                .await?;
            }

            let outcome = if tier == EscalationTier::Human {
                self.run_human_tier(&mut step, executor, &context, &mut cancel)
                    .await?
            } else {
                self.run_retry_tier(&mut step, tier, kind, executor, &context)
                    .await?
            };

            match outcome {
                TierOutcome::Completed(result) => {
                    return self.finish_completed(step, kind, result).await;
                }
                TierOutcome::Exhausted => continue,
                TierOutcome::Failed(reason) => {
                    return self.finish_failed(step, kind, reason).await;
                }
                TierOutcome::Cancelled => {
                    return self.finish_cancelled(step).await;
                }
            }
        }

        // The chain always ends with HUMAN, which never reports Exhausted
        let last = step.executor_kind;
        self.finish_failed(step, last, "Escalation chain exhausted".into())
            .await
    }

    /// Attempt a non-human tier up to the retry limit
    async fn run_retry_tier(
        &self,
        step: &mut Step,
        tier: EscalationTier,
        kind: ExecutorKind,
        executor: Arc<dyn Executor>,
        context: &str,
    ) -> EngineResult<TierOutcome> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.begin_attempt(step, tier, attempt).await?;

            self.record_request(step, kind).await?;
            let request = self.request(step, kind, context, attempt);
            match self.invoke(&executor, request).await {
                Ok(result) => return Ok(TierOutcome::Completed(result)),
                Err(e) => {
                    warn!(
                        "Step {} attempt {} on {} failed: {}",
                        step.id, attempt, kind, e
                    );
                    step.result = Some(e.to_string());
                    self.record(
                        step,
                        kind.as_str(),
                        format!("Attempt {} failed: {}", attempt, e),
                    )
                    .await?;
                }
            }

            if !self.config.retry.allows_retry(attempt) {
                return Ok(TierOutcome::Exhausted);
            }

            let delay = self.config.retry.delay_after_attempt(attempt);
            debug!("Retrying step {} on {} after {:?}", step.id, kind, delay);
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    /// Hand the step to a human and wait for the answer or cancellation
    async fn run_human_tier(
        &self,
        step: &mut Step,
        executor: Arc<dyn Executor>,
        context: &str,
        cancel: &mut CancelToken,
    ) -> EngineResult<TierOutcome> {
        self.begin_attempt(step, EscalationTier::Human, 1).await?;
        self.record_request(step, ExecutorKind::Human).await?;

        let request = self.request(step, ExecutorKind::Human, context, 1);
        let outcome = tokio::select! {
            outcome = executor.execute(request) => outcome,
            _ = cancel.cancelled() => return Ok(TierOutcome::Cancelled),
        };

        Ok(match outcome {
            Ok(result) if result.status == ActionStatus::Completed => {
                TierOutcome::Completed(result)
            }
            Ok(result) => TierOutcome::Failed(format!("Rejected by human: {}", result.text)),
            Err(e) => TierOutcome::Failed(e.to_string()),
        })
    }

    async fn begin_attempt(
        &self,
        step: &mut Step,
        tier: EscalationTier,
        attempt: u32,
    ) -> EngineResult<()> {
        // Retries inside an escalation tier do not add to the step's count
        if tier == EscalationTier::Primary || attempt == 1 {
            step.attempt_count += 1;
        }
        step.status = StepStatus::InProgress;
        step.touch();
        self.store.put_step(step).await?;
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn request(&self, step: &Step, kind: ExecutorKind, context: &str, attempt: u32) -> ActionRequest {
        ActionRequest {
            step_id: step.id.clone(),
            plan_id: step.plan_id.clone(),
            session_id: step.session_id.clone(),
            action: step.action.clone(),
            context: context.to_string(),
            executor_kind: kind,
            attempt,
        }
    }

    /// Call an executor under the configured timeout
    async fn invoke(
        &self,
        executor: &Arc<dyn Executor>,
        request: ActionRequest,
    ) -> Result<ActionResult, ExecutorError> {
        let timeout = self.config.executor_timeout;
        match tokio::time::timeout(timeout, executor.execute(request)).await {
            Ok(Ok(result)) if result.status == ActionStatus::Completed => Ok(result),
            Ok(Ok(result)) => Err(ExecutorError::Rejected(result.text)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExecutorError::Timeout(timeout)),
        }
    }

    async fn finish_completed(
        &self,
        mut step: Step,
        kind: ExecutorKind,
        result: ActionResult,
    ) -> EngineResult<Step> {
        let reply = result.reply.clone().unwrap_or_else(|| result.text.clone());
        if kind == ExecutorKind::Human {
            step.human_feedback = Some(result.text.clone());
        }
        let revised = result.revised_action.clone();
        if let Some(action) = &revised {
            step.action = action.clone();
        }
        step.status = StepStatus::Completed;
        step.result = Some(result.text);
        step.agent_reply = Some(reply.clone());
        step.handled_by = Some(kind);
        step.touch();
        self.store.put_step(&step).await?;
        if let Some(action) = revised {
            self.record(&step, kind.as_str(), format!("Action updated to: {}", action))
                .await?;
        }
        self.record(&step, kind.as_str(), reply).await?;

        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            "Step {} completed by {} after {} attempt(s)",
            step.id, kind, step.attempt_count
        );
        Ok(step)
    }

    async fn finish_failed(
        &self,
        mut step: Step,
        kind: ExecutorKind,
        reason: String,
    ) -> EngineResult<Step> {
        step.status = StepStatus::Failed;
        step.result = Some(reason.clone());
        step.handled_by = Some(kind);
        step.touch();
        self.store.put_step(&step).await?;
        self.record(&step, SOURCE, format!("Step failed: {}", reason))
            .await?;

        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        error!("Step {} failed: {}", step.id, reason);
        Ok(step)
    }

    async fn finish_cancelled(&self, mut step: Step) -> EngineResult<Step> {
        step.status = StepStatus::Skipped;
        step.result = Some("Cancelled while waiting for a human decision".into());
        step.touch();
        self.store.put_step(&step).await?;
        self.record(&step, SOURCE, "Cancelled while waiting for a human decision")
            .await?;

        info!("Step {} skipped by cancellation", step.id);
        Ok(step)
    }

    async fn record_request(&self, step: &Step, kind: ExecutorKind) -> EngineResult<()> {
        self.record(
            step,
            SOURCE,
            format!(
                "Requesting {} to perform action: {}",
                kind.display_name(),
                step.action
            ),
        )
        .await
    }

    async fn record(
        &self,
        step: &Step,
        source: &str,
        content: impl Into<String>,
    ) -> EngineResult<()> {
        let message = StoredMessage::new(&self.session, source, content).for_step(step);
        self.store.append_message(&message).await
    }

    /// Get dispatch statistics
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.metrics.dispatched.load(Ordering::Relaxed),
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            escalations: self.metrics.escalations.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
        }
    }
}

/// Context handed to executors: the task and what earlier steps produced
pub fn build_context(plan: &Plan, prior: &[Step]) -> String {
    let mut context = format!("Task: {}\n", plan.description);
    if let Some(summary) = &plan.summary {
        context.push_str(&format!("Plan summary: {}\n", summary));
    }
    if let Some(clarification) = &plan.clarification {
        context.push_str(&format!("Clarification: {}\n", clarification));
    }

    if prior.is_empty() {
        return context;
    }

    context.push_str("\nEarlier steps:\n");
    for step in prior {
        let replier = step.handled_by.unwrap_or(step.executor_kind);
        context.push_str(&format!(
            "Step {} [{}] {}\n",
            step.sequence_index + 1,
            step.status.as_str(),
            step.action
        ));
        if let Some(reply) = &step.agent_reply {
            context.push_str(&format!("  {}: {}\n", replier.display_name(), reply));
        }
    }
    context
}
