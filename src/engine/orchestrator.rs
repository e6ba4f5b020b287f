//! Plan Orchestrator
//!
//! Caller-facing API over the plan state machine:
//!
//! ```text
//! pending → in_progress → completed | failed | cancelled
//! ```
//!
//! Steps run strictly one after another. A step reaches a terminal status
//! before the next one is dispatched, so later actions can build on the
//! replies of earlier ones.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::dispatcher::{CancelHandle, CancelToken, DispatchConfig, DispatchStats, StepDispatcher};
use super::human::{HumanFeedback, HumanGateway};
use super::planner::{validate_proposed, PlanBuilder};
use super::registry::ExecutorRegistry;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Plan, PlanSnapshot, PlanStatus, Session, Step, StepStatus, StoredMessage, Task, TaskStatus,
};
use crate::store::{Store, StoreStats};

const SOURCE: &str = "orchestrator";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub dispatch: DispatchConfig,
    /// Most steps accepted from the plan builder
    pub max_steps: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            max_steps: 20,
        }
    }
}

/// Combined statistics
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub store: StoreStats,
    pub dispatch: DispatchStats,
    pub running_plans: usize,
}

/// Drives the plans of one session
pub struct PlanOrchestrator {
    session: Session,
    store: Arc<dyn Store>,
    registry: Arc<ExecutorRegistry>,
    planner: Arc<dyn PlanBuilder>,
    dispatcher: StepDispatcher,
    human: Option<Arc<HumanGateway>>,
    config: OrchestratorConfig,
    /// Cancel handles of plans currently executing
    running: Mutex<HashMap<String, CancelHandle>>,
}

impl PlanOrchestrator {
    pub fn new(
        session: Session,
        store: Arc<dyn Store>,
        registry: ExecutorRegistry,
        planner: Arc<dyn PlanBuilder>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let dispatcher = StepDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            session.clone(),
            config.dispatch.clone(),
        );

        Self {
            session,
            store,
            registry,
            planner,
            dispatcher,
            human: None,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Route human feedback through a gateway. The gateway must also be
    /// registered as the HUMAN executor.
    pub fn with_human_gateway(mut self, gateway: Arc<HumanGateway>) -> Self {
        self.human = Some(gateway);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Ask the plan builder for steps and store a pending plan.
    ///
    /// Nothing is stored unless every proposed step is valid and routed to
    /// a registered executor.
    pub async fn create_plan(&self, description: &str) -> EngineResult<Plan> {
        let description = description.trim();
        if description.is_empty() {
            return Err(EngineError::Configuration(
                "Task description is empty".into(),
            ));
        }

        let task = Task::new(&self.session, description);
        let proposed = self.planner.build(&task).await?;
        validate_proposed(&proposed, &self.registry, self.config.max_steps)?;

        let mut plan = Plan::new(&task);
        plan.summary = proposed.summary.clone();
        let steps: Vec<Step> = proposed
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| Step::new(&plan, i, &s.action, s.executor_kind))
            .collect();
        plan.step_ids = steps.iter().map(|s| s.id.clone()).collect();

        self.store.put_task(&task).await?;
        self.store.put_plan(&plan).await?;
        for step in &steps {
            self.store.put_step(step).await?;
        }

        self.record(&plan.id, "user", description).await?;
        self.record(
            &plan.id,
            SOURCE,
            format!("Plan created with {} steps", steps.len()),
        )
        .await?;

        info!("Created plan {} with {} steps", plan.id, steps.len());
        Ok(plan)
    }

    /// Run a pending plan to a terminal status.
    ///
    /// A plan executes exactly once: anything but `pending` is rejected
    /// with `InvalidState` before the store is touched.
    pub async fn execute_plan(&self, plan_id: &str) -> EngineResult<Plan> {
        let (plan, token) = {
            let mut running = self.running.lock().await;
            if running.contains_key(plan_id) {
                return Err(EngineError::InvalidState(format!(
                    "Plan {} is already executing",
                    plan_id
                )));
            }

            let mut plan = self.store.get_plan(plan_id).await?;
            if plan.status != PlanStatus::Pending {
                return Err(EngineError::InvalidState(format!(
                    "Plan {} is {}, only pending plans can be executed",
                    plan_id,
                    plan.status.as_str()
                )));
            }

            plan.set_status(PlanStatus::InProgress);
            self.store.put_plan(&plan).await?;
            self.set_task_status(&plan.task_id, TaskStatus::InProgress)
                .await?;

            let (handle, token) = CancelHandle::new();
            running.insert(plan_id.to_string(), handle);
            (plan, token)
        };

        info!("Executing plan {}", plan_id);
        let outcome = self.run_steps(&plan, token).await;
        self.running.lock().await.remove(plan_id);

        let status = outcome?;
        self.finish(&plan.id, status).await
    }

    /// Dispatch steps in order until one fails or cancellation arrives
    async fn run_steps(&self, plan: &Plan, token: CancelToken) -> EngineResult<PlanStatus> {
        let steps = self.store.list_steps_for_plan(&plan.id).await?;

        for step in steps {
            if token.is_cancelled() {
                info!("Plan {} cancelled before step {}", plan.id, step.sequence_index + 1);
                self.skip_remaining(&plan.id, "Skipped: plan cancelled")
                    .await?;
                return Ok(PlanStatus::Cancelled);
            }
            if step.status.is_terminal() {
                continue;
            }

            let done = self.dispatcher.dispatch(&step.id, token.clone()).await?;
            match done.status {
                StepStatus::Failed => {
                    warn!(
                        "Plan {} stopped at step {}",
                        plan.id,
                        done.sequence_index + 1
                    );
                    let reason = format!(
                        "Skipped: plan failed at step {}",
                        done.sequence_index + 1
                    );
                    self.skip_remaining(&plan.id, &reason).await?;
                    return Ok(PlanStatus::Failed);
                }
                StepStatus::Skipped => {
                    self.skip_remaining(&plan.id, "Skipped: plan cancelled")
                        .await?;
                    return Ok(PlanStatus::Cancelled);
                }
                _ => {}
            }
        }

        // Cancelled while the last step was in flight
        if token.is_cancelled() {
            info!("Plan {} cancelled during its last step", plan.id);
            return Ok(PlanStatus::Cancelled);
        }

        Ok(PlanStatus::Completed)
    }

    /// Mark every still-pending step of a plan `skipped`
    async fn skip_remaining(&self, plan_id: &str, reason: &str) -> EngineResult<usize> {
        let mut skipped = 0;
        for mut step in self.store.list_steps_for_plan(plan_id).await? {
            if step.status.is_terminal() {
                continue;
            }
            step.status = StepStatus::Skipped;
            step.result = Some(reason.to_string());
            step.touch();
            self.store.put_step(&step).await?;
            skipped += 1;
        }
        Ok(skipped)
    }

    async fn finish(&self, plan_id: &str, status: PlanStatus) -> EngineResult<Plan> {
        // Reload so clarifications added during the run are kept
        let mut plan = self.store.get_plan(plan_id).await?;
        plan.set_status(status);
        self.store.put_plan(&plan).await?;

        let task_status = match status {
            PlanStatus::Completed => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        };
        self.set_task_status(&plan.task_id, task_status).await?;
        self.record(&plan.id, SOURCE, format!("Plan {}", status.as_str()))
            .await?;

        info!("Plan {} finished: {}", plan.id, status.as_str());
        Ok(plan)
    }

    /// Current plan with all of its steps
    pub async fn get_plan_status(&self, plan_id: &str) -> EngineResult<PlanSnapshot> {
        let plan = self.store.get_plan(plan_id).await?;
        let steps = self.store.list_steps_for_plan(plan_id).await?;
        Ok(PlanSnapshot::new(plan, steps))
    }

    /// Request cancellation.
    ///
    /// A running plan stops before its next step; a step waiting on a
    /// human is released as `skipped`. A pending plan is cancelled at once.
    pub async fn cancel_plan(&self, plan_id: &str) -> EngineResult<()> {
        let running = self.running.lock().await;
        if let Some(handle) = running.get(plan_id) {
            handle.cancel();
            info!("Cancellation requested for plan {}", plan_id);
            return Ok(());
        }

        let plan = self.store.get_plan(plan_id).await?;
        if plan.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "Plan {} is already {}",
                plan_id,
                plan.status.as_str()
            )));
        }

        // Not executing here: pending, or abandoned mid-run
        self.skip_remaining(plan_id, "Skipped: plan cancelled")
            .await?;
        self.finish(plan_id, PlanStatus::Cancelled).await?;
        Ok(())
    }

    /// Add a human clarification to a plan that has not finished.
    ///
    /// Every step dispatched afterwards sees it in its context.
    pub async fn add_clarification(&self, plan_id: &str, text: &str) -> EngineResult<Plan> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::Configuration("Clarification is empty".into()));
        }

        let mut plan = self.store.get_plan(plan_id).await?;
        if plan.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "Plan {} is already {}",
                plan_id,
                plan.status.as_str()
            )));
        }

        plan.clarification = Some(match plan.clarification.take() {
            Some(existing) => format!("{}\n{}", existing, text),
            None => text.to_string(),
        });
        plan.updated_at = crate::models::now_millis();
        self.store.put_plan(&plan).await?;
        self.record(plan_id, "user", format!("Clarification: {}", text))
            .await?;

        info!("Clarification added to plan {}", plan_id);
        Ok(plan)
    }

    /// Approve a step waiting on a human decision with free-text feedback
    pub async fn submit_human_feedback(&self, step_id: &str, feedback: &str) -> EngineResult<()> {
        self.submit_human_decision(step_id, HumanFeedback::approve(feedback))
            .await
    }

    /// Approve or reject a step waiting on a human decision
    pub async fn submit_human_decision(
        &self,
        step_id: &str,
        feedback: HumanFeedback,
    ) -> EngineResult<()> {
        let gateway = self.human.as_ref().ok_or_else(|| {
            EngineError::Configuration("No human gateway configured".into())
        })?;

        let step = self.store.get_step(step_id).await?;
        if step.status != StepStatus::InProgress {
            return Err(EngineError::InvalidState(format!(
                "Step {} is {}, not waiting for feedback",
                step_id,
                step.status.as_str()
            )));
        }

        gateway.decide(step_id, feedback)
    }

    /// Plans of this session, oldest first
    pub async fn list_plans(&self) -> EngineResult<Vec<Plan>> {
        self.store
            .list_plans_for_session(&self.session.session_id)
            .await
    }

    /// Most recent plan of this session
    pub async fn latest_plan(&self) -> EngineResult<Option<PlanSnapshot>> {
        match self
            .store
            .latest_plan_for_session(&self.session.session_id)
            .await?
        {
            Some(plan) => Ok(Some(self.get_plan_status(&plan.id).await?)),
            None => Ok(None),
        }
    }

    /// Audit trail of a plan
    pub async fn messages(&self, plan_id: &str) -> EngineResult<Vec<StoredMessage>> {
        self.store.list_messages_for_plan(plan_id).await
    }

    pub async fn stats(&self) -> EngineResult<OrchestratorStats> {
        Ok(OrchestratorStats {
            store: self.store.stats().await?,
            dispatch: self.dispatcher.stats(),
            running_plans: self.running.lock().await.len(),
        })
    }

    async fn set_task_status(&self, task_id: &str, status: TaskStatus) -> EngineResult<()> {
        let mut task = self.store.get_task(task_id).await?;
        task.status = status;
        self.store.put_task(&task).await
    }

    async fn record(
        &self,
        plan_id: &str,
        source: &str,
        content: impl Into<String>,
    ) -> EngineResult<()> {
        let message = StoredMessage::new(&self.session, source, content).for_plan(plan_id);
        self.store.append_message(&message).await
    }
}
