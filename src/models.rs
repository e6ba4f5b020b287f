//! Data model
//!
//! Tasks, plans, steps and audit messages as they live in the store, plus
//! the transient request/result values exchanged with executors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Current time in milliseconds since the epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kind of executor a step is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorKind {
    Hr,
    Marketing,
    Product,
    Procurement,
    TechSupport,
    Generic,
    Human,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 7] = [
        Self::Hr,
        Self::Marketing,
        Self::Product,
        Self::Procurement,
        Self::TechSupport,
        Self::Generic,
        Self::Human,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hr => "HR",
            Self::Marketing => "MARKETING",
            Self::Product => "PRODUCT",
            Self::Procurement => "PROCUREMENT",
            Self::TechSupport => "TECH_SUPPORT",
            Self::Generic => "GENERIC",
            Self::Human => "HUMAN",
        }
    }

    /// Human-readable name for messages and logs
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Hr => "HR Agent",
            Self::Marketing => "Marketing Agent",
            Self::Product => "Product Agent",
            Self::Procurement => "Procurement Agent",
            Self::TechSupport => "Tech Support Agent",
            Self::Generic => "Generic Agent",
            Self::Human => "Human",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = EngineError;

    /// Accepts `TECH_SUPPORT`, `tech_support`, `Tech_Support_Agent` and
    /// `tech support` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        let normalized = normalized.strip_suffix("_agent").unwrap_or(&normalized);

        match normalized {
            "hr" => Ok(Self::Hr),
            "marketing" => Ok(Self::Marketing),
            "product" => Ok(Self::Product),
            "procurement" => Ok(Self::Procurement),
            "tech_support" | "techsupport" => Ok(Self::TechSupport),
            "generic" => Ok(Self::Generic),
            "human" => Ok(Self::Human),
            _ => Err(EngineError::Configuration(format!(
                "Unknown executor kind: {}",
                s
            ))),
        }
    }
}

/// Status of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Session identity: every plan, step and message is partitioned by it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
}

impl Session {
    /// Start a fresh session for a user
    pub fn new(user_id: &str) -> Self {
        Self {
            session_id: new_id(),
            user_id: user_id.to_string(),
        }
    }

    pub fn with_id(session_id: &str, user_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

/// A task as submitted by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: i64,
}

impl Task {
    pub fn new(session: &Session, description: &str) -> Self {
        Self {
            id: new_id(),
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            created_at: now_millis(),
        }
    }
}

/// An ordered set of steps for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub task_id: String,
    pub description: String,
    /// Summary returned by the plan builder, if any
    pub summary: Option<String>,
    /// Clarifications a human added after the plan was created
    #[serde(default)]
    pub clarification: Option<String>,
    pub status: PlanStatus,
    /// Step ids in execution order
    pub step_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Plan {
    pub fn new(task: &Task) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            session_id: task.session_id.clone(),
            user_id: task.user_id.clone(),
            task_id: task.id.clone(),
            description: task.description.clone(),
            summary: None,
            clarification: None,
            status: PlanStatus::Pending,
            step_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: PlanStatus) {
        self.status = status;
        self.updated_at = now_millis();
    }
}

/// A single typed action within a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub plan_id: String,
    pub session_id: String,
    pub sequence_index: usize,
    pub action: String,
    pub executor_kind: ExecutorKind,
    pub status: StepStatus,
    pub result: Option<String>,
    pub agent_reply: Option<String>,
    pub human_feedback: Option<String>,
    /// Executor that produced the final outcome (differs from
    /// `executor_kind` after escalation)
    pub handled_by: Option<ExecutorKind>,
    pub attempt_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Step {
    pub fn new(plan: &Plan, sequence_index: usize, action: &str, executor_kind: ExecutorKind) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            plan_id: plan.id.clone(),
            session_id: plan.session_id.clone(),
            sequence_index,
            action: action.to_string(),
            executor_kind,
            status: StepStatus::Pending,
            result: None,
            agent_reply: None,
            human_feedback: None,
            handled_by: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// Audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub plan_id: Option<String>,
    pub step_id: Option<String>,
    /// Who produced the message: `user`, `orchestrator`, or an executor kind
    pub source: String,
    pub content: String,
    pub created_at: i64,
}

impl StoredMessage {
    pub fn new(session: &Session, source: &str, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            plan_id: None,
            step_id: None,
            source: source.to_string(),
            content: content.into(),
            created_at: now_millis(),
        }
    }

    pub fn for_plan(mut self, plan_id: &str) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self
    }

    pub fn for_step(mut self, step: &Step) -> Self {
        self.plan_id = Some(step.plan_id.clone());
        self.step_id = Some(step.id.clone());
        self
    }
}

/// Request handed to an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub step_id: String,
    pub plan_id: String,
    pub session_id: String,
    pub action: String,
    /// Plan description and the replies of earlier steps
    pub context: String,
    /// Executor the request is addressed to (after escalation, not the
    /// step's own kind)
    pub executor_kind: ExecutorKind,
    /// 1-based attempt number within the current escalation tier
    pub attempt: u32,
}

/// Outcome reported by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Failed,
}

/// Result returned by an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub text: String,
    pub status: ActionStatus,
    /// Conversational reply, when it differs from the result text
    pub reply: Option<String>,
    /// Replacement action text decided by the executor (human edits)
    #[serde(default)]
    pub revised_action: Option<String>,
}

impl ActionResult {
    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ActionStatus::Completed,
            reply: None,
            revised_action: None,
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: ActionStatus::Failed,
            reply: None,
            revised_action: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_revised_action(mut self, action: impl Into<String>) -> Self {
        self.revised_action = Some(action.into());
        self
    }
}

/// Per-status step counts for a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepCounts {
    pub fn tally(steps: &[Step]) -> Self {
        let mut counts = Self {
            total: steps.len(),
            ..Default::default()
        };
        for step in steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::InProgress => counts.in_progress += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// A plan together with its steps, as returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: Plan,
    pub steps: Vec<Step>,
    pub counts: StepCounts,
}

impl PlanSnapshot {
    pub fn new(plan: Plan, steps: Vec<Step>) -> Self {
        let counts = StepCounts::tally(&steps);
        Self { plan, steps, counts }
    }

    /// Completed share of steps (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        if self.counts.total == 0 {
            return 0.0;
        }
        self.counts.completed as f64 / self.counts.total as f64
    }

    /// First step that ended `failed`, if any
    pub fn failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Format for display
    pub fn format(&self) -> String {
        let mut s = format!("# Plan {} [{}]\n\n", self.plan.id, self.plan.status.as_str());
        s.push_str(&self.plan.description);
        s.push_str("\n\n## Steps\n\n");

        for step in &self.steps {
            let icon = match step.status {
                StepStatus::Pending => "○",
                StepStatus::InProgress => "◎",
                StepStatus::Completed => "●",
                StepStatus::Failed => "✗",
                StepStatus::Skipped => "◇",
            };
            s.push_str(&format!(
                "{} Step {} ({}, attempts: {}): {}\n",
                icon,
                step.sequence_index + 1,
                step.executor_kind.display_name(),
                step.attempt_count,
                step.action
            ));
            if let Some(reply) = &step.agent_reply {
                s.push_str(&format!("   {}\n", reply));
            }
        }

        s.push_str(&format!("\nProgress: {:.0}%\n", self.progress() * 100.0));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_kind_parsing() {
        assert_eq!("HR".parse::<ExecutorKind>().unwrap(), ExecutorKind::Hr);
        assert_eq!("Hr_Agent".parse::<ExecutorKind>().unwrap(), ExecutorKind::Hr);
        assert_eq!(
            "Tech_Support_Agent".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::TechSupport
        );
        assert_eq!(
            "tech support".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::TechSupport
        );
        assert_eq!("Human_Agent".parse::<ExecutorKind>().unwrap(), ExecutorKind::Human);

        let err = "Finance_Agent".parse::<ExecutorKind>().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_executor_kind_serde() {
        let json = serde_json::to_string(&ExecutorKind::TechSupport).unwrap();
        assert_eq!(json, "\"TECH_SUPPORT\"");
        for kind in ExecutorKind::ALL {
            assert_eq!(kind.as_str().parse::<ExecutorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PlanStatus::Pending.is_terminal());
        assert!(!PlanStatus::InProgress.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_snapshot_counts_and_progress() {
        let session = Session::new("tester");
        let task = Task::new(&session, "Onboard a new employee");
        let plan = Plan::new(&task);

        let mut s1 = Step::new(&plan, 0, "Create account", ExecutorKind::TechSupport);
        let s2 = Step::new(&plan, 1, "Order laptop", ExecutorKind::Procurement);
        s1.status = StepStatus::Completed;

        let snapshot = PlanSnapshot::new(plan, vec![s1, s2]);
        assert_eq!(snapshot.counts.total, 2);
        assert_eq!(snapshot.counts.completed, 1);
        assert_eq!(snapshot.counts.pending, 1);
        assert_eq!(snapshot.progress(), 0.5);
        assert!(snapshot.failed_step().is_none());
        assert!(snapshot.format().contains("Order laptop"));
    }

    #[test]
    fn test_message_scoping() {
        let session = Session::new("tester");
        let task = Task::new(&session, "x");
        let plan = Plan::new(&task);
        let step = Step::new(&plan, 0, "a", ExecutorKind::Hr);

        let msg = StoredMessage::new(&session, "orchestrator", "hello").for_step(&step);
        assert_eq!(msg.plan_id.as_deref(), Some(plan.id.as_str()));
        assert_eq!(msg.step_id.as_deref(), Some(step.id.as_str()));
    }
}
