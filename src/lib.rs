//! Taskplan
//!
//! Plan orchestration engine: takes a user task, obtains an ordered plan of
//! typed steps from a plan builder, and executes the steps one at a time
//! against a registry of executors.
//!
//! # Features
//!
//! - **Sequential execution**: a step is terminal before the next starts
//! - **Retries**: exponential backoff against the same executor
//! - **Escalation**: primary executor → GENERIC → HUMAN
//! - **Human decision point**: HUMAN steps suspend until answered
//! - **Audit trail**: every attempt, escalation and transition is recorded
//! - **Pluggable state**: in-memory or SQLite store
//!
//! # Architecture
//!
//! ```text
//! caller ──► PlanOrchestrator ──► PlanBuilder (steps)
//!                 │
//!                 ├── StepDispatcher ──► ExecutorRegistry ──► Executor
//!                 │        │                                  └── HumanGateway
//!                 │        └── RetryPolicy / escalation chain
//!                 └── Store (MemoryStore | SqliteStore)
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;

pub use config::{Config, StoreBackend};
pub use engine::{
    parse_planner_response, CancelToken, DispatchConfig, EchoExecutor, EscalationTier, Executor,
    ExecutorRegistry, FnExecutor, HumanFeedback, HumanGateway, HumanRequest, OrchestratorConfig,
    PlanBuilder, PlanOrchestrator, ProposedPlan, ProposedStep, RetryPolicy, StaticPlanBuilder,
    StepDispatcher,
};
pub use error::{EngineError, EngineResult, ExecutorError};
pub use models::{
    ActionRequest, ActionResult, ActionStatus, ExecutorKind, Plan, PlanSnapshot, PlanStatus,
    Session, Step, StepCounts, StepStatus, StoredMessage, Task, TaskStatus,
};
pub use store::{MemoryStore, SqliteStore, Store, StoreStats};
