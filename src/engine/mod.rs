//! Plan execution engine
//!
//! - `registry`: executor capability and kind → executor mapping
//! - `recovery`: retry policy and escalation tiers
//! - `human`: the HUMAN decision point
//! - `planner`: plan builder interface and output validation
//! - `dispatcher`: runs one step to a terminal status
//! - `orchestrator`: runs a plan's steps in order

pub mod dispatcher;
pub mod human;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod registry;

pub use dispatcher::{CancelHandle, CancelToken, DispatchConfig, DispatchStats, StepDispatcher};
pub use human::{HumanFeedback, HumanGateway, HumanRequest};
pub use orchestrator::{OrchestratorConfig, OrchestratorStats, PlanOrchestrator};
pub use planner::{
    parse_planner_response, validate_proposed, PlanBuilder, ProposedPlan, ProposedStep,
    StaticPlanBuilder,
};
pub use recovery::{escalation_chain, EscalationTier, RetryPolicy};
pub use registry::{EchoExecutor, Executor, ExecutorRegistry, FnExecutor};
