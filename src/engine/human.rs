//! Human Decision Point
//!
//! The HUMAN executor does not fail on slowness: it publishes a request and
//! suspends until someone answers through `respond`. The only failure is an
//! infrastructure fault, e.g. nobody listening for requests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::registry::Executor;
use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::models::{ActionRequest, ActionResult};

/// A pending question for a human
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanRequest {
    pub step_id: String,
    pub plan_id: String,
    pub session_id: String,
    pub action: String,
    pub context: String,
}

/// A human's answer to a pending request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    /// Rejected feedback fails the step with `text` as the reason
    pub approved: bool,
    pub text: String,
    /// Replacement for the step's action text
    pub updated_action: Option<String>,
}

impl HumanFeedback {
    pub fn approve(text: &str) -> Self {
        Self {
            approved: true,
            text: text.to_string(),
            updated_action: None,
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            approved: false,
            text: reason.to_string(),
            updated_action: None,
        }
    }

    pub fn with_updated_action(mut self, action: &str) -> Self {
        self.updated_action = Some(action.to_string());
        self
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<HumanFeedback>>>>;

/// Removes the pending entry when the waiting future is dropped
struct PendingGuard {
    pending: PendingMap,
    step_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.step_id);
    }
}

/// Bridges HUMAN steps to whoever answers them
pub struct HumanGateway {
    pending: PendingMap,
    requests: mpsc::UnboundedSender<HumanRequest>,
}

impl HumanGateway {
    /// Create a gateway and the receiver on which requests are published
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HumanRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            requests: tx,
        });
        (gateway, rx)
    }

    /// Approve the pending request for a step with free-text feedback
    pub fn respond(&self, step_id: &str, feedback: &str) -> EngineResult<()> {
        self.decide(step_id, HumanFeedback::approve(feedback))
    }

    /// Answer the pending request for a step
    pub fn decide(&self, step_id: &str, feedback: HumanFeedback) -> EngineResult<()> {
        let approved = feedback.approved;
        let sender = self
            .pending
            .lock()
            .remove(step_id)
            .ok_or_else(|| EngineError::not_found("human request", step_id))?;

        sender.send(feedback).map_err(|_| {
            EngineError::InvalidState(format!("Step {} is no longer waiting", step_id))
        })?;

        info!(
            "Human {} step {}",
            if approved { "approved" } else { "rejected" },
            step_id
        );
        Ok(())
    }

    /// Step ids currently waiting for a human
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn is_waiting(&self, step_id: &str) -> bool {
        self.pending.lock().contains_key(step_id)
    }
}

#[async_trait]
impl Executor for HumanGateway {
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.step_id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            step_id: request.step_id.clone(),
        };

        let published = HumanRequest {
            step_id: request.step_id.clone(),
            plan_id: request.plan_id.clone(),
            session_id: request.session_id.clone(),
            action: request.action.clone(),
            context: request.context.clone(),
        };
        self.requests
            .send(published)
            .map_err(|_| ExecutorError::Unavailable("No listener for human requests".into()))?;

        debug!("Waiting for human decision on step {}", request.step_id);

        match rx.await {
            Ok(feedback) if feedback.approved => {
                let result = ActionResult::completed(feedback.text);
                Ok(match feedback.updated_action {
                    Some(action) => result.with_revised_action(action),
                    None => result,
                })
            }
            Ok(feedback) => Ok(ActionResult::failed(feedback.text)),
            Err(_) => Err(ExecutorError::Unavailable(
                "Human response channel closed".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionStatus, ExecutorKind};

    fn request(step_id: &str) -> ActionRequest {
        ActionRequest {
            step_id: step_id.into(),
            plan_id: "p".into(),
            session_id: "sess".into(),
            action: "Approve the budget".into(),
            context: String::new(),
            executor_kind: ExecutorKind::Human,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_waits_for_response() {
        let (gateway, mut requests) = HumanGateway::new();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.execute(request("step-1")).await })
        };

        let published = requests.recv().await.unwrap();
        assert_eq!(published.step_id, "step-1");
        assert!(gateway.is_waiting("step-1"));

        gateway.respond("step-1", "Approved, go ahead").unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.text, "Approved, go ahead");
        assert!(gateway.pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_and_edited_action() {
        let (gateway, mut requests) = HumanGateway::new();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.execute(request("step-4")).await })
        };
        requests.recv().await.unwrap();
        gateway
            .decide("step-4", HumanFeedback::reject("Budget is frozen"))
            .unwrap();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, ActionStatus::Failed);
        assert_eq!(result.text, "Budget is frozen");

        let waiter = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.execute(request("step-5")).await })
        };
        requests.recv().await.unwrap();
        gateway
            .decide(
                "step-5",
                HumanFeedback::approve("Fine at a lower amount")
                    .with_updated_action("Approve half the budget"),
            )
            .unwrap();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, ActionStatus::Completed);
        assert_eq!(result.revised_action.as_deref(), Some("Approve half the budget"));
    }

    #[tokio::test]
    async fn test_respond_without_request() {
        let (gateway, _requests) = HumanGateway::new();
        let err = gateway.respond("nobody", "hi").unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_no_listener_is_unavailable() {
        let (gateway, requests) = HumanGateway::new();
        drop(requests);

        let err = gateway.execute(request("step-2")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable(_)));
        assert!(!gateway.is_waiting("step-2"));
    }

    #[tokio::test]
    async fn test_dropped_wait_clears_pending() {
        let (gateway, _requests) = HumanGateway::new();

        let wait = gateway.execute(request("step-3"));
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(10), wait).await;
        assert!(outcome.is_err());
        assert!(!gateway.is_waiting("step-3"));
    }
}
