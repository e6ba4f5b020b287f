//! Executor Registry
//!
//! Maps each executor kind to one implementation of the `Executor`
//! capability. The registry is assembled once at startup and then shared
//! read-only; there is no hot-swap.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::models::{ActionRequest, ActionResult, ExecutorKind};

/// A capability that performs a step's action.
///
/// Executors are opaque to the engine: they see an `ActionRequest` and
/// answer with a result or an error. They have no access to the store.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult, ExecutorError>;
}

/// Type alias for closure-backed executor handlers
pub type ExecutorHandler =
    Arc<dyn Fn(ActionRequest) -> BoxFuture<'static, Result<ActionResult, ExecutorError>> + Send + Sync>;

/// Executor backed by an async closure
pub struct FnExecutor {
    handler: ExecutorHandler,
}

impl FnExecutor {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, ExecutorError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |request| handler(request).boxed()),
        }
    }
}

#[async_trait]
impl Executor for FnExecutor {
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult, ExecutorError> {
        (self.handler)(request).await
    }
}

/// Executor that acknowledges every action
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, request: ActionRequest) -> Result<ActionResult, ExecutorError> {
        Ok(ActionResult::completed(format!(
            "{} completed: {}",
            request.executor_kind.display_name(),
            request.action
        )))
    }
}

/// Registry of executors keyed by kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the kind
    pub fn register(&mut self, kind: ExecutorKind, executor: Arc<dyn Executor>) {
        info!("Registered executor: {}", kind);
        self.executors.insert(kind, executor);
    }

    /// Builder-style registration
    pub fn with(mut self, kind: ExecutorKind, executor: Arc<dyn Executor>) -> Self {
        self.register(kind, executor);
        self
    }

    /// Register a closure as the executor for a kind
    pub fn with_fn<F, Fut>(self, kind: ExecutorKind, handler: F) -> Self
    where
        F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, ExecutorError>> + Send + 'static,
    {
        self.with(kind, Arc::new(FnExecutor::new(handler)))
    }

    /// Look up the executor for a kind
    pub fn resolve(&self, kind: ExecutorKind) -> EngineResult<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned().ok_or_else(|| {
            EngineError::Configuration(format!("No executor registered for {}", kind))
        })
    }

    pub fn contains(&self, kind: ExecutorKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Registered kinds in declaration order
    pub fn kinds(&self) -> Vec<ExecutorKind> {
        ExecutorKind::ALL
            .into_iter()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: ExecutorKind) -> ActionRequest {
        ActionRequest {
            step_id: "s".into(),
            plan_id: "p".into(),
            session_id: "sess".into(),
            action: "Draft a press release".into(),
            context: String::new(),
            executor_kind: kind,
            attempt: 1,
        }
    }

    #[test]
    fn test_resolve_unknown_kind_is_configuration_error() {
        let registry = ExecutorRegistry::new().with(ExecutorKind::Hr, Arc::new(EchoExecutor));

        assert!(registry.resolve(ExecutorKind::Hr).is_ok());
        let err = registry.resolve(ExecutorKind::Product).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_kinds_in_declaration_order() {
        let registry = ExecutorRegistry::new()
            .with(ExecutorKind::Human, Arc::new(EchoExecutor))
            .with(ExecutorKind::Hr, Arc::new(EchoExecutor));

        assert_eq!(registry.kinds(), vec![ExecutorKind::Hr, ExecutorKind::Human]);
        assert!(registry.contains(ExecutorKind::Human));
        assert!(!registry.contains(ExecutorKind::Generic));
    }

    #[tokio::test]
    async fn test_fn_executor() {
        let registry = ExecutorRegistry::new().with_fn(ExecutorKind::Marketing, |req| async move {
            Ok(ActionResult::completed(format!("done: {}", req.action)))
        });

        let executor = registry.resolve(ExecutorKind::Marketing).unwrap();
        let result = executor.execute(request(ExecutorKind::Marketing)).await.unwrap();
        assert_eq!(result.text, "done: Draft a press release");
    }

    #[tokio::test]
    async fn test_echo_executor() {
        let result = EchoExecutor.execute(request(ExecutorKind::Product)).await.unwrap();
        assert!(result.text.contains("Product Agent"));
    }
}
