//! Plan Builder Interface
//!
//! Turning a task into steps is an external capability. Its output is
//! untrusted: it is parsed and validated before any plan is created.
//!
//! Accepted response shapes (JSON, optionally surrounded by prose):
//! - `{"summary": "...", "steps": [{"action": "...", "agent": "HR"}, ...]}`
//! - `[{"action": "...", "agent": "Hr_Agent"}, ...]`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::registry::ExecutorRegistry;
use crate::error::{EngineError, EngineResult};
use crate::models::{ExecutorKind, Task};

/// One step proposed by the plan builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedStep {
    pub action: String,
    pub executor_kind: ExecutorKind,
}

impl ProposedStep {
    pub fn new(action: &str, executor_kind: ExecutorKind) -> Self {
        Self {
            action: action.to_string(),
            executor_kind,
        }
    }
}

/// Plan builder output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedPlan {
    pub summary: Option<String>,
    pub steps: Vec<ProposedStep>,
}

/// Turns a task into an ordered list of proposed steps
#[async_trait]
pub trait PlanBuilder: Send + Sync {
    async fn build(&self, task: &Task) -> EngineResult<ProposedPlan>;
}

/// Builder that always proposes the same steps
pub struct StaticPlanBuilder {
    plan: ProposedPlan,
}

impl StaticPlanBuilder {
    pub fn new(steps: Vec<ProposedStep>) -> Self {
        Self {
            plan: ProposedPlan {
                summary: None,
                steps,
            },
        }
    }

    pub fn from_plan(plan: ProposedPlan) -> Self {
        Self { plan }
    }

    /// Build from a raw planner response
    pub fn from_response(response: &str) -> EngineResult<Self> {
        Ok(Self::from_plan(parse_planner_response(response)?))
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.plan.summary = Some(summary.to_string());
        self
    }
}

#[async_trait]
impl PlanBuilder for StaticPlanBuilder {
    async fn build(&self, _task: &Task) -> EngineResult<ProposedPlan> {
        Ok(self.plan.clone())
    }
}

#[derive(Deserialize)]
struct StepJson {
    action: String,
    #[serde(alias = "executor", alias = "executor_kind", alias = "executorKind")]
    agent: String,
}

#[derive(Deserialize)]
struct PlanJson {
    #[serde(default, alias = "summary_plan_and_steps")]
    summary: Option<String>,
    steps: Vec<StepJson>,
}

/// Parse a planner response into a proposed plan
pub fn parse_planner_response(response: &str) -> EngineResult<ProposedPlan> {
    let malformed = |detail: String| {
        EngineError::Configuration(format!("Malformed plan builder output: {}", detail))
    };

    // Whichever JSON value opens first decides the shape
    let object_at = response.find('{');
    let array_at = response.find('[');
    let array_first = match (object_at, array_at) {
        (Some(o), Some(a)) => a < o,
        (None, Some(_)) => true,
        _ => false,
    };

    let (summary, raw_steps) = if array_first {
        let arr = extract_json(response, '[', ']')
            .ok_or_else(|| malformed("unterminated array".into()))?;
        let steps: Vec<StepJson> =
            serde_json::from_str(arr).map_err(|e| malformed(e.to_string()))?;
        (None, steps)
    } else if let Some(obj) = extract_json(response, '{', '}') {
        let parsed: PlanJson = serde_json::from_str(obj).map_err(|e| malformed(e.to_string()))?;
        (parsed.summary, parsed.steps)
    } else {
        return Err(malformed("no JSON found".into()));
    };

    let steps = raw_steps
        .into_iter()
        .map(|s| {
            Ok(ProposedStep {
                executor_kind: s.agent.parse()?,
                action: s.action,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(ProposedPlan { summary, steps })
}

/// Check builder output before a plan is created from it
pub fn validate_proposed(
    proposed: &ProposedPlan,
    registry: &ExecutorRegistry,
    max_steps: usize,
) -> EngineResult<()> {
    if proposed.steps.is_empty() {
        return Err(EngineError::Configuration(
            "Plan builder returned no steps".into(),
        ));
    }

    if proposed.steps.len() > max_steps {
        return Err(EngineError::Configuration(format!(
            "Plan builder returned {} steps (max {})",
            proposed.steps.len(),
            max_steps
        )));
    }

    for (i, step) in proposed.steps.iter().enumerate() {
        if step.action.trim().is_empty() {
            return Err(EngineError::Configuration(format!(
                "Step {} has an empty action",
                i + 1
            )));
        }
        registry.resolve(step.executor_kind)?;
    }

    Ok(())
}

/// Extract the first balanced JSON value delimited by `open`/`close`
fn extract_json(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::EchoExecutor;
    use std::sync::Arc;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::new()
            .with(ExecutorKind::Hr, Arc::new(EchoExecutor))
            .with(ExecutorKind::Generic, Arc::new(EchoExecutor))
            .with(ExecutorKind::Human, Arc::new(EchoExecutor))
    }

    #[test]
    fn test_parse_object_with_prose() {
        let response = r#"Here is the plan:
{"summary_plan_and_steps": "Onboard Jane", "steps": [
  {"action": "Create an employee record for Jane", "agent": "Hr_Agent"},
  {"action": "Confirm start date {Monday}", "agent": "Human_Agent"}
]}
Let me know if that works."#;

        let plan = parse_planner_response(response).unwrap();
        assert_eq!(plan.summary.as_deref(), Some("Onboard Jane"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].executor_kind, ExecutorKind::Hr);
        assert_eq!(plan.steps[1].action, "Confirm start date {Monday}");
    }

    #[test]
    fn test_parse_bare_array() {
        let plan = parse_planner_response(
            r#"[{"action": "Write copy", "executor": "MARKETING"}]"#,
        )
        .unwrap();
        assert!(plan.summary.is_none());
        assert_eq!(plan.steps[0].executor_kind, ExecutorKind::Marketing);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_planner_response("no plan today"),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            parse_planner_response(r#"{"steps": [{"action": "x"}]}"#),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            parse_planner_response(r#"[{"action": "x", "agent": "Finance_Agent"}]"#),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_proposed() {
        let registry = registry();
        let ok = ProposedPlan {
            summary: None,
            steps: vec![ProposedStep::new("Draft policy", ExecutorKind::Hr)],
        };
        assert!(validate_proposed(&ok, &registry, 20).is_ok());

        let empty = ProposedPlan::default();
        assert!(validate_proposed(&empty, &registry, 20).is_err());

        let blank = ProposedPlan {
            summary: None,
            steps: vec![ProposedStep::new("   ", ExecutorKind::Hr)],
        };
        assert!(validate_proposed(&blank, &registry, 20).is_err());

        let unresolvable = ProposedPlan {
            summary: None,
            steps: vec![ProposedStep::new("Order chairs", ExecutorKind::Procurement)],
        };
        assert!(matches!(
            validate_proposed(&unresolvable, &registry, 20),
            Err(EngineError::Configuration(_))
        ));

        let too_long = ProposedPlan {
            summary: None,
            steps: vec![ProposedStep::new("a", ExecutorKind::Hr); 3],
        };
        assert!(validate_proposed(&too_long, &registry, 2).is_err());
    }

    #[test]
    fn test_extract_json_ignores_braces_in_strings() {
        let text = r#"prefix {"a": "}"} suffix"#;
        assert_eq!(extract_json(text, '{', '}'), Some(r#"{"a": "}"}"#));
        assert_eq!(extract_json("none", '{', '}'), None);
    }

    #[tokio::test]
    async fn test_static_builder() {
        let builder = StaticPlanBuilder::new(vec![ProposedStep::new("a", ExecutorKind::Hr)])
            .with_summary("one step");
        let session = crate::models::Session::new("tester");
        let task = Task::new(&session, "anything");

        let proposed = builder.build(&task).await.unwrap();
        assert_eq!(proposed.summary.as_deref(), Some("one step"));
        assert_eq!(proposed.steps.len(), 1);
    }
}
