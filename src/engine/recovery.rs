//! Retry and Escalation Policy
//!
//! Failure handling is data, not control flow hidden in wrappers:
//! - `RetryPolicy`: attempts per tier and exponential backoff between them
//! - `EscalationTier`: primary executor → GENERIC → HUMAN
//!
//! The dispatcher walks the chain returned by `escalation_chain`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::ExecutorKind;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per escalation tier (first try included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based) of a tier
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` tries in a tier
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Fallback tier a step is executing in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    /// The executor the step was planned for
    Primary,
    /// Fallback to the GENERIC executor
    Generic,
    /// External human decision; waits rather than retries
    Human,
}

impl EscalationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Generic => "generic",
            Self::Human => "human",
        }
    }
}

/// Tiers a step walks through, in order, with the executor for each.
///
/// A step planned for GENERIC goes straight to HUMAN on exhaustion, and a
/// step planned for HUMAN has a single tier.
pub fn escalation_chain(primary: ExecutorKind) -> Vec<(EscalationTier, ExecutorKind)> {
    let mut chain = vec![];
    match primary {
        ExecutorKind::Human => {
            chain.push((EscalationTier::Human, ExecutorKind::Human));
        }
        ExecutorKind::Generic => {
            chain.push((EscalationTier::Primary, ExecutorKind::Generic));
            chain.push((EscalationTier::Human, ExecutorKind::Human));
        }
        other => {
            chain.push((EscalationTier::Primary, other));
            chain.push((EscalationTier::Generic, ExecutorKind::Generic));
            chain.push((EscalationTier::Human, ExecutorKind::Human));
        }
    }
    chain
}
