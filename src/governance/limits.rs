use chrono::{DateTime, Utc};
use std::time::Duration;

use super::GovernanceViolation;
use crate::config::GovernanceConfig;
use crate::workflow::WorkflowState;

/// Per-workflow execution bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_duration: Duration,
    pub max_node_executions: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&GovernanceConfig::default())
    }
}

impl From<&GovernanceConfig> for ExecutionLimits {
    fn from(config: &GovernanceConfig) -> Self {
        Self {
            max_duration: Duration::from_secs(config.max_duration_secs),
            max_node_executions: config.max_node_executions,
        }
    }
}

impl ExecutionLimits {
    pub fn new(max_duration: Duration, max_node_executions: u64) -> Self {
        Self {
            max_duration,
            max_node_executions,
        }
    }

    /// Pre-node check. The deadline is measured from `state.started_at`, which is
    /// persisted with every checkpoint and therefore survives restarts.
    pub fn check(&self, state: &WorkflowState, now: DateTime<Utc>) -> Result<(), GovernanceViolation> {
        let elapsed = now
            .signed_duration_since(state.started_at)
            .to_std()
            .unwrap_or_default();

        if elapsed > self.max_duration {
            return Err(GovernanceViolation::Timeout {
                elapsed_secs: elapsed.as_secs(),
                limit_secs: self.max_duration.as_secs(),
            });
        }

        if state.node_execution_count >= self.max_node_executions {
            return Err(GovernanceViolation::StepLimitExceeded {
                limit: self.max_node_executions,
            });
        }

        Ok(())
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self, state: &WorkflowState, now: DateTime<Utc>) -> Duration {
        let elapsed = now
            .signed_duration_since(state.started_at)
            .to_std()
            .unwrap_or_default();
        self.max_duration.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_passes() {
        let limits = ExecutionLimits::new(Duration::from_secs(60), 10);
        let state = WorkflowState::new("t", "r");

        assert!(limits.check(&state, Utc::now()).is_ok());
    }

    #[test]
    fn test_deadline_exceeded() {
        let limits = ExecutionLimits::new(Duration::from_secs(60), 10);
        let state = WorkflowState::new("t", "r");
        let later = state.started_at + chrono::Duration::seconds(61);

        let violation = limits.check(&state, later).unwrap_err();
        assert_eq!(
            violation,
            GovernanceViolation::Timeout {
                elapsed_secs: 61,
                limit_secs: 60
            }
        );
        assert_eq!(limits.remaining(&state, later), Duration::ZERO);
    }

    #[test]
    fn test_step_ceiling_reached_at_limit() {
        let limits = ExecutionLimits::new(Duration::from_secs(60), 3);
        let mut state = WorkflowState::new("t", "r");

        state.node_execution_count = 2;
        assert!(limits.check(&state, Utc::now()).is_ok());

        state.node_execution_count = 3;
        assert_eq!(
            limits.check(&state, Utc::now()).unwrap_err(),
            GovernanceViolation::StepLimitExceeded { limit: 3 }
        );
    }

    #[test]
    fn test_clock_skew_does_not_trip_deadline() {
        let limits = ExecutionLimits::new(Duration::from_secs(1), 10);
        let state = WorkflowState::new("t", "r");
        let earlier = state.started_at - chrono::Duration::seconds(30);

        assert!(limits.check(&state, earlier).is_ok());
    }
}
