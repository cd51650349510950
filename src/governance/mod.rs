//! Bounds on workflow execution
//!
//! - [`ExecutionLimits`]: per-workflow wall-clock deadline and node-execution ceiling,
//!   checked by the engine before every node.
//! - [`RequestRateLimiter`]: per-client ceiling on workflow starts, checked before a
//!   session is created.
//! - [`CancelFlag`]: caller-controlled stop signal honoured between nodes.

pub mod limits;
pub mod rate_limit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use limits::ExecutionLimits;
pub use rate_limit::RequestRateLimiter;

/// A bound that stopped or rejected a workflow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GovernanceViolation {
    #[error("workflow exceeded its {limit_secs}s time budget after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64, limit_secs: u64 },

    #[error("step limit exceeded: {limit} node executions reached")]
    StepLimitExceeded { limit: u64 },

    #[error("client {client} exceeded {limit} workflow starts per {window_secs}s")]
    RateLimited {
        client: String,
        limit: u32,
        window_secs: u64,
    },
}

impl GovernanceViolation {
    pub fn code(&self) -> &'static str {
        match self {
            GovernanceViolation::Timeout { .. } => "timeout",
            GovernanceViolation::StepLimitExceeded { .. } => "step_limit_exceeded",
            GovernanceViolation::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Cooperative cancellation shared between a session and its running loop
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
