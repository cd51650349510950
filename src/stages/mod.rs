//! Pluggable stage capabilities
//!
//! A stage is a function from the current [`WorkflowState`] to an updated state
//! plus a routing decision. The engine knows stages only by their [`StageKind`]
//! and by the [`Routing`] they return; what a stage actually produces (plans,
//! code, fixes) is supplied from outside the engine.

pub mod builtin;
pub mod command;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::workflow::WorkflowState;

pub use builtin::{OrchestratorStage, ReviewStage};
pub use command::CommandStage;
pub use registry::StageRegistry;

/// Closed set of stage roles in the workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Orchestrator,
    Plan,
    Generate,
    Debug,
    Review,
}

impl StageKind {
    /// Every workflow begins here
    pub const ENTRY: StageKind = StageKind::Orchestrator;
    /// The stage that always pauses for human input
    pub const REVIEW: StageKind = StageKind::Review;

    pub const ALL: [StageKind; 5] = [
        StageKind::Orchestrator,
        StageKind::Plan,
        StageKind::Generate,
        StageKind::Debug,
        StageKind::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Orchestrator => "orchestrator",
            StageKind::Plan => "plan",
            StageKind::Generate => "generate",
            StageKind::Debug => "debug",
            StageKind::Review => "review",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| StageError::InvalidOutput {
                reason: format!("unknown stage name '{s}'"),
            })
    }
}

/// How a terminal stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Where control goes after a stage returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", content = "target", rename_all = "snake_case")]
pub enum Routing {
    Next(StageKind),
    Interrupt,
    Done(Outcome),
}

/// Result of one stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub state: WorkflowState,
    pub routing: Routing,
}

impl StageOutcome {
    pub fn next(state: WorkflowState, stage: StageKind) -> Self {
        Self {
            state,
            routing: Routing::Next(stage),
        }
    }

    pub fn interrupt(state: WorkflowState) -> Self {
        Self {
            state,
            routing: Routing::Interrupt,
        }
    }

    pub fn done(state: WorkflowState, outcome: Outcome) -> Self {
        Self {
            state,
            routing: Routing::Done(outcome),
        }
    }
}

/// Errors raised by a stage capability
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{message}")]
    Failed { message: String },

    #[error("Invalid stage output: {reason}")]
    InvalidOutput { reason: String },

    #[error("Stage process exited with {exit_code:?}: {stderr}")]
    Process {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Stage did not finish within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed {
            message: message.into(),
        }
    }
}

/// Capability behind one named stage.
///
/// Implementations receive an owned copy of the state and must return the new
/// state rather than mutating shared data. The engine never retries a stage;
/// retry policy, if any, belongs to the implementation.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, state: WorkflowState) -> Result<StageOutcome, StageError>;
}

/// Adapts a plain function or closure into a [`Stage`]
pub struct FnStage<F> {
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(WorkflowState) -> Result<StageOutcome, StageError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(WorkflowState) -> Result<StageOutcome, StageError> + Send + Sync,
{
    async fn execute(&self, state: WorkflowState) -> Result<StageOutcome, StageError> {
        (self.func)(state)
    }
}
