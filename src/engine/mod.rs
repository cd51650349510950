//! Workflow engine
//!
//! Drives a thread through the stage graph one node at a time. Each node runs
//! governance checks, invokes the registered stage, records the result as a
//! checkpoint and only then notifies subscribers. The loop returns to the
//! caller at a pause or a terminal status; [`WorkflowEngine::resume`] picks the
//! thread up again from its latest checkpoint, in this or any other process.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::governance::{CancelFlag, ExecutionLimits, GovernanceViolation};
use crate::stages::{Outcome, Routing, StageError, StageKind, StageOutcome, StageRegistry};
use crate::telemetry::{create_workflow_span, OperationTimer};
use crate::workflow::{
    EventSink, Message, ProtocolError, Role, WorkflowError, WorkflowEvent, WorkflowState, WorkflowStatus,
};

/// Why a run stopped before reaching a pause or a successful completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Governance(GovernanceViolation),
    StageFailed { stage: StageKind, message: String },
    Cancelled,
}

impl HaltReason {
    pub fn code(&self) -> &'static str {
        match self {
            HaltReason::Governance(violation) => violation.code(),
            HaltReason::StageFailed { .. } => "stage_error",
            HaltReason::Cancelled => "cancelled",
        }
    }

    fn status(&self) -> WorkflowStatus {
        match self {
            HaltReason::Governance(GovernanceViolation::Timeout { .. }) => WorkflowStatus::TimedOut,
            _ => WorkflowStatus::Failed,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Governance(violation) => write!(f, "{violation}"),
            HaltReason::StageFailed { stage, message } => write!(f, "stage '{stage}' failed: {message}"),
            HaltReason::Cancelled => f.write_str("workflow cancelled"),
        }
    }
}

/// Outcome of one `start` or `resume` call
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub thread_id: String,
    pub state: WorkflowState,
    /// Sequence number of the last checkpoint written by this call
    pub sequence: Option<u64>,
    pub halt: Option<HaltReason>,
}

impl ExecutionResult {
    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }
}

/// The control core: stage registry plus checkpoint store plus bounds.
///
/// Not reentrant per thread. Callers must serialize `start`/`resume` for the
/// same thread id; distinct threads may run concurrently.
pub struct WorkflowEngine {
    registry: Arc<StageRegistry>,
    store: Arc<dyn CheckpointStore>,
    limits: ExecutionLimits,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("backend", &self.store.backend())
            .field("limits", &self.limits)
            .finish()
    }
}

impl WorkflowEngine {
    /// Build an engine; the entry and review stages must be registered
    pub fn new(
        registry: StageRegistry,
        store: Arc<dyn CheckpointStore>,
        limits: ExecutionLimits,
    ) -> Result<Self, WorkflowError> {
        for required in [StageKind::ENTRY, StageKind::REVIEW] {
            if !registry.contains(required) {
                return Err(WorkflowError::UnregisteredStage { stage: required });
            }
        }

        Ok(Self {
            registry: Arc::new(registry),
            store,
            limits,
        })
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Run a new thread from the entry stage until it pauses or terminates
    pub async fn start(
        &self,
        thread_id: &str,
        initial_state: WorkflowState,
        events: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<ExecutionResult, WorkflowError> {
        if initial_state.status != WorkflowStatus::Running {
            return Err(WorkflowError::validation(format!(
                "initial state must be {}, found {}",
                WorkflowStatus::Running,
                initial_state.status
            )));
        }
        if initial_state.user_request.trim().is_empty() {
            return Err(WorkflowError::validation("user request is empty"));
        }
        if self.store.latest(thread_id).await?.is_some() {
            return Err(ProtocolError::AlreadyStarted {
                thread_id: thread_id.to_string(),
            }
            .into());
        }

        let mut state = initial_state;
        state.thread_id = thread_id.to_string();
        state.active_stage = StageKind::ENTRY;
        state.needs_review = false;
        state.review_feedback = None;

        let span = create_workflow_span(thread_id, "start");
        async move {
            info!(request = %state.user_request, "Starting workflow");
            self.run(state, events, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Continue a paused thread with human feedback.
    ///
    /// The feedback is injected as `review_feedback`; an empty string means
    /// approval to the built-in review stage.
    pub async fn resume(
        &self,
        thread_id: &str,
        feedback: &str,
        events: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<ExecutionResult, WorkflowError> {
        let checkpoint = self
            .store
            .latest(thread_id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound {
                thread_id: thread_id.to_string(),
            })?;

        let from_sequence = checkpoint.sequence_number;
        let mut state = checkpoint.state;
        if state.status != WorkflowStatus::Paused {
            return Err(ProtocolError::InvalidState {
                thread_id: thread_id.to_string(),
                expected: WorkflowStatus::Paused,
                found: state.status,
            }
            .into());
        }

        state.review_feedback = Some(feedback.to_string());
        state.needs_review = false;
        state.status = WorkflowStatus::Running;

        let span = create_workflow_span(thread_id, "resume");
        async move {
            info!(
                from_sequence,
                stage = %state.active_stage,
                approve = feedback.trim().is_empty(),
                "Resuming workflow"
            );
            self.run(state, events, cancel).await
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        mut state: WorkflowState,
        events: &dyn EventSink,
        cancel: &CancelFlag,
    ) -> Result<ExecutionResult, WorkflowError> {
        let timer = OperationTimer::new("workflow_run");

        let result = loop {
            if cancel.is_cancelled() {
                break self.halt(state, HaltReason::Cancelled, events).await?;
            }
            if let Err(violation) = self.limits.check(&state, Utc::now()) {
                break self.halt(state, HaltReason::Governance(violation), events).await?;
            }

            let stage = state.active_stage;
            let capability = self
                .registry
                .get(stage)
                .ok_or(WorkflowError::UnregisteredStage { stage })?;

            debug!(stage = %stage, node = state.node_execution_count + 1, "Executing stage");
            let outcome = match capability.execute(state.clone()).await {
                Ok(outcome) => self.validate(outcome),
                Err(e) => Err(e),
            };

            let StageOutcome { state: mut next, routing } = match outcome {
                Ok(outcome) => outcome,
                Err(e) => break self.fail_stage(state, stage, e, events).await?,
            };

            // Engine-owned fields are never taken from stage output
            next.thread_id = state.thread_id.clone();
            next.started_at = state.started_at;
            next.node_execution_count = state.node_execution_count + 1;
            // Feedback belongs to the node it was resumed into
            next.review_feedback = None;

            let routing = enforce_review_policy(stage, routing);
            apply_routing(&mut next, stage, routing);
            if let Err(reason) = next.check_invariants() {
                let error = StageError::InvalidOutput { reason };
                break self.fail_stage(state, stage, error, events).await?;
            }

            let sequence = self.persist(&next).await?;
            events.emit(WorkflowEvent::step_update(&next, sequence, stage));

            match next.status {
                WorkflowStatus::Running => {
                    state = next;
                }
                WorkflowStatus::Paused => {
                    info!(
                        sequence,
                        stage = %stage,
                        budget_left_secs = self.limits.remaining(&next, Utc::now()).as_secs(),
                        "Workflow paused for review"
                    );
                    events.emit(WorkflowEvent::review_required(&next, sequence));
                    break ExecutionResult {
                        thread_id: next.thread_id.clone(),
                        state: next,
                        sequence: Some(sequence),
                        halt: None,
                    };
                }
                WorkflowStatus::Completed => {
                    info!(sequence, files = next.generated_files.len(), "Workflow completed");
                    events.emit(WorkflowEvent::workflow_complete(&next, sequence));
                    break ExecutionResult {
                        thread_id: next.thread_id.clone(),
                        state: next,
                        sequence: Some(sequence),
                        halt: None,
                    };
                }
                WorkflowStatus::Failed | WorkflowStatus::TimedOut => {
                    let reason = HaltReason::StageFailed {
                        stage,
                        message: "stage reported failure".to_string(),
                    };
                    warn!(sequence, stage = %stage, "Workflow finished with failure");
                    events.emit(WorkflowEvent::error(
                        &next.thread_id,
                        reason.code(),
                        reason.to_string(),
                        Some(next.status),
                    ));
                    break ExecutionResult {
                        thread_id: next.thread_id.clone(),
                        state: next,
                        sequence: Some(sequence),
                        halt: Some(reason),
                    };
                }
            }
        };

        info!(
            status = %result.state.status,
            nodes = result.state.node_execution_count,
            "Workflow run returned"
        );
        timer.finish();
        Ok(result)
    }

    /// Reject stage output that routes to a stage nobody registered
    fn validate(&self, outcome: StageOutcome) -> Result<StageOutcome, StageError> {
        if let Routing::Next(target) = outcome.routing {
            if !self.registry.contains(target) {
                return Err(StageError::InvalidOutput {
                    reason: format!("routed to unregistered stage '{target}'"),
                });
            }
        }
        Ok(outcome)
    }

    /// A stage raised an error: record it, mark the thread FAILED, checkpoint
    async fn fail_stage(
        &self,
        mut state: WorkflowState,
        stage: StageKind,
        error: StageError,
        events: &dyn EventSink,
    ) -> Result<ExecutionResult, WorkflowError> {
        let message = error.to_string();
        warn!(stage = %stage, error = %message, "Stage failed");

        state.push_message(Message::from_stage(
            stage,
            Role::System,
            format!("Stage '{stage}' failed: {message}"),
        ));
        state.node_execution_count += 1;
        state.status = WorkflowStatus::Failed;
        state.needs_review = false;

        let sequence = self.persist(&state).await?;
        events.emit(WorkflowEvent::step_update(&state, sequence, stage));

        let reason = HaltReason::StageFailed { stage, message };
        events.emit(WorkflowEvent::error(
            &state.thread_id,
            reason.code(),
            reason.to_string(),
            Some(state.status),
        ));

        Ok(ExecutionResult {
            thread_id: state.thread_id.clone(),
            state,
            sequence: Some(sequence),
            halt: Some(reason),
        })
    }

    /// Stop before the next node. Not a node execution, so the count is unchanged.
    async fn halt(
        &self,
        mut state: WorkflowState,
        reason: HaltReason,
        events: &dyn EventSink,
    ) -> Result<ExecutionResult, WorkflowError> {
        warn!(
            code = reason.code(),
            stage = %state.active_stage,
            nodes = state.node_execution_count,
            "Workflow halted: {}",
            reason
        );

        state.push_message(Message::new(Role::System, format!("Workflow halted: {reason}")));
        state.status = reason.status();
        state.needs_review = false;

        let sequence = self.persist(&state).await?;
        events.emit(WorkflowEvent::error(
            &state.thread_id,
            reason.code(),
            reason.to_string(),
            Some(state.status),
        ));

        Ok(ExecutionResult {
            thread_id: state.thread_id.clone(),
            state,
            sequence: Some(sequence),
            halt: Some(reason),
        })
    }

    async fn persist(&self, state: &WorkflowState) -> Result<u64, WorkflowError> {
        self.store.append(&state.thread_id, state).await.map_err(|e| {
            error!(
                thread_id = %state.thread_id,
                error = %e,
                "Checkpoint write failed; aborting run"
            );
            WorkflowError::Persistence(e)
        })
    }
}

/// Nothing completes successfully without passing through review
fn enforce_review_policy(stage: StageKind, routing: Routing) -> Routing {
    match routing {
        Routing::Done(Outcome::Success) if stage != StageKind::REVIEW => Routing::Next(StageKind::REVIEW),
        other => other,
    }
}

fn apply_routing(state: &mut WorkflowState, stage: StageKind, routing: Routing) {
    match routing {
        Routing::Interrupt => {
            // Resume re-enters the stage that asked for input
            state.active_stage = stage;
            state.status = WorkflowStatus::Paused;
            state.needs_review = true;
        }
        Routing::Done(Outcome::Success) => {
            state.status = WorkflowStatus::Completed;
            state.needs_review = false;
        }
        Routing::Done(Outcome::Failure) => {
            state.status = WorkflowStatus::Failed;
            state.needs_review = false;
        }
        Routing::Next(target) => {
            state.active_stage = target;
            state.status = WorkflowStatus::Running;
            state.needs_review = false;
        }
    }
}
