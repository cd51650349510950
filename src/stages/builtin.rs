use async_trait::async_trait;
use tracing::{debug, info};

use super::{Outcome, Stage, StageError, StageKind, StageOutcome};
use crate::workflow::{Message, Role, WorkflowState};

/// Entry stage: records the request in the conversation and hands off to planning
#[derive(Debug, Default, Clone, Copy)]
pub struct OrchestratorStage;

#[async_trait]
impl Stage for OrchestratorStage {
    async fn execute(&self, mut state: WorkflowState) -> Result<StageOutcome, StageError> {
        if state.user_request.trim().is_empty() {
            return Err(StageError::failed("workflow started without a request"));
        }

        let already_recorded = state
            .conversation_history
            .iter()
            .any(|message| message.role == Role::User && message.content == state.user_request);

        if !already_recorded {
            let request = state.user_request.clone();
            state.push_message(Message::from_stage(StageKind::Orchestrator, Role::User, request));
        }

        debug!(thread_id = %state.thread_id, "Orchestrator dispatching to planning");
        Ok(StageOutcome::next(state, StageKind::Plan))
    }
}

/// Human review gate.
///
/// First visit always interrupts. When re-entered after a resume, empty
/// feedback approves the work and finishes the workflow; any other feedback
/// is recorded as a user message and sends control back to planning with the
/// existing plan intact.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReviewStage;

#[async_trait]
impl Stage for ReviewStage {
    async fn execute(&self, mut state: WorkflowState) -> Result<StageOutcome, StageError> {
        match state.review_feedback.take() {
            None => {
                let summary = format!(
                    "Review required: {} of {} steps complete, {} files generated",
                    state.completed_steps(),
                    state.total_steps(),
                    state.generated_files.len()
                );
                state.push_message(Message::from_stage(StageKind::Review, Role::System, summary));
                Ok(StageOutcome::interrupt(state))
            }
            Some(feedback) if feedback.trim().is_empty() => {
                info!(thread_id = %state.thread_id, "Work approved by reviewer");
                state.push_message(Message::from_stage(
                    StageKind::Review,
                    Role::System,
                    format!(
                        "Workflow approved. {} files created or modified.",
                        state.generated_files.len()
                    ),
                ));
                Ok(StageOutcome::done(state, Outcome::Success))
            }
            Some(feedback) => {
                info!(
                    thread_id = %state.thread_id,
                    feedback_len = feedback.len(),
                    "Reviewer requested changes"
                );
                state.push_message(Message::from_stage(StageKind::Review, Role::User, feedback));
                Ok(StageOutcome::next(state, StageKind::Plan))
            }
        }
    }
}
