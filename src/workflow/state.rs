use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::stages::StageKind;

/// Lifecycle status of a workflow thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
}

impl WorkflowStatus {
    /// Terminal statuses never run another node
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Paused => "PAUSED",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One unit of planned work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub instruction: String,
    /// File this step is expected to produce or touch
    #[serde(default)]
    pub target_file: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl Step {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            target_file: None,
            completed: false,
        }
    }

    pub fn with_target_file(mut self, target_file: impl Into<String>) -> Self {
        self.target_file = Some(target_file.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Role-tagged entry in the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub stage: Option<StageKind>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            stage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_stage(stage: StageKind, role: Role, content: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(role, content)
        }
    }
}

/// The single object threaded through every stage of a workflow.
///
/// Stages receive an owned copy and hand back a new value; the engine is the
/// only writer of `status`, `needs_review` and `node_execution_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub thread_id: String,
    pub user_request: String,
    #[serde(default)]
    pub project_context: Option<String>,
    #[serde(default)]
    pub plan: Vec<Step>,
    #[serde(default)]
    pub generated_files: BTreeMap<String, String>,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    pub active_stage: StageKind,
    #[serde(default)]
    pub step_index: usize,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub review_feedback: Option<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub node_execution_count: u64,
    pub started_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state positioned at the entry stage
    pub fn new(thread_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_request: user_request.into(),
            project_context: None,
            plan: Vec::new(),
            generated_files: BTreeMap::new(),
            conversation_history: Vec::new(),
            active_stage: StageKind::ENTRY,
            step_index: 0,
            needs_review: false,
            review_feedback: None,
            status: WorkflowStatus::Running,
            node_execution_count: 0,
            started_at: Utc::now(),
        }
    }

    pub fn with_project_context(mut self, project_context: impl Into<String>) -> Self {
        self.project_context = Some(project_context.into());
        self
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.get(self.step_index)
    }

    pub fn total_steps(&self) -> usize {
        self.plan.len()
    }

    pub fn completed_steps(&self) -> usize {
        self.plan.iter().filter(|step| step.completed).count()
    }

    /// True once the cursor has moved past every planned step
    pub fn plan_exhausted(&self) -> bool {
        self.step_index >= self.plan.len()
    }

    /// Mark the step under the cursor complete and advance the cursor.
    /// Returns false when there is no step to complete.
    pub fn complete_current_step(&mut self) -> bool {
        match self.plan.get_mut(self.step_index) {
            Some(step) => {
                step.completed = true;
                self.step_index += 1;
                true
            }
            None => false,
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.conversation_history.push(message);
    }

    pub fn record_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.generated_files.insert(path.into(), content.into());
    }

    /// Check the structural invariants of the data model
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.step_index > self.plan.len() {
            return Err(format!(
                "step_index {} is outside plan of length {}",
                self.step_index,
                self.plan.len()
            ));
        }
        if self.needs_review && self.status != WorkflowStatus::Paused {
            return Err(format!(
                "needs_review is set while status is {}",
                self.status
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_at_entry() {
        let state = WorkflowState::new("thread-1", "create anagram checker");

        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.active_stage, StageKind::ENTRY);
        assert_eq!(state.node_execution_count, 0);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_complete_current_step_advances_cursor() {
        let mut state = WorkflowState::new("thread-1", "two steps");
        state.plan = vec![Step::new("first"), Step::new("second")];

        assert!(state.complete_current_step());
        assert_eq!(state.step_index, 1);
        assert!(state.plan[0].completed);
        assert!(!state.plan_exhausted());

        assert!(state.complete_current_step());
        assert!(state.plan_exhausted());
        assert!(!state.complete_current_step());
        assert_eq!(state.step_index, 2);
    }

    #[test]
    fn test_invariant_violations_are_reported() {
        let mut state = WorkflowState::new("thread-1", "bad");
        state.step_index = 3;
        assert!(state.check_invariants().is_err());

        state.step_index = 0;
        state.needs_review = true;
        assert!(state.check_invariants().is_err());

        state.status = WorkflowStatus::Paused;
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&WorkflowStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
        assert!(WorkflowStatus::TimedOut.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }
}
