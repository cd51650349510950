use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{Step, WorkflowState, WorkflowStatus};
use crate::stages::StageKind;

/// Progress pushed to session subscribers, in emission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepUpdate {
        thread_id: String,
        sequence: u64,
        stage: StageKind,
        next_stage: StageKind,
        status: WorkflowStatus,
        current_step: usize,
        total_steps: usize,
        plan: Vec<Step>,
        generated_files: Vec<String>,
        needs_review: bool,
    },
    ReviewRequired {
        thread_id: String,
        sequence: u64,
        plan: Vec<Step>,
        generated_files: BTreeMap<String, String>,
    },
    WorkflowComplete {
        thread_id: String,
        sequence: u64,
        generated_files: BTreeMap<String, String>,
    },
    Error {
        thread_id: String,
        code: String,
        message: String,
        #[serde(default)]
        status: Option<WorkflowStatus>,
    },
}

impl WorkflowEvent {
    pub fn step_update(state: &WorkflowState, sequence: u64, stage: StageKind) -> Self {
        WorkflowEvent::StepUpdate {
            thread_id: state.thread_id.clone(),
            sequence,
            stage,
            next_stage: state.active_stage,
            status: state.status,
            current_step: state.step_index,
            total_steps: state.total_steps(),
            plan: state.plan.clone(),
            generated_files: state.generated_files.keys().cloned().collect(),
            needs_review: state.needs_review,
        }
    }

    pub fn review_required(state: &WorkflowState, sequence: u64) -> Self {
        WorkflowEvent::ReviewRequired {
            thread_id: state.thread_id.clone(),
            sequence,
            plan: state.plan.clone(),
            generated_files: state.generated_files.clone(),
        }
    }

    pub fn workflow_complete(state: &WorkflowState, sequence: u64) -> Self {
        WorkflowEvent::WorkflowComplete {
            thread_id: state.thread_id.clone(),
            sequence,
            generated_files: state.generated_files.clone(),
        }
    }

    pub fn error(
        thread_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        status: Option<WorkflowStatus>,
    ) -> Self {
        WorkflowEvent::Error {
            thread_id: thread_id.into(),
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    /// Events after which the current run has returned control
    pub fn ends_run(&self) -> bool {
        !matches!(self, WorkflowEvent::StepUpdate { .. })
    }

    pub fn thread_id(&self) -> &str {
        match self {
            WorkflowEvent::StepUpdate { thread_id, .. }
            | WorkflowEvent::ReviewRequired { thread_id, .. }
            | WorkflowEvent::WorkflowComplete { thread_id, .. }
            | WorkflowEvent::Error { thread_id, .. } => thread_id,
        }
    }
}

/// Destination for engine progress events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

impl EventSink for broadcast::Sender<WorkflowEvent> {
    fn emit(&self, event: WorkflowEvent) {
        // No live subscriber is not an error; status stays queryable from checkpoints
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<WorkflowEvent> {
    fn emit(&self, event: WorkflowEvent) {
        let _ = self.send(event);
    }
}

impl EventSink for Mutex<Vec<WorkflowEvent>> {
    fn emit(&self, event: WorkflowEvent) {
        if let Ok(mut events) = self.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_by_type() {
        let mut state = WorkflowState::new("t-1", "r");
        state.record_file("string_utils.py", "def is_anagram(a, b): ...");

        let value = serde_json::to_value(WorkflowEvent::review_required(&state, 4)).unwrap();
        assert_eq!(value["type"], "review_required");
        assert_eq!(value["sequence"], 4);
        assert!(value["generated_files"]["string_utils.py"].is_string());

        let error = serde_json::to_value(WorkflowEvent::error("t-1", "timeout", "too slow", None)).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "timeout");
    }

    #[test]
    fn test_step_update_reports_cursor_and_file_names() {
        let mut state = WorkflowState::new("t-1", "r");
        state.plan = vec![Step::new("a"), Step::new("b")];
        state.complete_current_step();
        state.record_file("a.py", "x");

        match WorkflowEvent::step_update(&state, 2, StageKind::Generate) {
            WorkflowEvent::StepUpdate {
                current_step,
                total_steps,
                generated_files,
                ..
            } => {
                assert_eq!(current_step, 1);
                assert_eq!(total_steps, 2);
                assert_eq!(generated_files, vec!["a.py".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_mutex_sink_collects_in_order() {
        let sink = Mutex::new(Vec::new());
        sink.emit(WorkflowEvent::error("a", "x", "first", None));
        sink.emit(WorkflowEvent::error("a", "x", "second", None));

        let events = sink.into_inner().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.ends_run()));
        assert_eq!(events[0].thread_id(), "a");
    }
}
