//! End-to-end workflow lifecycle tests
//!
//! Drive the engine through the full generate -> review -> approve/revise
//! loop with scripted stages and check what ends up in the checkpoint log.

use anyhow::Result;
use std::sync::{Arc, Mutex};

use codeflow::{
    open_store, CancelFlag, CheckpointStore, CodeflowConfig, ExecutionLimits, FnStage, MemoryCheckpointStore,
    Message, Outcome, Role, StageKind, StageOutcome, StageRegistry, Step, StoreBackend, WorkflowEngine,
    WorkflowEvent, WorkflowState, WorkflowStatus,
};

const ANAGRAM_FILE: &str = "string_utils.py";
const ANAGRAM_CODE: &str = "def is_anagram(a: str, b: str) -> bool:\n    return sorted(a) == sorted(b)\n";

/// Planning stage that adds one step per request or revision and records what it saw
fn scripted_registry(seen_by_planner: Arc<Mutex<Vec<Vec<Message>>>>) -> StageRegistry {
    StageRegistry::with_builtins()
        .with(
            StageKind::Plan,
            FnStage::new(move |mut state: WorkflowState| {
                seen_by_planner
                    .lock()
                    .unwrap()
                    .push(state.conversation_history.clone());

                let instruction = match state.conversation_history.last() {
                    Some(message) if message.role == Role::User && !state.plan.is_empty() => {
                        format!("Revise: {}", message.content)
                    }
                    _ => "Implement is_anagram".to_string(),
                };
                state.plan.push(Step::new(instruction).with_target_file(ANAGRAM_FILE));
                Ok(StageOutcome::next(state, StageKind::Generate))
            }),
        )
        .with(
            StageKind::Generate,
            FnStage::new(|mut state: WorkflowState| {
                let content = match state.current_step() {
                    Some(step) if step.instruction.starts_with("Revise") => {
                        format!("{ANAGRAM_CODE}# {}\n", step.instruction)
                    }
                    _ => ANAGRAM_CODE.to_string(),
                };
                state.record_file(ANAGRAM_FILE, content);
                state.complete_current_step();

                if state.plan_exhausted() {
                    Ok(StageOutcome::done(state, Outcome::Success))
                } else {
                    Ok(StageOutcome::next(state, StageKind::Generate))
                }
            }),
        )
}

fn engine(store: Arc<dyn CheckpointStore>) -> (WorkflowEngine, Arc<Mutex<Vec<Vec<Message>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new(scripted_registry(Arc::clone(&seen)), store, ExecutionLimits::default())
        .expect("entry and review are registered");
    (engine, seen)
}

#[tokio::test]
async fn test_anagram_request_pauses_then_completes_on_approve() -> Result<()> {
    let (engine, _) = engine(Arc::new(MemoryCheckpointStore::new()));
    let cancel = CancelFlag::new();
    let events = Mutex::new(Vec::new());

    let paused = engine
        .start("anagram", WorkflowState::new("anagram", "create anagram checker"), &events, &cancel)
        .await?;

    assert_eq!(paused.status(), WorkflowStatus::Paused);
    assert!(paused.state.needs_review);
    assert_eq!(paused.state.total_steps(), 1);
    assert_eq!(paused.state.generated_files.get(ANAGRAM_FILE).map(String::as_str), Some(ANAGRAM_CODE));

    let completed = engine.resume("anagram", "", &events, &cancel).await?;

    assert_eq!(completed.status(), WorkflowStatus::Completed);
    assert!(!completed.state.needs_review);
    assert_eq!(completed.state.generated_files, paused.state.generated_files);
    // Only the review stage ran on approval
    assert_eq!(completed.state.node_execution_count, paused.state.node_execution_count + 1);

    let events = events.into_inner().unwrap();
    assert!(matches!(events.last(), Some(WorkflowEvent::WorkflowComplete { .. })));
    Ok(())
}

#[tokio::test]
async fn test_revise_feeds_feedback_to_planner_and_pauses_again() -> Result<()> {
    let (engine, seen_by_planner) = engine(Arc::new(MemoryCheckpointStore::new()));
    let cancel = CancelFlag::new();
    let events = Mutex::new(Vec::new());

    let first = engine
        .start("revise", WorkflowState::new("revise", "create anagram checker"), &events, &cancel)
        .await?;
    assert_eq!(first.state.step_index, 1);

    let second = engine.resume("revise", "add type hints", &events, &cancel).await?;

    assert_eq!(second.status(), WorkflowStatus::Paused);
    assert_eq!(second.state.total_steps(), 2);
    assert!(second.state.plan[0].completed);
    assert_eq!(second.state.step_index, 2);
    assert!(second.state.generated_files[ANAGRAM_FILE].contains("add type hints"));

    let seen = seen_by_planner.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let feedback = seen[1].last().expect("planner saw the conversation");
    assert_eq!(feedback.role, Role::User);
    assert_eq!(feedback.content, "add type hints");

    let events = events.into_inner().unwrap();
    let reviews = events
        .iter()
        .filter(|event| matches!(event, WorkflowEvent::ReviewRequired { .. }))
        .count();
    assert_eq!(reviews, 2);
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_log_is_ordered_and_replays_state() -> Result<()> {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let (engine, _) = engine(Arc::clone(&store));
    let cancel = CancelFlag::new();
    let events = Mutex::new(Vec::new());

    engine
        .start("log", WorkflowState::new("log", "create anagram checker"), &events, &cancel)
        .await?;
    engine.resume("log", "add type hints", &events, &cancel).await?;
    engine.resume("log", "", &events, &cancel).await?;

    let history = store.history("log").await?;
    assert!(history.windows(2).all(|pair| pair[0].sequence_number < pair[1].sequence_number));
    assert!(history
        .windows(2)
        .all(|pair| pair[0].state.node_execution_count < pair[1].state.node_execution_count));
    assert_eq!(history.last().map(|c| c.state.status), Some(WorkflowStatus::Completed));

    // Every step update was announced after its checkpoint existed
    let events = events.into_inner().unwrap();
    for event in &events {
        if let WorkflowEvent::StepUpdate { sequence, status, .. } = event {
            let checkpoint = history
                .iter()
                .find(|c| c.sequence_number == *sequence)
                .expect("event refers to a stored checkpoint");
            assert_eq!(checkpoint.state.status, *status);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_volatile_fallback_still_completes_end_to_end() -> Result<()> {
    let opened = open_store(&CodeflowConfig::default()).await;
    assert_eq!(opened.backend, StoreBackend::Volatile);

    let (engine, _) = engine(opened.store);
    let cancel = CancelFlag::new();
    let events = Mutex::new(Vec::new());

    engine
        .start("fallback", WorkflowState::new("fallback", "create anagram checker"), &events, &cancel)
        .await?;
    let done = engine.resume("fallback", "", &events, &cancel).await?;

    assert_eq!(done.status(), WorkflowStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_paused_thread_times_out_on_late_resume() -> Result<()> {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let (engine, _) = engine(Arc::clone(&store));
    let cancel = CancelFlag::new();
    let events = Mutex::new(Vec::new());

    let mut state = WorkflowState::new("slow", "create anagram checker");
    state.started_at = chrono::Utc::now() - chrono::Duration::hours(25);
    state.status = WorkflowStatus::Paused;
    state.needs_review = true;
    state.active_stage = StageKind::Review;
    store.append("slow", &state).await?;

    let result = engine.resume("slow", "", &events, &cancel).await?;

    assert_eq!(result.status(), WorkflowStatus::TimedOut);
    assert_eq!(result.state.node_execution_count, 0);
    match events.into_inner().unwrap().last() {
        Some(WorkflowEvent::Error { code, status, .. }) => {
            assert_eq!(code, "timeout");
            assert_eq!(*status, Some(WorkflowStatus::TimedOut));
        }
        other => panic!("expected timeout error event, got {other:?}"),
    }
    Ok(())
}
