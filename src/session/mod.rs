//! Session management
//!
//! A session binds a client-visible id to a workflow thread, owns the live
//! event channel for that thread and serializes every engine invocation on it.
//! Sessions are process-local; the thread's checkpoints are what survive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::CodeflowConfig;
use crate::engine::WorkflowEngine;
use crate::governance::{CancelFlag, RequestRateLimiter};
use crate::telemetry::create_session_span;
use crate::workflow::{
    EventSink, ProtocolError, Step, WorkflowError, WorkflowEvent, WorkflowState, WorkflowStatus,
};

/// Human decision at a review pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Revise,
}

impl FromStr for ReviewAction {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(ReviewAction::Approve),
            "revise" => Ok(ReviewAction::Revise),
            other => Err(WorkflowError::validation(format!(
                "unknown review action '{other}', expected approve or revise"
            ))),
        }
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewAction::Approve => f.write_str("approve"),
            ReviewAction::Revise => f.write_str("revise"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Events buffered per session before slow subscribers start lagging
    pub event_capacity: usize,
    pub prune_on_completion: bool,
    pub keep_last: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            prune_on_completion: false,
            keep_last: 1,
        }
    }
}

impl From<&CodeflowConfig> for SessionOptions {
    fn from(config: &CodeflowConfig) -> Self {
        let mut options = SessionOptions::default();
        if let Some(database) = &config.database {
            options.prune_on_completion = database.prune_on_completion;
            options.keep_last = database.keep_last;
        }
        options
    }
}

struct Session {
    session_id: String,
    thread_id: String,
    client_identity: String,
    created_at: DateTime<Utc>,
    events: broadcast::Sender<WorkflowEvent>,
    /// Held for the whole duration of a start or resume
    run_lock: Arc<Mutex<()>>,
    cancel: CancelFlag,
    last_status: std::sync::Mutex<Option<WorkflowStatus>>,
}

impl Session {
    fn set_status(&self, status: WorkflowStatus) {
        if let Ok(mut last) = self.last_status.lock() {
            *last = Some(status);
        }
    }

    fn status(&self) -> Option<WorkflowStatus> {
        self.last_status.lock().ok().and_then(|last| *last)
    }

    fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            thread_id: self.thread_id.clone(),
            client_identity: self.client_identity.clone(),
            created_at: self.created_at,
            last_status: self.status(),
            busy: self.is_busy(),
        }
    }
}

/// Handle returned to the client that started a workflow
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: String,
    pub thread_id: String,
    /// Subscribed before the first node runs, so no event is missed
    pub events: broadcast::Receiver<WorkflowEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub thread_id: String,
    pub client_identity: String,
    pub created_at: DateTime<Utc>,
    pub last_status: Option<WorkflowStatus>,
    pub busy: bool,
}

/// Point-in-time view of a session, read from its latest checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub thread_id: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub generated_files: BTreeMap<String, String>,
    pub needs_review: bool,
    pub plan: Vec<Step>,
    /// None until the first checkpoint is written
    pub sequence: Option<u64>,
}

enum RunKind {
    Start(WorkflowState),
    Resume(String),
}

/// Owns every live session in this process
pub struct SessionManager {
    engine: Arc<WorkflowEngine>,
    rate_limiter: Arc<RequestRateLimiter>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    options: SessionOptions,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("engine", &self.engine)
            .field("rate_limiter", &self.rate_limiter)
            .field("options", &self.options)
            .finish()
    }
}

impl SessionManager {
    pub fn new(engine: Arc<WorkflowEngine>, rate_limiter: Arc<RequestRateLimiter>) -> Self {
        Self::with_options(engine, rate_limiter, SessionOptions::default())
    }

    pub fn with_options(
        engine: Arc<WorkflowEngine>,
        rate_limiter: Arc<RequestRateLimiter>,
        options: SessionOptions,
    ) -> Self {
        Self {
            engine,
            rate_limiter,
            sessions: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Validate, rate-limit, allocate a thread and start the workflow in the background
    pub async fn create_session(
        &self,
        user_request: &str,
        project_context: &str,
        client_identity: &str,
    ) -> Result<SessionTicket, WorkflowError> {
        if user_request.trim().is_empty() {
            return Err(WorkflowError::validation("request must not be empty"));
        }
        if project_context.trim().is_empty() {
            return Err(WorkflowError::validation("project context must not be empty"));
        }

        // Rejected clients never get a session or a thread
        self.rate_limiter.check(client_identity)?;

        let session_id = Uuid::new_v4().to_string();
        let thread_id = Uuid::new_v4().to_string();
        let session = self.register(&session_id, &thread_id, client_identity, None).await;

        let events = session.events.subscribe();
        let guard = Arc::clone(&session.run_lock).lock_owned().await;

        let state = WorkflowState::new(&thread_id, user_request).with_project_context(project_context);
        info!(
            session_id = %session_id,
            thread_id = %thread_id,
            client = %client_identity,
            "Session created"
        );
        self.spawn_run(session, guard, RunKind::Start(state));

        Ok(SessionTicket {
            session_id,
            thread_id,
            events,
        })
    }

    /// Record the human decision for a paused session and resume it in the background
    pub async fn submit_review(
        &self,
        session_id: &str,
        feedback: &str,
        action: ReviewAction,
    ) -> Result<(), WorkflowError> {
        let feedback = match action {
            ReviewAction::Approve => String::new(),
            ReviewAction::Revise if feedback.trim().is_empty() => {
                return Err(WorkflowError::validation("revise requires feedback text"));
            }
            ReviewAction::Revise => feedback.trim().to_string(),
        };

        let session = self.session(session_id).await?;
        let guard = Arc::clone(&session.run_lock).lock_owned().await;

        let latest = self
            .engine
            .store()
            .latest(&session.thread_id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound {
                thread_id: session.thread_id.clone(),
            })?;
        if latest.state.status != WorkflowStatus::Paused {
            return Err(ProtocolError::InvalidState {
                thread_id: session.thread_id.clone(),
                expected: WorkflowStatus::Paused,
                found: latest.state.status,
            }
            .into());
        }

        info!(
            session_id = %session_id,
            thread_id = %session.thread_id,
            action = %action,
            "Review submitted"
        );
        self.spawn_run(session, guard, RunKind::Resume(feedback));
        Ok(())
    }

    /// Another receiver for the session's events, starting from now
    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<WorkflowEvent>, WorkflowError> {
        Ok(self.session(session_id).await?.events.subscribe())
    }

    pub async fn status(&self, session_id: &str) -> Result<StatusReport, WorkflowError> {
        let session = self.session(session_id).await?;
        let latest = self.engine.store().latest(&session.thread_id).await?;

        let report = match latest {
            Some(checkpoint) => {
                let state = checkpoint.state;
                StatusReport {
                    session_id: session.session_id.clone(),
                    thread_id: session.thread_id.clone(),
                    status: state.status,
                    current_step: state.step_index,
                    total_steps: state.total_steps(),
                    needs_review: state.needs_review,
                    plan: state.plan,
                    generated_files: state.generated_files,
                    sequence: Some(checkpoint.sequence_number),
                }
            }
            // Started but the first node has not been checkpointed yet
            None => StatusReport {
                session_id: session.session_id.clone(),
                thread_id: session.thread_id.clone(),
                status: WorkflowStatus::Running,
                current_step: 0,
                total_steps: 0,
                generated_files: BTreeMap::new(),
                needs_review: false,
                plan: Vec::new(),
                sequence: None,
            },
        };
        Ok(report)
    }

    /// Ask the session's run to stop before its next node
    pub async fn cancel(&self, session_id: &str) -> Result<(), WorkflowError> {
        let session = self.session(session_id).await?;
        session.cancel.cancel();
        info!(session_id = %session_id, thread_id = %session.thread_id, "Session cancelled");
        Ok(())
    }

    /// Drop a session. Its checkpoints stay in the store.
    pub async fn close_session(&self, session_id: &str) -> Result<(), WorkflowError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| ProtocolError::UnknownSession {
                session_id: session_id.to_string(),
            })?;

        session.cancel.cancel();
        info!(session_id = %session_id, thread_id = %session.thread_id, "Session closed");
        Ok(())
    }

    /// Drop sessions whose workflow has finished; returns how many were removed
    pub async fn reap_finished(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            let finished = session.status().is_some_and(|status| status.is_terminal());
            !(finished && !session.is_busy())
        });
        let removed = before - sessions.len();
        self.rate_limiter.prune_idle_clients();
        if removed > 0 {
            debug!(removed, "Reaped finished sessions");
        }
        removed
    }

    /// Bind a new session to a thread started elsewhere, e.g. by another process
    pub async fn attach_thread(&self, thread_id: &str, client_identity: &str) -> Result<String, WorkflowError> {
        let latest = self
            .engine
            .store()
            .latest(thread_id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound {
                thread_id: thread_id.to_string(),
            })?;

        // Lookup and insert under one guard: a thread never gets two writers
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.values().find(|session| session.thread_id == thread_id) {
            return Ok(existing.session_id.clone());
        }

        let session_id = Uuid::new_v4().to_string();
        let session = self.new_session(&session_id, thread_id, client_identity, Some(latest.state.status));
        sessions.insert(session_id.clone(), session);
        drop(sessions);
        info!(session_id = %session_id, thread_id = %thread_id, "Attached session to existing thread");
        Ok(session_id)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Wait until no session has a run in flight
    pub async fn wait_idle(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            let _ = session.run_lock.lock().await;
        }
    }

    /// Cancel every session and wait for in-flight runs to reach a checkpoint
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        info!(sessions = sessions.len(), "Cancelling active sessions");
        for session in &sessions {
            session.cancel.cancel();
        }
        self.wait_idle().await;
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Session>, WorkflowError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                ProtocolError::UnknownSession {
                    session_id: session_id.to_string(),
                }
                .into()
            })
    }

    async fn register(
        &self,
        session_id: &str,
        thread_id: &str,
        client_identity: &str,
        last_status: Option<WorkflowStatus>,
    ) -> Arc<Session> {
        let session = self.new_session(session_id, thread_id, client_identity, last_status);
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    fn new_session(
        &self,
        session_id: &str,
        thread_id: &str,
        client_identity: &str,
        last_status: Option<WorkflowStatus>,
    ) -> Arc<Session> {
        let (events, _) = broadcast::channel(self.options.event_capacity.max(1));
        Arc::new(Session {
            session_id: session_id.to_string(),
            thread_id: thread_id.to_string(),
            client_identity: client_identity.to_string(),
            created_at: Utc::now(),
            events,
            run_lock: Arc::new(Mutex::new(())),
            cancel: CancelFlag::new(),
            last_status: std::sync::Mutex::new(last_status),
        })
    }

    /// Run the engine in the background while holding the session's run lock
    fn spawn_run(&self, session: Arc<Session>, guard: OwnedMutexGuard<()>, run: RunKind) {
        let engine = Arc::clone(&self.engine);
        let options = self.options.clone();
        let span = create_session_span(&session.session_id, &session.thread_id, &session.client_identity);

        tokio::spawn(
            async move {
                let _guard = guard;
                let sink = session.events.clone();

                let result = match run {
                    RunKind::Start(state) => {
                        engine
                            .start(&session.thread_id, state, &sink, &session.cancel)
                            .await
                    }
                    RunKind::Resume(feedback) => {
                        engine
                            .resume(&session.thread_id, &feedback, &sink, &session.cancel)
                            .await
                    }
                };

                match result {
                    Ok(result) => {
                        let status = result.status();
                        session.set_status(status);
                        debug!(status = %status, "Session run finished");

                        if status.is_terminal() && options.prune_on_completion {
                            match engine.store().prune(&session.thread_id, options.keep_last).await {
                                Ok(removed) => debug!(removed, "Pruned finished thread"),
                                Err(e) => warn!(error = %e, "Failed to prune finished thread"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!(code = e.code(), error = %e, "Session run failed");
                        sink.emit(WorkflowEvent::error(&session.thread_id, e.code(), e.to_string(), None));
                    }
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::RateLimitConfig;
    use crate::governance::ExecutionLimits;
    use crate::stages::{FnStage, Outcome, StageKind, StageOutcome, StageRegistry};
    use std::time::Duration;

    fn manager_with_limit(requests_per_window: u32) -> SessionManager {
        let registry = StageRegistry::with_builtins()
            .with(
                StageKind::Plan,
                FnStage::new(|mut state: WorkflowState| {
                    state.plan.push(Step::new("implement").with_target_file("string_utils.py"));
                    Ok(StageOutcome::next(state, StageKind::Generate))
                }),
            )
            .with(
                StageKind::Generate,
                FnStage::new(|mut state: WorkflowState| {
                    state.record_file("string_utils.py", "def is_anagram(a, b): ...");
                    state.complete_current_step();
                    Ok(StageOutcome::done(state, Outcome::Success))
                }),
            );
        let engine = WorkflowEngine::new(
            registry,
            Arc::new(MemoryCheckpointStore::new()),
            ExecutionLimits::default(),
        )
        .unwrap();
        let limiter = RequestRateLimiter::new(&RateLimitConfig {
            requests_per_window,
            window_secs: 3600,
        });
        SessionManager::new(Arc::new(engine), Arc::new(limiter))
    }

    async fn next_terminal(events: &mut broadcast::Receiver<WorkflowEvent>) -> WorkflowEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.ends_run() {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_session_pauses_then_completes_on_approve() {
        let manager = manager_with_limit(10);
        let mut ticket = manager.create_session("create anagram checker", "/tmp/project", "client").await.unwrap();

        assert!(matches!(next_terminal(&mut ticket.events).await, WorkflowEvent::ReviewRequired { .. }));
        let report = manager.status(&ticket.session_id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Paused);
        assert!(report.needs_review);

        manager
            .submit_review(&ticket.session_id, "ignored on approve", ReviewAction::Approve)
            .await
            .unwrap();
        assert!(matches!(next_terminal(&mut ticket.events).await, WorkflowEvent::WorkflowComplete { .. }));

        manager.wait_idle().await;
        let report = manager.status(&ticket.session_id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.generated_files.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_client_gets_no_session() {
        let manager = manager_with_limit(1);
        manager.create_session("first", ".", "10.0.0.1").await.unwrap();

        let err = manager.create_session("second", ".", "10.0.0.1").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(manager.session_count().await, 1);

        // Other clients are unaffected
        manager.create_session("third", ".", "10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_happens_before_allocation() {
        let manager = manager_with_limit(10);

        let err = manager.create_session("  ", ".", "c").await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        let err = manager.create_session("request", "", "c").await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_review_errors() {
        let manager = manager_with_limit(10);

        let unknown = manager
            .submit_review("missing", "", ReviewAction::Approve)
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), "not_found");

        let mut ticket = manager.create_session("r", ".", "c").await.unwrap();
        next_terminal(&mut ticket.events).await;

        let blank = manager
            .submit_review(&ticket.session_id, "   ", ReviewAction::Revise)
            .await
            .unwrap_err();
        assert_eq!(blank.code(), "validation_error");

        manager
            .submit_review(&ticket.session_id, "", ReviewAction::Approve)
            .await
            .unwrap();
        // Second approval waits for the first run, then finds a completed thread
        let twice = manager
            .submit_review(&ticket.session_id, "", ReviewAction::Approve)
            .await
            .unwrap_err();
        assert_eq!(twice.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_finished_sessions_are_reaped() {
        let manager = manager_with_limit(10);
        let mut ticket = manager.create_session("r", ".", "c").await.unwrap();
        next_terminal(&mut ticket.events).await;

        // Paused sessions are kept
        manager.wait_idle().await;
        assert_eq!(manager.reap_finished().await, 0);
        let listed = manager.list_sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_status, Some(WorkflowStatus::Paused));
        assert!(!listed[0].busy);

        manager
            .submit_review(&ticket.session_id, "", ReviewAction::Approve)
            .await
            .unwrap();
        manager.wait_idle().await;

        assert_eq!(manager.reap_finished().await, 1);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_reuses_existing_session_for_thread() {
        let manager = manager_with_limit(10);
        let mut ticket = manager.create_session("r", ".", "c").await.unwrap();
        next_terminal(&mut ticket.events).await;

        let attached = manager.attach_thread(&ticket.thread_id, "c").await.unwrap();
        assert_eq!(attached, ticket.session_id);

        let missing = manager.attach_thread("no-such-thread", "c").await.unwrap_err();
        assert_eq!(missing.code(), "not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attaches_share_one_session() {
        let manager = Arc::new(manager_with_limit(10));
        let mut paused = WorkflowState::new("elsewhere", "create anagram checker");
        paused.status = WorkflowStatus::Paused;
        paused.needs_review = true;
        paused.active_stage = StageKind::Review;
        manager.engine().store().append("elsewhere", &paused).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.attach_thread("elsewhere", &format!("client-{i}")).await
            }));
        }

        let mut session_ids = std::collections::HashSet::new();
        for handle in handles {
            session_ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(session_ids.len(), 1);
        assert_eq!(manager.session_count().await, 1);
    }

    #[test]
    fn test_review_action_parsing() {
        assert_eq!("Approve".parse::<ReviewAction>().unwrap(), ReviewAction::Approve);
        assert_eq!(" revise ".parse::<ReviewAction>().unwrap(), ReviewAction::Revise);
        assert!("reject".parse::<ReviewAction>().is_err());
    }
}
