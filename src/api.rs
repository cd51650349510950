//! Client workflow API
//!
//! Request and response payloads for the client-facing operations, plus a
//! [`WorkflowApi`] facade that maps them onto the [`SessionManager`]. Wire
//! framing (HTTP, WebSocket) is left to the embedding transport; every payload
//! here is plain serde so any transport can carry it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::checkpoint::{Checkpoint, StoreBackend};
use crate::config::ClientConfig;
use crate::session::{ReviewAction, SessionManager, StatusReport};
use crate::stages::StageKind;
use crate::workflow::{WorkflowError, WorkflowEvent, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub request: String,
    pub project_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub thread_id: String,
    /// Where a transport serves this session's push channel
    pub stream_url: String,
}

pub type StatusResponse = StatusReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub session_id: String,
    #[serde(default)]
    pub feedback: String,
    pub action: ReviewAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: String,
    pub accepted: bool,
}

/// Client-visible failure with a stable machine code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    /// Suggested HTTP status for transports that need one
    pub fn http_status(&self) -> u16 {
        match self.code.as_str() {
            "validation_error" => 400,
            "not_found" => 404,
            "invalid_state" => 409,
            "rate_limited" => 429,
            _ => 500,
        }
    }
}

impl From<WorkflowError> for ErrorResponse {
    fn from(error: WorkflowError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub backend: StoreBackend,
    /// False when running on the volatile fallback: a restart loses history
    pub crash_recovery: bool,
    #[serde(default)]
    pub fallback_reason: Option<String>,
    pub active_sessions: usize,
}

/// One entry of a thread's audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub sequence_number: u64,
    pub status: WorkflowStatus,
    pub active_stage: StageKind,
    pub node_execution_count: u64,
    pub current_step: usize,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    pub writer: String,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            sequence_number: checkpoint.sequence_number,
            status: checkpoint.state.status,
            active_stage: checkpoint.state.active_stage,
            node_execution_count: checkpoint.state.node_execution_count,
            current_step: checkpoint.state.step_index,
            total_steps: checkpoint.state.total_steps(),
            created_at: checkpoint.created_at,
            writer: checkpoint.writer.clone(),
        }
    }
}

/// A started workflow and its push channel
#[derive(Debug)]
pub struct Started {
    pub response: StartResponse,
    pub events: broadcast::Receiver<WorkflowEvent>,
}

/// Transport-neutral entry point for clients
#[derive(Debug, Clone)]
pub struct WorkflowApi {
    sessions: Arc<SessionManager>,
    fallback_reason: Option<String>,
    base_url: String,
}

impl WorkflowApi {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            fallback_reason: None,
            base_url: ClientConfig::default().base_url,
        }
    }

    /// Backend address advertised to clients in start responses
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Remember why the durable store was not used, for health reports
    pub fn with_fallback_reason(mut self, reason: Option<String>) -> Self {
        self.fallback_reason = reason;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// `POST start`
    pub async fn start(&self, request: StartRequest, client_identity: &str) -> Result<Started, ErrorResponse> {
        let ticket = self
            .sessions
            .create_session(&request.request, &request.project_context, client_identity)
            .await
            .map_err(|e| {
                if !e.is_rate_limited() {
                    warn!(client = %client_identity, code = e.code(), "Start request rejected");
                }
                ErrorResponse::from(e)
            })?;

        Ok(Started {
            response: StartResponse {
                stream_url: stream_url(&self.base_url, &ticket.session_id),
                session_id: ticket.session_id,
                thread_id: ticket.thread_id,
            },
            events: ticket.events,
        })
    }

    /// `GET status/{session_id}`
    pub async fn status(&self, session_id: &str) -> Result<StatusResponse, ErrorResponse> {
        Ok(self.sessions.status(session_id).await?)
    }

    /// `POST review`
    pub async fn review(&self, request: ReviewRequest) -> Result<Ack, ErrorResponse> {
        self.sessions
            .submit_review(&request.session_id, &request.feedback, request.action)
            .await?;
        Ok(Ack {
            session_id: request.session_id,
            accepted: true,
        })
    }

    /// Push channel for a session, from now on
    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<WorkflowEvent>, ErrorResponse> {
        Ok(self.sessions.subscribe(session_id).await?)
    }

    pub async fn cancel(&self, session_id: &str) -> Result<Ack, ErrorResponse> {
        self.sessions.cancel(session_id).await?;
        Ok(Ack {
            session_id: session_id.to_string(),
            accepted: true,
        })
    }

    /// `DELETE session/{session_id}`
    pub async fn delete(&self, session_id: &str) -> Result<Ack, ErrorResponse> {
        self.sessions.close_session(session_id).await?;
        Ok(Ack {
            session_id: session_id.to_string(),
            accepted: true,
        })
    }

    pub async fn health(&self) -> HealthResponse {
        let backend = self.sessions.engine().store().backend();
        HealthResponse {
            backend,
            crash_recovery: backend.survives_restart(),
            fallback_reason: self.fallback_reason.clone(),
            active_sessions: self.sessions.session_count().await,
        }
    }

    /// Audit trail of a thread, oldest first
    pub async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointSummary>, ErrorResponse> {
        let checkpoints = self
            .sessions
            .engine()
            .store()
            .history(thread_id)
            .await
            .map_err(WorkflowError::from)?;
        Ok(checkpoints.iter().map(CheckpointSummary::from).collect())
    }
}

/// `http(s)://host` becomes `ws(s)://host/ws/{session_id}`
fn stream_url(base_url: &str, session_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::GovernanceViolation;
    use crate::workflow::ProtocolError;

    #[test]
    fn test_error_response_carries_code_and_status_hint() {
        let limited = ErrorResponse::from(WorkflowError::from(GovernanceViolation::RateLimited {
            client: "c".into(),
            limit: 1,
            window_secs: 3600,
        }));
        assert_eq!(limited.code, "rate_limited");
        assert_eq!(limited.http_status(), 429);

        let conflict = ErrorResponse::from(WorkflowError::from(ProtocolError::InvalidState {
            thread_id: "t".into(),
            expected: WorkflowStatus::Paused,
            found: WorkflowStatus::Running,
        }));
        assert_eq!(conflict.http_status(), 409);
    }

    #[test]
    fn test_stream_url_follows_base_url_scheme() {
        assert_eq!(stream_url("http://localhost:8000", "s1"), "ws://localhost:8000/ws/s1");
        assert_eq!(stream_url("https://flow.example.com/", "s2"), "wss://flow.example.com/ws/s2");
    }

    #[test]
    fn test_review_request_feedback_defaults_to_empty() {
        let request: ReviewRequest =
            serde_json::from_str(r#"{"session_id": "s", "action": "approve"}"#).unwrap();
        assert_eq!(request.feedback, "");
        assert_eq!(request.action, ReviewAction::Approve);
    }
}
