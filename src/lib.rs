// Codeflow Library - Checkpointed Workflow Orchestration
// This exposes the core components for testing and integration

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod governance;
pub mod session;
pub mod shutdown;
pub mod stages;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use api::{ErrorResponse, HealthResponse, ReviewRequest, StartRequest, StartResponse, WorkflowApi};
pub use checkpoint::{open_store, Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore, StoreBackend};
#[cfg(feature = "database")]
pub use checkpoint::SqliteCheckpointStore;
pub use config::{config, CodeflowConfig};
pub use engine::{ExecutionResult, HaltReason, WorkflowEngine};
pub use governance::{CancelFlag, ExecutionLimits, GovernanceViolation, RequestRateLimiter};
pub use session::{ReviewAction, SessionManager, SessionOptions, StatusReport};
pub use shutdown::ShutdownCoordinator;
pub use stages::{
    CommandStage, FnStage, Outcome, Routing, Stage, StageError, StageKind, StageOutcome, StageRegistry,
};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{EventSink, Message, ProtocolError, Role, Step, WorkflowError, WorkflowEvent, WorkflowState, WorkflowStatus};
