//! Workflow data model: state, progress events and the error taxonomy

pub mod errors;
pub mod events;
pub mod state;

pub use errors::{ProtocolError, WorkflowError};
pub use events::{EventSink, NoopSink, WorkflowEvent};
pub use state::{Message, Role, Step, WorkflowState, WorkflowStatus};
