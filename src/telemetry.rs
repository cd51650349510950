use anyhow::Result;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. JSON output carries the current
/// span and span list so every line can be tied back to its thread id.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(filter)
            .try_init()?;
    }

    info!("Codeflow telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one engine run (start or resume) of a workflow thread
pub fn create_workflow_span(thread_id: &str, operation: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        thread.id = thread_id,
        operation = operation,
        correlation.id = %generate_correlation_id(),
    )
}

/// Span wrapping one client session
pub fn create_session_span(session_id: &str, thread_id: &str, client: &str) -> tracing::Span {
    tracing::info_span!(
        "session",
        session.id = session_id,
        thread.id = thread_id,
        client = client,
    )
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    pub fn finish(self) {
        info!(
            operation = %self.operation,
            duration_ms = self.elapsed_ms(),
            "Operation completed"
        );
    }
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    info!("Codeflow telemetry shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = ObservabilityConfig {
            log_level: "warn".to_string(),
            json_logs: false,
        };
        let first = init_telemetry(&config);
        let second = init_telemetry(&config);
        // Another test may have installed a subscriber first
        assert!(first.is_err() || second.is_err());
    }
}
