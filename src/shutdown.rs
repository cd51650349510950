use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::session::SessionManager;

/// Graceful shutdown coordinator for Codeflow.
///
/// Cancels live sessions so their runs stop at the next node boundary, waits
/// for in-flight runs to write their checkpoint, then closes the store.
pub struct ShutdownCoordinator {
    sessions: Arc<SessionManager>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Perform graceful shutdown operations
    pub async fn shutdown_all_services(&self) -> Result<()> {
        info!("Initiating graceful shutdown of all services...");

        if let Err(e) = self.drain_sessions().await {
            warn!("Some sessions may not have reached a checkpoint: {}", e);
        }

        self.sessions.engine().store().shutdown().await;

        info!("Graceful shutdown completed successfully");
        Ok(())
    }

    async fn drain_sessions(&self) -> Result<()> {
        timeout(self.drain_timeout, self.sessions.shutdown())
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for sessions to finish"))?;

        info!("All sessions stopped");
        Ok(())
    }
}
