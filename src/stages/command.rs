//! Stage capability backed by an external program
//!
//! The program receives the serialized [`WorkflowState`] on stdin and must
//! print a serialized [`StageOutcome`] on stdout. This is the seam where
//! generation backends (LLM agents, scripts, tools) plug into the engine.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Stage, StageError, StageKind, StageOutcome};
use crate::workflow::WorkflowState;

const STDERR_EXCERPT_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandStage {
    kind: StageKind,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandStage {
    pub fn new(kind: StageKind, program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            kind,
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from an argv vector such as `["python", "agents/plan.py"]`
    pub fn from_argv(kind: StageKind, argv: &[String], timeout: Duration) -> Result<Self, StageError> {
        let (program, args) = argv.split_first().ok_or_else(|| StageError::InvalidOutput {
            reason: format!("empty command configured for stage {kind}"),
        })?;
        Ok(Self::new(kind, program.clone(), args.to_vec(), timeout))
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }
}

#[async_trait]
impl Stage for CommandStage {
    async fn execute(&self, state: WorkflowState) -> Result<StageOutcome, StageError> {
        let started = Instant::now();
        let input = serde_json::to_vec(&state)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                // Dropping stdin closes the pipe so the program sees EOF
            }
            Ok::<(), std::io::Error>(())
        };
        // Feed stdin while draining stdout so neither pipe can fill up and stall
        let run = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            match fed {
                // The program exited without reading everything; its exit status decides
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(output),
                Err(e) => Err(e),
                Ok(()) => Ok(output),
            }
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                warn!(
                    stage = %self.kind,
                    program = %self.program,
                    timeout_secs = self.timeout.as_secs(),
                    "Stage process timed out"
                );
                StageError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            })??;

        debug!(
            stage = %self.kind,
            program = %self.program,
            duration_ms = started.elapsed().as_millis() as u64,
            exit_code = ?output.status.code(),
            "Stage process finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::Process {
                exit_code: output.status.code(),
                stderr: stderr.chars().take(STDERR_EXCERPT_LIMIT).collect(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| StageError::InvalidOutput {
            reason: format!("stage {} printed malformed outcome: {e}", self.kind),
        })
    }
}
