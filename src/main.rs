use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use codeflow::api::{CheckpointSummary, ReviewRequest, StartRequest, WorkflowApi};
use codeflow::checkpoint::{open_store, OpenedStore};
use codeflow::config::{CodeflowConfig, StagesConfig};
use codeflow::session::{ReviewAction, SessionManager, SessionOptions};
use codeflow::telemetry::{init_telemetry, shutdown_telemetry};
use codeflow::{
    CommandStage, ExecutionLimits, RequestRateLimiter, ShutdownCoordinator, StageKind, StageRegistry, WorkflowEngine,
    WorkflowEvent,
};

#[derive(Parser)]
#[command(name = "codeflow")]
#[command(about = "Checkpointed, resumable orchestration of multi-stage coding workflows")]
#[command(long_about = "Codeflow routes a coding request through planning, generation, debugging and \
                       human review stages. Every step is checkpointed, so a workflow paused for review \
                       can be resumed later, from this or any other process.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow and review it interactively
    Run {
        /// Natural-language coding request
        #[arg(long, help = "What you want built, e.g. 'create anagram checker'")]
        request: String,
        /// Project directory or context handed to every stage
        #[arg(long, default_value = ".", help = "Project context passed to stages")]
        project: String,
        /// Identity used for rate limiting
        #[arg(long, default_value = "local", help = "Client identity for rate limiting")]
        client: String,
    },
    /// Resume a paused workflow by thread id
    Resume {
        #[arg(long, help = "Thread id printed when the workflow paused")]
        thread: String,
        #[arg(long, help = "approve or revise")]
        action: String,
        #[arg(long, default_value = "", help = "Feedback text, required for revise")]
        feedback: String,
    },
    /// Show the latest checkpoint of a thread
    Status {
        #[arg(long)]
        thread: String,
    },
    /// List every retained checkpoint of a thread, oldest first
    History {
        #[arg(long)]
        thread: String,
    },
    /// Write the effective configuration to a TOML file
    Config {
        #[arg(long, help = "Destination file, e.g. codeflow.toml")]
        write: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = codeflow::config()?;
    init_telemetry(&config.observability)?;

    let result = match cli.command {
        Commands::Run { request, project, client } => {
            tokio::runtime::Runtime::new()?.block_on(async { run_command(config, request, project, client).await })
        }
        Commands::Resume { thread, action, feedback } => {
            tokio::runtime::Runtime::new()?.block_on(async { resume_command(config, thread, action, feedback).await })
        }
        Commands::Status { thread } => {
            tokio::runtime::Runtime::new()?.block_on(async { status_command(config, thread).await })
        }
        Commands::History { thread } => {
            tokio::runtime::Runtime::new()?.block_on(async { history_command(config, thread).await })
        }
        Commands::Config { write } => {
            config.save_to_file(&write)?;
            println!("✅ Configuration written to {}", write);
            Ok(())
        }
    };

    shutdown_telemetry();
    result
}

/// Built-in entry and review stages plus the external programs from config
fn build_registry(stages: &StagesConfig) -> Result<StageRegistry> {
    let timeout = Duration::from_secs(stages.timeout_secs);
    let mut registry = StageRegistry::with_builtins();

    let configured = [
        (StageKind::Plan, &stages.plan_command),
        (StageKind::Generate, &stages.generate_command),
        (StageKind::Debug, &stages.debug_command),
    ];
    for (kind, argv) in configured {
        if let Some(argv) = argv {
            let stage = CommandStage::from_argv(kind, argv, timeout)?;
            registry.register(kind, Arc::new(stage));
        }
    }

    for required in [StageKind::Plan, StageKind::Generate] {
        if !registry.contains(required) {
            bail!(
                "No program configured for the {} stage; set stages.{}_command in codeflow.toml",
                required,
                required
            );
        }
    }
    Ok(registry)
}

async fn build_api(config: &CodeflowConfig) -> Result<WorkflowApi> {
    let OpenedStore {
        store,
        backend,
        fallback_reason,
    } = open_store(config).await;
    if !backend.survives_restart() {
        println!("⚠️  Checkpoints are in memory only: a paused workflow cannot be resumed after exit");
    }

    let engine = WorkflowEngine::new(
        build_registry(&config.stages)?,
        store,
        ExecutionLimits::from(&config.governance),
    )?;
    let sessions = SessionManager::with_options(
        Arc::new(engine),
        Arc::new(RequestRateLimiter::new(&config.rate_limit)),
        SessionOptions::from(config),
    );
    Ok(WorkflowApi::new(Arc::new(sessions))
        .with_base_url(config.client.base_url.clone())
        .with_fallback_reason(fallback_reason))
}

async fn run_command(config: &CodeflowConfig, request: String, project: String, client: String) -> Result<()> {
    let api = build_api(config).await?;
    let coordinator = ShutdownCoordinator::new(Arc::clone(api.sessions()));

    println!("🚀 Starting workflow: {}", request);
    let started = api
        .start(
            StartRequest {
                request,
                project_context: project,
            },
            &client,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{} ({})", e.message, e.code))?;

    let session_id = started.response.session_id.clone();
    println!("🧵 Thread: {}", started.response.thread_id);

    tokio::select! {
        result = drive_interactive(&api, &session_id, started.events) => {
            result?;
            coordinator.shutdown_all_services().await?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("🛑 Interrupted - stopping at the next checkpoint");
            coordinator.shutdown_all_services().await?;
        }
    }
    Ok(())
}

/// Print events and prompt for a decision at every review pause
async fn drive_interactive(
    api: &WorkflowApi,
    session_id: &str,
    mut events: broadcast::Receiver<WorkflowEvent>,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match next_terminal_event(&mut events).await? {
            WorkflowEvent::ReviewRequired { thread_id, generated_files, .. } => {
                println!();
                println!("👀 Review required ({} files):", generated_files.len());
                for (path, content) in &generated_files {
                    println!("--- {} ---", path);
                    println!("{}", content);
                }
                println!();
                println!("Type 'approve', 'revise <feedback>' or 'quit':");

                let Some(line) = stdin.next_line().await? else {
                    println!("⏸️  Paused. Resume later with: codeflow resume --thread {} --action approve", thread_id);
                    return Ok(());
                };
                let line = line.trim();
                let (action, feedback) = match line.split_once(' ') {
                    Some((action, feedback)) => (action, feedback),
                    None => (line, ""),
                };
                if action.eq_ignore_ascii_case("quit") {
                    println!("⏸️  Paused. Resume later with: codeflow resume --thread {} --action approve", thread_id);
                    return Ok(());
                }

                let action: ReviewAction = match action.parse() {
                    Ok(action) => action,
                    Err(e) => {
                        println!("❌ {}", e);
                        println!("⏸️  Left paused. Resume with: codeflow resume --thread {} --action approve", thread_id);
                        return Ok(());
                    }
                };
                api.review(ReviewRequest {
                    session_id: session_id.to_string(),
                    feedback: feedback.to_string(),
                    action,
                })
                .await
                .map_err(|e| anyhow::anyhow!("{} ({})", e.message, e.code))?;
            }
            WorkflowEvent::WorkflowComplete { generated_files, .. } => {
                println!("✅ Workflow complete: {} files", generated_files.len());
                for path in generated_files.keys() {
                    println!("   📄 {}", path);
                }
                return Ok(());
            }
            WorkflowEvent::Error { code, message, .. } => {
                bail!("Workflow stopped: {} ({})", message, code);
            }
            WorkflowEvent::StepUpdate { .. } => {}
        }
    }
}

/// Skip progress updates, printing them, until the run hands back control
async fn next_terminal_event(events: &mut broadcast::Receiver<WorkflowEvent>) -> Result<WorkflowEvent> {
    loop {
        match events.recv().await {
            Ok(WorkflowEvent::StepUpdate {
                stage,
                next_stage,
                current_step,
                total_steps,
                sequence,
                ..
            }) => {
                println!(
                    "🔄 [{}] {} finished -> {} (step {}/{})",
                    sequence, stage, next_stage, current_step, total_steps
                );
            }
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("⚠️  Missed {} progress updates", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => bail!("Event channel closed unexpectedly"),
        }
    }
}

async fn resume_command(config: &CodeflowConfig, thread: String, action: String, feedback: String) -> Result<()> {
    let action: ReviewAction = action.parse()?;
    let api = build_api(config).await?;

    let session_id = api.sessions().attach_thread(&thread, "local").await?;
    let mut events = api
        .subscribe(&session_id)
        .await
        .map_err(|e| anyhow::anyhow!("{} ({})", e.message, e.code))?;

    api.review(ReviewRequest {
        session_id: session_id.clone(),
        feedback,
        action,
    })
    .await
    .map_err(|e| anyhow::anyhow!("{} ({})", e.message, e.code))?;

    let outcome = match next_terminal_event(&mut events).await? {
        WorkflowEvent::ReviewRequired { .. } => {
            println!("⏸️  Paused again for review. Resume with: codeflow resume --thread {}", thread);
            Ok(())
        }
        WorkflowEvent::WorkflowComplete { generated_files, .. } => {
            println!("✅ Workflow complete: {} files", generated_files.len());
            Ok(())
        }
        WorkflowEvent::Error { code, message, .. } => Err(anyhow::anyhow!("Workflow stopped: {} ({})", message, code)),
        WorkflowEvent::StepUpdate { .. } => Ok(()),
    };

    ShutdownCoordinator::new(Arc::clone(api.sessions()))
        .shutdown_all_services()
        .await?;
    outcome
}

async fn status_command(config: &CodeflowConfig, thread: String) -> Result<()> {
    let opened = open_store(config).await;
    let Some(checkpoint) = opened.store.latest(&thread).await? else {
        println!("❌ No checkpoints for thread {}", thread);
        return Ok(());
    };

    let state = &checkpoint.state;
    println!("🧵 Thread {} (checkpoint #{})", thread, checkpoint.sequence_number);
    println!("   Status: {}", state.status);
    println!("   Stage: {}", state.active_stage);
    println!("   Steps: {}/{}", state.completed_steps(), state.total_steps());
    println!("   Nodes executed: {}", state.node_execution_count);
    for step in &state.plan {
        let mark = if step.completed { "✅" } else { "⬜" };
        println!("   {} {}", mark, step.instruction);
    }
    for path in state.generated_files.keys() {
        println!("   📄 {}", path);
    }

    opened.store.shutdown().await;
    Ok(())
}

async fn history_command(config: &CodeflowConfig, thread: String) -> Result<()> {
    let opened = open_store(config).await;
    let history = opened.store.history(&thread).await?;

    if history.is_empty() {
        println!("❌ No checkpoints for thread {}", thread);
    }
    for checkpoint in &history {
        let summary = CheckpointSummary::from(checkpoint);
        println!(
            "#{:<4} {:<10} {:<12} nodes={:<3} step {}/{}  {}  {}",
            summary.sequence_number,
            summary.status,
            summary.active_stage,
            summary.node_execution_count,
            summary.current_step,
            summary.total_steps,
            summary.created_at.to_rfc3339(),
            summary.writer
        );
    }

    opened.store.shutdown().await;
    Ok(())
}
