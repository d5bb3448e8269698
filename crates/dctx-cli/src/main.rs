//! `dctx` — the human-facing command surface (§6.2): a thin `clap`
//! dispatcher over the same in-process `Store`/`Broker`/`CommandRegistry`
//! stack `dctx-daemon` boots, translating each command's result into one
//! of the six closed exit codes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dctx_bridge::command_registry::{CommandContext, CommandError, CommandSource};
use dctx_core::config::Config;
use dctx_daemon::daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "dctx", version, about = "ADHD-aware multi-agent developer assistant — command surface")]
struct Cli {
    /// Workspace root (absolute path). Defaults to the current directory.
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// Acting user id. Defaults to $USER.
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// session.start / session.save / session.load / session.break / session.resume / session.end
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// task.assess / task.implement
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Current attention state, completion counts, budget remaining, backend health.
    Stats,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Begin (or resume, idempotently) the active context for this workspace.
    Start,
    /// Patch the active context with progress notes.
    Save {
        #[arg(long)]
        current_focus: Option<String>,
        /// Repeatable; collected into `completed_tasks`.
        #[arg(long = "completed-task")]
        completed_tasks: Vec<String>,
        /// Repeatable; collected into `next_steps`.
        #[arg(long = "next-step")]
        next_steps: Vec<String>,
    },
    /// Return the active context plus recent activity.
    Load {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Start a break.
    Break,
    /// End a break.
    Resume,
    /// Finalize the session and get a break recommendation.
    End,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Score a task's fit against the caller's current attention state.
    Assess {
        #[arg(long)]
        progress_id: i64,
    },
    /// Start a task (explicit id, or the best-suitability TODO when omitted).
    Implement {
        #[arg(long)]
        progress_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    dctx_telemetry::logging::init_logging("dctx-cli", "warn");

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            Config::default()
        }
    };

    let daemon = match Daemon::new(config).await.context("failed to initialize command surface") {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e:#}");
            return 1;
        }
    };

    let workspace = match resolve_workspace(cli.workspace) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let user = cli.user.or_else(|| std::env::var("USER").ok()).unwrap_or_else(|| "local".into());

    let (name, mut ctx) = match cli.command {
        Command::Session { action } => session_invocation(action, &workspace),
        Command::Task { action } => task_invocation(action, &workspace, &user),
        Command::Stats => ("stats".to_string(), CommandContext::new(CommandSource::Cli, "")),
    };
    ctx = ctx
        .with_param("workspace_id", serde_json::json!(workspace))
        .with_param("user_id", serde_json::json!(user));

    match daemon.command_registry().execute(&name, ctx).await {
        Ok(output) => {
            if let Some(data) = output.data {
                println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            } else if let Some(message) = output.message {
                println!("{message}");
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            exit_code_for(&e)
        }
    }
}

fn session_invocation(action: SessionAction, _workspace: &str) -> (String, CommandContext) {
    let ctx = CommandContext::new(CommandSource::Cli, "");
    match action {
        SessionAction::Start => ("session.start".into(), ctx),
        SessionAction::Save { current_focus, completed_tasks, next_steps } => {
            let mut ctx = ctx;
            if let Some(focus) = current_focus {
                ctx = ctx.with_param("current_focus", serde_json::json!(focus));
            }
            if !completed_tasks.is_empty() {
                ctx = ctx.with_param("completed_tasks", serde_json::json!(completed_tasks));
            }
            if !next_steps.is_empty() {
                ctx = ctx.with_param("next_steps", serde_json::json!(next_steps));
            }
            ("session.save".into(), ctx)
        }
        SessionAction::Load { limit } => {
            ("session.load".into(), ctx.with_param("limit", serde_json::json!(limit)))
        }
        SessionAction::Break => ("session.break".into(), ctx),
        SessionAction::Resume => ("session.resume".into(), ctx),
        SessionAction::End => ("session.end".into(), ctx),
    }
}

fn task_invocation(action: TaskAction, _workspace: &str, _user: &str) -> (String, CommandContext) {
    let ctx = CommandContext::new(CommandSource::Cli, "");
    match action {
        TaskAction::Assess { progress_id } => {
            ("task.assess".into(), ctx.with_param("progress_id", serde_json::json!(progress_id)))
        }
        TaskAction::Implement { progress_id } => {
            let ctx = match progress_id {
                Some(id) => ctx.with_param("progress_id", serde_json::json!(id)),
                None => ctx,
            };
            ("task.implement".into(), ctx)
        }
    }
}

fn resolve_workspace(workspace: Option<String>) -> Result<String> {
    match workspace {
        Some(w) => Ok(w),
        None => std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .context("could not determine current directory; pass --workspace explicitly"),
    }
}

/// Maps a command failure onto the six closed exit codes (§6.2). `CommandError`
/// does not carry `dctx_core::error::CoreError`'s richer kind once a storage
/// or broker failure has been flattened into `ExecutionFailed`'s message, so
/// backend/budget/transition/break failures are recovered by matching the
/// known `CoreError` `Display` text; anything else surfaces as a validation
/// error (`1`), the closest fit in the closed set.
fn exit_code_for(err: &CommandError) -> i32 {
    match err {
        CommandError::NotFound(_) | CommandError::InvalidArgs(_) | CommandError::Disabled(_) | CommandError::PermissionDenied(_) => 1,
        CommandError::ExecutionFailed(message) => {
            if message.contains("no backend registered") || message.contains("unavailable after retries") {
                2
            } else if message.contains("budget exceeded") {
                3
            } else if message.contains("illegal status transition") {
                4
            } else if message.contains("break is required") {
                5
            } else {
                1
            }
        }
    }
}
