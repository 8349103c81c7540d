//! Veer CLI - drive an automation task from the command line

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use veer_context::AgentRole;
use veer_core::{EventSink, FanoutSink, SessionId, Task, TracingSink, VeerConfig};
use veer_engine::{ActivityLogSink, TaskExecutor};
use veer_env::{EnvironmentDriver, Script, ScriptedDriver};
use veer_obstruction::ObstructionHistory;
use veer_oracle::{AnthropicOracle, DecisionOracle, ScriptedOracle, ScriptedReply};

#[derive(Parser)]
#[command(name = "veer")]
#[command(about = "Adaptive execution engine for oracle-driven environment automation")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .veer/config.toml
    Init {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Print the effective configuration
    Config {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Run one task against a scripted environment
    Run {
        /// Environment script (JSON)
        #[arg(short, long)]
        script: PathBuf,

        /// Goal handed to the planner
        #[arg(short, long)]
        goal: String,

        /// Session to run in; must exist in the script
        #[arg(long, default_value = "main")]
        session: String,

        /// Which decision oracle to use
        #[arg(long, value_enum, default_value = "anthropic")]
        oracle: CliOracle,

        /// Canned oracle replies per role (JSON), for --oracle scripted
        #[arg(long)]
        replies: Option<PathBuf>,

        /// Override agent.max_steps
        #[arg(long)]
        max_steps: Option<u32>,

        /// Working directory holding .veer/
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show learned obstruction outcomes for a session
    History {
        session: String,

        /// Only the N most recent records
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOracle {
    Anthropic,
    Scripted,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => cmd_init(&path),
        Commands::Config { path } => cmd_config(&path),
        Commands::Run {
            script,
            goal,
            session,
            oracle,
            replies,
            max_steps,
            path,
        } => cmd_run(&path, &script, goal, session, oracle, replies, max_steps).await,
        Commands::History { session, limit, path } => cmd_history(&path, session, limit).await,
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    info!("Initializing Veer in {:?}", path);
    VeerConfig::write_default(path).context("Failed to write default config")?;

    println!("Initialized Veer in {:?}", path);
    println!("Created:");
    println!("  .veer/config.toml");
    Ok(())
}

fn cmd_config(path: &Path) -> Result<()> {
    let config = VeerConfig::load_or_default(path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("{}", rendered);
    Ok(())
}

async fn load_replies(path: &Path) -> Result<ScriptedOracle> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read replies file {:?}", path))?;
    let queues: HashMap<AgentRole, Vec<ScriptedReply>> =
        serde_json::from_str(&content).context("Failed to parse replies JSON")?;

    // Queues are consumed in order, so push each role's list as written
    let mut oracle = ScriptedOracle::new();
    for role in AgentRole::ALL {
        for reply in queues.get(&role).cloned().unwrap_or_default() {
            oracle = oracle.push(role, reply);
        }
    }
    Ok(oracle)
}

async fn cmd_run(
    path: &Path,
    script_path: &Path,
    goal: String,
    session: String,
    oracle: CliOracle,
    replies: Option<PathBuf>,
    max_steps: Option<u32>,
) -> Result<()> {
    let mut config = VeerConfig::load_or_default(path)?;
    if let Some(max_steps) = max_steps {
        config.agent.max_steps = max_steps;
    }

    let content = tokio::fs::read_to_string(script_path)
        .await
        .with_context(|| format!("Failed to read script {:?}", script_path))?;
    let script: Script = serde_json::from_str(&content).context("Failed to parse script JSON")?;

    let session = SessionId::from(session);
    if !script.pages.contains_key(&session) {
        bail!("Session '{}' is not defined in {:?}", session, script_path);
    }
    let driver: Arc<dyn EnvironmentDriver> = Arc::new(ScriptedDriver::from_script(script));

    let oracle: Arc<dyn DecisionOracle> = match oracle {
        CliOracle::Anthropic => Arc::new(AnthropicOracle::from_settings(&config.oracle)?),
        CliOracle::Scripted => {
            let Some(replies) = replies else {
                bail!("--oracle scripted needs --replies <file>");
            };
            Arc::new(load_replies(&replies).await?)
        }
    };

    let activity = Arc::new(ActivityLogSink::new(path.join(".veer")));
    activity.log_run_start(&goal, config.agent.max_steps).await;
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new().with(Arc::new(TracingSink)).with(activity.clone()));

    let task = Task::new(goal, session).with_limits(&config);
    let executor = TaskExecutor::builder(driver, oracle)
        .with_config(config)
        .with_sink(sink)
        .with_root(path)
        .build();

    let task_id = executor.submit(task).await?;
    info!("Submitted task {}", task_id);

    let report = executor.run(&task_id).await;
    executor.shutdown();
    let report = report?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("\nActivity log: {:?}", activity.path());
    Ok(())
}

async fn cmd_history(path: &Path, session: String, limit: usize) -> Result<()> {
    let config = VeerConfig::load_or_default(path)?;
    let history = ObstructionHistory::from_settings(Some(path), &config.obstruction);
    let session = SessionId::from(session);

    let loaded = history.load(&session).await?;
    if loaded == 0 {
        println!("No obstruction history for session {}", session);
        return Ok(());
    }

    println!("Obstructions ({} recorded):", loaded);
    for record in history.recent(&session, limit).await {
        let outcome = if record.success { "resolved" } else { "unresolved" };
        println!(
            "  {} {} via {} ({})",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.kind,
            record.strategy,
            outcome
        );
        if let Some(note) = &record.note {
            println!("    {}", note);
        }
    }
    Ok(())
}
