mod memory_cmds;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use recollect_config::{AppConfig, TelemetryConfig};
use recollect_memory::{MemoryService, ScopeIds};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "recollect",
    version,
    about = "A semantic memory store that reconciles new facts against what it already knows"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Default, Args)]
struct ScopeArgs {
    #[arg(long = "user", visible_alias = "user-id")]
    user_id: Option<String>,
    #[arg(long = "agent", visible_alias = "agent-id")]
    agent_id: Option<String>,
    #[arg(long = "run", visible_alias = "run-id")]
    run_id: Option<String>,
}

impl From<ScopeArgs> for ScopeIds {
    fn from(args: ScopeArgs) -> Self {
        ScopeIds {
            user_id: args.user_id,
            agent_id: args.agent_id,
            run_id: args.run_id,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract facts from TEXT and reconcile them with stored memories.
    Add {
        text: String,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Extra metadata stored on every written record.
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
        /// Narrow the neighbour search (comma-separated values match any).
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        /// Print pipeline progress to stderr.
        #[arg(long)]
        progress: bool,
    },
    /// Show one memory.
    Get { id: String },
    /// List memories in a scope.
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Similarity search.
    Search {
        query: String,
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Override the store's similarity threshold.
        #[arg(long)]
        min_score: Option<f32>,
    },
    /// Replace the text of one memory.
    Update { id: String, text: String },
    /// Delete one memory.
    Delete { id: String },
    /// Delete every memory in a scope.
    DeleteAll {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        yes: bool,
    },
    /// Show the change history of one memory.
    History { id: String },
    /// Drop the whole collection and the history journal.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (file, defaults and env overrides).
    Show,
    /// Write the default configuration to the config path if it is absent.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let _log_guard = init_tracing(&config.telemetry)?;
    debug!(config = %cli.config.display(), "configuration loaded");

    if let Commands::Config { command } = &cli.command {
        return run_config_command(command, &config, &cli.config);
    }

    config.validate()?;
    let service = MemoryService::from_config(&config).await?;

    match cli.command {
        Commands::Add {
            text,
            scope,
            metadata,
            filters,
            progress,
        } => {
            memory_cmds::run_add(&service, text, scope.into(), &metadata, &filters, progress).await?;
        }
        Commands::Get { id } => memory_cmds::run_get(&service, &id).await?,
        Commands::List { scope, limit } => {
            memory_cmds::run_list(&service, &scope.into(), limit).await?;
        }
        Commands::Search {
            query,
            scope,
            filters,
            limit,
            min_score,
        } => {
            memory_cmds::run_search(&service, &query, &scope.into(), &filters, limit.max(1), min_score)
                .await?;
        }
        Commands::Update { id, text } => memory_cmds::run_update(&service, &id, &text).await?,
        Commands::Delete { id } => memory_cmds::run_delete(&service, &id).await?,
        Commands::DeleteAll { scope, yes } => {
            memory_cmds::run_delete_all(&service, &scope.into(), yes).await?;
        }
        Commands::History { id } => memory_cmds::run_history(&service, &id).await?,
        Commands::Reset { yes } => memory_cmds::run_reset(&service, yes).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

/// `RUST_LOG` wins over `telemetry.log_level`.  A non-empty
/// `telemetry.log_dir` adds a daily-rolling file; keep the returned guard
/// alive until exit so buffered lines are flushed.
fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    if telemetry.log_dir.trim().is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&telemetry.log_dir)
        .with_context(|| format!("failed to create log dir {}", telemetry.log_dir))?;
    let appender = tracing_appender::rolling::daily(&telemetry.log_dir, "recollect.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn run_config_command(command: &ConfigCommands, config: &AppConfig, path: &Path) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Init => {
            if path.exists() {
                println!("{} already exists; leaving it untouched", path.display());
            } else {
                AppConfig::default().save_to(path)?;
                println!("wrote default configuration to {}", path.display());
            }
        }
    }
    Ok(())
}
