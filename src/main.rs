mod bundle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice_core::config::{AppConfig, ModelConfig};
use sluice_core::traits::{LlmClient, RelationalStore, ResourceRegistry, ScriptRunner, WarehouseConnector};
use sluice_core::types::{EngineEvent, NodeServices, SessionId};
use sluice_engine::Orchestrator;
use sluice_nodes::SubprocessRunner;
use sluice_store::{HttpWarehouse, SqliteRelational, SqliteStore};

use crate::bundle::Bundle;

/// Script working directories older than this are assumed abandoned.
const STALE_SCRIPT_DIR_SECS: u64 = 3600;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Workflow execution engine for data, LLM and script pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sluice.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import workflows, prompts, APIs and scripts from a JSON or TOML bundle
    Import {
        file: PathBuf,
    },
    /// Validate the workflows in a bundle without storing them
    Validate {
        file: PathBuf,
    },
    /// Run a workflow to completion
    Run {
        workflow_id: String,
        /// Session name (defaults to the workflow id plus a timestamp)
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "cli")]
        created_by: String,
        /// Session metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show a session
    Status {
        session_id: String,
    },
    /// List a session's node execution records
    Executions {
        session_id: String,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending or running session
    Cancel {
        session_id: String,
    },
    /// Mark sessions left running by a dead process as failed
    Recover,
    /// Remove stale script working directories
    Sweep {
        /// Minimum age in seconds
        #[arg(long, default_value_t = STALE_SCRIPT_DIR_SECS)]
        min_age: u64,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info,warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "sluice", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_bundle(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&redacted(&config))?);
        }
        Commands::Sweep { min_age } => {
            let dir = config.sandbox_dir();
            let removed = SubprocessRunner::sweep_stale(&dir, Duration::from_secs(min_age))?;
            println!("Removed {} stale script directories from {}", removed, dir.display());
        }
        command => {
            let (engine, store) = build_engine(&config)?;
            let result = dispatch(command, &engine, &store).await;
            engine.shutdown();
            result?;
        }
    }
    Ok(())
}

async fn dispatch(command: Commands, engine: &Orchestrator, store: &SqliteStore) -> anyhow::Result<()> {
    match command {
        Commands::Import { file } => {
            let bundle = Bundle::load(&file)?;
            if bundle.is_empty() {
                warn!(path = %file.display(), "Bundle contains no definitions");
            }
            let summary = bundle::import(bundle, store, engine).await?;
            println!(
                "Imported {} workflows, {} prompts, {} APIs, {} scripts",
                summary.workflows, summary.prompts, summary.apis, summary.scripts
            );
            for (id, errors) in &summary.rejected {
                println!("  rejected {}: {}", id, errors);
            }
            if !summary.rejected.is_empty() {
                anyhow::bail!("{} workflows failed validation", summary.rejected.len());
            }
        }
        Commands::Run {
            workflow_id,
            name,
            created_by,
            metadata,
        } => {
            let metadata = match metadata {
                Some(raw) => serde_json::from_str(&raw).context("--metadata must be JSON")?,
                None => serde_json::json!({}),
            };
            let name = name.unwrap_or_else(|| format!("{} {}", workflow_id, Utc::now().format("%Y-%m-%d %H:%M:%S")));
            run_workflow(engine, &workflow_id, &name, &created_by, metadata).await?;
        }
        Commands::Status { session_id } => {
            let session = engine.get_session_status(&SessionId::from_str(&session_id)).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Executions { session_id, json } => {
            let records = engine
                .list_node_executions(&SessionId::from_str(&session_id))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in &records {
                    println!(
                        "{:>4}  {:<20} {:<20} {:<10} {:>8}  {}",
                        r.seq,
                        truncate(&r.node_id, 20),
                        r.node_type,
                        r.status.as_str(),
                        r.duration_ms.map(|d| format!("{}ms", d)).unwrap_or_default(),
                        r.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Cancel { session_id } => {
            engine.cancel_session(&SessionId::from_str(&session_id)).await?;
            println!("Cancelled {}", session_id);
        }
        Commands::Recover => {
            let recovered = engine.recover().await?;
            println!("Marked {} interrupted sessions as failed", recovered.len());
            for id in recovered {
                println!("  {}", id);
            }
        }
        Commands::Validate { .. } | Commands::Config | Commands::Sweep { .. } | Commands::Completions { .. } => {}
    }
    Ok(())
}

/// Start a session, stream node progress to stdout and wait for the result.
async fn run_workflow(
    engine: &Orchestrator,
    workflow_id: &str,
    name: &str,
    created_by: &str,
    metadata: serde_json::Value,
) -> anyhow::Result<()> {
    // Subscribe before starting so no event is missed; this process runs one session.
    let mut rx = engine.events().subscribe();
    let session = engine
        .start_session_with(workflow_id, name, created_by, metadata)
        .await?;
    println!("Session {} started", session.id);

    let printer = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match event {
                EngineEvent::NodeStarted { node_id, node_type, .. } => {
                    println!("  > {} ({})", node_id, node_type);
                }
                EngineEvent::NodeCompleted { node_id, duration_ms, .. } => {
                    println!("  ✓ {} [{}ms]", node_id, duration_ms);
                }
                EngineEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ✗ {}: {}", node_id, error);
                }
                EngineEvent::SessionFinished { .. } => break,
                EngineEvent::SessionStarted { .. } => {}
            }
        }
    });

    let ctrl_c = {
        let engine = engine.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling after the current node...");
                if let Err(e) = engine.cancel_session(&id).await {
                    warn!(error = %e, "Cancel failed");
                }
            }
        })
    };

    let finished = engine.wait(&session.id).await;
    ctrl_c.abort();
    printer.await.ok();

    let finished = finished?;
    println!("Session {} {}", finished.id, finished.status);
    if let Some(error) = &finished.error {
        println!("  {}", error);
    }
    if finished.status != sluice_core::types::SessionStatus::Completed {
        anyhow::bail!("session {} ended {}", finished.id, finished.status);
    }
    Ok(())
}

fn validate_bundle(path: &std::path::Path) -> anyhow::Result<()> {
    let bundle = Bundle::load(path)?;
    let mut invalid = 0;
    for (id, report) in bundle::check(&bundle) {
        if report.is_valid() {
            println!("{}: ok", id);
        } else {
            invalid += 1;
            println!("{}: invalid", id);
            for e in &report.errors {
                println!("  error: {}", e);
            }
        }
        for w in &report.warnings {
            println!("  warning: {}", w);
        }
    }
    if invalid > 0 {
        anyhow::bail!("{} workflows failed validation", invalid);
    }
    Ok(())
}

/// Wire the stores and services described by the config into an orchestrator.
fn build_engine(config: &AppConfig) -> anyhow::Result<(Orchestrator, Arc<SqliteStore>)> {
    let store = Arc::new(SqliteStore::open(&config.store_path())?);
    let relational = Arc::new(SqliteRelational::open(&config.relational_path())?);

    let warehouse = match &config.warehouse {
        Some(wc) => {
            info!(base_url = %wc.base_url, "Warehouse connector configured");
            Some(Arc::new(HttpWarehouse::new(wc.clone())?) as Arc<dyn WarehouseConnector>)
        }
        None => None,
    };
    let llm = config.model.as_ref().map(|mc| {
        info!(provider = %mc.provider, model = %mc.model_id, "LLM client configured");
        sluice_llm::build_client(mc)
    });

    let sandbox_dir = config.sandbox_dir();
    std::fs::create_dir_all(&sandbox_dir)
        .with_context(|| format!("creating sandbox dir {}", sandbox_dir.display()))?;
    match SubprocessRunner::sweep_stale(&sandbox_dir, Duration::from_secs(STALE_SCRIPT_DIR_SECS)) {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "Removed stale script directories"),
        Err(e) => warn!(error = %e, "Stale script sweep failed"),
    }
    let scripts = SubprocessRunner::new(config.sandbox.clone(), sandbox_dir);

    let services = NodeServices {
        registry: Some(store.clone() as Arc<dyn ResourceRegistry>),
        relational: Some(relational as Arc<dyn RelationalStore>),
        warehouse,
        llm: llm.map(|l| l as Arc<dyn LlmClient>),
        scripts: Some(Arc::new(scripts) as Arc<dyn ScriptRunner>),
        script_timeout_secs: config.sandbox.timeout_secs,
    };

    let mut builder = Orchestrator::builder()
        .store(store.clone())
        .services(services)
        .config(config.engine.clone());
    if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
        builder = builder.run_log(config.log_dir(), log.level);
    }
    Ok((builder.build()?, store))
}

/// Load the config file, falling back to `~/.sluice/config.toml`, then to
/// defaults plus whatever model credentials are in the environment.
fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".sluice").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(create_env_config())
}

fn create_env_config() -> AppConfig {
    let model = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        Some(("anthropic", "claude-sonnet-4-20250514", key))
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        Some(("openai", "gpt-4o", key))
    } else {
        None
    };
    AppConfig {
        model: model.map(|(provider, model_id, key)| ModelConfig {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            api_key: Some(key),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.0,
            retry: Some(Default::default()),
        }),
        ..Default::default()
    }
}

/// Copy of the config with secrets masked, for display.
fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    if let Some(model) = config.model.as_mut() {
        if model.api_key.is_some() {
            model.api_key = Some("***".into());
        }
    }
    if let Some(wh) = config.warehouse.as_mut() {
        if wh.token.is_some() {
            wh.token = Some("***".into());
        }
    }
    config
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
