//! civic-audit command line
//!
//! ## Commands
//!
//! - `ask`: answer one question (starts an in-process bridge unless told not to)
//! - `bridge`: serve the Tool Service to sandboxes until Ctrl-C
//! - `sessions`: list or delete saved conversations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use civic_audit::agent::{AuditResult, SessionStore};
use civic_audit::bridge::BridgeServer;
use civic_audit::config::AppConfig;
use civic_audit::tools::{SqliteToolService, ToolService};
use civic_audit::{metrics, DockerRuntime, Orchestrator, Roles, SandboxExecutor};

#[derive(Parser)]
#[command(name = "civic-audit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Answer questions about public financial data with sandboxed code", long_about = None)]
struct Cli {
    /// Configuration file (default: ./config.yaml when present)
    #[arg(short, long, global = true, env = "CIVIC_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question
    Ask {
        question: String,

        /// Continuation token from a previous answer
        #[arg(short, long)]
        session: Option<String>,

        /// Print Prometheus metrics after the answer
        #[arg(long)]
        metrics: bool,

        /// Use a bridge that is already running instead of starting one
        #[arg(long)]
        external_bridge: bool,
    },

    /// Serve the Tool Service over the bridge protocol
    Bridge {
        /// Address to listen on (overrides bridge.listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Manage saved conversations
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List saved sessions, newest first
    List,
    /// Delete a session
    Delete { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    civic_audit::tracing::init_tracing("civic-audit", &config.telemetry)
        .map_err(|e| anyhow::anyhow!(e))
        .context("initializing tracing")?;

    let result = match cli.command {
        Commands::Ask {
            question,
            session,
            metrics,
            external_bridge,
        } => ask(&config, &question, session.as_deref(), metrics, external_bridge, cli.json).await,
        Commands::Bridge { listen } => {
            if let Some(addr) = listen {
                config.bridge.listen_addr = addr;
            }
            serve_bridge(&config).await
        }
        Commands::Sessions { action } => sessions(&config, action, cli.json),
    };

    civic_audit::tracing::shutdown_tracing();
    result
}

async fn ask(
    config: &AppConfig,
    question: &str,
    token: Option<&str>,
    show_metrics: bool,
    external_bridge: bool,
    json: bool,
) -> Result<()> {
    let tools: Arc<dyn ToolService> = Arc::new(
        SqliteToolService::open(&config.database)
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );

    let bridge = if external_bridge {
        None
    } else {
        let server = BridgeServer::bind(&config.bridge, Arc::clone(&tools))
            .await
            .context("starting bridge")?;
        info!(addr = %server.local_addr()?, "Bridge listening");
        Some(tokio::spawn(server.serve()))
    };

    if config.sandbox.network.is_none() {
        warn!("No sandbox network configured; generated code runs offline and cannot reach the bridge");
    }
    let runtime = Arc::new(DockerRuntime::new(config.sandbox.docker_socket.as_str()));
    let executor = SandboxExecutor::new(runtime, config.sandbox.clone());
    if let Err(e) = executor.prepare().await {
        // Each run retries and reports this as a System Error
        warn!(error = %e, image = %config.sandbox.image, "Sandbox not ready");
    }

    let roles = Roles::ollama(&config.ollama).context("creating model client")?;
    let store = SessionStore::from_config(&config.sessions).context("opening session store")?;
    let orchestrator = Orchestrator::new(roles, Arc::new(executor), config.agent.clone())
        .with_tools(tools)
        .with_sessions(store);

    let outcome = orchestrator.run(question, token).await;

    if let Some(handle) = bridge {
        handle.abort();
    }

    let result = outcome.context("audit request failed")?;
    print_result(&result, json)?;

    if show_metrics {
        println!("\n{}", metrics::encode_text());
    }
    Ok(())
}

fn print_result(result: &AuditResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.answer);
    eprintln!();
    eprintln!(
        "status: {}  attempts: {}  trace: {}",
        result.status.as_str(),
        result.iterations,
        result.trace_id
    );
    if let Some(token) = &result.continuation_token {
        eprintln!("continue with: --session {}", token);
    }
    Ok(())
}

async fn serve_bridge(config: &AppConfig) -> Result<()> {
    let tools: Arc<dyn ToolService> = Arc::new(
        SqliteToolService::open(&config.database)
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );
    let server = BridgeServer::bind(&config.bridge, tools)
        .await
        .context("starting bridge")?;
    info!(addr = %server.local_addr()?, "Bridge listening, Ctrl-C to stop");

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
            }
        })
        .await?;

    info!("Bridge stopped");
    Ok(())
}

fn sessions(config: &AppConfig, action: SessionAction, json: bool) -> Result<()> {
    let store = SessionStore::from_config(&config.sessions).context("opening session store")?;

    match action {
        SessionAction::List => {
            let sessions = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No saved sessions in {}", store.dir().display());
            } else {
                for s in sessions {
                    println!(
                        "{}  {}  {:>3} exchanges  {}",
                        s.id,
                        s.updated_at.format("%Y-%m-%d %H:%M"),
                        s.exchanges,
                        s.title
                    );
                }
            }
        }
        SessionAction::Delete { token } => {
            store.delete(&token)?;
            println!("Deleted session {}", token);
        }
    }
    Ok(())
}
