//! chi-agent - natural-language control surface for the desktop
//!
//! `daemon` serves the UI socket and the status endpoint; `mcp` exposes the
//! tool registry to external agentic clients on stdio; the remaining
//! subcommands are thin clients or local debugging aids.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use chi_agent::config::Config;
use chi_agent::grpc::{self, AgentClient};
use chi_agent::history::{HistoryStore, ProvisioningMarker};
use chi_agent::mcp::McpServer;
use chi_agent::ollama::{select_model, ChatClient, ModelEndpoint};
use chi_agent::tools::{SystemRunner, ToolRegistry};
use chi_agent::tracing::{init_tracing, shutdown_tracing};
use chi_agent::{dashboard, AgentController};

#[derive(Parser)]
#[command(name = "chi-agent")]
#[command(version)]
#[command(about = "OS-resident agent: natural-language control of the desktop")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CHI_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the UI socket and the status endpoint
    Daemon {
        /// Do not serve the status HTTP endpoint
        #[arg(long)]
        no_status: bool,
    },

    /// Serve the tool registry over MCP on stdio
    Mcp,

    /// Send one request to the running daemon
    Ask {
        /// Request text
        #[arg(required = true)]
        text: Vec<String>,

        /// Continue a specific conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the daemon status
    Status,

    /// List recent conversations (or data records)
    History {
        #[arg(short, long, default_value_t = 30)]
        limit: u32,

        /// List data records instead of conversations
        #[arg(long)]
        data: bool,
    },

    /// Interactive loop running the agent in-process
    Repl,

    /// Print the tool registry
    Tools {
        /// Print JSON schemas too
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let filter = if cli.verbose {
        Some("debug")
    } else {
        config.telemetry.log_filter.as_deref()
    };
    init_tracing("chi-agent", config.telemetry.otlp_endpoint.as_deref(), filter)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    let result = match cli.command {
        Commands::Daemon { no_status } => run_daemon(config, !no_status).await,
        Commands::Mcp => run_mcp(config).await,
        Commands::Ask {
            text,
            conversation,
            json,
        } => run_ask(&config, &text.join(" "), conversation.as_deref(), json).await,
        Commands::Status => run_status(&config).await,
        Commands::History { limit, data } => run_history(&config, limit, data).await,
        Commands::Repl => run_repl(config).await,
        Commands::Tools { json } => show_tools(&config, json),
    };

    shutdown_tracing();
    result
}

fn build_registry(config: &Config) -> Result<Arc<ToolRegistry>> {
    let guard = Arc::new(config.safety_guard()?);
    Ok(Arc::new(ToolRegistry::new(
        Arc::new(SystemRunner),
        guard,
        config.tools.clone(),
    )))
}

fn build_controller(config: &Config, client: ChatClient) -> Result<Arc<AgentController>> {
    let registry = build_registry(config)?;
    let db_path = config.storage.database_path();
    let history = HistoryStore::open(&db_path, config.storage.session_gap_hours)
        .with_context(|| format!("opening history at {}", db_path.display()))?;
    let model: Arc<dyn ModelEndpoint> = Arc::new(client);

    let controller = AgentController::new(model, registry, Arc::new(history), config.agent.clone())
        .with_retry_backoff(Duration::from_millis(config.model.retry_backoff_ms));
    Ok(Arc::new(controller))
}

async fn run_daemon(config: Config, serve_status: bool) -> Result<()> {
    tracing::info!("Starting chi-agent daemon");

    let client = ChatClient::new(&config.model)?;
    let marker = ProvisioningMarker::new(config.storage.marker_path());
    let provisioning = select_model(&client, &config.model, &marker).await;
    tracing::info!(model = %provisioning.model, "Serving model");

    let controller = build_controller(&config, client.with_model(provisioning.model))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutting down...");
        let _ = shutdown_tx.send(true);
    });

    let socket_path = config.transport.socket_path.clone();
    let listener = grpc::bind_socket(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "UI socket listening");

    let status_task = if serve_status {
        let addr: SocketAddr = config
            .transport
            .status_addr
            .parse()
            .with_context(|| format!("invalid status address '{}'", config.transport.status_addr))?;
        let controller = Arc::clone(&controller);
        let shutdown = shutdown_signal(shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = dashboard::serve(controller, addr, shutdown).await {
                tracing::error!(error = %e, "Status endpoint failed");
            }
        }))
    } else {
        None
    };

    let served = grpc::serve(Arc::clone(&controller), listener, shutdown_signal(shutdown_rx)).await;

    if let Some(task) = status_task {
        let _ = task.await;
    }
    if let Some(pull) = provisioning.pull {
        pull.abort();
    }
    let _ = std::fs::remove_file(&socket_path);

    served.context("UI transport failed")?;
    Ok(())
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

async fn run_mcp(config: Config) -> Result<()> {
    let registry = build_registry(&config)?;
    let server = McpServer::new(registry);
    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
    Ok(())
}

async fn connect(config: &Config) -> Result<AgentClient> {
    AgentClient::connect(&config.transport.socket_path)
        .await
        .context("is the chi-agent daemon running?")
}

/// Decode a JSON field from the wire, keeping the raw text if it is malformed
fn embedded_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run_ask(config: &Config, text: &str, conversation: Option<&str>, json: bool) -> Result<()> {
    let mut client = connect(config).await?;
    let response = client.ask(text, conversation).await?;

    if json {
        let calls: Vec<serde_json::Value> = response
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "tool": c.tool,
                    "arguments": embedded_json(&c.arguments_json),
                    "result": embedded_json(&c.result_json),
                    "is_error": c.is_error,
                    "duration_ms": c.duration_ms,
                })
            })
            .collect();
        let out = serde_json::json!({
            "reply": response.reply,
            "conversation_id": response.conversation_id,
            "tool_calls": calls,
            "rounds": response.rounds,
            "limit_reached": response.limit_reached,
            "trace_id": response.trace_id,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for call in &response.tool_calls {
        let mark = if call.is_error { "✗" } else { "✓" };
        eprintln!("  {} {} {} ({}ms)", mark, call.tool, call.arguments_json, call.duration_ms);
    }
    println!("{}", response.reply);
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let mut client = connect(config).await?;
    let status = client.status().await?;
    println!("{} ({} turns in flight)", status.status, status.turns_in_flight);
    Ok(())
}

async fn run_history(config: &Config, limit: u32, data: bool) -> Result<()> {
    let mut client = connect(config).await?;
    if data {
        for record in client.data(limit).await? {
            println!("#{:<5} {}  {:<20} {}", record.id, record.created_at, record.tool, record.data_json);
        }
        return Ok(());
    }
    for conversation in client.history(limit).await? {
        println!(
            "{}  {}  {:>3} msgs  {}",
            conversation.id, conversation.last_activity, conversation.message_count, conversation.preview
        );
    }
    Ok(())
}

async fn run_repl(config: Config) -> Result<()> {
    let client = ChatClient::new(&config.model)?;
    let controller = build_controller(&config, client)?;

    println!("chi-agent REPL ({}). Type 'exit' to quit.", controller.model_name());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation: Option<String> = None;

    loop {
        print!("chi> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        match controller.handle_turn(conversation.as_deref(), line).await {
            Ok(turn) => {
                for call in &turn.tool_calls {
                    let mark = if call.is_error { "✗" } else { "✓" };
                    println!("  {} {} {}", mark, call.tool, call.arguments);
                }
                println!("{}", turn.reply);
                conversation = Some(turn.conversation_id);
            }
            Err(e) => println!("error: {}", e),
        }
    }
    Ok(())
}

fn show_tools(config: &Config, json: bool) -> Result<()> {
    let registry = build_registry(config)?;
    if json {
        let tools: Vec<_> = registry.chat_tools();
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    for kind in registry.kinds() {
        let side_effect = serde_json::to_value(kind.side_effect())?;
        println!(
            "{:<20} {:<20} {}",
            kind.name(),
            side_effect.as_str().unwrap_or_default(),
            kind.description()
        );
    }
    Ok(())
}
