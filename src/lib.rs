//! chi-agent - OS-resident agent runtime with Ollama tool calling
//!
//! Free-text requests go to a local model; the model's tool calls are mapped
//! onto safety-checked desktop operations and every turn is persisted.
//!
//! # Modules
//!
//! - `agent` - Turn loop, per-conversation serialization, status
//! - `tools` - Closed tool registry and backend adapters
//! - `security` - Deny-pattern safety guard for shell commands
//! - `history` - SQLite conversation/message/data-record store
//! - `ollama` - Ollama `/api/chat` client with tool calling
//! - `grpc` - Local UI transport over a Unix socket
//! - `mcp` - MCP stdio server exposing the registry
//! - `dashboard` - Status HTTP endpoint (`/api/status`, `/metrics`)
//! - `metrics` - Prometheus metrics for observability
//! - `config` - TOML configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use chi_agent::{AgentController, Config, HistoryStore, SafetyGuard, SystemRunner, ToolRegistry};
//!
//! let config = Config::load(None)?;
//! let registry = ToolRegistry::new(Arc::new(SystemRunner), Arc::new(config.safety_guard()?), config.tools.clone());
//! let history = HistoryStore::open(&config.storage.database_path(), config.storage.session_gap_hours)?;
//! let controller = AgentController::new(model, Arc::new(registry), Arc::new(history), config.agent.clone());
//! let turn = controller.handle_turn(None, "show disk usage").await?;
//! ```

pub mod agent;
pub mod config;
pub mod dashboard;
pub mod grpc;
pub mod history;
pub mod mcp;
pub mod metrics;
pub mod ollama;
pub mod security;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentController, AgentError, AgentStatus, TurnReply};
pub use config::{Config, ConfigError};
pub use history::HistoryStore;
pub use security::SafetyGuard;
pub use tools::{SystemRunner, ToolRegistry};
