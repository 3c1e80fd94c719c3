//! Tool registry and dispatch
//!
//! The set of tools is closed: [`ToolKind`] enumerates every operation the
//! model (or an MCP client) may invoke. A call goes through three stages:
//!
//! ```text
//! name ──resolve──► ToolKind ──parse──► ToolInvocation ──execute──► backend
//!   │                  │                      │
//!   └─ NotFound        └─ InvalidArgument     └─ Backend / Timeout / SafetyDenied
//! ```
//!
//! Arguments are fully validated before any backend runs, so a malformed call
//! never spawns a process.

pub mod apps;
pub mod devenv;
pub mod network;
pub mod packages;
pub mod runner;
pub mod services;
pub mod shell;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::metrics::{SAFETY_DENIALS, TOOL_CALLS, TOOL_CALL_DURATION};
use crate::ollama::{Tool, ToolFunction};
use crate::security::SafetyGuard;

pub use runner::{CommandOutput, CommandRunner, CommandSpec, RunError, SystemRunner};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of a single tool call
///
/// These are recoverable within a turn: the agent loop serializes them with
/// [`ToolError::to_json`] and feeds them back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("command refused ({rule}): {reason}")]
    SafetyDenied {
        command: String,
        rule: String,
        reason: String,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ToolError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidArgument(_) => "invalid_argument",
            ToolError::SafetyDenied { .. } => "safety_denied",
            ToolError::Backend(_) => "backend_error",
            ToolError::Timeout(_) => "timeout",
            ToolError::NotFound(_) => "not_found",
        }
    }

    /// Error payload returned to the model / MCP client
    pub fn to_json(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let ToolError::SafetyDenied { command, rule, .. } = self {
            error["rule"] = json!(rule);
            error["command"] = json!(command);
        }
        json!({ "error": error })
    }
}

impl From<RunError> for ToolError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::TimedOut { after, .. } => ToolError::Timeout(after),
            other => ToolError::Backend(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// How much a tool can change the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SideEffect {
    ReadOnly,
    MutatingImmediate,
    /// Applied on next boot
    MutatingStaged,
    Destructive,
}

/// Every tool the runtime exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    LaunchApp,
    InstallApp,
    InstallSystem,
    RemoveApp,
    RunShell,
    GetNetworkStatus,
    SetNetwork,
    ManageService,
    EnvcloneInit,
    EnvcloneUp,
    EnvcloneDown,
    EnvcloneCode,
}

impl ToolKind {
    pub const ALL: [ToolKind; 12] = [
        ToolKind::LaunchApp,
        ToolKind::InstallApp,
        ToolKind::InstallSystem,
        ToolKind::RemoveApp,
        ToolKind::RunShell,
        ToolKind::GetNetworkStatus,
        ToolKind::SetNetwork,
        ToolKind::ManageService,
        ToolKind::EnvcloneInit,
        ToolKind::EnvcloneUp,
        ToolKind::EnvcloneDown,
        ToolKind::EnvcloneCode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::LaunchApp => "launch_app",
            ToolKind::InstallApp => "install_app",
            ToolKind::InstallSystem => "install_system",
            ToolKind::RemoveApp => "remove_app",
            ToolKind::RunShell => "run_shell",
            ToolKind::GetNetworkStatus => "get_network_status",
            ToolKind::SetNetwork => "set_network",
            ToolKind::ManageService => "manage_service",
            ToolKind::EnvcloneInit => "envclone_init",
            ToolKind::EnvcloneUp => "envclone_up",
            ToolKind::EnvcloneDown => "envclone_down",
            ToolKind::EnvcloneCode => "envclone_code",
        }
    }

    /// Exact-match lookup; unknown names resolve to nothing
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub fn side_effect(self) -> SideEffect {
        match self {
            ToolKind::GetNetworkStatus => SideEffect::ReadOnly,
            ToolKind::InstallSystem => SideEffect::MutatingStaged,
            ToolKind::RemoveApp | ToolKind::RunShell => SideEffect::Destructive,
            ToolKind::LaunchApp
            | ToolKind::InstallApp
            | ToolKind::SetNetwork
            | ToolKind::ManageService
            | ToolKind::EnvcloneInit
            | ToolKind::EnvcloneUp
            | ToolKind::EnvcloneDown
            | ToolKind::EnvcloneCode => SideEffect::MutatingImmediate,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::LaunchApp => "Launch a desktop application by name or .desktop entry.",
            ToolKind::InstallApp => "Install a GUI application as a user flatpak. Takes effect immediately, no reboot.",
            ToolKind::InstallSystem => "Install a system-level package via rpm-ostree. Staged: a reboot is required to apply it.",
            ToolKind::RemoveApp => "Remove an installed application (user flatpak, or staged rpm-ostree removal).",
            ToolKind::RunShell => "Run a shell command as the current user with a 30s timeout. Destructive commands are refused.",
            ToolKind::GetNetworkStatus => "Get the current network state and active connections.",
            ToolKind::SetNetwork => "Enable or disable a NetworkManager connection by name.",
            ToolKind::ManageService => "Start, stop, restart, or get status of a systemd service.",
            ToolKind::EnvcloneInit => "Initialize a new containerized dev environment using envclone.",
            ToolKind::EnvcloneUp => "Start an envclone dev environment.",
            ToolKind::EnvcloneDown => "Stop an envclone dev environment.",
            ToolKind::EnvcloneCode => "Open VSCodium attached to an envclone dev environment.",
        }
    }

    /// JSON schema for the argument object
    pub fn parameters(self) -> Value {
        let name_only = |desc: &str| {
            json!({
                "type": "object",
                "properties": { "name": { "type": "string", "description": desc } },
                "required": ["name"]
            })
        };
        match self {
            ToolKind::LaunchApp => json!({
                "type": "object",
                "properties": {
                    "app": { "type": "string", "description": "App name, e.g. 'firefox', 'browser', 'terminal'" }
                },
                "required": ["app"]
            }),
            ToolKind::InstallApp => name_only("App name or Flathub application ID"),
            ToolKind::InstallSystem => name_only("RPM package name"),
            ToolKind::RemoveApp => name_only("App or package name"),
            ToolKind::RunShell => json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to run" }
                },
                "required": ["command"]
            }),
            ToolKind::GetNetworkStatus => json!({ "type": "object", "properties": {} }),
            ToolKind::SetNetwork => json!({
                "type": "object",
                "properties": {
                    "connection": { "type": "string", "description": "NetworkManager connection name" },
                    "enable": { "type": "boolean" }
                },
                "required": ["connection", "enable"]
            }),
            ToolKind::ManageService => json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string", "description": "systemd unit name" },
                    "action": { "type": "string", "enum": ["start", "stop", "restart", "status"] }
                },
                "required": ["service", "action"]
            }),
            ToolKind::EnvcloneInit => json!({
                "type": "object",
                "properties": {
                    "env_type": { "type": "string", "description": "Environment type, e.g. 'python', 'node', 'rust'" },
                    "name": { "type": "string", "description": "Project name" }
                },
                "required": ["env_type", "name"]
            }),
            ToolKind::EnvcloneUp | ToolKind::EnvcloneDown | ToolKind::EnvcloneCode => {
                name_only("Environment name")
            }
        }
    }

    /// Definition in Ollama's tool format
    pub fn chat_tool(self) -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters(),
            },
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Post-deserialization checks for an argument struct
pub trait Validate {
    fn validate(&self) -> Result<(), ToolError>;
}

/// Reject empty / whitespace-only strings
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::InvalidArgument(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

/// Reject values that could be read as an option by the backend CLI
pub(crate) fn reject_option_like(field: &str, value: &str) -> Result<(), ToolError> {
    if value.starts_with('-') {
        return Err(ToolError::InvalidArgument(format!(
            "'{}' must not start with '-'",
            field
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

impl Validate for NoArgs {
    fn validate(&self) -> Result<(), ToolError> {
        Ok(())
    }
}

fn parse_args<T: DeserializeOwned + Validate>(args: &Value) -> Result<T, ToolError> {
    // Some models send `null` for tools without parameters
    let value = if args.is_null() { json!({}) } else { args.clone() };
    if !value.is_object() {
        return Err(ToolError::InvalidArgument("arguments must be a JSON object".to_string()));
    }
    let parsed: T =
        serde_json::from_value(value).map_err(|e| ToolError::InvalidArgument(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

/// A resolved tool with validated, typed arguments
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    LaunchApp(apps::LaunchArgs),
    InstallApp(packages::PackageArgs),
    InstallSystem(packages::PackageArgs),
    RemoveApp(packages::PackageArgs),
    RunShell(shell::ShellArgs),
    GetNetworkStatus,
    SetNetwork(network::SetNetworkArgs),
    ManageService(services::ServiceArgs),
    EnvcloneInit(devenv::InitArgs),
    EnvcloneUp(devenv::EnvArgs),
    EnvcloneDown(devenv::EnvArgs),
    EnvcloneCode(devenv::EnvArgs),
}

impl ToolInvocation {
    pub fn parse(kind: ToolKind, args: &Value) -> Result<Self, ToolError> {
        Ok(match kind {
            ToolKind::LaunchApp => Self::LaunchApp(parse_args(args)?),
            ToolKind::InstallApp => Self::InstallApp(parse_args(args)?),
            ToolKind::InstallSystem => Self::InstallSystem(parse_args(args)?),
            ToolKind::RemoveApp => Self::RemoveApp(parse_args(args)?),
            ToolKind::RunShell => Self::RunShell(parse_args(args)?),
            ToolKind::GetNetworkStatus => {
                parse_args::<NoArgs>(args)?;
                Self::GetNetworkStatus
            }
            ToolKind::SetNetwork => Self::SetNetwork(parse_args(args)?),
            ToolKind::ManageService => Self::ManageService(parse_args(args)?),
            ToolKind::EnvcloneInit => Self::EnvcloneInit(parse_args(args)?),
            ToolKind::EnvcloneUp => Self::EnvcloneUp(parse_args(args)?),
            ToolKind::EnvcloneDown => Self::EnvcloneDown(parse_args(args)?),
            ToolKind::EnvcloneCode => Self::EnvcloneCode(parse_args(args)?),
        })
    }

    /// Calls whose result is worth keeping as a DataRecord
    pub fn is_inspection(&self) -> bool {
        match self {
            ToolInvocation::GetNetworkStatus => true,
            ToolInvocation::ManageService(args) => args.action == services::ServiceAction::Status,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub shell_timeout_secs: u64,
    pub package_timeout_secs: u64,
    pub service_timeout_secs: u64,
    pub network_timeout_secs: u64,
    /// Bound on the compositor exec step of app launch
    pub launch_timeout_secs: u64,
    pub flatpak_remote: String,
    pub flatpak_remote_url: String,
    /// Dev-environment CLI
    pub envclone_binary: String,
    /// stdout/stderr are truncated to this many bytes each
    pub max_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 30,
            package_timeout_secs: 300,
            service_timeout_secs: 30,
            network_timeout_secs: 30,
            launch_timeout_secs: 5,
            flatpak_remote: "flathub".to_string(),
            flatpak_remote_url: "https://dl.flathub.org/repo/flathub.flatpakrepo".to_string(),
            envclone_binary: "envclone".to_string(),
            max_output_bytes: 16 * 1024,
        }
    }
}

/// Outcome of one dispatch, with enough context to persist it
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub name: String,
    pub tool: Option<ToolKind>,
    pub inspection: bool,
    pub result: Result<Value, ToolError>,
    pub duration: Duration,
}

impl Dispatch {
    /// Result as sent back to the caller: payload on success, error object otherwise
    pub fn payload(&self) -> Value {
        match &self.result {
            Ok(v) => v.clone(),
            Err(e) => e.to_json(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// Closed tool catalog bound to its backends
///
/// Read-only after construction; shared by both transports and every turn.
pub struct ToolRegistry {
    runner: Arc<dyn CommandRunner>,
    guard: Arc<SafetyGuard>,
    config: ToolsConfig,
}

impl ToolRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>, guard: Arc<SafetyGuard>, config: ToolsConfig) -> Self {
        Self {
            runner,
            guard,
            config,
        }
    }

    pub fn resolve(&self, name: &str) -> Result<ToolKind, ToolError> {
        ToolKind::from_name(name).ok_or_else(|| ToolError::NotFound(format!("unknown tool '{}'", name)))
    }

    pub fn kinds(&self) -> &'static [ToolKind] {
        &ToolKind::ALL
    }

    /// Tool definitions for the model request
    pub fn chat_tools(&self) -> Vec<Tool> {
        ToolKind::ALL.iter().map(|k| k.chat_tool()).collect()
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    /// Resolve, validate and execute one call
    ///
    /// Never panics and never returns early without a [`Dispatch`]; every
    /// failure is carried in `result`.
    pub async fn dispatch(&self, name: &str, args: &Value) -> Dispatch {
        let span = info_span!("tool_dispatch", tool = %name, otel.name = "tool_dispatch");
        let start = Instant::now();

        let (tool, inspection, result) = async {
            let kind = match self.resolve(name) {
                Ok(kind) => kind,
                Err(e) => return (None, false, Err(e)),
            };
            let invocation = match ToolInvocation::parse(kind, args) {
                Ok(inv) => inv,
                Err(e) => return (Some(kind), false, Err(e)),
            };
            let inspection = invocation.is_inspection();
            (Some(kind), inspection, self.execute(invocation).await)
        }
        .instrument(span)
        .await;

        let duration = start.elapsed();
        let label = tool.map(ToolKind::name).unwrap_or("unknown");
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        TOOL_CALLS.with_label_values(&[label, outcome]).inc();
        TOOL_CALL_DURATION
            .with_label_values(&[label])
            .observe(duration.as_secs_f64());

        match &result {
            Ok(_) => info!(tool = label, duration_ms = duration.as_millis() as u64, "Tool call succeeded"),
            Err(ToolError::SafetyDenied { rule, command, .. }) => {
                SAFETY_DENIALS.with_label_values(&[rule]).inc();
                warn!(tool = label, rule = %rule, command = %command, "Command refused by safety guard");
            }
            Err(e) => warn!(tool = label, kind = e.kind(), error = %e, "Tool call failed"),
        }

        Dispatch {
            name: name.to_string(),
            tool,
            inspection,
            result,
            duration,
        }
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<Value, ToolError> {
        let runner = self.runner.as_ref();
        let config = &self.config;
        match invocation {
            ToolInvocation::LaunchApp(args) => apps::launch(runner, &self.guard, config, &args).await,
            ToolInvocation::InstallApp(args) => packages::install_user(runner, config, &args).await,
            ToolInvocation::InstallSystem(args) => packages::install_system(runner, config, &args).await,
            ToolInvocation::RemoveApp(args) => packages::remove(runner, config, &args).await,
            ToolInvocation::RunShell(args) => shell::run(runner, &self.guard, config, &args).await,
            ToolInvocation::GetNetworkStatus => network::status(runner, config).await,
            ToolInvocation::SetNetwork(args) => network::set(runner, config, &args).await,
            ToolInvocation::ManageService(args) => services::manage(runner, config, &args).await,
            ToolInvocation::EnvcloneInit(args) => devenv::init(runner, config, &args).await,
            ToolInvocation::EnvcloneUp(args) => devenv::up(runner, config, &args).await,
            ToolInvocation::EnvcloneDown(args) => devenv::down(runner, config, &args).await,
            ToolInvocation::EnvcloneCode(args) => devenv::open_editor(runner, config, &args).await,
        }
    }
}
