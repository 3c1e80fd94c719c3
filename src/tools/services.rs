//! systemd service management
//!
//! User units shadow system units of the same name: the user manager is
//! consulted first.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use super::runner::{CommandRunner, CommandSpec};
use super::{reject_option_like, require_non_empty, ToolError, ToolsConfig, Validate};

const UNIT_SUFFIXES: &[&str] = &[
    ".service", ".socket", ".timer", ".target", ".mount", ".path", ".slice",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl ServiceAction {
    fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceArgs {
    pub service: String,
    pub action: ServiceAction,
}

impl Validate for ServiceArgs {
    fn validate(&self) -> Result<(), ToolError> {
        require_non_empty("service", &self.service)?;
        reject_option_like("service", &self.service)?;
        let valid = self
            .service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | ':' | '\\'));
        if !valid {
            return Err(ToolError::InvalidArgument(format!(
                "'{}' is not a valid unit name",
                self.service
            )));
        }
        Ok(())
    }
}

/// Append `.service` unless the name already carries a unit suffix
pub fn unit_name(service: &str) -> String {
    if UNIT_SUFFIXES.iter().any(|s| service.ends_with(s)) {
        service.to_string()
    } else {
        format!("{}.service", service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    User,
    System,
}

impl Scope {
    fn flag(self) -> &'static str {
        match self {
            Scope::User => "--user",
            Scope::System => "--system",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::System => "system",
        }
    }
}

fn systemctl(config: &ToolsConfig, scope: Scope) -> CommandSpec {
    CommandSpec::new("systemctl")
        .arg(scope.flag())
        .timeout(Duration::from_secs(config.service_timeout_secs))
}

/// First scope whose manager knows the unit
async fn find_scope(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    unit: &str,
) -> Result<Option<Scope>, ToolError> {
    for scope in [Scope::User, Scope::System] {
        let spec = systemctl(config, scope).args(["show", "-p", "LoadState", "--value", unit]);
        let out = runner.run(&spec).await?;
        let load_state = out.stdout.trim();
        if out.success() && !load_state.is_empty() && load_state != "not-found" {
            return Ok(Some(scope));
        }
    }
    Ok(None)
}

/// `Key=Value` lines into a JSON object
fn parse_properties(text: &str) -> Map<String, Value> {
    text.lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

pub async fn manage(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &ServiceArgs,
) -> Result<Value, ToolError> {
    if runner.locate("systemctl").is_none() {
        return Err(ToolError::Backend("systemctl is not available".to_string()));
    }
    let unit = unit_name(&args.service);

    let scope = find_scope(runner, config, &unit)
        .await?
        .ok_or_else(|| ToolError::NotFound(format!("unit '{}' not found in user or system scope", unit)))?;

    if args.action == ServiceAction::Status {
        let spec = systemctl(config, scope).args([
            "show",
            "-p",
            "Id,Description,LoadState,ActiveState,SubState,UnitFileState",
            unit.as_str(),
        ]);
        let out = runner.run(&spec).await?;
        if !out.success() {
            return Err(ToolError::Backend(format!("systemctl show failed: {}", out.diagnostic())));
        }
        let properties = parse_properties(&out.stdout);
        let active = properties.get("ActiveState").and_then(Value::as_str) == Some("active");
        return Ok(json!({
            "service": unit,
            "scope": scope.label(),
            "active": active,
            "properties": properties,
        }));
    }

    let spec = systemctl(config, scope).args([args.action.as_str(), unit.as_str()]);
    let out = runner.run(&spec).await?;
    if !out.success() {
        return Err(ToolError::Backend(format!(
            "systemctl {} {} failed: {}",
            args.action.as_str(),
            unit,
            out.diagnostic()
        )));
    }

    info!(unit = %unit, action = args.action.as_str(), scope = scope.label(), "Service action applied");
    Ok(json!({
        "status": "success",
        "service": unit,
        "action": args.action,
        "scope": scope.label(),
    }))
}
