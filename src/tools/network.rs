//! NetworkManager adapter (nmcli, terse mode)
//!
//! Mutations are idempotent: asking for the state a connection is already in
//! succeeds without touching it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::runner::{CommandRunner, CommandSpec};
use super::{reject_option_like, require_non_empty, ToolError, ToolsConfig, Validate};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetNetworkArgs {
    pub connection: String,
    pub enable: bool,
}

impl Validate for SetNetworkArgs {
    fn validate(&self) -> Result<(), ToolError> {
        require_non_empty("connection", &self.connection)?;
        reject_option_like("connection", &self.connection)
    }
}

/// One active connection as reported by nmcli
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveConnection {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub device: String,
    pub state: String,
}

/// Split a `-t` (terse) nmcli line on unescaped colons
///
/// nmcli escapes literal `:` and `\` in values as `\:` and `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn nmcli(config: &ToolsConfig) -> CommandSpec {
    CommandSpec::new("nmcli")
        .arg("-t")
        .timeout(Duration::from_secs(config.network_timeout_secs))
}

async fn nmcli_checked(runner: &dyn CommandRunner, spec: CommandSpec) -> Result<String, ToolError> {
    let out = runner.run(&spec).await?;
    if !out.success() {
        return Err(ToolError::Backend(format!("nmcli failed: {}", out.diagnostic())));
    }
    Ok(out.stdout)
}

fn require_nmcli(runner: &dyn CommandRunner) -> Result<(), ToolError> {
    if runner.locate("nmcli").is_none() {
        return Err(ToolError::Backend("NetworkManager (nmcli) is not available".to_string()));
    }
    Ok(())
}

pub async fn status(runner: &dyn CommandRunner, config: &ToolsConfig) -> Result<Value, ToolError> {
    require_nmcli(runner)?;

    let general = nmcli_checked(runner, nmcli(config).args(["-f", "STATE", "general"])).await?;
    let state = general.lines().next().unwrap_or("unknown").trim().to_string();

    let active = nmcli_checked(
        runner,
        nmcli(config).args(["-f", "NAME,TYPE,DEVICE,STATE", "connection", "show", "--active"]),
    )
    .await?;
    let connections: Vec<ActiveConnection> = active
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(split_terse)
        .filter(|f| f.len() >= 4)
        .map(|f| ActiveConnection {
            name: f[0].clone(),
            kind: f[1].clone(),
            device: f[2].clone(),
            state: f[3].clone(),
        })
        .collect();

    Ok(json!({
        "state": state,
        "active_connections": connections,
    }))
}

/// `Some(active)` for a known connection, `None` if NetworkManager has no such profile
async fn connection_active(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    name: &str,
) -> Result<Option<bool>, ToolError> {
    let listing = nmcli_checked(
        runner,
        nmcli(config).args(["-f", "NAME,ACTIVE", "connection", "show"]),
    )
    .await?;
    Ok(listing
        .lines()
        .map(split_terse)
        .find(|f| f.len() >= 2 && f[0] == name)
        .map(|f| f[1] == "yes"))
}

pub async fn set(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &SetNetworkArgs,
) -> Result<Value, ToolError> {
    require_nmcli(runner)?;

    let current = connection_active(runner, config, &args.connection)
        .await?
        .ok_or_else(|| ToolError::NotFound(format!("no connection named '{}'", args.connection)))?;

    let result = |changed: bool| {
        json!({
            "status": "success",
            "connection": args.connection,
            "enabled": args.enable,
            "changed": changed,
        })
    };

    if current == args.enable {
        return Ok(result(false));
    }

    let action = if args.enable { "up" } else { "down" };
    let spec = CommandSpec::new("nmcli")
        .args(["connection", action, args.connection.as_str()])
        .timeout(Duration::from_secs(config.network_timeout_secs));
    let out = runner.run(&spec).await?;
    if out.success() {
        info!(connection = %args.connection, enabled = args.enable, "Network connection changed");
        return Ok(result(true));
    }

    // Lost a race with another client: the desired state still counts
    if connection_active(runner, config, &args.connection).await? == Some(args.enable) {
        return Ok(result(false));
    }
    Err(ToolError::Backend(format!(
        "nmcli connection {} failed: {}",
        action,
        out.diagnostic()
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::tools::runner::spy::SpyRunner;

    #[test]
    fn test_split_terse_handles_escapes() {
        assert_eq!(split_terse("Home WiFi:wifi:wlan0:activated"), vec!["Home WiFi", "wifi", "wlan0", "activated"]);
        assert_eq!(split_terse(r"a\:b:c\\d:"), vec!["a:b", r"c\d", ""]);
    }

    /// nmcli stand-in holding one connection "office" with the given state
    fn fake_nmcli(active: Arc<AtomicBool>) -> SpyRunner {
        SpyRunner::new(&["nmcli"], move |spec| {
            let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["-t", "-f", "NAME,ACTIVE", "connection", "show"] => {
                    let flag = if active.load(Ordering::SeqCst) { "yes" } else { "no" };
                    SpyRunner::ok(&format!("office:{}\nlo:yes\n", flag))
                }
                ["connection", "down", "office"] => {
                    if active.swap(false, Ordering::SeqCst) {
                        SpyRunner::ok("Connection successfully deactivated")
                    } else {
                        SpyRunner::fail(10, "Error: 'office' is not an active connection.")
                    }
                }
                ["connection", "up", "office"] => {
                    active.store(true, Ordering::SeqCst);
                    SpyRunner::ok("Connection successfully activated")
                }
                other => panic!("unexpected nmcli call {:?}", other),
            }
        })
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_idempotent() {
        let active = Arc::new(AtomicBool::new(true));
        let spy = fake_nmcli(active.clone());
        let args = SetNetworkArgs { connection: "office".into(), enable: false };
        let config = ToolsConfig::default();

        let first = set(&spy, &config, &args).await.unwrap();
        assert_eq!(first["changed"], true);
        let second = set(&spy, &config, &args).await.unwrap();
        assert_eq!(second["changed"], false);
        assert_eq!(second["status"], "success");

        assert!(!active.load(Ordering::SeqCst));
        let downs = spy.commands().iter().filter(|c| c.contains("connection down")).count();
        assert_eq!(downs, 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_not_found() {
        let spy = fake_nmcli(Arc::new(AtomicBool::new(true)));
        let args = SetNetworkArgs { connection: "cafe".into(), enable: true };
        let err = set(&spy, &ToolsConfig::default(), &args).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_status_parses_active_connections() {
        let spy = SpyRunner::new(&["nmcli"], |spec| {
            if spec.args.iter().any(|a| a == "general") {
                SpyRunner::ok("connected\n")
            } else {
                SpyRunner::ok("Home\\:5G:802-11-wireless:wlan0:activated\nvirbr0:bridge:virbr0:activated\n")
            }
        });
        let out = status(&spy, &ToolsConfig::default()).await.unwrap();
        assert_eq!(out["state"], "connected");
        assert_eq!(out["active_connections"][0]["name"], "Home:5G");
        assert_eq!(out["active_connections"][0]["type"], "802-11-wireless");
        assert_eq!(out["active_connections"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_nmcli() {
        let spy = SpyRunner::new(&[], |_| SpyRunner::ok(""));
        assert_eq!(status(&spy, &ToolsConfig::default()).await.unwrap_err().kind(), "backend_error");
    }
}
