//! envclone dev-environment lifecycle
//!
//! Thin pass-through to the external CLI. Nothing is cached: each call reflects
//! whatever envclone reports at that moment.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::runner::{CommandRunner, CommandSpec};
use super::shell::truncate_output;
use super::{reject_option_like, require_non_empty, ToolError, ToolsConfig, Validate};

const INIT_TIMEOUT: Duration = Duration::from_secs(120);
const UP_TIMEOUT: Duration = Duration::from_secs(60);
const DOWN_TIMEOUT: Duration = Duration::from_secs(30);
const CODE_TIMEOUT: Duration = Duration::from_secs(30);

fn check_identifier(field: &str, value: &str) -> Result<(), ToolError> {
    require_non_empty(field, value)?;
    reject_option_like(field, value)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ToolError::InvalidArgument(format!(
            "'{}' may only contain letters, digits, '.', '_' and '-'",
            field
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitArgs {
    pub env_type: String,
    pub name: String,
}

impl Validate for InitArgs {
    fn validate(&self) -> Result<(), ToolError> {
        check_identifier("env_type", &self.env_type)?;
        check_identifier("name", &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvArgs {
    pub name: String,
}

impl Validate for EnvArgs {
    fn validate(&self) -> Result<(), ToolError> {
        check_identifier("name", &self.name)
    }
}

async fn envclone(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &[&str],
    timeout: Duration,
) -> Result<Value, ToolError> {
    if runner.locate(&config.envclone_binary).is_none() {
        return Err(ToolError::Backend(format!(
            "{} is not installed",
            config.envclone_binary
        )));
    }
    let spec = CommandSpec::new(config.envclone_binary.as_str())
        .args(args.iter().copied())
        .timeout(timeout);
    let out = runner.run(&spec).await?;
    if !out.success() {
        let diagnostic = out.diagnostic();
        let message = if diagnostic.is_empty() {
            format!("envclone exited {}", out.exit_code)
        } else {
            diagnostic
        };
        return Err(ToolError::Backend(message));
    }
    Ok(json!({
        "status": "success",
        "output": truncate_output(&out.stdout, config.max_output_bytes),
    }))
}

pub async fn init(runner: &dyn CommandRunner, config: &ToolsConfig, args: &InitArgs) -> Result<Value, ToolError> {
    envclone(runner, config, &["init", &args.env_type, &args.name], INIT_TIMEOUT).await
}

pub async fn up(runner: &dyn CommandRunner, config: &ToolsConfig, args: &EnvArgs) -> Result<Value, ToolError> {
    envclone(runner, config, &["up", &args.name], UP_TIMEOUT).await
}

pub async fn down(runner: &dyn CommandRunner, config: &ToolsConfig, args: &EnvArgs) -> Result<Value, ToolError> {
    envclone(runner, config, &["down", &args.name], DOWN_TIMEOUT).await
}

pub async fn open_editor(runner: &dyn CommandRunner, config: &ToolsConfig, args: &EnvArgs) -> Result<Value, ToolError> {
    envclone(runner, config, &["code", &args.name], CODE_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::runner::spy::SpyRunner;

    #[tokio::test]
    async fn test_init_passes_type_and_name() {
        let spy = SpyRunner::new(&["envclone"], |spec| {
            assert_eq!(spec.timeout, INIT_TIMEOUT);
            SpyRunner::ok("created env api\n")
        });
        let args = InitArgs { env_type: "rust".into(), name: "api".into() };
        let out = init(&spy, &ToolsConfig::default(), &args).await.unwrap();
        assert_eq!(out["output"], "created env api");
        assert_eq!(spy.commands(), vec!["envclone init rust api"]);
    }

    #[tokio::test]
    async fn test_failure_surfaces_exit_code_when_silent() {
        let spy = SpyRunner::new(&["envclone"], |_| SpyRunner::fail(3, ""));
        let err = down(&spy, &ToolsConfig::default(), &EnvArgs { name: "api".into() })
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::Backend("envclone exited 3".into()));
    }

    #[tokio::test]
    async fn test_every_call_reaches_the_cli() {
        let spy = SpyRunner::new(&["envclone"], |_| SpyRunner::ok(""));
        let args = EnvArgs { name: "api".into() };
        up(&spy, &ToolsConfig::default(), &args).await.unwrap();
        up(&spy, &ToolsConfig::default(), &args).await.unwrap();
        open_editor(&spy, &ToolsConfig::default(), &args).await.unwrap();
        assert_eq!(spy.commands(), vec!["envclone up api", "envclone up api", "envclone code api"]);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(EnvArgs { name: "my-app_2".into() }.validate().is_ok());
        assert!(EnvArgs { name: "../etc".into() }.validate().is_err());
        assert!(EnvArgs { name: "-rf".into() }.validate().is_err());
    }
}
