//! Shell command tool
//!
//! The safety guard runs first; a denied command never reaches the runner.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::runner::{CommandRunner, CommandSpec};
use super::{require_non_empty, ToolError, ToolsConfig, Validate};
use crate::security::{SafetyGuard, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellArgs {
    pub command: String,
}

impl Validate for ShellArgs {
    fn validate(&self) -> Result<(), ToolError> {
        require_non_empty("command", &self.command)?;
        if self.command.contains('\0') {
            return Err(ToolError::InvalidArgument("'command' contains a NUL byte".to_string()));
        }
        Ok(())
    }
}

/// Trim and cap output at `max` bytes on a char boundary
pub fn truncate_output(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... truncated {} bytes]", &text[..end], text.len() - end)
}

pub async fn run(
    runner: &dyn CommandRunner,
    guard: &SafetyGuard,
    config: &ToolsConfig,
    args: &ShellArgs,
) -> Result<Value, ToolError> {
    if let Verdict::Deny { rule, reason } = guard.check(&args.command) {
        return Err(ToolError::SafetyDenied {
            command: args.command.clone(),
            rule,
            reason,
        });
    }

    let spec = CommandSpec::new("sh")
        .args(["-c", args.command.as_str()])
        .timeout(Duration::from_secs(config.shell_timeout_secs));
    let out = runner.run(&spec).await?;

    Ok(json!({
        "exit_code": out.exit_code,
        "stdout": truncate_output(&out.stdout, config.max_output_bytes),
        "stderr": truncate_output(&out.stderr, config.max_output_bytes),
        "success": out.success(),
    }))
}
