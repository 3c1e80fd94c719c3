//! Application launcher
//!
//! Resolution order: alias, binary on `PATH`, compositor exec, desktop entry.
//! A launch succeeds as soon as a process has been spawned; the app's own
//! exit status is never observed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::runner::{CommandRunner, CommandSpec};
use super::{reject_option_like, require_non_empty, ToolError, ToolsConfig, Validate};
use crate::security::{SafetyGuard, Verdict};

/// Friendly names the model tends to use
const APP_ALIASES: &[(&str, &str)] = &[
    ("browser", "firefox"),
    ("web", "firefox"),
    ("web browser", "firefox"),
    ("terminal", "kitty"),
    ("term", "kitty"),
    ("editor", "codium"),
    ("vscode", "codium"),
    ("code", "codium"),
    ("files", "nautilus"),
    ("file manager", "nautilus"),
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchArgs {
    pub app: String,
}

impl Validate for LaunchArgs {
    fn validate(&self) -> Result<(), ToolError> {
        require_non_empty("app", &self.app)?;
        reject_option_like("app", self.app.trim())?;
        if !is_app_name(self.app.trim()) {
            return Err(ToolError::InvalidArgument(
                "'app' must be an application name (letters, digits, spaces and . _ + -)".to_string(),
            ));
        }
        Ok(())
    }
}

/// `^[A-Za-z0-9][A-Za-z0-9 ._+-]*$`
///
/// The compositor hands the name to a shell, so nothing else gets through.
fn is_app_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '+' | '-'))
}

/// Map a friendly name to the binary / entry name to look for
pub fn resolve_alias(app: &str) -> String {
    let key = app.trim().to_lowercase();
    APP_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, target)| target.to_string())
        .unwrap_or_else(|| app.trim().to_string())
}

/// XDG application directories, including flatpak exports
pub fn desktop_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/usr/share/applications"),
        PathBuf::from("/usr/local/share/applications"),
        PathBuf::from("/var/lib/flatpak/exports/share/applications"),
    ];
    if let Some(data) = dirs::data_dir() {
        dirs.push(data.join("applications"));
        dirs.push(data.join("flatpak/exports/share/applications"));
    }
    dirs
}

/// First `.desktop` entry whose file stem contains `app` (case-insensitive)
///
/// Entries are visited in sorted order per directory, so the result is
/// stable across runs.
pub fn find_desktop_entry(dirs: &[PathBuf], app: &str) -> Option<String> {
    let needle = app.to_lowercase();
    for dir in dirs {
        let Ok(read) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut stems: Vec<String> = read
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "desktop").unwrap_or(false))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        stems.sort();
        if let Some(stem) = stems.into_iter().find(|s| s.to_lowercase().contains(&needle)) {
            return Some(stem);
        }
    }
    None
}

fn launched(app: &str, method: &str, pid: Option<u32>) -> Value {
    let mut v = json!({ "status": "launched", "app": app, "method": method });
    if let Some(pid) = pid {
        v["pid"] = json!(pid);
    }
    v
}

pub async fn launch(
    runner: &dyn CommandRunner,
    guard: &SafetyGuard,
    config: &ToolsConfig,
    args: &LaunchArgs,
) -> Result<Value, ToolError> {
    launch_with_dirs(runner, guard, config, args, &desktop_dirs()).await
}

pub(crate) async fn launch_with_dirs(
    runner: &dyn CommandRunner,
    guard: &SafetyGuard,
    config: &ToolsConfig,
    args: &LaunchArgs,
    entry_dirs: &[PathBuf],
) -> Result<Value, ToolError> {
    args.validate()?;
    let resolved = resolve_alias(&args.app);

    if let Some(binary) = runner.locate(&resolved) {
        let pid = runner.spawn_detached(&CommandSpec::new(path_str(&binary)))?;
        return Ok(launched(&resolved, "binary", Some(pid)));
    }

    if runner.locate("hyprctl").is_some() {
        if let Verdict::Deny { rule, reason } = guard.check(&resolved) {
            return Err(ToolError::SafetyDenied {
                command: resolved,
                rule,
                reason,
            });
        }
        let spec = CommandSpec::new("hyprctl")
            .args(["dispatch", "exec", resolved.as_str()])
            .timeout(Duration::from_secs(config.launch_timeout_secs));
        match runner.run(&spec).await {
            Ok(out) if out.success() => return Ok(launched(&resolved, "hyprctl", None)),
            Ok(out) => debug!(app = %resolved, output = %out.diagnostic(), "hyprctl exec failed"),
            Err(e) => debug!(app = %resolved, error = %e, "hyprctl exec failed"),
        }
    }

    if let Some(entry) = find_desktop_entry(entry_dirs, &resolved) {
        if runner.locate("gtk-launch").is_some() {
            let pid = runner.spawn_detached(&CommandSpec::new("gtk-launch").arg(entry.as_str()))?;
            return Ok(launched(&entry, "gtk-launch", Some(pid)));
        }
        return Err(ToolError::Backend(format!(
            "found desktop entry '{}' but gtk-launch is not installed",
            entry
        )));
    }

    Err(ToolError::NotFound(format!(
        "could not find or launch '{}'. Is it installed?",
        args.app
    )))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
