//! Package installation and removal
//!
//! Two mutually exclusive paths:
//!
//! | backend  | tool        | takes effect          |
//! |----------|-------------|-----------------------|
//! | `user`   | flatpak     | immediately           |
//! | `system` | rpm-ostree  | after reboot (staged) |
//!
//! Every result discloses `backend`, `method` and `reboot_pending` so the
//! reply can tell the user whether a reboot is needed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::runner::{CommandRunner, CommandSpec};
use super::{reject_option_like, require_non_empty, ToolError, ToolsConfig, Validate};

/// Common names mapped to Flathub application IDs
const FLATPAK_IDS: &[(&str, &str)] = &[
    ("firefox", "org.mozilla.firefox"),
    ("gimp", "org.gimp.GIMP"),
    ("obs", "com.obsproject.Studio"),
    ("obs-studio", "com.obsproject.Studio"),
    ("vlc", "org.videolan.VLC"),
    ("htop", "io.github.htop-dev.htop"),
    ("discord", "com.discordapp.Discord"),
    ("slack", "com.slack.Slack"),
    ("zoom", "us.zoom.Zoom"),
    ("libreoffice", "org.libreoffice.LibreOffice"),
    ("signal", "org.signal.Signal"),
    ("telegram", "org.telegram.desktop"),
    ("spotify", "com.spotify.Client"),
    ("inkscape", "org.inkscape.Inkscape"),
    ("blender", "org.blender.Blender"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageArgs {
    pub name: String,
}

impl Validate for PackageArgs {
    fn validate(&self) -> Result<(), ToolError> {
        require_non_empty("name", &self.name)?;
        reject_option_like("name", &self.name)?;
        if !is_package_name(&self.name) {
            return Err(ToolError::InvalidArgument(format!(
                "'{}' is not a valid package name",
                self.name
            )));
        }
        Ok(())
    }
}

/// `^[A-Za-z0-9][A-Za-z0-9._+-]*$`
fn is_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

/// Flathub ID for a friendly name; IDs and unknown names pass through
pub fn flatpak_id(name: &str) -> String {
    let key = name.to_lowercase();
    FLATPAK_IDS
        .iter()
        .find(|(n, _)| *n == key)
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn package_timeout(config: &ToolsConfig) -> Duration {
    Duration::from_secs(config.package_timeout_secs)
}

fn require_tool(runner: &dyn CommandRunner, program: &str) -> Result<(), ToolError> {
    if runner.locate(program).is_none() {
        return Err(ToolError::Backend(format!("{} is not available", program)));
    }
    Ok(())
}

/// Immediate, user-scoped flatpak install
pub async fn install_user(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &PackageArgs,
) -> Result<Value, ToolError> {
    require_tool(runner, "flatpak")?;
    let app_id = flatpak_id(&args.name);

    let remote = CommandSpec::new("flatpak")
        .args(["remote-add", "--if-not-exists", "--user"])
        .args([config.flatpak_remote.as_str(), config.flatpak_remote_url.as_str()])
        .timeout(Duration::from_secs(60));
    let out = runner.run(&remote).await?;
    if !out.success() {
        // install below reports the real failure if the remote is unusable
        debug!(remote = %config.flatpak_remote, output = %out.diagnostic(), "flatpak remote-add failed");
    }

    let install = CommandSpec::new("flatpak")
        .args(["install", "--user", "--noninteractive"])
        .args([config.flatpak_remote.as_str(), app_id.as_str()])
        .timeout(package_timeout(config));
    let out = runner.run(&install).await?;
    if !out.success() {
        return Err(ToolError::Backend(format!(
            "flatpak install failed: {}",
            out.diagnostic()
        )));
    }

    info!(name = %args.name, app_id = %app_id, "Installed user flatpak");
    Ok(json!({
        "status": "installed",
        "name": args.name,
        "app_id": app_id,
        "backend": Backend::User,
        "method": "flatpak",
        "reboot_pending": false,
    }))
}

/// Staged rpm-ostree layering; applied on next boot
pub async fn install_system(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &PackageArgs,
) -> Result<Value, ToolError> {
    require_tool(runner, "rpm-ostree")?;

    let spec = CommandSpec::new("rpm-ostree")
        .args(["install", "--idempotent", args.name.as_str()])
        .timeout(package_timeout(config));
    let out = runner.run(&spec).await?;
    if !out.success() {
        return Err(ToolError::Backend(format!(
            "rpm-ostree install failed: {}",
            out.diagnostic()
        )));
    }

    info!(name = %args.name, "Staged system package");
    Ok(json!({
        "status": "staged",
        "name": args.name,
        "backend": Backend::System,
        "method": "rpm-ostree",
        "reboot_pending": true,
        "note": "Reboot required to apply. Run: systemctl reboot",
    }))
}

/// Remove a user flatpak, else stage removal of a system package
pub async fn remove(
    runner: &dyn CommandRunner,
    config: &ToolsConfig,
    args: &PackageArgs,
) -> Result<Value, ToolError> {
    let has_flatpak = runner.locate("flatpak").is_some();
    let has_ostree = runner.locate("rpm-ostree").is_some();
    if !has_flatpak && !has_ostree {
        return Err(ToolError::Backend("no package backend is available".to_string()));
    }

    let mut failures = Vec::new();

    if has_flatpak {
        let app_id = flatpak_id(&args.name);
        let spec = CommandSpec::new("flatpak")
            .args(["uninstall", "--user", "--noninteractive", app_id.as_str()])
            .timeout(package_timeout(config));
        let out = runner.run(&spec).await?;
        if out.success() {
            info!(name = %args.name, app_id = %app_id, "Removed user flatpak");
            return Ok(json!({
                "status": "removed",
                "name": args.name,
                "app_id": app_id,
                "backend": Backend::User,
                "method": "flatpak",
                "reboot_pending": false,
            }));
        }
        failures.push(format!("flatpak: {}", out.diagnostic()));
    }

    if has_ostree {
        // Layered packages are uninstalled; base-image packages need an override
        for (sub, label) in [
            (&["uninstall"][..], "rpm-ostree uninstall"),
            (&["override", "remove"][..], "rpm-ostree override remove"),
        ] {
            let spec = CommandSpec::new("rpm-ostree")
                .args(sub.iter().copied())
                .arg(args.name.as_str())
                .timeout(package_timeout(config));
            let out = runner.run(&spec).await?;
            if out.success() {
                info!(name = %args.name, method = label, "Staged package removal");
                return Ok(json!({
                    "status": "staged_removal",
                    "name": args.name,
                    "backend": Backend::System,
                    "method": label,
                    "reboot_pending": true,
                    "note": "Reboot required to apply removal.",
                }));
            }
            failures.push(format!("{}: {}", label, out.diagnostic()));
        }
    }

    let detail = failures.join("; ");
    if failures.iter().all(|f| reports_not_installed(f)) {
        return Err(ToolError::NotFound(format!(
            "'{}' is not installed ({})",
            args.name, detail
        )));
    }
    Err(ToolError::Backend(format!("could not remove '{}': {}", args.name, detail)))
}

/// Backend diagnostics that mean the package simply is not there
fn reports_not_installed(diagnostic: &str) -> bool {
    const MARKERS: &[&str] = &[
        "not installed",
        "no such ref",
        "not found",
        "no packages to remove",
        "not currently requested",
        "is not a base package",
    ];
    let lower = diagnostic.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::runner::spy::SpyRunner;

    fn args(name: &str) -> PackageArgs {
        PackageArgs { name: name.to_string() }
    }

    #[test]
    fn test_package_name_validation() {
        for ok in ["htop", "org.gimp.GIMP", "gcc-c++", "python3.12", "libfoo_bar"] {
            assert!(args(ok).validate().is_ok(), "{ok}");
        }
        for bad in ["", "-y", "htop; rm", "a b", "../x", "$(id)"] {
            assert!(args(bad).validate().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_flatpak_id_map() {
        assert_eq!(flatpak_id("GIMP"), "org.gimp.GIMP");
        assert_eq!(flatpak_id("org.kde.krita"), "org.kde.krita");
    }

    #[tokio::test]
    async fn test_install_user_adds_remote_then_installs() {
        let spy = SpyRunner::new(&["flatpak"], |_| SpyRunner::ok(""));
        let out = install_user(&spy, &ToolsConfig::default(), &args("vlc")).await.unwrap();
        assert_eq!(out["backend"], "user");
        assert_eq!(out["reboot_pending"], false);
        assert_eq!(out["app_id"], "org.videolan.VLC");
        let cmds = spy.commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].starts_with("flatpak remote-add --if-not-exists --user flathub"));
        assert_eq!(cmds[1], "flatpak install --user --noninteractive flathub org.videolan.VLC");
    }

    #[tokio::test]
    async fn test_install_user_never_falls_back_to_system() {
        let spy = SpyRunner::new(&["flatpak", "rpm-ostree"], |spec| {
            if spec.args.first().map(String::as_str) == Some("install") {
                SpyRunner::fail(1, "No remote refs found")
            } else {
                SpyRunner::ok("")
            }
        });
        let err = install_user(&spy, &ToolsConfig::default(), &args("nosuch")).await.unwrap_err();
        assert_eq!(err.kind(), "backend_error");
        assert!(spy.commands().iter().all(|c| !c.starts_with("rpm-ostree")));
    }

    #[tokio::test]
    async fn test_install_system_is_staged() {
        let spy = SpyRunner::new(&["rpm-ostree"], |_| SpyRunner::ok("Run \"systemctl reboot\" to start a reboot"));
        let out = install_system(&spy, &ToolsConfig::default(), &args("htop")).await.unwrap();
        assert_eq!(out["backend"], "system");
        assert_eq!(out["status"], "staged");
        assert_eq!(out["reboot_pending"], true);
        assert_eq!(spy.commands(), vec!["rpm-ostree install --idempotent htop"]);
    }

    #[tokio::test]
    async fn test_install_system_without_rpm_ostree() {
        let spy = SpyRunner::new(&[], |_| SpyRunner::ok(""));
        let err = install_system(&spy, &ToolsConfig::default(), &args("htop")).await.unwrap_err();
        assert_eq!(err.kind(), "backend_error");
        assert!(spy.commands().is_empty());
    }

    #[tokio::test]
    async fn test_remove_falls_back_to_staged_override() {
        let spy = SpyRunner::new(&["flatpak", "rpm-ostree"], |spec| match spec.args[0].as_str() {
            "override" => SpyRunner::ok(""),
            _ => SpyRunner::fail(1, "not installed"),
        });
        let out = remove(&spy, &ToolsConfig::default(), &args("firefox")).await.unwrap();
        assert_eq!(out["backend"], "system");
        assert_eq!(out["method"], "rpm-ostree override remove");
        assert_eq!(out["reboot_pending"], true);
        assert_eq!(
            spy.commands(),
            vec![
                "flatpak uninstall --user --noninteractive org.mozilla.firefox",
                "rpm-ostree uninstall firefox",
                "rpm-ostree override remove firefox",
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_package() {
        let spy = SpyRunner::new(&["flatpak", "rpm-ostree"], |spec| {
            if spec.program == "flatpak" {
                SpyRunner::fail(1, "error: No such ref 'app/ghost' in installation")
            } else {
                SpyRunner::fail(1, "error: Package/capability 'ghost' is not currently requested")
            }
        });
        let err = remove(&spy, &ToolsConfig::default(), &args("ghost")).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_remove_failure_is_backend_error() {
        let spy = SpyRunner::new(&["flatpak", "rpm-ostree"], |spec| {
            if spec.program == "flatpak" {
                SpyRunner::fail(1, "error: No such ref 'app/htop' in installation")
            } else {
                SpyRunner::fail(1, "error: Transaction in progress: install htop")
            }
        });
        let err = remove(&spy, &ToolsConfig::default(), &args("htop")).await.unwrap_err();
        assert_eq!(err.kind(), "backend_error");
        assert!(err.to_string().contains("Transaction in progress"));
    }

    #[test]
    fn test_not_installed_diagnostics() {
        assert!(reports_not_installed("error: htop not installed"));
        assert!(reports_not_installed("error: No such ref 'app/x'"));
        assert!(!reports_not_installed("error: Access denied"));
        assert!(!reports_not_installed("error: Transaction in progress"));
    }
}
