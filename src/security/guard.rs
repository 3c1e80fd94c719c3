//! Deny-pattern guard for shell commands
//!
//! Every command the shell tool is asked to run passes through
//! [`SafetyGuard::check`] first. A match against any rule is an unconditional
//! deny; nothing is spawned.
//!
//! ```text
//! run_shell("rm -rf /")
//!        │
//!        ▼
//! ┌──────────────┐  match   ┌──────────────────────────────┐
//! │ SafetyGuard  │ ───────► │ Deny { rule, reason }        │
//! │  (regex set) │          └──────────────────────────────┘
//! └──────────────┘
//!        │ no match
//!        ▼
//!    sh -c "..."
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single deny rule as it appears in the `[safety]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub name: String,
    pub pattern: String,
    pub reason: String,
}

impl DenyRule {
    pub fn new(name: &str, pattern: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Built-in rules used when the config does not override them
pub fn default_rules() -> Vec<DenyRule> {
    vec![
        DenyRule::new(
            "recursive_root_delete",
            r"\brm\s+(?:-[A-Za-z-]+\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(?:-[A-Za-z-]+\s+)*/+(?:\*|\s|;|&|\||$)",
            "recursive deletion of the root filesystem",
        ),
        DenyRule::new(
            "block_device_overwrite",
            r">\s*/dev/(?:sd[a-z]|nvme\d|vd[a-z]|hd[a-z]|mmcblk\d)",
            "redirecting output onto a block device",
        ),
        DenyRule::new(
            "dd_to_device",
            r"\bdd\s+.*\bof=/dev/",
            "writing raw data to a device with dd",
        ),
        DenyRule::new(
            "format_filesystem",
            r"\bmkfs(?:\.\w+)?\b",
            "formatting a filesystem",
        ),
        DenyRule::new(
            "fork_bomb",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
        DenyRule::new(
            "root_shell",
            r"\bsudo\s+(?:-\S+\s+)*su\b",
            "escalating to a root shell",
        ),
        DenyRule::new(
            "root_password",
            r"\bpasswd\s+root\b",
            "changing the root password",
        ),
        DenyRule::new(
            "package_manager_bypass",
            r"\b(?:rpm-ostree|flatpak)\s+",
            "package changes must go through install_app, install_system or remove_app",
        ),
    ]
}

/// Outcome of a guard check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { rule: String, reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

struct CompiledRule {
    name: String,
    reason: String,
    regex: Regex,
}

/// Compiled, immutable rule set
///
/// Built once at start-up and shared read-only between turns.
pub struct SafetyGuard {
    rules: Vec<CompiledRule>,
}

impl SafetyGuard {
    /// Compile a rule set. Fails on the first invalid pattern.
    pub fn new(rules: &[DenyRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    name: r.name.clone(),
                    reason: r.reason.clone(),
                    regex: Regex::new(&r.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Guard with the built-in rules
    pub fn with_defaults() -> Self {
        // Built-in patterns are covered by test_default_rules_compile
        Self::new(&default_rules()).expect("built-in deny rules must compile")
    }

    /// Check a proposed command. First matching rule wins.
    pub fn check(&self, command: &str) -> Verdict {
        for rule in &self.rules {
            if rule.regex.is_match(command) {
                return Verdict::Deny {
                    rule: rule.name.clone(),
                    reason: rule.reason.clone(),
                };
            }
        }
        Verdict::Allow
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl std::fmt::Debug for SafetyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGuard")
            .field("rules", &self.rules.iter().map(|r| &r.name).collect::<Vec<_>>())
            .finish()
    }
}
