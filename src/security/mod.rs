//! Command safety for the shell tool
//!
//! A configurable deny-list, enforced deterministically before any shell
//! execution. It is not an exhaustive detector of dangerous commands.

pub mod guard;

pub use guard::{default_rules, DenyRule, SafetyGuard, Verdict};
