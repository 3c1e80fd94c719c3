//! Agent loop
//!
//! One turn at a time per conversation, any number of conversations at once:
//!
//! ```text
//! Ask(text) → AgentController → HistoryStore (transcript + user message)
//!                  ↓
//!           ModelEndpoint /api/chat (with tools) ──(transient error)──→ retry once
//!                  ↓
//!           tool calls? ── no ──→ final reply → HistoryStore → caller
//!                  ↓ yes
//!           ToolRegistry.dispatch() (sequential; SafetyGuard on run_shell)
//!                  ↓
//!           assistant message + tool results → HistoryStore
//!                  ↓
//!           next round (bounded by max_tool_rounds)
//! ```

pub mod controller;
pub mod sessions;

pub use controller::{transcript_from_history, AgentConfig, AgentController, AgentError, TurnReply};
pub use sessions::{AgentStatus, SessionGate, StatusTracker, TurnGuard};
