//! Durable conversation history
//!
//! Conversations, messages, tool calls and data records live in one SQLite
//! database. There is no in-memory "current conversation": the active one is
//! derived from stored timestamps on every request.

pub mod marker;
pub mod store;
pub mod types;

pub use marker::ProvisioningMarker;
pub use store::{select_active, HistoryError, HistoryStore};
pub use types::{
    Conversation, ConversationSummary, DataRecord, Message, NewMessage, Role, ToolCallRecord,
};
