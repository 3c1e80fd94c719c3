//! Ollama LLM integration module
//!
//! Chat with tool calling over `/api/chat`, and model provisioning via
//! `/api/tags` + `/api/pull`.

pub mod client;
pub mod provision;
pub mod tool_use;

pub use client::{has_model, ChatClient, ChatError, ModelEndpoint};
pub use provision::{select_model, Provisioning};
pub use tool_use::{
    parse_tool_calls_from_text, ChatMessage, ChatResponse, FunctionCall, Tool, ToolCall,
    ToolFunction, DEFAULT_SYSTEM_PROMPT,
};
