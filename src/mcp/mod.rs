//! External tool-protocol transport (MCP over stdio)

pub mod protocol;
pub mod server;

pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpToolDefinition};
pub use server::{mcp_tool_name, resolve_mcp_tool, McpServer, TOOL_PREFIX};
