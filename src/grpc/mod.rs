//! Local UI transport
//!
//! This module provides:
//! - AgentService gRPC server over a Unix domain socket (one Ask = one turn)
//! - AgentClient for CLI subcommands talking to a running daemon
//! - Protobuf message handling

pub mod client;
pub mod server;

pub use client::{AgentClient, ClientError};
pub use server::{bind_socket, proto, serve, status_from_agent_error, AgentServer};
