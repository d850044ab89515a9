//! Tool server sessions.
//!
//! Tool servers are subprocesses that speak newline-delimited JSON-RPC 2.0
//! over their standard input and output and expose a catalog of callable
//! tools. This module launches them, keeps one protocol session per server
//! and offers a unified interface to the agent layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               ServerSessionManager                │
//! │  • starts every server concurrently (all or none) │
//! │  • hands out ServerHandles                        │
//! │  • stops servers in reverse start order           │
//! └──────────────────────────────────────────────────┘
//!                         │
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!  ToolServerConnection  ...        ToolServerConnection
//!   state machine, cached tools/list, tools/call
//!        │
//!        ▼
//!    Transport  (reader task, id-correlated replies)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bullvision::mcp::{ServerSessionManager, SessionSettings, ToolServerSpec};
//!
//! let manager = ServerSessionManager::new(SessionSettings::default());
//! let handles = manager
//!     .start(vec![ToolServerSpec::new("search-stock-news", "uvx").args(["search-stock-news"])])
//!     .await?;
//!
//! let tools = manager.list_tools(handles[0]).await?;
//! let result = manager.call_tool(handles[0], "search-stock-news", Some(args)).await?;
//!
//! manager.stop().await;
//! ```

mod connection;
mod error;
mod manager;
mod protocol;
mod tools;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionState, SessionSettings, ToolServerConnection, ToolServerSpec};
pub use error::{CleanupError, ConnectionError, ProtocolError, ToolExecutionError};
pub use manager::{ServerHandle, ServerSessionManager};
pub use protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsParams,
    ListToolsResult, RequestId, ToolContent, ToolDescriptor, PROTOCOL_VERSION,
};
pub use tools::{extract_text_content, format_tool, parse_arguments};
pub use transport::{BoxedReader, BoxedWriter, LineCodec};
