//! # Bull Vision
//!
//! Session layer of the Bull Vision trading assistant.
//!
//! Bull Vision answers chat messages with the help of external tool servers
//! (news search, volume analysis, ...). Each server is a child process that
//! speaks JSON-RPC over its stdio. This crate keeps those sessions alive,
//! lets a reasoning engine use their tools, and remembers each user's
//! conversation.
//!
//! ## Modules
//!
//! - [`mcp`]: tool server connections and the session manager
//! - [`ai`]: the agent dispatcher and a reusable tool-use loop
//! - [`conversation`]: per-user message history
//! - [`news`]: news articles found by tools and their idempotent storage
//! - [`core`]: configuration
//! - [`app`]: the process-wide context tying it all together
//!
//! ## Quick Start
//!
//! ```bash
//! # List the tools of every configured server
//! bullvision tools
//!
//! # Call one tool
//! bullvision call search-stock-news search --args '{"symbol": "AAPL"}'
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod ai;
pub mod app;
pub mod conversation;
pub mod core;
pub mod mcp;
pub mod news;

pub use ai::{AgentDispatcher, AgentTurnResult, DispatchError, ReasoningEngine, ToolLoopEngine};
pub use app::{AppContext, Reply};
pub use conversation::{ConversationContextStore, Message, Sender, UserId};
pub use core::Config;
pub use mcp::{ServerHandle, ServerSessionManager, ToolServerConnection, ToolServerSpec};
pub use news::{InMemoryNewsStore, NewsArticle, NewsDedupStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "bullvision";
