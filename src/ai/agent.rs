//! Agent dispatcher.
//!
//! Runs one reasoning turn against the live tool servers: gathers every
//! server's tool catalog, hands the turn to a [`ReasoningEngine`] together
//! with a [`ToolInvoker`], and packages the answer, the tool calls made and
//! any news artifacts into an [`AgentTurnResult`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::executor::SessionToolInvoker;
use crate::conversation::{ConversationContext, Message};
use crate::mcp::{ServerHandle, ServerSessionManager, ToolDescriptor, ToolExecutionError};
use crate::news::NewsArticle;

/// A tool definition for the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTool {
    /// Tool name
    pub name: String,
    /// Tool description
    pub description: Option<String>,
    /// Input schema (JSON Schema format)
    pub input_schema: serde_json::Value,
    /// Server that provides this tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToolCall {
    /// Unique ID for this tool call
    pub id: String,
    /// Tool name
    pub name: String,
    /// Tool arguments
    pub arguments: HashMap<String, serde_json::Value>,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToolResult {
    /// ID of the tool call this is a response to
    pub tool_call_id: String,
    /// Whether the tool execution was successful
    pub success: bool,
    /// Tool output (text content), or a description of the failure
    pub output: String,
}

/// Tools advertised by one server.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Server name
    pub server: String,
    /// Its tools
    pub tools: Arc<[ToolDescriptor]>,
}

/// Tools of every server taking part in a turn, in handle order.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
}

impl ToolCatalog {
    /// Build a catalog from per-server entries.
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// A catalog with one server.
    pub fn single(server: impl Into<String>, tools: Arc<[ToolDescriptor]>) -> Self {
        Self::new(vec![CatalogEntry { server: server.into(), tools }])
    }

    /// Per-server entries.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Total number of advertised tools, duplicates included.
    pub fn tool_count(&self) -> usize {
        self.entries.iter().map(|e| e.tools.len()).sum()
    }

    /// Whether no server advertises anything.
    pub fn is_empty(&self) -> bool {
        self.tool_count() == 0
    }

    /// Index of the first entry advertising `tool`.
    pub fn find(&self, tool: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.tools.iter().any(|t| t.name == tool))
    }

    /// Tools in model format. A name offered by several servers appears
    /// once, attributed to the first of them.
    pub fn agent_tools(&self) -> Vec<AgentTool> {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();

        for entry in &self.entries {
            for tool in entry.tools.iter() {
                if !seen.insert(tool.name.as_str()) {
                    continue;
                }
                tools.push(AgentTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    server: Some(entry.server.clone()),
                });
            }
        }

        tools
    }
}

/// Everything an engine gets to see for one turn.
#[derive(Debug)]
pub struct TurnInput<'a> {
    /// The user's message
    pub input: &'a str,
    /// Earlier messages of the conversation, oldest first
    pub history: Vec<Message>,
    /// Tools available in this turn
    pub catalog: &'a ToolCatalog,
}

/// Executes tool calls on behalf of an engine. Failures come back as data.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute a tool call.
    async fn invoke(&self, call: &AgentToolCall) -> AgentToolResult;
}

/// Produces the answer for one turn, calling tools as it sees fit.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Run the turn and return the final answer.
    async fn run_turn(
        &self,
        turn: &TurnInput<'_>,
        tools: &dyn ToolInvoker,
    ) -> anyhow::Result<String>;
}

/// One tool call made during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Server the call was routed to, if any advertised the tool
    pub server: Option<String>,
    /// Tool name
    pub tool: String,
    /// Whether the tool produced a result
    pub success: bool,
}

/// Outcome of one turn.
#[derive(Debug, Clone, Default)]
pub struct AgentTurnResult {
    /// Final answer text
    pub output: String,
    /// News found by tools during the turn, deduplicated, in discovery order
    pub artifacts: Vec<NewsArticle>,
    /// Tool calls in the order they were made
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A turn that could not run at all.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tool catalog of '{server}' is unavailable: {source}")]
    ToolCatalogUnavailable {
        server: String,
        #[source]
        source: ToolExecutionError,
    },

    #[error("no tool servers available")]
    NoBackendsAvailable,
}

/// Runs turns against the servers of one manager.
pub struct AgentDispatcher {
    manager: Arc<ServerSessionManager>,
    engine: Arc<dyn ReasoningEngine>,
}

impl AgentDispatcher {
    /// Create a dispatcher.
    pub fn new(manager: Arc<ServerSessionManager>, engine: Arc<dyn ReasoningEngine>) -> Self {
        Self { manager, engine }
    }

    /// The manager whose servers this dispatcher uses.
    pub fn manager(&self) -> &Arc<ServerSessionManager> {
        &self.manager
    }

    /// Execute one turn.
    ///
    /// Fails only if no server is usable or a catalog cannot be listed;
    /// tool failures and engine errors end up in the output instead.
    pub async fn run(
        &self,
        input: &str,
        context: &ConversationContext,
        handles: &[ServerHandle],
    ) -> Result<AgentTurnResult, DispatchError> {
        if !handles.iter().any(|h| self.manager.is_ready(*h)) {
            return Err(DispatchError::NoBackendsAvailable);
        }

        let catalog = self.build_catalog(handles).await?;
        tracing::debug!(
            user = %context.user_id(),
            servers = handles.len(),
            tools = catalog.tool_count(),
            "Starting agent turn"
        );

        let invoker = SessionToolInvoker::new(Arc::clone(&self.manager), &catalog, handles);
        let turn = TurnInput { input, history: context.history(), catalog: &catalog };

        let output = match self.engine.run_turn(&turn, &invoker).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(user = %context.user_id(), error = %e, "Agent turn failed");
                format!("I couldn't complete that request: {}", e)
            }
        };

        let (tool_calls, artifacts) = invoker.into_parts();
        Ok(AgentTurnResult { output, artifacts, tool_calls })
    }

    /// List every handle's tools concurrently. The first failure in handle
    /// order wins.
    async fn build_catalog(&self, handles: &[ServerHandle]) -> Result<ToolCatalog, DispatchError> {
        let listings = futures::future::join_all(handles.iter().map(|handle| async move {
            let server =
                self.manager.server_name(*handle).unwrap_or_else(|| handle.to_string());
            let tools = self.manager.list_tools(*handle).await;
            (server, tools)
        }))
        .await;

        let mut entries = Vec::with_capacity(listings.len());
        for (server, tools) in listings {
            match tools {
                Ok(tools) => entries.push(CatalogEntry { server, tools }),
                Err(source) => {
                    tracing::warn!(server = %server, error = %source, "Tool catalog unavailable");
                    return Err(DispatchError::ToolCatalogUnavailable { server, source });
                }
            }
        }

        Ok(ToolCatalog::new(entries))
    }
}
