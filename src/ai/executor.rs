//! Tool executor backed by the session manager.
//!
//! Routes each tool call of a turn to the server that advertised the tool,
//! turns every failure into a result the model can read, and records what
//! happened for the turn result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::agent::{AgentToolCall, AgentToolResult, ToolCallRecord, ToolCatalog, ToolInvoker};
use crate::mcp::{extract_text_content, ServerHandle, ServerSessionManager, ToolExecutionError};
use crate::news::{extract_articles, NewsArticle};

#[derive(Debug, Clone)]
struct Route {
    handle: ServerHandle,
    server: String,
}

#[derive(Debug, Default)]
struct TurnLog {
    calls: Vec<ToolCallRecord>,
    artifacts: Vec<NewsArticle>,
    artifact_keys: HashSet<String>,
}

/// [`ToolInvoker`] for one turn over a [`ServerSessionManager`].
pub struct SessionToolInvoker {
    manager: Arc<ServerSessionManager>,
    /// Tool name -> first server advertising it
    routes: HashMap<String, Route>,
    log: Mutex<TurnLog>,
}

impl SessionToolInvoker {
    /// Build routes from a catalog whose entries line up with `handles`.
    pub fn new(
        manager: Arc<ServerSessionManager>,
        catalog: &ToolCatalog,
        handles: &[ServerHandle],
    ) -> Self {
        let mut routes: HashMap<String, Route> = HashMap::new();

        for (entry, handle) in catalog.entries().iter().zip(handles) {
            for tool in entry.tools.iter() {
                if let Some(existing) = routes.get(&tool.name) {
                    tracing::debug!(
                        tool = %tool.name,
                        used = %existing.server,
                        ignored = %entry.server,
                        "Tool offered by several servers"
                    );
                    continue;
                }
                routes.insert(
                    tool.name.clone(),
                    Route { handle: *handle, server: entry.server.clone() },
                );
            }
        }

        Self { manager, routes, log: Mutex::new(TurnLog::default()) }
    }

    /// Server that would handle `tool`.
    pub fn server_for(&self, tool: &str) -> Option<&str> {
        self.routes.get(tool).map(|r| r.server.as_str())
    }

    /// Calls made so far.
    pub fn records(&self) -> Vec<ToolCallRecord> {
        self.log.lock().calls.clone()
    }

    /// Consume the invoker, returning the call records and collected news.
    pub fn into_parts(self) -> (Vec<ToolCallRecord>, Vec<NewsArticle>) {
        let log = self.log.into_inner();
        (log.calls, log.artifacts)
    }

    fn record(&self, server: Option<String>, tool: &str, success: bool) {
        self.log.lock().calls.push(ToolCallRecord { server, tool: tool.to_string(), success });
    }

    fn collect_artifacts(&self, output: &str) {
        let found = extract_articles(output);
        if found.is_empty() {
            return;
        }

        let mut log = self.log.lock();
        for article in found {
            if log.artifact_keys.insert(article.dedup_key()) {
                log.artifacts.push(article);
            }
        }
    }
}

/// Text handed back to the model for a failed call.
fn describe_failure(error: &ToolExecutionError) -> String {
    match error {
        ToolExecutionError::BackendRejected { message, .. } if !message.is_empty() => {
            format!("Tool reported an error: {}", message)
        }
        ToolExecutionError::BackendRejected { .. } => {
            "Tool execution failed (no details)".to_string()
        }
        other => format!("Tool execution error: {}", other),
    }
}

#[async_trait]
impl ToolInvoker for SessionToolInvoker {
    async fn invoke(&self, call: &AgentToolCall) -> AgentToolResult {
        tracing::debug!(
            tool = %call.name,
            args = ?call.arguments,
            "Executing tool"
        );

        let Some(route) = self.routes.get(&call.name) else {
            self.record(None, &call.name, false);
            return AgentToolResult {
                tool_call_id: call.id.clone(),
                success: false,
                output: format!("Unknown tool: {}", call.name),
            };
        };

        let result = self
            .manager
            .call_tool(route.handle, &call.name, Some(call.arguments.clone()))
            .await;

        match result {
            Ok(result) => {
                let output = extract_text_content(&result);
                self.collect_artifacts(&output);
                self.record(Some(route.server.clone()), &call.name, true);

                AgentToolResult {
                    tool_call_id: call.id.clone(),
                    success: true,
                    output: if output.is_empty() {
                        "Tool executed successfully (no output)".to_string()
                    } else {
                        output
                    },
                }
            }
            Err(e) => {
                tracing::info!(server = %route.server, tool = %call.name, error = %e, "Tool call failed");
                self.record(Some(route.server.clone()), &call.name, false);

                AgentToolResult {
                    tool_call_id: call.id.clone(),
                    success: false,
                    output: describe_failure(&e),
                }
            }
        }
    }
}
