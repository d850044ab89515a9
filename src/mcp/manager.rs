//! Session manager for multiple tool servers.
//!
//! Starts every configured backend concurrently as one all-or-nothing unit,
//! hands out [`ServerHandle`]s, routes list/call requests to the addressed
//! connection and tears everything down in reverse start order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::connection::{ConnectionState, SessionSettings, ToolServerConnection, ToolServerSpec};
use super::error::{CleanupError, ConnectionError, ToolExecutionError};
use super::protocol::{CallToolResult, ToolDescriptor};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to one connection of one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle {
    manager: u64,
    index: usize,
}

impl ServerHandle {
    /// Position of the server in the list passed to `start`.
    pub fn index(&self) -> usize {
        self.index
    }

    /// A handle no manager will accept.
    #[cfg(test)]
    pub(crate) fn for_tests(index: usize) -> Self {
        Self { manager: 0, index }
    }
}

impl std::fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server#{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Owns the ordered set of tool server connections.
pub struct ServerSessionManager {
    id: u64,
    settings: SessionSettings,
    phase: Mutex<Phase>,
    /// Index order is start order; teardown walks it backwards
    connections: RwLock<Vec<Arc<ToolServerConnection>>>,
    /// Held by `start` for the whole launch and by `stop`, so a stop
    /// issued mid-launch waits and then closes what was launched
    lifecycle: tokio::sync::Mutex<()>,
}

impl ServerSessionManager {
    /// Create a manager with the given session timeouts.
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            phase: Mutex::new(Phase::Idle),
            connections: RwLock::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Session timeouts applied to every connection.
    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Launch every spec concurrently and wait until all are Ready.
    ///
    /// If any of them fails, the ones that did come up are closed in reverse
    /// spec order before the first error (in completion order) is returned.
    /// Nothing is tracked after a failed start, so it may be retried.
    /// A concurrent [`stop`](Self::stop) waits for the launch to finish.
    pub async fn start(
        &self,
        specs: Vec<ToolServerSpec>,
    ) -> Result<Vec<ServerHandle>, ConnectionError> {
        let _guard = self.lifecycle.lock().await;

        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(ConnectionError::AlreadyStarted);
            }
            *phase = Phase::Starting;
        }

        match self.launch_all(specs).await {
            Ok(connections) => {
                let handles = (0..connections.len())
                    .map(|index| ServerHandle { manager: self.id, index })
                    .collect();
                *self.connections.write() = connections;
                *self.phase.lock() = Phase::Running;
                Ok(handles)
            }
            Err(error) => {
                *self.phase.lock() = Phase::Idle;
                Err(error)
            }
        }
    }

    async fn launch_all(
        &self,
        specs: Vec<ToolServerSpec>,
    ) -> Result<Vec<Arc<ToolServerConnection>>, ConnectionError> {
        {
            let mut seen = HashSet::new();
            for spec in &specs {
                spec.validate()?;
                if !seen.insert(spec.name.as_str()) {
                    return Err(ConnectionError::DuplicateName(spec.name.clone()));
                }
            }
        }

        if specs.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(count = specs.len(), "Starting tool servers");

        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let mut pending: FuturesUnordered<_> = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let task = tokio::spawn(ToolServerConnection::connect(spec, self.settings));
                async move { (index, task.await) }
            })
            .collect();

        let mut slots: Vec<Option<ToolServerConnection>> = names.iter().map(|_| None).collect();
        let mut errors = Vec::new();

        while let Some((index, joined)) = pending.next().await {
            match joined {
                Ok(Ok(connection)) => slots[index] = Some(connection),
                Ok(Err(error)) => errors.push(error),
                Err(join_error) => errors.push(ConnectionError::Aborted {
                    server: names[index].clone(),
                    reason: join_error.to_string(),
                }),
            }
        }

        if errors.is_empty() {
            return Ok(slots.into_iter().flatten().map(Arc::new).collect());
        }

        let first = errors.remove(0);
        tracing::error!(server = ?first.server(), error = %first, "Tool server failed to start");
        for other in &errors {
            tracing::warn!(server = ?other.server(), error = %other, "Tool server also failed to start");
        }

        let started: Vec<_> = slots.into_iter().flatten().map(Arc::new).collect();
        if !started.is_empty() {
            tracing::info!(count = started.len(), "Rolling back started tool servers");
            report_cleanup(&close_in_reverse(&started).await);
        }

        Err(first)
    }

    /// All handles, in start order.
    pub fn handles(&self) -> Vec<ServerHandle> {
        (0..self.connections.read().len())
            .map(|index| ServerHandle { manager: self.id, index })
            .collect()
    }

    /// Handle of the server with the given name.
    pub fn handle_by_name(&self, name: &str) -> Option<ServerHandle> {
        self.connections
            .read()
            .iter()
            .position(|c| c.name() == name)
            .map(|index| ServerHandle { manager: self.id, index })
    }

    /// Names of all servers, in start order.
    pub fn server_names(&self) -> Vec<String> {
        self.connections.read().iter().map(|c| c.name().to_string()).collect()
    }

    /// Number of tracked servers.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no server is tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Number of servers currently Ready.
    pub fn connected_count(&self) -> usize {
        self.connections.read().iter().filter(|c| c.is_ready()).count()
    }

    /// The connection behind a handle.
    pub fn connection(
        &self,
        handle: ServerHandle,
    ) -> Result<Arc<ToolServerConnection>, ToolExecutionError> {
        if handle.manager != self.id {
            return Err(ToolExecutionError::UnknownHandle);
        }
        self.connections
            .read()
            .get(handle.index)
            .cloned()
            .ok_or(ToolExecutionError::UnknownHandle)
    }

    /// Name of the addressed server.
    pub fn server_name(&self, handle: ServerHandle) -> Option<String> {
        self.connection(handle).ok().map(|c| c.name().to_string())
    }

    /// State of the addressed server.
    pub fn state(&self, handle: ServerHandle) -> Option<ConnectionState> {
        self.connection(handle).ok().map(|c| c.state())
    }

    /// Whether the addressed server accepts calls.
    pub fn is_ready(&self, handle: ServerHandle) -> bool {
        self.state(handle) == Some(ConnectionState::Ready)
    }

    /// Drop the addressed server's cached tool list.
    pub fn invalidate_tools_cache(&self, handle: ServerHandle) -> Result<(), ToolExecutionError> {
        self.connection(handle)?.invalidate_tools_cache();
        Ok(())
    }

    /// Tools advertised by the addressed server.
    pub async fn list_tools(
        &self,
        handle: ServerHandle,
    ) -> Result<Arc<[ToolDescriptor]>, ToolExecutionError> {
        let connection = self.connection(handle)?;
        connection.list_tools().await
    }

    /// Call a tool on the addressed server.
    pub async fn call_tool(
        &self,
        handle: ServerHandle,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> Result<CallToolResult, ToolExecutionError> {
        let connection = self.connection(handle)?;
        connection.call_tool(name, arguments).await
    }

    /// Close every server in reverse start order. Never fails; cleanup
    /// errors are collected and logged once. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;

        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return;
            }
            *phase = Phase::Stopped;
        }

        let connections: Vec<_> = self.connections.read().iter().cloned().collect();
        if connections.is_empty() {
            return;
        }

        tracing::info!(count = connections.len(), "Stopping tool servers");
        let errors = close_in_reverse(&connections).await;
        report_cleanup(&errors);
    }
}

/// Close connections last-to-first, continuing past failures.
async fn close_in_reverse(connections: &[Arc<ToolServerConnection>]) -> Vec<CleanupError> {
    let mut errors = Vec::new();
    for connection in connections.iter().rev() {
        errors.extend(connection.close_with_report().await);
    }
    errors
}

fn report_cleanup(errors: &[CleanupError]) {
    if errors.is_empty() {
        return;
    }
    let details = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
    tracing::warn!(count = errors.len(), errors = %details, "Tool server cleanup finished with errors");
}

impl Default for ServerSessionManager {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl std::fmt::Debug for ServerSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessionManager")
            .field("id", &self.id)
            .field("phase", &*self.phase.lock())
            .field("servers", &self.server_names())
            .finish()
    }
}
