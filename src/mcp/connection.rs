//! One tool server: its subprocess, transport and protocol session.
//!
//! A [`ToolServerConnection`] is created by [`ToolServerConnection::connect`],
//! which only returns once the handshake succeeded, so every connection a
//! caller can hold started out Ready. From there it either fails (the
//! transport broke) or is closed; it is never reused afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use super::error::{CleanupError, ConnectionError, ProtocolError, ToolExecutionError};
use super::protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, ListToolsParams, ListToolsResult, ToolDescriptor, PROTOCOL_VERSION,
};
use super::tools::extract_text_content;
use super::transport::{
    BoxedReader, BoxedWriter, LineCodec, RequestError, Transport, TransportHooks,
};

/// Launch description of one tool server.
#[derive(Debug, Clone)]
pub struct ToolServerSpec {
    /// Unique name within a manager
    pub name: String,
    /// Program to run
    pub command: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Extra environment; `${VAR}` references are expanded at launch
    pub env: HashMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Text encoding of the stdio streams
    pub encoding: String,
    /// Serve `tools/list` from cache after the first fetch
    pub cache_tools_list: bool,
    /// Per-server override of the call timeout
    pub call_timeout: Option<Duration>,
}

impl ToolServerSpec {
    /// A spec with default encoding (UTF-8) and caching enabled.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            encoding: "utf-8".to_string(),
            cache_tools_list: true,
            call_timeout: None,
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the subprocess.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the stream encoding label.
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Enable or disable tool list caching.
    pub fn cache_tools_list(mut self, enabled: bool) -> Self {
        self.cache_tools_list = enabled;
        self
    }

    /// Override the call timeout for this server.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Check the spec and resolve its encoding.
    pub fn validate(&self) -> Result<LineCodec, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidSpec {
            server: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(invalid("command must not be empty".to_string()));
        }

        LineCodec::for_label(&self.encoding).map_err(invalid)
    }
}

/// Timeouts shared by every connection of a manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Limit for spawn-to-ready
    pub handshake_timeout: Duration,
    /// Default limit for one request
    pub call_timeout: Duration,
    /// How long each close step may take
    pub shutdown_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Moves Ready to Failed. Any other state is left alone so a break seen
/// while closing cannot undo the close.
fn mark_failed(state: &Mutex<ConnectionState>, server: &str, error: &ProtocolError) {
    let mut state = state.lock();
    if *state == ConnectionState::Ready {
        *state = ConnectionState::Failed;
        tracing::warn!(server = %server, error = %error, "Tool server connection failed");
    }
}

/// A live session with one tool server.
pub struct ToolServerConnection {
    spec: ToolServerSpec,
    settings: SessionSettings,
    state: Arc<Mutex<ConnectionState>>,
    transport: Transport,
    child: AsyncMutex<Option<Child>>,
    /// Serializes refreshes; `None` until the first successful fetch
    tools: AsyncMutex<Option<Arc<[ToolDescriptor]>>>,
    tools_stale: Arc<AtomicBool>,
    tools_list_requests: AtomicU64,
    server_info: Option<InitializeResult>,
    close_lock: AsyncMutex<()>,
}

impl ToolServerConnection {
    /// Launch the spec's subprocess and complete the handshake.
    ///
    /// On failure the process is killed and reaped before returning.
    pub async fn connect(
        spec: ToolServerSpec,
        settings: SessionSettings,
    ) -> Result<Self, ConnectionError> {
        let codec = spec.validate()?;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            command.env(key, &*expanded);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(server = %spec.name, command = %spec.command, "Launching tool server");

        let mut child = command
            .spawn()
            .map_err(|source| ConnectionError::Spawn { server: spec.name.clone(), source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(ConnectionError::Spawn {
                server: spec.name.clone(),
                source: std::io::Error::other("stdio was not captured"),
            });
        };

        Self::establish(spec, settings, codec, Box::new(stdout), Box::new(stdin), Some(child)).await
    }

    /// Run a session over already-open streams instead of a subprocess.
    pub async fn connect_with_streams(
        spec: ToolServerSpec,
        settings: SessionSettings,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<Self, ConnectionError> {
        let codec = spec.validate()?;
        Self::establish(spec, settings, codec, reader, writer, None).await
    }

    async fn establish(
        spec: ToolServerSpec,
        settings: SessionSettings,
        codec: LineCodec,
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> Result<Self, ConnectionError> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let tools_stale = Arc::new(AtomicBool::new(false));

        let hooks = {
            let stale = Arc::clone(&tools_stale);
            let broken = Arc::clone(&state);
            let server = spec.name.clone();
            TransportHooks {
                on_notification: Some(Arc::new(move |notification: &JsonRpcNotification| {
                    if notification.method == methods::TOOLS_LIST_CHANGED {
                        stale.store(true, Ordering::SeqCst);
                    }
                })),
                on_break: Some(Arc::new(move |error: &ProtocolError| {
                    mark_failed(&broken, &server, error);
                })),
            }
        };

        let transport = Transport::start(spec.name.clone(), codec, reader, writer, hooks);

        let mut connection = Self {
            spec,
            settings,
            state,
            transport,
            child: AsyncMutex::new(child),
            tools: AsyncMutex::new(None),
            tools_stale,
            tools_list_requests: AtomicU64::new(0),
            server_info: None,
            close_lock: AsyncMutex::new(()),
        };

        let timeout = connection.settings.handshake_timeout;
        let outcome = match tokio::time::timeout(timeout, connection.handshake()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                server: connection.spec.name.clone(),
                timeout,
            }),
        };

        match outcome {
            Ok(info) => {
                tracing::info!(
                    server = %connection.spec.name,
                    peer = %info.server_info.name,
                    encoding = codec.name(),
                    "Tool server ready"
                );
                connection.server_info = Some(info);
                *connection.state.lock() = ConnectionState::Ready;
                Ok(connection)
            }
            Err(error) => {
                *connection.state.lock() = ConnectionState::Failed;
                for cleanup in connection.release().await {
                    tracing::warn!(error = %cleanup, "Cleanup after failed handshake");
                }
                Err(error)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, ConnectionError> {
        let failed = |reason: String| ConnectionError::Handshake {
            server: self.spec.name.clone(),
            reason,
        };

        let params =
            serde_json::to_value(InitializeParams::default()).map_err(|e| failed(e.to_string()))?;

        let value = self
            .transport
            .request(methods::INITIALIZE, Some(params), self.settings.handshake_timeout)
            .await
            .map_err(|e| match e {
                RequestError::Timeout(timeout) => ConnectionError::HandshakeTimeout {
                    server: self.spec.name.clone(),
                    timeout,
                },
                RequestError::Rejected(error) => failed(format!("initialize rejected: {}", error)),
                RequestError::Protocol(error) => failed(error.to_string()),
            })?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| failed(format!("malformed initialize result: {}", e)))?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                server = %self.spec.name,
                version = %result.protocol_version,
                "Server negotiated a different protocol version"
            );
        }

        self.transport.notify(methods::INITIALIZED, None).await.map_err(|e| failed(e.to_string()))?;

        Ok(result)
    }

    /// Server name from the spec.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The spec this connection was launched from.
    pub fn spec(&self) -> &ToolServerSpec {
        &self.spec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether tool calls are currently accepted.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Identity the server reported during the handshake.
    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref().map(|info| &info.server_info)
    }

    /// Usage hints the server sent during the handshake.
    pub fn instructions(&self) -> Option<&str> {
        self.server_info.as_ref().and_then(|info| info.instructions.as_deref())
    }

    /// Number of `tools/list` round trips issued so far.
    pub fn tools_list_requests(&self) -> u64 {
        self.tools_list_requests.load(Ordering::SeqCst)
    }

    /// The cached tool list, valid or not.
    pub async fn cached_tools(&self) -> Option<Arc<[ToolDescriptor]>> {
        self.tools.lock().await.clone()
    }

    /// Force the next [`list_tools`](Self::list_tools) to refetch.
    pub fn invalidate_tools_cache(&self) {
        self.tools_stale.store(true, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<(), ToolExecutionError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(ToolExecutionError::NotReady { server: self.spec.name.clone(), state }),
        }
    }

    fn request_failed(&self, tool: &str, error: RequestError) -> ToolExecutionError {
        let server = self.spec.name.clone();
        match error {
            RequestError::Rejected(error) => ToolExecutionError::BackendRejected {
                server,
                tool: tool.to_string(),
                message: error.to_string(),
            },
            RequestError::Timeout(timeout) => {
                tracing::warn!(server = %server, tool = %tool, ?timeout, "Request timed out");
                ToolExecutionError::Timeout { server, tool: tool.to_string(), timeout }
            }
            RequestError::Protocol(source) => self.protocol_failed(source),
        }
    }

    fn protocol_failed(&self, source: ProtocolError) -> ToolExecutionError {
        mark_failed(&self.state, &self.spec.name, &source);
        ToolExecutionError::Protocol { server: self.spec.name.clone(), source }
    }

    fn call_timeout(&self) -> Duration {
        self.spec.call_timeout.unwrap_or(self.settings.call_timeout)
    }

    /// The tools this server advertises.
    ///
    /// With caching enabled a valid cached list is returned without a round
    /// trip. A refresh walks every page first and only then replaces the
    /// cache, so a failure leaves the previous list in place.
    pub async fn list_tools(&self) -> Result<Arc<[ToolDescriptor]>, ToolExecutionError> {
        self.ensure_ready()?;

        let mut cache = self.tools.lock().await;

        if self.spec.cache_tools_list && !self.tools_stale.load(Ordering::SeqCst) {
            if let Some(tools) = cache.as_ref() {
                return Ok(Arc::clone(tools));
            }
        }

        self.tools_stale.store(false, Ordering::SeqCst);

        match self.fetch_tools().await {
            Ok(tools) => {
                let tools: Arc<[ToolDescriptor]> = tools.into();
                *cache = Some(Arc::clone(&tools));
                Ok(tools)
            }
            Err(error) => {
                self.tools_stale.store(true, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, ToolExecutionError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            self.ensure_ready()?;

            let params = ListToolsParams { cursor: cursor.take() };
            let params = serde_json::to_value(&params)
                .map_err(|e| self.protocol_failed(ProtocolError::Malformed(e.to_string())))?;

            self.tools_list_requests.fetch_add(1, Ordering::SeqCst);
            let value = self
                .transport
                .request(methods::TOOLS_LIST, Some(params), self.call_timeout())
                .await
                .map_err(|e| self.request_failed(methods::TOOLS_LIST, e))?;

            let page: ListToolsResult = serde_json::from_value(value).map_err(|e| {
                self.protocol_failed(ProtocolError::Malformed(format!(
                    "invalid tools/list result: {}",
                    e
                )))
            })?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(server = %self.spec.name, count = tools.len(), "Fetched tool list");
        Ok(tools)
    }

    /// Invoke a tool and return the backend's result verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> Result<CallToolResult, ToolExecutionError> {
        self.ensure_ready()?;

        let params = CallToolParams { name: name.to_string(), arguments };
        let params = serde_json::to_value(&params)
            .map_err(|e| self.protocol_failed(ProtocolError::Malformed(e.to_string())))?;

        tracing::debug!(server = %self.spec.name, tool = %name, "Calling tool");

        let value = self
            .transport
            .request(methods::TOOLS_CALL, Some(params), self.call_timeout())
            .await
            .map_err(|e| self.request_failed(name, e))?;

        let result: CallToolResult = serde_json::from_value(value).map_err(|e| {
            self.protocol_failed(ProtocolError::Malformed(format!(
                "invalid tools/call result: {}",
                e
            )))
        })?;

        if result.is_error() {
            return Err(ToolExecutionError::BackendRejected {
                server: self.spec.name.clone(),
                tool: name.to_string(),
                message: extract_text_content(&result),
            });
        }

        Ok(result)
    }

    /// Close the connection, logging any cleanup failure. Idempotent.
    pub async fn close(&self) {
        for error in self.close_with_report().await {
            tracing::warn!(error = %error, "Tool server cleanup failed");
        }
    }

    /// Close the connection and return the cleanup failures instead of
    /// logging them. A second call returns nothing.
    pub async fn close_with_report(&self) -> Vec<CleanupError> {
        let _guard = self.close_lock.lock().await;

        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return Vec::new();
            }
            *state = ConnectionState::Closing;
        }

        tracing::info!(server = %self.spec.name, "Closing tool server");
        let errors = self.release().await;

        *self.state.lock() = ConnectionState::Closed;
        tracing::info!(server = %self.spec.name, "Tool server closed");
        errors
    }

    /// Session, then streams, then process. Every step runs regardless of
    /// how the previous one went.
    async fn release(&self) -> Vec<CleanupError> {
        let mut errors = Vec::new();
        let grace = self.settings.shutdown_grace;

        let cancelled = self.transport.close_session();
        if cancelled > 0 {
            tracing::debug!(server = %self.spec.name, cancelled, "Cancelled pending requests");
        }

        if let Err(e) = self.transport.close_streams(grace).await {
            errors.push(CleanupError::Transport {
                server: self.spec.name.clone(),
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.terminate_process(grace).await {
            errors.push(e);
        }

        errors
    }

    async fn terminate_process(&self, grace: Duration) -> Result<(), CleanupError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let failed =
            |reason: String| CleanupError::Process { server: self.spec.name.clone(), reason };

        let reason = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.spec.name, %status, "Tool server exited");
                return Ok(());
            }
            Ok(Err(e)) => format!("waiting for exit failed: {}", e),
            Err(_) => format!("no exit within {:?} of closing stdin", grace),
        };
        tracing::debug!(server = %self.spec.name, reason = %reason, "Killing tool server");

        // A forced kill counts as a cleanup failure
        match tokio::time::timeout(grace, child.kill()).await {
            Ok(Ok(())) => Err(failed(format!("{}; killed", reason))),
            Ok(Err(e)) => Err(failed(format!("{}; kill failed: {}", reason, e))),
            Err(_) => Err(failed(format!("{}; still running {:?} after kill", reason, grace))),
        }
    }
}

impl std::fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::mcp::protocol::{JsonRpcError, JsonRpcRequest};
    use crate::mcp::testing::{FakeReply, FakeServer};

    fn settings() -> SessionSettings {
        SessionSettings {
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn initialize_reply() -> FakeReply {
        FakeReply::Result(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake-news", "version": "1.0.0"}
        }))
    }

    fn tool(name: &str) -> Value {
        serde_json::json!({"name": name, "inputSchema": {"type": "object"}})
    }

    /// A fake that handshakes and delegates everything else.
    fn fake(handler: impl Fn(&JsonRpcRequest) -> FakeReply + Send + Sync + 'static) -> FakeServer {
        FakeServer::spawn(move |request| {
            if request.method == methods::INITIALIZE {
                initialize_reply()
            } else {
                handler(request)
            }
        })
    }

    async fn connect(server: &FakeServer, spec: ToolServerSpec) -> ToolServerConnection {
        let (reader, writer) = server.client_streams();
        ToolServerConnection::connect_with_streams(spec, settings(), reader, writer).await.unwrap()
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec = ToolServerSpec::new("search-stock-news", "uvx").args(["search-stock-news"]);
        assert_eq!(spec.encoding, "utf-8");
        assert!(spec.cache_tools_list);
        assert_eq!(spec.args, vec!["search-stock-news"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_validation() {
        let err = ToolServerSpec::new("", "uvx").validate().unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidSpec { .. }));

        let err = ToolServerSpec::new("news", " ").validate().unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidSpec { .. }));

        let err = ToolServerSpec::new("news", "uvx").encoding("utf-16").validate().unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidSpec { ref server, .. } if server == "news"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_connect_reports_server_info() {
        let server = fake(|_| FakeReply::Silent);
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(connection.server_info().unwrap().name, "fake-news");
        assert_eq!(connection.name(), "news");
    }

    #[tokio::test]
    async fn test_handshake_rejects_malformed_reply() {
        let server = FakeServer::spawn(|_| FakeReply::Result(serde_json::json!({"nope": true})));
        let (reader, writer) = server.client_streams();

        let err = ToolServerConnection::connect_with_streams(
            ToolServerSpec::new("news", "unused"),
            settings(),
            reader,
            writer,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectionError::Handshake { ref server, .. } if server == "news"));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let server = FakeServer::spawn(|_| FakeReply::Silent);
        let (reader, writer) = server.client_streams();
        let settings =
            SessionSettings { handshake_timeout: Duration::from_millis(50), ..settings() };

        let err = ToolServerConnection::connect_with_streams(
            ToolServerSpec::new("slow", "unused"),
            settings,
            reader,
            writer,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConnectionError::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_list_tools_is_cached() {
        let server = fake(|_| FakeReply::Result(serde_json::json!({"tools": [tool("news")]})));
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let first = connection.list_tools().await.unwrap();
        let second = connection.list_tools().await.unwrap();

        assert_eq!(connection.tools_list_requests(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first[0].name, "news");
    }

    #[tokio::test]
    async fn test_list_tools_without_cache_refetches() {
        let server = fake(|_| FakeReply::Result(serde_json::json!({"tools": [tool("news")]})));
        let spec = ToolServerSpec::new("news", "unused").cache_tools_list(false);
        let connection = connect(&server, spec).await;

        connection.list_tools().await.unwrap();
        connection.list_tools().await.unwrap();

        assert_eq!(connection.tools_list_requests(), 2);
    }

    #[tokio::test]
    async fn test_list_tools_follows_pagination() {
        let server = fake(|request| {
            let cursor = request.params.as_ref().and_then(|p| p.get("cursor")).cloned();
            match cursor.as_ref().and_then(Value::as_str) {
                None => FakeReply::Result(serde_json::json!({
                    "tools": [tool("a")],
                    "nextCursor": "page-2"
                })),
                Some(_) => FakeReply::Result(serde_json::json!({"tools": [tool("b")]})),
            }
        });
        let connection = connect(&server, ToolServerSpec::new("paged", "unused")).await;

        let tools = connection.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(connection.tools_list_requests(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let server = {
            let calls = Arc::clone(&calls);
            fake(move |request| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let has_cursor = request.params.as_ref().is_some_and(|p| p.get("cursor").is_some());
                match (n, has_cursor) {
                    (0, _) => FakeReply::Result(serde_json::json!({"tools": [tool("old")]})),
                    (_, false) => FakeReply::Result(serde_json::json!({
                        "tools": [tool("new-1")],
                        "nextCursor": "more"
                    })),
                    (_, true) => FakeReply::Error(JsonRpcError {
                        code: -32603,
                        message: "upstream unavailable".into(),
                        data: None,
                    }),
                }
            })
        };
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let original = connection.list_tools().await.unwrap();
        connection.invalidate_tools_cache();

        let err = connection.list_tools().await.unwrap_err();
        assert!(err.is_rejection());

        let cached = connection.cached_tools().await.unwrap();
        assert!(Arc::ptr_eq(&original, &cached));
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_list_changed_notification_invalidates_cache() {
        let server = fake(|request| {
            let tools = serde_json::json!({"tools": [tool("news")]});
            if request.method == methods::TOOLS_CALL {
                FakeReply::NotifyThenResult(
                    methods::TOOLS_LIST_CHANGED.to_string(),
                    serde_json::json!({"content": []}),
                )
            } else {
                FakeReply::Result(tools)
            }
        });
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        connection.list_tools().await.unwrap();
        connection.call_tool("refresh", None).await.unwrap();
        connection.list_tools().await.unwrap();

        assert_eq!(connection.tools_list_requests(), 2);
    }

    #[tokio::test]
    async fn test_call_tool_returns_result_verbatim() {
        let server = fake(|request| {
            let symbol = request.params.as_ref().map(|p| p["arguments"]["symbol"].clone());
            FakeReply::Result(serde_json::json!({
                "content": [{"type": "text", "text": format!("news for {}", symbol.unwrap_or_default())}]
            }))
        });
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let args = HashMap::from([("symbol".to_string(), serde_json::json!("AAPL"))]);
        let result = connection.call_tool("search-stock-news", Some(args)).await.unwrap();

        assert_eq!(result.content[0].as_text(), Some("news for \"AAPL\""));
    }

    #[tokio::test]
    async fn test_call_tool_error_flag_is_rejection() {
        let server = fake(|_| {
            FakeReply::Result(serde_json::json!({
                "content": [{"type": "text", "text": "unknown symbol"}],
                "isError": true
            }))
        });
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let err = connection.call_tool("search-stock-news", None).await.unwrap_err();
        match err {
            ToolExecutionError::BackendRejected { message, tool, .. } => {
                assert_eq!(message, "unknown symbol");
                assert_eq!(tool, "search-stock-news");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_call_tool_rpc_error_is_rejection() {
        let server = fake(|_| {
            FakeReply::Error(JsonRpcError { code: -32602, message: "bad args".into(), data: None })
        });
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let err = connection.call_tool("search-stock-news", None).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_call_tool_timeout_keeps_connection_ready() {
        let server = fake(|_| FakeReply::Silent);
        let spec = ToolServerSpec::new("slow", "unused").call_timeout(Duration::from_millis(50));
        let connection = connect(&server, spec).await;

        let err = connection.call_tool("anything", None).await.unwrap_err();
        assert!(matches!(err, ToolExecutionError::Timeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_transport_drop_fails_connection() {
        let server = fake(|_| FakeReply::Truncate);
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let args = HashMap::from([("symbol".to_string(), serde_json::json!("AAPL"))]);
        let err = connection.call_tool("search-stock-news", Some(args)).await.unwrap_err();
        assert!(matches!(
            err,
            ToolExecutionError::Protocol { source: ProtocolError::TransportClosed, .. }
        ));
        assert_eq!(connection.state(), ConnectionState::Failed);

        let err = connection.call_tool("search-stock-news", None).await.unwrap_err();
        assert!(matches!(
            err,
            ToolExecutionError::NotReady { state: ConnectionState::Failed, .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_result_fails_connection() {
        let server = fake(|_| FakeReply::Result(serde_json::json!({"content": "not a list"})));
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let err = connection.call_tool("search-stock-news", None).await.unwrap_err();
        assert!(matches!(err, ToolExecutionError::Protocol { .. }));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = fake(|_| FakeReply::Silent);
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        assert!(connection.close_with_report().await.is_empty());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.close_with_report().await.is_empty());
        assert_eq!(connection.state(), ConnectionState::Closed);

        let err = connection.list_tools().await.unwrap_err();
        assert!(matches!(err, ToolExecutionError::NotReady { state: ConnectionState::Closed, .. }));
    }

    #[tokio::test]
    async fn test_close_after_failure_reaches_closed() {
        let server = fake(|_| FakeReply::Truncate);
        let connection = connect(&server, ToolServerSpec::new("news", "unused")).await;

        let _ = connection.call_tool("anything", None).await;
        assert_eq!(connection.state(), ConnectionState::Failed);

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_missing_binary_is_spawn_error() {
        let spec = ToolServerSpec::new("ghost", "/nonexistent/bullvision-tool-server");
        let err = ToolServerConnection::connect(spec, settings()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Spawn { ref server, .. } if server == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_exiting_process_is_handshake_error() {
        let spec = ToolServerSpec::new("quitter", "sh").args(["-c", "exit 1"]);
        let err = ToolServerConnection::connect(spec, settings()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake { .. }));
    }
}
