//! Line-framed JSON-RPC transport over a pair of byte streams.
//!
//! Every frame is one JSON value terminated by `\n`, encoded with the
//! backend's configured text encoding. A dedicated reader task owns the
//! inbound stream and routes each response to the request that is waiting
//! for it by correlation id, so concurrent requests on one transport may
//! complete in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::Encoding;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::error::ProtocolError;
use super::protocol::{
    methods, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};

/// Inbound half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Outbound half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback for server-initiated notifications.
pub type NotificationHandler = Arc<dyn Fn(&JsonRpcNotification) + Send + Sync>;

/// Callback invoked once when the inbound stream stops for any reason.
pub type BreakHandler = Arc<dyn Fn(&ProtocolError) + Send + Sync>;

type Reply = Result<JsonRpcResponse, ProtocolError>;

/// Longest inbound frame accepted by default, delimiter included.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Text encoding and size limit applied to every frame.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    encoding: &'static Encoding,
    max_line_bytes: usize,
}

impl LineCodec {
    /// Resolve a WHATWG encoding label such as `utf-8` or `latin1`.
    ///
    /// Only ASCII-compatible encodings are accepted because frames are
    /// delimited by a single `\n` byte.
    pub fn for_label(label: &str) -> Result<Self, String> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| format!("unknown text encoding '{}'", label))?;

        if encoding.output_encoding() != encoding {
            return Err(format!("text encoding '{}' is not ASCII-compatible", label));
        }

        Ok(Self { encoding, ..Self::default() })
    }

    /// Limit inbound frames to `max` bytes, delimiter included.
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max.max(1);
        self
    }

    /// Longest inbound frame, delimiter included.
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Encode one message, appending the frame delimiter.
    pub fn encode_line(&self, text: &str) -> Result<Vec<u8>, ProtocolError> {
        let (bytes, _, had_errors) = self.encoding.encode(text);
        if had_errors {
            return Err(ProtocolError::Encoding(format!(
                "message is not representable in {}",
                self.name()
            )));
        }

        let mut line = bytes.into_owned();
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one frame. Invalid sequences are an error, never replaced.
    pub fn decode_line(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|text| text.into_owned())
            .ok_or_else(|| ProtocolError::Encoding(format!("invalid {} sequence", self.name())))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self { encoding: encoding_rs::UTF_8, max_line_bytes: MAX_LINE_BYTES }
    }
}

/// Optional callbacks wired into the reader task.
#[derive(Clone, Default)]
pub struct TransportHooks {
    /// Called for every notification the server sends
    pub on_notification: Option<NotificationHandler>,
    /// Called when the inbound stream ends or turns unreadable
    pub on_break: Option<BreakHandler>,
}

/// Why a single request did not produce a result.
#[derive(Debug, Clone)]
pub enum RequestError {
    /// The transport failed or carried garbage
    Protocol(ProtocolError),
    /// The server answered with a JSON-RPC error
    Rejected(JsonRpcError),
    /// No reply arrived in time; the transport itself may be fine
    Timeout(Duration),
}

struct Shared {
    server: String,
    codec: LineCodec,
    writer: AsyncMutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    failure: Mutex<Option<ProtocolError>>,
}

impl Shared {
    async fn write_message(&self, message: &impl Serialize) -> Result<(), ProtocolError> {
        let text =
            serde_json::to_string(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let line = self.codec.encode_line(&text)?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ProtocolError::TransportClosed)?;

        tracing::debug!(server = %self.server, "<- {}", text);
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Record the first failure and fail every outstanding request with it.
    fn fail(&self, error: &ProtocolError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error.clone());
            }
        }

        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let waiter = self.pending.lock().remove(&response.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None => {
                tracing::debug!(
                    server = %self.server,
                    request_id = %response.id,
                    "Dropping response with no pending request"
                );
            }
        }
    }

    async fn answer(&self, request: JsonRpcRequest) {
        let response = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, serde_json::json!({}))
        } else {
            JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(&request.method))
        };

        if let Err(e) = self.write_message(&response).await {
            tracing::warn!(server = %self.server, error = %e, "Failed to answer server request");
        }
    }
}

/// Removes a pending entry when the waiting request goes away, whether it
/// completed, timed out or was cancelled.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

/// A running transport: outbound writer plus the inbound reader task.
pub struct Transport {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Wrap a pair of streams and start the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        server: impl Into<String>,
        codec: LineCodec,
        reader: BoxedReader,
        writer: BoxedWriter,
        hooks: TransportHooks,
    ) -> Self {
        let shared = Arc::new(Shared {
            server: server.into(),
            codec,
            writer: AsyncMutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(Arc::clone(&shared), reader, hooks));

        Self { shared, next_id: AtomicI64::new(1), reader: Mutex::new(Some(task)) }
    }

    /// The failure that stopped this transport, if any.
    pub fn failure(&self) -> Option<ProtocolError> {
        self.shared.failure.lock().clone()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Send a request and wait for its correlated reply.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock();
            if let Some(failure) = self.shared.failure.lock().clone() {
                return Err(RequestError::Protocol(failure));
            }
            pending.insert(id.clone(), tx);
        }
        let _slot = PendingSlot { shared: self.shared.as_ref(), id: id.clone() };

        let request = JsonRpcRequest::new(id, method, params);
        self.shared.write_message(&request).await.map_err(RequestError::Protocol)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => match response.error {
                Some(error) => Err(RequestError::Rejected(error)),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            Ok(Ok(Err(error))) => Err(RequestError::Protocol(error)),
            Ok(Err(_)) => Err(RequestError::Protocol(ProtocolError::TransportClosed)),
            Err(_) => Err(RequestError::Timeout(timeout)),
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        if let Some(failure) = self.failure() {
            return Err(failure);
        }
        self.shared.write_message(&JsonRpcNotification::new(method, params)).await
    }

    /// End the protocol session: no new requests are accepted and every
    /// outstanding one fails with [`ProtocolError::TransportClosed`].
    ///
    /// Returns the number of requests that were cancelled.
    pub fn close_session(&self) -> usize {
        let cancelled = self.pending_requests();
        self.shared.fail(&ProtocolError::TransportClosed);
        cancelled
    }

    /// Close both streams: shut down the writer (bounded by `grace`) and
    /// stop the reader task.
    pub async fn close_streams(&self, grace: Duration) -> Result<(), ProtocolError> {
        let writer = self.shared.writer.lock().await.take();

        let result = match writer {
            Some(mut writer) => match tokio::time::timeout(grace, writer.shutdown()).await {
                Ok(result) => result.map_err(ProtocolError::from),
                Err(_) => Err(ProtocolError::Io(format!(
                    "stream shutdown did not finish within {:?}",
                    grace
                ))),
            },
            None => Ok(()),
        };

        let reader = self.reader.lock().take();
        if let Some(task) = reader {
            task.abort();
            let _ = task.await;
        }

        result
    }
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader, hooks: TransportHooks) {
    let mut reader = BufReader::new(reader);
    let limit = shared.codec.max_line_bytes();
    let mut buf = Vec::new();

    let error = loop {
        buf.clear();
        match (&mut reader).take(limit as u64).read_until(b'\n', &mut buf).await {
            Ok(0) => break ProtocolError::TransportClosed,
            Ok(_) if buf.last() != Some(&b'\n') && buf.len() >= limit => {
                break ProtocolError::Malformed(format!("frame exceeds {} bytes", limit))
            }
            // EOF in the middle of a frame
            Ok(_) if buf.last() != Some(&b'\n') => break ProtocolError::TransportClosed,
            Ok(_) => {}
            Err(e) => break ProtocolError::from(e),
        }

        let text = match shared.codec.decode_line(&buf) {
            Ok(text) => text,
            Err(e) => break e,
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        tracing::debug!(server = %shared.server, "-> {}", text);

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => break ProtocolError::Malformed(format!("invalid JSON: {}", e)),
        };

        match IncomingMessage::from_value(value) {
            Ok(IncomingMessage::Response(response)) => shared.complete(response),
            Ok(IncomingMessage::Request(request)) => shared.answer(request).await,
            Ok(IncomingMessage::Notification(notification)) => {
                if let Some(handler) = &hooks.on_notification {
                    handler(&notification);
                }
            }
            Err(reason) => break ProtocolError::Malformed(reason),
        }
    };

    tracing::debug!(server = %shared.server, error = %error, "Reader stopped");
    shared.fail(&error);

    if let Some(handler) = &hooks.on_break {
        handler(&error);
    }
}
