//! In-memory fake tool server for unit tests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;

use super::protocol::{JsonRpcError, JsonRpcRequest};
use super::transport::{BoxedReader, BoxedWriter};

/// What the fake server does with one request.
pub enum FakeReply {
    /// Answer with a result
    Result(Value),
    /// Answer with a JSON-RPC error
    Error(JsonRpcError),
    /// Write this line verbatim
    Raw(String),
    /// Send a notification, then the result
    NotifyThenResult(String, Value),
    /// Write half a frame and hang up
    Truncate,
    /// Never answer
    Silent,
}

type Handler = Arc<dyn Fn(&JsonRpcRequest) -> FakeReply + Send + Sync>;

/// A scripted server on the far end of a duplex pipe.
pub struct FakeServer {
    client: Mutex<Option<DuplexStream>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    /// Answer every request with `handler`. Notifications are ignored.
    pub fn spawn(handler: impl Fn(&JsonRpcRequest) -> FakeReply + Send + Sync + 'static) -> Self {
        let handler: Handler = Arc::new(handler);
        Self::with_task(move |server| serve(server, handler))
    }

    /// Read requests two at a time and answer each pair in reverse order.
    pub fn spawn_reversing_pairs() -> Self {
        Self::with_task(|server| async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut held: Option<JsonRpcRequest> = None;

            while let Ok(Some(line)) = lines.next_line().await {
                let Some(request) = parse_request(&line) else { continue };
                match held.take() {
                    None => held = Some(request),
                    Some(first) => {
                        for req in [request, first] {
                            let reply = serde_json::json!({
                                "jsonrpc": "2.0",
                                "id": req.id,
                                "result": { "method": req.method }
                            });
                            write_line(&mut write, &reply.to_string()).await;
                        }
                    }
                }
            }
        })
    }

    /// Ping the client before answering each request, and put the client's
    /// ping reply into the result.
    pub fn spawn_pinging() -> Self {
        Self::with_task(|server| async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let Some(request) = parse_request(&line) else { continue };

                let ping = serde_json::json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"});
                write_line(&mut write, &ping.to_string()).await;

                let ping_reply = loop {
                    let Ok(Some(line)) = lines.next_line().await else { return };
                    let Ok(value) = serde_json::from_str::<Value>(&line) else { continue };
                    if value["id"] == "srv-1" {
                        break value["result"].clone();
                    }
                };

                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": request.id,
                    "result": { "ping_reply": ping_reply }
                });
                write_line(&mut write, &reply.to_string()).await;
            }
        })
    }

    fn with_task<F, Fut>(body: F) -> Self
    where
        F: FnOnce(DuplexStream) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(body(server));
        Self { client: Mutex::new(Some(client)), task }
    }

    /// Take the client ends of the pipe. Panics if taken twice.
    pub fn client_streams(&self) -> (BoxedReader, BoxedWriter) {
        let client = self.client.lock().take().expect("client streams already taken");
        let (read, write) = tokio::io::split(client);
        (Box::new(read), Box::new(write))
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn parse_request(line: &str) -> Option<JsonRpcRequest> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("id").is_none() || value.get("method").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

async fn write_line(write: &mut WriteHalf<DuplexStream>, line: &str) {
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
    let _ = write.flush().await;
}

async fn serve(server: DuplexStream, handler: Handler) {
    let (read, mut write) = tokio::io::split(server);
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(request) = parse_request(&line) else { continue };

        match handler(&request) {
            FakeReply::Result(result) => {
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": result});
                write_line(&mut write, &reply.to_string()).await;
            }
            FakeReply::Error(error) => {
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": request.id, "error": error});
                write_line(&mut write, &reply.to_string()).await;
            }
            FakeReply::Raw(raw) => write_line(&mut write, &raw).await,
            FakeReply::NotifyThenResult(method, result) => {
                let note = serde_json::json!({"jsonrpc": "2.0", "method": method});
                write_line(&mut write, &note.to_string()).await;
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": result});
                write_line(&mut write, &reply.to_string()).await;
            }
            FakeReply::Truncate => {
                let _ = write.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":").await;
                let _ = write.flush().await;
                return;
            }
            FakeReply::Silent => {}
        }
    }
}
