//! Minimal stdio tool server.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout like the real tool
//! servers behind Bull Vision. Used by the integration tests and for local
//! smoke runs:
//!
//! ```toml
//! [[servers]]
//! name = "news"
//! command = "stub-tool-server"
//! args = ["--name", "news", "--profile", "news"]
//! ```

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};

/// Stdio tool server for tests
#[derive(Parser)]
#[command(name = "stub-tool-server")]
struct Args {
    /// Name reported in serverInfo
    #[arg(long, default_value = "stub")]
    name: String,

    /// Which tools to offer besides the common ones
    #[arg(long, value_enum, default_value = "echo")]
    profile: Profile,

    /// Answer `initialize` with an error
    #[arg(long)]
    fail_handshake: bool,

    /// Exit without answering the first `tools/call`
    #[arg(long)]
    drop_on_call: bool,

    /// Append the server name to this file on exit
    #[arg(long)]
    exit_log: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    Echo,
    News,
    Volume,
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let mut server = StubServer { args, tools_list_requests: 0 };

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("stub-tool-server: ignoring unparseable line");
            continue;
        };

        match server.handle(&message) {
            Step::Reply(reply) => {
                writeln!(stdout, "{}", reply)?;
                stdout.flush()?;
            }
            Step::Ignore => {}
            Step::Exit => break,
        }
    }

    server.log_exit()
}

enum Step {
    Reply(Value),
    Ignore,
    Exit,
}

struct StubServer {
    args: Args,
    tools_list_requests: u64,
}

impl StubServer {
    fn handle(&mut self, message: &Value) -> Step {
        // Notifications carry no id and need no answer
        let Some(id) = message.get("id").cloned() else {
            return Step::Ignore;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" if self.args.fail_handshake => {
                Err((-32603, "initialization refused".to_string()))
            }
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": self.args.name, "version": env!("CARGO_PKG_VERSION")}
            })),
            "ping" => Ok(json!({})),
            "tools/list" => {
                self.tools_list_requests += 1;
                Ok(json!({"tools": self.tools()}))
            }
            "tools/call" if self.args.drop_on_call => return Step::Exit,
            "tools/call" => self.call(&params),
            other => Err((-32601, format!("Method not found: {}", other))),
        };

        Step::Reply(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        })
    }

    fn tools(&self) -> Vec<Value> {
        let mut tools = vec![
            tool("echo", "Echo the given text", &[("text", "string")], &["text"]),
            tool("fail", "Always report an error", &[], &[]),
            tool("getenv", "Read an environment variable", &[("name", "string")], &["name"]),
            tool("sleep", "Wait before answering", &[("ms", "integer")], &["ms"]),
            tool("stats", "Report server counters", &[], &[]),
        ];

        match self.args.profile {
            Profile::Echo => {}
            Profile::News => tools.push(tool(
                "search-stock-news",
                "Search recent news for a ticker",
                &[("symbol", "string")],
                &["symbol"],
            )),
            Profile::Volume => tools.push(tool(
                "volume-walls",
                "Detect volume walls for a ticker",
                &[("symbol", "string")],
                &["symbol"],
            )),
        }

        tools
    }

    fn call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let text = match (name, self.args.profile) {
            ("echo", _) => str_arg(&arguments, "text").to_string(),
            ("fail", _) => return Ok(tool_error("requested failure")),
            ("getenv", _) => std::env::var(str_arg(&arguments, "name")).unwrap_or_default(),
            ("sleep", _) => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                format!("slept {}ms", ms)
            }
            ("stats", _) => format!("tools/list requests: {}", self.tools_list_requests),
            ("search-stock-news", Profile::News) => {
                news_results(str_arg(&arguments, "symbol")).to_string()
            }
            ("volume-walls", Profile::Volume) => format!(
                "{}: support wall at 182.50, resistance wall at 190.00",
                str_arg(&arguments, "symbol")
            ),
            _ => return Err((-32602, format!("Unknown tool: {}", name))),
        };

        Ok(json!({"content": [{"type": "text", "text": text}]}))
    }

    fn log_exit(&self) -> io::Result<()> {
        let Some(path) = &self.args.exit_log else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", self.args.name)
    }
}

fn tool(name: &str, description: &str, params: &[(&str, &str)], required: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = params
        .iter()
        .map(|(param, kind)| ((*param).to_string(), json!({"type": kind})))
        .collect();

    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": properties, "required": required}
    })
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> &'a str {
    arguments.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn tool_error(message: &str) -> Value {
    json!({"content": [{"type": "text", "text": message}], "isError": true})
}

fn news_results(symbol: &str) -> Value {
    let slug = symbol.to_lowercase();
    json!([{
        "query": format!("{} stock news", symbol),
        "results": [
            {
                "title": format!("{} beats earnings expectations", symbol),
                "url": format!("https://news.example.com/{}/earnings", slug),
                "content": format!("{} reported quarterly revenue above estimates.", symbol),
                "score": 0.92,
                "published_at": "2026-10-16T14:30:00Z"
            },
            {
                "title": format!("Analysts raise {} price target", symbol),
                "url": format!("https://news.example.com/{}/target", slug),
                "content": "Several analysts raised their targets after the call.",
                "score": 0.81
            }
        ]
    }])
}
