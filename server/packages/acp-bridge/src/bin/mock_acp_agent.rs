//! Stub ACP agent on stdio, driven by the prompt text:
//!
//! - `hello`: chunks `Hel` and `lo`
//! - `hang`: one chunk, never replies
//! - `slow`: one chunk, replies after a second
//! - `tool`: a tool call gated on a permission request
//! - `terminal <command>`: runs the command through the client terminal
//! - `read <path>`: reads a file through the client
//! - `exit`: the process exits without replying
//! - anything else: echoed back one word per chunk

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{oneshot, Mutex};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

#[derive(Clone)]
struct Agent {
    out: Arc<Mutex<Stdout>>,
    pending: Pending,
    next_request: Arc<AtomicU64>,
    next_session: Arc<AtomicU64>,
}

impl Agent {
    async fn send(&self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        let mut out = self.out.lock().await;
        if out.write_all(line.as_bytes()).await.is_err() || out.flush().await.is_err() {
            std::process::exit(0);
        }
    }

    async fn reply(&self, id: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    async fn update(&self, session_id: &str, update: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": session_id, "update": update },
        }))
        .await;
    }

    async fn chunk(&self, session_id: &str, text: &str, nested: bool) {
        let content = if nested {
            json!([{ "type": "text", "text": text }])
        } else {
            json!({ "type": "text", "text": text })
        };
        self.update(
            session_id,
            json!({ "sessionUpdate": "agent_message_chunk", "content": content }),
        )
        .await;
    }

    /// Issues a request to the client and waits for its result or error.
    async fn call(&self, method: &str, params: Value) -> Value {
        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await;
        rx.await.unwrap_or(Value::Null)
    }

    async fn handle(&self, message: Value) {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match message.get("method").and_then(Value::as_str) {
            Some("initialize") => {
                self.reply(
                    &id,
                    json!({
                        "protocolVersion": 1,
                        "agentCapabilities": { "loadSession": false },
                        "agentInfo": {
                            "name": "mock-acp-agent",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
                .await;
            }
            Some("session/new") => {
                let n = self.next_session.fetch_add(1, Ordering::SeqCst);
                let session_id = format!("mock-session-{n}");
                self.reply(&id, json!({ "sessionId": session_id })).await;
                self.update(
                    &session_id,
                    json!({
                        "sessionUpdate": "available_commands_update",
                        "availableCommands": [
                            { "name": "review", "description": "Review the working tree" },
                            {
                                "name": "test",
                                "description": "Run the test suite",
                                "input": { "hint": "filter" },
                            },
                        ],
                    }),
                )
                .await;
            }
            Some("session/set_mode") => {
                self.reply(&id, json!({})).await;
            }
            Some("session/prompt") => self.prompt(id, params).await,
            Some(other) => {
                if !id.is_null() {
                    self.send(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32601,
                            "message": format!("method not found: {other}"),
                        },
                    }))
                    .await;
                }
            }
            None => {}
        }
    }

    async fn prompt(&self, id: Value, params: Value) {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let text = params
            .pointer("/prompt/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (command, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));

        match command {
            "hello" => {
                self.chunk(&session_id, "Hel", false).await;
                self.chunk(&session_id, "lo", true).await;
            }
            "hang" => {
                self.chunk(&session_id, "thinking", false).await;
                return;
            }
            "slow" => {
                self.chunk(&session_id, "working", false).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            "exit" => std::process::exit(3),
            "tool" => {
                let tool_call_id = "call-1";
                self.update(
                    &session_id,
                    json!({
                        "sessionUpdate": "tool_call",
                        "toolCallId": tool_call_id,
                        "title": "Edit file",
                        "kind": "edit",
                        "status": "pending",
                    }),
                )
                .await;
                let permission = self
                    .call(
                        "session/request_permission",
                        json!({
                            "sessionId": session_id,
                            "toolCall": { "toolCallId": tool_call_id },
                            "options": [
                                { "optionId": "reject", "name": "Reject", "kind": "reject_once" },
                                { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                            ],
                        }),
                    )
                    .await;
                let granted = permission.pointer("/outcome/optionId").cloned();
                self.update(
                    &session_id,
                    json!({
                        "sessionUpdate": "tool_call_update",
                        "toolCallId": tool_call_id,
                        "status": "completed",
                        "rawOutput": { "granted": granted },
                    }),
                )
                .await;
                self.chunk(&session_id, "edited", false).await;
            }
            "terminal" => {
                let created = self
                    .call(
                        "terminal/create",
                        json!({ "sessionId": session_id, "command": rest }),
                    )
                    .await;
                let terminal_id = created.get("terminalId").cloned().unwrap_or(Value::Null);
                let target = json!({ "sessionId": session_id, "terminalId": terminal_id });
                let exit = self.call("terminal/wait_for_exit", target.clone()).await;
                let output = self.call("terminal/output", target.clone()).await;
                self.call("terminal/release", target).await;

                let printed = output.get("output").and_then(Value::as_str).unwrap_or_default();
                self.chunk(&session_id, printed, false).await;
                self.chunk(&session_id, &format!("exit {}", exit["exitCode"]), false)
                    .await;
            }
            "read" => {
                let read = self
                    .call(
                        "fs/read_text_file",
                        json!({ "sessionId": session_id, "path": rest }),
                    )
                    .await;
                let content = read
                    .get("content")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("error: {read}"));
                self.chunk(&session_id, &content, false).await;
            }
            _ => {
                let words = text.split_inclusive(' ').collect::<Vec<_>>();
                for (index, word) in words.iter().enumerate() {
                    self.chunk(&session_id, word, index % 2 == 1).await;
                }
            }
        }

        self.reply(&id, json!({ "stopReason": "end_turn" })).await;
    }
}

#[tokio::main]
async fn main() {
    let agent = Agent {
        out: Arc::new(Mutex::new(tokio::io::stdout())),
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_request: Arc::new(AtomicU64::new(1000)),
        next_session: Arc::new(AtomicU64::new(1)),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-acp-agent: ignoring malformed line");
            continue;
        };

        if message.get("method").is_none() {
            let id = message.get("id").and_then(Value::as_u64);
            if let Some(sender) = match id {
                Some(id) => agent.pending.lock().await.remove(&id),
                None => None,
            } {
                let outcome = message
                    .get("result")
                    .cloned()
                    .or_else(|| message.get("error").cloned())
                    .unwrap_or(Value::Null);
                let _ = sender.send(outcome);
            }
            continue;
        }

        let agent = agent.clone();
        tokio::spawn(async move { agent.handle(message).await });
    }
}
