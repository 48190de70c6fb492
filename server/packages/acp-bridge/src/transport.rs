//! Line-delimited JSON-RPC 2.0 over an agent's stdio.
//!
//! Outbound requests get a fresh numeric id and a pending entry that is
//! resolved exactly once: by the matching response, or by eviction when
//! the request timeout elapses. Inbound lines are classified here so the
//! rest of the bridge only ever sees [`Incoming`] values.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, Instant};

use acp_bridge_error::BridgeError;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub(crate) const RAW_PREVIEW_BYTES: usize = 200;

/// A message the agent initiated.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

type Outcome = Result<Value, RpcError>;

struct PendingRequest {
    sender: oneshot::Sender<Outcome>,
    issued_at: Instant,
    method: String,
}

type PendingTable = SyncMutex<HashMap<u64, PendingRequest>>;

/// Evicts a request's pending entry when its caller finishes or goes away.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Transport {
    provider: String,
    writer: Mutex<BoxedWriter>,
    pending: PendingTable,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("provider", &self.provider)
            .field("request_timeout", &self.request_timeout)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(
        provider: impl Into<String>,
        writer: BoxedWriter,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            writer: Mutex::new(writer),
            pending: SyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sends `method` and waits for its result, an agent error, or the timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            PendingRequest {
                sender: tx,
                issued_at: Instant::now(),
                method: method.to_string(),
            },
        );
        let _evict = PendingGuard {
            pending: &self.pending,
            id,
        };

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write(&payload).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(BridgeError::Protocol {
                method: method.to_string(),
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            Ok(Err(_)) => {
                tracing::error!(
                    provider = %self.provider,
                    method = %method,
                    id = id,
                    "response channel dropped"
                );
                Err(BridgeError::AgentExited {
                    provider: self.provider.clone(),
                })
            }
            Err(_) => {
                tracing::error!(
                    provider = %self.provider,
                    method = %method,
                    id = id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "timed out waiting for agent response"
                );
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Replies to an agent-initiated request.
    pub async fn respond(&self, id: Value, result: Value) -> Result<(), BridgeError> {
        self.write(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
        .await
    }

    pub async fn respond_error(
        &self,
        id: Value,
        code: i64,
        message: &str,
    ) -> Result<(), BridgeError> {
        self.write(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": code,
                "message": message,
            },
        }))
        .await
    }

    /// Feeds one inbound line. Responses are settled here; anything the
    /// agent initiated is handed back to the caller.
    pub async fn accept_line(&self, line: &str) -> Option<Incoming> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let mut message = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!(
                    provider = %self.provider,
                    raw = %preview(trimmed),
                    "agent stdout: json-rpc message is not an object"
                );
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    provider = %self.provider,
                    error = %err,
                    raw = %preview(trimmed),
                    "agent stdout: invalid JSON"
                );
                return None;
            }
        };

        let id = message.remove("id").filter(|id| !id.is_null());
        let params = message.remove("params").unwrap_or(Value::Null);

        if let Some(Value::String(method)) = message.remove("method") {
            return Some(match id {
                Some(id) => Incoming::Request { id, method, params },
                None => Incoming::Notification { method, params },
            });
        }

        let Some(id) = id else {
            tracing::warn!(
                provider = %self.provider,
                raw = %preview(trimmed),
                "agent stdout: message has neither method nor id"
            );
            return None;
        };

        let outcome = match message.remove("error") {
            Some(error) => Err(serde_json::from_value::<RpcError>(error.clone()).unwrap_or(
                RpcError {
                    code: INTERNAL_ERROR,
                    message: error.to_string(),
                    data: None,
                },
            )),
            None => Ok(message.remove("result").unwrap_or(Value::Null)),
        };

        let entry = match id.as_u64() {
            Some(key) => self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key),
            None => None,
        };
        match entry {
            Some(pending) => {
                tracing::debug!(
                    provider = %self.provider,
                    id = %id,
                    method = %pending.method,
                    has_error = outcome.is_err(),
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "agent stdout: response matched to pending request"
                );
                let _ = pending.sender.send(outcome);
            }
            None => {
                tracing::warn!(
                    provider = %self.provider,
                    id = %id,
                    "agent stdout: response has no matching pending request (orphan)"
                );
            }
        }
        None
    }

    async fn write(&self, payload: &Value) -> Result<(), BridgeError> {
        let mut bytes = serde_json::to_vec(payload).map_err(|err| BridgeError::Stream {
            message: format!("failed to serialize json-rpc message: {err}"),
        })?;
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(|err| {
            tracing::error!(provider = %self.provider, error = %err, "stdin: write failed");
            BridgeError::Stream {
                message: format!("failed to write to agent stdin: {err}"),
            }
        })?;
        writer.flush().await.map_err(|err| {
            tracing::error!(provider = %self.provider, error = %err, "stdin: flush failed");
            BridgeError::Stream {
                message: format!("failed to flush agent stdin: {err}"),
            }
        })
    }
}

fn preview(raw: &str) -> String {
    if raw.len() <= RAW_PREVIEW_BYTES {
        return raw.to_string();
    }
    let mut end = RAW_PREVIEW_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    use super::*;

    fn transport_pair(timeout: Duration) -> (Arc<Transport>, Lines<BufReader<DuplexStream>>) {
        let (client, agent) = tokio::io::duplex(64 * 1024);
        let transport = Arc::new(Transport::new("test", Box::new(client), timeout));
        (transport, BufReader::new(agent).lines())
    }

    async fn next_request(lines: &mut Lines<BufReader<DuplexStream>>) -> Value {
        let line = lines.next_line().await.expect("read").expect("line");
        serde_json::from_str(&line).expect("json")
    }

    #[tokio::test]
    async fn responses_resolve_by_id_not_arrival_order() {
        let (transport, mut agent) = transport_pair(Duration::from_secs(5));

        let mut calls = Vec::new();
        for method in ["a/one", "a/two", "a/three"] {
            let transport = transport.clone();
            calls.push(tokio::spawn(async move {
                transport.request(method, json!({})).await
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let request = next_request(&mut agent).await;
            seen.push((request["id"].clone(), request["method"].clone()));
        }

        for (id, method) in seen.iter().rev() {
            let reply = json!({ "jsonrpc": "2.0", "id": id, "result": { "echo": method } });
            assert!(transport.accept_line(&reply.to_string()).await.is_none());
        }

        let mut results = Vec::new();
        for call in calls {
            results.push(call.await.expect("join").expect("result"));
        }
        assert_eq!(results[0]["echo"], "a/one");
        assert_eq!(results[1]["echo"], "a/two");
        assert_eq!(results[2]["echo"], "a/three");
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_evicts_pending_and_late_reply_is_noop() {
        let (transport, mut agent) = transport_pair(Duration::from_millis(80));

        let started = Instant::now();
        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("session/prompt", json!({})).await })
        };
        let request = next_request(&mut agent).await;

        let err = call.await.expect("join").expect_err("timeout");
        let elapsed = started.elapsed();
        assert!(err.is_timeout(), "{err}");
        assert!(elapsed >= Duration::from_millis(80), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(transport.pending_count(), 0);

        let late = json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} });
        assert!(transport.accept_line(&late.to_string()).await.is_none());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_evicts_its_pending_entry() {
        let (transport, mut agent) = transport_pair(Duration::from_millis(100));

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("session/prompt", json!({})).await })
        };
        let request = next_request(&mut agent).await;
        assert_eq!(transport.pending_count(), 1);

        call.abort();
        assert!(call.await.expect_err("aborted").is_cancelled());
        assert_eq!(transport.pending_count(), 0);

        let late = json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} });
        assert!(transport.accept_line(&late.to_string()).await.is_none());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn agent_error_becomes_protocol_error() {
        let (transport, mut agent) = transport_pair(Duration::from_secs(5));
        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("session/new", json!({})).await })
        };
        let request = next_request(&mut agent).await;
        let reply = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": -32000, "message": "auth required" }
        });
        transport.accept_line(&reply.to_string()).await;

        match call.await.expect("join") {
            Err(BridgeError::Protocol {
                method,
                code,
                message,
                ..
            }) => {
                assert_eq!(method, "session/new");
                assert_eq!(code, -32000);
                assert_eq!(message, "auth required");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_without_breaking_the_stream() {
        let (transport, mut agent) = transport_pair(Duration::from_secs(5));
        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("initialize", json!({})).await })
        };
        let request = next_request(&mut agent).await;

        assert!(transport.accept_line("{not json").await.is_none());
        assert!(transport.accept_line("[1,2,3]").await.is_none());
        assert!(transport.accept_line("   ").await.is_none());

        let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": { "ok": true } });
        transport.accept_line(&reply.to_string()).await;
        assert_eq!(call.await.expect("join").expect("result")["ok"], true);
    }

    #[tokio::test]
    async fn classifies_agent_initiated_messages() {
        let (transport, _agent) = transport_pair(Duration::from_secs(5));

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": "s1" }
        });
        assert_eq!(
            transport.accept_line(&notification.to_string()).await,
            Some(Incoming::Notification {
                method: "session/update".to_string(),
                params: json!({ "sessionId": "s1" }),
            })
        );

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "terminal/create",
            "params": { "command": "ls" }
        });
        assert_eq!(
            transport.accept_line(&request.to_string()).await,
            Some(Incoming::Request {
                id: json!(1),
                method: "terminal/create".to_string(),
                params: json!({ "command": "ls" }),
            })
        );
    }

    #[tokio::test]
    async fn writes_one_line_per_message() {
        let (transport, mut agent) = transport_pair(Duration::from_secs(5));
        transport
            .respond(json!(7), json!({ "granted": true }))
            .await
            .expect("respond");
        transport
            .respond_error(json!("x"), METHOD_NOT_FOUND, "nope")
            .await
            .expect("respond error");

        let first = next_request(&mut agent).await;
        assert_eq!(first, json!({ "jsonrpc": "2.0", "id": 7, "result": { "granted": true } }));
        let second = next_request(&mut agent).await;
        assert_eq!(second["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        let raw = "é".repeat(150);
        let cut = preview(&raw);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= RAW_PREVIEW_BYTES + 3);
    }
}
