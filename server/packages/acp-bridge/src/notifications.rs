//! Demultiplexes `session/update` notifications onto per-session listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use acp_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub tool_call_id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

/// The one shape consumers see, whatever nesting the agent used.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    AgentMessageChunk { text: String },
    ToolCall(ToolCallEvent),
    ToolCallUpdate(ToolCallEvent),
    AvailableCommands(Vec<SlashCommand>),
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedUpdate {
    pub session_id: String,
    pub update: SessionUpdate,
}

pub fn decode_session_update(params: &Value) -> Option<RoutedUpdate> {
    let session_id = params.get("sessionId")?.as_str()?.to_string();
    let update = params.get("update").unwrap_or(&Value::Null);
    let kind = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let update = match kind {
        "agent_message_chunk" => {
            let text = update
                .get("content")
                .and_then(extract_text)
                .or_else(|| update.get("text").and_then(extract_text))
                .unwrap_or_default();
            if text.is_empty() {
                SessionUpdate::Other {
                    kind: kind.to_string(),
                }
            } else {
                SessionUpdate::AgentMessageChunk { text }
            }
        }
        "tool_call" => SessionUpdate::ToolCall(tool_call_event(update)),
        "tool_call_update" => SessionUpdate::ToolCallUpdate(tool_call_event(update)),
        "available_commands_update" => {
            let commands = update
                .get("availableCommands")
                .cloned()
                .and_then(|value| serde_json::from_value::<Vec<SlashCommand>>(value).ok())
                .unwrap_or_default();
            SessionUpdate::AvailableCommands(commands)
        }
        other => SessionUpdate::Other {
            kind: other.to_string(),
        },
    };

    Some(RoutedUpdate { session_id, update })
}

fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let joined = items.iter().filter_map(extract_text).collect::<String>();
            Some(joined)
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                return Some(text.to_string());
            }
            map.get("content")
                .or_else(|| map.get("resource"))
                .and_then(extract_text)
        }
        _ => None,
    }
}

fn tool_call_event(update: &Value) -> ToolCallEvent {
    let field = |name: &str| {
        update
            .get(name)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    };
    ToolCallEvent {
        tool_call_id: field("toolCallId").unwrap_or_default(),
        title: field("title"),
        kind: field("kind"),
        status: field("status"),
        raw: update.clone(),
    }
}

/// Provider id -> latest advertised slash commands.
#[derive(Debug, Default)]
pub struct SlashCommandCache {
    commands: RwLock<HashMap<String, Vec<SlashCommand>>>,
    updated: Notify,
}

impl SlashCommandCache {
    pub fn replace(&self, provider: &str, commands: Vec<SlashCommand>) {
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(provider.to_string(), commands);
        self.updated.notify_waiters();
    }

    pub fn get(&self, provider: &str) -> Option<Vec<SlashCommand>> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .cloned()
    }

    pub fn commands(&self, provider: &str) -> Vec<SlashCommand> {
        self.get(provider).unwrap_or_default()
    }

    /// Waits up to `wait` for a first update from `provider`.
    pub async fn wait_for(&self, provider: &str, wait: Duration) -> Vec<SlashCommand> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(commands) = self.get(provider) {
                return commands;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }
}

#[derive(Debug)]
struct ListenerSlot {
    token: u64,
    sender: mpsc::UnboundedSender<SessionUpdate>,
}

type ListenerTable = Arc<Mutex<HashMap<String, ListenerSlot>>>;

#[derive(Debug)]
pub struct NotificationRouter {
    provider: String,
    listeners: ListenerTable,
    next_token: AtomicU64,
    commands: Arc<SlashCommandCache>,
}

impl NotificationRouter {
    pub fn new(provider: impl Into<String>, commands: Arc<SlashCommandCache>) -> Self {
        Self {
            provider: provider.into(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            commands,
        }
    }

    /// Claims the single listener slot for `session_id`.
    pub fn subscribe(&self, session_id: &str) -> Result<Subscription, BridgeError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = listeners.get(session_id) {
            if !existing.sender.is_closed() {
                return Err(BridgeError::SessionBusy {
                    session_id: session_id.to_string(),
                });
            }
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        listeners.insert(session_id.to_string(), ListenerSlot { token, sender });

        Ok(Subscription {
            listeners: self.listeners.clone(),
            session_id: session_id.to_string(),
            token,
            receiver,
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_listener(&self, session_id: &str) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    pub fn route(&self, params: &Value) {
        let Some(routed) = decode_session_update(params) else {
            tracing::warn!(provider = %self.provider, "session/update without sessionId");
            return;
        };

        if let SessionUpdate::AvailableCommands(commands) = &routed.update {
            tracing::debug!(
                provider = %self.provider,
                count = commands.len(),
                "slash commands updated"
            );
            self.commands.replace(&self.provider, commands.clone());
        }

        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        match listeners.get(&routed.session_id) {
            Some(slot) => {
                let _ = slot.sender.send(routed.update);
            }
            None => {
                tracing::trace!(
                    provider = %self.provider,
                    session_id = %routed.session_id,
                    "session/update with no listener"
                );
            }
        }
    }
}

/// Listener registration for one session; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    listeners: ListenerTable,
    session_id: String,
    token: u64,
    receiver: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<SessionUpdate> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionUpdate> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners
            .get(&self.session_id)
            .is_some_and(|slot| slot.token == self.token)
        {
            listeners.remove(&self.session_id);
        }
    }
}
