//! Prompt execution and the NDJSON record encoding of its updates.

use acp_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::{json, Value};

use crate::notifications::{SessionUpdate, Subscription, ToolCallEvent};
use crate::supervisor::AgentProcess;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolEvent {
    Call,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Text {
        seq: u64,
        text: String,
    },
    Tool {
        seq: u64,
        event: ToolEvent,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        title: Option<String>,
        kind: Option<String>,
        status: Option<String>,
        raw: Value,
    },
    Done {
        seq: u64,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "stopReason")]
        stop_reason: String,
    },
}

impl Record {
    pub fn seq(&self) -> u64 {
        match self {
            Record::Text { seq, .. } | Record::Tool { seq, .. } | Record::Done { seq, .. } => *seq,
        }
    }

    /// One JSON object terminated by `\n`.
    pub fn to_line(&self) -> Result<Vec<u8>, BridgeError> {
        let mut line = serde_json::to_vec(self).map_err(|err| BridgeError::Stream {
            message: format!("failed to encode record: {err}"),
        })?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Assigns sequence numbers, starting at 1, to the records of one prompt.
#[derive(Debug, Default)]
pub struct RecordEncoder {
    seq: u64,
}

impl RecordEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for updates that are not streamed.
    pub fn encode(&mut self, update: SessionUpdate) -> Option<Record> {
        match update {
            SessionUpdate::AgentMessageChunk { text } if !text.is_empty() => Some(Record::Text {
                seq: self.next_seq(),
                text,
            }),
            SessionUpdate::ToolCall(call) => Some(self.tool(ToolEvent::Call, call)),
            SessionUpdate::ToolCallUpdate(call) => Some(self.tool(ToolEvent::Update, call)),
            _ => None,
        }
    }

    pub fn done(&mut self, session_id: &str, stop_reason: &str) -> Record {
        Record::Done {
            seq: self.next_seq(),
            session_id: session_id.to_string(),
            stop_reason: stop_reason.to_string(),
        }
    }

    fn tool(&mut self, event: ToolEvent, call: ToolCallEvent) -> Record {
        Record::Tool {
            seq: self.next_seq(),
            event,
            tool_call_id: call.tool_call_id,
            title: call.title,
            kind: call.kind,
            status: call.status,
            raw: call.raw,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecord {
    pub event: ToolEvent,
    #[serde(flatten)]
    pub call: ToolCallEvent,
}

/// Everything a non-streamed prompt produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolRecord>,
}

impl Completion {
    pub fn absorb(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { text } => self.text.push_str(&text),
            SessionUpdate::ToolCall(call) => self.tool_calls.push(ToolRecord {
                event: ToolEvent::Call,
                call,
            }),
            SessionUpdate::ToolCallUpdate(call) => self.tool_calls.push(ToolRecord {
                event: ToolEvent::Update,
                call,
            }),
            _ => {}
        }
    }
}

/// Sends `session/prompt` on the subscribed session and feeds every update
/// routed to it into `on_update` until the prompt completes. Returns the
/// stop reason. The subscription is dropped before returning.
pub async fn run_prompt<F>(
    agent: &AgentProcess,
    mut subscription: Subscription,
    message: &str,
    mut on_update: F,
) -> Result<String, BridgeError>
where
    F: FnMut(SessionUpdate),
{
    let session_id = subscription.session_id().to_string();
    let params = json!({
        "sessionId": session_id,
        "prompt": [{ "type": "text", "text": message }],
    });

    let prompt = agent.request("session/prompt", params);
    tokio::pin!(prompt);

    let mut listening = true;
    let result = loop {
        tokio::select! {
            biased;
            update = subscription.recv(), if listening => match update {
                Some(update) => on_update(update),
                None => listening = false,
            },
            result = &mut prompt => break result,
        }
    };

    // Updates the agent wrote before its prompt reply are already queued.
    while let Some(update) = subscription.try_recv() {
        on_update(update);
    }
    drop(subscription);

    let result = result?;
    let stop_reason = result
        .get("stopReason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn")
        .to_string();
    tracing::info!(
        provider = %agent.provider_id(),
        session_id = %session_id,
        stop_reason = %stop_reason,
        "prompt completed"
    );
    Ok(stop_reason)
}
