//! Conversation id to ACP session bindings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use acp_bridge_error::BridgeError;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::supervisor::AgentProcess;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionBinding {
    session_id: String,
    provider_id: String,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub created: bool,
}

#[derive(Debug)]
pub struct SessionRegistry {
    project_root: PathBuf,
    bindings: Mutex<HashMap<String, SessionBinding>>,
    conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            bindings: Mutex::new(HashMap::new()),
            conversation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reuses the binding for `conversation_id` while it belongs to this
    /// provider and agent generation; otherwise opens a new session.
    pub async fn get_or_create(
        &self,
        agent: &AgentProcess,
        conversation_id: &str,
    ) -> Result<SessionHandle, BridgeError> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        if let Some(binding) = self.bindings.lock().await.get(conversation_id) {
            if binding.provider_id == agent.provider_id()
                && binding.generation == agent.generation()
            {
                return Ok(SessionHandle {
                    session_id: binding.session_id.clone(),
                    created: false,
                });
            }
            tracing::info!(
                conversation_id = %conversation_id,
                previous_provider = %binding.provider_id,
                provider = %agent.provider_id(),
                previous_session = %binding.session_id,
                "rebinding conversation to a new session"
            );
        }

        let session_id = self.new_session(agent).await?;
        self.apply_permission_mode(agent, &session_id).await;
        self.bindings.lock().await.insert(
            conversation_id.to_string(),
            SessionBinding {
                session_id: session_id.clone(),
                provider_id: agent.provider_id().to_string(),
                generation: agent.generation(),
            },
        );
        Ok(SessionHandle {
            session_id,
            created: true,
        })
    }

    /// A fresh session not tied to any conversation.
    pub async fn create_unbound(&self, agent: &AgentProcess) -> Result<String, BridgeError> {
        let session_id = self.new_session(agent).await?;
        self.apply_permission_mode(agent, &session_id).await;
        Ok(session_id)
    }

    pub async fn lookup(&self, conversation_id: &str) -> Option<(String, String)> {
        self.bindings
            .lock()
            .await
            .get(conversation_id)
            .map(|binding| (binding.session_id.clone(), binding.provider_id.clone()))
    }

    pub async fn len(&self) -> usize {
        self.bindings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn new_session(&self, agent: &AgentProcess) -> Result<String, BridgeError> {
        let params = json!({
            "cwd": self.project_root,
            "mcpServers": [],
        });
        let result = agent
            .request("session/new", params)
            .await
            .map_err(|err| match err {
                BridgeError::Timeout { .. } => err,
                other => BridgeError::SessionCreation {
                    provider: agent.provider_id().to_string(),
                    message: other.to_string(),
                },
            })?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BridgeError::SessionCreation {
                provider: agent.provider_id().to_string(),
                message: "session/new result has no sessionId".to_string(),
            })?
            .to_string();

        tracing::info!(
            provider = %agent.provider_id(),
            session_id = %session_id,
            "created session"
        );
        Ok(session_id)
    }

    /// Best effort: a failure is logged and otherwise ignored.
    pub async fn apply_permission_mode(&self, agent: &AgentProcess, session_id: &str) {
        let mode = &agent.provider().permission_mode;
        if mode.is_empty() {
            return;
        }
        let params = json!({ "sessionId": session_id, "modeId": mode });
        if let Err(err) = agent.request("session/set_mode", params).await {
            tracing::warn!(
                provider = %agent.provider_id(),
                session_id = %session_id,
                mode = %mode,
                error = %err,
                "failed to set permission mode"
            );
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.conversation_locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
