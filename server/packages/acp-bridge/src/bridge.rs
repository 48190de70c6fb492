//! The bridge instance: provider resolution and the operations behind each
//! HTTP endpoint.

use std::io;
use std::sync::Arc;

use acp_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::notifications::{SlashCommand, SlashCommandCache, Subscription};
use crate::provider::{Provider, ProviderRef, ProviderRegistry};
use crate::sessions::SessionRegistry;
use crate::stream::{run_prompt, Completion, RecordEncoder, ToolRecord};
use crate::supervisor::{AgentProcess, ClientIdentity, ClientServices, Supervisor, SupervisorConfig};
use crate::terminal::TerminalProxy;
use crate::BridgeConfig;

#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub provider: ProviderRef,
    pub message: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub ok: bool,
    pub session_id: String,
    pub text: String,
    pub stop_reason: String,
    pub tool_calls: Vec<ToolRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub agent_info: Option<Value>,
}

pub type RecordStream = UnboundedReceiverStream<Result<Vec<u8>, io::Error>>;

#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    registry: ProviderRegistry,
    supervisor: Supervisor,
    sessions: SessionRegistry,
    commands: Arc<SlashCommandCache>,
    terminals: Arc<TerminalProxy>,
}

struct PreparedPrompt {
    agent: Arc<AgentProcess>,
    subscription: Subscription,
}

impl Bridge {
    pub fn new(config: BridgeConfig, registry: ProviderRegistry) -> Self {
        let commands = Arc::new(SlashCommandCache::default());
        let terminals = Arc::new(TerminalProxy::new(config.project_root.clone()));
        let services = Arc::new(ClientServices {
            project_root: config.project_root.clone(),
            terminals: terminals.clone(),
            commands: commands.clone(),
        });
        let supervisor = Supervisor::new(
            SupervisorConfig {
                project_root: config.project_root.clone(),
                request_timeout: config.request_timeout,
                client: ClientIdentity {
                    name: config.client_name.clone(),
                    version: config.client_version.clone(),
                },
            },
            services,
        );

        Self {
            sessions: SessionRegistry::new(config.project_root.clone()),
            config,
            registry,
            supervisor,
            commands,
            terminals,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn terminals(&self) -> &Arc<TerminalProxy> {
        &self.terminals
    }

    pub fn resolve_provider(&self, provider: &ProviderRef) -> Result<Provider, BridgeError> {
        match provider {
            ProviderRef::Id(id) => {
                self.registry
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BridgeError::ProviderNotFound {
                        provider: id.clone(),
                    })
            }
            ProviderRef::Inline(provider) => {
                if provider.id.trim().is_empty() || provider.command.trim().is_empty() {
                    return Err(BridgeError::InvalidRequest {
                        message: "inline provider needs an id and a command".to_string(),
                    });
                }
                Ok(provider.as_ref().clone())
            }
        }
    }

    async fn agent(&self, provider: &ProviderRef) -> Result<Arc<AgentProcess>, BridgeError> {
        let provider = self.resolve_provider(provider)?;
        self.supervisor.spawn_agent(&provider).await
    }

    pub async fn get_session(
        &self,
        provider: &ProviderRef,
        conversation_id: &str,
    ) -> Result<String, BridgeError> {
        let agent = self.agent(provider).await?;
        let handle = self.sessions.get_or_create(&agent, conversation_id).await?;
        Ok(handle.session_id)
    }

    /// Opens a session outside any conversation and returns it with the
    /// provider's slash commands, waiting briefly for the first list.
    pub async fn init_session(
        &self,
        provider: &ProviderRef,
    ) -> Result<(String, Vec<SlashCommand>), BridgeError> {
        let agent = self.agent(provider).await?;
        let session_id = self.sessions.create_unbound(&agent).await?;
        let commands = self
            .commands
            .wait_for(agent.provider_id(), self.config.commands_wait)
            .await;
        Ok((session_id, commands))
    }

    pub fn slash_commands(&self, provider_id: &str) -> Vec<SlashCommand> {
        self.commands.commands(provider_id)
    }

    pub async fn send_message(
        &self,
        request: &MessageRequest,
    ) -> Result<MessageResponse, BridgeError> {
        let PreparedPrompt {
            agent,
            subscription,
        } = self.prepare(request).await?;
        let session_id = subscription.session_id().to_string();
        let message = request.message.clone();

        // The prompt keeps the session slot until the agent finishes, even if
        // this caller is dropped.
        let prompt = tokio::spawn(async move {
            let mut completion = Completion::default();
            let stop_reason = run_prompt(&agent, subscription, &message, |update| {
                completion.absorb(update)
            })
            .await?;
            Ok::<_, BridgeError>((stop_reason, completion))
        });
        let (stop_reason, completion) = prompt.await.map_err(|err| BridgeError::Stream {
            message: format!("prompt task failed: {err}"),
        })??;

        Ok(MessageResponse {
            ok: true,
            session_id,
            text: completion.text,
            stop_reason,
            tool_calls: completion.tool_calls,
        })
    }

    /// Sets up the session and listener, then runs the prompt on its own task
    /// so it completes even if the consumer goes away. Errors raised before
    /// the first record are returned directly; later ones end the stream
    /// without a `done` record.
    pub async fn stream_message(
        &self,
        request: &MessageRequest,
    ) -> Result<RecordStream, BridgeError> {
        let PreparedPrompt {
            agent,
            subscription,
        } = self.prepare(request).await?;
        let session_id = subscription.session_id().to_string();
        let message = request.message.clone();
        let (tx, rx) = mpsc::unbounded_channel::<Result<Vec<u8>, io::Error>>();

        tokio::spawn(async move {
            let mut encoder = RecordEncoder::new();
            let result = run_prompt(&agent, subscription, &message, |update| {
                if let Some(record) = encoder.encode(update) {
                    send_record(&tx, record.to_line());
                }
            })
            .await;

            match result {
                Ok(stop_reason) => {
                    send_record(&tx, encoder.done(&session_id, &stop_reason).to_line());
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %agent.provider_id(),
                        session_id = %session_id,
                        error = %err,
                        "aborting stream"
                    );
                    let _ = tx.send(Err(io::Error::other(err.to_string())));
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx))
    }

    async fn prepare(&self, request: &MessageRequest) -> Result<PreparedPrompt, BridgeError> {
        let agent = self.agent(&request.provider).await?;
        let session_id = match request.conversation_id.as_deref() {
            Some(conversation_id) => {
                let handle = self.sessions.get_or_create(&agent, conversation_id).await?;
                if !handle.created {
                    self.sessions
                        .apply_permission_mode(&agent, &handle.session_id)
                        .await;
                }
                handle.session_id
            }
            None => self.sessions.create_unbound(&agent).await?,
        };

        let subscription = agent.router().subscribe(&session_id)?;
        Ok(PreparedPrompt {
            agent,
            subscription,
        })
    }

    pub async fn providers(&self) -> Vec<ProviderInfo> {
        let statuses = self.supervisor.statuses().await;
        self.registry
            .iter()
            .map(|provider| {
                let status = statuses
                    .iter()
                    .find(|status| status.provider_id == provider.id && status.running);
                ProviderInfo {
                    id: provider.id.clone(),
                    name: provider.display_name().to_string(),
                    running: status.is_some(),
                    pid: status.and_then(|status| status.pid),
                    agent_info: status.and_then(|status| status.agent_info.clone()),
                }
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        tracing::info!("shutting down bridge");
        self.supervisor.shutdown().await;
        self.terminals.shutdown().await;
    }
}

fn send_record(
    tx: &mpsc::UnboundedSender<Result<Vec<u8>, io::Error>>,
    line: Result<Vec<u8>, BridgeError>,
) {
    let item = line.map_err(|err| io::Error::other(err.to_string()));
    // The consumer may have disconnected; the prompt keeps running regardless.
    let _ = tx.send(item);
}
