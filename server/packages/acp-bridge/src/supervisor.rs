//! One agent subprocess per provider id, spawned on demand and forgotten on exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use acp_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};

use crate::fs;
use crate::notifications::{NotificationRouter, SlashCommandCache};
use crate::permission::{self, REQUEST_PERMISSION_METHOD};
use crate::provider::Provider;
use crate::terminal::TerminalProxy;
use crate::transport::{
    BoxedWriter, Incoming, RpcError, Transport, METHOD_NOT_FOUND, RAW_PREVIEW_BYTES,
};

pub const PROTOCOL_VERSION: u64 = 1;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// What the bridge offers to agents: the project root and the shared
/// terminal and slash-command state.
#[derive(Debug)]
pub struct ClientServices {
    pub project_root: PathBuf,
    pub terminals: Arc<TerminalProxy>,
    pub commands: Arc<SlashCommandCache>,
}

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
}

/// The raw channels of one agent plus its lifecycle hooks.
pub struct AgentIo {
    pub writer: BoxedWriter,
    pub reader: BoxedReader,
    pub pid: Option<u32>,
    pub kill: Option<oneshot::Sender<()>>,
    pub exited: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct AgentProcess {
    provider: Provider,
    generation: u64,
    owner: String,
    pid: Option<u32>,
    spawned_at: Instant,
    transport: Transport,
    router: NotificationRouter,
    agent_info: std::sync::Mutex<Option<Value>>,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub provider_id: String,
    pub generation: u64,
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_ms: u64,
    pub agent_info: Option<Value>,
}

impl AgentProcess {
    /// Wires `io` to a transport and starts the inbound pump.
    pub fn start(
        provider: Provider,
        generation: u64,
        io: AgentIo,
        services: Arc<ClientServices>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let agent = Arc::new(Self {
            owner: format!("{}#{generation}", provider.id),
            transport: Transport::new(provider.id.clone(), io.writer, request_timeout),
            router: NotificationRouter::new(provider.id.clone(), services.commands.clone()),
            provider,
            generation,
            pid: io.pid,
            spawned_at: Instant::now(),
            agent_info: std::sync::Mutex::new(None),
            kill: std::sync::Mutex::new(io.kill),
            exited: io.exited,
        });
        agent.clone().spawn_stdout_pump(io.reader, services);
        agent
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn provider_id(&self) -> &str {
        &self.provider.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }

    pub fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    pub fn agent_info(&self) -> Option<Value> {
        self.agent_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            provider_id: self.provider.id.clone(),
            generation: self.generation,
            running: self.is_alive(),
            pid: self.pid,
            uptime_ms: self.spawned_at.elapsed().as_millis() as u64,
            agent_info: self
                .agent_info()
                .and_then(|result| result.get("agentInfo").cloned()),
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.transport.request(method, params).await
    }

    pub async fn wait_exited(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    async fn initialize(&self, client: &ClientIdentity) -> Result<(), BridgeError> {
        let capabilities = self.provider.capabilities;
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": client.name,
                "version": client.version,
            },
            "clientCapabilities": {
                "fs": {
                    "readTextFile": capabilities.read_text_file,
                    "writeTextFile": capabilities.write_text_file,
                },
                "terminal": capabilities.terminal,
            },
        });

        let started = Instant::now();
        let result = tokio::select! {
            result = self.request("initialize", params) => result,
            _ = self.wait_exited() => Err(BridgeError::Spawn {
                provider: self.provider.id.clone(),
                message: "agent exited during initialize".to_string(),
            }),
        };
        let result = match result {
            Ok(result) => result,
            Err(err @ BridgeError::Timeout { .. }) | Err(err @ BridgeError::Spawn { .. }) => {
                return Err(err)
            }
            Err(err) => {
                return Err(BridgeError::Spawn {
                    provider: self.provider.id.clone(),
                    message: format!("initialize failed: {err}"),
                })
            }
        };

        tracing::info!(
            provider = %self.provider.id,
            protocol_version = ?result.get("protocolVersion"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent initialized"
        );
        *self.agent_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        Ok(())
    }

    /// Kills the subprocess and waits briefly for it to go away.
    pub async fn shutdown(&self) {
        let sender = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            tracing::info!(
                provider = %self.provider.id,
                pid = ?self.pid,
                age_ms = self.spawned_at.elapsed().as_millis() as u64,
                "shutting down agent process"
            );
            let _ = sender.send(());
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.wait_exited()).await;
    }

    fn spawn_stdout_pump(self: Arc<Self>, reader: BoxedReader, services: Arc<ClientServices>) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            let mut line_count: u64 = 0;

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(
                            provider = %self.provider.id,
                            error = %err,
                            "agent stdout: read failed"
                        );
                        break;
                    }
                }
                line_count += 1;

                let Ok(line) = std::str::from_utf8(&buf) else {
                    let preview = &buf[..buf.len().min(RAW_PREVIEW_BYTES)];
                    tracing::warn!(
                        provider = %self.provider.id,
                        raw = %String::from_utf8_lossy(preview),
                        "agent stdout: line is not valid UTF-8"
                    );
                    continue;
                };
                if let Some(incoming) = self.transport.accept_line(line).await {
                    self.dispatch(incoming, &services).await;
                }
            }

            tracing::info!(
                provider = %self.provider.id,
                total_lines = line_count,
                age_ms = self.spawned_at.elapsed().as_millis() as u64,
                "agent stdout: stream ended"
            );
        });
    }

    async fn dispatch(self: &Arc<Self>, incoming: Incoming, services: &Arc<ClientServices>) {
        match incoming {
            Incoming::Notification { method, params } => {
                if method == "session/update" {
                    self.router.route(&params);
                } else {
                    tracing::debug!(
                        provider = %self.provider.id,
                        method = %method,
                        "ignoring agent notification"
                    );
                }
            }
            Incoming::Request { id, method, params } => {
                if method == REQUEST_PERMISSION_METHOD {
                    tracing::info!(
                        provider = %self.provider.id,
                        session_id = ?params.get("sessionId"),
                        tool_call_id = ?params.pointer("/toolCall/toolCallId"),
                        "granting permission request"
                    );
                    self.reply(id, Ok(permission::grant(&params))).await;
                    return;
                }

                // Terminal waits can take arbitrarily long; never hold up the pump.
                let agent = self.clone();
                let services = services.clone();
                tokio::spawn(async move {
                    let result = agent.serve_request(&method, params, &services).await;
                    agent.reply(id, result).await;
                });
            }
        }
    }

    async fn serve_request(
        &self,
        method: &str,
        params: Value,
        services: &ClientServices,
    ) -> Result<Value, RpcError> {
        if method.starts_with("terminal/") && self.provider.capabilities.terminal {
            return services
                .terminals
                .handle_request(&self.owner, method, params)
                .await;
        }
        if method.starts_with("fs/") {
            return fs::handle_request(
                &services.project_root,
                self.provider.capabilities,
                method,
                params,
            )
            .await;
        }

        tracing::warn!(
            provider = %self.provider.id,
            method = %method,
            "agent called unsupported client method"
        );
        Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        })
    }

    async fn reply(&self, id: Value, result: Result<Value, RpcError>) {
        let sent = match result {
            Ok(result) => self.transport.respond(id, result).await,
            Err(error) => {
                self.transport
                    .respond_error(id, error.code, &error.message)
                    .await
            }
        };
        if let Err(err) = sent {
            tracing::warn!(provider = %self.provider.id, error = %err, "failed to reply to agent");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_root: PathBuf,
    pub request_timeout: Duration,
    pub client: ClientIdentity,
}

#[derive(Debug)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

#[derive(Debug)]
struct SupervisorInner {
    config: SupervisorConfig,
    services: Arc<ClientServices>,
    next_generation: AtomicU64,
    agents: Mutex<HashMap<String, Arc<AgentProcess>>>,
    spawn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, services: Arc<ClientServices>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                services,
                next_generation: AtomicU64::new(1),
                agents: Mutex::new(HashMap::new()),
                spawn_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the live agent for `provider.id`, launching and initializing
    /// one if there is none.
    pub async fn spawn_agent(
        &self,
        provider: &Provider,
    ) -> Result<Arc<AgentProcess>, BridgeError> {
        if let Some(agent) = self.get(&provider.id).await {
            return Ok(agent);
        }

        let lock = self.spawn_lock(&provider.id).await;
        let _guard = lock.lock().await;
        if let Some(agent) = self.get(&provider.id).await {
            return Ok(agent);
        }

        let agent = self.launch(provider)?;
        if let Err(err) = agent.initialize(&self.inner.config.client).await {
            tracing::error!(provider = %provider.id, error = %err, "agent initialize failed");
            agent.shutdown().await;
            return Err(err);
        }

        self.inner
            .agents
            .lock()
            .await
            .insert(provider.id.clone(), agent.clone());
        Ok(agent)
    }

    pub async fn get(&self, provider_id: &str) -> Option<Arc<AgentProcess>> {
        let mut agents = self.inner.agents.lock().await;
        match agents.get(provider_id) {
            Some(agent) if agent.is_alive() => Some(agent.clone()),
            Some(_) => {
                agents.remove(provider_id);
                None
            }
            None => None,
        }
    }

    pub async fn statuses(&self) -> Vec<AgentStatus> {
        let mut statuses = self
            .inner
            .agents
            .lock()
            .await
            .values()
            .map(|agent| agent.status())
            .collect::<Vec<_>>();
        statuses.sort_by(|left, right| left.provider_id.cmp(&right.provider_id));
        statuses
    }

    pub async fn shutdown(&self) {
        let agents = {
            let mut agents = self.inner.agents.lock().await;
            agents.drain().map(|(_, agent)| agent).collect::<Vec<_>>()
        };
        for agent in agents {
            agent.shutdown().await;
        }
    }

    async fn spawn_lock(&self, provider_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .spawn_locks
            .lock()
            .await
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn launch(&self, provider: &Provider) -> Result<Arc<AgentProcess>, BridgeError> {
        let spawn_start = Instant::now();
        let project_root = &self.inner.config.project_root;

        let mut command = Command::new(&provider.command);
        command
            .args(&provider.args)
            .current_dir(project_root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &provider.env {
            command.env(key, value);
        }

        tracing::info!(
            provider = %provider.id,
            program = %provider.command,
            args = ?provider.args,
            cwd = %project_root.display(),
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(provider = %provider.id, error = %err, "failed to spawn agent process");
            BridgeError::Spawn {
                provider: provider.id.clone(),
                message: format!("{}: {err}", provider.command),
            }
        })?;

        let missing = |pipe: &str| BridgeError::Spawn {
            provider: provider.id.clone(),
            message: format!("failed to capture agent {pipe}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let pid = child.id();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            provider = %provider.id,
            pid = ?pid,
            generation = generation,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        spawn_stderr_pump(provider.id.clone(), stderr);

        let inner = self.inner.clone();
        let provider_id = provider.id.clone();
        let owner = format!("{provider_id}#{generation}");
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            match &status {
                Ok(status) => tracing::warn!(
                    provider = %provider_id,
                    success = status.success(),
                    code = status.code(),
                    age_ms = spawn_start.elapsed().as_millis() as u64,
                    "agent process exited"
                ),
                Err(err) => tracing::error!(
                    provider = %provider_id,
                    error = %err,
                    "agent process: failed to get exit status"
                ),
            }

            let _ = exit_tx.send(true);
            inner.remove_if_generation(&provider_id, generation).await;
            inner.services.terminals.release_owned_by(&owner).await;
        });

        Ok(AgentProcess::start(
            provider.clone(),
            generation,
            AgentIo {
                writer: Box::new(stdin),
                reader: Box::new(stdout),
                pid,
                kill: Some(kill_tx),
                exited: exit_rx,
            },
            self.inner.services.clone(),
            self.inner.config.request_timeout,
        ))
    }
}

impl SupervisorInner {
    async fn remove_if_generation(&self, provider_id: &str, generation: u64) {
        let mut agents = self.agents.lock().await;
        if agents
            .get(provider_id)
            .is_some_and(|agent| agent.generation() == generation)
        {
            agents.remove(provider_id);
        }
    }
}

fn spawn_stderr_pump(provider_id: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(provider = %provider_id, "agent stderr: {}", line.trim_end());
                }
            }
        }
    });
}


#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn permission_requests_are_granted_and_terminals_served() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let agent = scripted_agent(
            provider("mock"),
            1,
            services(),
            Duration::from_secs(5),
            move |message| {
                if message.get("method").is_none() {
                    let _ = seen_tx.send(message.clone());
                    return Vec::new();
                }
                match message["method"].as_str() {
                    Some("kick") => vec![
                        result(message, json!({})),
                        json!({
                            "jsonrpc": "2.0",
                            "id": 100,
                            "method": "session/request_permission",
                            "params": {
                                "sessionId": "s1",
                                "toolCall": { "toolCallId": "t1" },
                                "options": [{ "optionId": "ok", "kind": "allow_once" }]
                            }
                        }),
                        json!({
                            "jsonrpc": "2.0",
                            "id": 101,
                            "method": "terminal/output",
                            "params": { "sessionId": "s1", "terminalId": "term-missing" }
                        }),
                        json!({
                            "jsonrpc": "2.0",
                            "id": 102,
                            "method": "editor/open",
                            "params": {}
                        }),
                    ],
                    _ => Vec::new(),
                }
            },
        );

        agent.request("kick", json!({})).await.expect("kick");

        let mut replies = HashMap::new();
        for _ in 0..3 {
            let reply = timeout(Duration::from_secs(5), seen_rx.recv())
                .await
                .expect("reply in time")
                .expect("reply");
            replies.insert(reply["id"].as_u64().expect("id"), reply);
        }
        assert_eq!(replies[&100]["result"]["outcome"]["optionId"], "ok");
        assert_eq!(replies[&101]["result"]["output"], "");
        assert_eq!(replies[&102]["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_utf8_lines_do_not_stop_the_pump() {
        let (bridge_side, agent_side) = tokio::io::duplex(1 << 16);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (agent_read, mut agent_write) = tokio::io::split(agent_side);
        let (_exit_tx, exit_rx) = watch::channel(false);

        let agent = AgentProcess::start(
            provider("garbled"),
            1,
            AgentIo {
                writer: Box::new(bridge_write),
                reader: Box::new(bridge_read),
                pid: None,
                kill: None,
                exited: exit_rx,
            },
            services(),
            Duration::from_secs(5),
        );

        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(agent_read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let request: Value = serde_json::from_str(&line).expect("json");
            agent_write
                .write_all(b"\xff\xfe garbage\n")
                .await
                .expect("write garbage");
            let reply = format!("{}\n", result(&request, json!({ "pong": true })));
            agent_write
                .write_all(reply.as_bytes())
                .await
                .expect("write reply");
            (lines, agent_write)
        });

        let pong = timeout(Duration::from_secs(5), agent.request("ping", json!({})))
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(pong["pong"], true);
        assert!(agent.is_alive());
        assert_eq!(agent.transport.pending_count(), 0);
        drop(responder.await.expect("join"));
    }

    #[cfg(unix)]
    fn shell_provider(id: &str, script: &str) -> Provider {
        Provider {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..provider(id)
        }
    }

    #[cfg(unix)]
    fn supervisor(timeout: Duration) -> Supervisor {
        Supervisor::new(
            SupervisorConfig {
                project_root: std::env::temp_dir(),
                request_timeout: timeout,
                client: ClientIdentity {
                    name: "acp-bridge-test".to_string(),
                    version: "0.0.0".to_string(),
                },
            },
            services(),
        )
    }

    #[cfg(unix)]
    const ECHO_INITIALIZE: &str = concat!(
        "read line; ",
        r#"echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}}'; "#,
        "cat > /dev/null",
    );

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_agent_that_echoes_initialize_is_reused() {
        let supervisor = supervisor(Duration::from_secs(5));
        let provider = shell_provider("stub", ECHO_INITIALIZE);

        let agent = timeout(Duration::from_secs(5), supervisor.spawn_agent(&provider))
            .await
            .expect("spawn in time")
            .expect("spawn");
        assert!(agent.is_alive());
        assert_eq!(agent.agent_info().expect("info")["protocolVersion"], 1);

        let again = supervisor.spawn_agent(&provider).await.expect("reuse");
        assert!(Arc::ptr_eq(&agent, &again));
        assert_eq!(supervisor.statuses().await.len(), 1);

        supervisor.shutdown().await;
        assert!(!agent.is_alive());
        assert!(supervisor.get("stub").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_agent_is_relaunched_from_scratch() {
        let supervisor = supervisor(Duration::from_secs(5));
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'; sleep 0.3"#;
        let provider = shell_provider("short-lived", script);

        let first = supervisor.spawn_agent(&provider).await.expect("spawn");
        timeout(Duration::from_secs(5), first.wait_exited())
            .await
            .expect("exit");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.get("short-lived").await.is_none());

        let second = supervisor.spawn_agent(&provider).await.expect("respawn");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.generation() > first.generation());
        supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failures_are_reported() {
        let supervisor = supervisor(Duration::from_secs(5));
        let missing = Provider {
            command: "/nonexistent/acp-agent".to_string(),
            ..provider("missing")
        };
        assert!(matches!(
            supervisor.spawn_agent(&missing).await,
            Err(BridgeError::Spawn { provider, .. }) if provider == "missing"
        ));

        let quits = shell_provider("quits", "exit 0");
        let err = timeout(Duration::from_secs(5), supervisor.spawn_agent(&quits))
            .await
            .expect("no hang")
            .expect_err("exits during initialize");
        assert!(matches!(err, BridgeError::Spawn { .. }), "{err}");
        assert!(supervisor.statuses().await.is_empty());
    }
}
