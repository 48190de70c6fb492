//! Agent-initiated terminals backed by real shell processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acp_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};

use crate::transport::{RpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalIdParams {
    terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitState {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitState {
    fn unknown_terminal() -> Self {
        Self {
            exit_code: Some(0),
            signal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub output: String,
    pub truncated: bool,
    pub exit_status: Option<ExitState>,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if let Some(limit) = self.limit {
            if self.bytes.len() > limit {
                let excess = self.bytes.len() - limit;
                self.bytes.drain(..excess);
                self.truncated = true;
            }
        }
    }

    fn text(&self) -> String {
        // A byte limit may have cut through a multi-byte character.
        let start = if self.truncated {
            self.bytes
                .iter()
                .position(|byte| (byte & 0b1100_0000) != 0b1000_0000)
                .unwrap_or(self.bytes.len())
        } else {
            0
        };
        String::from_utf8_lossy(&self.bytes[start..]).into_owned()
    }
}

#[derive(Debug)]
struct Terminal {
    owner: String,
    pid: Option<u32>,
    output: Arc<std::sync::Mutex<OutputBuffer>>,
    exit: watch::Receiver<Option<ExitState>>,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl Terminal {
    fn snapshot(&self) -> TerminalOutput {
        let buffer = self.output.lock().unwrap_or_else(|e| e.into_inner());
        TerminalOutput {
            output: buffer.text(),
            truncated: buffer.truncated,
            exit_status: self.exit.borrow().clone(),
        }
    }

    fn kill(&self) {
        let sender = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

#[derive(Debug)]
pub struct TerminalProxy {
    default_cwd: PathBuf,
    next_id: AtomicU64,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

impl TerminalProxy {
    pub fn new(default_cwd: impl Into<PathBuf>) -> Self {
        Self {
            default_cwd: default_cwd.into(),
            next_id: AtomicU64::new(1),
            terminals: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.terminals.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.terminals.lock().await.is_empty()
    }

    /// Serves one `terminal/*` request from the agent identified by `owner`.
    pub async fn handle_request(
        &self,
        owner: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        match method {
            "terminal/create" => {
                let params: CreateTerminalParams = parse_params(params)?;
                let terminal_id = self.create(owner, params).await.map_err(|err| RpcError {
                    code: INTERNAL_ERROR,
                    message: err.to_string(),
                    data: None,
                })?;
                Ok(json!({ "terminalId": terminal_id }))
            }
            "terminal/output" => {
                let params: TerminalIdParams = parse_params(params)?;
                Ok(json!(self.output(&params.terminal_id).await))
            }
            "terminal/wait_for_exit" => {
                let params: TerminalIdParams = parse_params(params)?;
                Ok(json!(self.wait_for_exit(&params.terminal_id).await))
            }
            "terminal/kill" => {
                let params: TerminalIdParams = parse_params(params)?;
                self.kill(&params.terminal_id).await;
                Ok(Value::Null)
            }
            "terminal/release" => {
                let params: TerminalIdParams = parse_params(params)?;
                self.release(&params.terminal_id).await;
                Ok(Value::Null)
            }
            other => Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("unsupported terminal method: {other}"),
                data: None,
            }),
        }
    }

    pub async fn create(
        &self,
        owner: &str,
        params: CreateTerminalParams,
    ) -> Result<String, BridgeError> {
        let command_line = shell_line(&params.command, &params.args);
        let cwd = params
            .cwd
            .map(|cwd| resolve_cwd(&self.default_cwd, cwd))
            .unwrap_or_else(|| self.default_cwd.clone());

        let mut command = shell_command(&command_line);
        command
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for variable in &params.env {
            command.env(&variable.name, &variable.value);
        }

        let mut child = command.spawn().map_err(|err| BridgeError::Spawn {
            provider: owner.to_string(),
            message: format!("failed to start terminal command `{command_line}`: {err}"),
        })?;

        let terminal_id = format!("term-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let pid = child.id();
        let output = Arc::new(std::sync::Mutex::new(OutputBuffer {
            limit: params.output_byte_limit,
            ..OutputBuffer::default()
        }));

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump_output(stdout, output.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_output(stderr, output.clone())));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let watcher_id = terminal_id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let drain = async {
                if let Some(task) = stdout_task {
                    let _ = task.await;
                }
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::debug!(terminal_id = %watcher_id, "terminal output still open after exit");
            }

            let state = match status {
                Ok(status) => exit_state(status),
                Err(err) => {
                    tracing::warn!(
                        terminal_id = %watcher_id,
                        error = %err,
                        "failed to wait for terminal"
                    );
                    ExitState {
                        exit_code: None,
                        signal: None,
                    }
                }
            };
            tracing::debug!(
                terminal_id = %watcher_id,
                exit_code = ?state.exit_code,
                signal = ?state.signal,
                "terminal exited"
            );
            let _ = exit_tx.send(Some(state));
        });

        tracing::info!(
            provider = %owner,
            session_id = ?params.session_id,
            terminal_id = %terminal_id,
            pid = ?pid,
            cwd = %cwd.display(),
            command = %command_line,
            "terminal created"
        );

        self.terminals.lock().await.insert(
            terminal_id.clone(),
            Arc::new(Terminal {
                owner: owner.to_string(),
                pid,
                output,
                exit: exit_rx,
                kill: std::sync::Mutex::new(Some(kill_tx)),
            }),
        );
        Ok(terminal_id)
    }

    pub async fn output(&self, terminal_id: &str) -> TerminalOutput {
        match self.get(terminal_id).await {
            Some(terminal) => terminal.snapshot(),
            None => {
                tracing::debug!(terminal_id = %terminal_id, "output for unknown terminal");
                TerminalOutput {
                    output: String::new(),
                    truncated: false,
                    exit_status: Some(ExitState::unknown_terminal()),
                }
            }
        }
    }

    /// Resolves once the terminal's process has exited.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> ExitState {
        let Some(terminal) = self.get(terminal_id).await else {
            tracing::debug!(terminal_id = %terminal_id, "wait for unknown terminal");
            return ExitState::unknown_terminal();
        };

        let mut exit = terminal.exit.clone();
        let state = match exit.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        state.unwrap_or(ExitState {
            exit_code: None,
            signal: None,
        })
    }

    pub async fn kill(&self, terminal_id: &str) {
        if let Some(terminal) = self.get(terminal_id).await {
            tracing::debug!(terminal_id = %terminal_id, pid = ?terminal.pid, "killing terminal");
            terminal.kill();
        }
    }

    pub async fn release(&self, terminal_id: &str) {
        let removed = self.terminals.lock().await.remove(terminal_id);
        if let Some(terminal) = removed {
            tracing::debug!(terminal_id = %terminal_id, "terminal released");
            terminal.kill();
        }
    }

    /// Releases every terminal created by `owner`.
    pub async fn release_owned_by(&self, owner: &str) {
        let removed = {
            let mut terminals = self.terminals.lock().await;
            let ids = terminals
                .iter()
                .filter(|(_, terminal)| terminal.owner == owner)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| terminals.remove(&id))
                .collect::<Vec<_>>()
        };
        for terminal in removed {
            terminal.kill();
        }
    }

    pub async fn shutdown(&self) {
        let removed = self
            .terminals
            .lock()
            .await
            .drain()
            .map(|(_, terminal)| terminal)
            .collect::<Vec<_>>();
        for terminal in removed {
            terminal.kill();
        }
    }

    async fn get(&self, terminal_id: &str) -> Option<Arc<Terminal>> {
        self.terminals.lock().await.get(terminal_id).cloned()
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|err| RpcError {
        code: INVALID_PARAMS,
        message: format!("invalid params: {err}"),
        data: None,
    })
}

async fn pump_output<R: AsyncRead + Unpin>(
    mut reader: R,
    output: Arc<std::sync::Mutex<OutputBuffer>>,
) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => output
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .append(&chunk[..read]),
        }
    }
}

fn resolve_cwd(root: &Path, cwd: PathBuf) -> PathBuf {
    if cwd.is_absolute() {
        cwd
    } else {
        root.join(cwd)
    }
}

fn shell_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(command.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

#[cfg(unix)]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(windows)]
fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(unix)]
fn exit_state(status: ExitStatus) -> ExitState {
    use std::os::unix::process::ExitStatusExt;

    ExitState {
        exit_code: status.code(),
        signal: status.signal().map(signal_name),
    }
}

#[cfg(not(unix))]
fn exit_state(status: ExitStatus) -> ExitState {
    ExitState {
        exit_code: status.code(),
        signal: None,
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn proxy() -> TerminalProxy {
        TerminalProxy::new(std::env::temp_dir())
    }

    fn params(command: &str) -> CreateTerminalParams {
        CreateTerminalParams {
            session_id: Some("s1".to_string()),
            command: command.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            output_byte_limit: None,
        }
    }

    #[tokio::test]
    async fn echo_hi_round_trip_over_json() {
        let proxy = proxy();
        let created = proxy
            .handle_request(
                "mock",
                "terminal/create",
                json!({ "sessionId": "s1", "command": "echo hi" }),
            )
            .await
            .expect("create");
        let terminal_id = created["terminalId"].as_str().expect("id").to_string();

        let exited = proxy
            .handle_request("mock", "terminal/wait_for_exit", json!({ "terminalId": terminal_id }))
            .await
            .expect("wait");
        assert_eq!(exited, json!({ "exitCode": 0, "signal": null }));

        let output = proxy
            .handle_request("mock", "terminal/output", json!({ "terminalId": terminal_id }))
            .await
            .expect("output");
        assert_eq!(output["output"], "hi\n");
        assert_eq!(output["truncated"], false);
        assert_eq!(output["exitStatus"]["exitCode"], 0);

        proxy
            .handle_request("mock", "terminal/release", json!({ "terminalId": terminal_id }))
            .await
            .expect("release");
        assert!(proxy.is_empty().await);
    }

    #[tokio::test]
    async fn args_are_quoted_for_the_shell() {
        let proxy = proxy();
        let mut create = params("echo");
        create.args = vec!["it's".to_string(), "a b".to_string()];
        let id = proxy.create("mock", create).await.expect("create");
        proxy.wait_for_exit(&id).await;
        assert_eq!(proxy.output(&id).await.output, "it's a b\n");
    }

    #[tokio::test]
    async fn wait_before_exit_blocks_until_the_process_ends() {
        let proxy = Arc::new(proxy());
        let id = proxy
            .create("mock", params("sleep 0.3; echo done"))
            .await
            .expect("create");

        let started = Instant::now();
        let waiter = {
            let proxy = proxy.clone();
            let id = id.clone();
            tokio::spawn(async move { proxy.wait_for_exit(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        assert_eq!(proxy.output(&id).await.exit_status, None);

        let state = waiter.await.expect("join");
        assert_eq!(state.exit_code, Some(0));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(proxy.output(&id).await.output, "done\n");
    }

    #[tokio::test]
    async fn wait_after_exit_replies_immediately_with_known_code() {
        let proxy = proxy();
        let id = proxy.create("mock", params("exit 3")).await.expect("create");
        assert_eq!(proxy.wait_for_exit(&id).await.exit_code, Some(3));

        let again = tokio::time::timeout(Duration::from_millis(50), proxy.wait_for_exit(&id))
            .await
            .expect("already exited");
        assert_eq!(again.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stdout_and_stderr_share_one_buffer() {
        let proxy = proxy();
        let id = proxy
            .create("mock", params("echo out; sleep 0.05; echo err 1>&2"))
            .await
            .expect("create");
        proxy.wait_for_exit(&id).await;
        assert_eq!(proxy.output(&id).await.output, "out\nerr\n");
    }

    #[tokio::test]
    async fn env_and_byte_limit_are_honored() {
        let proxy = proxy();
        let mut create = params("printf \"$DIGITS\"");
        create.env = vec![EnvVariable {
            name: "DIGITS".to_string(),
            value: "0123456789".to_string(),
        }];
        create.output_byte_limit = Some(4);
        let id = proxy.create("mock", create).await.expect("create");
        proxy.wait_for_exit(&id).await;

        let output = proxy.output(&id).await;
        assert_eq!(output.output, "6789");
        assert!(output.truncated);
    }

    #[tokio::test]
    async fn unknown_terminals_get_safe_defaults() {
        let proxy = proxy();
        let output = proxy.output("term-404").await;
        assert_eq!(output.output, "");
        assert_eq!(output.exit_status, Some(ExitState::unknown_terminal()));
        assert_eq!(
            proxy.wait_for_exit("term-404").await,
            ExitState {
                exit_code: Some(0),
                signal: None
            }
        );
        proxy.release("term-404").await;
        let killed = proxy
            .handle_request("mock", "terminal/kill", json!({ "terminalId": "term-404" }))
            .await
            .expect("kill");
        assert_eq!(killed, Value::Null);
    }

    #[tokio::test]
    async fn kill_keeps_the_terminal_and_reports_the_signal() {
        let proxy = proxy();
        let id = proxy.create("mock", params("sleep 30")).await.expect("create");
        proxy.kill(&id).await;

        let state = tokio::time::timeout(Duration::from_secs(5), proxy.wait_for_exit(&id))
            .await
            .expect("killed");
        assert_eq!(state.exit_code, None);
        assert_eq!(state.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(proxy.len().await, 1);
    }

    #[tokio::test]
    async fn release_discards_and_ids_are_not_reused() {
        let proxy = proxy();
        let first = proxy.create("a", params("sleep 30")).await.expect("create");
        let second = proxy.create("b", params("sleep 30")).await.expect("create");
        assert_ne!(first, second);

        proxy.release_owned_by("a").await;
        assert_eq!(proxy.len().await, 1);
        assert_eq!(proxy.output(&first).await.output, "");

        proxy.release(&second).await;
        assert!(proxy.is_empty().await);

        let third = proxy.create("a", params("true")).await.expect("create");
        assert_ne!(third, first);
        assert_ne!(third, second);
        proxy.shutdown().await;
        assert!(proxy.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_params_are_rejected() {
        let proxy = proxy();
        let err = proxy
            .handle_request("mock", "terminal/create", json!({ "args": [] }))
            .await
            .expect_err("missing command");
        assert_eq!(err.code, INVALID_PARAMS);
    }
}
