//! Server process lifecycle management.
//!
//! Spawns the tool server as a child process, performs the MCP handshake,
//! and tears the process down in three escalating steps: close stdin and
//! wait, SIGTERM and wait, then SIGKILL.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::{error_codes, McpError};
use super::transport::{extract_result, StdioTransport};
use super::types::{
    ClientConfig, ConnectionInfo, InitializeResult, JsonRpcResponse, ServerConfig, ServerInfo,
    ToolDescriptor, ToolsListResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Cap on stderr text appended to an error message.
const STDERR_SUFFIX_CHARS: usize = 2000;

// ─── Teardown ────────────────────────────────────────────────────────────────

/// Grace periods for the escalating shutdown.
#[derive(Debug, Clone, Copy)]
pub struct TeardownTimeouts {
    pub exit: Duration,
    pub terminate: Duration,
}

impl From<&ClientConfig> for TeardownTimeouts {
    fn from(config: &ClientConfig) -> Self {
        Self {
            exit: config.exit_timeout(),
            terminate: config.terminate_timeout(),
        }
    }
}

/// Which step of the teardown ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPath {
    /// Exited after stdin closed.
    Graceful,
    /// Exited after SIGTERM.
    Terminated,
    /// Force killed.
    Killed,
    /// Already reaped, or there was no process.
    AlreadyGone,
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// One spawned tool server with a completed handshake.
pub struct Connection {
    generation: u64,
    process: Mutex<Option<Child>>,
    pid: Option<u32>,
    transport: StdioTransport,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    server_info: ServerInfo,
    tools: Vec<ToolDescriptor>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Spawn the server and complete `initialize` → `notifications/initialized`
    /// → `tools/list` within the connection timeout.
    ///
    /// Any failure tears the half-open process down and returns a permanent
    /// error carrying the server's recent stderr.
    pub async fn open(
        server: &ServerConfig,
        client: &ClientConfig,
        generation: u64,
    ) -> Result<Connection, McpError> {
        let mut conn = spawn(server, generation)?;
        let timeouts = TeardownTimeouts::from(client);

        let outcome =
            tokio::time::timeout(client.connection_timeout(), handshake(&conn, client)).await;
        let failure = match outcome {
            Ok(Ok((server_info, tools))) => {
                conn.server_info = server_info;
                conn.tools = tools;
                return Ok(conn);
            }
            Ok(Err(e)) => e.message,
            Err(_) => format!(
                "initialization timed out after {}ms",
                client.connection_timeout_ms
            ),
        };

        conn.shutdown(timeouts).await;
        let stderr_ctx = conn.stderr_text();
        if !stderr_ctx.is_empty() {
            tracing::warn!(
                command = %server.command,
                stderr = %stderr_ctx,
                "server stderr captured on failure"
            );
        }

        Err(McpError::permanent(
            error_codes::INITIALIZATION_ERROR,
            format!("{failure}{}", format_stderr_suffix(&stderr_ctx)),
        )
        .with_data("command", server.command.clone()))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Tools advertised during the handshake.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// True until stdout closes or the connection is shut down.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            generation: self.generation,
            pid: self.pid,
            connected_at: self.connected_at,
            server_name: self.server_info.name.clone(),
            server_version: self.server_info.version.clone(),
            tool_count: self.tools.len(),
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        self.transport.request(method, params, timeout).await
    }

    /// Stop the reader, fail in-flight requests and end the child process.
    ///
    /// Idempotent. The final kill is awaited without a bound.
    pub async fn shutdown(&self, timeouts: TeardownTimeouts) -> ExitPath {
        self.transport.close().await;

        let stderr_task = lock(&self.stderr_task).take();

        let child = self.process.lock().await.take();
        let path = match child {
            Some(mut child) => terminate_child(&mut child, self.pid, timeouts).await,
            None => ExitPath::AlreadyGone,
        };

        // Stderr reaches EOF once the process is gone; keep its last lines.
        if let Some(mut handle) = stderr_task {
            if tokio::time::timeout(Duration::from_millis(200), &mut handle)
                .await
                .is_err()
            {
                tracing::debug!(pid = ?self.pid, "stderr drain still open after exit");
                handle.abort();
            }
        }

        path
    }

    /// Recent stderr output joined into one string.
    pub fn stderr_text(&self) -> String {
        let tail = lock(&self.stderr_tail);
        let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_SUFFIX_CHARS {
            let cut = text
                .char_indices()
                .nth(STDERR_SUFFIX_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        text
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.stderr_task).take() {
            handle.abort();
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

fn spawn(config: &ServerConfig, generation: u64) -> Result<Connection, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let spawn_failed = |reason: String| {
        McpError::permanent(
            error_codes::CONNECTION_ERROR,
            format!("failed to start '{}': {reason}", config.command),
        )
        .with_data("command", config.command.clone())
    };

    let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()).with_cause(e))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let pid = child.id();

    let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(drain_stderr(stderr, pid, Arc::clone(&stderr_tail))));

    tracing::info!(command = %config.command, ?pid, generation, "spawned tool server");

    let label = format!("{}#{generation}", config.command);
    Ok(Connection {
        generation,
        process: Mutex::new(Some(child)),
        pid,
        transport: StdioTransport::start(&label, stdin, stdout),
        stderr_tail,
        stderr_task: StdMutex::new(stderr_task),
        server_info: ServerInfo::default(),
        tools: Vec::new(),
        connected_at: Utc::now(),
    })
}

/// Forward server stderr to tracing and keep the last lines for diagnostics.
async fn drain_stderr(
    stderr: ChildStderr,
    pid: Option<u32>,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(?pid, line = %line, "server stderr");
        let mut buf = lock(&tail);
        if buf.len() == STDERR_TAIL_LINES {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

async fn handshake(
    conn: &Connection,
    client: &ClientConfig,
) -> Result<(ServerInfo, Vec<ToolDescriptor>), McpError> {
    let timeout = client.connection_timeout();
    let params = json!({
        "protocolVersion": client.protocol_version,
        "capabilities": { "tools": { "listChanged": true } },
        "clientInfo": {
            "name": client.client_name,
            "version": client.client_version,
        },
    });

    let response = conn.transport.request("initialize", Some(params), timeout).await?;
    let result = extract_result(response)?;
    let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
        McpError::permanent(
            error_codes::INITIALIZATION_ERROR,
            format!("failed to parse initialize response: {e}"),
        )
    })?;

    conn.transport
        .notify("notifications/initialized", None)
        .await?;

    let response = conn
        .transport
        .request("tools/list", Some(json!({})), timeout)
        .await?;
    let result = extract_result(response)?;
    let listed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
        McpError::permanent(
            error_codes::INITIALIZATION_ERROR,
            format!("failed to parse tools/list response: {e}"),
        )
    })?;

    let server_info = init.server_info.unwrap_or_default();
    tracing::info!(
        server = ?server_info.name,
        protocol = ?init.protocol_version,
        tools = listed.tools.len(),
        "handshake complete"
    );

    Ok((server_info, listed.tools))
}

// ─── Termination ─────────────────────────────────────────────────────────────

async fn terminate_child(child: &mut Child, pid: Option<u32>, timeouts: TeardownTimeouts) -> ExitPath {
    // stdin was closed by the transport; give the server a chance to exit.
    match tokio::time::timeout(timeouts.exit, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(?pid, %status, "tool server exited");
            return ExitPath::Graceful;
        }
        Ok(Err(e)) => {
            tracing::warn!(?pid, error = %e, "failed to wait for tool server");
            return ExitPath::AlreadyGone;
        }
        Err(_) => {}
    }

    tracing::warn!(
        ?pid,
        waited_ms = timeouts.exit.as_millis() as u64,
        "tool server did not exit, sending SIGTERM"
    );
    send_terminate(child);

    match tokio::time::timeout(timeouts.terminate, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(?pid, %status, "tool server terminated");
            return ExitPath::Terminated;
        }
        Ok(Err(e)) => {
            tracing::warn!(?pid, error = %e, "failed to wait for tool server");
            return ExitPath::AlreadyGone;
        }
        Err(_) => {}
    }

    tracing::error!(?pid, "tool server ignored SIGTERM, killing");
    if let Err(e) = child.kill().await {
        tracing::warn!(?pid, error = %e, "failed to kill tool server");
    }
    ExitPath::Killed
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // `id()` is None once the child has been reaped.
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::errors::Severity;
    use std::collections::HashMap;
    use std::time::Instant;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    fn quick_client() -> ClientConfig {
        ClientConfig {
            connection_timeout_ms: 300,
            exit_timeout_ms: 200,
            terminate_timeout_ms: 200,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[tokio::test]
    async fn test_missing_command_is_permanent() {
        let config = ServerConfig {
            command: "/nonexistent/navsim-server".into(),
            ..ServerConfig::default()
        };
        let err = match Connection::open(&config, &quick_client(), 1).await {
            Ok(_) => panic!("spawn should fail"),
            Err(e) => e,
        };
        assert_eq!(err.severity, Severity::Permanent);
        assert_eq!(err.code, error_codes::CONNECTION_ERROR);
    }

    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let config = sh("echo 'module not found' >&2; exit 3");
        let err = match Connection::open(&config, &quick_client(), 1).await {
            Ok(_) => panic!("handshake should fail"),
            Err(e) => e,
        };
        assert_eq!(err.severity, Severity::Permanent);
        assert_eq!(err.code, error_codes::INITIALIZATION_ERROR);
        assert!(err.message.contains("module not found"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        // Reads stdin forever but never answers.
        let config = sh("cat > /dev/null");
        let started = Instant::now();
        let err = match Connection::open(&config, &quick_client(), 1).await {
            Ok(_) => panic!("handshake should time out"),
            Err(e) => e,
        };
        assert_eq!(err.code, error_codes::INITIALIZATION_ERROR);
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.05; done"])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let timeouts = TeardownTimeouts {
            exit: Duration::from_millis(100),
            terminate: Duration::from_millis(100),
        };
        let started = Instant::now();
        let path = terminate_child(&mut child, pid, timeouts).await;

        assert_eq!(path, ExitPath::Killed);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_uses_sigterm_when_honoured() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id();

        let timeouts = TeardownTimeouts {
            exit: Duration::from_millis(50),
            terminate: Duration::from_secs(2),
        };
        let path = terminate_child(&mut child, pid, timeouts).await;
        assert_eq!(path, ExitPath::Terminated);
    }
}
