//! Stdio JSON-RPC server exposing the simulated robot as MCP tools.
//!
//! Every request is handled on its own task so long-running goals do not
//! block other calls; responses are funnelled through a single writer task
//! and may therefore arrive out of order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::robot::{GoalError, Pose, Robot};
use crate::mcp_client::codec::{decode_line, encode_line, IncomingMessage};
use crate::mcp_client::errors::{error_codes, McpError};
use crate::mcp_client::types::{
    ContentItem, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDescriptor,
};

const SERVER_NAME: &str = "navsim";
const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// How long queued responses may take to drain after stdin closes.
const FLUSH_ON_EXIT: Duration = Duration::from_millis(200);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Runtime switches, mostly for fault injection in tests.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Linear speed (m/s).
    pub speed: f64,
    /// Answer only the first `tools/list` (the handshake); ignore the rest.
    pub stall_probes: bool,
    /// Keep running after stdin closes and ignore SIGTERM.
    pub ignore_termination: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            speed: 0.5,
            stall_probes: false,
            ignore_termination: false,
        }
    }
}

impl SimOptions {
    /// Read `NAVSIM_SPEED`, `NAVSIM_STALL_PROBES`, `NAVSIM_STALL_PROBES_ONCE`
    /// and `NAVSIM_IGNORE_TERMINATION`.
    ///
    /// `NAVSIM_STALL_PROBES_ONCE=<path>` stalls only the first process to
    /// claim the marker file, so a restarted server behaves.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut options = SimOptions::default();

        if let Ok(raw) = std::env::var("NAVSIM_SPEED") {
            options.speed = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid NAVSIM_SPEED '{raw}': {e}"))?;
            if options.speed <= 0.0 {
                anyhow::bail!("NAVSIM_SPEED must be positive, got {raw}");
            }
        }

        options.stall_probes = env_flag("NAVSIM_STALL_PROBES");
        if let Some(marker) = std::env::var_os("NAVSIM_STALL_PROBES_ONCE") {
            options.stall_probes |= claim_marker(&PathBuf::from(marker))?;
        }
        options.ignore_termination = env_flag("NAVSIM_IGNORE_TERMINATION");

        Ok(options)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Create `path` exclusively. True if this process created it.
fn claim_marker(path: &std::path::Path) -> anyhow::Result<bool> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(anyhow::anyhow!("failed to create marker {}: {e}", path.display())),
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Serve JSON-RPC over `reader` / `writer` until the reader closes.
pub async fn serve<R, W>(reader: R, writer: W, options: SimOptions) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    if options.ignore_termination {
        ignore_sigterm()?;
    }

    let robot = Robot::new(options.speed);
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let list_calls = Arc::new(AtomicU32::new(0));

    tracing::info!(
        speed = options.speed,
        stall_probes = options.stall_probes,
        ignore_termination = options.ignore_termination,
        "navsim server ready"
    );

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match decode_line(&line) {
            Ok(IncomingMessage::Request(req)) => {
                let ctx = RequestContext {
                    robot: robot.clone(),
                    tx: tx.clone(),
                    options: options.clone(),
                    list_calls: Arc::clone(&list_calls),
                };
                tokio::spawn(ctx.handle(req));
            }
            Ok(IncomingMessage::Notification(n)) => {
                tracing::debug!(method = %n.method, "notification");
            }
            Ok(IncomingMessage::Response(_)) => {
                tracing::debug!("ignoring response from client");
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                let err = rpc_error(error_codes::PARSE_ERROR, format!("Parse error: {e}"));
                send(&tx, &JsonRpcResponse::failure(None, err));
            }
        }
    }

    tracing::info!("stdin closed");
    if options.ignore_termination {
        tracing::warn!("ignoring stdin EOF");
        std::future::pending::<()>().await;
    }

    // Goals still driving hold senders; flush what is queued and leave.
    drop(tx);
    let _ = tokio::time::timeout(FLUSH_ON_EXIT, writer_task).await;
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            tracing::warn!("ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> anyhow::Result<()> {
    Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write response");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "failed to flush response");
            return;
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match encode_line(response) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => tracing::error!(error = %e, "failed to encode response"),
    }
}

// ─── Request Handling ────────────────────────────────────────────────────────

struct RequestContext {
    robot: Robot,
    tx: mpsc::UnboundedSender<String>,
    options: SimOptions,
    list_calls: Arc<AtomicU32>,
}

impl RequestContext {
    async fn handle(self, req: JsonRpcRequest) {
        let params = req.params.unwrap_or(Value::Null);
        let outcome = match req.method.as_str() {
            "initialize" => Ok(initialize_result(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let n = self.list_calls.fetch_add(1, Ordering::SeqCst);
                if self.options.stall_probes && n > 0 {
                    tracing::warn!(id = req.id, "stalling tools/list");
                    return;
                }
                Ok(json!({ "tools": tool_descriptors() }))
            }
            "tools/call" => self.call_tool(params).await,
            other => Err(rpc_error(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        };

        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(req.id, result),
            Err(err) => JsonRpcResponse::failure(Some(req.id), err),
        };
        send(&self.tx, &response);
    }

    async fn call_tool(&self, params: Value) -> Result<Value, JsonRpcError> {
        #[derive(Deserialize)]
        struct CallParams {
            name: String,
            #[serde(default)]
            arguments: Value,
        }

        let call: CallParams = parse_args(params)?;
        tracing::info!(tool = %call.name, "tool call");
        let args = if call.arguments.is_null() {
            json!({})
        } else {
            call.arguments
        };

        let robot = &self.robot;
        match call.name.as_str() {
            "navigate_to_pose" => {
                let a: PoseGoal = parse_args(args)?;
                let target = checked_pose(a.x, a.y, a.yaw)?;
                let outcome = robot
                    .navigate_to(target, a.wait)
                    .await
                    .map_err(goal_rejection)?;
                Ok(text_result(json!(outcome), false))
            }
            "navigate_to_location" => {
                let a: LocationGoal = parse_args(args)?;
                match robot.navigate_to_location(&a.location, a.wait).await {
                    Ok(outcome) => {
                        let mut body = json!(outcome);
                        body["location"] = json!(a.location);
                        Ok(text_result(body, false))
                    }
                    Err(GoalError::UnknownLocation { name, known }) => Ok(text_result(
                        json!({
                            "success": false,
                            "error": format!("Unknown location: {name}"),
                            "available_locations": known,
                        }),
                        true,
                    )),
                    Err(e) => Err(goal_rejection(e)),
                }
            }
            "navigate_through_waypoints" => {
                let a: WaypointGoal = parse_args(args)?;
                if a.waypoints.is_empty() {
                    return Err(rpc_error(error_codes::INVALID_PARAMS, "waypoints must not be empty"));
                }
                for wp in &a.waypoints {
                    checked_pose(wp.x, wp.y, wp.yaw)?;
                }
                let report = robot.navigate_waypoints(&a.waypoints, a.keep_going).await;
                Ok(text_result(json!(report), false))
            }
            "get_navigation_status" => Ok(text_result(robot.status().await, false)),
            "cancel_navigation" => {
                let canceled = robot.cancel().await;
                Ok(text_result(
                    json!({
                        "success": canceled,
                        "message": if canceled {
                            "Navigation canceled"
                        } else {
                            "No active navigation to cancel"
                        },
                    }),
                    false,
                ))
            }
            "set_initial_pose" => {
                let a: InitialPose = parse_args(args)?;
                let pose = checked_pose(a.x, a.y, a.yaw)?;
                robot.set_initial_pose(pose).await;
                Ok(text_result(json!({ "success": true, "pose": pose.to_json() }), false))
            }
            "get_semantic_locations" => {
                let locations: serde_json::Map<String, Value> = robot
                    .locations()
                    .await
                    .into_iter()
                    .map(|(name, pose)| (name, pose.to_json()))
                    .collect();
                Ok(text_result(json!({ "locations": locations }), false))
            }
            "add_semantic_location" => {
                let a: NewLocation = parse_args(args)?;
                if a.name.trim().is_empty() {
                    return Err(rpc_error(error_codes::INVALID_PARAMS, "name must not be empty"));
                }
                let pose = checked_pose(a.x, a.y, a.yaw)?;
                robot.add_location(&a.name, pose).await;
                Ok(text_result(
                    json!({ "success": true, "name": a.name, "pose": pose.to_json() }),
                    false,
                ))
            }
            other => Err(rpc_error(
                error_codes::TOOL_NOT_FOUND,
                format!("Unknown tool: {other}"),
            )),
        }
    }
}

// ─── Tool Arguments ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct PoseGoal {
    x: f64,
    y: f64,
    #[serde(default)]
    yaw: f64,
    #[serde(default = "default_true")]
    wait: bool,
}

#[derive(Deserialize)]
struct LocationGoal {
    location: String,
    #[serde(default = "default_true")]
    wait: bool,
}

#[derive(Deserialize)]
struct WaypointGoal {
    waypoints: Vec<Pose>,
    #[serde(default, rename = "loop")]
    keep_going: bool,
}

#[derive(Deserialize)]
struct InitialPose {
    x: f64,
    y: f64,
    yaw: f64,
}

#[derive(Deserialize)]
struct NewLocation {
    name: String,
    x: f64,
    y: f64,
    #[serde(default)]
    yaw: f64,
}

fn parse_args<T: DeserializeOwned>(value: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(value)
        .map_err(|e| rpc_error(error_codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn checked_pose(x: f64, y: f64, yaw: f64) -> Result<Pose, JsonRpcError> {
    let pose = Pose::new(x, y, yaw);
    if !pose.is_finite() {
        return Err(rpc_error(
            error_codes::INVALID_PARAMS,
            "pose coordinates must be finite",
        ));
    }
    Ok(pose)
}

/// A refused goal is a bad argument, not a tool failure.
fn goal_rejection(err: GoalError) -> JsonRpcError {
    rpc_error(error_codes::INVALID_PARAMS, err.to_string())
}

/// Every rejection the simulator sends is the caller's to fix.
fn rpc_error(code: i32, message: impl Into<String>) -> JsonRpcError {
    McpError::recoverable(code, message).to_json_rpc_error()
}

fn text_result(body: Value, is_error: bool) -> Value {
    let mut result = json!({ "content": [ContentItem::text(body.to_string())] });
    if is_error {
        result["isError"] = json!(true);
    }
    result
}

fn initialize_result(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
    })
}

// ─── Tool Catalogue ──────────────────────────────────────────────────────────

pub fn tool_descriptors() -> Vec<ToolDescriptor> {
    let tool = |name: &str, description: &str, schema: Value| ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
    };
    let empty = || json!({ "type": "object", "properties": {} });

    vec![
        tool(
            "navigate_to_pose",
            "Navigate robot to a specified pose with coordinates (x, y) and orientation (yaw)",
            json!({
                "type": "object",
                "properties": {
                    "x": { "type": "number", "description": "Target X coordinate in meters" },
                    "y": { "type": "number", "description": "Target Y coordinate in meters" },
                    "yaw": { "type": "number", "description": "Target orientation in radians (default 0.0)" },
                    "wait": { "type": "boolean", "description": "Wait for navigation to complete (default true)" }
                },
                "required": ["x", "y"]
            }),
        ),
        tool(
            "navigate_to_location",
            "Navigate to a semantic location by name",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string", "description": "Location name" },
                    "wait": { "type": "boolean", "description": "Wait for navigation to complete" }
                },
                "required": ["location"]
            }),
        ),
        tool(
            "navigate_through_waypoints",
            "Navigate through a sequence of waypoints",
            json!({
                "type": "object",
                "properties": {
                    "waypoints": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "x": { "type": "number" },
                                "y": { "type": "number" },
                                "yaw": { "type": "number" }
                            },
                            "required": ["x", "y"]
                        }
                    },
                    "loop": { "type": "boolean", "description": "Continue past failed waypoints" }
                },
                "required": ["waypoints"]
            }),
        ),
        tool(
            "get_navigation_status",
            "Get current navigation status, including position, target, and progress",
            empty(),
        ),
        tool("cancel_navigation", "Cancel the current navigation task", empty()),
        tool(
            "set_initial_pose",
            "Set robot initial pose for localization",
            json!({
                "type": "object",
                "properties": {
                    "x": { "type": "number" },
                    "y": { "type": "number" },
                    "yaw": { "type": "number" }
                },
                "required": ["x", "y", "yaw"]
            }),
        ),
        tool("get_semantic_locations", "Get all available semantic locations", empty()),
        tool(
            "add_semantic_location",
            "Add a new semantic location",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "x": { "type": "number" },
                    "y": { "type": "number" },
                    "yaw": { "type": "number" }
                },
                "required": ["name", "x", "y"]
            }),
        ),
    ]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::CallToolResult;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    struct Harness {
        to_server: DuplexStream,
        from_server: Lines<BufReader<DuplexStream>>,
        next_id: u64,
    }

    impl Harness {
        fn start(options: SimOptions) -> Self {
            let (to_server, server_in) = duplex(64 * 1024);
            let (server_out, from_server) = duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = serve(server_in, server_out, options).await;
            });
            Self {
                to_server,
                from_server: BufReader::new(from_server).lines(),
                next_id: 1,
            }
        }

        async fn send(&mut self, method: &str, params: Value) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            let line = encode_line(&JsonRpcRequest::new(id, method, Some(params))).unwrap();
            self.to_server.write_all(line.as_bytes()).await.unwrap();
            id
        }

        async fn recv(&mut self) -> JsonRpcResponse {
            let line = self.from_server.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn call(&mut self, method: &str, params: Value) -> JsonRpcResponse {
            let id = self.send(method, params).await;
            let resp = self.recv().await;
            assert_eq!(resp.id, Some(id));
            resp
        }

        async fn call_tool(&mut self, name: &str, arguments: Value) -> (Value, bool) {
            let resp = self
                .call("tools/call", json!({ "name": name, "arguments": arguments }))
                .await;
            let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
            let body = serde_json::from_str(&result.joined_text().unwrap()).unwrap();
            (body, result.is_error)
        }
    }

    fn fast() -> SimOptions {
        SimOptions {
            speed: 1_000.0,
            ..SimOptions::default()
        }
    }

    #[test]
    fn test_catalogue_lists_eight_tools() {
        let names: Vec<_> = tool_descriptors().into_iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 8);
        assert!(names.contains(&"navigate_to_location".to_string()));
        assert!(!names.iter().any(|n| n == "natural_language_navigate"));
    }

    #[test]
    fn test_claim_marker_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stalled");
        assert!(claim_marker(&marker).unwrap());
        assert!(!claim_marker(&marker).unwrap());
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let mut h = Harness::start(fast());
        let resp = h
            .call("initialize", json!({ "protocolVersion": "2025-03-26" }))
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "navsim");
    }

    #[tokio::test]
    async fn test_navigate_to_kitchen() {
        let mut h = Harness::start(fast());
        let (body, is_error) = h
            .call_tool("navigate_to_location", json!({ "location": "kitchen" }))
            .await;
        assert!(!is_error);
        assert_eq!(body["location"], "kitchen");
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_location_is_tool_error() {
        let mut h = Harness::start(fast());
        let (body, is_error) = h
            .call_tool("navigate_to_location", json!({ "location": "garage" }))
            .await;
        assert!(is_error);
        assert_eq!(body["error"], "Unknown location: garage");
    }

    #[tokio::test]
    async fn test_error_codes() {
        let mut h = Harness::start(fast());

        let resp = h.call("tools/call", json!({ "name": "fly", "arguments": {} })).await;
        assert_eq!(resp.error.unwrap().code, error_codes::TOOL_NOT_FOUND);

        let resp = h
            .call("tools/call", json!({ "name": "navigate_to_pose", "arguments": { "x": 1.0 } }))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let resp = h.call("resources/list", json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_goal_is_rejected_and_server_keeps_answering() {
        let mut h = Harness::start(fast());

        let resp = h
            .call("tools/call", json!({ "name": "navigate_to_pose", "arguments": { "x": 1e300, "y": 0.0 } }))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
        assert!(err.message.contains("out of reach"), "{}", err.message);

        h.call_tool("set_initial_pose", json!({ "x": -1e300, "y": 0.0, "yaw": 0.0 }))
            .await;
        let resp = h
            .call("tools/call", json!({ "name": "navigate_to_location", "arguments": { "location": "kitchen" } }))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);

        let (status, _) = h.call_tool("get_navigation_status", json!({})).await;
        assert_eq!(status["status"], "IDLE");
    }

    #[test]
    fn test_checked_pose_rejects_non_finite() {
        assert!(checked_pose(1.0, 2.0, 0.0).is_ok());
        let err = checked_pose(f64::NAN, 0.0, 0.0).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
        assert!(checked_pose(0.0, f64::INFINITY, 0.0).is_err());
    }

    #[tokio::test]
    async fn test_garbage_line_gets_parse_error() {
        let mut h = Harness::start(fast());
        h.to_server.write_all(b"{oops\n").await.unwrap();
        let resp = h.recv().await;
        assert!(resp.id.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_stall_probes_answers_only_handshake_list() {
        let mut h = Harness::start(SimOptions {
            stall_probes: true,
            ..fast()
        });
        let resp = h.call("tools/list", json!({})).await;
        assert_eq!(resp.result.unwrap()["tools"].as_array().unwrap().len(), 8);

        // The probe goes unanswered; a later ping still does.
        h.send("tools/list", json!({})).await;
        let ping_id = h.send("ping", json!({})).await;
        let resp = h.recv().await;
        assert_eq!(resp.id, Some(ping_id));
    }

    #[tokio::test]
    async fn test_slow_goal_does_not_block_other_requests() {
        let mut h = Harness::start(SimOptions {
            speed: 0.1,
            ..SimOptions::default()
        });
        let slow = h
            .send(
                "tools/call",
                json!({ "name": "navigate_to_pose", "arguments": { "x": 100.0, "y": 0.0 } }),
            )
            .await;
        let status = h
            .send("tools/call", json!({ "name": "get_navigation_status", "arguments": {} }))
            .await;

        let resp = h.recv().await;
        assert_eq!(resp.id, Some(status));
        assert_ne!(resp.id, Some(slow));
    }
}
