//! Tool-call front end: maps `(tool, arguments)` onto component operations
//! and wraps every outcome in the `{success, ...}` envelope.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::automation::{AutomationEngine, CurveKind};
use crate::bridge::{BlockingBridge, in_flight};
use crate::engine::{ParameterId, PluginId};
use crate::error::{ControlError, ControlResult};
use crate::logger::RequestTelemetry;
use crate::plugins::{PluginCatalog, PluginControl};
use crate::routing::{PortRef, RoutingGraph};
use crate::session::SessionStateStore;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Deserialize)]
struct PluginArgs {
    plugin_id: PluginId,
}

#[derive(Deserialize)]
struct ControlArgs {
    plugin_id: PluginId,
    #[serde(flatten)]
    control: PluginControl,
}

#[derive(Deserialize)]
struct ParameterArgs {
    plugin_id: PluginId,
    parameter_id: ParameterId,
}

#[derive(Deserialize)]
struct SetParameterArgs {
    plugin_id: PluginId,
    parameter_id: ParameterId,
    value: f64,
}

#[derive(Deserialize)]
struct AutomateArgs {
    plugin_id: PluginId,
    parameter_id: ParameterId,
    automation_type: String,
    duration_ms: u64,
    #[serde(default)]
    values: Option<Vec<f64>>,
}

#[derive(Deserialize)]
struct AutomationIdArgs {
    automation_id: Uuid,
}

#[derive(Deserialize)]
struct MorphArgs {
    plugin_id: PluginId,
    targets: BTreeMap<ParameterId, f64>,
    duration_ms: u64,
}

fn default_amount() -> f64 {
    0.5
}

#[derive(Deserialize)]
struct RandomizeArgs {
    plugin_id: PluginId,
    #[serde(default = "default_amount")]
    amount: f64,
    #[serde(default)]
    exclude: Vec<ParameterId>,
}

#[derive(Deserialize)]
struct RecordArgs {
    plugin_id: PluginId,
    #[serde(default)]
    parameter_ids: Option<Vec<ParameterId>>,
    duration_ms: u64,
}

#[derive(Deserialize)]
struct RecordingIdArgs {
    recording_id: Uuid,
}

fn unity_gain() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct ConnectArgs {
    source_id: PluginId,
    #[serde(default)]
    source_port: u32,
    destination_id: PluginId,
    #[serde(default)]
    destination_port: u32,
    #[serde(default = "unity_gain")]
    gain: f64,
}

#[derive(Deserialize)]
struct ConnectionIdArgs {
    connection_id: Uuid,
}

#[derive(Deserialize)]
struct GainArgs {
    connection_id: Uuid,
    gain: f64,
}

#[derive(Deserialize)]
struct FeedbackArgs {
    #[serde(default)]
    sensitivity: Option<f64>,
}

#[derive(Deserialize)]
struct PathArgs {
    path: PathBuf,
}

#[derive(Deserialize)]
struct OptionalPathArgs {
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct SnapshotArgs {
    name: String,
    #[serde(default)]
    session_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct SnapshotIdArgs {
    snapshot_id: Uuid,
}

fn args<T: DeserializeOwned>(arguments: Value) -> ControlResult<T> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|e| ControlError::invalid(e.to_string()))
}

fn to_json<T: Serialize>(value: T) -> ControlResult<Value> {
    serde_json::to_value(value).map_err(|e| ControlError::OperationFailure {
        description: "serialize response".into(),
        message: e.to_string(),
    })
}

/// Build the response envelope for one tool outcome.
pub fn envelope(result: ControlResult<Value>) -> Value {
    match result {
        Ok(Value::Object(mut body)) => {
            body.insert("success".into(), Value::Bool(true));
            Value::Object(body)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(err) => {
            let mut body = json!({
                "success": false,
                "error": err.to_string(),
                "error_kind": err.kind(),
            });
            if let ControlError::PartialFailure { warnings } = &err {
                body["warnings"] = json!(warnings);
            }
            body
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolRouter {
    catalog: PluginCatalog,
    bridge: BlockingBridge,
    automation: AutomationEngine,
    routing: RoutingGraph,
    sessions: SessionStateStore,
    telemetry: RequestTelemetry,
}

impl ToolRouter {
    pub fn new(
        catalog: PluginCatalog,
        bridge: BlockingBridge,
        automation: AutomationEngine,
        routing: RoutingGraph,
        sessions: SessionStateStore,
    ) -> Self {
        Self {
            catalog,
            bridge,
            automation,
            routing,
            sessions,
            telemetry: RequestTelemetry::new(),
        }
    }

    pub async fn handle(&self, tool: &str, arguments: Value) -> Value {
        let result = self
            .telemetry
            .instrument_request(tool, || self.dispatch(tool, arguments))
            .await;
        envelope(result)
    }

    pub async fn dispatch(&self, tool: &str, arguments: Value) -> ControlResult<Value> {
        match tool {
            "list_plugins" => to_json(json!({ "plugins": self.catalog.list().await? })),
            "refresh_plugins" => {
                let warnings = self.catalog.refresh().await?;
                to_json(json!({ "plugins": self.catalog.list().await?, "warnings": warnings }))
            }
            "get_plugin_info" => {
                let a: PluginArgs = args(arguments)?;
                to_json(self.catalog.plugin_info(a.plugin_id).await?)
            }
            "control_plugin" => {
                let a: ControlArgs = args(arguments)?;
                to_json(json!({
                    "plugin_id": a.plugin_id,
                    "runtime": self.catalog.control(a.plugin_id, a.control).await?,
                }))
            }
            "bridge_status" => to_json(json!({
                "in_flight": in_flight(),
                "pool_size": self.bridge.pool_size(),
                "default_timeout_ms": self.bridge.default_timeout().as_millis() as u64,
            })),

            "get_parameter" => {
                let a: ParameterArgs = args(arguments)?;
                to_json(self.automation.get_parameter(a.plugin_id, a.parameter_id).await?)
            }
            "set_parameter" => {
                let a: SetParameterArgs = args(arguments)?;
                to_json(
                    self.automation
                        .set_parameter(a.plugin_id, a.parameter_id, a.value)
                        .await?,
                )
            }
            "automate_parameter" => {
                let a: AutomateArgs = args(arguments)?;
                let kind: CurveKind = a.automation_type.parse()?;
                to_json(
                    self.automation
                        .start_automation(a.plugin_id, a.parameter_id, kind, a.duration_ms, a.values)
                        .await?,
                )
            }
            "stop_automation" => {
                let a: AutomationIdArgs = args(arguments)?;
                to_json(self.automation.stop_automation(a.automation_id).await?)
            }
            "get_automation" => {
                let a: AutomationIdArgs = args(arguments)?;
                to_json(self.automation.get_automation(a.automation_id).await?)
            }
            "remove_automation" => {
                let a: AutomationIdArgs = args(arguments)?;
                to_json(self.automation.remove_automation(a.automation_id).await?)
            }
            "list_automations" => {
                to_json(json!({ "automations": self.automation.list_automations().await? }))
            }
            "morph_parameters" => {
                let a: MorphArgs = args(arguments)?;
                to_json(
                    self.automation
                        .morph(a.plugin_id, a.targets, a.duration_ms)
                        .await?,
                )
            }
            "randomize_parameters" => {
                let a: RandomizeArgs = args(arguments)?;
                to_json(
                    self.automation
                        .randomize(a.plugin_id, a.amount, &a.exclude)
                        .await?,
                )
            }

            "start_recording" => {
                let a: RecordArgs = args(arguments)?;
                to_json(
                    self.automation
                        .start_recording(a.plugin_id, a.parameter_ids, a.duration_ms)
                        .await?,
                )
            }
            "stop_recording" => {
                let a: RecordingIdArgs = args(arguments)?;
                let rec = self.automation.stop_recording(a.recording_id).await?;
                let event_count = rec.event_count();
                to_json(json!({ "recording": rec, "event_count": event_count }))
            }
            "get_recording" => {
                let a: RecordingIdArgs = args(arguments)?;
                let rec = self.automation.get_recording(a.recording_id).await?;
                let event_count = rec.event_count();
                to_json(json!({ "recording": rec, "event_count": event_count }))
            }
            "list_recordings" => {
                to_json(json!({ "recordings": self.automation.list_recordings().await? }))
            }
            "delete_recording" => {
                let a: RecordingIdArgs = args(arguments)?;
                to_json(self.automation.delete_recording(a.recording_id).await?)
            }

            "connect_plugins" => {
                let a: ConnectArgs = args(arguments)?;
                let source = PortRef {
                    plugin_id: a.source_id,
                    port: a.source_port,
                };
                let destination = PortRef {
                    plugin_id: a.destination_id,
                    port: a.destination_port,
                };
                to_json(self.routing.connect(source, destination, a.gain).await?)
            }
            "disconnect_plugins" => {
                let a: ConnectionIdArgs = args(arguments)?;
                to_json(self.routing.disconnect(a.connection_id).await?)
            }
            "set_connection_gain" => {
                let a: GainArgs = args(arguments)?;
                to_json(self.routing.set_connection_gain(a.connection_id, a.gain).await?)
            }
            "get_routing_matrix" => to_json(self.routing.routing_matrix().await?),
            "detect_feedback" => {
                let a: FeedbackArgs = args(arguments)?;
                to_json(self.routing.detect_feedback(a.sensitivity).await?)
            }

            "load_session" => {
                let a: PathArgs = args(arguments)?;
                to_json(self.sessions.load_session(&a.path).await?)
            }
            "save_session" => {
                let a: OptionalPathArgs = args(arguments)?;
                to_json(self.sessions.save_session(a.path).await?)
            }
            "list_sessions" => to_json(self.sessions.list_sessions().await?),
            "create_snapshot" => {
                let a: SnapshotArgs = args(arguments)?;
                to_json(self.sessions.capture(a.session_id, &a.name).await?)
            }
            "restore_snapshot" => {
                let a: SnapshotIdArgs = args(arguments)?;
                to_json(self.sessions.restore(a.snapshot_id).await?)
            }
            "list_snapshots" => {
                to_json(json!({ "snapshots": self.sessions.list_snapshots().await? }))
            }
            "delete_snapshot" => {
                let a: SnapshotIdArgs = args(arguments)?;
                to_json(self.sessions.delete_snapshot(a.snapshot_id).await?)
            }

            other => Err(ControlError::invalid(format!("unknown tool `{other}`"))),
        }
    }

    /// Handle one newline-delimited request and render its response line.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => {
                let mut response = self.handle(&request.tool, request.arguments).await;
                if let Some(id) = request.id {
                    response["id"] = id;
                }
                response
            }
            Err(e) => {
                warn!("Malformed request line: {e}");
                envelope(Err(ControlError::invalid(format!("malformed request: {e}"))))
            }
        };
        response.to_string()
    }

    /// Serve JSON-lines requests until the reader is exhausted or `shutdown`
    /// fires. Requests run concurrently; responses are written as they
    /// complete, each carrying the request's `id` when one was given.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        mut writer: W,
        shutdown: CancellationToken,
    ) -> anyhow::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let requests = TaskTracker::new();
        let mut lines = reader.lines();
        let mut handled = 0;
        let mut reading = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if reading => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        handled += 1;
                        let router = self.clone();
                        let tx = tx.clone();
                        requests.spawn(async move {
                            let _ = tx.send(router.handle_line(&line).await);
                        });
                    }
                    None => {
                        debug!("Request stream closed");
                        reading = false;
                        requests.close();
                    }
                },
                Some(response) = rx.recv() => {
                    writer.write_all(response.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
                _ = shutdown.cancelled(), if reading => {
                    reading = false;
                    requests.close();
                }
                _ = requests.wait(), if !reading => break,
            }
        }

        while let Ok(response) = rx.try_recv() {
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(handled)
    }
}
