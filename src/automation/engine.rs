use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::curve::{Curve, CurveKind, check_keyframes};
use super::process::{AutomationProcess, AutomationTarget, ProcessKind, ProcessState};
use super::recording::RecordingSession;
use crate::bridge::{BatchBridge, BlockingBridge};
use crate::engine::{ParameterId, ParameterInfo, PluginId, SharedEngine};
use crate::error::{ControlError, ControlResult};
use crate::owner::{StateOwner, engine_op, found};
use crate::plugins::PluginCatalog;

/// Interval between two automation steps.
pub const STEP_RESOLUTION: Duration = Duration::from_millis(10);

const PREVIEW_LEN: usize = 10;

#[derive(Debug, Default)]
pub(crate) struct AutomationTables {
    pub(crate) processes: HashMap<Uuid, AutomationProcess>,
    pub(crate) recordings: HashMap<Uuid, RecordingSession>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedAutomation {
    pub automation_id: Uuid,
    pub plugin_id: PluginId,
    pub parameter_id: ParameterId,
    pub parameter_name: String,
    pub curve: Curve,
    pub duration_ms: u64,
    pub steps: usize,
    pub preview: Vec<f64>,
    /// Other running automations writing the same parameter.
    pub overlapping: Vec<Uuid>,
}

pub(crate) struct Registration {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancellationToken,
    pub(crate) state_tx: watch::Sender<ProcessState>,
    pub(crate) overlapping: Vec<Uuid>,
}

/// Runs automation and recording processes in the background. Each process is
/// a task on the tracker with its own cancellation token, a child of the
/// engine-wide shutdown token.
#[derive(Debug, Clone)]
pub struct AutomationEngine {
    pub(crate) engine: SharedEngine,
    pub(crate) bridge: BlockingBridge,
    pub(crate) batch: BatchBridge,
    pub(crate) catalog: PluginCatalog,
    pub(crate) resolution: Duration,
    pub(crate) sample_interval: Duration,
    pub(crate) tables: StateOwner<AutomationTables>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl AutomationEngine {
    pub fn new(
        engine: SharedEngine,
        bridge: BlockingBridge,
        batch: BatchBridge,
        catalog: PluginCatalog,
        sample_interval: Duration,
    ) -> Self {
        Self {
            engine,
            bridge,
            batch,
            catalog,
            resolution: STEP_RESOLUTION,
            sample_interval: sample_interval.max(Duration::from_millis(1)),
            tables: StateOwner::spawn("automation", AutomationTables::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn ensure_open(&self) -> ControlResult<()> {
        if self.shutdown.is_cancelled() {
            Err(ControlError::Unavailable)
        } else {
            Ok(())
        }
    }

    pub(crate) fn steps_for(&self, duration_ms: u64) -> ControlResult<usize> {
        let resolution_ms = self.resolution.as_millis() as u64;
        if duration_ms < resolution_ms {
            return Err(ControlError::invalid(format!(
                "duration {duration_ms}ms is shorter than one {resolution_ms}ms step"
            )));
        }
        Ok((duration_ms / resolution_ms) as usize)
    }

    /// Upper bound on how long a stop request waits for the process to
    /// observe its cancellation.
    pub(crate) fn stop_grace(&self) -> Duration {
        self.bridge.default_timeout() + self.resolution.max(self.sample_interval)
    }

    pub(crate) async fn read_parameter_info(
        &self,
        plugin: PluginId,
        parameter: ParameterId,
    ) -> ControlResult<ParameterInfo> {
        self.bridge
            .run(engine_op(
                format!("read parameter {plugin}:{parameter}"),
                &self.engine,
                move |e| e.get_parameter_info(plugin, parameter),
            ))
            .await
    }

    pub async fn start_automation(
        &self,
        plugin: PluginId,
        parameter: ParameterId,
        kind: CurveKind,
        duration_ms: u64,
        keyframes: Option<Vec<f64>>,
    ) -> ControlResult<StartedAutomation> {
        self.ensure_open()?;
        let steps = self.steps_for(duration_ms)?;
        if let Some(keys) = keyframes.as_deref() {
            check_keyframes(keys)?;
        }
        self.catalog.require_parameter(plugin, parameter).await?;

        let info = self.read_parameter_info(plugin, parameter).await?;
        if !info.automatable {
            return Err(ControlError::invalid(format!(
                "parameter {plugin}:{parameter} ({}) is not automatable",
                info.name
            )));
        }
        let curve = Curve::resolve(kind, keyframes.as_deref(), &info)?;

        let target = AutomationTarget::Parameter {
            plugin_id: plugin,
            parameter_id: parameter,
        };
        let reg = self
            .register(target, kind.into(), duration_ms, keyframes, steps)
            .await?;
        if !reg.overlapping.is_empty() {
            warn!(
                "Automation on {plugin}:{parameter} overlaps {} running process(es); last write wins",
                reg.overlapping.len()
            );
        }

        let preview = curve.preview(steps, self.resolution.as_secs_f64(), PREVIEW_LEN);
        let started = StartedAutomation {
            automation_id: reg.id,
            plugin_id: plugin,
            parameter_id: parameter,
            parameter_name: info.name,
            curve,
            duration_ms,
            steps,
            preview,
            overlapping: reg.overlapping.clone(),
        };

        let this = self.clone();
        self.tracker.spawn(async move {
            this.drive_curve(reg, plugin, parameter, curve, steps).await;
        });
        info!(
            "Started {kind} automation {} on {plugin}:{parameter} for {duration_ms}ms",
            started.automation_id
        );
        Ok(started)
    }

    pub(crate) async fn register(
        &self,
        target: AutomationTarget,
        kind: ProcessKind,
        duration_ms: u64,
        keyframes: Option<Vec<f64>>,
        steps: usize,
    ) -> ControlResult<Registration> {
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let (state_tx, done) = watch::channel(ProcessState::Created);
        let process = AutomationProcess {
            id,
            target,
            kind,
            duration_ms,
            keyframes,
            state: ProcessState::Created,
            started_at: chrono::Utc::now(),
            finished_at: None,
            steps_total: steps,
            steps_applied: 0,
            last_value: None,
            error: None,
            cancel: cancel.clone(),
            done,
        };
        let overlapping = self
            .tables
            .call(move |t| {
                let plugin = process.target.plugin_id();
                let params = match &process.target {
                    AutomationTarget::Parameter { parameter_id, .. } => vec![*parameter_id],
                    AutomationTarget::ParameterSet { parameter_ids, .. } => parameter_ids.clone(),
                };
                let mut overlapping: Vec<Uuid> = t
                    .processes
                    .values()
                    .filter(|p| p.is_running())
                    .filter(|p| params.iter().any(|q| p.target.touches(plugin, *q)))
                    .map(|p| p.id)
                    .collect();
                overlapping.sort();
                t.processes.insert(id, process);
                overlapping
            })
            .await?;
        Ok(Registration {
            id,
            cancel,
            state_tx,
            overlapping,
        })
    }

    pub(crate) fn mark_running(&self, reg: &Registration) {
        let id = reg.id;
        self.tables.cast(move |t| {
            if let Some(p) = t.processes.get_mut(&id) {
                if p.state == ProcessState::Created {
                    p.state = ProcessState::Running;
                }
            }
        });
        let _ = reg.state_tx.send(ProcessState::Running);
    }

    pub(crate) fn record_step(&self, id: Uuid, applied: usize, value: Option<f64>) {
        self.tables.cast(move |t| {
            if let Some(p) = t.processes.get_mut(&id) {
                p.steps_applied = applied;
                if value.is_some() {
                    p.last_value = value;
                }
            }
        });
    }

    pub(crate) fn conclude(&self, reg: &Registration, state: ProcessState, error: Option<String>) {
        let id = reg.id;
        match (&state, &error) {
            (ProcessState::Error, Some(msg)) => error!("Automation {id} failed: {msg}"),
            _ => info!("Automation {id} {state:?}"),
        }
        self.tables.cast(move |t| {
            if let Some(p) = t.processes.get_mut(&id) {
                p.finish(state, error);
            }
        });
        let _ = reg.state_tx.send(state);
    }

    async fn drive_curve(
        &self,
        reg: Registration,
        plugin: PluginId,
        parameter: ParameterId,
        curve: Curve,
        steps: usize,
    ) {
        self.mark_running(&reg);
        let mut sampler = curve.sampler();
        let resolution_secs = self.resolution.as_secs_f64();

        for step in 0..steps {
            if reg.cancel.is_cancelled() {
                return self.conclude(&reg, ProcessState::Cancelled, None);
            }
            let value = sampler.value_at(step, steps, step as f64 * resolution_secs);
            let op = engine_op(
                format!("automation {} step {step}", reg.id),
                &self.engine,
                move |e| e.set_parameter(plugin, parameter, value),
            );
            if let Err(err) = self.bridge.run(op).await {
                return self.conclude(&reg, ProcessState::Error, Some(err.to_string()));
            }
            self.record_step(reg.id, step + 1, Some(value));

            tokio::select! {
                _ = reg.cancel.cancelled() => {
                    return self.conclude(&reg, ProcessState::Cancelled, None);
                }
                _ = tokio::time::sleep(self.resolution) => {}
            }
        }
        self.conclude(&reg, ProcessState::Completed, None);
    }

    pub async fn get_automation(&self, id: Uuid) -> ControlResult<AutomationProcess> {
        let process = self.tables.call(move |t| t.processes.get(&id).cloned()).await?;
        found(process, "automation", id)
    }

    pub async fn list_automations(&self) -> ControlResult<Vec<AutomationProcess>> {
        let mut all: Vec<AutomationProcess> = self
            .tables
            .call(|t| t.processes.values().cloned().collect())
            .await?;
        all.sort_by_key(|p| p.started_at);
        Ok(all)
    }

    /// Request cancellation and wait until the process has stopped writing.
    /// Values already applied stay in place.
    pub async fn stop_automation(&self, id: Uuid) -> ControlResult<AutomationProcess> {
        let process = self.get_automation(id).await?;
        if process.is_running() {
            process.cancel.cancel();
            let mut done = process.done.clone();
            let wait = done.wait_for(|s| s.is_terminal());
            if tokio::time::timeout(self.stop_grace(), wait).await.is_err() {
                warn!("Automation {id} did not acknowledge cancellation in time");
            }
        }
        self.get_automation(id).await
    }

    /// Wait for a process to reach a terminal state.
    pub async fn wait_automation(&self, id: Uuid) -> ControlResult<AutomationProcess> {
        let process = self.get_automation(id).await?;
        let mut done = process.done.clone();
        let _ = done.wait_for(|s| s.is_terminal()).await;
        self.get_automation(id).await
    }

    pub async fn remove_automation(&self, id: Uuid) -> ControlResult<AutomationProcess> {
        self.stop_automation(id).await?;
        let removed = self.tables.call(move |t| t.processes.remove(&id)).await?;
        found(removed, "automation", id)
    }

    /// Cancel every automation and recording and wait for their tasks to
    /// exit. New processes are refused afterwards.
    pub async fn stop_all(&self) -> usize {
        let running = self
            .tables
            .call(|t| {
                t.processes.values().filter(|p| p.is_running()).count()
                    + t.recordings.values().filter(|r| r.is_recording()).count()
            })
            .await
            .unwrap_or(0);
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.stop_grace(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("{} background process(es) still running at shutdown", self.tracker.len());
        }
        info!("Stopped {running} automation/recording process(es)");
        running
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{InMemoryEngine, SimParameter};
    use std::sync::Arc;

    pub(crate) async fn setup() -> (Arc<InMemoryEngine>, AutomationEngine, PluginId) {
        let engine = Arc::new(InMemoryEngine::new());
        let plugin = engine.add_plugin(
            "Synth",
            vec![
                SimParameter::new("Cutoff", 0.0, 1.0, 0.0),
                SimParameter::new("Mode", 0.0, 3.0, 0.0).non_automatable(),
                SimParameter::new("Resonance", 0.0, 1.0, 0.5),
            ],
        );
        let bridge = BlockingBridge::new(Duration::from_secs(2), 8);
        let batch = BatchBridge::new(8, Duration::from_secs(2), 8);
        let catalog = PluginCatalog::new(engine.clone(), bridge.clone(), batch.clone());
        catalog.refresh().await.unwrap();
        let automation = AutomationEngine::new(
            engine.clone(),
            bridge,
            batch,
            catalog,
            Duration::from_millis(10),
        );
        (engine, automation, plugin)
    }

    #[tokio::test]
    async fn linear_automation_writes_progress_fraction() {
        let (engine, automation, plugin) = setup().await;
        let started = automation
            .start_automation(plugin, 0, CurveKind::Linear, 100, Some(vec![0.0, 1.0]))
            .await
            .unwrap();
        assert_eq!(started.steps, 10);
        assert_eq!(started.preview.len(), 10);

        let done = automation.wait_automation(started.automation_id).await.unwrap();
        assert_eq!(done.state, ProcessState::Completed);
        assert_eq!(done.steps_applied, 10);
        assert!(done.finished_at.is_some());

        let expected: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        assert_eq!(engine.set_history(plugin, 0), expected);
    }

    #[tokio::test]
    async fn stop_halts_further_writes() {
        let (engine, automation, plugin) = setup().await;
        let started = automation
            .start_automation(plugin, 0, CurveKind::Linear, 5_000, Some(vec![0.0, 1.0]))
            .await
            .unwrap();
        let id = started.automation_id;

        loop {
            if automation.get_automation(id).await.unwrap().steps_applied >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stopped = automation.stop_automation(id).await.unwrap();
        assert_eq!(stopped.state, ProcessState::Cancelled);

        let writes = engine.set_history(plugin, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.set_history(plugin, 0), writes);
        assert_eq!(writes.len(), stopped.steps_applied);
        assert_eq!(writes.last().copied(), stopped.last_value);
    }

    #[tokio::test]
    async fn engine_failure_moves_process_to_error() {
        let (engine, automation, plugin) = setup().await;
        let started = automation
            .start_automation(plugin, 2, CurveKind::Sine, 200, None)
            .await
            .unwrap();
        engine.fail_parameter(plugin, 2);
        let done = automation.wait_automation(started.automation_id).await.unwrap();
        assert_eq!(done.state, ProcessState::Error);
        assert!(done.error.unwrap().contains("not responding"));
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_up_front() {
        let (engine, automation, plugin) = setup().await;
        let short = automation
            .start_automation(plugin, 0, CurveKind::Linear, 5, None)
            .await
            .unwrap_err();
        assert_eq!(short.kind(), "invalid_argument");

        let unknown = automation
            .start_automation(99, 0, CurveKind::Linear, 100, None)
            .await
            .unwrap_err();
        assert_eq!(unknown.kind(), "not_found");

        let fixed = automation
            .start_automation(plugin, 1, CurveKind::Linear, 100, None)
            .await
            .unwrap_err();
        assert_eq!(fixed.kind(), "invalid_argument");

        let nan = automation
            .start_automation(plugin, 0, CurveKind::Linear, 100, Some(vec![0.0, f64::INFINITY]))
            .await
            .unwrap_err();
        assert_eq!(nan.kind(), "invalid_argument");
        assert_eq!(engine.set_call_count(), 0);
    }

    #[tokio::test]
    async fn overlapping_automations_are_reported() {
        let (_engine, automation, plugin) = setup().await;
        let first = automation
            .start_automation(plugin, 0, CurveKind::RandomWalk, 2_000, None)
            .await
            .unwrap();
        assert!(first.overlapping.is_empty());
        let second = automation
            .start_automation(plugin, 0, CurveKind::Linear, 2_000, None)
            .await
            .unwrap();
        assert_eq!(second.overlapping, vec![first.automation_id]);
        assert_eq!(automation.stop_all().await, 2);
    }

    #[tokio::test]
    async fn removed_automation_is_not_found() {
        let (_engine, automation, plugin) = setup().await;
        let started = automation
            .start_automation(plugin, 0, CurveKind::Exponential, 1_000, None)
            .await
            .unwrap();
        let removed = automation.remove_automation(started.automation_id).await.unwrap();
        assert_eq!(removed.state, ProcessState::Cancelled);
        let err = automation.get_automation(started.automation_id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn stop_all_refuses_new_processes() {
        let (_engine, automation, plugin) = setup().await;
        automation
            .start_automation(plugin, 0, CurveKind::Linear, 1_000, None)
            .await
            .unwrap();
        automation.stop_all().await;
        let listed = automation.list_automations().await.unwrap();
        assert!(listed.iter().all(|p| p.state == ProcessState::Cancelled));
        let err = automation
            .start_automation(plugin, 0, CurveKind::Linear, 100, None)
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::Unavailable);
    }
}
