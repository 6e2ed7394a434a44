use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::engine::AutomationEngine;
use crate::engine::{ParameterId, PluginId};
use crate::error::{ControlError, ControlResult};
use crate::owner::{engine_op, found};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Recording,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub elapsed_ms: u64,
    pub parameter_id: ParameterId,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub id: Uuid,
    pub plugin_id: PluginId,
    pub parameter_ids: Vec<ParameterId>,
    pub duration_ms: u64,
    pub status: RecordingStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub samples: Vec<Sample>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
    #[serde(skip)]
    pub(crate) done: watch::Receiver<RecordingStatus>,
}

/// Listing view without the sample log.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub id: Uuid,
    pub plugin_id: PluginId,
    pub parameter_ids: Vec<ParameterId>,
    pub duration_ms: u64,
    pub status: RecordingStatus,
    pub started_at: DateTime<Utc>,
    pub event_count: usize,
}

impl RecordingSession {
    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }

    /// Number of sampling rounds taken, i.e. samples per parameter.
    pub fn event_count(&self) -> usize {
        if self.parameter_ids.is_empty() {
            0
        } else {
            self.samples.len() / self.parameter_ids.len()
        }
    }

    pub fn values_for(&self, parameter: ParameterId) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|s| s.parameter_id == parameter)
            .map(|s| s.value)
            .collect()
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            id: self.id,
            plugin_id: self.plugin_id,
            parameter_ids: self.parameter_ids.clone(),
            duration_ms: self.duration_ms,
            status: self.status,
            started_at: self.started_at,
            event_count: self.event_count(),
        }
    }

    pub(crate) fn finish(&mut self, status: RecordingStatus, error: Option<String>) {
        if self.status != RecordingStatus::Recording {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

impl AutomationEngine {
    /// Sample `parameters` (all of the plugin's parameters when `None`) every
    /// sampling interval until `duration_ms` has elapsed or the recording is
    /// stopped.
    pub async fn start_recording(
        &self,
        plugin: PluginId,
        parameters: Option<Vec<ParameterId>>,
        duration_ms: u64,
    ) -> ControlResult<RecordingSummary> {
        self.ensure_open()?;
        if duration_ms == 0 {
            return Err(ControlError::invalid("recording duration must be positive"));
        }
        let entry = self.catalog.require_plugin(plugin).await?;
        let parameter_ids = match parameters {
            Some(ids) => {
                if let Some(bad) = ids.iter().find(|&&p| p >= entry.parameter_count) {
                    return found(None, "parameter", format!("{plugin}:{bad}"));
                }
                ids
            }
            None => (0..entry.parameter_count).collect(),
        };
        if parameter_ids.is_empty() {
            return Err(ControlError::invalid(format!(
                "plugin {plugin} has no parameters to record"
            )));
        }

        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let (status_tx, done) = watch::channel(RecordingStatus::Recording);
        let session = RecordingSession {
            id,
            plugin_id: plugin,
            parameter_ids: parameter_ids.clone(),
            duration_ms,
            status: RecordingStatus::Recording,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            samples: Vec::new(),
            cancel: cancel.clone(),
            done,
        };
        let summary = session.summary();
        self.tables
            .call(move |t| {
                t.recordings.insert(id, session);
            })
            .await?;

        let this = self.clone();
        self.tracker.spawn(async move {
            this.drive_recording(id, plugin, parameter_ids, duration_ms, cancel, status_tx)
                .await;
        });
        info!(
            "Recording {id} started on plugin {plugin} ({} parameter(s), {duration_ms}ms)",
            summary.parameter_ids.len()
        );
        Ok(summary)
    }

    async fn drive_recording(
        &self,
        id: Uuid,
        plugin: PluginId,
        parameter_ids: Vec<ParameterId>,
        duration_ms: u64,
        cancel: CancellationToken,
        status_tx: watch::Sender<RecordingStatus>,
    ) {
        let duration = Duration::from_millis(duration_ms);
        let started = Instant::now();
        let mut outcome = (RecordingStatus::Complete, None);

        while !cancel.is_cancelled() && started.elapsed() < duration {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let ids = parameter_ids.clone();
            let op = engine_op(format!("sample recording {id}"), &self.engine, move |e| {
                ids.iter()
                    .map(|&p| e.get_parameter(plugin, p).map(|value| (p, value)))
                    .collect::<anyhow::Result<Vec<_>>>()
            });
            match self.bridge.run(op).await {
                Ok(values) => self.tables.cast(move |t| {
                    if let Some(r) = t.recordings.get_mut(&id) {
                        r.samples.extend(values.into_iter().map(|(parameter_id, value)| Sample {
                            elapsed_ms,
                            parameter_id,
                            value,
                        }));
                    }
                }),
                Err(err) => {
                    error!("Recording {id} failed: {err}");
                    outcome = (RecordingStatus::Error, Some(err.to_string()));
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.sample_interval) => {}
            }
        }

        let (status, message) = outcome;
        self.tables.cast(move |t| {
            if let Some(r) = t.recordings.get_mut(&id) {
                r.finish(status, message);
            }
        });
        let _ = status_tx.send(status);
        info!("Recording {id} finished: {status:?}");
    }

    pub async fn get_recording(&self, id: Uuid) -> ControlResult<RecordingSession> {
        let recording = self.tables.call(move |t| t.recordings.get(&id).cloned()).await?;
        found(recording, "recording", id)
    }

    pub async fn list_recordings(&self) -> ControlResult<Vec<RecordingSummary>> {
        let mut all: Vec<RecordingSummary> = self
            .tables
            .call(|t| t.recordings.values().map(RecordingSession::summary).collect())
            .await?;
        all.sort_by_key(|r| r.started_at);
        Ok(all)
    }

    /// End sampling early. Samples taken so far are kept and the recording is
    /// marked complete.
    pub async fn stop_recording(&self, id: Uuid) -> ControlResult<RecordingSession> {
        let recording = self.get_recording(id).await?;
        if recording.is_recording() {
            recording.cancel.cancel();
            let mut done = recording.done.clone();
            let wait = done.wait_for(|s| *s != RecordingStatus::Recording);
            if tokio::time::timeout(self.stop_grace(), wait).await.is_err() {
                warn!("Recording {id} did not acknowledge cancellation in time");
            }
        }
        self.get_recording(id).await
    }

    pub async fn delete_recording(&self, id: Uuid) -> ControlResult<RecordingSummary> {
        self.stop_recording(id).await?;
        let removed = self.tables.call(move |t| t.recordings.remove(&id)).await?;
        found(removed.map(|r| r.summary()), "recording", id)
    }
}
