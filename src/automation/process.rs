use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::curve::CurveKind;
use crate::engine::{ParameterId, PluginId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Cancelled | ProcessState::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Linear,
    Exponential,
    Sine,
    RandomWalk,
    Morph,
}

impl From<CurveKind> for ProcessKind {
    fn from(kind: CurveKind) -> Self {
        match kind {
            CurveKind::Linear => ProcessKind::Linear,
            CurveKind::Exponential => ProcessKind::Exponential,
            CurveKind::Sine => ProcessKind::Sine,
            CurveKind::RandomWalk => ProcessKind::RandomWalk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationTarget {
    Parameter {
        plugin_id: PluginId,
        parameter_id: ParameterId,
    },
    ParameterSet {
        plugin_id: PluginId,
        parameter_ids: Vec<ParameterId>,
    },
}

impl AutomationTarget {
    pub fn plugin_id(&self) -> PluginId {
        match self {
            AutomationTarget::Parameter { plugin_id, .. }
            | AutomationTarget::ParameterSet { plugin_id, .. } => *plugin_id,
        }
    }

    pub fn touches(&self, plugin: PluginId, parameter: ParameterId) -> bool {
        match self {
            AutomationTarget::Parameter {
                plugin_id,
                parameter_id,
            } => *plugin_id == plugin && *parameter_id == parameter,
            AutomationTarget::ParameterSet {
                plugin_id,
                parameter_ids,
            } => *plugin_id == plugin && parameter_ids.contains(&parameter),
        }
    }
}

/// Record of one automation run. Kept after it finishes until removed.
#[derive(Debug, Clone, Serialize)]
pub struct AutomationProcess {
    pub id: Uuid,
    pub target: AutomationTarget,
    pub kind: ProcessKind,
    pub duration_ms: u64,
    pub keyframes: Option<Vec<f64>>,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps_total: usize,
    pub steps_applied: usize,
    pub last_value: Option<f64>,
    pub error: Option<String>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
    #[serde(skip)]
    pub(crate) done: watch::Receiver<ProcessState>,
}

impl AutomationProcess {
    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    pub(crate) fn finish(&mut self, state: ProcessState, error: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}
