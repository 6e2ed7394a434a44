//! Local mirror of the plugins the engine reports.
//!
//! Requests are validated against this catalog so unknown ids are rejected
//! without touching the engine. The catalog is refreshed through the batch
//! bridge at startup and after every project load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bridge::{BatchBridge, BlockingBridge};
use crate::engine::{AudioPeaks, ParameterId, PluginId, PluginInfo, RuntimeState, SharedEngine};
use crate::error::{ControlError, ControlResult};
use crate::owner::{StateOwner, engine_op, found};

/// Engine volume goes slightly past unity gain.
pub const VOLUME_MAX: f64 = 1.27;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginEntry {
    pub info: PluginInfo,
    pub parameter_count: u32,
}

/// Catalog entry plus the live state read from the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDetails {
    #[serde(flatten)]
    pub entry: PluginEntry,
    pub runtime: RuntimeState,
    pub peaks: AudioPeaks,
}

/// Runtime changes for one plugin; absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PluginControl {
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub drywet: Option<f64>,
}

impl PluginControl {
    fn validate(&self) -> ControlResult<()> {
        if self.active.is_none() && self.volume.is_none() && self.drywet.is_none() {
            return Err(ControlError::invalid(
                "nothing to change: give active, volume or drywet",
            ));
        }
        if let Some(volume) = self.volume.filter(|v| !(0.0..=VOLUME_MAX).contains(v)) {
            return Err(ControlError::invalid(format!(
                "volume {volume} outside 0..={VOLUME_MAX}"
            )));
        }
        if let Some(drywet) = self.drywet.filter(|v| !(0.0..=1.0).contains(v)) {
            return Err(ControlError::invalid(format!(
                "drywet {drywet} outside 0..=1"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PluginCatalog {
    engine: SharedEngine,
    bridge: BlockingBridge,
    batch: BatchBridge,
    entries: StateOwner<BTreeMap<PluginId, PluginEntry>>,
}

impl PluginCatalog {
    pub fn new(engine: SharedEngine, bridge: BlockingBridge, batch: BatchBridge) -> Self {
        Self {
            engine,
            bridge,
            batch,
            entries: StateOwner::spawn("plugin-catalog", BTreeMap::new()),
        }
    }

    /// Re-read the plugin list from the engine. Plugins whose info cannot be
    /// read are left out and reported as warnings.
    pub async fn refresh(&self) -> ControlResult<Vec<String>> {
        let ids = self
            .bridge
            .run(engine_op("list plugins", &self.engine, |e| e.plugin_ids()))
            .await?;

        let ops = ids
            .iter()
            .map(|&id| {
                engine_op(format!("describe plugin {id}"), &self.engine, move |e| {
                    let info = e.get_plugin_info(id)?;
                    let count = e.get_parameter_count(id)?;
                    Ok(info.map(|info| PluginEntry {
                        info,
                        parameter_count: count,
                    }))
                })
            })
            .collect();
        let outcome = self.batch.run_batch("fetch plugin metadata", ops).await;

        let mut warnings = outcome.warnings;
        let mut fresh = BTreeMap::new();
        for (id, slot) in ids.into_iter().zip(outcome.results) {
            match slot {
                Some(Some(entry)) => {
                    fresh.insert(id, entry);
                }
                Some(None) => warnings.push(format!("plugin {id} disappeared during refresh")),
                None => {}
            }
        }
        let count = fresh.len();
        self.entries.call(move |entries| *entries = fresh).await?;
        info!("Plugin catalog refreshed: {count} plugin(s)");
        for w in &warnings {
            warn!("{w}");
        }
        Ok(warnings)
    }

    pub async fn list(&self) -> ControlResult<Vec<PluginEntry>> {
        self.entries.call(|e| e.values().cloned().collect()).await
    }

    pub async fn require_plugin(&self, plugin: PluginId) -> ControlResult<PluginEntry> {
        let entry = self.entries.call(move |e| e.get(&plugin).cloned()).await?;
        found(entry, "plugin", plugin)
    }

    pub async fn require_parameter(
        &self,
        plugin: PluginId,
        parameter: ParameterId,
    ) -> ControlResult<PluginEntry> {
        let entry = self.require_plugin(plugin).await?;
        if parameter >= entry.parameter_count {
            return found(None, "parameter", format!("{plugin}:{parameter}"));
        }
        Ok(entry)
    }

    pub async fn plugin_info(&self, plugin: PluginId) -> ControlResult<PluginDetails> {
        let entry = self.require_plugin(plugin).await?;
        let (runtime, peaks) = self
            .bridge
            .run(engine_op(format!("read plugin {plugin} state"), &self.engine, move |e| {
                Ok((e.get_runtime_state(plugin)?, e.get_audio_peaks(plugin)?))
            }))
            .await?;
        Ok(PluginDetails {
            entry,
            runtime,
            peaks,
        })
    }

    /// Apply activate/bypass, volume and dry/wet changes, returning the
    /// state the engine reports afterwards.
    pub async fn control(
        &self,
        plugin: PluginId,
        control: PluginControl,
    ) -> ControlResult<RuntimeState> {
        self.require_plugin(plugin).await?;
        control.validate()?;
        let state = self
            .bridge
            .run(engine_op(format!("control plugin {plugin}"), &self.engine, move |e| {
                if let Some(active) = control.active {
                    e.set_active(plugin, active)?;
                }
                if let Some(volume) = control.volume {
                    e.set_volume(plugin, volume)?;
                }
                if let Some(drywet) = control.drywet {
                    e.set_drywet(plugin, drywet)?;
                }
                e.get_runtime_state(plugin)
            }))
            .await?;
        info!(
            "Plugin {plugin} now active={} volume={} drywet={}",
            state.active, state.volume, state.drywet
        );
        Ok(state)
    }
}
