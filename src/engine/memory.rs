//! Thread-safe simulated engine.
//!
//! Used by the `run` command when no native host is linked, and by the test
//! suites. Project files are plain JSON holding plugin parameter values only;
//! runtime state (active, volume, dry/wet) is deliberately not written so a
//! reload resets it, like the native host does.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use super::{AudioEngine, AudioPeaks, ParameterId, ParameterInfo, PluginId, PluginInfo, RuntimeState};

/// Oldest recorded writes are dropped past this many entries.
pub const WRITE_HISTORY_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimParameter {
    pub name: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub value: f64,
    pub automatable: bool,
}

impl SimParameter {
    pub fn new(name: &str, min: f64, max: f64, value: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: String::new(),
            min,
            max,
            default: value,
            value,
            automatable: true,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn non_automatable(mut self) -> Self {
        self.automatable = false;
        self
    }

    fn info(&self) -> ParameterInfo {
        ParameterInfo {
            name: self.name.clone(),
            unit: self.unit.clone(),
            min: self.min,
            max: self.max,
            default: self.default,
            current: self.value,
            automatable: self.automatable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPlugin {
    name: String,
    label: String,
    parameters: Vec<SimParameter>,
    #[serde(skip)]
    runtime: RuntimeState,
    #[serde(skip)]
    peaks: AudioPeaks,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectFile {
    plugins: BTreeMap<PluginId, SimPlugin>,
}

#[derive(Debug, Default)]
struct EngineState {
    plugins: BTreeMap<PluginId, SimPlugin>,
    next_id: PluginId,
    ports: HashSet<(PluginId, u32, PluginId, u32)>,
    failing: HashSet<(PluginId, ParameterId)>,
    set_calls: VecDeque<(PluginId, ParameterId, f64)>,
    call_delay: Duration,
    refuse_saves: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small rack used by the `run` command.
    pub fn with_demo_rack() -> Self {
        let engine = Self::new();
        engine.add_plugin(
            "Gain",
            vec![
                SimParameter::new("Gain", -60.0, 12.0, 0.0).with_unit("dB"),
                SimParameter::new("Pan", -1.0, 1.0, 0.0),
            ],
        );
        engine.add_plugin(
            "Filter",
            vec![
                SimParameter::new("Cutoff", 20.0, 20000.0, 1000.0).with_unit("Hz"),
                SimParameter::new("Resonance", 0.0, 1.0, 0.2),
                SimParameter::new("Mode", 0.0, 3.0, 0.0).non_automatable(),
            ],
        );
        engine.add_plugin(
            "Delay",
            vec![
                SimParameter::new("Time", 1.0, 2000.0, 250.0).with_unit("ms"),
                SimParameter::new("Feedback", 0.0, 1.0, 0.3),
                SimParameter::new("Mix", 0.0, 1.0, 0.5),
            ],
        );
        engine
    }

    pub fn add_plugin(&self, name: &str, parameters: Vec<SimParameter>) -> PluginId {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.plugins.insert(
            id,
            SimPlugin {
                name: name.to_string(),
                label: name.to_lowercase(),
                parameters,
                runtime: RuntimeState::default(),
                peaks: AudioPeaks::default(),
            },
        );
        id
    }

    pub fn set_peaks(&self, plugin: PluginId, peaks: AudioPeaks) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(p) = state.plugins.get_mut(&plugin) {
            p.peaks = peaks;
        }
    }

    /// Make every `set_parameter`/`get_parameter` on this target fail.
    pub fn fail_parameter(&self, plugin: PluginId, parameter: ParameterId) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.failing.insert((plugin, parameter));
    }

    /// Make `save_project` report failure without writing anything.
    pub fn refuse_saves(&self, refuse: bool) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.refuse_saves = refuse;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.call_delay = delay;
    }

    /// Values written to one parameter, in call order. Only the most recent
    /// [`WRITE_HISTORY_LIMIT`] writes across all parameters are kept.
    pub fn set_history(&self, plugin: PluginId, parameter: ParameterId) -> Vec<f64> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .set_calls
            .iter()
            .filter(|(pl, pa, _)| *pl == plugin && *pa == parameter)
            .map(|(_, _, v)| *v)
            .collect()
    }

    pub fn set_call_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.set_calls.len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        let delay = {
            let state = self.state.lock().map_err(|_| anyhow!("engine state poisoned"))?;
            state.call_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state.lock().map_err(|_| anyhow!("engine state poisoned"))
    }
}

impl EngineState {
    fn plugin(&self, plugin: PluginId) -> Result<&SimPlugin> {
        self.plugins
            .get(&plugin)
            .ok_or_else(|| anyhow!("invalid plugin id {plugin}"))
    }

    fn plugin_mut(&mut self, plugin: PluginId) -> Result<&mut SimPlugin> {
        self.plugins
            .get_mut(&plugin)
            .ok_or_else(|| anyhow!("invalid plugin id {plugin}"))
    }

    fn parameter(&self, plugin: PluginId, parameter: ParameterId) -> Result<&SimParameter> {
        if self.failing.contains(&(plugin, parameter)) {
            bail!("parameter {parameter} of plugin {plugin} is not responding");
        }
        self.plugin(plugin)?
            .parameters
            .get(parameter as usize)
            .ok_or_else(|| anyhow!("invalid parameter id {parameter} for plugin {plugin}"))
    }
}

impl AudioEngine for InMemoryEngine {
    fn plugin_ids(&self) -> Result<Vec<PluginId>> {
        Ok(self.lock()?.plugins.keys().copied().collect())
    }

    fn get_plugin_info(&self, plugin: PluginId) -> Result<Option<PluginInfo>> {
        let state = self.lock()?;
        Ok(state.plugins.get(&plugin).map(|p| PluginInfo {
            id: plugin,
            name: p.name.clone(),
            label: p.label.clone(),
        }))
    }

    fn get_parameter_count(&self, plugin: PluginId) -> Result<u32> {
        Ok(self.lock()?.plugin(plugin)?.parameters.len() as u32)
    }

    fn get_parameter_info(&self, plugin: PluginId, parameter: ParameterId) -> Result<ParameterInfo> {
        Ok(self.lock()?.parameter(plugin, parameter)?.info())
    }

    fn get_parameter(&self, plugin: PluginId, parameter: ParameterId) -> Result<f64> {
        Ok(self.lock()?.parameter(plugin, parameter)?.value)
    }

    fn set_parameter(&self, plugin: PluginId, parameter: ParameterId, value: f64) -> Result<()> {
        let mut state = self.lock()?;
        state.parameter(plugin, parameter)?;
        let param = &mut state.plugin_mut(plugin)?.parameters[parameter as usize];
        param.value = value.clamp(param.min, param.max);
        if state.set_calls.len() == WRITE_HISTORY_LIMIT {
            state.set_calls.pop_front();
        }
        state.set_calls.push_back((plugin, parameter, value));
        Ok(())
    }

    fn get_runtime_state(&self, plugin: PluginId) -> Result<RuntimeState> {
        Ok(self.lock()?.plugin(plugin)?.runtime)
    }

    fn set_active(&self, plugin: PluginId, active: bool) -> Result<()> {
        self.lock()?.plugin_mut(plugin)?.runtime.active = active;
        Ok(())
    }

    fn set_volume(&self, plugin: PluginId, volume: f64) -> Result<()> {
        self.lock()?.plugin_mut(plugin)?.runtime.volume = volume;
        Ok(())
    }

    fn set_drywet(&self, plugin: PluginId, drywet: f64) -> Result<()> {
        self.lock()?.plugin_mut(plugin)?.runtime.drywet = drywet;
        Ok(())
    }

    fn get_audio_peaks(&self, plugin: PluginId) -> Result<AudioPeaks> {
        Ok(self.lock()?.plugin(plugin)?.peaks)
    }

    fn connect_ports(
        &self,
        source: PluginId,
        source_port: u32,
        destination: PluginId,
        destination_port: u32,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        state.plugin(source)?;
        state.plugin(destination)?;
        Ok(state
            .ports
            .insert((source, source_port, destination, destination_port)))
    }

    fn disconnect_ports(
        &self,
        source: PluginId,
        source_port: u32,
        destination: PluginId,
        destination_port: u32,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .ports
            .remove(&(source, source_port, destination, destination_port)))
    }

    fn save_project(&self, path: &Path) -> Result<bool> {
        let state = self.lock()?;
        if state.refuse_saves {
            return Ok(false);
        }
        let project = ProjectFile {
            plugins: state.plugins.clone(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&project)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(true)
    }

    fn load_project(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let project: ProjectFile = serde_json::from_str(&raw)
            .with_context(|| format!("Project file {} is not valid", path.display()))?;
        let mut state = self.lock()?;
        let peaks: BTreeMap<PluginId, AudioPeaks> =
            state.plugins.iter().map(|(id, p)| (*id, p.peaks)).collect();
        state.next_id = project.plugins.keys().max().map(|id| id + 1).unwrap_or(0);
        state.plugins = project.plugins;
        for (id, plugin) in state.plugins.iter_mut() {
            plugin.peaks = peaks.get(id).copied().unwrap_or_default();
        }
        state.ports.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_parameter_is_clamped_and_recorded() {
        let engine = InMemoryEngine::new();
        let id = engine.add_plugin("Gain", vec![SimParameter::new("Gain", 0.0, 1.0, 0.5)]);
        engine.set_parameter(id, 0, 3.0).unwrap();
        assert_eq!(engine.get_parameter(id, 0).unwrap(), 1.0);
        assert_eq!(engine.set_history(id, 0), vec![3.0]);
    }

    #[test]
    fn failing_parameter_reports_error() {
        let engine = InMemoryEngine::new();
        let id = engine.add_plugin("Gain", vec![SimParameter::new("Gain", 0.0, 1.0, 0.5)]);
        engine.fail_parameter(id, 0);
        assert!(engine.set_parameter(id, 0, 0.1).is_err());
        assert!(engine.get_parameter(id, 0).is_err());
    }

    #[test]
    fn project_reload_resets_runtime_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("song.json");
        let engine = InMemoryEngine::new();
        let id = engine.add_plugin("Gain", vec![SimParameter::new("Gain", 0.0, 1.0, 0.25)]);
        engine.set_active(id, false).unwrap();
        assert!(engine.save_project(&path).unwrap());

        engine.set_parameter(id, 0, 0.9).unwrap();
        assert!(engine.load_project(&path).unwrap());
        assert_eq!(engine.get_parameter(id, 0).unwrap(), 0.25);
        assert!(engine.get_runtime_state(id).unwrap().active);
    }

    #[test]
    fn load_missing_project_returns_false() {
        let engine = InMemoryEngine::new();
        assert!(!engine.load_project(Path::new("/nonexistent/project.json")).unwrap());
    }

    #[test]
    fn write_history_is_bounded() {
        let engine = InMemoryEngine::new();
        let id = engine.add_plugin("Gain", vec![SimParameter::new("Gain", 0.0, 10_000.0, 0.0)]);
        for i in 0..WRITE_HISTORY_LIMIT + 10 {
            engine.set_parameter(id, 0, i as f64).unwrap();
        }
        let history = engine.set_history(id, 0);
        assert_eq!(engine.set_call_count(), WRITE_HISTORY_LIMIT);
        assert_eq!(history.first(), Some(&10.0));
        assert_eq!(history.last(), Some(&((WRITE_HISTORY_LIMIT + 9) as f64)));
    }

    #[test]
    fn refused_save_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("song.json");
        let engine = InMemoryEngine::new();
        engine.refuse_saves(true);
        assert!(!engine.save_project(&path).unwrap());
        assert!(!path.exists());
    }
}
