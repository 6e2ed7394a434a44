//! The native plugin-host engine seen from the control plane.
//!
//! Every method is synchronous and may block for an unbounded time. Callers
//! inside the async runtime must reach the engine through
//! [`crate::bridge::BlockingBridge`] or [`crate::bridge::BatchBridge`], never
//! directly.

pub mod memory;

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryEngine, SimParameter};

pub type PluginId = u32;
pub type ParameterId = u32;

pub type SharedEngine = Arc<dyn AudioEngine>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub current: f64,
    pub automatable: bool,
}

impl ParameterInfo {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-plugin properties the engine does not persist in its project file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub active: bool,
    pub volume: f64,
    pub drywet: f64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            active: true,
            volume: 1.0,
            drywet: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPeaks {
    pub in_left: f64,
    pub in_right: f64,
    pub out_left: f64,
    pub out_right: f64,
}

impl AudioPeaks {
    pub fn output_average(&self) -> f64 {
        (self.out_left + self.out_right) / 2.0
    }

    pub fn output_max(&self) -> f64 {
        self.out_left.max(self.out_right)
    }
}

pub trait AudioEngine: Send + Sync + Debug {
    fn plugin_ids(&self) -> Result<Vec<PluginId>>;
    fn get_plugin_info(&self, plugin: PluginId) -> Result<Option<PluginInfo>>;
    fn get_parameter_count(&self, plugin: PluginId) -> Result<u32>;
    fn get_parameter_info(&self, plugin: PluginId, parameter: ParameterId) -> Result<ParameterInfo>;
    fn get_parameter(&self, plugin: PluginId, parameter: ParameterId) -> Result<f64>;
    fn set_parameter(&self, plugin: PluginId, parameter: ParameterId, value: f64) -> Result<()>;

    fn get_runtime_state(&self, plugin: PluginId) -> Result<RuntimeState>;
    fn set_active(&self, plugin: PluginId, active: bool) -> Result<()>;
    fn set_volume(&self, plugin: PluginId, volume: f64) -> Result<()>;
    fn set_drywet(&self, plugin: PluginId, drywet: f64) -> Result<()>;

    fn get_audio_peaks(&self, plugin: PluginId) -> Result<AudioPeaks>;

    fn connect_ports(
        &self,
        source: PluginId,
        source_port: u32,
        destination: PluginId,
        destination_port: u32,
    ) -> Result<bool>;
    fn disconnect_ports(
        &self,
        source: PluginId,
        source_port: u32,
        destination: PluginId,
        destination_port: u32,
    ) -> Result<bool>;

    fn save_project(&self, path: &Path) -> Result<bool>;
    fn load_project(&self, path: &Path) -> Result<bool>;
}
