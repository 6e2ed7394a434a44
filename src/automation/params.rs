//! One-shot parameter operations and parameter-set morphing.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::{AutomationEngine, Registration};
use super::process::{AutomationTarget, ProcessKind, ProcessState};
use crate::engine::{ParameterId, ParameterInfo, PluginId};
use crate::error::{ControlError, ControlResult};
use crate::owner::engine_op;

const REPORTED_CHANGES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterChange {
    pub parameter_id: ParameterId,
    pub name: String,
    pub old_value: f64,
    pub new_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RandomizeReport {
    pub plugin_id: PluginId,
    pub amount: f64,
    pub randomized: usize,
    /// The first few changes, in parameter order.
    pub parameters: Vec<ParameterChange>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedMorph {
    pub morph_id: Uuid,
    pub plugin_id: PluginId,
    pub duration_ms: u64,
    pub steps: usize,
    pub start_values: BTreeMap<ParameterId, f64>,
    pub targets: BTreeMap<ParameterId, f64>,
    pub overlapping: Vec<Uuid>,
}

fn finite(value: f64, what: &str) -> ControlResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ControlError::invalid(format!("{what} {value} is not finite")))
    }
}

impl AutomationEngine {
    pub async fn get_parameter(
        &self,
        plugin: PluginId,
        parameter: ParameterId,
    ) -> ControlResult<ParameterInfo> {
        self.catalog.require_parameter(plugin, parameter).await?;
        self.read_parameter_info(plugin, parameter).await
    }

    pub async fn set_parameter(
        &self,
        plugin: PluginId,
        parameter: ParameterId,
        value: f64,
    ) -> ControlResult<ParameterChange> {
        finite(value, "value")?;
        self.catalog.require_parameter(plugin, parameter).await?;
        let info = self.read_parameter_info(plugin, parameter).await?;
        if !info.contains(value) {
            return Err(ControlError::invalid(format!(
                "value {value} outside range [{}, {}] of {}",
                info.min, info.max, info.name
            )));
        }
        self.bridge
            .run(engine_op(
                format!("set parameter {plugin}:{parameter}"),
                &self.engine,
                move |e| e.set_parameter(plugin, parameter, value),
            ))
            .await?;
        Ok(ParameterChange {
            parameter_id: parameter,
            name: info.name,
            old_value: info.current,
            new_value: value,
        })
    }

    /// Move every eligible parameter part of the way towards a uniformly
    /// drawn value. Non-automatable and excluded parameters are untouched.
    pub async fn randomize(
        &self,
        plugin: PluginId,
        amount: f64,
        exclude: &[ParameterId],
    ) -> ControlResult<RandomizeReport> {
        if !(0.0..=1.0).contains(&amount) {
            return Err(ControlError::invalid(format!(
                "randomization amount {amount} must be within [0, 1]"
            )));
        }
        let entry = self.catalog.require_plugin(plugin).await?;

        let reads = (0..entry.parameter_count)
            .map(|p| {
                engine_op(format!("read parameter {plugin}:{p}"), &self.engine, move |e| {
                    e.get_parameter_info(plugin, p)
                })
            })
            .collect();
        let infos = self.batch.run_batch("read parameters", reads).await;
        let mut warnings = infos.warnings;

        let mut rng = StdRng::from_os_rng();
        let mut planned = Vec::new();
        for (parameter, info) in (0..entry.parameter_count).zip(infos.results) {
            let Some(info) = info else { continue };
            if !info.automatable || exclude.contains(&parameter) {
                continue;
            }
            let drawn = if info.max > info.min {
                rng.random_range(info.min..=info.max)
            } else {
                info.min
            };
            let new_value = (info.current + (drawn - info.current) * amount).clamp(info.min, info.max);
            planned.push(ParameterChange {
                parameter_id: parameter,
                name: info.name,
                old_value: info.current,
                new_value,
            });
        }

        let writes = planned
            .iter()
            .map(|c| {
                let (p, v) = (c.parameter_id, c.new_value);
                engine_op(format!("set parameter {plugin}:{p}"), &self.engine, move |e| {
                    e.set_parameter(plugin, p, v)
                })
            })
            .collect();
        let applied = self.batch.run_batch("apply randomized values", writes).await;
        warnings.extend(applied.warnings);

        let changes: Vec<ParameterChange> = planned
            .into_iter()
            .zip(applied.results)
            .filter_map(|(change, ok)| ok.map(|_| change))
            .collect();
        info!(
            "Randomized {} parameter(s) of plugin {plugin} by {amount}",
            changes.len()
        );
        Ok(RandomizeReport {
            plugin_id: plugin,
            amount,
            randomized: changes.len(),
            parameters: changes.into_iter().take(REPORTED_CHANGES).collect(),
            warnings,
        })
    }

    /// Interpolate several parameters linearly from their current values to
    /// `targets` over `duration_ms`, finishing on the exact targets.
    pub async fn morph(
        &self,
        plugin: PluginId,
        targets: BTreeMap<ParameterId, f64>,
        duration_ms: u64,
    ) -> ControlResult<StartedMorph> {
        self.ensure_open()?;
        let steps = self.steps_for(duration_ms)?;
        if targets.is_empty() {
            return Err(ControlError::invalid("morph needs at least one target"));
        }
        for value in targets.values() {
            finite(*value, "target")?;
        }
        for parameter in targets.keys() {
            self.catalog.require_parameter(plugin, *parameter).await?;
        }

        let reads = targets
            .keys()
            .map(|&p| {
                engine_op(format!("read parameter {plugin}:{p}"), &self.engine, move |e| {
                    e.get_parameter_info(plugin, p)
                })
            })
            .collect();
        let current = self.batch.run_batch("read morph start values", reads).await;
        if let Some(err) = current.partial_failure() {
            return Err(err);
        }
        let mut start_values = BTreeMap::new();
        let infos = current.results.into_iter().flatten();
        for ((&parameter, &value), info) in targets.iter().zip(infos) {
            if !info.contains(value) {
                return Err(ControlError::invalid(format!(
                    "target {value} for parameter {plugin}:{parameter} outside {}..={}",
                    info.min, info.max
                )));
            }
            start_values.insert(parameter, info.current);
        }

        let target = AutomationTarget::ParameterSet {
            plugin_id: plugin,
            parameter_ids: targets.keys().copied().collect(),
        };
        let reg = self
            .register(target, ProcessKind::Morph, duration_ms, None, steps)
            .await?;
        let started = StartedMorph {
            morph_id: reg.id,
            plugin_id: plugin,
            duration_ms,
            steps,
            start_values: start_values.clone(),
            targets: targets.clone(),
            overlapping: reg.overlapping.clone(),
        };

        let plan: Vec<(ParameterId, f64, f64)> = targets
            .iter()
            .map(|(p, end)| (*p, start_values[p], *end))
            .collect();
        let this = self.clone();
        self.tracker.spawn(async move {
            this.drive_morph(reg, plugin, plan, steps).await;
        });
        info!(
            "Started morph {} on plugin {plugin} ({} parameter(s), {duration_ms}ms)",
            started.morph_id,
            started.targets.len()
        );
        Ok(started)
    }

    async fn apply_values(
        &self,
        description: &str,
        plugin: PluginId,
        values: impl Iterator<Item = (ParameterId, f64)>,
    ) -> Result<(), String> {
        let ops = values
            .map(|(p, v)| {
                engine_op(format!("set parameter {plugin}:{p}"), &self.engine, move |e| {
                    e.set_parameter(plugin, p, v)
                })
            })
            .collect();
        let outcome = self.batch.run_batch(description, ops).await;
        if outcome.warnings.is_empty() {
            Ok(())
        } else {
            Err(outcome.warnings.join("; "))
        }
    }

    async fn drive_morph(
        &self,
        reg: Registration,
        plugin: PluginId,
        plan: Vec<(ParameterId, f64, f64)>,
        steps: usize,
    ) {
        self.mark_running(&reg);
        for step in 0..steps {
            if reg.cancel.is_cancelled() {
                return self.conclude(&reg, ProcessState::Cancelled, None);
            }
            let progress = step as f64 / steps as f64;
            let values = plan
                .iter()
                .map(|&(p, start, end)| (p, start + (end - start) * progress));
            let description = format!("morph {} step {step}", reg.id);
            if let Err(msg) = self.apply_values(&description, plugin, values).await {
                return self.conclude(&reg, ProcessState::Error, Some(msg));
            }
            self.record_step(reg.id, step + 1, None);

            tokio::select! {
                _ = reg.cancel.cancelled() => {
                    return self.conclude(&reg, ProcessState::Cancelled, None);
                }
                _ = tokio::time::sleep(self.resolution) => {}
            }
        }

        let description = format!("morph {} final values", reg.id);
        let finals = plan.iter().map(|&(p, _, end)| (p, end));
        match self.apply_values(&description, plugin, finals).await {
            Ok(()) => self.conclude(&reg, ProcessState::Completed, None),
            Err(msg) => {
                warn!("Morph {} could not write final values", reg.id);
                self.conclude(&reg, ProcessState::Error, Some(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::engine::tests::setup;
    use crate::engine::AudioEngine;
    use std::time::Duration;

    #[tokio::test]
    async fn set_parameter_validates_range() {
        let (engine, automation, plugin) = setup().await;
        let change = automation.set_parameter(plugin, 0, 0.25).await.unwrap();
        assert_eq!(change.old_value, 0.0);
        assert_eq!(engine.get_parameter(plugin, 0).unwrap(), 0.25);

        let err = automation.set_parameter(plugin, 0, 1.5).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        let err = automation.set_parameter(plugin, 9, 0.5).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(engine.set_call_count(), 1);
    }

    #[tokio::test]
    async fn randomize_skips_excluded_and_fixed_parameters() {
        let (engine, automation, plugin) = setup().await;
        let report = automation.randomize(plugin, 1.0, &[2]).await.unwrap();
        assert_eq!(report.randomized, 1);
        assert_eq!(report.parameters[0].parameter_id, 0);
        assert!(engine.set_history(plugin, 1).is_empty());
        assert!(engine.set_history(plugin, 2).is_empty());
    }

    #[tokio::test]
    async fn zero_amount_keeps_current_values() {
        let (engine, automation, plugin) = setup().await;
        let report = automation.randomize(plugin, 0.0, &[]).await.unwrap();
        assert_eq!(report.randomized, 2);
        assert_eq!(engine.set_history(plugin, 2), vec![0.5]);

        let err = automation.randomize(plugin, 1.5, &[]).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn morph_ends_on_exact_targets() {
        let (engine, automation, plugin) = setup().await;
        let targets = BTreeMap::from([(0, 0.8), (2, 0.1)]);
        let started = automation.morph(plugin, targets, 50).await.unwrap();
        assert_eq!(started.start_values, BTreeMap::from([(0, 0.0), (2, 0.5)]));

        let done = automation.wait_automation(started.morph_id).await.unwrap();
        assert_eq!(done.state, ProcessState::Completed);
        assert_eq!(done.kind, ProcessKind::Morph);
        assert_eq!(engine.get_parameter(plugin, 0).unwrap(), 0.8);
        assert_eq!(engine.get_parameter(plugin, 2).unwrap(), 0.1);
        assert_eq!(engine.set_history(plugin, 0).len(), started.steps + 1);
    }

    #[tokio::test]
    async fn morph_rejects_out_of_range_targets() {
        let (engine, automation, plugin) = setup().await;
        let targets = BTreeMap::from([(0, 0.5), (2, 7.0)]);
        let err = automation.morph(plugin, targets, 50).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(automation.list_automations().await.unwrap().is_empty());
        assert_eq!(engine.set_call_count(), 0);
    }

    #[tokio::test]
    async fn stopped_morph_writes_nothing_more() {
        let (engine, automation, plugin) = setup().await;
        let targets = BTreeMap::from([(0, 1.0), (2, 0.0)]);
        let started = automation.morph(plugin, targets, 5000).await.unwrap();
        while engine.set_history(plugin, 0).len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stopped = automation.stop_automation(started.morph_id).await.unwrap();
        assert_eq!(stopped.state, ProcessState::Cancelled);
        let writes = engine.set_call_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.set_call_count(), writes);
        assert!(engine.get_parameter(plugin, 0).unwrap() < 1.0);
    }
}
