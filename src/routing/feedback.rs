use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::{RoutingConnection, RoutingGraph, adjacency, detect_cycles};
use crate::engine::{AudioPeaks, PluginId};
use crate::error::{ControlError, ControlResult};
use crate::owner::engine_op;

const HIGH_RISK_PEAK: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackPoint {
    pub plugin_id: PluginId,
    pub peak: f64,
    pub risk: Risk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskyConnection {
    pub connection_id: Uuid,
    pub source_plugin: PluginId,
    pub destination_plugin: PluginId,
    pub source_peak: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReport {
    pub sensitivity: f64,
    pub cycles_detected: bool,
    pub cycle_members: Vec<PluginId>,
    pub feedback_points: Vec<FeedbackPoint>,
    pub risky_connections: Vec<RiskyConnection>,
    pub warnings: Vec<String>,
}

impl FeedbackReport {
    pub fn feedback_detected(&self) -> bool {
        !self.feedback_points.is_empty()
    }
}

impl RoutingGraph {
    /// Combine the structural cycle check with measured output peaks. A cycle
    /// member only counts as a feedback point when its average output peak
    /// exceeds `sensitivity`.
    pub async fn detect_feedback(&self, sensitivity: Option<f64>) -> ControlResult<FeedbackReport> {
        let sensitivity = sensitivity.unwrap_or(self.default_sensitivity);
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(ControlError::invalid(format!(
                "sensitivity {sensitivity} must be a finite, non-negative number"
            )));
        }

        let connections = self.connections().await?;
        let report = detect_cycles(&adjacency(connections.iter().map(RoutingConnection::edge)));

        let plugins: BTreeSet<PluginId> = connections
            .iter()
            .flat_map(|c| [c.source.plugin_id, c.destination.plugin_id])
            .collect();
        let ops = plugins
            .iter()
            .map(|&id| {
                engine_op(format!("read peaks of plugin {id}"), &self.engine, move |e| {
                    e.get_audio_peaks(id)
                })
            })
            .collect();
        let outcome = self.batch.run_batch("read audio peaks", ops).await;
        let peaks: BTreeMap<PluginId, AudioPeaks> = plugins
            .iter()
            .copied()
            .zip(outcome.results)
            .filter_map(|(id, peaks)| peaks.map(|p| (id, p)))
            .collect();

        let feedback_points: Vec<FeedbackPoint> = report
            .members
            .iter()
            .filter_map(|id| {
                let peak = peaks.get(id)?.output_average();
                (peak > sensitivity).then(|| FeedbackPoint {
                    plugin_id: *id,
                    peak,
                    risk: if peak > HIGH_RISK_PEAK {
                        Risk::High
                    } else {
                        Risk::Medium
                    },
                })
            })
            .collect();

        let risky_connections = connections
            .iter()
            .filter_map(|c| {
                let peak = peaks.get(&c.source.plugin_id)?.output_max();
                (peak > sensitivity).then(|| RiskyConnection {
                    connection_id: c.id,
                    source_plugin: c.source.plugin_id,
                    destination_plugin: c.destination.plugin_id,
                    source_peak: peak,
                })
            })
            .collect();

        if !feedback_points.is_empty() {
            warn!(
                "Feedback detected at {} plugin(s) with sensitivity {sensitivity}",
                feedback_points.len()
            );
        }
        Ok(FeedbackReport {
            sensitivity,
            cycles_detected: report.has_cycles(),
            cycle_members: report.members.into_iter().collect(),
            feedback_points,
            risky_connections,
            warnings: outcome.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::PortRef;
    use super::super::tests::setup;
    use super::*;

    fn port(plugin_id: PluginId) -> PortRef {
        PortRef { plugin_id, port: 0 }
    }

    fn loud(level: f64) -> AudioPeaks {
        AudioPeaks {
            out_left: level,
            out_right: level,
            ..AudioPeaks::default()
        }
    }

    #[tokio::test]
    async fn quiet_cycle_is_not_feedback() {
        let (engine, graph, ids) = setup(2).await;
        graph.connect(port(ids[0]), port(ids[1]), 1.0).await.unwrap();
        graph.connect(port(ids[1]), port(ids[0]), 1.0).await.unwrap();
        engine.set_peaks(ids[0], loud(0.2));

        let report = graph.detect_feedback(None).await.unwrap();
        assert!(report.cycles_detected);
        assert!(!report.feedback_detected());
        assert!(report.risky_connections.is_empty());
    }

    #[tokio::test]
    async fn loud_cycle_member_is_reported_with_risk() {
        let (engine, graph, ids) = setup(3).await;
        graph.connect(port(ids[0]), port(ids[1]), 1.0).await.unwrap();
        graph.connect(port(ids[1]), port(ids[0]), 1.0).await.unwrap();
        graph.connect(port(ids[1]), port(ids[2]), 1.0).await.unwrap();
        engine.set_peaks(ids[0], loud(0.95));
        engine.set_peaks(ids[1], loud(0.85));
        engine.set_peaks(ids[2], loud(0.99));

        let report = graph.detect_feedback(Some(0.8)).await.unwrap();
        assert_eq!(
            report.feedback_points,
            vec![
                FeedbackPoint {
                    plugin_id: ids[0],
                    peak: 0.95,
                    risk: Risk::High
                },
                FeedbackPoint {
                    plugin_id: ids[1],
                    peak: 0.85,
                    risk: Risk::Medium
                },
            ]
        );
        assert_eq!(report.risky_connections.len(), 3);
    }

    #[tokio::test]
    async fn loud_plugin_on_overlapping_loop_is_reported() {
        let (engine, graph, ids) = setup(4).await;
        for (from, to) in [(0, 1), (1, 2), (2, 0), (0, 3), (3, 1)] {
            graph.connect(port(ids[from]), port(ids[to]), 1.0).await.unwrap();
        }
        engine.set_peaks(ids[3], loud(0.95));

        let report = graph.detect_feedback(None).await.unwrap();
        assert_eq!(report.cycle_members, ids);
        assert_eq!(
            report.feedback_points,
            vec![FeedbackPoint {
                plugin_id: ids[3],
                peak: 0.95,
                risk: Risk::High
            }]
        );
    }

    #[tokio::test]
    async fn loud_acyclic_graph_only_flags_connections() {
        let (engine, graph, ids) = setup(2).await;
        graph.connect(port(ids[0]), port(ids[1]), 1.0).await.unwrap();
        engine.set_peaks(ids[0], loud(1.0));

        let report = graph.detect_feedback(None).await.unwrap();
        assert!(!report.cycles_detected);
        assert!(!report.feedback_detected());
        assert_eq!(report.risky_connections.len(), 1);
        assert!(graph.detect_feedback(Some(f64::NAN)).await.is_err());
    }
}
