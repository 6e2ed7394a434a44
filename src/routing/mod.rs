//! Plugin-to-plugin audio routing as seen by the control plane.
//!
//! The connection table is owned by a single task; graph snapshots and cycle
//! reports are derived from it on demand and never stored. A port pair is
//! reserved in the table before the engine is asked to connect it, so two
//! requests for the same pair never both reach the engine.

mod cycles;
mod feedback;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use cycles::{CycleReport, adjacency, detect_cycles};
pub use feedback::{FeedbackPoint, FeedbackReport, Risk, RiskyConnection};

use crate::bridge::{BatchBridge, BlockingBridge};
use crate::engine::{PluginId, SharedEngine};
use crate::error::{ControlError, ControlResult};
use crate::owner::{StateOwner, engine_op, found};
use crate::plugins::PluginCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub plugin_id: PluginId,
    #[serde(default)]
    pub port: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingConnection {
    pub id: Uuid,
    pub source: PortRef,
    pub destination: PortRef,
    pub gain: f64,
    pub created_at: DateTime<Utc>,
}

impl RoutingConnection {
    pub fn edge(&self) -> (PluginId, PluginId) {
        (self.source.plugin_id, self.destination.plugin_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Connected {
    pub connection: RoutingConnection,
    /// Plugins on a cycle after this connection was added, empty when the
    /// graph is still acyclic.
    pub cycle_members: Vec<PluginId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginRouting {
    pub plugin_id: PluginId,
    pub name: String,
    pub inputs: Vec<PluginId>,
    pub outputs: Vec<PluginId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingMatrix {
    pub connections: Vec<RoutingConnection>,
    pub plugins: Vec<PluginRouting>,
    pub back_edges: Vec<String>,
    pub cycle_members: Vec<PluginId>,
    pub has_cycles: bool,
}

fn check_gain(gain: f64) -> ControlResult<()> {
    if gain.is_finite() && gain >= 0.0 {
        Ok(())
    } else {
        Err(ControlError::invalid(format!("gain {gain} must be a finite, non-negative number")))
    }
}

#[derive(Debug, Default)]
struct RoutingTable {
    connections: Vec<RoutingConnection>,
    /// Pairs whose engine connect call is still in flight.
    pending: HashSet<(PortRef, PortRef)>,
}

impl RoutingTable {
    fn edges(&self) -> Vec<(PluginId, PluginId)> {
        self.connections.iter().map(RoutingConnection::edge).collect()
    }

    /// Claim `source -> destination` unless it is connected or being connected.
    fn reserve(&mut self, source: PortRef, destination: PortRef) -> bool {
        let connected = self
            .connections
            .iter()
            .any(|x| x.source == source && x.destination == destination);
        !connected && self.pending.insert((source, destination))
    }
}

#[derive(Debug, Clone)]
pub struct RoutingGraph {
    engine: SharedEngine,
    bridge: BlockingBridge,
    batch: BatchBridge,
    catalog: PluginCatalog,
    default_sensitivity: f64,
    table: StateOwner<RoutingTable>,
}

impl RoutingGraph {
    pub fn new(
        engine: SharedEngine,
        bridge: BlockingBridge,
        batch: BatchBridge,
        catalog: PluginCatalog,
        default_sensitivity: f64,
    ) -> Self {
        Self {
            engine,
            bridge,
            batch,
            catalog,
            default_sensitivity,
            table: StateOwner::spawn("routing", RoutingTable::default()),
        }
    }

    pub async fn connections(&self) -> ControlResult<Vec<RoutingConnection>> {
        self.table.call(|t| t.connections.clone()).await
    }

    pub async fn cycles(&self) -> ControlResult<CycleReport> {
        let edges = self.table.call(|t| t.edges()).await?;
        Ok(detect_cycles(&adjacency(edges)))
    }

    pub async fn connect(
        &self,
        source: PortRef,
        destination: PortRef,
        gain: f64,
    ) -> ControlResult<Connected> {
        check_gain(gain)?;
        self.catalog.require_plugin(source.plugin_id).await?;
        self.catalog.require_plugin(destination.plugin_id).await?;
        let reserved = self
            .table
            .call(move |t| t.reserve(source, destination))
            .await?;
        if !reserved {
            return Err(already_connected(source, destination));
        }

        let accepted = self
            .bridge
            .run(engine_op(
                format!(
                    "connect {}:{} -> {}:{}",
                    source.plugin_id, source.port, destination.plugin_id, destination.port
                ),
                &self.engine,
                move |e| {
                    e.connect_ports(
                        source.plugin_id,
                        source.port,
                        destination.plugin_id,
                        destination.port,
                    )
                },
            ))
            .await;
        let outcome = match accepted {
            Ok(true) => Ok(()),
            Ok(false) => Err(ControlError::OperationFailure {
                description: "connect".into(),
                message: format!(
                    "engine refused connection {}:{} -> {}:{}",
                    source.plugin_id, source.port, destination.plugin_id, destination.port
                ),
            }),
            Err(err) => Err(err),
        };

        let connection = RoutingConnection {
            id: Uuid::new_v4(),
            source,
            destination,
            gain,
            created_at: Utc::now(),
        };
        let inserted = outcome.is_ok().then(|| connection.clone());
        let edges = self
            .table
            .call(move |t| {
                t.pending.remove(&(source, destination));
                t.connections.extend(inserted);
                t.edges()
            })
            .await?;
        outcome?;

        let report = detect_cycles(&adjacency(edges));
        let cycle_members: Vec<PluginId> = report.members.into_iter().collect();
        if cycle_members.contains(&source.plugin_id) && cycle_members.contains(&destination.plugin_id) {
            warn!(
                "Connection {} closes a routing cycle through plugins {cycle_members:?}",
                connection.id
            );
        }
        info!(
            "Connected {}:{} -> {}:{} (gain {gain})",
            source.plugin_id, source.port, destination.plugin_id, destination.port
        );
        Ok(Connected {
            connection,
            cycle_members,
        })
    }

    pub async fn disconnect(&self, id: Uuid) -> ControlResult<RoutingConnection> {
        let existing = self
            .table
            .call(move |t| t.connections.iter().find(|x| x.id == id).cloned())
            .await?;
        let connection = found(existing, "connection", id)?;
        let (source, destination) = (connection.source, connection.destination);
        self.bridge
            .run(engine_op(format!("disconnect {id}"), &self.engine, move |e| {
                e.disconnect_ports(
                    source.plugin_id,
                    source.port,
                    destination.plugin_id,
                    destination.port,
                )
            }))
            .await?;
        let removed = self
            .table
            .call(move |t| {
                let index = t.connections.iter().position(|x| x.id == id)?;
                Some(t.connections.remove(index))
            })
            .await?;
        info!("Disconnected {id}");
        found(removed, "connection", id)
    }

    /// Gain is control-plane metadata; the engine is not involved.
    pub async fn set_connection_gain(&self, id: Uuid, gain: f64) -> ControlResult<RoutingConnection> {
        check_gain(gain)?;
        let updated = self
            .table
            .call(move |t| {
                let conn = t.connections.iter_mut().find(|x| x.id == id)?;
                conn.gain = gain;
                Some(conn.clone())
            })
            .await?;
        found(updated, "connection", id)
    }

    pub async fn routing_matrix(&self) -> ControlResult<RoutingMatrix> {
        let connections = self.connections().await?;
        let plugins = self.catalog.list().await?;
        let graph = adjacency(connections.iter().map(RoutingConnection::edge));
        let report = detect_cycles(&graph);

        let mut routing: BTreeMap<PluginId, PluginRouting> = plugins
            .into_iter()
            .map(|p| {
                (
                    p.info.id,
                    PluginRouting {
                        plugin_id: p.info.id,
                        name: p.info.name,
                        inputs: Vec::new(),
                        outputs: Vec::new(),
                    },
                )
            })
            .collect();
        for (from, to, _) in graph.all_edges() {
            if let Some(entry) = routing.get_mut(&from) {
                entry.outputs.push(to);
            }
            if let Some(entry) = routing.get_mut(&to) {
                entry.inputs.push(from);
            }
        }
        for entry in routing.values_mut() {
            entry.inputs.sort_unstable();
            entry.outputs.sort_unstable();
        }

        Ok(RoutingMatrix {
            connections,
            plugins: routing.into_values().collect(),
            back_edges: report
                .back_edges
                .iter()
                .map(|(a, b)| format!("{a} -> {b}"))
                .collect(),
            has_cycles: report.has_cycles(),
            cycle_members: report.members.into_iter().collect(),
        })
    }

    /// Forget all connections, e.g. after a project load replaced the graph.
    pub async fn clear(&self) -> ControlResult<usize> {
        self.table.call(|t| t.connections.drain(..).count()).await
    }
}

fn already_connected(source: PortRef, destination: PortRef) -> ControlError {
    ControlError::invalid(format!(
        "{}:{} is already connected to {}:{}",
        source.plugin_id, source.port, destination.plugin_id, destination.port
    ))
}
