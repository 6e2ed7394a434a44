//! Project sessions and parameter snapshots.
//!
//! A snapshot is a directory `<snapshot root>/<id>/` holding the engine's
//! project file and a `metadata.json` with per-plugin parameter maps and
//! runtime flags. Restoring loads the project and then re-applies the
//! captured values, since the engine does not persist runtime flags.

mod snapshot;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub use snapshot::{Captured, RestoreReport};

use crate::bridge::{BatchBridge, BlockingBridge};
use crate::engine::{ParameterId, PluginId, SharedEngine};
use crate::error::{ControlError, ControlResult};
use crate::owner::{StateOwner, engine_op, found};
use crate::plugins::PluginCatalog;
use crate::routing::RoutingGraph;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub plugin_id: PluginId,
    pub name: String,
    pub active: bool,
    pub volume: f64,
    pub drywet: f64,
    pub parameters: BTreeMap<ParameterId, f64>,
}

/// Immutable once written. Serialized as the snapshot's metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub name: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub project_path: PathBuf,
    pub plugins: Vec<PluginState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub id: Uuid,
    pub name: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub plugin_count: usize,
}

impl Snapshot {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            name: self.name.clone(),
            session_id: self.session_id,
            created_at: self.created_at,
            plugin_count: self.plugins.len(),
        }
    }

    pub fn plugin(&self, plugin: PluginId) -> Option<&PluginState> {
        self.plugins.iter().find(|p| p.plugin_id == plugin)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListing {
    pub active_session: Option<Uuid>,
    pub sessions: Vec<Session>,
    pub snapshots: Vec<SnapshotSummary>,
}

#[derive(Debug, Default)]
struct SessionTables {
    sessions: BTreeMap<Uuid, Session>,
    active: Option<Uuid>,
    snapshots: BTreeMap<Uuid, Snapshot>,
}

impl SessionTables {
    /// Register `path` as the active session, reusing the id of a session
    /// already known under the same path.
    fn activate(&mut self, path: PathBuf) -> Session {
        let existing = self.sessions.values().find(|s| s.path == path).map(|s| s.id);
        let session = Session {
            id: existing.unwrap_or_else(Uuid::new_v4),
            name: session_name(&path),
            path,
            loaded_at: Utc::now(),
        };
        self.active = Some(session.id);
        self.sessions.insert(session.id, session.clone());
        session
    }
}

fn session_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub(crate) fn io_failure(description: impl Into<String>, err: impl std::fmt::Display) -> ControlError {
    ControlError::OperationFailure {
        description: description.into(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SessionStateStore {
    engine: SharedEngine,
    bridge: BlockingBridge,
    batch: BatchBridge,
    catalog: PluginCatalog,
    routing: RoutingGraph,
    snapshot_root: PathBuf,
    tables: StateOwner<SessionTables>,
}

impl SessionStateStore {
    pub fn new(
        engine: SharedEngine,
        bridge: BlockingBridge,
        batch: BatchBridge,
        catalog: PluginCatalog,
        routing: RoutingGraph,
        snapshot_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            bridge,
            batch,
            catalog,
            routing,
            snapshot_root: snapshot_root.into(),
            tables: StateOwner::spawn("sessions", SessionTables::default()),
        }
    }

    pub fn snapshot_root(&self) -> &Path {
        &self.snapshot_root
    }

    /// Ask the engine to load a project and re-sync everything derived from
    /// the engine's plugin set. Returns refresh warnings.
    async fn load_project(&self, path: &Path) -> ControlResult<Vec<String>> {
        let target = path.to_path_buf();
        let loaded = self
            .bridge
            .run(engine_op(
                format!("load project {}", path.display()),
                &self.engine,
                move |e| e.load_project(&target),
            ))
            .await?;
        if !loaded {
            return Err(ControlError::not_found("project", path.display()));
        }
        let dropped = self.routing.clear().await?;
        if dropped > 0 {
            info!("Project load reset {dropped} routing connection(s)");
        }
        self.catalog.refresh().await
    }

    async fn save_project(&self, path: &Path) -> ControlResult<()> {
        let target = path.to_path_buf();
        let saved = self
            .bridge
            .run(engine_op(
                format!("save project {}", path.display()),
                &self.engine,
                move |e| e.save_project(&target),
            ))
            .await?;
        if saved {
            Ok(())
        } else {
            Err(io_failure(
                format!("save project {}", path.display()),
                "engine reported failure",
            ))
        }
    }

    pub async fn load_session(&self, path: impl AsRef<Path>) -> ControlResult<Session> {
        let path = path.as_ref().to_path_buf();
        self.load_project(&path).await?;
        let session = self.tables.call(move |t| t.activate(path)).await?;
        info!("Session {} loaded from {}", session.id, session.path.display());
        Ok(session)
    }

    /// Save the engine project. With a path, the saved file becomes the
    /// active session; without one, the active session's file is overwritten.
    pub async fn save_session(&self, path: Option<PathBuf>) -> ControlResult<Session> {
        let path = match path {
            Some(path) => path,
            None => {
                let active = self
                    .tables
                    .call(|t| t.active.and_then(|id| t.sessions.get(&id).cloned()))
                    .await?;
                active
                    .ok_or_else(|| ControlError::invalid("no active session to save"))?
                    .path
            }
        };
        self.save_project(&path).await?;
        let session = self.tables.call(move |t| t.activate(path)).await?;
        info!("Session {} saved to {}", session.id, session.path.display());
        Ok(session)
    }

    pub async fn active_session(&self) -> ControlResult<Option<Session>> {
        self.tables
            .call(|t| t.active.and_then(|id| t.sessions.get(&id).cloned()))
            .await
    }

    pub async fn list_sessions(&self) -> ControlResult<SessionListing> {
        self.tables
            .call(|t| SessionListing {
                active_session: t.active,
                sessions: t.sessions.values().cloned().collect(),
                snapshots: t.snapshots.values().map(Snapshot::summary).collect(),
            })
            .await
    }

    pub async fn list_snapshots(&self) -> ControlResult<Vec<SnapshotSummary>> {
        let mut all: Vec<SnapshotSummary> = self
            .tables
            .call(|t| t.snapshots.values().map(Snapshot::summary).collect())
            .await?;
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    pub async fn get_snapshot(&self, id: Uuid) -> ControlResult<Snapshot> {
        let snapshot = self.tables.call(move |t| t.snapshots.get(&id).cloned()).await?;
        found(snapshot, "snapshot", id)
    }
}
