use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{METADATA_FILE, PluginState, SessionStateStore, Snapshot, SnapshotSummary, io_failure};
use crate::bridge::BlockingOperation;
use crate::error::{ControlError, ControlResult};
use crate::owner::{engine_op, found};

#[derive(Debug, Clone, Serialize)]
pub struct Captured {
    pub snapshot: Snapshot,
    /// Plugins whose state could not be read and are missing from the
    /// snapshot.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: Uuid,
    pub session_id: Uuid,
    pub parameters_restored: usize,
    pub plugins_restored: usize,
    pub warnings: Vec<String>,
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

enum RestoreStep {
    Parameter,
    Runtime,
}

impl SessionStateStore {
    fn snapshot_dir(&self, id: Uuid) -> PathBuf {
        self.snapshot_root.join(id.to_string())
    }

    /// Save the project into a new snapshot directory and record every
    /// plugin's parameters and runtime flags next to it.
    pub async fn capture(&self, session_id: Option<Uuid>, name: &str) -> ControlResult<Captured> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::invalid("snapshot name must not be empty"));
        }
        let session = self
            .tables
            .call(move |t| match session_id {
                Some(id) => t.sessions.get(&id).cloned().ok_or_else(|| ControlError::not_found("session", id)),
                None => t
                    .active
                    .and_then(|id| t.sessions.get(&id).cloned())
                    .ok_or_else(|| ControlError::invalid("no active session; load or save a session first")),
            })
            .await??;

        let id = Uuid::new_v4();
        let dir = self.snapshot_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_failure(format!("create {}", dir.display()), e))?;
        let written = self.write_snapshot(id, name, session.id, &dir).await;
        let (snapshot, warnings) = match written {
            Ok(written) => written,
            Err(err) => {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!("Could not remove incomplete snapshot {}: {e}", dir.display());
                }
                return Err(err);
            }
        };

        info!(
            "Snapshot {id} `{name}` captured for session {} ({} plugin(s))",
            session.id,
            snapshot.plugins.len()
        );
        Ok(Captured {
            snapshot,
            warnings,
        })
    }

    /// Everything after the snapshot directory exists: project file, plugin
    /// reads, metadata and the table entry.
    async fn write_snapshot(
        &self,
        id: Uuid,
        name: &str,
        session_id: Uuid,
        dir: &Path,
    ) -> ControlResult<(Snapshot, Vec<String>)> {
        let project_path = dir.join(format!("{}.project", file_stem(name)));
        self.save_project(&project_path).await?;

        let plugins = self.catalog.list().await?;
        let reads = plugins
            .iter()
            .map(|entry| {
                let (plugin, plugin_name) = (entry.info.id, entry.info.name.clone());
                engine_op(format!("read state of plugin {plugin}"), &self.engine, move |e| {
                    let count = e.get_parameter_count(plugin)?;
                    let parameters = (0..count)
                        .map(|p| e.get_parameter(plugin, p).map(|v| (p, v)))
                        .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
                    let runtime = e.get_runtime_state(plugin)?;
                    Ok(PluginState {
                        plugin_id: plugin,
                        name: plugin_name,
                        active: runtime.active,
                        volume: runtime.volume,
                        drywet: runtime.drywet,
                        parameters,
                    })
                })
            })
            .collect();
        let outcome = self.batch.run_batch("capture plugin states", reads).await;

        let snapshot = Snapshot {
            id,
            name: name.to_string(),
            session_id,
            created_at: Utc::now(),
            project_path,
            plugins: outcome.results.into_iter().flatten().collect(),
        };
        let metadata = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| io_failure("serialize snapshot metadata", e))?;
        let metadata_path = dir.join(METADATA_FILE);
        tokio::fs::write(&metadata_path, metadata)
            .await
            .map_err(|e| io_failure(format!("write {}", metadata_path.display()), e))?;

        let stored = snapshot.clone();
        self.tables
            .call(move |t| {
                t.snapshots.insert(stored.id, stored);
            })
            .await?;
        Ok((snapshot, outcome.warnings))
    }

    /// Load the snapshot's project and re-apply its values. Individual write
    /// failures are collected as warnings.
    pub async fn restore(&self, snapshot_id: Uuid) -> ControlResult<RestoreReport> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let mut warnings = self.load_project(&snapshot.project_path).await?;

        let mut kinds = Vec::new();
        let mut ops: Vec<BlockingOperation<()>> = Vec::new();
        for state in &snapshot.plugins {
            let plugin = state.plugin_id;
            for (&parameter, &value) in &state.parameters {
                kinds.push(RestoreStep::Parameter);
                ops.push(engine_op(
                    format!("restore parameter {plugin}:{parameter}"),
                    &self.engine,
                    move |e| e.set_parameter(plugin, parameter, value),
                ));
            }
            let (active, volume, drywet) = (state.active, state.volume, state.drywet);
            kinds.push(RestoreStep::Runtime);
            ops.push(engine_op(
                format!("restore runtime state of plugin {plugin}"),
                &self.engine,
                move |e| {
                    e.set_active(plugin, active)?;
                    e.set_volume(plugin, volume)?;
                    e.set_drywet(plugin, drywet)
                },
            ));
        }
        let outcome = self.batch.run_batch("restore snapshot", ops).await;

        let (mut parameters_restored, mut plugins_restored) = (0, 0);
        for (kind, slot) in kinds.iter().zip(&outcome.results) {
            match (kind, slot) {
                (RestoreStep::Parameter, Some(())) => parameters_restored += 1,
                (RestoreStep::Runtime, Some(())) => plugins_restored += 1,
                _ => {}
            }
        }
        warnings.extend(outcome.warnings);

        let session_id = snapshot.session_id;
        self.tables
            .call(move |t| {
                if t.sessions.contains_key(&session_id) {
                    t.active = Some(session_id);
                }
            })
            .await?;
        if warnings.is_empty() {
            info!("Snapshot {snapshot_id} restored");
        } else {
            warn!(
                "Snapshot {snapshot_id} restored with {} warning(s)",
                warnings.len()
            );
        }
        Ok(RestoreReport {
            snapshot_id,
            session_id,
            parameters_restored,
            plugins_restored,
            warnings,
        })
    }

    /// Forget the snapshot and remove its directory.
    pub async fn delete_snapshot(&self, id: Uuid) -> ControlResult<SnapshotSummary> {
        let removed = self.tables.call(move |t| t.snapshots.remove(&id)).await?;
        let snapshot = found(removed, "snapshot", id)?;
        let dir = self.snapshot_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Snapshot directory {} was already gone", dir.display());
            }
            Err(e) => return Err(io_failure(format!("remove {}", dir.display()), e)),
        }
        info!("Snapshot {id} deleted");
        Ok(snapshot.summary())
    }

    /// Register every snapshot found under the snapshot root. Directories
    /// without readable metadata are skipped.
    pub async fn load_snapshots_from_dir(&self) -> ControlResult<usize> {
        let root = self.snapshot_root.clone();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_failure(format!("read {}", root.display()), e)),
        };

        let mut loaded = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_failure(format!("read {}", root.display()), e))?
        {
            let metadata_path = entry.path().join(METADATA_FILE);
            let raw = match tokio::fs::read(&metadata_path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_slice::<Snapshot>(&raw) {
                Ok(snapshot) => loaded.push(snapshot),
                Err(e) => warn!("Skipping {}: {e}", metadata_path.display()),
            }
        }

        let count = loaded.len();
        self.tables
            .call(move |t| {
                for snapshot in loaded {
                    t.snapshots.insert(snapshot.id, snapshot);
                }
            })
            .await?;
        info!("Loaded {count} snapshot(s) from {}", root.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;
    use crate::engine::AudioEngine;

    #[tokio::test]
    async fn capture_requires_an_active_session() {
        let fx = fixture().await;
        let err = fx.store.capture(None, "first").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        let err = fx.store.capture(Some(Uuid::new_v4()), "first").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn refused_project_save_leaves_no_snapshot_behind() {
        let fx = fixture().await;
        fx.store
            .save_session(Some(fx.dir.path().join("set.project")))
            .await
            .unwrap();
        fx.engine.refuse_saves(true);

        let err = fx.store.capture(None, "broken").await.unwrap_err();
        assert_eq!(err.kind(), "operation_failure");
        let leftovers = std::fs::read_dir(fx.store.snapshot_root()).unwrap().count();
        assert_eq!(leftovers, 0);
        assert!(fx.store.list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_brings_back_parameters_and_flags() {
        let fx = fixture().await;
        fx.store
            .save_session(Some(fx.dir.path().join("set.project")))
            .await
            .unwrap();
        fx.engine.set_parameter(fx.plugin, 0, 0.3).unwrap();
        fx.engine.set_parameter(fx.plugin, 1, 0.7).unwrap();
        fx.engine.set_volume(fx.plugin, 0.5).unwrap();

        let captured = fx.store.capture(None, "verse A").await.unwrap();
        assert!(captured.warnings.is_empty());
        let snapshot = captured.snapshot;
        assert!(snapshot.project_path.ends_with("verse_A.project"));
        assert_eq!(
            snapshot.plugin(fx.plugin).unwrap().parameters,
            BTreeMap::from([(0, 0.3), (1, 0.7)])
        );

        fx.engine.set_parameter(fx.plugin, 0, 0.9).unwrap();
        fx.engine.set_parameter(fx.plugin, 1, 0.1).unwrap();
        fx.engine.set_volume(fx.plugin, 1.0).unwrap();

        let report = fx.store.restore(snapshot.id).await.unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.parameters_restored, 2);
        assert_eq!(report.plugins_restored, 1);
        assert_eq!(fx.engine.get_parameter(fx.plugin, 0).unwrap(), 0.3);
        assert_eq!(fx.engine.get_parameter(fx.plugin, 1).unwrap(), 0.7);
        assert_eq!(fx.engine.get_runtime_state(fx.plugin).unwrap().volume, 0.5);
    }

    #[tokio::test]
    async fn failed_writes_become_warnings() {
        let fx = fixture().await;
        fx.store
            .save_session(Some(fx.dir.path().join("set.project")))
            .await
            .unwrap();
        let snapshot = fx.store.capture(None, "base").await.unwrap().snapshot;
        fx.engine.fail_parameter(fx.plugin, 1);

        let report = fx.store.restore(snapshot.id).await.unwrap();
        assert_eq!(report.parameters_restored, 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_files_and_restore_fails() {
        let fx = fixture().await;
        fx.store
            .save_session(Some(fx.dir.path().join("set.project")))
            .await
            .unwrap();
        let snapshot = fx.store.capture(None, "gone").await.unwrap().snapshot;
        let dir = fx.store.snapshot_root().join(snapshot.id.to_string());
        assert!(dir.join(METADATA_FILE).exists());

        fx.store.delete_snapshot(snapshot.id).await.unwrap();
        assert!(!dir.exists());
        let err = fx.store.restore(snapshot.id).await.unwrap_err();
        assert_eq!(err, ControlError::not_found("snapshot", snapshot.id));
    }

    #[tokio::test]
    async fn snapshots_are_reloaded_from_disk() {
        let fx = fixture().await;
        fx.store
            .save_session(Some(fx.dir.path().join("set.project")))
            .await
            .unwrap();
        let snapshot = fx.store.capture(None, "kept").await.unwrap().snapshot;
        tokio::fs::create_dir_all(fx.store.snapshot_root().join("stray"))
            .await
            .unwrap();

        let second = super::super::tests::fixture_at(&fx).await;
        assert_eq!(second.load_snapshots_from_dir().await.unwrap(), 1);
        assert_eq!(second.get_snapshot(snapshot.id).await.unwrap(), snapshot);
    }
}
