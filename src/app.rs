use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::automation::AutomationEngine;
use crate::bridge::{BatchBridge, BlockingBridge};
use crate::config::ControlConfig;
use crate::engine::SharedEngine;
use crate::plugins::PluginCatalog;
use crate::router::ToolRouter;
use crate::routing::RoutingGraph;
use crate::session::SessionStateStore;

/// Wires the bridges and components around one engine.
pub struct App {
    config: ControlConfig,
    automation: Option<AutomationEngine>,
}

impl App {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            automation: None,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Builds every component, syncs the plugin catalog and re-registers
    /// snapshots found on disk. Returns the router that serves requests.
    pub async fn bootstrap(&mut self, engine: SharedEngine) -> Result<ToolRouter> {
        let config = &self.config;
        let bridge = BlockingBridge::new(config.call_timeout, config.worker_threads);
        let batch = BatchBridge::new(config.batch_size, config.batch_timeout, config.worker_threads);

        let catalog = PluginCatalog::new(engine.clone(), bridge.clone(), batch.clone());
        let warnings = catalog
            .refresh()
            .await
            .context("Failed to read the engine's plugin list")?;
        for warning in &warnings {
            warn!("Plugin refresh: {warning}");
        }

        let routing = RoutingGraph::new(
            engine.clone(),
            bridge.clone(),
            batch.clone(),
            catalog.clone(),
            config.feedback_sensitivity,
        );
        let automation = AutomationEngine::new(
            engine.clone(),
            bridge.clone(),
            batch.clone(),
            catalog.clone(),
            config.record_interval,
        );

        fs::create_dir_all(&config.snapshot_dir).with_context(|| {
            format!("failed to create {}", config.snapshot_dir.display())
        })?;
        let sessions = SessionStateStore::new(
            engine,
            bridge.clone(),
            batch,
            catalog.clone(),
            routing.clone(),
            config.snapshot_dir.clone(),
        );
        let restored = sessions
            .load_snapshots_from_dir()
            .await
            .context("Failed to load snapshots")?;
        info!(
            "Loaded {restored} snapshot(s) from {}",
            config.snapshot_dir.display()
        );

        self.automation = Some(automation.clone());
        Ok(ToolRouter::new(catalog, bridge, automation, routing, sessions))
    }

    /// Stops every automation and recording. Safe to call before bootstrap.
    pub async fn shutdown(&self) {
        if let Some(automation) = self.automation.as_ref() {
            automation.stop_all().await;
        }
    }
}

/// Called when the user runs `rackctl init`.
pub async fn cmd_init(root: &Path) -> Result<()> {
    for dir in ["config", "logs", "snapshots"] {
        let path = root.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }

    let conf_path = root.join("config/.env");
    if conf_path.exists() {
        println!("Skipping {}, already exists", conf_path.display());
    } else {
        fs::write(&conf_path, "")
            .with_context(|| format!("failed to write {}", conf_path.display()))?;
        println!("Created {}", conf_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn init_creates_layout_and_keeps_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).await.unwrap();
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("snapshots").is_dir());

        fs::write(dir.path().join("config/.env"), "RACKCTL_BATCH_SIZE=4").unwrap();
        cmd_init(dir.path()).await.unwrap();
        let env = fs::read_to_string(dir.path().join("config/.env")).unwrap();
        assert_eq!(env, "RACKCTL_BATCH_SIZE=4");
    }

    #[tokio::test]
    async fn bootstrap_serves_the_demo_rack() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = App::new(ControlConfig::defaults(dir.path()));
        let router = app
            .bootstrap(Arc::new(InMemoryEngine::with_demo_rack()))
            .await
            .unwrap();

        let listed = router.handle("list_plugins", json!({})).await;
        assert_eq!(listed["success"], json!(true));
        assert!(!listed["plugins"].as_array().unwrap().is_empty());

        app.shutdown().await;
        let refused = router
            .handle(
                "automate_parameter",
                json!({"plugin_id": 0, "parameter_id": 0, "automation_type": "linear", "duration_ms": 100}),
            )
            .await;
        assert_eq!(refused["success"], json!(false));
    }
}
