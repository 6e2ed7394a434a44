use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const CALL_TIMEOUT_MS: &str = "RACKCTL_CALL_TIMEOUT_MS";
pub const BATCH_SIZE: &str = "RACKCTL_BATCH_SIZE";
pub const BATCH_TIMEOUT_MS: &str = "RACKCTL_BATCH_TIMEOUT_MS";
pub const WORKER_THREADS: &str = "RACKCTL_WORKER_THREADS";
pub const SNAPSHOT_DIR: &str = "RACKCTL_SNAPSHOT_DIR";
pub const RECORD_INTERVAL_MS: &str = "RACKCTL_RECORD_INTERVAL_MS";
pub const FEEDBACK_SENSITIVITY: &str = "RACKCTL_FEEDBACK_SENSITIVITY";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment backed by a `.env` file. `set` and `del` write
/// through to the file so `rackctl config` changes survive restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("No .env at {}, using process environment only", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    lines.push(format!("{key}={value}"));
                    found = true;
                }
                _ => lines.push(line.to_string()),
            }
        }
        if !found {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if let Ok(content) = fs::read_to_string(&self.env_file) {
            let lines: Vec<&str> = content
                .lines()
                .filter(|line| match line.split_once('=') {
                    Some((k, _)) => k.trim() != key,
                    None => true,
                })
                .collect();

            let _ = fs::write(&self.env_file, lines.join("\n"));
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed runtime settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub call_timeout: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub worker_threads: usize,
    pub snapshot_dir: PathBuf,
    pub record_interval: Duration,
    pub feedback_sensitivity: f64,
}

impl ControlConfig {
    pub fn defaults(root: &Path) -> Self {
        Self {
            call_timeout: Duration::from_millis(30_000),
            batch_size: 20,
            batch_timeout: Duration::from_millis(30_000),
            worker_threads: 16,
            snapshot_dir: root.join("snapshots"),
            record_interval: Duration::from_millis(10),
            feedback_sensitivity: 0.8,
        }
    }

    pub async fn from_manager(config: &ConfigManager, root: &Path) -> Result<Self> {
        let defaults = Self::defaults(root);
        let worker_threads = setting(config, WORKER_THREADS, defaults.worker_threads).await?;
        if worker_threads == 0 {
            return Err(anyhow!("{WORKER_THREADS} must be at least 1"));
        }
        let feedback_sensitivity =
            setting(config, FEEDBACK_SENSITIVITY, defaults.feedback_sensitivity).await?;
        if !feedback_sensitivity.is_finite() || feedback_sensitivity < 0.0 {
            return Err(anyhow!(
                "{FEEDBACK_SENSITIVITY} must be a non-negative number"
            ));
        }
        let snapshot_dir = match config.0.get(SNAPSHOT_DIR).await {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => defaults.snapshot_dir,
        };

        Ok(Self {
            call_timeout: millis(config, CALL_TIMEOUT_MS, defaults.call_timeout).await?,
            batch_size: setting(config, BATCH_SIZE, defaults.batch_size).await?,
            batch_timeout: millis(config, BATCH_TIMEOUT_MS, defaults.batch_timeout).await?,
            worker_threads,
            snapshot_dir,
            record_interval: millis(config, RECORD_INTERVAL_MS, defaults.record_interval).await?,
            feedback_sensitivity,
        })
    }
}

async fn setting<T>(config: &ConfigManager, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match config.0.get(key).await {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("{key}={raw} is not valid")),
        None => Ok(default),
    }
}

async fn millis(config: &ConfigManager, key: &str, default: Duration) -> Result<Duration> {
    let ms = setting(config, key, default.as_millis() as u64).await?;
    Ok(Duration::from_millis(ms))
}
