mod cli;

use std::time::Duration;
use std::{env, path::PathBuf};

use clap::Parser;
use cli::{Cli, CliContext, default_command, execute};
use rackctl::config::{ConfigManager, EnvConfigManager, WORKER_THREADS};

/// Resolve the rackctl root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("RACKCTL_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./rackctl")
    }
}

/// Engine calls, stdin and file i/o all share tokio's blocking pool.
fn blocking_pool_size() -> usize {
    let workers = env::var(WORKER_THREADS)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(16)
        .max(1);
    workers + 2
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let env_file = root.join("config").join(".env");
    let config_manager = ConfigManager(EnvConfigManager::new(env_file));
    let context = CliContext::new(root, config_manager);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(blocking_pool_size())
        .build()?;

    let command = cli.command.unwrap_or_else(default_command);
    let result = runtime.block_on(execute(&context, command));
    // engine calls abandoned by a timeout must not hold the process open
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
