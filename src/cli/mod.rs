use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod init;
pub mod run;

use config::ConfigArgs;
use run::RunArgs;

use rackctl::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "rackctl",
    about = "Control plane for a blocking audio-plugin engine",
    version = "0.1.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve JSON tool requests on stdin/stdout
    Run(RunArgs),

    /// Initialize a fresh layout
    Init,

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self {
            root,
            config_manager,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Init => init::execute(context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
