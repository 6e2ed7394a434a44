use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Get { key } => {
            match context.config_manager.0.get(&key).await {
                Some(value) => println!("{key}={value}"),
                None => eprintln!("❌ {key} is not set."),
            }
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config updated."),
                Err(e) => eprintln!("❌ Config could not be updated: {e}"),
            }
            Ok(())
        }
        ConfigCommands::Del { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config deleted.");
            Ok(())
        }
    }
}
