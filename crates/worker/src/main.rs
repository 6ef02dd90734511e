// Warden CLI
//
// Design Decision: Use clap derive for argument parsing, as a single binary with subcommands.
// Design Decision: Runs execute in-process on the in-memory durable store; stdout carries JSON only.

mod commands;
mod telemetry;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - run security automation workflows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow definition and print its execution order
    Validate {
        /// YAML or JSON definition
        file: PathBuf,
    },

    /// Run a workflow definition to completion
    Run {
        /// YAML or JSON definition
        file: PathBuf,

        /// Trigger payload as JSON
        #[arg(long)]
        trigger: Option<String>,

        /// Workflow inputs as JSON
        #[arg(long)]
        inputs: Option<String>,

        /// Role used to resolve secrets
        #[arg(long, env = "WARDEN_ROLE")]
        role: Option<String>,

        /// YAML/JSON file with `secrets` and optional `grants`
        #[arg(long, env = "WARDEN_SECRETS_FILE")]
        secrets: Option<PathBuf>,
    },

    /// List built-in actions
    Actions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();
    telemetry::init_telemetry();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { file } => commands::validate(&file),
        Commands::Run {
            file,
            trigger,
            inputs,
            role,
            secrets,
        } => {
            commands::run(commands::RunArgs {
                file: &file,
                trigger: trigger.as_deref(),
                inputs: inputs.as_deref(),
                role,
                secrets: secrets.as_deref(),
            })
            .await
        }
        Commands::Actions => commands::actions(),
    }
}
