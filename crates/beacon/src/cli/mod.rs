mod run;
mod validate;

pub use run::RunCommand;
pub use validate::ValidateCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// beacon - cluster membership over a discovery backend
#[derive(Parser)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Register this node and keep its membership alive until Ctrl-C.
    Run(RunCommand),

    /// Check a configuration file without contacting the backend.
    Validate(ValidateCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Validate(cmd) => cmd.execute(),
        }
    }
}
