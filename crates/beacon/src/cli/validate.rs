use anyhow::{Context, Result};
use clap::Parser;
use console::style;

use beacon_core::config::BeaconConfig;

/// Check a configuration file.
#[derive(Parser)]
pub struct ValidateCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "beacon.toml")]
    pub config: String,
}

impl ValidateCommand {
    /// Execute the validate command.
    pub fn execute(self) -> Result<()> {
        let config = load(&self.config)?;

        println!(
            "  {} {} is valid",
            style("✔").green().bold(),
            style(&self.config).cyan()
        );
        println!(
            "    service {} on {}:{}, check {} (ttl {}s, deregister after {}s)",
            style(&config.service.name).bold(),
            config.service.address,
            config.service.port,
            config.check.id,
            config.check.ttl_secs,
            config.check.deregister_after_secs
        );
        println!(
            "    watching {} via {}",
            style(config.watch_service()).bold(),
            config.discovery.address
        );
        Ok(())
    }
}

/// Load and validate a configuration file.
pub(crate) fn load(path: &str) -> Result<BeaconConfig> {
    if !std::path::Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }

    let config = BeaconConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path))?;
    Ok(config)
}
