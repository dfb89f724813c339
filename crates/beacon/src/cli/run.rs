use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beacon::Beacon;
use beacon_core::config::{BeaconConfig, ObservabilityConfig};

use super::validate;

/// Register this node and run until Ctrl-C.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "beacon.toml")]
    pub config: String,

    /// Port the local service listens on (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Service name to register under (overrides config).
    #[arg(long)]
    pub service_name: Option<String>,

    /// Enable development mode (verbose logging).
    #[arg(long)]
    pub dev: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let mut config = validate::load(&self.config)?;
        self.apply_overrides(&mut config);
        config.validate()?;

        init_tracing(&config.observability, self.dev);

        println!();
        println!(
            "  {}  {} v{}",
            style("📡").bold(),
            style("beacon").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();

        info!("Loaded configuration from {}", self.config);

        println!(
            "  {} Registering {} at {}",
            style("🔖").bold(),
            style(&config.service.name).cyan(),
            style(format!("{}:{}", config.service.address, config.service.port)).cyan()
        );
        println!(
            "  {} Discovery agent at {}",
            style("🧭").bold(),
            style(&config.discovery.address).cyan()
        );
        if self.dev {
            println!("  {} Development mode enabled", style("🔧").bold());
        }
        println!();

        let beacon = Beacon::builder()
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        // Blocks until shutdown
        beacon.run().await.map_err(|e| anyhow::anyhow!("{}", e))?;

        println!("\n  {} Goodbye!", style("👋").bold());

        Ok(())
    }

    fn apply_overrides(&self, config: &mut BeaconConfig) {
        if let Some(port) = self.port {
            config.service.port = port;
        }
        if let Some(name) = &self.service_name {
            config.service.name = name.clone();
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(observability: &ObservabilityConfig, dev: bool) {
    if !observability.logging_enabled {
        return;
    }

    let logging = &observability.logging;
    let default_level = if dev { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
