use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use tripwire::config::{BreakerConfig, ManagerConfig};
use tripwire::logging::{init_logging, log_chaos_result, log_system_health};
use tripwire::resilience::{
    BreakerSettings, ChaosTestingConfig, CircuitBreakerFactory, CircuitBreakerTester, Preset,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the settings of the built-in presets
    Presets,
    /// Run simulated traffic through configured circuit breakers
    Simulate {
        /// Manager config file; defaults to a single HTTP breaker
        #[arg(long)]
        config: Option<PathBuf>,
        /// Requests per breaker
        #[arg(long, default_value = "100")]
        requests: u64,
        /// Probability that a simulated call fails
        #[arg(long, default_value = "0.5")]
        failure_rate: f64,
        /// Latency added to every simulated call
        #[arg(long, default_value = "0")]
        latency_ms: u64,
        /// Probability that a simulated call outlives the breaker timeout
        #[arg(long, default_value = "0")]
        timeout_rate: f64,
        /// Pause between calls
        #[arg(long, default_value = "0")]
        interval_ms: u64,
        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn preset_settings() -> BTreeMap<&'static str, BreakerSettings> {
    BTreeMap::from([
        (
            "http",
            BreakerSettings::from_options(&CircuitBreakerFactory::http_options::<serde_json::Value>()),
        ),
        (
            "database",
            BreakerSettings::from_options(
                &CircuitBreakerFactory::database_options::<serde_json::Value>(),
            ),
        ),
        (
            "external_api",
            BreakerSettings::from_options(
                &CircuitBreakerFactory::external_api_options::<serde_json::Value>(),
            ),
        ),
    ])
}

fn default_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.breakers.insert(
        "http".to_string(),
        BreakerConfig {
            preset: Preset::Http,
            settings: BreakerSettings::default(),
        },
    );
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Presets => {
            let output = serde_json::to_string_pretty(&preset_settings())?;
            println!("{}", output);
        }
        Commands::Simulate {
            config,
            requests,
            failure_rate,
            latency_ms,
            timeout_rate,
            interval_ms,
            seed,
        } => {
            let config = match config {
                Some(path) => ManagerConfig::from_file(&path)?,
                None => default_config(),
            };

            let chaos = ChaosTestingConfig {
                failure_rate,
                inject_failures: failure_rate > 0.0,
                latency_ms,
                inject_latency: latency_ms > 0,
                timeout_rate,
                inject_timeouts: timeout_rate > 0.0,
                request_interval_ms: interval_ms,
                seed,
            };

            let manager = config.build().await?;
            let mut results = Vec::new();

            for name in manager.names().await {
                let breaker = manager
                    .get_typed::<serde_json::Value>(&name)
                    .await
                    .with_context(|| format!("Circuit breaker {} is not registered", name))?;

                let tester = CircuitBreakerTester::new(breaker, chaos.clone());
                let result = tester
                    .run_test(requests)
                    .await
                    .with_context(|| format!("Simulation against {} failed", name))?;

                log_chaos_result(&result);
                results.push(result);
            }

            let health = manager.system_health().await;
            log_system_health(&health);

            let output = serde_json::json!({
                "results": results,
                "health": health,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);

            manager.destroy().await;
        }
    }

    Ok(())
}
