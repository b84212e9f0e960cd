// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Bridge CLI
//!
//! # Usage
//!
//! ```bash
//! # Generate an example configuration
//! telemetry-bridge gen-config --output bridge.yaml
//!
//! # Validate a configuration file
//! telemetry-bridge validate --config bridge.yaml
//!
//! # Run the bridge
//! telemetry-bridge run --config bridge.yaml --log-level debug
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::config::{ExtractorConfig, TOKEN_ENV_VAR};
use telemetry_bridge::{
    BridgeConfig, BridgeError, FileDeadLetterSink, InfluxStore, MqttConnector, Pipeline,
    StatsSnapshot,
};
use tracing_subscriber::EnvFilter;

/// MQTT to InfluxDB telemetry bridge
#[derive(Parser, Debug)]
#[command(name = "telemetry-bridge")]
#[command(about = "Telemetry Bridge - MQTT sensor topics into InfluxDB v2")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error); overrides the file
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "bridge.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run { config, log_level } => cmd_run(config, log_level).await,
        Commands::Validate { config } => cmd_validate(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn cmd_run(config_path: PathBuf, log_level: Option<String>) -> anyhow::Result<()> {
    let config = BridgeConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(log_level.as_deref().unwrap_or(&config.log_level));

    tracing::info!(
        "Telemetry Bridge v{} ({}:{} -> {} bucket '{}')",
        env!("CARGO_PKG_VERSION"),
        config.broker.host,
        config.broker.port,
        config.influxdb.url,
        config.influxdb.bucket
    );

    let store = InfluxStore::new(&config.influxdb)?;
    let mut handle = Pipeline::start(
        &config,
        Arc::new(MqttConnector::new(config.broker.clone())),
        Arc::new(store),
        Arc::new(FileDeadLetterSink::new(&config.dead_letter.path)),
    )?;

    // Stats reporting task
    let stats_task = if config.stats_interval_secs > 0 {
        let stats = handle.stats_source();
        let every = Duration::from_secs(config.stats_interval_secs);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                log_stats(&stats.snapshot());
            }
        }))
    } else {
        None
    };

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            tracing::info!("Shutdown requested");
            None
        }
        Some(condition) = handle.fatal() => {
            tracing::error!("Fatal: {}", condition);
            Some(condition)
        }
    };

    if let Some(task) = stats_task {
        task.abort();
    }

    let result = handle.shutdown(config.shutdown_timeout()).await;
    match &result {
        Ok(report) => {
            tracing::info!("Final statistics (shutdown took {:?})", report.elapsed);
            log_stats(&report.stats);
        }
        Err(e) => tracing::error!("{}", e),
    }

    if let Some(condition) = fatal {
        return Err(BridgeError::from(condition).into());
    }
    result.map(|_| ()).map_err(Into::into)
}

fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match BridgeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker:   {}:{} (qos {})", config.broker.host, config.broker.port, config.broker.qos);
            println!("InfluxDB: {} org '{}' bucket '{}'", config.influxdb.url, config.influxdb.org, config.influxdb.bucket);
            if config.influxdb.token.is_empty() {
                println!("          (no token; set {} or influxdb.token)", TOKEN_ENV_VAR);
            }
            println!("Topics:   {}", config.topics.len());
            for (i, rule) in config.topics.iter().enumerate() {
                let names: Vec<&str> = rule.measurements.iter().map(|m| m.name.as_str()).collect();
                let kind = match rule.extractor {
                    ExtractorConfig::Scalar { .. } => "scalar",
                    ExtractorConfig::Json { .. } => "json",
                };
                println!("  [{}] {} -> {} ({})", i, rule.topic, names.join(", "), kind);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&BridgeConfig::example())?;

    let content = format!(
        r#"# Telemetry Bridge Configuration
# Generated by telemetry-bridge gen-config
#
# The InfluxDB token can be supplied through the {} environment variable.

{}"#,
        TOKEN_ENV_VAR, yaml
    );

    std::fs::write(&output, content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn log_stats(stats: &StatsSnapshot) {
    tracing::info!(
        "{} msgs ({:.1} msg/s), {} points written in {} batches, {} retries, {} dead-lettered, \
         {} no-rule, {} malformed, {} overflow, {} evicted, {} in flight, {} reconnects",
        stats.messages_received,
        stats.messages_per_second(),
        stats.points_written,
        stats.batches_written,
        stats.write_retries,
        stats.points_dead_lettered,
        stats.no_rule,
        stats.malformed,
        stats.queue_overflow,
        stats.queue_evicted,
        stats.points_in_flight(),
        stats.connections.saturating_sub(1)
    );
}
