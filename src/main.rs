//! VibeMQ Relay - MQTT-to-MQTT binding engine
//!
//! Usage:
//!   vibemq-relay [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: relay.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   --check                Validate the configuration and exit
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq_relay::config::{Config, Topology};
use vibemq_relay::{MetricsServer, Relay};

/// Capacity of the channel carrying broker notices to the relay
const NOTICE_QUEUE: usize = 4096;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// VibeMQ Relay - MQTT-to-MQTT binding engine
#[derive(Parser, Debug)]
#[command(name = "vibemq-relay")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "Routes MQTT messages between brokers through sandboxed transforms")]
struct Args {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Validate the configuration, print the resolved topology and exit
    #[arg(long)]
    check: bool,
}

fn print_topology(topology: &Topology) {
    println!("Brokers:");
    for broker in &topology.brokers {
        println!("  {} -> {}", broker.name, broker.url);
    }
    println!("Bindings:");
    for binding in &topology.bindings {
        let state = if binding.active { "active" } else { "inactive" };
        println!(
            "  {}: '{}' on [{}] -> '{}' on [{}] [{}]",
            binding.name,
            binding.from.topic,
            binding.from.brokers.join(", "),
            binding.to.topic,
            binding.to.brokers.join(", "),
            state
        );
    }
    for rejected in &topology.rejected {
        println!("  {}: rejected ({})", rejected.name, rejected.reason);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    if args.check {
        match file_config.resolve() {
            Ok(topology) => {
                print_topology(&topology);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {:?}", args.config);

    let metrics_config = file_config.metrics.clone();
    let relay = match Relay::new(file_config) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting VibeMQ Relay");
    info!("  Brokers: {}", relay.topology().brokers.len());
    info!(
        "  Bindings: {} ({} rejected)",
        relay.topology().bindings.len(),
        relay.topology().rejected.len()
    );

    if metrics_config.enabled {
        info!("  Metrics: enabled (http://{})", metrics_config.bind);
        let metrics_server = MetricsServer::new(
            relay.metrics().clone(),
            relay.bindings().clone(),
            metrics_config.bind,
        );
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let (notices_tx, notices_rx) = mpsc::channel(NOTICE_QUEUE);
    if let Err(e) = relay.connect_brokers(notices_tx).await {
        error!("{}", e);
        std::process::exit(1);
    }

    let signal_relay = relay.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            signal_relay.shutdown();
        }
    });

    if let Err(e) = relay.run(notices_rx).await {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
