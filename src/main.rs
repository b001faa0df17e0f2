//! HarborMQ - MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   harbormq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: harbormq.toml)
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>  Maximum connections
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use harbormq::broker::{Broker, BrokerConfig};
use harbormq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// HarborMQ - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "harbormq")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "harbormq.toml")]
    config: PathBuf,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
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

    // CLI overrides RUST_LOG, which overrides the config file
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&file_config.log.level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut broker_config = BrokerConfig::from(&file_config);
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(max_connections) = args.max_connections {
        broker_config.max_connections = max_connections;
    }

    info!("Starting HarborMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!(
        "  Retries: every {:?}, at most {}",
        broker_config.retry_interval, broker_config.max_retries
    );
    match &broker_config.persistence {
        Some(p) => info!("  Persistence: enabled ({})", p.path.display()),
        None => info!("  Persistence: disabled"),
    }

    let broker = Broker::new(broker_config);
    broker.run().await?;

    Ok(())
}
