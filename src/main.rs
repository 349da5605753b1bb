//! VibeMQ Relay - MQTT request/response relay
//!
//! Usage:
//!   vibemq-relay [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>              Configuration file path
//!   -b, --broker <ADDR>              Broker address (e.g. tcp://localhost:1883)
//!   -i, --client-id <ID>             Client identifier
//!   -t, --topic <FILTER>             Topic filter to answer
//!   --fixed-result-topic <TOPIC>     Send every response to one topic
//!   --no-reconnect                   Exit the session on link loss
//!   -l, --log-level                  Log level (error, warn, info, debug, trace)
//!   -h, --help                       Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq_relay::config::{Config, Override};
use vibemq_relay::manager::ConnectionManager;
use vibemq_relay::router::Router;
use vibemq_relay::transport::MqttTransport;

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

/// VibeMQ Relay - answers MQTT messages on derived result topics
#[derive(Parser, Debug)]
#[command(name = "vibemq-relay")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "MQTT request/response relay")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker address
    #[arg(short, long)]
    broker: Option<String>,

    /// Client identifier
    #[arg(short = 'i', long)]
    client_id: Option<String>,

    /// Topic filter to subscribe to
    #[arg(short, long)]
    topic: Option<String>,

    /// Publish every response to this topic instead of `<topic>/result`
    #[arg(long)]
    fixed_result_topic: Option<String>,

    /// Do not reconnect after the session drops
    #[arg(long)]
    no_reconnect: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI values that override file and environment
    fn overrides(&self) -> Vec<Override> {
        let mut overrides: Vec<Override> = Vec::new();
        if let Some(broker) = &self.broker {
            overrides.push(("broker.address", broker.clone().into()));
        }
        if let Some(client_id) = &self.client_id {
            overrides.push(("broker.client_id", client_id.clone().into()));
        }
        if let Some(topic) = &self.topic {
            overrides.push(("routing.subscribe", topic.clone().into()));
        }
        if let Some(fixed) = &self.fixed_result_topic {
            overrides.push(("routing.strategy", "fixed_topic".into()));
            overrides.push(("routing.fixed_topic", fixed.clone().into()));
        }
        if self.no_reconnect {
            overrides.push(("broker.auto_reconnect", false.into()));
        }
        overrides
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File, then VIBEMQ_RELAY__* environment, then CLI flags
    let config_path = args.config.clone().unwrap_or_default();
    let config = match Config::load_with_overrides(&config_path, args.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
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

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let Some(result_topic) = config.routing.result_topic() else {
        error!("routing.fixed_topic is required for the fixed_topic strategy");
        std::process::exit(1);
    };

    info!("Starting VibeMQ Relay");
    info!("  Broker: {}", config.broker.address);
    info!("  Client ID: {}", config.broker.client_id);
    info!("  Keep alive: {:?}", config.broker.keep_alive);
    info!("  Max packet size: {} bytes", config.broker.max_packet_size);
    info!(
        "  Auto reconnect: {}",
        if config.broker.auto_reconnect {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!(
        "  Subscribe: {} (qos={})",
        config.routing.subscribe, config.routing.subscribe_qos
    );
    info!(
        "  Responses: {} [{}] (qos={}, retain={})",
        result_topic, config.routing.strategy, config.routing.qos, config.routing.retain
    );

    let transport = match MqttTransport::new(&config.broker) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let manager = ConnectionManager::new(&config, transport);
    let router = Arc::new(
        Router::new(result_topic, manager.publisher())
            .with_qos(config.routing.qos, config.routing.retain),
    );

    if let Err(e) = manager.start(router.clone()).await {
        error!("{}", e);
        std::process::exit(1);
    }

    shutdown_signal().await;

    manager.shutdown(config.broker.shutdown_grace).await;
    info!("Router stats: {}", router.stats().snapshot());

    Ok(())
}
