//! RadioMQ - MQTT to packet radio bridge
//!
//! Usage:
//!   radiomq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --broker <ADDR>       Broker address (default: localhost:1883)
//!   -t, --topic <FILTER>      Topic to forward (default: /controlling-drone)
//!   -q, --qos <N>             Subscription QoS (default: 1)
//!   -d, --destination <NODE>  Radio node to address (default: 1)
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use radiomq::bridge::{BridgeExit, BridgeSettings, MessageBridge};
use radiomq::config::{Config, RadioKind};
use radiomq::radio::{LogRadio, RadioTransport, UdpRadio};
use radiomq::session::MqttSession;
use radiomq::status::{LinkStatus, StatusCallback};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages, including frame hex dumps
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

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

/// RadioMQ - forward MQTT messages to a packet radio node
#[derive(Parser, Debug)]
#[command(name = "radiomq")]
#[command(author = "RadioMQ Contributors")]
#[command(version)]
#[command(about = "Forward MQTT messages to a packet radio node")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker address (host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Topic filter to subscribe to
    #[arg(short, long)]
    topic: Option<String>,

    /// Subscription QoS (0, 1, or 2)
    #[arg(short, long)]
    qos: Option<u8>,

    /// Radio node id that receives the frames
    #[arg(short, long)]
    destination: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Config file (or defaults plus RADIOMQ__* env overrides)
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // CLI args override file config
    if let Some(broker) = args.broker {
        config.broker.address = broker;
    }
    if let Some(topic) = args.topic {
        config.bridge.topic = topic;
    }
    if let Some(qos) = args.qos {
        config.bridge.qos = qos;
    }
    if let Some(destination) = args.destination {
        config.radio.destination = destination;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error installing log subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting RadioMQ bridge");
    info!("  Broker: {}", config.broker.address);
    info!("  Topic: {} (QoS {})", config.bridge.topic, config.bridge.qos);
    info!(
        "  Radio: {} transport, node {} -> {}",
        config.radio.transport, config.radio.node_id, config.radio.destination
    );
    info!(
        "  Reconnect: {} attempts, {}s apart",
        config.reconnect.attempts, config.reconnect.interval
    );

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            stopper.cancel();
        }
    });

    match config.radio.transport {
        RadioKind::Udp => run(&config, UdpRadio::new(), &cancel).await,
        RadioKind::Log => run(&config, LogRadio::new(), &cancel).await,
    }
}

async fn run<R: RadioTransport>(
    config: &Config,
    radio: R,
    cancel: &CancellationToken,
) -> ExitCode {
    let session = MqttSession::new(config.broker.connect_options());
    let mut bridge = MessageBridge::new(session, radio, BridgeSettings::from_config(config));

    // Stands in for the status LED
    let status: StatusCallback = Arc::new(|status: LinkStatus| {
        debug!("Link status: {:?}", status);
    });
    bridge.set_status_callback(status);

    let code = match bridge.serve(cancel).await {
        Ok(BridgeExit::Cancelled) => ExitCode::SUCCESS,
        Ok(BridgeExit::BrokerClosed) => {
            warn!("Broker stopped delivering messages");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    };

    bridge.shutdown().await;
    code
}
