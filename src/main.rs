//! Daemon entry point: load the config, connect to the broker, start the
//! model and keep publishing until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use instrument_bridge::clock::{Clock, SystemClock};
use instrument_bridge::commander::default_commander_factory;
use instrument_bridge::config::DriverConfig;
use instrument_bridge::model::Model;
use instrument_bridge::mqtt::{self, MqttObserver};
use instrument_bridge::observer::Observer;
use instrument_bridge::protocol::ProtocolRegistry;
use instrument_bridge::transport::{SerialTcpTransport, Transport};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Cadence at which dirty controls are flushed to the broker.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "instrument-bridge", about = "Bridge text-protocol instruments to MQTT")]
struct Args {
    /// Path to the YAML configuration.
    #[arg(long, default_value = "/etc/instrument-bridge.conf")]
    config: PathBuf,

    /// MQTT broker url.
    #[arg(long, default_value = "tcp://localhost:1883")]
    broker: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("can't load config {}", args.config.display()))?;
    let registry = ProtocolRegistry::with_builtin();
    let config = DriverConfig::parse(&text, &registry).context("can't parse config")?;

    let (observer, eventloop) =
        MqttObserver::connect(&args.broker).context("can't connect to broker")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport: Arc<dyn Transport> = Arc::new(SerialTcpTransport);
    let factory = default_commander_factory(transport, clock.clone());
    let observer_dyn: Arc<dyn Observer> = observer.clone();
    let model = Arc::new(Model::new(
        factory,
        registry,
        config,
        observer_dyn,
        clock,
    ));
    model.start().await.context("failed to start the driver")?;

    let mqtt_task = tokio::spawn(mqtt::run(model.clone(), observer.clone(), eventloop));
    let publisher = {
        let model = model.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            loop {
                ticker.tick().await;
                model.poll().await;
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    publisher.abort();
    mqtt_task.abort();
    model.stop().await;
    Ok(())
}
