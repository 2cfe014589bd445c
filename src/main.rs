use std::fs::File;
use std::io::Read as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};

mod config;
mod engine;
mod manager;
mod messages;
mod mqtt;

/// Debounced bed occupancy from a radar energy reading over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut file = File::open(&args.config)
        .with_context(|| format!("opening config file {}", args.config.display()))?;
    let mut config_contents = String::new();
    file.read_to_string(&mut config_contents)?;

    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing config file {}", args.config.display()))?;

    let engine_config = config.engine.clone().unwrap_or_default();
    engine_config.validate()?;

    let thresholds = engine_config.thresholds();
    if thresholds.vacant >= thresholds.occupied {
        warn!(
            "vacant_threshold ({}) is not below occupied_threshold ({}); occupancy will chatter",
            thresholds.vacant, thresholds.occupied
        );
    }

    info!("Connecting to MQTT broker at {}", config.mqtt.host);
    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);

    let engine = engine::PresenceEngine::new(engine::SystemClock::new(), mqtt_client.clone())
        .with_thresholds(thresholds)
        .with_debounce_durations(engine_config.debounce_durations())
        .with_reason_sink(Box::new(mqtt_client.clone()));

    let core = manager::Manager::new(
        engine,
        mqtt_client,
        eventloop,
        Duration::from_millis(engine_config.tick_interval_ms()),
    );
    core.run_loop().await?;

    Ok(())
}
