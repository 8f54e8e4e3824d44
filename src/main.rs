use p1meter::{config::Config, transport::{pump, ChannelSource, SystemClock}, P1Event, P1Reader, P1State, SensorRegistry};
use std::{env, error::Error, time::Duration};
use log::{error, info, warn};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    let default_filter = std::env::var("P1_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config_path = env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let mut sensors = SensorRegistry::new();
    for sensor in config.sensors.iter() {
        let name = sensor.name.clone();
        match sensors.register_sensor(&sensor.obis, move |value| info!("{}: {}", name, value)) {
            Ok(obis) => info!("Sensor {} on {} ({})", sensor.name, obis, obis.description().unwrap_or("unknown")),
            Err(e) => error!("Sensor {} not registered: {}", sensor.name, e),
        }
    }
    for sensor in config.text_sensors.iter() {
        let name = sensor.name.clone();
        sensors.register_text_sensor(&sensor.identifier, move |text| info!("{}: {}", name, text));
    }

    // the reader polls, the input task pushes chunks into this channel
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let input = match config.tcp.clone() {
        Some(address) => {
            info!("Reading telegrams from {}", address);
            let stream = TcpStream::connect(&address).await?;
            tokio::spawn(pump(stream, tx))
        }
        None => {
            info!("Reading telegrams from stdin");
            tokio::spawn(pump(tokio::io::stdin(), tx))
        }
    };

    let mut reader = P1Reader::new(config.p1_config(), sensors, ChannelSource::new(rx), SystemClock::new())?;
    reader.triggers_mut().on(P1Event::CommunicationError, || warn!("Telegram dropped"));

    let mut interval = tokio::time::interval(Duration::from_millis(config.loop_interval_ms.max(1)));
    loop {
        interval.tick().await;
        reader.tick();

        if reader.source().is_exhausted() && matches!(reader.state(), P1State::Waiting | P1State::Identifying) {
            break;
        }
    }

    if let Some(e) = reader.last_error() {
        info!("Last error: {}", e);
    }
    let _ = input.await;
    Ok(())
}
