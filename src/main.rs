use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use zigbee_receive::bus::DEFAULT_CAPACITY;
use zigbee_receive::mqtt::{IngressFrame, MqttClient};
use zigbee_receive::{AppConfig, BusEvent, Device, Error, EventBus, IeeeAddr, Receive, StateCache};

#[derive(Parser, Debug)]
#[command(version, about = "Publishes debounced Zigbee device states to MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "ZIGBEE_RECEIVE_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

fn forward(
    devices: &HashMap<IeeeAddr, Arc<Device>>,
    bus: &EventBus,
    addr: IeeeAddr,
    frame: IngressFrame,
) -> zigbee_receive::Result<()> {
    let device = devices
        .get(&addr)
        .ok_or_else(|| Error::UnknownDevice(addr.to_string()))?;
    bus.emit_device_message(frame.into_message(device));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let devices: HashMap<IeeeAddr, Arc<Device>> = config
        .devices
        .iter()
        .flatten()
        .map(|device| (device.address, Arc::new(Device::from_config(device))))
        .collect();
    info!("Devices: {:?}", devices.keys().collect::<Vec<_>>());

    let bus = EventBus::new(config.advanced.event_capacity.unwrap_or(DEFAULT_CAPACITY));
    let mut events = bus.subscribe();

    let (mqtt_client, mut eventloop) = MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let receive = Receive::new(
        config.advanced.clone(),
        bus.clone(),
        StateCache::new(),
        mqtt_client.clone(),
    );
    let running = receive.start();

    let (tx, mut rx) = mpsc::channel(64);
    let ingress_client = mqtt_client.clone();
    tokio::task::spawn(async move {
        ingress_client.event_loop(&mut eventloop, tx).await;
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Shutting down");
                break;
            }
            frame = rx.recv() => match frame {
                Some((addr, frame)) => {
                    if let Err(err) = forward(&devices, &bus, addr, frame) {
                        warn!("Dropping ingress frame: {}", err);
                    }
                }
                None => break,
            },
            Ok(event) = events.recv() => match event {
                BusEvent::LastSeen(last_seen) => {
                    debug!("Heard from {} at {}", last_seen.ieee_addr, last_seen.at);
                }
                BusEvent::ExposesChanged(addr) => info!("Exposes of {} changed", addr),
                _ => {}
            },
        }
    }

    running.stop().await;
    mqtt_client.disconnect().await?;

    Ok(())
}
