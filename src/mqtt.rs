use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config;
use crate::device::{Device, DeviceHandle, IeeeAddr};
use crate::messages::DeviceMessage;
use crate::transport::{PublishOptions, Transport};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
}

/// A decoded device frame posted by the upstream decoder on `<topic_path>/ingress/<ieee>`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngressFrame {
    pub cluster: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    pub endpoint: Option<u8>,
    pub linkquality: Option<u8>,
    #[serde(default)]
    pub interviewing: bool,
}

impl IngressFrame {
    pub fn into_message(self, device: &Arc<Device>) -> DeviceMessage {
        let device = if self.interviewing == device.interviewing() {
            device.clone()
        } else {
            Arc::new(Device {
                handle: DeviceHandle {
                    interviewing: self.interviewing,
                    ..device.handle.clone()
                },
                ..(**device).clone()
            })
        };
        DeviceMessage {
            device,
            cluster: self.cluster,
            message_type: self.message_type,
            data: self.data,
            endpoint: self.endpoint,
            linkquality: self.linkquality,
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "zigbee-receive".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "zigbee2mqtt".to_string()),
            },
            eventloop,
        )
    }

    fn ingress_prefix(&self) -> String {
        format!("{}/ingress/", self.topic_path)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(format!("{}+", self.ingress_prefix()), QoS::AtMostOnce)
            .await
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: mpsc::Sender<(IeeeAddr, IngressFrame)>,
    ) {
        let prefix = self.ingress_prefix();
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(frame) = parse_ingress(&prefix, &p.topic, &p.payload) else {
                            continue;
                        };
                        if tx.send(frame).await.is_err() {
                            info!("Ingress receiver closed, stopping MQTT event loop");
                            break;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn publish(
        &self,
        name: &str,
        payload: String,
        options: PublishOptions,
    ) -> crate::Result<()> {
        let topic = format!("{}/{}", self.topic_path, sanitize_name(name));
        debug!("Publishing '{}' to {}", payload, topic);
        self.client
            .publish(topic, qos(options.qos), options.retain, payload)
            .await?;
        Ok(())
    }
}

fn parse_ingress(prefix: &str, topic: &str, payload: &[u8]) -> Option<(IeeeAddr, IngressFrame)> {
    let addr = match topic.strip_prefix(prefix)?.parse::<IeeeAddr>() {
        Ok(addr) => addr,
        Err(err) => {
            warn!("Ignoring ingress frame on {}: {}", topic, err);
            return None;
        }
    };
    match serde_json::from_slice(payload) {
        Ok(frame) => Some((addr, frame)),
        Err(err) => {
            warn!("Ignoring malformed ingress frame for {}: {}", addr, err);
            None
        }
    }
}

fn qos(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn sanitize_name(name: &str) -> String {
    // Wildcards and whitespace are not usable in a topic level
    name.trim()
        .chars()
        .map(|c| match c {
            '+' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect::<String>()
}
