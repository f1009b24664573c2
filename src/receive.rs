//! Turns device messages into published device states.
//!
//! [`Receive`] runs as a single task: bus events, debounce timer expirations and
//! out-of-band converter publishes are handled one at a time, so the debounce buffers and
//! the elapsed table need no locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::config::AdvancedConfig;
use crate::convert::{
    self, ConvertContext, ConvertData, ConverterPublisher, IGNORED_CLUSTERS, OutOfBand,
};
use crate::debounce::{Debouncers, FlushRequest};
use crate::device::{Device, IeeeAddr};
use crate::messages::{
    BusEvent, DeviceMessage, EntityPublished, LastSeen, LastSeenReason, PublishCause,
};
use crate::payload::{self, Payload};
use crate::state::StateCache;
use crate::transport::{PublishOptions, Transport};

pub struct Receive<T> {
    settings: AdvancedConfig,
    bus: EventBus,
    state: StateCache,
    transport: T,
    debouncers: Debouncers,
    elapsed: HashMap<IeeeAddr, Instant>,
    flush_tx: mpsc::UnboundedSender<FlushRequest>,
    flush_rx: mpsc::UnboundedReceiver<FlushRequest>,
    out_of_band_tx: mpsc::UnboundedSender<OutOfBand>,
    out_of_band_rx: mpsc::UnboundedReceiver<OutOfBand>,
}

/// A started [`Receive`] task.
pub struct Running {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Running {
    /// Stops the engine. Debounced payloads that are still pending are discarded.
    pub async fn stop(self) {
        // The task may already be gone if the bus closed.
        let _ = self.stop_tx.send(());
        if let Err(err) = self.task.await {
            error!("Receive task failed: {:?}", err);
        }
    }
}

impl<T: Transport + 'static> Receive<T> {
    pub fn new(settings: AdvancedConfig, bus: EventBus, state: StateCache, transport: T) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (out_of_band_tx, out_of_band_rx) = mpsc::unbounded_channel();
        Receive {
            settings,
            bus,
            state,
            transport,
            debouncers: Debouncers::new(),
            elapsed: HashMap::new(),
            flush_tx,
            flush_rx,
            out_of_band_tx,
            out_of_band_rx,
        }
    }

    pub fn debouncers(&self) -> &Debouncers {
        &self.debouncers
    }

    /// Subscribes to the bus and spawns the event loop.
    pub fn start(self) -> Running {
        let events = self.bus.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(events, stop_rx));
        Running { stop_tx, task }
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<BusEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    debug!("Stopping receive");
                    break;
                }
                Some(request) = self.flush_rx.recv() => self.on_flush(request).await,
                Some(request) = self.out_of_band_rx.recv() => {
                    self.publish(&request.device, request.payload).await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Receive lagged behind the event bus, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                },
            }
        }
    }

    /// Handles the next debounce expiration or out-of-band publish, waiting for one.
    pub async fn handle_next_internal(&mut self) {
        tokio::select! {
            Some(request) = self.flush_rx.recv() => self.on_flush(request).await,
            Some(request) = self.out_of_band_rx.recv() => {
                self.publish(&request.device, request.payload).await;
            }
            else => {}
        }
    }

    async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::DeviceMessage(message) => self.on_device_message(&message).await,
            BusEvent::PublishEntityState(published) => self.on_publish_entity_state(&published),
            BusEvent::LastSeen(_) | BusEvent::DevicesChanged | BusEvent::ExposesChanged(_) => {}
        }
    }

    /// Prevents a debounced payload from publishing values that were superseded in the
    /// meantime by a publish through another path.
    pub fn on_publish_entity_state(&mut self, published: &EntityPublished) {
        if !published.cause.prunes_debounce() {
            return;
        }
        if self
            .debouncers
            .prune(&published.ieee_addr, published.payload.keys())
        {
            debug!(
                "Removed fields published by '{}' from debounced payload of '{}'",
                published.cause, published.friendly_name
            );
        }
    }

    pub async fn on_device_message(&mut self, message: &DeviceMessage) {
        if !self.settings.accepts(&message.message_type) {
            return;
        }

        let device = &message.device;
        let definition = match &device.definition {
            Some(definition) if !device.interviewing() => definition.clone(),
            _ => {
                debug!(
                    "Skipping message of '{}', still interviewing",
                    device.friendly_name
                );
                self.publish_last_seen(device);
                return;
            }
        };

        let converters =
            convert::applicable(&definition, &message.cluster, &message.message_type);
        if converters.is_empty() && !IGNORED_CLUSTERS.contains(&message.cluster.as_str()) {
            debug!(
                "No converter available for '{}' with cluster '{}' and type '{}' and data '{}'",
                definition.model, message.cluster, message.message_type, message.data
            );
            self.publish_last_seen(device);
            return;
        }

        let state = self.state.get(&device.ieee_addr());
        let publisher = ConverterPublisher::new(device.clone(), self.out_of_band_tx.clone());
        let ctx = ConvertContext::new(&state, publisher, &self.bus);
        let data = ConvertData {
            device: &device.handle,
            cluster: &message.cluster,
            message_type: &message.message_type,
            data: &message.data,
            endpoint: message.endpoint,
            linkquality: message.linkquality,
        };
        let payload = convert::dispatch(&converters, &data, &device.options, &ctx);

        // Publishes made while converting precede the converted payload.
        while let Ok(request) = self.out_of_band_rx.try_recv() {
            self.publish(&request.device, request.payload).await;
        }

        if payload.is_empty() {
            self.publish_last_seen(device);
        } else {
            self.publish(device, payload).await;
        }
    }

    /// Publication gate shared by converted payloads and out-of-band converter publishes.
    pub async fn publish(&mut self, device: &Arc<Device>, mut payload: Payload) {
        if let Some(post_process) = device
            .definition
            .as_ref()
            .and_then(|definition| definition.post_process.as_ref())
        {
            post_process.post_process(&mut payload, &device.options);
        }

        if self.settings.elapsed {
            let now = Instant::now();
            if let Some(previous) = self.elapsed.insert(device.ieee_addr(), now) {
                payload.insert(
                    payload::ELAPSED.to_string(),
                    Value::from(millis(now.duration_since(previous))),
                );
            }
        }

        match device.options.debounce_period() {
            Some(period) => self.publish_debounce(device, payload, period).await,
            None => {
                self.publish_entity_state(device, payload, PublishCause::Immediate)
                    .await;
            }
        }
    }

    async fn publish_debounce(&mut self, device: &Arc<Device>, payload: Payload, period: Duration) {
        let stale = self.debouncers.flush_if_conflicted(
            device.ieee_addr(),
            &payload,
            device.options.debounce_ignore(),
        );
        if let Some(stale) = stale {
            self.publish_entity_state(device, stale, PublishCause::PublishDebounce)
                .await;
        }

        self.debouncers
            .merge_and_schedule(device, payload, period, &self.state, &self.flush_tx);
    }

    async fn on_flush(&mut self, request: FlushRequest) {
        if let Some(payload) = self.debouncers.take_expired(&request) {
            self.publish_entity_state(&request.device, payload, PublishCause::PublishDebounce)
                .await;
        }
    }

    async fn publish_entity_state(&self, device: &Device, payload: Payload, cause: PublishCause) {
        let addr = device.ieee_addr();
        self.state.set(&addr, &payload);

        let message = payload::to_stable_string(&payload);
        if let Err(err) = self
            .transport
            .publish(
                &device.friendly_name,
                message,
                PublishOptions::from(&device.options),
            )
            .await
        {
            error!(
                "Failed to publish state of '{}': {}",
                device.friendly_name, err
            );
        }

        self.bus.emit_publish_entity_state(EntityPublished {
            ieee_addr: addr,
            friendly_name: device.friendly_name.clone(),
            payload,
            cause,
        });
    }

    fn publish_last_seen(&self, device: &Device) {
        self.bus.emit_last_seen(LastSeen {
            ieee_addr: device.ieee_addr(),
            reason: LastSeenReason::MessageEmitted,
            at: Utc::now(),
        });
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
