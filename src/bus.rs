use log::debug;
use tokio::sync::broadcast;

use crate::device::IeeeAddr;
use crate::messages::{BusEvent, DeviceMessage, EntityPublished, LastSeen};

pub const DEFAULT_CAPACITY: usize = 256;

/// Process-wide event dispatcher. Components subscribe explicitly when they start.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn emit_device_message(&self, message: DeviceMessage) {
        self.emit(BusEvent::DeviceMessage(message));
    }

    pub fn emit_publish_entity_state(&self, published: EntityPublished) {
        self.emit(BusEvent::PublishEntityState(published));
    }

    pub fn emit_last_seen(&self, last_seen: LastSeen) {
        self.emit(BusEvent::LastSeen(last_seen));
    }

    pub fn emit_devices_changed(&self) {
        self.emit(BusEvent::DevicesChanged);
    }

    pub fn emit_exposes_changed(&self, ieee_addr: IeeeAddr) {
        self.emit(BusEvent::ExposesChanged(ieee_addr));
    }

    fn emit(&self, event: BusEvent) {
        // Sending only fails when nobody is subscribed.
        if let Err(err) = self.tx.send(event) {
            debug!("Dropping bus event without subscribers: {:?}", err.0);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
