use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::device::{Device, IeeeAddr};
use crate::payload::Payload;

/// A decoded frame received from a device, already classified by cluster and type.
#[derive(Clone, Debug)]
pub struct DeviceMessage {
    pub device: Arc<Device>,
    pub cluster: String,
    pub message_type: String,
    pub data: Value,
    pub endpoint: Option<u8>,
    pub linkquality: Option<u8>,
}

/// Why a device state was published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishCause {
    /// Flush of a debounce buffer.
    PublishDebounce,
    /// Liveness-only refresh, carries no semantic fields.
    LastSeenChanged,
    /// Converted payload published without debouncing.
    Immediate,
    Other(String),
}

impl PublishCause {
    pub fn as_str(&self) -> &str {
        match self {
            PublishCause::PublishDebounce => "publishDebounce",
            PublishCause::LastSeenChanged => "lastSeenChanged",
            PublishCause::Immediate => "immediate",
            PublishCause::Other(cause) => cause,
        }
    }

    /// Whether a publish with this cause must evict the published fields from a pending
    /// debounce buffer.
    pub fn prunes_debounce(&self) -> bool {
        !matches!(
            self,
            PublishCause::PublishDebounce | PublishCause::LastSeenChanged
        )
    }
}

impl From<&str> for PublishCause {
    fn from(cause: &str) -> Self {
        match cause {
            "publishDebounce" => PublishCause::PublishDebounce,
            "lastSeenChanged" => PublishCause::LastSeenChanged,
            "immediate" => PublishCause::Immediate,
            other => PublishCause::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PublishCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct EntityPublished {
    pub ieee_addr: IeeeAddr,
    pub friendly_name: String,
    pub payload: Payload,
    pub cause: PublishCause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastSeenReason {
    MessageEmitted,
}

#[derive(Clone, Debug)]
pub struct LastSeen {
    pub ieee_addr: IeeeAddr,
    pub reason: LastSeenReason,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum BusEvent {
    DeviceMessage(DeviceMessage),
    PublishEntityState(EntityPublished),
    LastSeen(LastSeen),
    DevicesChanged,
    ExposesChanged(IeeeAddr),
}
