use async_trait::async_trait;

use crate::config::DeviceOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub retain: bool,
    pub qos: u8,
}

impl From<&DeviceOptions> for PublishOptions {
    fn from(options: &DeviceOptions) -> Self {
        PublishOptions {
            retain: options.retain.unwrap_or(false),
            qos: options.qos.unwrap_or(0),
        }
    }
}

/// Message bus the device states are published to, keyed by the device's friendly name.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        name: &str,
        payload: String,
        options: PublishOptions,
    ) -> crate::Result<()>;
}
