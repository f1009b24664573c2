//! Debounced publication of converted device states.
//!
//! Device messages arrive on the [`EventBus`], are converted into payload fragments by the
//! device definition's converters and published through a [`Transport`]. Devices configured
//! with a `debounce` period have their fragments merged and held back until the period
//! passes without new fragments; see [`Receive`].

pub mod bus;
pub mod config;
pub mod convert;
pub mod debounce;
pub mod device;
pub mod error;
pub mod messages;
pub mod mqtt;
pub mod payload;
pub mod postprocess;
pub mod receive;
pub mod state;
pub mod timer;
pub mod transport;

pub use bus::EventBus;
pub use config::{AdvancedConfig, AppConfig, DeviceOptions};
pub use device::{Definition, Device, DeviceHandle, IeeeAddr};
pub use error::{Error, Result};
pub use messages::{BusEvent, DeviceMessage, EntityPublished, PublishCause};
pub use payload::Payload;
pub use receive::{Receive, Running};
pub use state::StateCache;
pub use transport::{PublishOptions, Transport};
