use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::config::{DeviceConfig, DeviceOptions};
use crate::convert::{Converter, Passthrough};
use crate::error::Error;
use crate::postprocess::{Calibration, PostProcess};

/// 64-bit IEEE address, the stable key of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IeeeAddr(u64);

impl IeeeAddr {
    pub const fn new(raw: u64) -> Self {
        IeeeAddr(raw)
    }
}

impl fmt::Display for IeeeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for IeeeAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 16 {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        u64::from_str_radix(digits, 16)
            .map(IeeeAddr)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for IeeeAddr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IeeeAddr> for String {
    fn from(addr: IeeeAddr) -> Self {
        addr.to_string()
    }
}

/// Transport-layer view of a device, the only part of it converters get to see.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceHandle {
    pub ieee_addr: IeeeAddr,
    pub network_address: Option<u16>,
    pub model_id: Option<String>,
    pub interviewing: bool,
}

impl DeviceHandle {
    pub fn new(ieee_addr: IeeeAddr) -> Self {
        DeviceHandle {
            ieee_addr,
            network_address: None,
            model_id: None,
            interviewing: false,
        }
    }
}

/// What is known about how to interpret a device's messages.
#[derive(Clone, Default)]
pub struct Definition {
    pub model: String,
    pub converters: Vec<Arc<dyn Converter>>,
    pub post_process: Option<Arc<dyn PostProcess>>,
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("model", &self.model)
            .field("converters", &self.converters.len())
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Device {
    pub handle: DeviceHandle,
    pub friendly_name: String,
    pub definition: Option<Arc<Definition>>,
    pub options: DeviceOptions,
}

impl Device {
    /// Devices configured without a `model` have no definition, their messages only count as
    /// a sign of life.
    pub fn from_config(config: &DeviceConfig) -> Self {
        let definition = config.model.as_ref().map(|model| {
            let converters = config
                .converters
                .iter()
                .flatten()
                .map(|converter| Arc::new(Passthrough::from(converter)) as Arc<dyn Converter>)
                .collect();
            Arc::new(Definition {
                model: model.clone(),
                converters,
                post_process: Some(Arc::new(Calibration)),
            })
        });
        Device {
            handle: DeviceHandle::new(config.address),
            friendly_name: config.friendly_name.clone(),
            definition,
            options: config.options.clone(),
        }
    }

    pub fn ieee_addr(&self) -> IeeeAddr {
        self.handle.ieee_addr
    }

    pub fn interviewing(&self) -> bool {
        self.handle.interviewing
    }
}
