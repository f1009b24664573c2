//! Selection and invocation of the converters that turn a device message into payload fields.

use std::sync::Arc;

use log::{debug, error};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::config::{ConverterConfig, DeviceOptions};
use crate::device::{Definition, Device, DeviceHandle};
use crate::payload::{self, Payload};

/// Housekeeping clusters that are expected to arrive without a converter.
pub const IGNORED_CLUSTERS: [&str; 4] = ["genOta", "genTime", "genBasic", "genPollCtrl"];

pub trait Converter: Send + Sync {
    fn cluster(&self) -> &str;

    /// Message types handled, usually one.
    fn types(&self) -> &[String];

    /// Returning `Ok(None)` is normal for stateful converters (click counting, long presses)
    /// that emit through [`ConvertContext::publish`] instead.
    fn convert(
        &self,
        data: &ConvertData<'_>,
        options: &DeviceOptions,
        ctx: &ConvertContext<'_>,
    ) -> anyhow::Result<Option<Payload>>;

    fn applies_to(&self, cluster: &str, message_type: &str) -> bool {
        self.cluster() == cluster && self.types().iter().any(|t| t == message_type)
    }
}

/// The message as converters see it: the device is narrowed to its transport handle.
#[derive(Debug, Clone, Copy)]
pub struct ConvertData<'a> {
    pub device: &'a DeviceHandle,
    pub cluster: &'a str,
    pub message_type: &'a str,
    pub data: &'a Value,
    pub endpoint: Option<u8>,
    pub linkquality: Option<u8>,
}

/// An out-of-band publish requested by a converter.
#[derive(Debug, Clone)]
pub struct OutOfBand {
    pub device: Arc<Device>,
    pub payload: Payload,
}

/// Cloneable handle converters can keep to publish later, e.g. from a spawned task.
#[derive(Debug, Clone)]
pub struct ConverterPublisher {
    device: Arc<Device>,
    tx: mpsc::UnboundedSender<OutOfBand>,
}

impl ConverterPublisher {
    pub fn new(device: Arc<Device>, tx: mpsc::UnboundedSender<OutOfBand>) -> Self {
        ConverterPublisher { device, tx }
    }

    pub fn publish(&self, payload: Payload) {
        let request = OutOfBand {
            device: self.device.clone(),
            payload,
        };
        if self.tx.send(request).is_err() {
            debug!(
                "Engine gone, dropping out-of-band publish for '{}'",
                self.device.friendly_name
            );
        }
    }
}

pub struct ConvertContext<'a> {
    state: &'a Payload,
    publisher: ConverterPublisher,
    bus: &'a EventBus,
}

impl<'a> ConvertContext<'a> {
    pub fn new(state: &'a Payload, publisher: ConverterPublisher, bus: &'a EventBus) -> Self {
        ConvertContext {
            state,
            publisher,
            bus,
        }
    }

    /// Cached state of the device when the message arrived.
    pub fn state(&self) -> &Payload {
        self.state
    }

    pub fn publish(&self, payload: Payload) {
        self.publisher.publish(payload);
    }

    pub fn publisher(&self) -> ConverterPublisher {
        self.publisher.clone()
    }

    /// Signals that the device's exposed capabilities changed.
    pub fn device_exposes_changed(&self) {
        self.bus.emit_devices_changed();
        self.bus.emit_exposes_changed(self.publisher.device.ieee_addr());
    }
}

/// Converters of `definition` that handle `cluster`/`message_type`, in declaration order.
pub fn applicable<'d>(
    definition: &'d Definition,
    cluster: &str,
    message_type: &str,
) -> Vec<&'d Arc<dyn Converter>> {
    definition
        .converters
        .iter()
        .filter(|converter| converter.applies_to(cluster, message_type))
        .collect()
}

/// Runs every converter and merges their fragments, later converters win. A failing
/// converter is logged and contributes nothing. A non-empty result is tagged `isReport`.
pub fn dispatch(
    converters: &[&Arc<dyn Converter>],
    data: &ConvertData<'_>,
    options: &DeviceOptions,
    ctx: &ConvertContext<'_>,
) -> Payload {
    let mut merged = Payload::new();
    for converter in converters {
        match converter.convert(data, options, ctx) {
            Ok(Some(fragment)) => payload::merge(&mut merged, fragment),
            Ok(None) => {}
            Err(err) => {
                error!("Exception while calling converter: {}", err);
                debug!("{:?}", err);
            }
        }
    }

    if !merged.is_empty() {
        merged.insert(payload::IS_REPORT.to_string(), Value::Bool(true));
    }
    merged
}

/// Copies the fields of an already decoded `data` object.
#[derive(Debug, Clone)]
pub struct Passthrough {
    cluster: String,
    types: Vec<String>,
}

impl Passthrough {
    pub fn new(cluster: impl Into<String>, types: Vec<String>) -> Self {
        Passthrough {
            cluster: cluster.into(),
            types,
        }
    }
}

impl From<&ConverterConfig> for Passthrough {
    fn from(config: &ConverterConfig) -> Self {
        Passthrough::new(config.cluster.clone(), config.types.clone())
    }
}

impl Converter for Passthrough {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn types(&self) -> &[String] {
        &self.types
    }

    fn convert(
        &self,
        data: &ConvertData<'_>,
        _options: &DeviceOptions,
        _ctx: &ConvertContext<'_>,
    ) -> anyhow::Result<Option<Payload>> {
        match data.data {
            Value::Object(fields) if fields.is_empty() => Ok(None),
            Value::Object(fields) => Ok(Some(fields.clone())),
            Value::Null => Ok(None),
            other => anyhow::bail!("expected an object, got {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::IeeeAddr;
    use crate::messages::BusEvent;
    use serde_json::json;

    struct Fixed {
        cluster: String,
        types: Vec<String>,
        result: Result<Option<Value>, &'static str>,
    }

    impl Fixed {
        fn new(cluster: &str, types: &[&str], result: Result<Option<Value>, &'static str>) -> Arc<dyn Converter> {
            Arc::new(Fixed {
                cluster: cluster.to_string(),
                types: types.iter().map(|t| t.to_string()).collect(),
                result,
            })
        }
    }

    impl Converter for Fixed {
        fn cluster(&self) -> &str {
            &self.cluster
        }

        fn types(&self) -> &[String] {
            &self.types
        }

        fn convert(
            &self,
            _data: &ConvertData<'_>,
            _options: &DeviceOptions,
            _ctx: &ConvertContext<'_>,
        ) -> anyhow::Result<Option<Payload>> {
            match &self.result {
                Ok(value) => Ok(value.as_ref().and_then(|v| v.as_object().cloned())),
                Err(message) => Err(anyhow::anyhow!(*message)),
            }
        }
    }

    fn device() -> Arc<Device> {
        Arc::new(Device {
            handle: DeviceHandle::new(IeeeAddr::new(0x42)),
            friendly_name: "sensor".to_string(),
            definition: None,
            options: DeviceOptions::default(),
        })
    }

    fn run(converters: Vec<Arc<dyn Converter>>, cluster: &str, message_type: &str) -> Payload {
        let definition = Definition {
            model: "test".to_string(),
            converters,
            post_process: None,
        };
        let device = device();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = EventBus::default();
        let state = Payload::new();
        let ctx = ConvertContext::new(&state, ConverterPublisher::new(device.clone(), tx), &bus);
        let data = json!({});
        let convert_data = ConvertData {
            device: &device.handle,
            cluster,
            message_type,
            data: &data,
            endpoint: None,
            linkquality: None,
        };
        let selected = applicable(&definition, cluster, message_type);
        dispatch(&selected, &convert_data, &device.options, &ctx)
    }

    #[test]
    fn test_applicable_by_cluster_and_type() {
        let definition = Definition {
            model: "test".to_string(),
            converters: vec![
                Fixed::new("genOnOff", &["attributeReport", "readResponse"], Ok(None)),
                Fixed::new("genOnOff", &["commandToggle"], Ok(None)),
                Fixed::new("msTemperatureMeasurement", &["attributeReport"], Ok(None)),
            ],
            post_process: None,
        };
        assert_eq!(applicable(&definition, "genOnOff", "readResponse").len(), 1);
        assert_eq!(applicable(&definition, "genOnOff", "commandToggle").len(), 1);
        assert!(applicable(&definition, "genLevelCtrl", "attributeReport").is_empty());
    }

    #[test]
    fn test_later_converter_wins_and_tags_report() {
        let payload = run(
            vec![
                Fixed::new("c", &["t"], Ok(Some(json!({"a": 1, "b": 1})))),
                Fixed::new("c", &["t"], Ok(Some(json!({"b": 2})))),
            ],
            "c",
            "t",
        );
        assert_eq!(
            Value::Object(payload),
            json!({"a": 1, "b": 2, "isReport": true})
        );
    }

    #[test]
    fn test_failing_converter_does_not_abort_others() {
        let payload = run(
            vec![
                Fixed::new("c", &["t"], Err("boom")),
                Fixed::new("c", &["t"], Ok(Some(json!({"a": 1})))),
            ],
            "c",
            "t",
        );
        assert_eq!(Value::Object(payload), json!({"a": 1, "isReport": true}));
    }

    #[test]
    fn test_empty_result_is_not_tagged() {
        let payload = run(vec![Fixed::new("c", &["t"], Ok(None))], "c", "t");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_context_publish_and_exposes_changed() {
        let device = device();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let state = json!({"state": "ON"}).as_object().cloned().unwrap();
        let ctx = ConvertContext::new(&state, ConverterPublisher::new(device.clone(), tx), &bus);

        assert_eq!(ctx.state().get("state"), Some(&json!("ON")));

        let later = ctx.publisher();
        tokio::spawn(async move {
            later.publish(json!({"action": "hold"}).as_object().cloned().unwrap());
        })
        .await
        .unwrap();
        let request = rx.recv().await.unwrap();
        assert_eq!(request.device.friendly_name, "sensor");
        assert_eq!(request.payload.get("action"), Some(&json!("hold")));

        ctx.device_exposes_changed();
        assert!(matches!(events.try_recv(), Ok(BusEvent::DevicesChanged)));
        assert!(matches!(
            events.try_recv(),
            Ok(BusEvent::ExposesChanged(addr)) if addr == IeeeAddr::new(0x42)
        ));
    }

    #[test]
    fn test_passthrough() {
        let device = device();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = EventBus::default();
        let state = Payload::new();
        let ctx = ConvertContext::new(&state, ConverterPublisher::new(device.clone(), tx), &bus);
        let converter = Passthrough::new("genOnOff", vec!["attributeReport".to_string()]);

        let convert = |data: &Value| {
            let convert_data = ConvertData {
                device: &device.handle,
                cluster: "genOnOff",
                message_type: "attributeReport",
                data,
                endpoint: Some(1),
                linkquality: Some(120),
            };
            converter.convert(&convert_data, &device.options, &ctx)
        };

        assert_eq!(
            convert(&json!({"state": "ON"})).unwrap(),
            json!({"state": "ON"}).as_object().cloned()
        );
        assert_eq!(convert(&json!({})).unwrap(), None);
        assert!(convert(&json!(3)).is_err());
    }
}
