use serde_json::{Number, Value};

use crate::config::DeviceOptions;
use crate::payload::Payload;

/// Hook run over every converted payload before it is published.
pub trait PostProcess: Send + Sync {
    fn post_process(&self, payload: &mut Payload, options: &DeviceOptions);
}

/// Applies `<field>_calibration` (added to the value) and then `<field>_precision` (number of
/// decimals kept) from the device options to numeric fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct Calibration;

impl PostProcess for Calibration {
    fn post_process(&self, payload: &mut Payload, options: &DeviceOptions) {
        for (key, value) in payload.iter_mut() {
            let Some(original) = value.as_f64() else {
                continue;
            };
            let calibration = options.number(&format!("{key}_calibration"));
            let precision = options.number(&format!("{key}_precision"));
            if calibration.is_none() && precision.is_none() {
                continue;
            }

            let mut number = original + calibration.unwrap_or(0.0);
            if let Some(precision) = precision {
                let factor = 10f64.powi(precision.clamp(0.0, 15.0) as i32);
                number = (number * factor).round() / factor;
            }
            if let Some(number) = to_json(number) {
                *value = number;
            }
        }
    }
}

fn to_json(number: f64) -> Option<Value> {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        return Some(Value::from(number as i64));
    }
    Number::from_f64(number).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(extra: Value) -> DeviceOptions {
        DeviceOptions {
            extra: extra.as_object().cloned().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_calibration_then_precision() {
        let mut payload = json!({
            "temperature": 21.456,
            "humidity": 40.0,
            "pressure": 1000,
            "state": "ON",
        })
        .as_object()
        .cloned()
        .unwrap();

        Calibration.post_process(
            &mut payload,
            &options(json!({
                "temperature_precision": 1,
                "humidity_calibration": -2.5,
                "humidity_precision": 0,
            })),
        );

        assert_eq!(
            Value::Object(payload),
            json!({
                "temperature": 21.5,
                "humidity": 38,
                "pressure": 1000,
                "state": "ON",
            })
        );
    }

    #[test]
    fn test_untouched_without_options() {
        let mut payload = json!({"temperature": 21.456}).as_object().cloned().unwrap();
        Calibration.post_process(&mut payload, &DeviceOptions::default());
        assert_eq!(payload.get("temperature"), Some(&json!(21.456)));
    }
}
