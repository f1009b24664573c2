//! Payload fragments exchanged between converters, the debounce buffers and the transport.
//!
//! `serde_json::Map` is backed by a `BTreeMap` (the `preserve_order` feature is not enabled),
//! so serialization is key-sorted and two logically identical payloads always produce the
//! same string.

use serde_json::{Map, Value};

pub type Payload = Map<String, Value>;

/// Field added to every payload produced by the conversion step.
pub const IS_REPORT: &str = "isReport";

/// Field carrying the milliseconds since the previous publish of the same device.
pub const ELAPSED: &str = "elapsed";

/// Shallow merge, `update` wins on key collision.
pub fn merge(target: &mut Payload, update: Payload) {
    for (key, value) in update {
        target.insert(key, value);
    }
}

pub fn to_stable_string(payload: &Payload) -> String {
    Value::Object(payload.clone()).to_string()
}
