//! Shaping of received messages into log records.
//!
//! A JSON object is stored as-is; anything else is wrapped as
//! `{"raw": <text>}`. Either way the record gains a `received_at` field.

use chrono::{DateTime, Local, SecondsFormat};
use serde_json::{Map, Value};

/// Field holding the receipt time.
pub const RECEIVED_AT: &str = "received_at";

/// Field holding a message that is not a JSON object.
pub const RAW: &str = "raw";

/// Build the record for one message.
pub fn build_record(message: &str, received_at: DateTime<Local>) -> Map<String, Value> {
    let mut record = match serde_json::from_str::<Value>(message) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert(RAW.to_string(), Value::String(message.to_string()));
            map
        }
    };

    record.insert(
        RECEIVED_AT.to_string(),
        Value::String(received_at.to_rfc3339_opts(SecondsFormat::Secs, false)),
    );
    record
}

/// Serialize the record for a raw payload as a single JSON line.
///
/// Payloads that are not valid UTF-8 are decoded lossily.
pub fn record_line(payload: &[u8], received_at: DateTime<Local>) -> String {
    let message = String::from_utf8_lossy(payload);
    Value::Object(build_record(&message, received_at)).to_string()
}
