//! Message payload codec: JSON object on the wire, with a legacy
//! pipe-delimited fallback accepted on decode only.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::model::{now_ms, Message};

/// Build the wire payload. Geolocation keys are omitted entirely when absent.
pub fn encode(
    from_id: &str,
    text: &str,
    timestamp: i64,
    lat: Option<f64>,
    lon: Option<f64>,
) -> Vec<u8> {
    let mut obj = Map::new();
    obj.insert("fromId".into(), json!(from_id));
    obj.insert("text".into(), json!(text));
    obj.insert("timestamp".into(), json!(timestamp));
    if let Some(lat) = lat {
        obj.insert("lat".into(), json!(lat));
    }
    if let Some(lon) = lon {
        obj.insert("lon".into(), json!(lon));
    }
    Value::Object(obj).to_string().into_bytes()
}

#[derive(Deserialize)]
struct WirePayload {
    #[serde(rename = "fromId", default)]
    from_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

/// Decode an inbound payload. Primary parse is the JSON object; on failure
/// the legacy `fromId|text|timestamp` form is tried. The wire carries no
/// recipient (delivery is direct), so `to_id` is always the local identity.
pub fn decode(bytes: &[u8], local_id: &str) -> Option<Message> {
    let raw = String::from_utf8_lossy(bytes);
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(payload) = serde_json::from_str::<WirePayload>(trimmed) {
            return Some(Message {
                from_id: payload.from_id,
                to_id: Some(local_id.to_string()),
                text: payload.text,
                timestamp: payload.timestamp.unwrap_or_else(now_ms),
                lat: payload.lat,
                lon: payload.lon,
            });
        }
    }
    decode_legacy(&raw, local_id)
}

/// Legacy 3-field form. The first delimiter bounds the sender, the last one
/// bounds the timestamp; any delimiters in between belong to the text.
fn decode_legacy(raw: &str, local_id: &str) -> Option<Message> {
    let (from_id, rest) = raw.split_once('|')?;
    let (text, ts) = rest.rsplit_once('|')?;
    let timestamp = ts.trim().parse::<i64>().unwrap_or_else(|_| now_ms());
    Some(Message {
        from_id: from_id.to_string(),
        to_id: Some(local_id.to_string()),
        text: text.to_string(),
        timestamp,
        lat: None,
        lon: None,
    })
}
