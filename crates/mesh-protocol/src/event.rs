//! Raw event normalization.
//!
//! Every inbound node event passes through [`normalize`] before the
//! daemon counts or broadcasts it. The input is an opaque
//! `serde_json::Value` because the feed mixes message types, snake and
//! camel case keys, and firmware-specific extras; the output is always
//! a [`NormalizedPacket`] or an error - there is no third state where
//! a half-parsed event leaks downstream.

use chrono::Utc;
use mesh_core::{NodeId, NormalizedPacket, Portnum};
use serde_json::Value;
use thiserror::Error;

use crate::extract::ChannelExtractor;

/// Errors for events that cannot be turned into a packet at all.
///
/// These are dropped and counted by the caller; they are never fatal.
#[derive(Debug, Clone, Error)]
pub enum NormalizeError {
    /// The event was not a JSON object.
    #[error("event is not an object: {0}")]
    NotAnObject(String),

    /// The object had none of the fields a packet would carry.
    #[error("event has no packet structure (keys: {0})")]
    UnrecognizedShape(String),
}

/// Outcome of normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A fully decoded packet; counts toward the `total` stat.
    Packet(NormalizedPacket),

    /// An encrypted or undecodable payload. Still broadcast (with
    /// portnum `UNKNOWN`), but tracked under the `undecoded` counter
    /// rather than `total`.
    Undecoded(NormalizedPacket),
}

impl Normalized {
    /// The packet regardless of decode outcome.
    pub fn packet(&self) -> &NormalizedPacket {
        match self {
            Self::Packet(p) | Self::Undecoded(p) => p,
        }
    }

    pub fn into_packet(self) -> NormalizedPacket {
        match self {
            Self::Packet(p) | Self::Undecoded(p) => p,
        }
    }
}

/// Normalizes one raw node event.
///
/// Channel resolution goes through the extractor's strategy chain;
/// everything else probes the known snake/camel key variants and
/// degrades to `None` rather than failing.
pub fn normalize(
    event: &Value,
    extractor: &ChannelExtractor,
) -> Result<Normalized, NormalizeError> {
    let obj = event
        .as_object()
        .ok_or_else(|| NormalizeError::NotAnObject(shape_of(event)))?;

    let decoded = obj.get("decoded").and_then(Value::as_object);
    let portnum = decoded
        .and_then(|d| d.get("portnum"))
        .and_then(Value::as_str)
        .map(Portnum::new);

    let has_header = first_str(
        event,
        &[
            &["decoded", "header", "fromId"],
            &["decoded", "header", "from_id"],
            &["fromId"],
            &["from_id"],
        ],
    )
    .is_some();
    let encrypted = obj.contains_key("encrypted");

    if portnum.is_none() && !has_header && !encrypted {
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        return Err(NormalizeError::UnrecognizedShape(keys.join(",")));
    }

    let resolution = extractor.resolve(event);

    let from = first_str(
        event,
        &[
            &["decoded", "header", "fromId"],
            &["decoded", "header", "from_id"],
            &["fromId"],
            &["from_id"],
        ],
    )
    .map(NodeId::new)
    .unwrap_or_else(|| NodeId::new(""));

    let to = first_str(
        event,
        &[
            &["decoded", "header", "toId"],
            &["decoded", "header", "to_id"],
            &["toId"],
            &["to_id"],
        ],
    )
    .map(NodeId::new)
    .unwrap_or_else(|| NodeId::new(""));

    let rssi = first_i64(event, &[&["rxRssi"], &["rx_rssi"], &["rssi"]])
        .and_then(|v| i32::try_from(v).ok());
    let snr = first_f64(event, &[&["rxSnr"], &["rx_snr"], &["snr"]]);
    let text = recover_text(event);

    let packet = NormalizedPacket {
        channel: resolution.channel,
        channel_inferred: resolution.inferred,
        portnum: portnum.clone().unwrap_or_else(Portnum::unknown),
        from,
        to,
        rssi,
        snr,
        text,
        timestamp_received: Utc::now().timestamp(),
    };

    if portnum.is_some() {
        Ok(Normalized::Packet(packet))
    } else {
        Ok(Normalized::Undecoded(packet))
    }
}

/// Recovers a text body from the packet, in decreasing order of trust:
/// the decoded text field first, then hex-encoded payload candidates
/// that decode to mostly-printable UTF-8.
pub fn recover_text(event: &Value) -> Option<String> {
    if let Some(text) = first_str(event, &[&["decoded", "data", "text"], &["decoded", "text"]]) {
        return Some(text.to_string());
    }

    const PAYLOAD_PATHS: [&[&str]; 3] = [
        &["decoded", "payload"],
        &["decoded", "data", "payload"],
        &["payload"],
    ];

    for path in PAYLOAD_PATHS {
        let Some(candidate) = first_str(event, &[path]) else {
            continue;
        };
        let Ok(bytes) = hex::decode(candidate) else {
            continue;
        };
        if let Some(text) = printable_utf8(&bytes) {
            return Some(text);
        }
    }
    None
}

/// Accepts bytes as text only when they decode as UTF-8 and are
/// dominated by printable characters, so binary payloads that happen
/// to be valid UTF-8 don't masquerade as messages.
fn printable_utf8(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    if text.is_empty() {
        return None;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\r' | '\n' | '\t'))
        .count();
    if printable * 10 > text.chars().count() * 9 {
        Some(text.to_string())
    } else {
        None
    }
}

fn get_path<'a>(event: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = event;
    for key in path {
        cur = cur.as_object()?.get(*key)?;
    }
    Some(cur)
}

fn first_str<'a>(event: &'a Value, paths: &[&[&str]]) -> Option<&'a str> {
    paths
        .iter()
        .find_map(|path| get_path(event, path).and_then(Value::as_str))
}

fn first_i64(event: &Value, paths: &[&[&str]]) -> Option<i64> {
    paths
        .iter()
        .find_map(|path| get_path(event, path).and_then(Value::as_i64))
}

fn first_f64(event: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| get_path(event, path).and_then(Value::as_f64))
}

fn shape_of(event: &Value) -> String {
    match event {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> ChannelExtractor {
        ChannelExtractor::new(0)
    }

    #[test]
    fn test_text_message_normalizes() {
        let event = json!({
            "decoded": {
                "portnum": "TEXT_MESSAGE_APP",
                "header": {"channelIndex": 0, "fromId": "!a1b2c3d4", "toId": "^all"},
                "data": {"text": "Hola"},
            },
            "rxRssi": -88,
            "rxSnr": 6.25,
        });

        let out = normalize(&event, &extractor()).unwrap();
        let Normalized::Packet(pkt) = out else {
            panic!("expected decoded packet");
        };
        assert_eq!(pkt.channel, 0);
        assert!(!pkt.channel_inferred);
        assert!(pkt.portnum.is_text_message());
        assert_eq!(pkt.from.as_str(), "!a1b2c3d4");
        assert_eq!(pkt.to.as_str(), "^all");
        assert_eq!(pkt.rssi, Some(-88));
        assert_eq!(pkt.snr, Some(6.25));
        assert_eq!(pkt.text.as_deref(), Some("Hola"));
        assert!(pkt.timestamp_received > 0);
    }

    #[test]
    fn test_missing_channel_uses_default_and_marks_inferred() {
        let event = json!({
            "decoded": {"portnum": "POSITION_APP"},
            "fromId": "!cafe0001",
        });
        let out = normalize(&event, &ChannelExtractor::new(2)).unwrap();
        let pkt = out.packet();
        assert_eq!(pkt.channel, 2);
        assert!(pkt.channel_inferred);
    }

    #[test]
    fn test_encrypted_event_is_undecoded() {
        let event = json!({
            "encrypted": "9f3a11",
            "fromId": "!feed0042",
            "rxMetadata": {"channel": 1},
        });
        let out = normalize(&event, &extractor()).unwrap();
        let Normalized::Undecoded(pkt) = out else {
            panic!("expected undecoded packet");
        };
        assert_eq!(pkt.portnum.as_str(), Portnum::UNKNOWN);
        assert_eq!(pkt.channel, 1);
        assert!(!pkt.channel_inferred);
    }

    #[test]
    fn test_hex_payload_recovers_text() {
        // "Hola" as hex
        let event = json!({
            "decoded": {
                "portnum": "TEXT_MESSAGE_APP",
                "payload": "486f6c61",
            },
            "fromId": "!0001",
        });
        let out = normalize(&event, &extractor()).unwrap();
        assert_eq!(out.packet().text.as_deref(), Some("Hola"));
    }

    #[test]
    fn test_binary_payload_yields_no_text() {
        let event = json!({
            "decoded": {
                "portnum": "POSITION_APP",
                "payload": "0d0a0008001200",
            },
            "fromId": "!0002",
        });
        let out = normalize(&event, &extractor()).unwrap();
        assert_eq!(out.packet().text, None);
    }

    #[test]
    fn test_snake_case_variants() {
        let event = json!({
            "decoded": {
                "portnum": "TEXT_MESSAGE_APP",
                "header": {"channel_index": 5, "from_id": "!aa", "to_id": "!bb"},
            },
            "rx_rssi": -120,
            "rx_snr": -3.5,
        });
        let out = normalize(&event, &extractor()).unwrap();
        let pkt = out.packet();
        assert_eq!(pkt.channel, 5);
        assert_eq!(pkt.from.as_str(), "!aa");
        assert_eq!(pkt.to.as_str(), "!bb");
        assert_eq!(pkt.rssi, Some(-120));
        assert_eq!(pkt.snr, Some(-3.5));
    }

    #[test]
    fn test_non_object_is_an_error() {
        for event in [json!(null), json!("text"), json!([1, 2])] {
            assert!(matches!(
                normalize(&event, &extractor()),
                Err(NormalizeError::NotAnObject(_))
            ));
        }
    }

    #[test]
    fn test_unrecognized_object_is_an_error() {
        let event = json!({"firmware": "2.3", "uptime": 12});
        assert!(matches!(
            normalize(&event, &extractor()),
            Err(NormalizeError::UnrecognizedShape(_))
        ));
    }

    #[test]
    fn test_normalize_never_panics_on_fuzz_shapes() {
        for event in [
            json!({"decoded": null, "encrypted": 1}),
            json!({"decoded": {"portnum": 7}, "fromId": "!x"}),
            json!({"decoded": {"portnum": "NODEINFO_APP", "payload": "zzzz"}, "fromId": "!x"}),
            json!({"encrypted": {}, "rxSnr": "loud"}),
        ] {
            let _ = normalize(&event, &extractor());
        }
    }
}
