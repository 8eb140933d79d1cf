//! Codec for inbound producer messages.
//!
//! One message is one JSON object. Field types are enforced by serde; the
//! remaining checks are the ones serde cannot express.

use crate::error::DecodeError;
use crate::models::PacketEvent;

/// Parses one raw message into a validated `PacketEvent`.
pub fn decode(raw: &str) -> Result<PacketEvent, DecodeError> {
    let event: PacketEvent =
        serde_json::from_str(raw).map_err(|e| DecodeError::new(raw, e.to_string()))?;
    validate(&event).map_err(|reason| DecodeError::new(raw, reason))?;
    Ok(event)
}

/// Same as `decode` for binary frames, which must still carry UTF-8 JSON.
pub fn decode_bytes(raw: &[u8]) -> Result<PacketEvent, DecodeError> {
    match std::str::from_utf8(raw) {
        Ok(text) => decode(text),
        Err(e) => Err(DecodeError::new(
            String::from_utf8_lossy(raw).into_owned(),
            format!("payload is not UTF-8: {}", e),
        )),
    }
}

fn validate(event: &PacketEvent) -> Result<(), String> {
    let required = [
        ("protocol", &event.protocol),
        ("source_ip", &event.source_ip),
        ("dest_ip", &event.dest_ip),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(format!("field `{}` is empty", name));
        }
    }
    Ok(())
}

/// Serialized form used for the global log: one JSON object, no trailing newline.
pub fn encode(event: &PacketEvent) -> String {
    // PacketEvent only holds strings, integers and JSON values.
    serde_json::to_string(event).unwrap_or_default()
}
