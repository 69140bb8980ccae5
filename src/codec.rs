//! Event encodings for the broker wire and the fallback store.
//!
//! The broker payload is either JSON or MessagePack. The fallback store always
//! uses one JSON object per line: JSON escapes embedded newlines, so a
//! multi-line trace can never be mistaken for a record boundary, and the file
//! stays readable during an outage.

use std::io;

use rmp_serde::Serializer;
use serde::Serialize;

use crate::log_event::FemtoLogEvent;

/// Payload encoding used when publishing to the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Json,
    MessagePack,
}

impl WireFormat {
    /// MIME type advertised in the message properties.
    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::MessagePack => "application/msgpack",
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MessagePack),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

/// Encode an event for the broker.
pub fn encode_event(event: &FemtoLogEvent, format: WireFormat) -> io::Result<Vec<u8>> {
    match format {
        WireFormat::Json => serde_json::to_vec(event).map_err(io::Error::other),
        WireFormat::MessagePack => {
            let mut buf = Vec::with_capacity(128);
            event
                .serialize(&mut Serializer::new(&mut buf).with_struct_map())
                .map_err(io::Error::other)?;
            Ok(buf)
        }
    }
}

/// Decode a broker payload produced by [`encode_event`].
pub fn decode_event(payload: &[u8], format: WireFormat) -> io::Result<FemtoLogEvent> {
    match format {
        WireFormat::Json => serde_json::from_slice(payload).map_err(io::Error::other),
        WireFormat::MessagePack => rmp_serde::from_slice(payload).map_err(io::Error::other),
    }
}

/// Encode an event as a single fallback-store line, including the newline.
pub fn encode_line(event: &FemtoLogEvent) -> io::Result<String> {
    let mut line = serde_json::to_string(event).map_err(io::Error::other)?;
    line.push('\n');
    Ok(line)
}

/// Decode one fallback-store line. Trailing `\r`/`\n` are ignored.
pub fn decode_line(line: &str) -> io::Result<FemtoLogEvent> {
    serde_json::from_str(line.trim_end_matches(['\r', '\n'])).map_err(io::Error::other)
}
