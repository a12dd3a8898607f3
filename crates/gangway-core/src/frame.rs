//! Frame model for the FFI stream protocol.
//!
//! Every unit delivered to the host callback is a frame: the session id, a
//! one-byte kind tag, and an opaque payload. DATA carries marshaled message
//! bytes; HEADER and TRAILER carry `"key=value\n"` metadata; ERROR carries a
//! UTF-8 message; END is empty.

use bytes::Bytes;

use crate::{ErrorCode, Status};

/// One-byte frame tags on the FFI callback wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Stream started.
    Start = 0x01,
    /// Stream data chunk.
    Data = 0x02,
    /// Stream ended normally.
    End = 0x03,
    /// Stream error (terminal).
    Error = 0x04,
    /// Trailing metadata, emitted immediately before END.
    Trailer = 0x05,
    /// Leading metadata, emitted before the first DATA.
    Header = 0x06,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::End),
            0x04 => Some(Self::Error),
            0x05 => Some(Self::Trailer),
            0x06 => Some(Self::Header),
            _ => None,
        }
    }
}

/// An outbound frame as handed to a queue-backed sink.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub session_id: i64,
    pub kind: FrameKind,
    pub payload: Bytes,
}

/// Insertion-ordered string metadata, the payload of HEADER and TRAILER
/// frames.
///
/// Keys and values must not contain `=` or `\n`; both are reserved by the
/// wire encoding and rejected on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pairs: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Insert or replace a pair, keeping first-insertion order.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Status> {
        validate_component(key)?;
        validate_component(value)?;
        if let Some(slot) = self.pairs.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.pairs.push((key.to_string(), value.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode as repeated `"key=value\n"` in insertion order.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        for (key, value) in &self.pairs {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        Bytes::from(out)
    }

    /// Decode a `"key=value\n"` buffer. Lines without `=` are skipped.
    pub fn decode(data: &[u8]) -> Self {
        let mut metadata = Self::new();
        for line in data.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let Some(idx) = line.iter().position(|&b| b == b'=') else {
                continue;
            };
            let key = String::from_utf8_lossy(&line[..idx]);
            let value = String::from_utf8_lossy(&line[idx + 1..]);
            if idx > 0 {
                // Re-validated so a decode/encode cycle cannot smuggle
                // reserved bytes back in via lossy UTF-8 replacement.
                let _ = metadata.set(&key, &value);
            }
        }
        metadata
    }
}

fn validate_component(s: &str) -> Result<(), Status> {
    if s.contains('=') || s.contains('\n') {
        return Err(Status::new(
            ErrorCode::InvalidArgument,
            format!("metadata component {s:?} contains a reserved character"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_bytes_match_wire_protocol() {
        assert_eq!(FrameKind::Start as u8, 0x01);
        assert_eq!(FrameKind::Data as u8, 0x02);
        assert_eq!(FrameKind::End as u8, 0x03);
        assert_eq!(FrameKind::Error as u8, 0x04);
        assert_eq!(FrameKind::Trailer as u8, 0x05);
        assert_eq!(FrameKind::Header as u8, 0x06);
        for byte in 1u8..=6 {
            assert_eq!(FrameKind::from_u8(byte).map(|k| k as u8), Some(byte));
        }
        assert_eq!(FrameKind::from_u8(0), None);
        assert_eq!(FrameKind::from_u8(7), None);
    }

    #[test]
    fn metadata_roundtrip_preserves_order_and_values() {
        let mut metadata = Metadata::new();
        metadata.set("grpc-status", "0").unwrap();
        metadata.set("x-request-id", "abc123").unwrap();
        metadata.set("content-type", "application/grpc").unwrap();

        let encoded = metadata.encode();
        assert_eq!(
            encoded.as_ref(),
            b"grpc-status=0\nx-request-id=abc123\ncontent-type=application/grpc\n"
        );
        assert_eq!(Metadata::decode(&encoded), metadata);
    }

    #[test]
    fn set_replaces_existing_key_in_place() {
        let mut metadata = Metadata::new();
        metadata.set("a", "1").unwrap();
        metadata.set("b", "2").unwrap();
        metadata.set("a", "3").unwrap();
        let pairs: Vec<_> = metadata.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn reserved_characters_are_rejected() {
        let mut metadata = Metadata::new();
        assert!(metadata.set("bad=key", "v").is_err());
        assert!(metadata.set("key", "bad\nvalue").is_err());
        assert!(metadata.is_empty());
    }

    #[test]
    fn decode_skips_malformed_lines() {
        let metadata = Metadata::decode(b"ok=1\nnoequals\n=emptykey\n");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("ok"), Some("1"));
    }
}
