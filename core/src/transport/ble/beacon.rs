/// BLE beacon payload for proximity tracing
///
/// Layout (19 bytes):
///
/// | bytes | field                                   |
/// |-------|-----------------------------------------|
/// | 0..2  | service UUID `0xC019`, little endian    |
/// | 2     | payload version                         |
/// | 3..19 | broadcast identifier                    |
///
/// The parser is a validation boundary only: identifiers are not
/// authenticated here.

use crate::identity::{BroadcastIdentifier, IdentifierBytes, IDENTIFIER_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tracer service UUID (0xC019)
pub const TRACER_SERVICE_UUID: u16 = 0xC019;

/// Current payload version
pub const BEACON_VERSION: u8 = 0x01;

/// Encoded payload length
pub const BEACON_LEN: usize = 2 + 1 + IDENTIFIER_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    #[error("Invalid beacon length: {0}")]
    InvalidLength(usize),
    #[error("Foreign service UUID: {0:#06x}")]
    ForeignService(u16),
    #[error("Unsupported beacon version: {0}")]
    UnsupportedVersion(u8),
}

/// Identifier decoded from a remote device's beacon. Serialized as hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteIdentifier(pub IdentifierBytes);

impl RemoteIdentifier {
    pub fn as_bytes(&self) -> &IdentifierBytes {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short display name for status output
    pub fn display_name(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for RemoteIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for RemoteIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RemoteIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        let bytes = hex::decode(&hex_str).map_err(serde::de::Error::custom)?;
        let bytes: IdentifierBytes = bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("expected {} bytes, got {}", IDENTIFIER_LEN, v.len()))
        })?;
        Ok(RemoteIdentifier(bytes))
    }
}

/// Encode the advertisement payload for an identifier
pub fn encode_beacon(identifier: &BroadcastIdentifier) -> Vec<u8> {
    let mut payload = Vec::with_capacity(BEACON_LEN);
    payload.extend_from_slice(&TRACER_SERVICE_UUID.to_le_bytes());
    payload.push(BEACON_VERSION);
    payload.extend_from_slice(&identifier.bytes);
    payload
}

/// Validate and decode a received advertisement payload
pub fn parse_beacon(payload: &[u8]) -> Result<RemoteIdentifier, BeaconError> {
    if payload.len() != BEACON_LEN {
        return Err(BeaconError::InvalidLength(payload.len()));
    }

    let uuid = u16::from_le_bytes([payload[0], payload[1]]);
    if uuid != TRACER_SERVICE_UUID {
        return Err(BeaconError::ForeignService(uuid));
    }

    if payload[2] != BEACON_VERSION {
        return Err(BeaconError::UnsupportedVersion(payload[2]));
    }

    let mut bytes = [0u8; IDENTIFIER_LEN];
    bytes.copy_from_slice(&payload[3..]);
    Ok(RemoteIdentifier(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(fill: u8) -> BroadcastIdentifier {
        BroadcastIdentifier {
            bytes: [fill; IDENTIFIER_LEN],
            issued_at: 0,
            expires_at: 900,
        }
    }

    #[test]
    fn test_encoded_layout() {
        let payload = encode_beacon(&identifier(0xAA));

        assert_eq!(payload.len(), BEACON_LEN);
        assert_eq!(&payload[..2], &[0x19, 0xC0]);
        assert_eq!(payload[2], BEACON_VERSION);
        assert!(payload[3..].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn test_parse_recovers_identifier() {
        let payload = encode_beacon(&identifier(0x42));
        let remote = parse_beacon(&payload).unwrap();
        assert_eq!(remote.as_bytes(), &[0x42; IDENTIFIER_LEN]);
    }

    #[test]
    fn test_parse_rejects_short_payload() {
        assert_eq!(parse_beacon(&[0x19, 0xC0, 1]), Err(BeaconError::InvalidLength(3)));
        assert_eq!(parse_beacon(&[]), Err(BeaconError::InvalidLength(0)));
    }

    #[test]
    fn test_parse_rejects_foreign_service() {
        let mut payload = encode_beacon(&identifier(1));
        payload[0] = 0x6F;
        payload[1] = 0xFD;
        assert_eq!(parse_beacon(&payload), Err(BeaconError::ForeignService(0xFD6F)));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let mut payload = encode_beacon(&identifier(1));
        payload[2] = 0x02;
        assert_eq!(parse_beacon(&payload), Err(BeaconError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_display_name_is_short_hex() {
        let remote = RemoteIdentifier([0xAB; IDENTIFIER_LEN]);
        assert_eq!(remote.display_name(), "abababab");
        assert_eq!(remote.to_string().len(), IDENTIFIER_LEN * 2);
    }

    #[test]
    fn test_remote_identifier_serializes_as_hex() {
        let remote = RemoteIdentifier([0x0F; IDENTIFIER_LEN]);
        let json = serde_json::to_string(&remote).unwrap();
        assert_eq!(json, format!("\"{}\"", "0f".repeat(IDENTIFIER_LEN)));

        let back: RemoteIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, remote);
        assert!(serde_json::from_str::<RemoteIdentifier>("\"0f0f\"").is_err());
    }
}
