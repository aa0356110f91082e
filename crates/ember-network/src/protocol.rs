//! Wire protocol: message envelope, tags, and frame codec.
//!
//! Every message travels as `{"type": <tag>, "data": <payload>, "from": <id>}`.
//! Binary frames are gzip-compressed JSON; text frames are accepted
//! unchanged as JSON. Relay hops wrap the opaque inner frame in base64.

use std::io::{Read, Write};

use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ember_core::error::ProtocolError;

/// Upper bound on a single frame, compressed or not.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Message tags of the peer protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    #[serde(rename = "REGISTER_PEER")]
    RegisterPeer,
    #[serde(rename = "PEER_LIST")]
    PeerList,
    #[serde(rename = "REQUEST_CHAIN_LENGTH")]
    RequestChainLength,
    #[serde(rename = "RESPONSE_CHAIN_LENGTH")]
    ResponseChainLength,
    #[serde(rename = "REQUEST_BLOCKS")]
    RequestBlocks,
    #[serde(rename = "RESPONSE_BLOCKS")]
    ResponseBlocks,
    #[serde(rename = "REQUEST_CHAIN")]
    RequestChain,
    #[serde(rename = "RESPONSE_CHAIN")]
    ResponseChain,
    #[serde(rename = "NEW_BLOCK")]
    NewBlock,
    #[serde(rename = "NEW_TX")]
    NewTx,
    #[serde(rename = "REQUEST_TX_POOL")]
    RequestTxPool,
    #[serde(rename = "RESPONSE_TX_POOL")]
    ResponseTxPool,
    #[serde(rename = "REQUEST_TX")]
    RequestTx,
    #[serde(rename = "RESPONSE_TX")]
    ResponseTx,
    #[serde(rename = "RELAY_MESSAGE")]
    RelayMessage,
    #[serde(rename = "RELAY_FAILURE")]
    RelayFailure,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The serde rename is the canonical name.
        let s = serde_json::to_string(self).unwrap_or_default();
        f.write_str(s.trim_matches('"'))
    }
}

/// A protocol message: tag, payload, and the sender's node id or URI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: Value,
    pub from: String,
}

impl Envelope {
    /// Build an envelope from any serializable payload.
    pub fn new<T: Serialize>(
        kind: MessageKind,
        data: &T,
        from: &str,
    ) -> Result<Envelope, ProtocolError> {
        let data = serde_json::to_value(data)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        Ok(Envelope { kind, data, from: from.to_string() })
    }

    /// Deserialize the payload into a concrete type, validating on ingress.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::BadPayload {
            tag: self.kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Encode as a gzip-compressed JSON binary frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| ProtocolError::BadCompression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| ProtocolError::BadCompression(e.to_string()))
    }

    /// Decode a binary (gzip JSON) frame.
    pub fn decode_binary(frame: &[u8]) -> Result<Envelope, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: frame.len(), max: MAX_FRAME_SIZE });
        }
        let mut json = Vec::new();
        GzDecoder::new(frame)
            // Bound the decompressed size as well as the wire size.
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_to_end(&mut json)
            .map_err(|e| ProtocolError::BadCompression(e.to_string()))?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: json.len(), max: MAX_FRAME_SIZE });
        }
        serde_json::from_slice(&json).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Decode a text frame (uncompressed JSON, accepted unchanged).
    pub fn decode_text(frame: &str) -> Result<Envelope, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: frame.len(), max: MAX_FRAME_SIZE });
        }
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

/// Payload of [`MessageKind::RelayMessage`]: the opaque inner frame headed
/// for `target_uri`, base64 on the hop between peer and boot node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelayPayload {
    pub target_uri: String,
    pub data: String,
}

/// Payload of [`MessageKind::RelayFailure`], returned by the boot node when
/// the target is unreachable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelayFailurePayload {
    pub target_uri: String,
    pub reason: String,
}

/// Wrap an encoded frame for relay through the boot node.
pub fn wrap_relay(target_uri: &str, frame: &[u8], from: &str) -> Result<Envelope, ProtocolError> {
    Envelope::new(
        MessageKind::RelayMessage,
        &RelayPayload {
            target_uri: target_uri.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(frame),
        },
        from,
    )
}

/// Unwrap a relayed payload back into the original inner frame bytes.
pub fn unwrap_relay(payload: &RelayPayload) -> Result<Vec<u8>, ProtocolError> {
    base64::engine::general_purpose::STANDARD
        .decode(&payload.data)
        .map_err(|_| ProtocolError::InvalidBase64)
}
