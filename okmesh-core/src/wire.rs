//! Framing: BLE messages are a 4-byte big-endian length prefix + opaque payload.
//! Discovery datagrams are bincode-encoded `DiscoveryMessage`s.

use crate::protocol::DiscoveryMessage;

pub const LEN_SIZE: usize = 4;
/// Largest payload a peer may declare in a BLE length prefix.
pub const MAX_MESSAGE_LEN: u32 = 1024 * 1024; // 1 MiB
const MAX_DISCOVERY_LEN: usize = 256;

/// Prefix `payload` with its length (4 bytes BE).
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_MESSAGE_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error framing a payload (only size can fail).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload too large to frame")]
    TooLarge,
}

/// Read the declared payload length from the front of a first chunk.
pub fn decode_length(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_MESSAGE_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

/// Error reading a length prefix.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared length {0} exceeds limit")]
    TooLarge(u32),
}

/// Encode a discovery message into one datagram.
pub fn encode_discovery(msg: &DiscoveryMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode one discovery datagram. Oversized or malformed datagrams are rejected.
pub fn decode_discovery(bytes: &[u8]) -> Result<DiscoveryMessage, DiscoveryDecodeError> {
    if bytes.len() > MAX_DISCOVERY_LEN {
        return Err(DiscoveryDecodeError::TooLarge);
    }
    bincode::deserialize(bytes).map_err(DiscoveryDecodeError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryDecodeError {
    #[error("datagram too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
