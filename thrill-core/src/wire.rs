//! Framing for host links: length-prefix (4 bytes LE) + payload, and the bincode
//! discovery beacon that rides on top of it.

use serde::{Deserialize, Serialize};

use crate::protocol::PROTOCOL_VERSION;

const LEN_SIZE: usize = 4;
/// Thrill payloads are tiny; anything larger is a broken or hostile peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Presence announcement for LAN discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u8,
    /// Shared service identifier; beacons for other services are ignored.
    pub service_id: String,
    /// Display name, used as the remote `PeerId`.
    pub name: String,
    /// TCP port the sender accepts links on.
    pub transport_port: u16,
}

impl Beacon {
    pub fn new(service_id: &str, name: &str, transport_port: u16) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            service_id: service_id.to_owned(),
            name: name.to_owned(),
            transport_port,
        }
    }
}

/// Wrap a payload into a single frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Returns `NeedMore` on a partial buffer; call again once more data arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Validate a length header read off a stream.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

pub fn encode_beacon(beacon: &Beacon) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(beacon)?;
    encode_frame(&payload)
}

pub fn decode_beacon(bytes: &[u8]) -> Result<Beacon, FrameDecodeError> {
    let (payload, _) = decode_frame(bytes)?;
    Ok(bincode::deserialize(payload)?)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let beacon = Beacon::new("insta-nearby", "Mike", 45691);
        let frame = encode_beacon(&beacon).unwrap();
        assert_eq!(decode_beacon(&frame).unwrap(), beacon);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(b"THRILL_REQUEST_FROM_Mike").unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE + 3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let fa = encode_frame(b"first").unwrap();
        let fb = encode_frame(b"second").unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (a, n1) = decode_frame(&buf).unwrap();
        assert_eq!(a, b"first");
        assert_eq!(n1, fa.len());
        let (b, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(b, b"second");
        assert_eq!(n2, fb.len());
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
        let big = vec![0u8; MAX_FRAME_LEN as usize + 1];
        assert!(matches!(encode_frame(&big), Err(FrameEncodeError::TooLarge)));
    }
}
