//! Thrill wire protocol: message types and their byte encoding.
//!
//! Requests and responses are bare UTF-8 text commands. The ranging token travels as a
//! bincode `TokenEnvelope`, which is only tried after both text prefixes fail to match.

use serde::{Deserialize, Serialize};

use crate::identity::DiscoveryToken;

/// Version carried in the token envelope and in discovery beacons.
pub const PROTOCOL_VERSION: u8 = 1;

pub const REQUEST_PREFIX: &str = "THRILL_REQUEST_FROM_";
pub const RESPONSE_PREFIX: &str = "THRILL_RESPONSE_";
const ACCEPT_INFIX: &str = "ACCEPT_FROM_";
const DECLINE_INFIX: &str = "DECLINE_FROM_";

const TOKEN_MAGIC: [u8; 4] = *b"THTK";

/// Messages exchanged between engines over a transport link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Our ranging token, sent as soon as the link is up.
    RangingTokenShare(DiscoveryToken),
    /// `from` is the sender's display name.
    ThrillRequest { from: String },
    /// `from` is the responder, not the original requester.
    ThrillResponse { accepted: bool, from: String },
}

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    magic: [u8; 4],
    version: u8,
    token: Vec<u8>,
}

/// Encode a message into the bytes handed to `Transport::send`.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    match msg {
        Message::RangingTokenShare(token) => {
            if token.is_empty() {
                return Err(EncodeError::EmptyToken);
            }
            let envelope = TokenEnvelope {
                magic: TOKEN_MAGIC,
                version: PROTOCOL_VERSION,
                token: token.as_bytes().to_vec(),
            };
            Ok(bincode::serialize(&envelope)?)
        }
        Message::ThrillRequest { from } => Ok(format!("{}{}", REQUEST_PREFIX, from).into_bytes()),
        Message::ThrillResponse { accepted, from } => {
            let infix = if *accepted { ACCEPT_INFIX } else { DECLINE_INFIX };
            Ok(format!("{}{}{}", RESPONSE_PREFIX, infix, from).into_bytes())
        }
    }
}

/// Decode received bytes. Text prefixes always win over token decoding, so a payload
/// that starts with a known prefix but is malformed is rejected rather than retried as
/// a token.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if let Some(from) = text.strip_prefix(REQUEST_PREFIX) {
            return Ok(Message::ThrillRequest {
                from: from.to_owned(),
            });
        }
        if let Some(rest) = text.strip_prefix(RESPONSE_PREFIX) {
            if let Some(from) = rest.strip_prefix(ACCEPT_INFIX) {
                return Ok(Message::ThrillResponse {
                    accepted: true,
                    from: from.to_owned(),
                });
            }
            if let Some(from) = rest.strip_prefix(DECLINE_INFIX) {
                return Ok(Message::ThrillResponse {
                    accepted: false,
                    from: from.to_owned(),
                });
            }
            return Err(DecodeError::MalformedResponse);
        }
    }
    decode_token(bytes)
}

fn decode_token(bytes: &[u8]) -> Result<Message, DecodeError> {
    let envelope: TokenEnvelope = bincode::deserialize(bytes)?;
    if envelope.magic != TOKEN_MAGIC {
        return Err(DecodeError::Unrecognized);
    }
    if envelope.version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(envelope.version));
    }
    if envelope.token.is_empty() {
        return Err(DecodeError::EmptyToken);
    }
    Ok(Message::RangingTokenShare(DiscoveryToken::from_bytes(
        envelope.token,
    )))
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("refusing to share an empty ranging token")]
    EmptyToken,
}

/// Received bytes matched no known message shape.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("response command without ACCEPT/DECLINE")]
    MalformedResponse,
    #[error("not a token envelope")]
    Unrecognized,
    #[error("unsupported token envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("empty ranging token")]
    EmptyToken,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
