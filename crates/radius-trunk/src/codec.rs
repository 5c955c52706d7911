//! Codec seam between the transport and the wire encoder/signer
//!
//! Encoding, signing and attribute decoding belong to the embedding server's
//! protocol library. The transport only requires the two operations below:
//! it supplies the ID it reserved and learns the signed authenticator from
//! the returned bytes, and it hands every candidate reply to `decode`
//! together with the authenticator it saved at encode time.

use crate::request::{Attribute, ProtocolRequest};
use crate::wire::AUTH_VECTOR_LENGTH;
use thiserror::Error;

/// Why encoding a request failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The encode buffer cannot hold the packet. When `need` is within the
    /// protocol maximum, raising `max_packet_size` will fix it.
    #[error("encode buffer too small: have {have} bytes, need {need}")]
    BufferTooSmall { have: usize, need: usize },

    /// The packet code is not encodable
    #[error("invalid packet code: {0}")]
    InvalidCode(u8),

    /// Attribute list could not be encoded
    #[error("attribute encoding failed: {0}")]
    Attribute(String),
}

/// Why a reply failed to decode or verify
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFail {
    /// Shorter than the RADIUS header
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    /// Declared length disagrees with the received bytes
    #[error("invalid packet length: {0}")]
    InvalidLength(usize),

    /// Response authenticator did not verify against the saved request
    /// authenticator
    #[error("bad response authenticator")]
    BadSignature,

    /// Message-Authenticator was required but absent
    #[error("missing Message-Authenticator")]
    MissingMessageAuthenticator,

    /// Message-Authenticator was present but did not verify
    #[error("bad Message-Authenticator")]
    BadMessageAuthenticator,

    /// The reply code is not one we recognise
    #[error("unknown reply code: {0}")]
    UnknownCode(u8),

    /// Attribute structure was malformed
    #[error("malformed attributes")]
    Malformed,
}

/// A decoded, verified reply
#[derive(Debug, Clone)]
pub struct DecodedReply {
    /// Reply packet code
    pub code: u8,
    /// Decoded attributes, Proxy-State already stripped by the codec
    pub attributes: Vec<Attribute>,
    /// Whether the reply carried a valid Message-Authenticator
    pub message_authenticator: bool,
}

/// Wire encoder/decoder contract
pub trait PacketCodec: Send + Sync {
    /// Encode and sign `request` under the given ID.
    ///
    /// When `add_proxy_state` is set the codec appends the configured
    /// Proxy-State to the request's extra attribute list (not its main
    /// list, so concurrent encodes of the same logical request stay
    /// independent). The returned bytes carry the final authenticator at
    /// [`crate::wire::AUTH_VECTOR_OFFSET`].
    fn encode(
        &self,
        request: &mut ProtocolRequest,
        id: u8,
        add_proxy_state: bool,
    ) -> Result<Vec<u8>, EncodeError>;

    /// Decode and verify a reply against the authenticator saved when the
    /// matching request was encoded.
    fn decode(
        &self,
        data: &[u8],
        request_authenticator: &[u8; AUTH_VECTOR_LENGTH],
        require_message_authenticator: bool,
    ) -> Result<DecodedReply, DecodeFail>;
}
