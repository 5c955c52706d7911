//! RADIUS wire-format constants and structural checks
//!
//! The transport never decodes attributes itself (that is the codec's job),
//! but it does need to read the packet header to match replies by ID, to
//! sanity-check lengths before handing bytes to the codec, and to walk the
//! attributes of a Protocol-Error reply for negotiation hints.

/// RADIUS header: code (1) + identifier (1) + length (2) + authenticator (16)
pub const HEADER_LENGTH: usize = 20;

/// Offset of the packet identifier byte
pub const ID_OFFSET: usize = 1;

/// Offset of the big-endian length field
pub const LENGTH_OFFSET: usize = 2;

/// Offset of the 16-byte authenticator vector
pub const AUTH_VECTOR_OFFSET: usize = 4;

/// Length of the authenticator vector
pub const AUTH_VECTOR_LENGTH: usize = 16;

/// Largest datagram the protocol can describe
pub const MAX_PACKET_SIZE: usize = 65535;

/// Smallest receive buffer we will negotiate down to
pub const MIN_BUFFER_SIZE: usize = 4096;

/// User-Password (RFC 2865)
pub const ATTR_USER_PASSWORD: u8 = 2;

/// NAS-Identifier (RFC 2865)
pub const ATTR_NAS_IDENTIFIER: u8 = 32;

/// Proxy-State (RFC 2865)
pub const ATTR_PROXY_STATE: u8 = 33;

/// Message-Authenticator (RFC 2869)
pub const ATTR_MESSAGE_AUTHENTICATOR: u8 = 80;

/// Error-Cause (RFC 5176)
pub const ATTR_ERROR_CAUSE: u8 = 101;

/// Extended-Attribute-1 (RFC 6929)
pub const ATTR_EXTENDED_1: u8 = 241;

/// Response-Length, extended type inside Extended-Attribute-1 (RFC 7930)
pub const EXT_RESPONSE_LENGTH: u8 = 3;

/// Original-Packet-Code, extended type inside Extended-Attribute-1 (RFC 7930)
pub const EXT_ORIGINAL_PACKET_CODE: u8 = 4;

/// Error-Cause value meaning "Response Too Big" (RFC 7930)
pub const ERROR_CAUSE_RESPONSE_TOO_BIG: u32 = 601;

/// Structurally validate a received datagram.
///
/// Checks the declared length against the received length and walks the
/// attribute list so the codec gets a known-valid slice. Trailing bytes
/// beyond the declared length are permitted and ignored, per RFC 2865.
///
/// Returns the declared packet length on success.
pub fn packet_ok(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_LENGTH {
        return None;
    }

    let declared = u16::from_be_bytes([data[LENGTH_OFFSET], data[LENGTH_OFFSET + 1]]) as usize;
    if declared < HEADER_LENGTH || declared > data.len() {
        return None;
    }

    // Each attribute is type (1) + length (1, >= 2) + value.
    let mut offset = HEADER_LENGTH;
    while offset < declared {
        if declared - offset < 2 {
            return None;
        }
        let attr_len = data[offset + 1] as usize;
        if attr_len < 2 || offset + attr_len > declared {
            return None;
        }
        offset += attr_len;
    }

    Some(declared)
}

/// Negotiation hints extracted from a Protocol-Error reply
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolErrorHints {
    /// Error-Cause = 601 (Response Too Big) was present
    pub response_too_big: bool,
    /// Requested receive buffer size, if the peer sent Response-Length
    pub response_length: Option<u32>,
    /// Original-Packet-Code was present but did not match our request
    pub code_mismatch: bool,
}

/// Walk the attributes of a valid Protocol-Error packet.
///
/// `data` must already have passed [`packet_ok`]. Recognises Error-Cause
/// and, inside Extended-Attribute-1, Response-Length and
/// Original-Packet-Code. An Original-Packet-Code whose value is not an
/// 8-bit number equal to `expected_code` marks the reply as a mismatch.
pub fn parse_protocol_error(data: &[u8], expected_code: u8) -> ProtocolErrorHints {
    let mut hints = ProtocolErrorHints::default();
    let end = u16::from_be_bytes([data[LENGTH_OFFSET], data[LENGTH_OFFSET + 1]]) as usize;

    let mut offset = HEADER_LENGTH;
    while offset + 2 <= end {
        let attr_type = data[offset];
        let attr_len = data[offset + 1] as usize;
        if attr_len < 2 || offset + attr_len > end {
            break;
        }
        let value = &data[offset + 2..offset + attr_len];
        offset += attr_len;

        match attr_type {
            ATTR_ERROR_CAUSE if value.len() == 4 => {
                let cause = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                if cause == ERROR_CAUSE_RESPONSE_TOO_BIG {
                    hints.response_too_big = true;
                }
            }
            ATTR_EXTENDED_1 if value.len() == 5 => {
                let ext_type = value[0];
                let payload = &value[1..5];
                match ext_type {
                    EXT_RESPONSE_LENGTH => {
                        hints.response_length = Some(u32::from_be_bytes([
                            payload[0], payload[1], payload[2], payload[3],
                        ]));
                    }
                    EXT_ORIGINAL_PACKET_CODE => {
                        // Must be three zero bytes followed by the code.
                        if payload[0] != 0 || payload[1] != 0 || payload[2] != 0 {
                            hints.code_mismatch = true;
                        } else if payload[3] != expected_code {
                            hints.code_mismatch = true;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    hints
}
