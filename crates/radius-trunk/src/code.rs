//! RADIUS packet codes and the reply-code → result-code mapping

/// RADIUS packet codes as defined in RFC 2865, 2866, 5176, 5997 and 7930
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Access-Request (1)
    AccessRequest = 1,
    /// Access-Accept (2)
    AccessAccept = 2,
    /// Access-Reject (3)
    AccessReject = 3,
    /// Accounting-Request (4) - RFC 2866
    AccountingRequest = 4,
    /// Accounting-Response (5) - RFC 2866
    AccountingResponse = 5,
    /// Access-Challenge (11)
    AccessChallenge = 11,
    /// Status-Server (12) - RFC 5997
    StatusServer = 12,
    /// Status-Client (13) - RFC 5997
    StatusClient = 13,
    /// Disconnect-Request (40) - RFC 5176
    DisconnectRequest = 40,
    /// Disconnect-ACK (41) - RFC 5176
    DisconnectAck = 41,
    /// Disconnect-NAK (42) - RFC 5176
    DisconnectNak = 42,
    /// CoA-Request (43) - RFC 5176
    CoaRequest = 43,
    /// CoA-ACK (44) - RFC 5176
    CoaAck = 44,
    /// CoA-NAK (45) - RFC 5176
    CoaNak = 45,
    /// Protocol-Error (52) - RFC 7930
    ProtocolError = 52,
}

impl Code {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Code::AccessRequest),
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            4 => Some(Code::AccountingRequest),
            5 => Some(Code::AccountingResponse),
            11 => Some(Code::AccessChallenge),
            12 => Some(Code::StatusServer),
            13 => Some(Code::StatusClient),
            40 => Some(Code::DisconnectRequest),
            41 => Some(Code::DisconnectAck),
            42 => Some(Code::DisconnectNak),
            43 => Some(Code::CoaRequest),
            44 => Some(Code::CoaAck),
            45 => Some(Code::CoaNak),
            52 => Some(Code::ProtocolError),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable packet name for logging
    pub fn name(value: u8) -> &'static str {
        match Code::from_u8(value) {
            Some(Code::AccessRequest) => "Access-Request",
            Some(Code::AccessAccept) => "Access-Accept",
            Some(Code::AccessReject) => "Access-Reject",
            Some(Code::AccountingRequest) => "Accounting-Request",
            Some(Code::AccountingResponse) => "Accounting-Response",
            Some(Code::AccessChallenge) => "Access-Challenge",
            Some(Code::StatusServer) => "Status-Server",
            Some(Code::StatusClient) => "Status-Client",
            Some(Code::DisconnectRequest) => "Disconnect-Request",
            Some(Code::DisconnectAck) => "Disconnect-ACK",
            Some(Code::DisconnectNak) => "Disconnect-NAK",
            Some(Code::CoaRequest) => "CoA-Request",
            Some(Code::CoaAck) => "CoA-ACK",
            Some(Code::CoaNak) => "CoA-NAK",
            Some(Code::ProtocolError) => "Protocol-Error",
            None => "Unknown",
        }
    }
}

/// Outcome delivered to the caller for one submitted exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Positive reply (Access-Accept, Accounting-Response, CoA-ACK, Disconnect-ACK)
    Ok,
    /// Access-Challenge - the conversation continues
    Updated,
    /// Negative reply (Access-Reject, CoA-NAK, Disconnect-NAK)
    Reject,
    /// Protocol-Error reply, consumed after negotiation handling
    Handled,
    /// Transport failure, retry exhaustion, or an unusable reply
    Fail,
    /// Caller-initiated rejection (e.g. submitting Status-Server)
    Noop,
}

/// Map a reply packet code to the result code handed back to the caller.
///
/// Codes with no entry map to [`ResultCode::Fail`].
pub fn reply_to_result(code: u8) -> ResultCode {
    match Code::from_u8(code) {
        Some(Code::AccessAccept)
        | Some(Code::AccountingResponse)
        | Some(Code::CoaAck)
        | Some(Code::DisconnectAck) => ResultCode::Ok,
        Some(Code::AccessChallenge) => ResultCode::Updated,
        Some(Code::AccessReject) | Some(Code::CoaNak) | Some(Code::DisconnectNak) => {
            ResultCode::Reject
        }
        Some(Code::ProtocolError) => ResultCode::Handled,
        _ => ResultCode::Fail,
    }
}
