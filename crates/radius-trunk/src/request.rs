//! Request-side data types
//!
//! A [`ClientRequest`] is what the embedder hands to the dispatcher. The
//! dispatcher turns it into a [`ProtocolRequest`], the unit that moves
//! through the trunk queues, plus a [`ResultSlot`] holding the resume
//! channel. Status-check requests are `ProtocolRequest`s too, built
//! internally and reused for the lifetime of their connection.

use crate::code::ResultCode;
use crate::retry::RetryState;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::oneshot;

/// A raw attribute: type byte plus opaque value
///
/// Dictionary interpretation belongs to the codec; the transport only ever
/// matches type bytes (Message-Authenticator, NAS-Identifier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub attr_type: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(attr_type: u8, value: Vec<u8>) -> Self {
        Attribute { attr_type, value }
    }

    pub fn string(attr_type: u8, value: &str) -> Self {
        Attribute {
            attr_type,
            value: value.as_bytes().to_vec(),
        }
    }
}

/// One exchange as submitted by the embedding engine
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Packet code (1..255)
    pub code: u8,
    /// Scheduling priority; larger is more important
    pub priority: u32,
    /// When the embedder received the triggering packet
    pub recv_time: Instant,
    /// Attributes to encode
    pub attributes: Vec<Attribute>,
    /// In proxy mode, the packet code of the parent request when the
    /// parent is protocol-compatible with this one; `None` when we
    /// originate the packet ourselves
    pub parent_code: Option<u8>,
}

/// One logical RADIUS exchange as tracked by the trunk
#[derive(Debug)]
pub struct ProtocolRequest {
    /// Packet code
    pub code: u8,
    /// Scheduling priority; status checks always use `u32::MAX`
    pub priority: u32,
    /// Receive timestamp used as the scheduling tie-breaker
    pub recv_time: Instant,
    /// Re-add Message-Authenticator at encode time and require it on the
    /// reply
    pub require_message_authenticator: bool,
    /// This is a liveness probe, not user traffic
    pub status_check: bool,
    /// Forwarded on behalf of a downstream client; retransmission is
    /// driven by upstream DUP signals
    pub proxied: bool,
    /// Attributes to encode
    pub attributes: Vec<Attribute>,
    /// Attributes appended by the encoder (e.g. Proxy-State), kept apart
    /// from the caller's list
    pub extra: Vec<Attribute>,
    /// Encoded signed packet, populated lazily at first write
    pub packet: Option<Vec<u8>>,
    /// Bytes already written when a stream write came up short
    pub partial: usize,
    /// Reserved RADIUS ID, valid only while tracked by a connection
    pub id: Option<u8>,
    /// Valid replies seen for this request
    pub num_replies: u32,
    /// Retransmission schedule, set once the request is accepted
    pub retry: Option<RetryState>,
}

impl ProtocolRequest {
    pub fn new(code: u8, priority: u32, recv_time: Instant) -> Self {
        ProtocolRequest {
            code,
            priority,
            recv_time,
            require_message_authenticator: false,
            status_check: false,
            proxied: false,
            attributes: Vec::new(),
            extra: Vec::new(),
            packet: None,
            partial: 0,
            id: None,
            num_replies: 0,
            retry: None,
        }
    }

    /// Drop connection-specific state: encoded bytes, partial offset and
    /// encoder-appended attributes. The ID must already have been released
    /// back to its tracker.
    pub fn reset(&mut self) {
        debug_assert!(self.id.is_none(), "reset with a reserved ID");
        self.packet = None;
        self.partial = 0;
        self.extra.clear();
    }
}

/// Completion state for one submitted request
#[derive(Debug)]
pub struct ResultSlot {
    /// Result delivered on resume; failures are the default so an early
    /// teardown never reports success
    pub rcode: ResultCode,
    /// Set when the pending write is a retransmission
    pub is_retry: bool,
    tx: Option<oneshot::Sender<ResultCode>>,
}

impl ResultSlot {
    pub fn new(tx: oneshot::Sender<ResultCode>) -> Self {
        ResultSlot {
            rcode: ResultCode::Fail,
            is_retry: false,
            tx: Some(tx),
        }
    }

    /// Slot for internal requests that never resume a caller
    pub fn detached() -> Self {
        ResultSlot {
            rcode: ResultCode::Fail,
            is_retry: false,
            tx: None,
        }
    }

    /// Resume the caller with `rcode`. Idempotent: only the first call
    /// delivers anything.
    pub fn resolve(&mut self, rcode: ResultCode) {
        self.rcode = rcode;
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped its receiver; nothing to do then.
            let _ = tx.send(rcode);
        }
    }

    /// Whether the caller has already been resumed
    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}
