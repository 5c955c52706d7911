//! Dispatcher: the public entry for one request/response exchange
//!
//! The embedding engine submits a [`ClientRequest`] and receives a
//! [`Submission`]: a oneshot channel that resumes with exactly one
//! [`ResultCode`], plus a handle for signalling CANCEL or DUP while the
//! exchange is in flight. The dispatcher vets the packet code, scrubs the
//! caller's Message-Authenticator, picks the retry schedule from
//! mode × code, and hands the request to the trunk.

use crate::code::{Code, ResultCode};
use crate::config::{Mode, RetrySettings, Transport, TrunkConfig};
use crate::request::{ClientRequest, ProtocolRequest, ResultSlot};
use crate::trunk::{EnqueueOutcome, EntryId, Trunk};
use crate::wire;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Signals the embedding engine may deliver while an exchange is yielded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Abort the exchange; the caller is resumed once with FAIL
    Cancel,
    /// A duplicate arrived from downstream; retransmit in proxy mode
    Dup,
}

/// A submitted exchange: await `result` for the final code
pub struct Submission {
    /// Handle for signalling; absent when the request was rejected
    /// immediately
    pub handle: Option<EntryId>,
    /// Resumes with exactly one result code
    pub result: oneshot::Receiver<ResultCode>,
}

/// Public entry bound to one trunk
pub struct Dispatcher {
    config: Arc<TrunkConfig>,
}

impl Dispatcher {
    pub fn new(config: Arc<TrunkConfig>) -> Self {
        Dispatcher { config }
    }

    /// Submit one exchange.
    ///
    /// The returned channel always yields exactly one result: immediately
    /// for rejected submissions, otherwise when a reply arrives, the retry
    /// schedule is exhausted, or the exchange is cancelled.
    pub fn submit(&self, trunk: &mut Trunk, request: ClientRequest, now: Instant) -> Submission {
        let (tx, rx) = oneshot::channel();
        let mut slot = ResultSlot::new(tx);

        if request.code == Code::StatusServer.as_u8() {
            warn!("Status-Server is reserved for internal use and cannot be sent manually");
            slot.resolve(ResultCode::Noop);
            return Submission {
                handle: None,
                result: rx,
            };
        }

        if !self.config.allows(request.code) {
            warn!(
                code = Code::name(request.code),
                "Packet code is not allowed for this trunk"
            );
            slot.resolve(ResultCode::Noop);
            return Submission {
                handle: None,
                result: rx,
            };
        }

        let mut proto = ProtocolRequest::new(request.code, request.priority, request.recv_time);
        proto.attributes = request.attributes;

        // The caller's Message-Authenticator only marks intent: the encoder
        // adds the real one, and the reply must then carry a valid one too.
        if proto
            .attributes
            .iter()
            .any(|a| a.attr_type == wire::ATTR_MESSAGE_AUTHENTICATOR)
        {
            proto.require_message_authenticator = true;
            proto
                .attributes
                .retain(|a| a.attr_type != wire::ATTR_MESSAGE_AUTHENTICATOR);
        }

        let retry = match self.config.mode {
            Mode::Proxy => {
                // Same code as a compatible parent: the downstream client
                // handles retransmission, we just wait out the window.
                proto.proxied = request.parent_code == Some(request.code);
                if proto.proxied {
                    self.config.timeout_retry
                } else {
                    self.originated_retry(request.code)
                }
            }
            Mode::Client => self.originated_retry(request.code),
            Mode::Replicate => self.config.timeout_retry,
        };

        match trunk.enqueue(proto, slot) {
            Ok((outcome, id)) => {
                debug!(
                    code = Code::name(request.code),
                    ?outcome,
                    "Request accepted"
                );
                trunk.start_retry(id, retry.to_retry_config(), now);
                Submission {
                    handle: Some(id),
                    result: rx,
                }
            }
            Err((outcome, _request, mut slot)) => {
                match outcome {
                    EnqueueOutcome::NoCapacity => {
                        warn!("Unable to queue packet, connections at maximum capacity");
                    }
                    EnqueueOutcome::DstUnavailable => {
                        warn!("All destinations are down, cannot send packet");
                    }
                    _ => warn!("Unable to queue packet"),
                }
                slot.resolve(ResultCode::Fail);
                Submission {
                    handle: None,
                    result: rx,
                }
            }
        }
    }

    /// Retry schedule for a packet we originate ourselves: per-code tables
    /// over datagrams, a single timeout over streams.
    fn originated_retry(&self, code: u8) -> RetrySettings {
        match self.config.transport {
            Transport::Datagram => self.config.retry_for(code),
            Transport::Stream => self.config.timeout_retry,
        }
    }

    /// Deliver a signal for a yielded exchange
    pub fn signal(&self, trunk: &mut Trunk, handle: EntryId, signal: Signal, now: Instant) {
        match signal {
            Signal::Cancel => trunk.cancel(handle, now),
            Signal::Dup => {
                // Outside synchronous proxying the transport times its own
                // retransmissions; a downstream duplicate means nothing.
                if self.config.mode != Mode::Proxy {
                    debug!("Ignoring DUP signal outside proxy mode");
                    return;
                }
                trunk.dup(handle, now);
            }
        }
    }
}
