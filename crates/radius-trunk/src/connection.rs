//! One pooled connection: socket, receive buffer, ID tracker, liveness
//!
//! A connection's liveness walks Init → Connecting → (StatusChecking) →
//! Active, drops to Zombie when sends go unanswered, and either probes its
//! way back to Active or is torn down and revived. All transitions are
//! driven by the trunk; this module owns the per-connection state and the
//! small helpers the trunk composes.

use crate::link::LinkIo;
use crate::track::IdTracker;
use crate::trunk::{EntryId, QueueKey};
use crate::wire;
use std::collections::BinaryHeap;
use std::io;
use std::time::Instant;
use tracing::debug;

/// Liveness of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Allocated, no socket yet
    Init,
    /// Nonblocking connect issued, waiting for writability
    Connecting,
    /// Probing; becomes Active after enough contiguous good replies
    StatusChecking,
    /// Accepting and sending requests
    Active,
    /// Stopped replying; no new assignments while we decide its fate
    Zombie,
    /// Torn down, waiting out the revive interval before reconnecting
    DeadRevive,
    /// Shut down for good
    Closed,
}

/// Per-connection traffic counters
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnStats {
    /// Requests written to the wire (including retransmissions)
    pub requests_sent: u64,
    /// Valid replies matched to a tracked ID
    pub replies_received: u64,
    /// Requests that exhausted their retransmission schedule here
    pub timeouts: u64,
}

/// Outcome of draining one datagram from the socket
pub(crate) enum ReadOutcome {
    /// Nothing more to read
    Empty,
    /// One complete datagram, copied out of the receive buffer
    Packet(Vec<u8>),
    /// Shorter than a RADIUS header; logged and skipped
    Runt(usize),
    /// The socket is broken; reconnect
    Fatal(io::Error),
}

pub(crate) struct Connection {
    /// Stable index in the trunk's pool, for logging
    pub(crate) index: usize,
    /// Live link, absent while DeadRevive
    pub(crate) io: Option<Box<dyn LinkIo>>,
    pub(crate) state: ConnState,
    /// Receive buffer; Protocol-Error negotiation may grow it
    pub(crate) buffer: Vec<u8>,
    pub(crate) tracker: IdTracker,
    /// Requests assigned here, waiting to be written
    pub(crate) pending: BinaryHeap<QueueKey>,
    /// Request mid-write on a blocked stream socket
    pub(crate) partial: Option<EntryId>,
    pub(crate) write_blocked: bool,

    /// When we last received any valid reply
    pub(crate) last_reply: Option<Instant>,
    /// First send since the connection went idle
    pub(crate) first_sent: Option<Instant>,
    /// Most recent send
    pub(crate) last_sent: Option<Instant>,
    /// Last time the connection had nothing tracked
    pub(crate) last_idle: Instant,
    /// Most recent send time that produced a reply
    pub(crate) mrs_time: Option<Instant>,

    /// Armed timer deadlines; timers are cancelled lazily by comparing
    /// the firing deadline against these
    pub(crate) zombie_deadline: Option<Instant>,
    pub(crate) revive_deadline: Option<Instant>,
    pub(crate) status_deadline: Option<Instant>,

    /// The reusable status-check entry bound to this connection
    pub(crate) status_entry: Option<EntryId>,

    pub(crate) stats: ConnStats,
}

impl Connection {
    pub(crate) fn new(
        index: usize,
        io: Option<Box<dyn LinkIo>>,
        buffer_size: usize,
        now: Instant,
    ) -> Self {
        let state = if io.is_some() {
            ConnState::Connecting
        } else {
            ConnState::Init
        };
        Connection {
            index,
            io,
            state,
            buffer: vec![0u8; buffer_size],
            tracker: IdTracker::new(),
            pending: BinaryHeap::new(),
            partial: None,
            write_blocked: false,
            last_reply: None,
            first_sent: None,
            last_sent: None,
            last_idle: now,
            mrs_time: None,
            zombie_deadline: None,
            revive_deadline: None,
            status_deadline: None,
            status_entry: None,
            stats: ConnStats::default(),
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            debug!(conn = self.index, from = ?self.state, to = ?state, "Connection state change");
            self.state = state;
        }
    }

    /// Whether the trunk may assign new requests here
    pub(crate) fn usable(&self) -> bool {
        self.state == ConnState::Active
    }

    /// Whether this connection still counts toward the destination being
    /// reachable (it is up, or on a path back to up)
    pub(crate) fn alive(&self) -> bool {
        matches!(
            self.state,
            ConnState::Connecting | ConnState::StatusChecking | ConnState::Active | ConnState::Zombie
        )
    }

    /// Does the event loop need to watch this connection for writability?
    pub(crate) fn wants_write(&self) -> bool {
        match self.state {
            ConnState::Connecting => true,
            ConnState::StatusChecking | ConnState::Active | ConnState::Zombie => {
                self.partial.is_some() || (!self.pending.is_empty() && !self.tracker.is_full())
            }
            _ => false,
        }
    }

    /// Does the event loop need to watch this connection for readability?
    pub(crate) fn wants_read(&self, replicate: bool) -> bool {
        !replicate
            && matches!(
                self.state,
                ConnState::StatusChecking | ConnState::Active | ConnState::Zombie
            )
    }

    /// Drain one datagram from the socket
    pub(crate) fn read_datagram(&mut self) -> ReadOutcome {
        let Connection { io, buffer, .. } = self;
        let Some(io) = io.as_mut() else {
            return ReadOutcome::Empty;
        };

        match io.try_recv(buffer) {
            Ok(0) => ReadOutcome::Empty,
            Ok(n) if n < wire::HEADER_LENGTH => ReadOutcome::Runt(n),
            Ok(n) => ReadOutcome::Packet(buffer[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Empty,
            Err(e) => ReadOutcome::Fatal(e),
        }
    }

    /// Grow the receive buffer after Response-Too-Big negotiation
    pub(crate) fn grow_buffer(&mut self, requested: usize) {
        let new_len = requested.clamp(wire::MIN_BUFFER_SIZE, wire::MAX_PACKET_SIZE);
        if new_len > self.buffer.len() {
            debug!(conn = self.index, size = new_len, "Increasing receive buffer");
            self.buffer = vec![0u8; new_len];
        }
    }

    /// Record that the last tracked request was released
    pub(crate) fn note_idle(&mut self, now: Instant) {
        if self.tracker.is_empty() {
            self.last_idle = now;
        }
    }

    /// Record a send: stamps `last_sent` and, if the connection had been
    /// idle, `first_sent`.
    pub(crate) fn note_sent(&mut self, sent_at: Instant) {
        self.last_sent = Some(sent_at);
        let idle = match self.first_sent {
            None => true,
            Some(first) => first <= self.last_idle,
        };
        if idle {
            self.first_sent = Some(sent_at);
        }
    }

    /// Record a reply and the send time that produced it
    pub(crate) fn note_reply(&mut self, now: Instant, sent_at: Instant) {
        self.last_reply = Some(now);
        self.stats.replies_received += 1;
        if self.mrs_time.is_none_or(|mrs| sent_at > mrs) {
            self.mrs_time = Some(sent_at);
        }
    }

    /// Borrow the live link for readiness polling
    pub(crate) fn io_ref(&self) -> Option<&dyn LinkIo> {
        self.io.as_deref()
    }

    /// Drop the link and all timer deadlines, keeping queue state for the
    /// caller to requeue
    pub(crate) fn drop_link(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.shutdown();
        }
        self.write_blocked = false;
        self.zombie_deadline = None;
        self.revive_deadline = None;
        self.status_deadline = None;
    }
}
