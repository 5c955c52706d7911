//! The trunk: a pool of connections multiplexing one queue of requests
//!
//! The trunk owns every connection and every in-flight request. It is a
//! deterministic state machine with no I/O multiplexing of its own: the
//! embedding event loop calls [`Trunk::on_writable`] / [`Trunk::on_readable`]
//! when a connection's socket is ready, and [`Trunk::process_timers`] when
//! the deadline from [`Trunk::next_deadline`] passes. Requests enter through
//! the dispatcher, move through backlog → pending → (partial) → sent, and
//! leave by resuming their caller exactly once.

use crate::code::{Code, ResultCode, reply_to_result};
use crate::codec::{EncodeError, PacketCodec};
use crate::config::{Mode, RequireMessageAuthenticator, Transport, TrunkConfig};
use crate::connection::{ConnState, ConnStats, Connection, ReadOutcome};
use crate::link::{LinkFactory, is_transient};
use crate::request::{ProtocolRequest, ResultSlot};
use crate::retry::{RetryConfig, RetryDecision, RetryState};
use crate::status;
use crate::track::IdTracker;
use crate::wire;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Stable, generation-checked handle to one trunk entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    index: usize,
    generation: u32,
}

impl EntryId {
    #[cfg(test)]
    pub(crate) fn test_handle(index: usize) -> Self {
        EntryId {
            index,
            generation: 0,
        }
    }
}

/// Where an entry currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Waiting for a connection with capacity
    Backlog,
    /// Assigned to a connection, waiting to be written
    Pending(usize),
    /// Mid-write on a blocked socket
    Partial(usize),
    /// On the wire, awaiting a reply
    Sent(usize),
}

impl EntryState {
    fn conn(self) -> Option<usize> {
        match self {
            EntryState::Backlog => None,
            EntryState::Pending(ci) | EntryState::Partial(ci) | EntryState::Sent(ci) => Some(ci),
        }
    }
}

/// One tracked exchange: the protocol request plus its completion state
pub(crate) struct TrunkEntry {
    pub(crate) request: ProtocolRequest,
    pub(crate) result: ResultSlot,
    pub(crate) state: EntryState,
    /// Submission order, the final scheduling tie-breaker
    pub(crate) seq: u64,
    /// Armed retry deadline; a firing timer is stale unless it matches
    pub(crate) retry_deadline: Option<Instant>,
}

struct EntrySlot {
    generation: u32,
    item: Option<TrunkEntry>,
}

/// Scheduling key: status checks first, then larger priority, then earlier
/// receive time. `BinaryHeap` is a max-heap, so [`Ord`] puts the request
/// that must be written next at the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueKey {
    pub(crate) status_check: bool,
    pub(crate) priority: u32,
    pub(crate) recv_time: Instant,
    pub(crate) seq: u64,
    pub(crate) entry: EntryId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.status_check
            .cmp(&other.status_check)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.recv_time.cmp(&self.recv_time))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of accepting a request into the trunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Assigned to a connection
    Ok,
    /// Accepted, waiting for capacity
    InBacklog,
    /// Rejected: trunk at max_outstanding
    NoCapacity,
    /// Rejected: every connection is dead
    DstUnavailable,
    /// Rejected: internal failure
    Fail,
}

enum TimerKind {
    Retry(EntryId),
    Zombie(usize),
    Revive(usize),
    StatusRetry(usize),
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What one pass through the write path did
enum WriteOutcome {
    /// Fully written; the entry is (or stays) in Sent
    Sent,
    /// Replicate mode: fully written, complete immediately
    Replicated,
    /// Short write; the entry parked in Partial, stop writing
    Partial,
    /// Socket has no room; requeue and wait for writability
    Backpressure,
    /// No free RADIUS ID; requeue until one is released
    TrackerFull,
    /// This request failed, the connection is fine
    RequestFailed,
    /// The connection is broken
    Fatal,
    /// The entry vanished under us (stale key)
    Skip,
}

pub struct Trunk {
    config: Arc<TrunkConfig>,
    codec: Box<dyn PacketCodec>,
    factory: Box<dyn LinkFactory>,
    connections: Vec<Connection>,
    entries: Vec<EntrySlot>,
    free_entries: Vec<usize>,
    backlog: BinaryHeap<QueueKey>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    /// BlastRADIUS latch: a reply proved the peer signs its packets
    received_ma: bool,
    last_failed: Option<Instant>,
    last_connected: Option<Instant>,
    outstanding: usize,
    seq: u64,
}

impl Trunk {
    /// Build the trunk and open its connection pool.
    ///
    /// Connections that fail to open immediately are parked in DeadRevive
    /// and retried after the revive interval.
    pub fn new(
        config: Arc<TrunkConfig>,
        codec: Box<dyn PacketCodec>,
        factory: Box<dyn LinkFactory>,
        now: Instant,
    ) -> Self {
        let mut trunk = Trunk {
            config: config.clone(),
            codec,
            factory,
            connections: Vec::with_capacity(config.connections),
            entries: Vec::new(),
            free_entries: Vec::new(),
            backlog: BinaryHeap::new(),
            timers: BinaryHeap::new(),
            received_ma: false,
            last_failed: None,
            last_connected: None,
            outstanding: 0,
            seq: 0,
        };

        for index in 0..config.connections {
            let io = match trunk.factory.connect() {
                Ok(io) => Some(io),
                Err(e) => {
                    error!(conn = index, error = %e, "Failed opening connection");
                    None
                }
            };
            let failed = io.is_none();
            trunk
                .connections
                .push(Connection::new(index, io, config.max_packet_size, now));
            if failed {
                trunk.park_for_revive(index, now);
            }
        }

        trunk
    }

    pub fn config(&self) -> &TrunkConfig {
        &self.config
    }

    /// Requests currently owned by the trunk (status checks excluded)
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Liveness state of one pooled connection
    pub fn conn_state(&self, conn: usize) -> Option<ConnState> {
        self.connections.get(conn).map(|c| c.state)
    }

    /// Traffic counters of one pooled connection
    pub fn conn_stats(&self, conn: usize) -> Option<ConnStats> {
        self.connections.get(conn).map(|c| c.stats)
    }

    pub(crate) fn connections(&self) -> &[Connection] {
        &self.connections
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // ---- entry arena -----------------------------------------------------

    fn alloc_entry(&mut self, request: ProtocolRequest, result: ResultSlot) -> EntryId {
        let seq = self.next_seq();
        let entry = TrunkEntry {
            request,
            result,
            state: EntryState::Backlog,
            seq,
            retry_deadline: None,
        };

        match self.free_entries.pop() {
            Some(index) => {
                let slot = &mut self.entries[index];
                slot.item = Some(entry);
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.entries.push(EntrySlot {
                    generation: 0,
                    item: Some(entry),
                });
                EntryId {
                    index: self.entries.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    fn free_entry(&mut self, id: EntryId) {
        let Some(slot) = self.entries.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation || slot.item.is_none() {
            return;
        }
        slot.item = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_entries.push(id.index);
    }

    pub(crate) fn entry(&self, id: EntryId) -> Option<&TrunkEntry> {
        let slot = self.entries.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.item.as_ref()
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Option<&mut TrunkEntry> {
        let slot = self.entries.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.item.as_mut()
    }

    fn key_for(id: EntryId, entry: &TrunkEntry) -> QueueKey {
        QueueKey {
            status_check: entry.request.status_check,
            priority: entry.request.priority,
            recv_time: entry.request.recv_time,
            seq: entry.seq,
            entry: id,
        }
    }

    // ---- enqueue and scheduling -----------------------------------------

    /// Accept one request into the trunk.
    ///
    /// On `Ok`/`InBacklog` the entry is owned by the trunk and will resume
    /// its caller later; on any rejection the caller keeps the pieces.
    pub(crate) fn enqueue(
        &mut self,
        request: ProtocolRequest,
        result: ResultSlot,
    ) -> Result<(EnqueueOutcome, EntryId), (EnqueueOutcome, ProtocolRequest, ResultSlot)> {
        if self.outstanding >= self.config.max_outstanding {
            return Err((EnqueueOutcome::NoCapacity, request, result));
        }
        if !self.connections.iter().any(|c| c.alive()) {
            return Err((EnqueueOutcome::DstUnavailable, request, result));
        }

        let id = self.alloc_entry(request, result);
        self.outstanding += 1;

        match self.pick_conn() {
            Some(ci) => {
                self.assign(id, ci);
                Ok((EnqueueOutcome::Ok, id))
            }
            None => {
                let key = self.entry(id).map(|entry| Self::key_for(id, entry));
                if let Some(key) = key {
                    self.backlog.push(key);
                }
                Ok((EnqueueOutcome::InBacklog, id))
            }
        }
    }

    /// Active connection with the least load
    fn pick_conn(&self) -> Option<usize> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.usable())
            .min_by_key(|(_, c)| c.tracker.count() + c.pending.len())
            .map(|(i, _)| i)
    }

    fn assign(&mut self, id: EntryId, ci: usize) {
        let key = {
            let Some(entry) = self.entry_mut(id) else {
                return;
            };
            entry.state = EntryState::Pending(ci);
            Self::key_for(id, entry)
        };
        self.connections[ci].pending.push(key);
    }

    fn drain_backlog(&mut self, _now: Instant) {
        loop {
            let Some(key) = self.backlog.pop() else {
                break;
            };
            let valid = self
                .entry(key.entry)
                .map(|e| e.seq == key.seq && e.state == EntryState::Backlog)
                .unwrap_or(false);
            if !valid {
                continue;
            }
            match self.pick_conn() {
                Some(ci) => self.assign(key.entry, ci),
                None => {
                    self.backlog.push(key);
                    break;
                }
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    fn arm_timer(&mut self, at: Instant, kind: TimerKind) {
        let seq = self.next_seq();
        self.timers.push(Reverse(TimerEntry { at, seq, kind }));
    }

    fn arm_retry(&mut self, id: EntryId, at: Instant) {
        if let Some(entry) = self.entry_mut(id) {
            entry.retry_deadline = Some(at);
        }
        self.arm_timer(at, TimerKind::Retry(id));
    }

    /// Earliest armed deadline, for the event loop's sleep
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.at)
    }

    /// Fire every timer due at `now`
    pub fn process_timers(&mut self, now: Instant) {
        while let Some(Reverse(due)) = self.timers.pop() {
            if due.at > now {
                self.timers.push(Reverse(due));
                break;
            }
            match due.kind {
                TimerKind::Retry(id) => self.handle_retry_timer(id, due.at, now),
                TimerKind::Zombie(ci) => self.handle_zombie_timer(ci, due.at, now),
                TimerKind::Revive(ci) => self.handle_revive_timer(ci, due.at, now),
                TimerKind::StatusRetry(ci) => self.handle_status_timer(ci, due.at, now),
            }
        }
    }

    /// Start the retransmission schedule for an accepted request
    pub(crate) fn start_retry(&mut self, id: EntryId, config: RetryConfig, now: Instant) {
        let next = {
            let Some(entry) = self.entry_mut(id) else {
                return;
            };
            let state = RetryState::init(config, now);
            let next = state.next;
            entry.request.retry = Some(state);
            next
        };
        self.arm_retry(id, next);
    }

    fn handle_retry_timer(&mut self, id: EntryId, at: Instant, now: Instant) {
        enum Plan {
            Rearm {
                next: Instant,
                resend: Option<usize>,
            },
            Exhausted {
                conn: Option<usize>,
                started: Instant,
                count: u32,
                by_count: bool,
            },
        }

        let plan = {
            let Some(entry) = self.entry_mut(id) else {
                return;
            };
            if entry.retry_deadline != Some(at) {
                return; // stale timer
            }
            entry.retry_deadline = None;
            let state = entry.state;
            let Some(retry) = entry.request.retry.as_mut() else {
                return;
            };
            match retry.advance(now) {
                RetryDecision::Continue => {
                    let resend = match state {
                        EntryState::Sent(ci) => Some(ci),
                        EntryState::Backlog => {
                            debug!("Request still in the backlog, suppressing retransmission");
                            None
                        }
                        EntryState::Pending(_) => {
                            debug!("Request still pending, suppressing retransmission");
                            None
                        }
                        EntryState::Partial(_) => {
                            debug!("Request partially written, suppressing retransmission");
                            None
                        }
                    };
                    Plan::Rearm {
                        next: retry.next,
                        resend,
                    }
                }
                RetryDecision::MrcExceeded => Plan::Exhausted {
                    conn: state.conn(),
                    started: retry.start,
                    count: retry.count,
                    by_count: true,
                },
                RetryDecision::MrdExceeded => Plan::Exhausted {
                    conn: state.conn(),
                    started: retry.start,
                    count: retry.count,
                    by_count: false,
                },
            }
        };

        match plan {
            Plan::Rearm { next, resend } => {
                self.arm_retry(id, next);
                if let Some(ci) = resend {
                    if self.connections[ci].write_blocked {
                        debug!(conn = ci, "IO is blocked, suppressing retransmission");
                        return;
                    }
                    if let Some(entry) = self.entry_mut(id) {
                        entry.result.is_retry = true;
                    }
                    let outcome = self.write_entry(ci, id, now);
                    self.apply_retransmit_outcome(ci, id, outcome, now);
                }
            }
            Plan::Exhausted {
                conn,
                started,
                count,
                by_count,
            } => {
                if by_count {
                    warn!(count, "Reached maximum retransmit count, failing request");
                } else {
                    warn!(count, "Reached maximum retransmit duration, failing request");
                }
                if let Some(ci) = conn {
                    self.connections[ci].stats.timeouts += 1;
                }
                self.fail_entry(id, now);
                if self.config.mode != Mode::Replicate {
                    if let Some(ci) = conn {
                        self.check_for_zombie(ci, now, Some(started));
                    }
                }
            }
        }
    }

    // ---- write path ------------------------------------------------------

    /// Socket writable: finish any partial write, then drain pending in
    /// priority order.
    pub fn on_writable(&mut self, ci: usize, now: Instant) {
        if ci >= self.connections.len() {
            return;
        }
        if self.connections[ci].state == ConnState::Connecting {
            self.conn_open(ci, now);
        }
        self.connections[ci].write_blocked = false;

        if let Some(pid) = self.connections[ci].partial {
            match self.write_entry(ci, pid, now) {
                WriteOutcome::Sent => {}
                WriteOutcome::Replicated => self.complete_entry(pid, ResultCode::Ok, now),
                WriteOutcome::Partial | WriteOutcome::Backpressure => return,
                WriteOutcome::RequestFailed => self.fail_entry(pid, now),
                WriteOutcome::Fatal => {
                    self.reconnect(ci, now);
                    return;
                }
                WriteOutcome::TrackerFull | WriteOutcome::Skip => {
                    self.connections[ci].partial = None;
                }
            }
        }

        loop {
            if !matches!(
                self.connections[ci].state,
                ConnState::StatusChecking | ConnState::Active | ConnState::Zombie
            ) {
                return;
            }

            let Some(key) = self.connections[ci].pending.pop() else {
                return;
            };
            let valid = self
                .entry(key.entry)
                .map(|e| e.seq == key.seq && e.state == EntryState::Pending(ci))
                .unwrap_or(false);
            if !valid {
                continue; // stale key
            }
            let id = key.entry;

            match self.write_entry(ci, id, now) {
                WriteOutcome::Sent | WriteOutcome::Skip => continue,
                WriteOutcome::Replicated => {
                    self.complete_entry(id, ResultCode::Ok, now);
                    continue;
                }
                WriteOutcome::RequestFailed => {
                    self.fail_entry(id, now);
                    continue;
                }
                WriteOutcome::Partial => return,
                WriteOutcome::Backpressure | WriteOutcome::TrackerFull => {
                    self.requeue_pending(ci, id);
                    return;
                }
                WriteOutcome::Fatal => {
                    self.reconnect(ci, now);
                    return;
                }
            }
        }
    }

    fn requeue_pending(&mut self, ci: usize, id: EntryId) {
        let key = {
            let Some(entry) = self.entry_mut(id) else {
                return;
            };
            entry.state = EntryState::Pending(ci);
            Self::key_for(id, entry)
        };
        self.connections[ci].pending.push(key);
    }

    /// The one write path: first sends, retransmissions (timer or DUP) and
    /// partial continuations all come through here.
    fn write_entry(&mut self, ci: usize, id: EntryId, now: Instant) -> WriteOutcome {
        let Trunk {
            connections,
            entries,
            codec,
            config,
            ..
        } = self;
        let conn = &mut connections[ci];
        let Some(slot) = entries.get_mut(id.index) else {
            return WriteOutcome::Skip;
        };
        if slot.generation != id.generation {
            return WriteOutcome::Skip;
        }
        let Some(entry) = slot.item.as_mut() else {
            return WriteOutcome::Skip;
        };
        let request = &mut entry.request;

        if request.packet.is_none() {
            let Some(assigned) = conn.tracker.reserve(id, request.code) else {
                debug!(conn = ci, "All RADIUS IDs in use, request stays pending");
                return WriteOutcome::TrackerFull;
            };
            request.id = Some(assigned);

            let add_proxy_state = request.proxied && !request.status_check;
            match codec.encode(request, assigned, add_proxy_state) {
                Ok(bytes) => {
                    let mut auth = [0u8; wire::AUTH_VECTOR_LENGTH];
                    auth.copy_from_slice(
                        &bytes[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16],
                    );
                    conn.tracker.update(assigned, auth);
                    debug!(
                        conn = ci,
                        code = Code::name(request.code),
                        id = assigned,
                        len = bytes.len(),
                        "Sending request"
                    );
                    request.packet = Some(bytes);
                }
                Err(e) => {
                    conn.tracker.release(assigned);
                    request.id = None;
                    request.reset();
                    match &e {
                        EncodeError::BufferTooSmall { have, need }
                            if *need <= wire::MAX_PACKET_SIZE =>
                        {
                            error!(have, need, "Failed encoding packet, increase max_packet_size");
                        }
                        _ => error!(error = %e, "Failed encoding packet"),
                    }
                    return WriteOutcome::RequestFailed;
                }
            }
        } else if request.partial == 0 {
            debug!(
                conn = ci,
                code = Code::name(request.code),
                id = request.id.unwrap_or(0),
                "Retransmitting request"
            );
        }

        let Some(packet) = request.packet.as_ref() else {
            return WriteOutcome::Skip;
        };
        let data = &packet[request.partial..];
        let Some(io) = conn.io.as_mut() else {
            return WriteOutcome::Skip;
        };

        let written = match io.try_send(data) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                conn.write_blocked = true;
                return WriteOutcome::Backpressure;
            }
            Err(e) if is_transient(&e) => {
                warn!(conn = ci, error = %e, "Transient send failure, failing request");
                return WriteOutcome::RequestFailed;
            }
            Err(e) => {
                error!(conn = ci, error = %e, "Send failed, reconnecting");
                return WriteOutcome::Fatal;
            }
            Ok(0) => {
                if request.partial > 0 {
                    return WriteOutcome::Partial;
                }
                warn!(conn = ci, "Sent zero bytes, requeueing");
                return WriteOutcome::Backpressure;
            }
            Ok(n) => n,
        };

        if written < data.len() {
            request.partial += written;
            entry.state = EntryState::Partial(ci);
            conn.partial = Some(id);
            conn.write_blocked = true;
            return WriteOutcome::Partial;
        }

        request.partial = 0;
        if conn.partial == Some(id) {
            conn.partial = None;
        }
        conn.stats.requests_sent += 1;

        if config.mode == Mode::Replicate {
            return WriteOutcome::Replicated;
        }

        if matches!(entry.state, EntryState::Pending(_) | EntryState::Partial(_)) {
            entry.state = EntryState::Sent(ci);
            let sent_at = request.retry.map(|r| r.start).unwrap_or(now);
            if !request.status_check {
                conn.note_sent(sent_at);
                let action = if entry.result.is_retry {
                    "Retransmitted"
                } else if request.proxied {
                    "Proxied"
                } else {
                    "Originated"
                };
                debug!(conn = ci, action, "Request on the wire");
            }
        } else {
            debug!(conn = ci, "Retransmitted request");
        }

        WriteOutcome::Sent
    }

    fn apply_retransmit_outcome(
        &mut self,
        ci: usize,
        id: EntryId,
        outcome: WriteOutcome,
        now: Instant,
    ) {
        match outcome {
            WriteOutcome::Sent
            | WriteOutcome::Replicated
            | WriteOutcome::Partial
            | WriteOutcome::Backpressure
            | WriteOutcome::TrackerFull
            | WriteOutcome::Skip => {}
            WriteOutcome::RequestFailed => self.fail_entry(id, now),
            WriteOutcome::Fatal => self.reconnect(ci, now),
        }
    }

    /// Retransmit after a DUP signal from the downstream client.
    ///
    /// Only meaningful for a request already on the wire; earlier states
    /// retransmit on their own when they reach the socket.
    pub(crate) fn dup(&mut self, id: EntryId, now: Instant) {
        let (state, last_sent) = {
            let Some(entry) = self.entry_mut(id) else {
                return;
            };
            entry.result.is_retry = true;
            (entry.state, entry.request.retry.map(|r| r.start))
        };

        let EntryState::Sent(ci) = state else {
            debug!("DUP for a request not yet sent, ignoring");
            return;
        };

        self.check_for_zombie(ci, now, last_sent);

        if self.connections[ci].write_blocked {
            debug!(conn = ci, "IO is blocked, suppressing retransmission");
            return;
        }

        // Even a zombie connection gets the resend; if it is truly dead the
        // requeue on failure will move this request elsewhere.
        let outcome = self.write_entry(ci, id, now);
        self.apply_retransmit_outcome(ci, id, outcome, now);
    }

    /// Cancel a yielded request: remove it from whatever queue it occupies
    /// and resume the caller with FAIL.
    pub(crate) fn cancel(&mut self, id: EntryId, now: Instant) {
        let (is_status, state) = {
            let Some(entry) = self.entry(id) else {
                return;
            };
            (entry.request.status_check, entry.state)
        };
        if is_status {
            return;
        }

        // A half-written packet corrupts a stream; a datagram never went
        // out at all.
        let reconnect = match state {
            EntryState::Partial(ci) if self.config.transport == Transport::Stream => Some(ci),
            _ => None,
        };

        debug!("Request cancelled");
        self.release_entry_resources(id, now);
        if let Some(entry) = self.entry_mut(id) {
            entry.result.resolve(ResultCode::Fail);
        }
        self.remove_entry(id, now);

        if let Some(ci) = reconnect {
            warn!(conn = ci, "Cancelled mid-write on a stream, reconnecting");
            self.reconnect(ci, now);
        }
    }

    // ---- completion ------------------------------------------------------

    /// Release connection-side resources: the tracked ID, encoded bytes and
    /// any armed retry deadline. The entry stays allocated.
    fn release_entry_resources(&mut self, id: EntryId, now: Instant) {
        let Trunk {
            connections,
            entries,
            ..
        } = self;
        let Some(slot) = entries.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        let Some(entry) = slot.item.as_mut() else {
            return;
        };

        if let Some(ci) = entry.state.conn() {
            let conn = &mut connections[ci];
            if let Some(assigned) = entry.request.id.take() {
                conn.tracker.release(assigned);
                conn.note_idle(now);
            }
            if conn.partial == Some(id) {
                conn.partial = None;
            }
        }
        entry.request.id = None;
        entry.request.reset();
        entry.request.num_replies = 0;
        // The retry deadline stays armed: a requeued request keeps its
        // schedule running, so it still times out even if it never reaches
        // another socket. Completed entries make the timer stale by being
        // freed.
        entry.state = EntryState::Backlog;
    }

    fn remove_entry(&mut self, id: EntryId, now: Instant) {
        if self.entry(id).is_none() {
            return;
        }
        self.free_entry(id);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.drain_backlog(now);
    }

    fn complete_entry(&mut self, id: EntryId, rcode: ResultCode, now: Instant) {
        self.release_entry_resources(id, now);
        if let Some(entry) = self.entry_mut(id) {
            debug_assert!(!entry.request.status_check);
            entry.result.resolve(rcode);
        }
        self.remove_entry(id, now);
    }

    fn fail_entry(&mut self, id: EntryId, now: Instant) {
        self.complete_entry(id, ResultCode::Fail, now);
    }

    // ---- read path -------------------------------------------------------

    /// Socket readable: drain every waiting datagram
    pub fn on_readable(&mut self, ci: usize, now: Instant) {
        if ci >= self.connections.len() {
            return;
        }
        loop {
            if !self.connections[ci].wants_read(self.config.mode == Mode::Replicate) {
                return;
            }
            match self.connections[ci].read_datagram() {
                ReadOutcome::Empty => return,
                ReadOutcome::Runt(n) => {
                    error!(
                        conn = ci,
                        got = n,
                        expected = wire::HEADER_LENGTH,
                        "Packet too short"
                    );
                }
                ReadOutcome::Fatal(e) => {
                    error!(conn = ci, error = %e, "Failed reading from socket, reconnecting");
                    self.reconnect(ci, now);
                    return;
                }
                ReadOutcome::Packet(data) => self.process_reply(ci, data, now),
            }
        }
    }

    fn process_reply(&mut self, ci: usize, data: Vec<u8>, now: Instant) {
        let id = data[wire::ID_OFFSET];

        // All packet codes share one ID space; match purely by ID.
        let (eid, auth) = {
            let conn = &self.connections[ci];
            match conn.tracker.find(id) {
                Some(slot) => (slot.entry, slot.authenticator),
                None => {
                    warn!(conn = ci, id, "Ignoring reply with an ID that arrived too late");
                    return;
                }
            }
        };

        let Some(declared) = wire::packet_ok(&data) else {
            warn!(conn = ci, id, "Ignoring malformed packet");
            return;
        };
        let data = &data[..declared];

        let require_ma = match self.config.require_message_authenticator {
            RequireMessageAuthenticator::Yes => true,
            RequireMessageAuthenticator::No => false,
            RequireMessageAuthenticator::Auto => self.received_ma,
        };

        let reply = match self.codec.decode(data, &auth, require_ma) {
            Ok(reply) => reply,
            Err(fail) => {
                warn!(conn = ci, id, error = %fail, "Failed decoding reply, dropping");
                return;
            }
        };

        let (is_status, request_code, sent_at) = {
            let Some(entry) = self.entry_mut(eid) else {
                warn!(conn = ci, id, "Tracked reply has no entry, dropping");
                return;
            };
            entry.request.num_replies += 1;
            (
                entry.request.status_check,
                entry.request.code,
                entry.request.retry.map(|r| r.start).unwrap_or(now),
            )
        };

        self.connections[ci].note_reply(now, sent_at);

        // BlastRADIUS: once the peer demonstrably signs Access replies,
        // require it for the rest of the trunk's life.
        if self.config.require_message_authenticator == RequireMessageAuthenticator::Auto
            && !self.received_ma
            && request_code == Code::AccessRequest.as_u8()
            && reply.message_authenticator
        {
            info!("Reply contained a valid Message-Authenticator, now requiring it");
            self.received_ma = true;
        }

        debug!(
            conn = ci,
            code = Code::name(reply.code),
            id,
            len = declared,
            "Received reply"
        );

        let mut rcode = reply_to_result(reply.code);
        if reply.code == Code::ProtocolError.as_u8() {
            let hints = wire::parse_protocol_error(data, request_code);
            if hints.response_too_big {
                if let Some(len) = hints.response_length {
                    self.connections[ci].grow_buffer(len as usize);
                }
            }
            if hints.code_mismatch {
                warn!(conn = ci, "Protocol-Error names a different original packet code");
                rcode = ResultCode::Fail;
            }
        }

        if is_status {
            // Any properly signed reply counts for a probe, whatever its
            // code; Protocol-Error negotiation was already handled above.
            self.status_reply(ci, eid, now);
            return;
        }

        self.complete_entry(eid, rcode, now);
    }

    // ---- status checks ---------------------------------------------------

    /// Queue the connection's probe, creating the reusable entry on first
    /// use, and start its retry schedule.
    fn enqueue_status(&mut self, ci: usize, now: Instant) {
        let Some(settings) = self.config.status_check.clone() else {
            return;
        };

        let eid = match self.connections[ci].status_entry {
            Some(eid) => eid,
            None => {
                let probe = status::build_probe(&settings, now);
                let eid = self.alloc_entry(probe, ResultSlot::detached());
                self.connections[ci].status_entry = Some(eid);
                eid
            }
        };

        let (key, next) = {
            let Some(entry) = self.entry_mut(eid) else {
                return;
            };
            if matches!(entry.state, EntryState::Pending(_) | EntryState::Sent(_)) {
                return; // already probing
            }
            let retry = RetryState::init(settings.retry.to_retry_config(), now);
            let next = retry.next;
            entry.request.retry = Some(retry);
            entry.request.num_replies = 0;
            entry.state = EntryState::Pending(ci);
            (Self::key_for(eid, entry), next)
        };

        let conn = &mut self.connections[ci];
        conn.pending.push(key);
        conn.status_deadline = Some(next);
        self.arm_timer(next, TimerKind::StatusRetry(ci));
    }

    /// A probe got a valid reply (any code counts).
    fn status_reply(&mut self, ci: usize, eid: EntryId, now: Instant) {
        let needed = status::answers_required(
            self.config.num_answers_to_alive,
            self.last_failed,
            self.last_connected,
        );

        // The probe is done; free its ID so the next probe is fresh.
        let num_replies = {
            let Trunk {
                connections,
                entries,
                ..
            } = self;
            let Some(slot) = entries.get_mut(eid.index) else {
                return;
            };
            if slot.generation != eid.generation {
                return;
            }
            let Some(entry) = slot.item.as_mut() else {
                return;
            };
            let conn = &mut connections[ci];
            if let Some(assigned) = entry.request.id.take() {
                conn.tracker.release(assigned);
                conn.note_idle(now);
            }
            entry.request.reset();
            entry.state = EntryState::Backlog;
            entry.request.num_replies
        };

        if num_replies < needed {
            debug!(
                conn = ci,
                num_replies, needed, "Received replies for status check, waiting for more"
            );
            // The armed status timer doubles as the next-probe schedule.
            return;
        }

        info!(conn = ci, "Received enough replies to status check, marking connection active");
        self.connections[ci].status_deadline = None;
        if let Some(entry) = self.entry_mut(eid) {
            entry.request.retry = None;
            entry.request.num_replies = 0;
        }
        self.activate(ci, now);
    }

    /// Probe schedule fired: either send the next probe or give up on the
    /// connection.
    fn handle_status_timer(&mut self, ci: usize, at: Instant, now: Instant) {
        if self.connections[ci].status_deadline != Some(at) {
            return; // stale
        }
        self.connections[ci].status_deadline = None;

        let Some(eid) = self.connections[ci].status_entry else {
            return;
        };

        enum Plan {
            Next(Instant),
            GiveUp,
        }

        let plan = {
            let Trunk {
                connections,
                entries,
                ..
            } = self;
            let Some(slot) = entries.get_mut(eid.index) else {
                return;
            };
            if slot.generation != eid.generation {
                return;
            }
            let Some(entry) = slot.item.as_mut() else {
                return;
            };
            let conn = &mut connections[ci];

            // An unanswered probe breaks the contiguous-reply streak.
            let answered = entry.state == EntryState::Backlog;
            if !answered {
                entry.request.num_replies = 0;
                if let Some(assigned) = entry.request.id.take() {
                    conn.tracker.release(assigned);
                }
                entry.request.reset();
                entry.state = EntryState::Backlog;
            }

            let Some(retry) = entry.request.retry.as_mut() else {
                return;
            };
            match retry.advance(now) {
                RetryDecision::Continue => {
                    entry.state = EntryState::Pending(ci);
                    Plan::Next(retry.next)
                }
                RetryDecision::MrcExceeded | RetryDecision::MrdExceeded => Plan::GiveUp,
            }
        };

        match plan {
            Plan::Next(next) => {
                let key = self.entry(eid).map(|entry| Self::key_for(eid, entry));
                let Some(key) = key else {
                    return;
                };
                let conn = &mut self.connections[ci];
                conn.pending.push(key);
                conn.status_deadline = Some(next);
                self.arm_timer(next, TimerKind::StatusRetry(ci));
            }
            Plan::GiveUp => {
                warn!(conn = ci, "Status checks failing, reconnecting");
                self.reconnect(ci, now);
            }
        }
    }

    // ---- liveness --------------------------------------------------------

    /// Socket became writable while connecting: the connection is up at
    /// the transport level; decide whether it must prove itself first.
    fn conn_open(&mut self, ci: usize, now: Instant) {
        if self.config.mode == Mode::Replicate {
            let conn = &mut self.connections[ci];
            if let Some(io) = conn.io.as_mut() {
                if let Err(e) = io.set_write_only() {
                    error!(conn = ci, error = %e, "Failed setting socket write-only");
                    self.reconnect(ci, now);
                    return;
                }
            }
        }

        info!(conn = ci, "Connection open");

        if self.config.status_check.is_some() && self.config.mode != Mode::Replicate {
            self.connections[ci].set_state(ConnState::StatusChecking);
            self.enqueue_status(ci, now);
        } else {
            self.activate(ci, now);
        }
    }

    fn activate(&mut self, ci: usize, now: Instant) {
        let conn = &mut self.connections[ci];
        conn.set_state(ConnState::Active);
        conn.last_idle = now;
        self.last_connected = Some(now);
        self.drain_backlog(now);
    }

    /// Decide whether the connection should be treated as a zombie.
    ///
    /// Checked wherever a retransmission is about to happen (timer fire,
    /// DUP signal, final timeout): there might be no retries configured,
    /// so every path that notices silence has to ask.
    pub(crate) fn check_for_zombie(
        &mut self,
        ci: usize,
        now: Instant,
        last_sent: Option<Instant>,
    ) -> bool {
        if self.config.mode == Mode::Replicate {
            return false;
        }

        {
            let conn = &self.connections[ci];
            if conn.state == ConnState::StatusChecking || conn.zombie_deadline.is_some() {
                return true;
            }

            // A reply since this packet went out is evidence of life.
            let Some(sent) = last_sent else {
                return false;
            };
            if conn.last_reply.is_some_and(|r| r >= sent) {
                return false;
            }

            if self.config.mode == Mode::Proxy
                && now.duration_since(sent) < self.config.response_window()
            {
                return false;
            }
        }

        warn!(conn = ci, "Entering zombie state");
        self.last_failed = Some(now);
        self.connections[ci].set_state(ConnState::Zombie);

        if self.config.status_check.is_some() {
            // Probe this specific connection back to health.
            self.connections[ci].set_state(ConnState::StatusChecking);
            self.enqueue_status(ci, now);
        } else {
            let deadline = now + self.config.zombie_period();
            self.connections[ci].zombie_deadline = Some(deadline);
            self.arm_timer(deadline, TimerKind::Zombie(ci));
        }

        true
    }

    fn handle_zombie_timer(&mut self, ci: usize, at: Instant, now: Instant) {
        if self.connections[ci].zombie_deadline != Some(at) {
            return;
        }
        self.connections[ci].zombie_deadline = None;

        info!(conn = ci, "No replies during zombie period, marking connection dead");

        if self.config.status_check.is_some() {
            self.reconnect(ci, now);
            return;
        }

        // Zombie connections take no new assignments, so requeueing before
        // the teardown cannot bounce requests back here.
        self.requeue_conn_entries(ci, now);
        let conn = &mut self.connections[ci];
        conn.drop_link();
        conn.pending.clear();
        conn.partial = None;
        self.park_for_revive(ci, now);
    }

    fn park_for_revive(&mut self, ci: usize, now: Instant) {
        let deadline = now + self.config.revive_interval();
        let conn = &mut self.connections[ci];
        conn.set_state(ConnState::DeadRevive);
        conn.revive_deadline = Some(deadline);
        self.arm_timer(deadline, TimerKind::Revive(ci));
    }

    fn handle_revive_timer(&mut self, ci: usize, at: Instant, now: Instant) {
        if self.connections[ci].revive_deadline != Some(at) {
            return;
        }
        self.connections[ci].revive_deadline = None;
        info!(conn = ci, "Reviving connection");
        self.try_connect(ci, now);
    }

    /// Tear the connection down, requeue its requests and open a new link
    fn reconnect(&mut self, ci: usize, now: Instant) {
        self.last_failed = Some(now);

        // Take the connection out of rotation before requeueing so the
        // backlog drain cannot hand requests straight back.
        self.connections[ci].drop_link();
        self.connections[ci].set_state(ConnState::Init);

        self.requeue_conn_entries(ci, now);
        self.reset_status_entry(ci);

        let conn = &mut self.connections[ci];
        conn.pending.clear();
        conn.partial = None;

        self.try_connect(ci, now);
    }

    fn try_connect(&mut self, ci: usize, now: Instant) {
        match self.factory.connect() {
            Ok(io) => {
                let buffer_size = self.config.max_packet_size;
                let conn = &mut self.connections[ci];
                conn.io = Some(io);
                conn.set_state(ConnState::Connecting);
                conn.tracker = IdTracker::new();
                conn.buffer = vec![0u8; buffer_size];
                conn.write_blocked = false;
                conn.last_reply = None;
                conn.first_sent = None;
                conn.last_sent = None;
                conn.last_idle = now;
                conn.mrs_time = None;
            }
            Err(e) => {
                error!(conn = ci, error = %e, "Reconnect failed, will revive later");
                self.park_for_revive(ci, now);
            }
        }
    }

    /// Clear the reusable probe so the next probing session starts clean.
    /// The old tracker is about to be dropped, so the ID is just forgotten.
    fn reset_status_entry(&mut self, ci: usize) {
        let Some(eid) = self.connections[ci].status_entry else {
            return;
        };
        self.connections[ci].status_deadline = None;
        if let Some(entry) = self.entry_mut(eid) {
            entry.request.id = None;
            entry.request.reset();
            entry.request.retry = None;
            entry.request.num_replies = 0;
            entry.state = EntryState::Backlog;
        }
    }

    /// Move every request owned by `ci` onto siblings (via the backlog), or
    /// fail them when this was the last connection standing.
    fn requeue_conn_entries(&mut self, ci: usize, now: Instant) {
        let mut ids: Vec<EntryId> = Vec::new();
        {
            let conn = &mut self.connections[ci];
            while let Some(key) = conn.pending.pop() {
                ids.push(key.entry);
            }
            if let Some(partial) = conn.partial.take() {
                ids.push(partial);
            }
            ids.extend(conn.tracker.entries().map(|(_, entry)| entry));
        }
        ids.sort_unstable();
        ids.dedup();

        let have_siblings = self
            .connections
            .iter()
            .enumerate()
            .any(|(i, c)| i != ci && c.alive());

        let mut requeued = 0usize;
        for eid in ids {
            let valid = self
                .entry(eid)
                .map(|e| !e.request.status_check && e.state.conn() == Some(ci))
                .unwrap_or(false);
            if !valid {
                continue;
            }

            self.release_entry_resources(eid, now);
            if have_siblings {
                let key = self.entry(eid).map(|entry| Self::key_for(eid, entry));
                if let Some(key) = key {
                    self.backlog.push(key);
                    requeued += 1;
                }
            } else {
                warn!("No sibling connections, failing request");
                self.fail_entry(eid, now);
            }
        }

        if requeued > 0 {
            debug!(conn = ci, requeued, "Requeued requests onto sibling connections");
            self.drain_backlog(now);
        }
    }

    // ---- shutdown --------------------------------------------------------

    /// Fail every outstanding request and close every connection. The ID
    /// trackers must drain to zero: a tracked entry still allocated here is
    /// a bug.
    pub fn shutdown(&mut self, now: Instant) {
        info!("Trunk shutting down");

        let ids: Vec<EntryId> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.item.as_ref().map(|_| EntryId {
                    index,
                    generation: slot.generation,
                })
            })
            .collect();

        for eid in ids {
            let is_status = self
                .entry(eid)
                .map(|e| e.request.status_check)
                .unwrap_or(false);
            self.release_entry_resources(eid, now);
            if is_status {
                self.free_entry(eid);
            } else {
                if let Some(entry) = self.entry_mut(eid) {
                    entry.result.resolve(ResultCode::Fail);
                }
                self.remove_entry(eid, now);
            }
        }

        self.backlog.clear();
        self.timers.clear();

        for conn in &mut self.connections {
            debug_assert!(
                conn.tracker.is_empty(),
                "{} tracking entries still allocated at close",
                conn.tracker.count()
            );
            conn.pending.clear();
            conn.partial = None;
            conn.status_entry = None;
            conn.drop_link();
            conn.set_state(ConnState::Closed);
        }
        self.outstanding = 0;
    }

    #[cfg(test)]
    pub(crate) fn tracking_matches_queues(&self) -> bool {
        self.connections.iter().enumerate().all(|(ci, conn)| {
            let in_flight = self
                .entries
                .iter()
                .filter_map(|slot| slot.item.as_ref())
                .filter(|e| {
                    matches!(
                        e.state,
                        EntryState::Sent(c) | EntryState::Partial(c) if c == ci
                    )
                })
                .count();
            conn.tracker.count() == in_flight
        })
    }
}
