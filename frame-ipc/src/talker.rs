//! UDP socket multiplexer (spec §4.9): a single non-blocking socket fanning
//! inbound datagrams out to per-peer [`Session`]s and draining their
//! outbound buffers back onto the wire.
//!
//! Grounded on `server/lib/neutronium/src/net/endpoint.rs`'s non-blocking
//! recv-until-`WouldBlock` loop and its dense peer-keyed routing table,
//! reapplied here to a map of sessions addressed by `SocketAddr` instead of
//! `endpoint.rs`'s slab-of-channels. A Talker drives its sessions by
//! polling rather than hooking into the owning Selector's kernel-readiness
//! registration (`frame::selector::IoRegistrar` is only reachable from code
//! that already holds `&mut Selector`, not from inside `Object::execute`):
//! each `execute` call drains whatever datagrams are already queued by the
//! kernel, then asks to sleep until the nearest session deadline, capped by
//! [`MAX_POLL_INTERVAL`] so the socket is still checked promptly. This
//! trades true edge-triggered readiness for bounded latency, acceptable
//! for IPC's small, bursty datagrams rather than high-throughput streaming.

use crate::buffer::{Buffer, BufferType};
use crate::controller::Controller;
use crate::session::{Session, SessionState, SessionWants};
use frame::object::{Events, ExecuteResult, Object, Timeout};
use frame::signal::Signal;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Notification routed into a Talker's inbox by [`crate::service::IpcService`]
/// (spec §4.10's "forwards the signal under the Talker's mutex"). Payload is
/// already serialized: encoding is out of this crate's scope.
pub struct EnqueueSignal {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    pub flags: u32,
}

/// Upper bound on how long a Talker will request to sleep between polls.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

const RECV_BUF_SIZE: usize = 8192;

#[derive(Clone)]
pub struct TalkerConfig {
    pub max_buffer_size: usize,
    pub session_keep_alive: Duration,
    pub response_keep_alive: Duration,
    pub local_token: u32,
    /// Retry cap for data buffers, spec §10 item 3.
    pub data_retransmit_count: u8,
    /// Retry cap for Connecting/Accepting handshake buffers, spec §10 item 3.
    pub connect_retransmit_count: u8,
}

/// Per-signal delivery outcome, surfaced by [`Talker::execute`]'s caller
/// (the owning `crate::service::IpcService`) via [`Talker::take_completions`].
pub struct Completion {
    pub peer: SocketAddr,
    pub uid: frame::SignalUid,
    pub outcome: crate::error::Completion,
}

pub struct Talker {
    logger: slog::Logger,
    socket: UdpSocket,
    sessions: HashMap<SocketAddr, Session>,
    config: TalkerConfig,
    controller: Arc<dyn Controller>,
    recv_buf: Vec<u8>,
    send_backlog: VecDeque<(SocketAddr, Vec<u8>)>,
    completions: Vec<Completion>,
}

impl Talker {
    pub fn bind(logger: slog::Logger, addr: SocketAddr, config: TalkerConfig, controller: Arc<dyn Controller>) -> io::Result<Talker> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Talker {
            logger,
            socket,
            sessions: HashMap::new(),
            config,
            controller,
            recv_buf: vec![0u8; RECV_BUF_SIZE],
            send_backlog: VecDeque::new(),
            completions: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of the session toward `peer`, for diagnostics and tests.
    pub fn session_state(&self, peer: SocketAddr) -> Option<SessionState> {
        self.sessions.get(&peer).map(|s| s.state())
    }

    /// Number of send-window slots currently occupied for `peer`'s session.
    pub fn window_in_use(&self, peer: SocketAddr) -> Option<usize> {
        self.sessions.get(&peer).map(|s| s.window_in_use())
    }

    /// Take and clear every completion accumulated since the last call, for
    /// the owning service to route back to whoever enqueued the signal.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Open (or return the existing) session toward `peer`, initiating the
    /// handshake as `Connecting`.
    pub fn connect(&mut self, peer: SocketAddr) -> &mut Session {
        if !self.sessions.contains_key(&peer) {
            let session = Session::connecting(
                self.logger.clone(),
                peer,
                self.config.local_token,
                self.config.session_keep_alive,
                self.config.response_keep_alive,
                self.config.data_retransmit_count,
                self.config.connect_retransmit_count,
            );
            self.sessions.insert(peer, session);
        }
        self.sessions.get_mut(&peer).unwrap()
    }

    fn accept(&mut self, peer: SocketAddr) {
        let session = Session::accepting(
            self.logger.clone(),
            peer,
            self.config.local_token,
            self.config.session_keep_alive,
            self.config.response_keep_alive,
            self.config.data_retransmit_count,
            self.config.connect_retransmit_count,
        );
        self.sessions.insert(peer, session);
    }

    fn drain_datagrams(&mut self) {
        loop {
            let (len, peer) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    slog::warn!(self.logger, "talker recv failed"; "error" => %err);
                    break;
                }
            };

            let buffer = match Buffer::decode(&self.recv_buf[..len]) {
                Ok(buffer) => buffer,
                Err(_) => continue,
            };

            if !self.sessions.contains_key(&peer) {
                if buffer.header.buffer_type == BufferType::Connecting {
                    self.accept(peer);
                } else {
                    continue;
                }
            }

            let now = Instant::now();
            if let Some(session) = self.sessions.get_mut(&peer) {
                session.on_receive(buffer, now);
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some((peer, bytes)) = self.send_backlog.pop_front() {
            match self.socket.send_to(&bytes, peer) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.send_backlog.push_front((peer, bytes));
                    break;
                }
                Err(err) => {
                    slog::warn!(self.logger, "talker send failed"; "error" => %err, "peer" => %peer);
                }
            }
        }
    }

    /// Drive every session one step, collecting outbound buffers and
    /// completions, tearing down sessions that asked for it, and returning
    /// the nearest requested wakeup.
    fn poll_sessions(&mut self, now: Instant) -> Option<Instant> {
        let mut next_deadline: Option<Instant> = None;
        let mut dead = Vec::new();

        for (&peer, session) in self.sessions.iter_mut() {
            for payload in session.delivered.drain(..) {
                self.controller.deliver(peer, payload);
            }

            let wants: SessionWants = session.poll(now, self.config.max_buffer_size);
            for bytes in wants.outbound {
                self.send_backlog.push_back((peer, bytes));
            }
            for (uid, outcome) in wants.completions {
                self.completions.push(Completion { peer, uid, outcome });
            }
            if wants.teardown {
                dead.push(peer);
            } else if let Some(deadline) = wants.next_deadline {
                next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
            }
        }

        for peer in dead {
            slog::info!(self.logger, "session torn down"; "peer" => %peer);
            self.sessions.remove(&peer);
        }

        next_deadline
    }
}

impl Object for Talker {
    fn execute(&mut self, _events: Events, timeout: &mut Timeout) -> ExecuteResult {
        self.drain_datagrams();
        let now = Instant::now();
        let next_deadline = self.poll_sessions(now);
        self.flush_backlog();

        let bound = now + MAX_POLL_INTERVAL;
        let deadline = next_deadline.map_or(bound, |d| d.min(bound));
        *timeout = Some(deadline);
        ExecuteResult::WaitUntil(deadline)
    }

    fn notify(&mut self, signal: Signal) {
        match signal.downcast::<EnqueueSignal>() {
            Ok(message) => {
                let session = self.connect(message.peer);
                session.enqueue(message.payload, message.flags);
            }
            Err(_) => slog::warn!(self.logger, "talker received an unrecognized signal type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NullController;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn config() -> TalkerConfig {
        TalkerConfig {
            max_buffer_size: 4096,
            session_keep_alive: Duration::from_secs(10),
            response_keep_alive: Duration::from_secs(5),
            local_token: 1,
            data_retransmit_count: 8,
            connect_retransmit_count: 16,
        }
    }

    fn bind() -> Talker {
        Talker::bind(logger(), "127.0.0.1:0".parse().unwrap(), config(), Arc::new(NullController)).unwrap()
    }

    #[test]
    fn bind_picks_an_ephemeral_port() {
        let talker = bind();
        assert_ne!(talker.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn loopback_handshake_reaches_connected_on_both_sides() {
        let mut a = bind();
        let mut b = bind();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        a.connect(addr_b);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            a.execute(Events(0), &mut None);
            b.execute(Events(0), &mut None);
            let a_connected = a.session_state(addr_b) == Some(SessionState::Connected);
            let b_connected = b.session_state(addr_a) == Some(SessionState::Connected);
            if a_connected && b_connected {
                break;
            }
            if Instant::now() > deadline {
                panic!("handshake did not complete over loopback in time");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
