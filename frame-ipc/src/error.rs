//! Error taxonomy for the IPC transport.
//!
//! Grounded on `server/lib/flux/src/shared.rs`'s `NetworkError`/
//! `NetworkResult` split between a `Wait` (would-block, retry) case and a
//! `Fatal(ErrorType)` case, generalized per spec §7's four-way taxonomy:
//! transient, per-session recoverable, programming error (asserted, not
//! represented here), and fatal-per-talker.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum IpcError {
    /// Would-block: retry on the next tick. Never surfaced to the user.
    Wait,
    /// A session's handshake (or data buffer) retry budget was exhausted;
    /// the session transitions to `Disconnecting`.
    HandshakeExhausted,
    /// Header sanity check failed for one datagram (bad type, reserved
    /// flag bits set, truncated update block); the datagram is discarded.
    ChecksumMismatch,
    /// Talker construction failed to bind its socket.
    BindFailed(io::Error),
    /// Every Talker is at its `sessions_per_talker` cap and `max_talkers`
    /// forbids spinning up another.
    TalkerPoolSaturated,
    /// The recipient's Talker was torn down or never existed.
    UnknownTalker,
}

pub type IpcResult<T> = Result<T, IpcError>;

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::Wait => write!(f, "operation would block"),
            IpcError::HandshakeExhausted => write!(f, "retry budget exhausted"),
            IpcError::ChecksumMismatch => write!(f, "buffer failed header validation"),
            IpcError::BindFailed(err) => write!(f, "failed to bind talker socket: {err}"),
            IpcError::TalkerPoolSaturated => write!(f, "talker pool is at capacity"),
            IpcError::UnknownTalker => write!(f, "recipient's talker is no longer registered"),
        }
    }
}

impl std::error::Error for IpcError {}

impl From<io::Error> for IpcError {
    #[inline]
    fn from(err: io::Error) -> IpcError {
        match err.kind() {
            io::ErrorKind::WouldBlock => IpcError::Wait,
            _ => IpcError::BindFailed(err),
        }
    }
}

/// Per-signal completion code delivered when a `WaitResponse` signal's
/// fate is known, per spec §7's "user-visible failure for IPC signals".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Completion {
    /// `ipcComplete(0)`.
    Success,
    /// `ipcComplete(-1)`: never left the process.
    NeverSent,
    /// `ipcComplete(-2)`: sent but the peer died or never responded.
    NoResponse,
}
