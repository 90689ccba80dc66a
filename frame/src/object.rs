//! The `Object` contract: a pseudo-active entity with state, a signal
//! bitmask, a notification inbox, and one `execute` step. It does not own a
//! thread — a `Selector` drives it.
//!
//! Grounded on the "exception-style control flow" design note in
//! `SPEC_FULL.md` §9: the source returns `int` codes (`OK/NOK/BAD/LEAVE`)
//! from inner loops; this crate models that as explicit sum types
//! (`ExecuteResult`, `SocketOp`) rather than exceptions, keeping hot paths
//! branch-predictable the way `server/lib/neutronium/src/net/shared.rs`'s
//! `NetworkResult`/`ErrorUtils` pattern already does for this teacher repo.

use std::time::Instant;

/// Bitset of events delivered to `Object::execute`. Plain `u32` constants
/// rather than a `bitflags!`-generated type: the set is small, fixed, and
/// the framework never needs more than bitwise or/and over it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Events(pub u32);

impl Events {
    pub const NONE: u32 = 0;
    pub const RAISE: u32 = 1 << 0;
    pub const TIMEOUT: u32 = 1 << 1;
    pub const READ_READY: u32 = 1 << 2;
    pub const WRITE_READY: u32 = 1 << 3;
    pub const ERROR: u32 = 1 << 4;
    pub const IN_DONE: u32 = 1 << 5;
    pub const OUT_DONE: u32 = 1 << 6;
    pub const TIMEOUT_RECV: u32 = 1 << 7;
    pub const TIMEOUT_SEND: u32 = 1 << 8;
    pub const RESCHEDULE: u32 = 1 << 9;

    #[inline]
    pub fn has(&self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    #[inline]
    pub fn with(mut self, mask: u32) -> Events {
        self.0 |= mask;
        self
    }
}

/// In/out deadline argument to `execute`. `None` means "no deadline" (the
/// object is happy to `WAIT` forever absent other events).
pub type Timeout = Option<Instant>;

/// Outcome of one `execute` step, mapped by the `Selector` per spec §4.5
/// step 5.
#[derive(Debug)]
pub enum ExecuteResult {
    /// Destroy the object: remove it from its owning service and drop it.
    Done,
    /// Run `execute` again immediately, without waiting for new events.
    Reschedule,
    /// Sleep until a signal or notification arrives.
    Wait,
    /// Sleep until `Instant`, or until a signal/notification arrives first.
    WaitUntil(Instant),
    /// Detach without destroying — the object has been handed to another
    /// owner (e.g. promoted into an IPC Talker). The selector releases its
    /// strong reference without touching the object's state.
    Leave,
}

/// Outcome of a non-blocking socket operation an `Object` attempted during
/// `execute`, per spec §4.5's AIO contract. Blocking I/O is never allowed
/// inside `execute`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocketOp {
    /// Completed synchronously.
    Ok,
    /// Pending; the selector will wake the object with `IN_DONE`/`OUT_DONE`
    /// once the registered readiness interest fires.
    Nok,
    /// Fatal — the object should treat the socket as unusable.
    Bad,
}

/// A pseudo-active entity scheduled cooperatively by a `Selector`.
///
/// Implementors own no thread: `execute` runs to completion on whichever
/// selector thread currently owns the object, and must never block.
pub trait Object: Send + 'static {
    /// One execution step. `events` is the union of everything accumulated
    /// for this object since its previous `execute` returned; `timeout` is
    /// read on entry (the deadline that was requested last time, if any)
    /// and may be overwritten to request a new one.
    fn execute(&mut self, events: Events, timeout: &mut Timeout) -> ExecuteResult;

    /// Called once per queued notification, in arrival order, immediately
    /// before `execute` runs for this tick. The default implementation
    /// ignores notifications; objects that care downcast `signal` to their
    /// expected message types (see [`crate::signal::SignalDispatcher`] for
    /// a reusable type-tag registry matching this framework's
    /// "DynamicExecuter" design note).
    #[allow(unused_variables)]
    fn notify(&mut self, signal: crate::signal::Signal) {}
}
