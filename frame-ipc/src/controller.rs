//! The embedder extension seam (spec §6.2). A `Controller` implementation
//! supplies everything the core transport deliberately does not own:
//! compression, authentication, and the relay hop topology.
//!
//! Grounded on `frame::signal::SignalDispatcher`'s type-tag registry
//! pattern: both are places where this workspace hands a closed, generic
//! core a small set of callbacks rather than parameterizing it over a
//! type the core would otherwise have to know about.

use frame::SignalUid;
use std::net::SocketAddr;

/// Default local network id, per spec §6.2.
pub const LOCAL_NETWORK_ID: u32 = 0;
/// Sentinel meaning "no relay routing", per spec §6.2.
pub const INVALID_NETWORK_ID: i64 = -1;

/// Outcome of [`Controller::authenticate`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthDecision {
    Reject,
    Accept,
    /// Defer: re-tag the signal under the given type id and try again once
    /// more context (e.g. a database round trip) resolves.
    Defer(u32),
}

/// Everything an embedder can inject into the transport without the core
/// knowing the concrete types involved.
pub trait Controller: Send + Sync {
    /// Hand a newly-constructed Talker's `Object` handle to the embedder's
    /// scheduler. The core never schedules Talkers itself (spec §6.2's
    /// `scheduleTalker` hook).
    fn schedule_talker(&self, talker: std::sync::Arc<dyn frame::service::Scheduled>);

    /// Attempt in-place compression. Returning `false` means "send
    /// uncompressed"; the core never requires compression to succeed.
    fn compress_buffer(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let _ = payload;
        None
    }

    /// Inverse of [`Controller::compress_buffer`]. `None` signals corrupt
    /// or unsupported input; the caller must treat the buffer as discarded.
    fn decompress_buffer(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let _ = payload;
        None
    }

    /// Judge a signal carrying `AuthenticationFlag` while its session is in
    /// `Authenticating`. Default: accept everything (no authentication
    /// configured).
    fn authenticate(&self, _uid: SignalUid, _type_id: u32) -> AuthDecision {
        AuthDecision::Accept
    }

    /// This process's network id for relay routing. Default: the unrouted
    /// local network.
    fn local_network_id(&self) -> u32 {
        LOCAL_NETWORK_ID
    }

    /// Relay hop addresses between here and `peer` on `peer_network_id`.
    /// Empty means "direct, no relay" (the default: relay routing is a
    /// collaborator hook, not core transport responsibility).
    fn gateway_iterator(&self, peer: SocketAddr, peer_network_id: u32) -> Vec<SocketAddr> {
        let _ = (peer, peer_network_id);
        Vec::new()
    }

    /// A payload was reassembled in order from `peer`. Not part of the
    /// spec's named hook list, but required to get delivered bytes out of
    /// the transport at all; the default discards them.
    fn deliver(&self, peer: SocketAddr, payload: Vec<u8>) {
        let _ = (peer, payload);
    }
}

/// A `Controller` with every hook at its spec-default behavior: no
/// compression, no authentication, no relaying. Useful for tests and for
/// embedders that only need the transport's reliability guarantees.
pub struct NullController;

impl Controller for NullController {
    fn schedule_talker(&self, _talker: std::sync::Arc<dyn frame::service::Scheduled>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_controller_accepts_every_signal() {
        let controller = NullController;
        assert_eq!(
            controller.authenticate(SignalUid { index: 0, unique: 0 }, 0),
            AuthDecision::Accept
        );
        assert_eq!(controller.local_network_id(), LOCAL_NETWORK_ID);
        assert!(controller.gateway_iterator("127.0.0.1:1".parse().unwrap(), 0).is_empty());
    }
}
