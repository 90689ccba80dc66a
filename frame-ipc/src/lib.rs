//! Reliable, message-oriented transport over UDP, layered on top of the
//! `frame` crate's cooperative scheduler: each [`talker::Talker`] is an
//! `Object` the embedder schedules like any other.
//!
//! See `SPEC_FULL.md` at the repository root for the full design.

pub mod buffer;
pub mod controller;
pub mod error;
pub mod service;
pub mod session;
pub mod talker;

pub use controller::{AuthDecision, Controller, NullController};
pub use error::{Completion, IpcError, IpcResult};
pub use service::IpcService;
pub use session::{Session, SessionState};
pub use talker::{Talker, TalkerConfig};
