use std::fmt;

/// Errors surfaced by the object/service/manager layer.
///
/// These are always recoverable and returned to the caller. Programming
/// errors in the sense of spec §7 — stale-id reuse inside the framework's
/// own bookkeeping, mutex-ordering violations, double-requesting a scratch
/// buffer — are asserted with `panic!`/`expect` at the point of violation
/// instead of being folded into this enum, matching
/// `server/lib/flux/src/shared.rs`'s split between recoverable
/// `NetworkError` values and outright `unreachable!()`/`expect()` calls for
/// conditions that should never occur if the caller holds up its end of the
/// contract.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum FrameError {
    /// No service is registered for the id carried by the full index.
    UnknownService,
    /// The service has no live object at the slot the id names.
    UnknownObject,
    /// The slot exists but its generation no longer matches the id.
    StaleObjectId,
    /// The scheduler has reached `maxworkers` and has no non-full selector
    /// to place a new object on.
    SchedulerSaturated,
    /// The OS refused to spawn a new selector worker thread.
    WorkerSpawnFailed,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnknownService => write!(f, "no service registered for this id"),
            FrameError::UnknownObject => write!(f, "no live object at this slot"),
            FrameError::StaleObjectId => write!(f, "object id refers to a reused or erased slot"),
            FrameError::SchedulerSaturated => write!(f, "scheduler has reached its worker cap"),
            FrameError::WorkerSpawnFailed => write!(f, "failed to spawn a selector worker thread"),
        }
    }
}

impl std::error::Error for FrameError {}

pub type FrameResult<T> = Result<T, FrameError>;
