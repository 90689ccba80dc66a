//! Dynamic message dispatch.
//!
//! Grounded on the "Dynamic message dispatch" design note in
//! `SPEC_FULL.md` §9: signals are heterogeneous; the source's
//! "DynamicExecuter" used runtime class hierarchies to dispatch them. This
//! crate replaces that with a flat `type_id -> closure` registry an
//! `Object` implementation can build once and reuse across every
//! `notify()` call — the registry itself is the "flat `match` on the tag".

use hashbrown::HashMap;
use std::any::{Any, TypeId};

/// A heterogeneous notification delivered to an object's inbox.
pub type Signal = Box<dyn Any + Send>;

/// Registry of `type_id -> decode+dispatch` closures for a single `Object`
/// implementation. Typically built once (e.g. in the object's
/// constructor) and consulted from `Object::notify`.
pub struct SignalDispatcher<O> {
    handlers: HashMap<TypeId, Box<dyn Fn(&mut O, Signal) + Send + Sync>>,
}

impl<O> Default for SignalDispatcher<O> {
    fn default() -> Self {
        SignalDispatcher::new()
    }
}

impl<O> SignalDispatcher<O> {
    pub fn new() -> Self {
        SignalDispatcher {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for message type `M`. Registering a second
    /// handler for the same `M` replaces the first.
    pub fn register<M: 'static>(&mut self, handler: impl Fn(&mut O, M) + Send + Sync + 'static) {
        self.handlers.insert(
            TypeId::of::<M>(),
            Box::new(move |obj, signal| match signal.downcast::<M>() {
                Ok(message) => handler(obj, *message),
                Err(_) => unreachable!("dispatcher keyed the handler by the signal's own TypeId"),
            }),
        );
    }

    /// Dispatch `signal` to whichever handler (if any) was registered for
    /// its concrete type. Returns `true` if a handler ran.
    pub fn dispatch(&self, object: &mut O, signal: Signal) -> bool {
        let type_id = (*signal).type_id();
        match self.handlers.get(&type_id) {
            Some(handler) => {
                handler(object, signal);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        pings: u32,
        last_pong: Option<u32>,
    }

    struct Ping;
    struct Pong(u32);

    #[test]
    fn dispatches_by_concrete_type() {
        let mut dispatcher = SignalDispatcher::new();
        dispatcher.register::<Ping>(|counter: &mut Counter, _| counter.pings += 1);
        dispatcher.register::<Pong>(|counter: &mut Counter, pong| counter.last_pong = Some(pong.0));

        let mut counter = Counter {
            pings: 0,
            last_pong: None,
        };

        assert!(dispatcher.dispatch(&mut counter, Box::new(Ping)));
        assert!(dispatcher.dispatch(&mut counter, Box::new(Pong(7))));
        assert_eq!(counter.pings, 1);
        assert_eq!(counter.last_pong, Some(7));
    }

    #[test]
    fn unregistered_type_is_a_no_op() {
        let dispatcher: SignalDispatcher<Counter> = SignalDispatcher::new();
        let mut counter = Counter {
            pings: 0,
            last_pong: None,
        };
        assert!(!dispatcher.dispatch(&mut counter, Box::new(42u8)));
    }
}
