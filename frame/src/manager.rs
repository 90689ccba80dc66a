//! Process-wide registry tying `Service`s to `Selector`s.
//!
//! Grounded on `t51core/src/world.rs`'s `World` (a process-wide registry of
//! typed component stores looked up by a small integer id) generalized here
//! to two parallel registries — services and schedulers — looked up by
//! [`ServiceId`]/[`SchedulerId`]. Per the "global singletons" design note in
//! `SPEC_FULL.md` §9, the thread-local accessor is kept deliberately thin:
//! it exists so IPC session code deep in a call stack can reach the
//! manager without threading an explicit context argument through every
//! `Object::execute`, not as the primary way to obtain one.

use crate::error::{FrameError, FrameResult};
use crate::identity::{ObjectId, SchedulerId, ServiceId};
use crate::selector::SelectorHandle;
use crate::service::ServiceHandle;
use crate::signal::Signal;
use std::cell::RefCell;
use std::sync::{Arc, RwLock};

/// Process-wide registry of services and the selectors they may raise
/// signals on.
pub struct Manager {
    logger: slog::Logger,
    services: RwLock<Vec<Option<Arc<dyn ServiceHandle>>>>,
    schedulers: RwLock<Vec<Option<Arc<SelectorHandle>>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Manager>>> = RefCell::new(None);
}

impl Manager {
    pub fn new(logger: slog::Logger) -> Arc<Manager> {
        Arc::new(Manager {
            logger,
            services: RwLock::new(Vec::new()),
            schedulers: RwLock::new(Vec::new()),
        })
    }

    /// Install `manager` as the calling thread's default, for code that
    /// cannot conveniently carry an explicit `Arc<Manager>`. Selector
    /// worker threads call this once, at startup.
    pub fn enter(manager: Arc<Manager>) {
        CURRENT.with(|cell| *cell.borrow_mut() = Some(manager));
    }

    /// The calling thread's installed manager.
    ///
    /// # Panics
    /// Panics if no manager has been installed via [`Manager::enter`] on
    /// this thread.
    pub fn the() -> Arc<Manager> {
        CURRENT.with(|cell| {
            cell.borrow()
                .clone()
                .expect("no Manager installed on this thread; call Manager::enter first")
        })
    }

    /// Register a service under the next sequential `ServiceId`.
    pub fn register_service(&self, handle: Arc<dyn ServiceHandle>) -> ServiceId {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let index = services.len();
        services.push(Some(handle));
        slog::info!(self.logger, "service registered"; "service_id" => index);
        ServiceId(index as u16)
    }

    pub fn deregister_service(&self, id: ServiceId) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = services.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Register a selector's wake handle under the next sequential
    /// `SchedulerId`.
    pub fn register_scheduler(&self, handle: Arc<SelectorHandle>) -> SchedulerId {
        let mut schedulers = self.schedulers.write().unwrap_or_else(|e| e.into_inner());
        let index = schedulers.len();
        schedulers.push(Some(handle));
        SchedulerId(index as u16)
    }

    fn service(&self, id: ServiceId) -> FrameResult<Arc<dyn ServiceHandle>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or(FrameError::UnknownService)
    }

    /// OR `mask` into the signal mask of the object named by `id`. Per spec
    /// §4.4, an id whose service no longer exists is silently ignored
    /// rather than treated as an error — the caller has no way to have
    /// known the service was torn down concurrently.
    pub fn signal_mask(&self, id: ObjectId, mask: u32) -> bool {
        match self.service(id.service_id()) {
            Ok(service) => service.deliver_mask(id, mask).is_ok(),
            Err(_) => false,
        }
    }

    /// Deliver a dynamically-typed signal to the object named by `id`.
    /// Returns `false` (without error) if the target service no longer
    /// exists, matching [`Manager::signal_mask`]'s routing contract.
    pub fn signal_message(&self, id: ObjectId, signal: Signal) -> bool {
        match self.service(id.service_id()) {
            Ok(service) => service.deliver_message(id, signal).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Enqueue a wakeup for the object named by `id` on `selector_id`. This
    /// is the callback every `Service` is constructed with; it must stay
    /// cheap, since it may run on the hot path of an unrelated selector's
    /// `execute`.
    pub fn raise(&self, selector_id: SchedulerId, id: ObjectId) {
        let handle = self
            .schedulers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector_id.0 as usize)
            .and_then(|slot| slot.clone());
        if let Some(handle) = handle {
            handle.raise(id);
        }
    }

    /// Broadcast-stop every registered service, per spec §4.2's shutdown
    /// sequence.
    pub fn stop_all(&self, wait: bool) {
        let services: Vec<_> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|s| s.clone())
            .collect();
        for service in services {
            service.stop(wait);
        }
        for scheduler in self.schedulers.read().unwrap_or_else(|e| e.into_inner()).iter().flatten() {
            scheduler.request_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServiceId as Sid;
    use crate::mutexpool::MutexPool;
    use crate::object::{Events, ExecuteResult, Object, Timeout};
    use crate::service::Service;

    struct Counter;
    impl Object for Counter {
        fn execute(&mut self, _events: Events, _timeout: &mut Timeout) -> ExecuteResult {
            ExecuteResult::Wait
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn routes_signal_mask_by_service_id() {
        let manager = Manager::new(logger());
        let service = Arc::new(Service::<Counter>::new(
            logger(),
            Sid(0),
            Arc::new(MutexPool::new(2, 2, 2)),
            |_sid, _id| {},
        ));
        let service_id = manager.register_service(service.clone());
        let id = service.insert(Counter);
        let routed = ObjectId::new(service_id, id.object_index(), id.unique());
        assert!(manager.signal_mask(routed, 1));
    }

    #[test]
    fn unknown_service_id_is_silently_ignored() {
        let manager = Manager::new(logger());
        let id = ObjectId::new(Sid(9), 0, 0);
        assert!(!manager.signal_mask(id, 1));
    }

    #[test]
    fn raise_reaches_the_registered_selector_handle() {
        use crate::selector::Selector;

        let manager = Manager::new(logger());
        let mut selector = Selector::new(logger(), 16).unwrap();
        let selector_id = manager.register_scheduler(selector.handle());

        let service = Arc::new(Service::<Counter>::new(logger(), Sid(0), Arc::new(MutexPool::with_defaults()), {
            let manager = manager.clone();
            move |sid, id| manager.raise(sid, id)
        }));
        let obj_id = service.insert(Counter);
        let scheduled = service.scheduled(obj_id).unwrap();
        selector.schedule(selector_id, scheduled);
        selector.tick().unwrap();

        // Signaling after the object has gone to sleep must wake it again
        // via the manager's raise callback rather than only on first admit.
        service.signal_mask(obj_id, 1).unwrap();
        selector.tick().unwrap();
    }
}
