//! Single-threaded reactor driving a slab of scheduled objects.
//!
//! Grounded on `server/lib/neutronium/src/net/endpoint.rs`'s `Endpoint`
//! (a single struct owning an `mio::Poll`, a dense `channels` vector, a
//! `free` list, and a `sync(now)` tick driven by the owning thread) and on
//! the main-loop steps spec'd in §4.5. `mio` is reused both as the
//! cross-thread wake mechanism (an `mio::Waker` registered on the same
//! `Poll`) and as the AIO variant's kernel-readiness interface, rather than
//! hand-rolling a self-pipe the way the upstream C++ sources do.

use crate::identity::ObjectId;
use crate::object::{Events, ExecuteResult};
use crate::service::Scheduled;
use hashbrown::HashMap;
use mio::{Events as MioEvents, Interest, Poll, Token, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// No more than one full scan of the slab per this interval, per spec
/// §4.5: "next timeout is computed in O(size) per full scan which happens
/// no more often than every 60 s".
pub const FULL_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Cheap, cross-thread handle used to raise a signal on an object this
/// selector owns, and to request the selector's shutdown. This is the
/// "one write() on the selector's wake pipe or equivalent" from spec §4.4.
pub struct SelectorHandle {
    pending: Mutex<Vec<ObjectId>>,
    admit: Mutex<Vec<Arc<dyn Scheduled>>>,
    exit_requested: AtomicBool,
    waker: Waker,
    live: std::sync::atomic::AtomicUsize,
}

impl SelectorHandle {
    /// Queue `id` to be woken on the selector's next tick.
    pub fn raise(&self, id: ObjectId) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).push(id);
        let _ = self.waker.wake();
    }

    /// Ask the selector to exit once its slab is empty.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Approximate live-object count, for the scheduler's admission policy.
    /// Read from a different thread than the one driving the selector, so
    /// it may lag by up to one tick; that is acceptable for a "roughly
    /// balanced, not overcommitted" placement decision.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Hand a newly-constructed object's scheduled handle to this selector
    /// from another thread; picked up on its next tick. Used by
    /// [`crate::scheduler::Scheduler`] to place objects without requiring
    /// a `&mut Selector` from outside the thread that owns it.
    pub fn admit(&self, scheduled: Arc<dyn Scheduled>) {
        self.admit.lock().unwrap_or_else(|e| e.into_inner()).push(scheduled);
        let _ = self.waker.wake();
    }

    fn take_pending(&self) -> Vec<ObjectId> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn take_admitted(&self) -> Vec<Arc<dyn Scheduled>> {
        std::mem::take(&mut *self.admit.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

struct SlotEntry {
    scheduled: Arc<dyn Scheduled>,
    deadline: Option<Instant>,
    events: u32,
    in_ready: bool,
}

/// An I/O readiness registration an object requested during `execute`, the
/// AIO variant's extension to the base reactor (spec §4.5).
pub struct IoRegistrar<'a> {
    poll: &'a Poll,
    io_tokens: &'a mut HashMap<Token, usize>,
    slot: usize,
    next_token: &'a mut usize,
}

impl<'a> IoRegistrar<'a> {
    pub fn register(&mut self, source: &mut dyn mio::event::Source, interest: Interest) -> std::io::Result<Token> {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        self.io_tokens.insert(token, self.slot);
        Ok(token)
    }

    pub fn deregister(&mut self, source: &mut dyn mio::event::Source, token: Token) -> std::io::Result<()> {
        self.io_tokens.remove(&token);
        self.poll.registry().deregister(source)
    }
}

/// Single-threaded event loop. Owns a slab of scheduled objects, a ready
/// FIFO, a timer-wheel-by-full-scan, and the wake pipe described above.
pub struct Selector {
    logger: slog::Logger,
    poll: Poll,
    events_buf: MioEvents,
    handle: Arc<SelectorHandle>,
    entries: Vec<Option<SlotEntry>>,
    free: Vec<usize>,
    index_of: HashMap<ObjectId, usize>,
    io_tokens: HashMap<Token, usize>,
    next_io_token: usize,
    ready: std::collections::VecDeque<usize>,
    next_timeout: Instant,
    next_full_scan: Instant,
    capacity: usize,
    self_id: Option<crate::identity::SchedulerId>,
}

impl Selector {
    pub fn new(logger: slog::Logger, capacity: usize) -> std::io::Result<Selector> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let now = Instant::now();

        Ok(Selector {
            logger,
            poll,
            events_buf: MioEvents::with_capacity(1024),
            handle: Arc::new(SelectorHandle {
                pending: Mutex::new(Vec::new()),
                admit: Mutex::new(Vec::new()),
                exit_requested: AtomicBool::new(false),
                waker,
                live: std::sync::atomic::AtomicUsize::new(0),
            }),
            entries: Vec::new(),
            free: Vec::new(),
            index_of: HashMap::new(),
            io_tokens: HashMap::new(),
            next_io_token: 0,
            ready: std::collections::VecDeque::new(),
            next_timeout: now + FULL_SCAN_INTERVAL,
            next_full_scan: now + FULL_SCAN_INTERVAL,
            capacity,
            self_id: None,
        })
    }

    pub fn handle(&self) -> Arc<SelectorHandle> {
        self.handle.clone()
    }

    /// Record the `SchedulerId` this selector was registered under, so
    /// objects admitted via [`SelectorHandle::admit`] can be told which
    /// selector now owns them. Must be called before [`Selector::run`] if
    /// the selector will ever receive cross-thread admissions.
    pub fn set_id(&mut self, id: crate::identity::SchedulerId) {
        self.self_id = Some(id);
    }

    /// Number of live objects currently owned by this selector.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this selector has spare capacity, per the scheduler's
    /// admission policy (spec §4.6).
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Place a newly-admitted object into this selector's slab and tell it
    /// which selector it now belongs to.
    pub fn schedule(&mut self, selector_id: crate::identity::SchedulerId, scheduled: Arc<dyn Scheduled>) {
        let id = scheduled.id();
        scheduled.assign_selector(selector_id);

        let index = if let Some(index) = self.free.pop() {
            self.entries[index] = Some(SlotEntry {
                scheduled,
                deadline: None,
                events: 0,
                in_ready: true,
            });
            index
        } else {
            self.entries.push(Some(SlotEntry {
                scheduled,
                deadline: None,
                events: 0,
                in_ready: true,
            }));
            self.entries.len() - 1
        };

        self.index_of.insert(id, index);
        self.ready.push_back(index);
        self.handle.live.fetch_add(1, Ordering::Relaxed);
        slog::debug!(self.logger, "object scheduled"; "object" => %id, "slot" => index);
    }

    fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries[index].take() {
            self.index_of.retain(|_, v| *v != index);
            self.handle.live.fetch_sub(1, Ordering::Relaxed);
            let _ = entry;
        }
        self.free.push(index);
    }

    fn full_scan(&mut self, now: Instant) {
        let mut next = now + FULL_SCAN_INTERVAL;
        for (idx, slot) in self.entries.iter_mut().enumerate() {
            let entry = match slot {
                Some(entry) => entry,
                None => continue,
            };
            let due = entry.deadline.map(|d| d <= now).unwrap_or(false);
            if due {
                entry.events |= Events::TIMEOUT;
            }
            if due || entry.events != 0 {
                if !entry.in_ready {
                    entry.in_ready = true;
                    self.ready.push_back(idx);
                }
            } else if let Some(deadline) = entry.deadline {
                next = next.min(deadline);
            }
        }
        self.next_timeout = next;
    }

    /// Run one iteration of the main loop (step 1-5 of spec §4.5). Exposed
    /// separately from [`Selector::run`] so tests can single-step it.
    pub fn tick(&mut self) -> std::io::Result<bool> {
        let now = Instant::now();

        let wait = if !self.ready.is_empty() {
            Some(Duration::from_millis(0))
        } else if now >= self.next_full_scan {
            Some(Duration::from_millis(0))
        } else {
            let deadline = self.next_timeout.min(self.next_full_scan);
            Some(deadline.saturating_duration_since(now))
        };

        self.poll.poll(&mut self.events_buf, wait)?;

        if let Some(self_id) = self.self_id {
            for scheduled in self.handle.take_admitted() {
                self.schedule(self_id, scheduled);
            }
        }

        for id in self.handle.take_pending() {
            if let Some(&idx) = self.index_of.get(&id) {
                if let Some(entry) = &mut self.entries[idx] {
                    entry.events |= Events::RAISE;
                    if !entry.in_ready {
                        entry.in_ready = true;
                        self.ready.push_back(idx);
                    }
                }
            }
        }

        for event in self.events_buf.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            if let Some(&idx) = self.io_tokens.get(&event.token()) {
                if let Some(entry) = &mut self.entries[idx] {
                    let mut mask = 0;
                    if event.is_readable() {
                        mask |= Events::READ_READY;
                    }
                    if event.is_writable() {
                        mask |= Events::WRITE_READY;
                    }
                    if event.is_error() {
                        mask |= Events::ERROR;
                    }
                    entry.events |= mask;
                    if !entry.in_ready {
                        entry.in_ready = true;
                        self.ready.push_back(idx);
                    }
                }
            }
        }

        if now >= self.next_full_scan {
            self.full_scan(now);
            self.next_full_scan = now + FULL_SCAN_INTERVAL;
        }

        // Drain the ready FIFO exactly once: entries pushed back onto it
        // during this batch run next tick, preventing livelock.
        let batch: Vec<usize> = self.ready.drain(..).collect();
        for idx in batch {
            let (scheduled, events, mut timeout) = match &mut self.entries[idx] {
                Some(entry) => {
                    entry.in_ready = false;
                    let events = std::mem::take(&mut entry.events);
                    (entry.scheduled.clone(), events, entry.deadline)
                }
                None => continue,
            };

            let result = scheduled.run(Events(events), &mut timeout);

            match result {
                ExecuteResult::Done => self.remove(idx),
                ExecuteResult::Reschedule => {
                    if let Some(entry) = &mut self.entries[idx] {
                        entry.deadline = None;
                        entry.in_ready = true;
                    }
                    self.ready.push_back(idx);
                }
                ExecuteResult::Wait => {
                    if let Some(entry) = &mut self.entries[idx] {
                        entry.deadline = None;
                    }
                }
                ExecuteResult::WaitUntil(t) => {
                    if let Some(entry) = &mut self.entries[idx] {
                        entry.deadline = Some(t);
                    }
                    if t < self.next_timeout {
                        self.next_timeout = t;
                    }
                }
                ExecuteResult::Leave => self.remove(idx),
            }
        }

        Ok(self.handle.exit_requested.load(Ordering::Acquire) && self.is_empty())
    }

    /// Run until the slab is empty and shutdown has been requested.
    pub fn run(mut self) {
        loop {
            match self.tick() {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    slog::crit!(self.logger, "selector poll failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Register `source` for readiness notifications on behalf of the
    /// object at slab index `slot`, for use from within an `Object::execute`
    /// implementation (the AIO variant's extension point).
    pub fn io(&mut self, slot: usize) -> IoRegistrar<'_> {
        IoRegistrar {
            poll: &self.poll,
            io_tokens: &mut self.io_tokens,
            slot,
            next_token: &mut self.next_io_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ObjectId, ServiceId};
    use crate::object::Timeout;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingObject {
        id: ObjectId,
        runs: Arc<AtomicU32>,
        result: ExecuteResultKind,
    }

    #[derive(Clone, Copy)]
    enum ExecuteResultKind {
        Wait,
        Done,
    }

    impl Scheduled for CountingObject {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn run(&self, _events: Events, _timeout: &mut Timeout) -> ExecuteResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.result {
                ExecuteResultKind::Wait => ExecuteResult::Wait,
                ExecuteResultKind::Done => ExecuteResult::Done,
            }
        }
        fn assign_selector(&self, _selector: crate::identity::SchedulerId) {}
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn newly_scheduled_object_runs_on_first_tick() {
        let mut selector = Selector::new(logger(), 16).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let obj: Arc<dyn Scheduled> = Arc::new(CountingObject {
            id: ObjectId::new(ServiceId(0), 0, 0),
            runs: runs.clone(),
            result: ExecuteResultKind::Wait,
        });
        selector.schedule(crate::identity::SchedulerId(0), obj);
        selector.tick().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn done_result_removes_the_slot() {
        let mut selector = Selector::new(logger(), 16).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let obj: Arc<dyn Scheduled> = Arc::new(CountingObject {
            id: ObjectId::new(ServiceId(0), 0, 0),
            runs,
            result: ExecuteResultKind::Done,
        });
        selector.schedule(crate::identity::SchedulerId(0), obj);
        selector.tick().unwrap();
        assert_eq!(selector.len(), 0);
    }

    #[test]
    fn raise_wakes_a_waiting_object() {
        let mut selector = Selector::new(logger(), 16).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let id = ObjectId::new(ServiceId(0), 0, 0);
        let obj: Arc<dyn Scheduled> = Arc::new(CountingObject {
            id,
            runs: runs.clone(),
            result: ExecuteResultKind::Wait,
        });
        selector.schedule(crate::identity::SchedulerId(0), obj);
        selector.tick().unwrap(); // first run, transitions to WAIT
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let handle = selector.handle();
        handle.raise(id);
        selector.tick().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exit_is_honored_only_once_the_slab_drains() {
        let mut selector = Selector::new(logger(), 16).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let id = ObjectId::new(ServiceId(0), 0, 0);
        let obj: Arc<dyn Scheduled> = Arc::new(CountingObject {
            id,
            runs,
            result: ExecuteResultKind::Done,
        });
        selector.schedule(crate::identity::SchedulerId(0), obj);
        selector.handle().request_exit();
        let done = selector.tick().unwrap();
        assert!(done);
    }
}
