#[macro_use]
extern crate criterion;

extern crate frame;

use criterion::Criterion;
use frame::object::{Events, ExecuteResult, Object, Timeout};
use frame::{Scheduler, Manager};
use std::sync::Arc;

struct Ticker(u64);

impl Object for Ticker {
    fn execute(&mut self, _events: Events, _timeout: &mut Timeout) -> ExecuteResult {
        self.0 = self.0.wrapping_add(1);
        ExecuteResult::Wait
    }
}

fn admit_many(c: &mut Criterion) {
    c.bench_function("admit 1000 objects onto a scheduler", move |b| {
        b.iter_with_setup(
            || {
                let logger = frame::logging::discard();
                let manager = Manager::new(logger.clone());
                let scheduler = Scheduler::new(logger, manager.clone(), 4096, 4);
                let service = Arc::new(frame::Service::<Ticker>::new(
                    frame::logging::discard(),
                    frame::ServiceId(0),
                    Arc::new(frame::mutexpool::MutexPool::with_defaults()),
                    {
                        let manager = manager.clone();
                        move |sid, id| manager.raise(sid, id)
                    },
                ));
                (scheduler, service)
            },
            |(scheduler, service)| {
                for _ in 0..1000 {
                    let id = service.insert(Ticker(0));
                    let scheduled = service.scheduled(id).unwrap();
                    scheduler.schedule(scheduled).unwrap();
                }
                (scheduler, service)
            },
        )
    });
}

criterion_group!(benches, admit_many);
criterion_main!(benches);
