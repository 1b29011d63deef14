//! Waiting for a set of processes to terminate
//!
//! A [`Join`] registers itself as a status monitor on each process it
//! tracks and fires its completion event once the last one reaches the
//! terminal state. Other processes wait on that event like on any other.

use crate::kernel::event::Event;
use crate::kernel::process::{MonitorEvent, Process, StatusMonitor};
use crate::kernel::scheduler::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks a set of processes and fires an event when all have terminated.
pub struct Join {
    /// Tracked processes still alive
    remaining: AtomicUsize,

    /// Fired once when the count reaches zero
    done: Arc<Event>,
}

impl Join {
    /// Create an empty join barrier.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(0),
            done: Event::new("join"),
        })
    }

    /// Track one more process. A process that is already terminated is not
    /// counted.
    pub fn add(self: &Arc<Self>, process: &Arc<Process>) {
        if process.is_zombie() {
            return;
        }
        self.remaining.fetch_add(1, Ordering::AcqRel);
        let monitor: Arc<dyn StatusMonitor> = self.clone();
        process.add_monitor(Arc::downgrade(&monitor));
    }

    /// The event fired when the last tracked process terminates.
    pub fn event(&self) -> Arc<Event> {
        self.done.clone()
    }

    /// Number of tracked processes still alive.
    pub fn pending(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl StatusMonitor for Join {
    fn signal(&self, sched: &Scheduler, _process: &Process, event: MonitorEvent) {
        if event != MonitorEvent::Terminated {
            return;
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify(sched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::coroutine::{Activation, Step, WaitFor};
    use crate::kernel::scheduler::{Scheduler, SpawnOptions};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_join_fires_after_last_termination() {
        let sched = Scheduler::new();
        let join = Join::new();

        // The waiter registers its wait before the workers terminate.
        let finished = Arc::new(AtomicBool::new(false));
        let gate = join.event();
        sched
            .spawn("waiter", SpawnOptions::default(), {
                let finished = finished.clone();
                let mut first = true;
                move |_: &mut Activation<'_>| {
                    if first {
                        first = false;
                        Step::Wait(WaitFor::Event(gate.clone()))
                    } else {
                        finished.store(true, Ordering::Release);
                        Step::Done
                    }
                }
            })
            .expect("spawn failed");

        for name in ["a", "b"] {
            let worker = sched
                .spawn(name, SpawnOptions::default(), |_: &mut Activation<'_>| {
                    Step::Done
                })
                .expect("spawn failed");
            join.add(&worker);
        }
        assert_eq!(join.pending(), 2);

        sched.run();
        assert_eq!(join.pending(), 0);
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_join_skips_already_dead_processes() {
        let sched = Scheduler::new();
        let join = Join::new();
        let worker = sched
            .spawn("w", SpawnOptions::default(), |_: &mut Activation<'_>| {
                Step::Done
            })
            .expect("spawn failed");
        worker.kill(&sched, crate::kernel::process::Scope::SelfOnly);

        join.add(&worker);
        assert_eq!(join.pending(), 0);
    }
}
