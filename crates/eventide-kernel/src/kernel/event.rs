//! Notification points processes wait on
//!
//! An [`Event`] owns two waiter lists: the static list, fixed when a process
//! is spawned with a sensitivity, and the dynamic list, populated ad hoc by
//! outstanding wait requests. Firing an event consults the trigger logic for
//! every waiter and applies the returned directive; the dynamic registration
//! survives only when the directive says so.

use crate::kernel::process::Process;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::trigger::Directive;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for an Event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventId(u64);

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl EventId {
    /// Generate a new unique EventId.
    pub fn new() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// A synchronization point processes register against to be woken.
pub struct Event {
    /// Unique identifier
    id: EventId,

    /// Diagnostic name
    name: String,

    /// Processes statically sensitive to this event (fixed at spawn)
    static_waiters: Mutex<Vec<Weak<Process>>>,

    /// Processes with an outstanding dynamic wait involving this event
    dynamic_waiters: Mutex<Vec<Arc<Process>>>,
}

impl Event {
    /// Create a new event with a diagnostic name.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: EventId::new(),
            name: name.into(),
            static_waiters: Mutex::new(Vec::new()),
            dynamic_waiters: Mutex::new(Vec::new()),
        })
    }

    /// Get the event's unique ID.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Get the event's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire the event now.
    ///
    /// Every static waiter is offered a static trigger, then every dynamic
    /// waiter is resolved and its directive applied. An immediate firing
    /// supersedes a still-scheduled delta notification of the same event.
    pub fn notify(&self, sched: &Scheduler) {
        self.cancel(sched);
        log::trace!("event {} fired", self.name);

        // Static sensitivity first, pruning dropped processes as we go.
        let stat: Vec<Arc<Process>> = {
            let mut waiters = self.static_waiters.lock();
            waiters.retain(|w| w.strong_count() > 0);
            waiters.iter().filter_map(Weak::upgrade).collect()
        };
        for process in &stat {
            process.trigger_static(sched);
        }

        // Dynamic waiters are drained and only re-registered when the
        // trigger decision keeps them alive.
        let waiting = std::mem::take(&mut *self.dynamic_waiters.lock());
        let mut kept = Vec::new();
        for process in waiting {
            match process.trigger_dynamic(sched, self) {
                Directive::Rearm => kept.push(process),
                Directive::Remove => {}
                Directive::Run => {
                    sched.enqueue(&process);
                    kept.push(process);
                }
                Directive::RunAndRemove => sched.enqueue(&process),
            }
        }
        let mut waiters = self.dynamic_waiters.lock();
        kept.append(&mut waiters);
        *waiters = kept;
    }

    /// Schedule this event to fire at the next delta boundary.
    ///
    /// Only one scheduled notification exists per event; a later request
    /// replaces an earlier one.
    pub fn notify_delta(self: &Arc<Self>, sched: &Scheduler) {
        sched.schedule_delta(self.clone(), 1);
    }

    /// Cancel a scheduled notification, if one is outstanding.
    pub fn cancel(&self, sched: &Scheduler) {
        sched.cancel_delta(self.id);
    }

    /// Return the event to its idle state.
    ///
    /// Cancels any scheduled notification and drops all dynamic waiters.
    /// Used for timeout companions that are reused across waits.
    pub fn reset(&self, sched: &Scheduler) {
        self.cancel(sched);
        self.dynamic_waiters.lock().clear();
    }

    /// Number of outstanding dynamic registrations.
    pub fn waiter_count(&self) -> usize {
        self.dynamic_waiters.lock().len()
    }

    pub(crate) fn add_waiter(&self, process: &Arc<Process>) {
        self.dynamic_waiters.lock().push(process.clone());
    }

    pub(crate) fn remove_waiter(&self, process: &Process) {
        self.dynamic_waiters
            .lock()
            .retain(|p| p.id() != process.id());
    }

    pub(crate) fn add_static_waiter(&self, process: &Arc<Process>) {
        self.static_waiters.lock().push(Arc::downgrade(process));
    }

    pub(crate) fn remove_static_waiter(&self, process: &Process) {
        self.static_waiters
            .lock()
            .retain(|w| w.upgrade().is_some_and(|p| p.id() != process.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_uniqueness() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new("request");
        assert_eq!(event.name(), "request");
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn test_notify_without_waiters_is_noop() {
        let sched = Scheduler::new();
        let event = Event::new("idle");
        event.notify(&sched);
        assert_eq!(event.waiter_count(), 0);
    }
}
