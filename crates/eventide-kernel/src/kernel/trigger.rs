//! Trigger resolution: deciding whether a firing event wakes a process
//!
//! When an event a process waits on fires, the resolver consults the
//! process's outstanding [`Trigger`] and its status flags and hands a
//! [`Directive`] back to the event. The directive tells the event what to do
//! with the dynamic registration it holds for the process; any bookkeeping
//! on the process side (wake grants, counter decrements, releasing list and
//! timeout ownership) happens here.

use crate::kernel::event::Event;
use crate::kernel::process::{Process, Status};
use crate::kernel::scheduler::Scheduler;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Outstanding dynamic wait of a process.
///
/// List and timeout ownership lives inside the variant; replacing the value
/// with `Static` releases it, and doing so exactly once per wait is what
/// keeps waiter lists consistent.
pub(crate) enum Trigger {
    /// No dynamic wait outstanding; only static sensitivity applies.
    Static,

    /// A single event.
    Event(Arc<Event>),

    /// Any one event of the list fires.
    OrList(Vec<Arc<Event>>),

    /// Every event of the list must fire; `pending` counts the stragglers.
    AndList {
        events: Vec<Arc<Event>>,
        pending: usize,
    },

    /// A bare timeout.
    Timeout(Arc<Event>),

    /// A single event raced against a timeout companion.
    EventTimeout {
        event: Arc<Event>,
        timeout: Arc<Event>,
    },

    /// An or-list raced against a timeout companion.
    OrListTimeout {
        events: Vec<Arc<Event>>,
        timeout: Arc<Event>,
    },

    /// An and-list raced against a timeout companion.
    AndListTimeout {
        events: Vec<Arc<Event>>,
        pending: usize,
        timeout: Arc<Event>,
    },
}

/// Decision returned to a notifying event for one dynamic waiter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Ignore this firing and keep the registration; the process is
    /// administratively blocked and the decision is deferred.
    Rearm,

    /// Drop the registration without scheduling the process.
    Remove,

    /// Schedule the process but keep the registration, which a partially
    /// satisfied list wait still needs for cleanup.
    Run,

    /// Schedule the process and drop the registration.
    RunAndRemove,
}

impl Process {
    /// Resolve the firing of `fired` against this process's dynamic wait.
    ///
    /// A process that is already runnable cannot be triggered again; the
    /// stale registration is simply dropped. Reaching this resolver with no
    /// outstanding dynamic wait is an internal consistency failure.
    pub(crate) fn trigger_dynamic(
        self: &Arc<Self>,
        sched: &Scheduler,
        fired: &Event,
    ) -> Directive {
        self.timed_out.store(false, Ordering::Release);
        if self.is_queued() {
            return Directive::Remove;
        }

        let status = self.status();
        let mut trigger = self.trigger.lock();
        match &mut *trigger {
            Trigger::Static => {
                panic!(
                    "process {} triggered with no outstanding dynamic wait",
                    self.name()
                );
            }

            Trigger::Event(_) => {
                let directive = if status == Status::empty() {
                    Directive::RunAndRemove
                } else if status.contains(Status::DISABLED) {
                    return Directive::Rearm;
                } else if status.contains(Status::SUSPENDED) {
                    self.or_status(Status::READY_TO_RUN);
                    Directive::Remove
                } else {
                    Directive::Remove
                };
                *trigger = Trigger::Static;
                directive
            }

            Trigger::AndList { pending, .. } => {
                if status.contains(Status::DISABLED) {
                    return Directive::Rearm;
                }
                *pending = pending.saturating_sub(1);
                let complete = *pending == 0;
                let directive = if status == Status::empty() {
                    if complete {
                        Directive::RunAndRemove
                    } else {
                        Directive::Remove
                    }
                } else if status.contains(Status::SUSPENDED) {
                    if complete {
                        self.or_status(Status::READY_TO_RUN);
                    }
                    Directive::Remove
                } else {
                    Directive::Remove
                };
                if complete {
                    // Every other member consumed its own registration when
                    // it fired, so dropping the list is the whole cleanup.
                    *trigger = Trigger::Static;
                }
                directive
            }

            Trigger::OrList(_) => {
                let directive = if status == Status::empty() {
                    Directive::RunAndRemove
                } else if status.contains(Status::DISABLED) {
                    return Directive::Rearm;
                } else if status.contains(Status::SUSPENDED) {
                    self.or_status(Status::READY_TO_RUN);
                    Directive::Remove
                } else {
                    Directive::Remove
                };
                if let Trigger::OrList(events) =
                    std::mem::replace(&mut *trigger, Trigger::Static)
                {
                    for event in &events {
                        if event.id() != fired.id() {
                            event.remove_waiter(self);
                        }
                    }
                }
                directive
            }

            Trigger::Timeout(_) => {
                let directive = if status == Status::empty() {
                    Directive::RunAndRemove
                } else if status.contains(Status::DISABLED) {
                    // The timeout cancels the wait even while disabled.
                    Directive::Remove
                } else if status.contains(Status::SUSPENDED) {
                    self.or_status(Status::READY_TO_RUN);
                    Directive::Remove
                } else {
                    Directive::Remove
                };
                *trigger = Trigger::Static;
                directive
            }

            Trigger::EventTimeout { timeout, .. } => {
                let timeout_fired = fired.id() == timeout.id();
                if timeout_fired {
                    let directive = if status == Status::empty() {
                        Directive::RunAndRemove
                    } else if status.contains(Status::DISABLED) {
                        Directive::Remove
                    } else if status.contains(Status::SUSPENDED) {
                        self.or_status(Status::READY_TO_RUN);
                        Directive::Remove
                    } else {
                        Directive::Remove
                    };
                    self.timed_out.store(true, Ordering::Release);
                    if let Trigger::EventTimeout { event, .. } =
                        std::mem::replace(&mut *trigger, Trigger::Static)
                    {
                        event.remove_waiter(self);
                    }
                    directive
                } else {
                    let directive = if status == Status::empty() {
                        Directive::RunAndRemove
                    } else if status.contains(Status::DISABLED) {
                        return Directive::Rearm;
                    } else if status.contains(Status::SUSPENDED) {
                        self.or_status(Status::READY_TO_RUN);
                        Directive::Remove
                    } else {
                        Directive::Remove
                    };
                    if let Trigger::EventTimeout { timeout, .. } =
                        std::mem::replace(&mut *trigger, Trigger::Static)
                    {
                        timeout.cancel(sched);
                        timeout.reset(sched);
                    }
                    directive
                }
            }

            Trigger::OrListTimeout { timeout, .. } => {
                let timeout_fired = fired.id() == timeout.id();
                if timeout_fired {
                    let directive = if status == Status::empty() {
                        Directive::RunAndRemove
                    } else if status.contains(Status::DISABLED) {
                        Directive::Remove
                    } else if status.contains(Status::SUSPENDED) {
                        self.or_status(Status::READY_TO_RUN);
                        Directive::Remove
                    } else {
                        Directive::Remove
                    };
                    self.timed_out.store(true, Ordering::Release);
                    if let Trigger::OrListTimeout { events, .. } =
                        std::mem::replace(&mut *trigger, Trigger::Static)
                    {
                        for event in &events {
                            event.remove_waiter(self);
                        }
                    }
                    directive
                } else {
                    let directive = if status == Status::empty() {
                        Directive::RunAndRemove
                    } else if status.contains(Status::DISABLED) {
                        return Directive::Rearm;
                    } else if status.contains(Status::SUSPENDED) {
                        self.or_status(Status::READY_TO_RUN);
                        Directive::Remove
                    } else {
                        Directive::Remove
                    };
                    if let Trigger::OrListTimeout { events, timeout } =
                        std::mem::replace(&mut *trigger, Trigger::Static)
                    {
                        timeout.cancel(sched);
                        timeout.reset(sched);
                        for event in &events {
                            if event.id() != fired.id() {
                                event.remove_waiter(self);
                            }
                        }
                    }
                    directive
                }
            }

            Trigger::AndListTimeout {
                timeout, pending, ..
            } => {
                let timeout_fired = fired.id() == timeout.id();
                if timeout_fired {
                    // Unlike the other timeout variants, a suspended flag
                    // still earns its wake grant here even when the process
                    // is also disabled.
                    let directive = if status == Status::empty() {
                        Directive::RunAndRemove
                    } else {
                        if status.contains(Status::SUSPENDED) {
                            self.or_status(Status::READY_TO_RUN);
                        }
                        Directive::Remove
                    };
                    self.timed_out.store(true, Ordering::Release);
                    if let Trigger::AndListTimeout { events, .. } =
                        std::mem::replace(&mut *trigger, Trigger::Static)
                    {
                        for event in &events {
                            event.remove_waiter(self);
                        }
                    }
                    directive
                } else {
                    if status.contains(Status::DISABLED) {
                        return Directive::Rearm;
                    }
                    *pending = pending.saturating_sub(1);
                    let complete = *pending == 0;
                    let directive = if status == Status::empty() {
                        if complete {
                            Directive::RunAndRemove
                        } else {
                            Directive::Remove
                        }
                    } else if status.contains(Status::SUSPENDED) {
                        if complete {
                            self.or_status(Status::READY_TO_RUN);
                        }
                        Directive::Remove
                    } else {
                        Directive::Remove
                    };
                    if complete {
                        if let Trigger::AndListTimeout { timeout, .. } =
                            std::mem::replace(&mut *trigger, Trigger::Static)
                        {
                            timeout.cancel(sched);
                            timeout.reset(sched);
                        }
                    }
                    directive
                }
            }
        }
    }

    /// Offer a static sensitivity firing to this process.
    ///
    /// Dynamic sensitivity overrides static: a process with an outstanding
    /// dynamic wait ignores its static list entirely.
    pub(crate) fn trigger_static(self: &Arc<Self>, sched: &Scheduler) {
        let status = self.status();
        if status.contains(Status::ZOMBIE)
            || status.contains(Status::DISABLED)
            || self.is_queued()
        {
            return;
        }
        if !matches!(*self.trigger.lock(), Trigger::Static) {
            return;
        }
        let cycles = self.wait_cycles.load(Ordering::Acquire);
        if cycles > 0 {
            self.wait_cycles.store(cycles - 1, Ordering::Release);
            return;
        }
        if status.contains(Status::SUSPENDED) {
            self.or_status(Status::READY_TO_RUN);
            return;
        }
        sched.enqueue(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::coroutine::{Activation, Step, WaitFor};
    use crate::kernel::process::Scope;
    use crate::kernel::scheduler::{Scheduler, SpawnOptions};

    /// Spawn a process whose first activation suspends on `wait` and whose
    /// second completes, then drive it to the suspension point.
    fn parked_on(sched: &Scheduler, name: &str, wait: WaitFor) -> Arc<Process> {
        let mut first = true;
        let process = sched
            .spawn(name, SpawnOptions::default(), move |_: &mut Activation<'_>| {
                if first {
                    first = false;
                    Step::Wait(wait.clone())
                } else {
                    Step::Done
                }
            })
            .expect("spawn failed");
        sched.initialize();
        sched.eval_pass();
        process
    }

    #[test]
    fn test_single_event_wakes_normal_waiter() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::Event(event.clone()));
        assert_eq!(event.waiter_count(), 1);

        event.notify(&sched);
        assert!(p.is_queued());
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn test_disabled_waiter_rearms_until_enabled() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::Event(event.clone()));

        p.disable(&sched, Scope::SelfOnly);
        event.notify(&sched);
        assert!(!p.is_queued());
        assert_eq!(event.waiter_count(), 1);

        p.enable(&sched, Scope::SelfOnly);
        assert!(!p.is_queued());

        event.notify(&sched);
        assert!(p.is_queued());
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn test_suspended_waiter_gets_wake_grant() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::Event(event.clone()));

        p.suspend(&sched, Scope::SelfOnly);
        event.notify(&sched);
        assert!(!p.is_queued());
        assert_eq!(event.waiter_count(), 0);
        assert_eq!(p.status(), Status::SUSPENDED | Status::READY_TO_RUN);

        // Resume re-queues exactly once.
        p.resume(&sched, Scope::SelfOnly);
        assert!(p.is_queued());
        assert_eq!(p.status(), Status::empty());
        sched.eval_pass();
        assert!(p.is_zombie());
    }

    #[test]
    fn test_resume_without_wake_grant_does_not_queue() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::Event(event.clone()));

        p.suspend(&sched, Scope::SelfOnly);
        p.resume(&sched, Scope::SelfOnly);
        assert!(!p.is_queued());
        assert_eq!(event.waiter_count(), 1);
    }

    #[test]
    fn test_and_list_requires_every_member() {
        let sched = Scheduler::new();
        let events: Vec<_> = (0..3).map(|i| Event::new(format!("e{i}"))).collect();
        let p = parked_on(&sched, "p", WaitFor::AllOf(events.clone()));

        events[0].notify(&sched);
        assert!(!p.is_queued());
        assert_eq!(events[0].waiter_count(), 0);

        events[1].notify(&sched);
        assert!(!p.is_queued());

        events[2].notify(&sched);
        assert!(p.is_queued());
        assert!(events.iter().all(|e| e.waiter_count() == 0));
    }

    #[test]
    fn test_or_list_clears_sibling_registrations() {
        let sched = Scheduler::new();
        let e1 = Event::new("e1");
        let e2 = Event::new("e2");
        let p = parked_on(&sched, "p", WaitFor::AnyOf(vec![e1.clone(), e2.clone()]));

        e1.notify(&sched);
        assert!(p.is_queued());
        assert_eq!(e1.waiter_count(), 0);
        assert_eq!(e2.waiter_count(), 0);
    }

    #[test]
    fn test_queued_process_cannot_be_retriggered() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::Event(event.clone()));

        sched.enqueue(&p);
        event.notify(&sched);
        assert_eq!(event.waiter_count(), 0);
        assert!(p.is_queued());
    }

    #[test]
    fn test_data_event_cancels_timeout_companion() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::EventTimeout(event.clone(), 3));
        let timeout = p.timeout_event();
        assert_eq!(timeout.waiter_count(), 1);

        event.notify(&sched);
        assert!(p.is_queued());
        assert!(!p.timed_out());
        assert_eq!(timeout.waiter_count(), 0);

        // The cancelled timeout never fires a late second wake.
        sched.eval_pass();
        let mut boundaries = 0;
        while sched.advance_delta() {
            boundaries += 1;
            assert!(boundaries < 10, "cancelled timeout kept the delta loop alive");
        }
        assert!(p.is_zombie());
    }

    #[test]
    fn test_timeout_wins_race_and_drops_data_registration() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = parked_on(&sched, "p", WaitFor::EventTimeout(event.clone(), 1));

        assert!(sched.advance_delta());
        assert!(p.is_queued());
        assert!(p.timed_out());
        assert_eq!(event.waiter_count(), 0);

        // A late data event is not a second wake.
        event.notify(&sched);
        assert!(p.is_queued());
        sched.eval_pass();
        assert!(p.is_zombie());
    }

    #[test]
    fn test_timeout_cancels_wait_even_while_disabled() {
        let sched = Scheduler::new();
        let p = parked_on(&sched, "p", WaitFor::Timeout(1));

        p.disable(&sched, Scope::SelfOnly);
        assert!(sched.advance_delta());
        assert!(!p.is_queued());
        assert_eq!(p.status(), Status::DISABLED);

        // Nothing is left to deliver once the disable lifts.
        p.enable(&sched, Scope::SelfOnly);
        assert!(!p.is_queued());
        assert_eq!(p.status(), Status::empty());
    }

    #[test]
    fn test_timeout_only_marks_suspended_waiter_ready() {
        let sched = Scheduler::new();
        let p = parked_on(&sched, "p", WaitFor::Timeout(1));

        p.suspend(&sched, Scope::SelfOnly);
        assert!(sched.advance_delta());
        assert_eq!(p.status(), Status::SUSPENDED | Status::READY_TO_RUN);

        p.resume(&sched, Scope::SelfOnly);
        assert!(p.is_queued());
    }

    #[test]
    fn test_and_list_timeout_disabled_keeps_suspended_grant() {
        let sched = Scheduler::new();
        let gate = Event::new("gate");
        let p = parked_on(
            &sched,
            "p",
            WaitFor::AllOfTimeout(vec![gate.clone()], 1),
        );

        p.suspend(&sched, Scope::SelfOnly);
        p.disable(&sched, Scope::SelfOnly);
        assert!(sched.advance_delta());
        assert!(p.timed_out());
        assert_eq!(
            p.status(),
            Status::DISABLED | Status::SUSPENDED | Status::READY_TO_RUN
        );
        assert_eq!(gate.waiter_count(), 0);
    }

    #[test]
    fn test_event_timeout_disabled_drops_suspended_grant() {
        let sched = Scheduler::new();
        let gate = Event::new("gate");
        let p = parked_on(&sched, "p", WaitFor::EventTimeout(gate.clone(), 1));

        p.suspend(&sched, Scope::SelfOnly);
        p.disable(&sched, Scope::SelfOnly);
        assert!(sched.advance_delta());
        assert!(p.timed_out());
        assert_eq!(p.status(), Status::DISABLED | Status::SUSPENDED);
        assert_eq!(gate.waiter_count(), 0);
    }

    #[test]
    fn test_and_list_rearms_before_decrementing_while_disabled() {
        let sched = Scheduler::new();
        let e1 = Event::new("e1");
        let e2 = Event::new("e2");
        let p = parked_on(&sched, "p", WaitFor::AllOf(vec![e1.clone(), e2.clone()]));

        p.disable(&sched, Scope::SelfOnly);
        e1.notify(&sched);
        assert_eq!(e1.waiter_count(), 1);

        // The deferred firing still counts after the disable lifts.
        p.enable(&sched, Scope::SelfOnly);
        e1.notify(&sched);
        assert!(!p.is_queued());
        e2.notify(&sched);
        assert!(p.is_queued());
    }

    #[test]
    #[should_panic(expected = "no outstanding dynamic wait")]
    fn test_trigger_without_wait_is_a_consistency_failure() {
        let sched = Scheduler::new();
        let event = Event::new("e");
        let p = sched
            .spawn("p", SpawnOptions::default(), |_: &mut Activation<'_>| {
                Step::Done
            })
            .expect("spawn failed");

        event.add_waiter(&p);
        event.notify(&sched);
    }

    #[test]
    fn test_dynamic_wait_overrides_static_sensitivity() {
        let sched = Scheduler::new();
        let stat = Event::new("stat");
        let dynamic = Event::new("dyn");
        let dynamic_in = dynamic.clone();
        let mut first = true;
        let p = sched
            .spawn(
                "p",
                SpawnOptions {
                    sensitive_to: vec![stat.clone()],
                    ..SpawnOptions::default()
                },
                move |_: &mut Activation<'_>| {
                    if first {
                        first = false;
                        Step::Wait(WaitFor::Event(dynamic_in.clone()))
                    } else {
                        Step::Done
                    }
                },
            )
            .expect("spawn failed");

        sched.initialize();
        sched.eval_pass();

        stat.notify(&sched);
        assert!(!p.is_queued());

        dynamic.notify(&sched);
        assert!(p.is_queued());
    }
}
