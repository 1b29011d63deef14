//! Simulated cooperative processes and their lifecycle state machine
//!
//! A [`Process`] is a resumable unit of execution owned by the scheduler. Its
//! scheduling condition is an orthogonal flag set ([`Status`]) with `Normal`
//! as the all-clear baseline and `ZOMBIE` as the dominant, absorbing state.
//! The control operations here (disable, enable, suspend, resume, kill,
//! reset, exception injection) each take a [`Scope`] selecting whether the
//! operation also walks the process's descendants.

use crate::kernel::coroutine::{Coroutine, ExceptionPayload, ProcessBody};
use crate::kernel::event::Event;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::trigger::Trigger;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a Process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

impl ProcessId {
    /// Generate a new unique ProcessId.
    pub fn new() -> Self {
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Scheduling condition of a process.
    ///
    /// `Status::empty()` is the normal, unblocked state. `ZOMBIE` dominates:
    /// once set it is never cleared and every other flag is ignored for
    /// scheduling. `READY_TO_RUN` is transient bookkeeping meaning a wake
    /// condition fired while the process was blocked; the grant is consumed
    /// when the block lifts and the process is dispatched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Administratively disabled.
        const DISABLED = 0b0001;
        /// A wake fired while blocked; dispatch once the block lifts.
        const READY_TO_RUN = 0b0010;
        /// Suspended by an explicit suspend request.
        const SUSPENDED = 0b0100;
        /// Terminal. Inert to all further scheduling.
        const ZOMBIE = 0b1000;
    }
}

/// Whether a control operation also applies to the process's descendants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Apply to the addressed process only.
    SelfOnly,
    /// Recursively apply to every descendant as well.
    WithDescendants,
}

/// Flavor of a reset request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetKind {
    /// Observed the next time the process would naturally run.
    Sync,
    /// Forces an immediate preemptive dispatch.
    Async,
}

/// Out-of-band intervention waiting to be consumed at the next dispatch.
pub(crate) enum ControlSignal {
    Kill,
    SyncReset,
    AsyncReset,
    UserException(ExceptionPayload),
}

/// Significant transitions reported to status monitors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A resume request was delivered, even if the process stays blocked.
    Resumed,
    /// The process reached its terminal state.
    Terminated,
}

/// Observer notified on significant process state transitions.
///
/// Monitors are held weakly; a dropped monitor is pruned on the next signal.
pub trait StatusMonitor: Send + Sync {
    /// React to a state transition of `process`.
    fn signal(&self, sched: &Scheduler, process: &Process, event: MonitorEvent);
}

/// A simulated cooperative task.
pub struct Process {
    /// Unique identifier
    id: ProcessId,

    /// Diagnostic name
    name: String,

    /// Scheduling condition flags
    status: Mutex<Status>,

    /// Outstanding dynamic wait, if any
    pub(crate) trigger: Mutex<Trigger>,

    /// Latched when a timed wait resolved by timing out
    pub(crate) timed_out: AtomicBool,

    /// Countdown of static firings still to ignore (`wait n cycles`)
    pub(crate) wait_cycles: AtomicU32,

    /// Pending out-of-band signal, consumed by the next dispatch
    signal: Mutex<Option<ControlSignal>>,

    /// Body waiting for lazy coroutine construction
    entry: Mutex<Option<Box<dyn ProcessBody>>>,

    /// Execution context, created on first dispatch
    coroutine: Mutex<Option<Coroutine>>,

    /// Stack reservation forwarded to the coroutine
    stack_size: usize,

    /// Skip the initial seeding into the first evaluation pass
    dont_initialize: bool,

    /// Membership in the scheduler's runnable queue
    queued: AtomicBool,

    /// Set while a dispatch of this process is anywhere on the call stack
    on_stack: AtomicBool,

    /// Structural parent, if any
    parent: Option<Weak<Process>>,

    /// Structural children, owned by the scheduler's registry
    children: Mutex<Vec<Weak<Process>>>,

    /// Observers of significant state transitions
    monitors: Mutex<Vec<Weak<dyn StatusMonitor>>>,

    /// Static sensitivity fixed at spawn
    static_events: Mutex<Vec<Arc<Event>>>,

    /// Reusable companion event for timed waits, created lazily
    timeout_event: Mutex<Option<Arc<Event>>>,
}

impl Process {
    pub(crate) fn new(
        name: String,
        stack_size: usize,
        dont_initialize: bool,
        parent: Option<Weak<Process>>,
        body: Box<dyn ProcessBody>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ProcessId::new(),
            name,
            status: Mutex::new(Status::empty()),
            trigger: Mutex::new(Trigger::Static),
            timed_out: AtomicBool::new(false),
            wait_cycles: AtomicU32::new(0),
            signal: Mutex::new(None),
            entry: Mutex::new(Some(body)),
            coroutine: Mutex::new(None),
            stack_size,
            dont_initialize,
            queued: AtomicBool::new(false),
            on_stack: AtomicBool::new(false),
            parent,
            children: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            static_events: Mutex::new(Vec::new()),
            timeout_event: Mutex::new(None),
        })
    }

    /// Get the process's unique ID.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Get the process's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current scheduling condition.
    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    /// Whether the process reached its terminal state.
    pub fn is_zombie(&self) -> bool {
        self.status().contains(Status::ZOMBIE)
    }

    /// Whether the process currently sits in the runnable queue.
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the last timed wait resolved by timing out.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Structural parent, if still alive.
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Ordered snapshot of the live structural children.
    pub fn children(&self) -> Vec<Arc<Process>> {
        let mut children = self.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    }

    /// Register an observer for significant state transitions.
    pub fn add_monitor(&self, monitor: Weak<dyn StatusMonitor>) {
        self.monitors.lock().push(monitor);
    }

    // =========================================================================
    // State machine operations
    // =========================================================================

    /// Disable the process.
    ///
    /// A normal process that is already queued keeps its current pass and
    /// parks afterwards; one that is not queued parks immediately. On any
    /// other status the flag is just OR'd in. No-op on a zombie.
    pub fn disable(self: &Arc<Self>, sched: &Scheduler, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.disable(sched, scope);
            }
        }
        let mut status = self.status.lock();
        if status.contains(Status::ZOMBIE) {
            return;
        }
        if *status == Status::empty() {
            *status = if self.is_queued() {
                Status::DISABLED | Status::READY_TO_RUN
            } else {
                Status::DISABLED
            };
        } else {
            status.insert(Status::DISABLED);
        }
    }

    /// Clear a disable.
    ///
    /// A wake that was granted while the process sat disabled fires now: the
    /// process becomes normal and is re-queued. Otherwise only the flag is
    /// cleared.
    pub fn enable(self: &Arc<Self>, sched: &Scheduler, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.enable(sched, scope);
            }
        }
        let requeue = {
            let mut status = self.status.lock();
            if status.contains(Status::ZOMBIE) {
                return;
            }
            if *status == Status::DISABLED | Status::READY_TO_RUN {
                *status = Status::empty();
                true
            } else {
                status.remove(Status::DISABLED);
                false
            }
        };
        if requeue && !self.is_queued() {
            sched.enqueue(self);
        }
    }

    /// Suspend the process.
    ///
    /// A normal process that is queued, or that suspends itself, keeps its
    /// right to continue (`READY_TO_RUN`); a self-suspension must yield
    /// through [`crate::kernel::Activation::suspend_self`] so no further
    /// statements run in the current activation. On any other status the
    /// flag is just OR'd in. No-op on a zombie.
    pub fn suspend(self: &Arc<Self>, sched: &Scheduler, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.suspend(sched, scope);
            }
        }
        let mut status = self.status.lock();
        if status.contains(Status::ZOMBIE) {
            return;
        }
        if *status == Status::empty() {
            *status = if self.is_queued() || sched.is_current(self) {
                Status::SUSPENDED | Status::READY_TO_RUN
            } else {
                Status::SUSPENDED
            };
        } else {
            status.insert(Status::SUSPENDED);
        }
    }

    /// Clear a suspension.
    ///
    /// Monitors always see the resume request, even when the process stays
    /// blocked by a disable. A suspension with a granted wake re-queues the
    /// process and only then drops the outstanding dynamic wait; the queue
    /// insertion must happen first because dropping the wait mutates waiter
    /// lists shared with other processes.
    pub fn resume(self: &Arc<Self>, sched: &Scheduler, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.resume(sched, scope);
            }
        }
        self.signal_monitors(sched, MonitorEvent::Resumed);
        let granted = {
            let mut status = self.status.lock();
            if status.contains(Status::ZOMBIE) {
                return;
            }
            if *status == Status::SUSPENDED {
                *status = Status::empty();
                false
            } else if *status == Status::SUSPENDED | Status::READY_TO_RUN {
                *status = Status::empty();
                true
            } else {
                status.remove(Status::SUSPENDED);
                false
            }
        };
        if granted {
            if !self.is_queued() {
                sched.enqueue(self);
            }
            self.clear_dynamic_wait(sched);
        }
    }

    /// Kill the process, descendants first.
    ///
    /// While the simulation runs this preempts the process so termination is
    /// synchronous with respect to the caller. Before the simulation starts
    /// there is no coroutine to preempt and the process is unlinked
    /// directly. Killing a zombie is a no-op.
    pub fn kill(self: &Arc<Self>, sched: &Scheduler, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.kill(sched, scope);
            }
        }
        if self.is_zombie() {
            return;
        }
        if sched.is_running() {
            self.wait_cycles.store(0, Ordering::Release);
            self.zero_pending_count();
            self.set_signal(ControlSignal::Kill);
            sched.preempt_with(self);
        } else {
            self.disconnect(sched);
        }
    }

    /// Send a reset to the process.
    ///
    /// Both flavors clear the outstanding wait counters; only [`ResetKind::Async`]
    /// forces an immediate preemptive dispatch. A reset aimed at a zombie is
    /// silently discarded.
    pub fn reset(self: &Arc<Self>, sched: &Scheduler, kind: ResetKind, scope: Scope) {
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.reset(sched, kind, scope);
            }
        }
        if self.is_zombie() {
            return;
        }
        self.wait_cycles.store(0, Ordering::Release);
        self.zero_pending_count();
        self.set_signal(match kind {
            ResetKind::Sync => ControlSignal::SyncReset,
            ResetKind::Async => ControlSignal::AsyncReset,
        });
        if kind == ResetKind::Async {
            sched.preempt_with(self);
        }
    }

    /// Inject a user exception into the process.
    ///
    /// The payload replaces any previously stored one. The addressed process
    /// is preempted first; with [`Scope::WithDescendants`] each child is then
    /// signalled recursively after its parent has been dispatched. An
    /// exception aimed at a zombie is silently discarded.
    pub fn throw_user(self: &Arc<Self>, sched: &Scheduler, payload: ExceptionPayload, scope: Scope) {
        if self.is_zombie() {
            return;
        }
        self.set_signal(ControlSignal::UserException(payload.clone()));
        sched.preempt_with(self);
        if scope == Scope::WithDescendants {
            for child in self.children() {
                child.throw_user(sched, payload.clone(), scope);
            }
        }
    }

    // =========================================================================
    // Kernel internals
    // =========================================================================

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    pub(crate) fn or_status(&self, flags: Status) {
        self.status.lock().insert(flags);
    }

    pub(crate) fn consume_run_grant(&self) {
        self.status.lock().remove(Status::READY_TO_RUN);
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::Release);
    }

    pub(crate) fn mark_on_stack(&self, on: bool) {
        self.on_stack.store(on, Ordering::Release);
    }

    pub(crate) fn is_on_stack(&self) -> bool {
        self.on_stack.load(Ordering::Acquire)
    }

    pub(crate) fn dont_initialize(&self) -> bool {
        self.dont_initialize
    }

    pub(crate) fn adopt(self: &Arc<Self>, child: &Arc<Process>) {
        self.children.lock().push(Arc::downgrade(child));
    }

    pub(crate) fn set_signal(&self, signal: ControlSignal) {
        *self.signal.lock() = Some(signal);
    }

    pub(crate) fn take_signal(&self) -> Option<ControlSignal> {
        self.signal.lock().take()
    }

    /// Whether a pending signal must be consumed before normal progress.
    ///
    /// Sync resets are deliberately excluded; they wait for the next natural
    /// dispatch.
    pub(crate) fn has_preempting_signal(&self) -> bool {
        matches!(
            self.signal.lock().as_ref(),
            Some(
                ControlSignal::Kill
                    | ControlSignal::AsyncReset
                    | ControlSignal::UserException(_)
            )
        )
    }

    /// Lazily build the coroutine and run `f` against it.
    ///
    /// Returns `None` when the process was already torn down.
    pub(crate) fn with_coroutine<R>(&self, f: impl FnOnce(&mut Coroutine) -> R) -> Option<R> {
        let mut coroutine = self.coroutine.lock();
        if coroutine.is_none() {
            let body = self.entry.lock().take()?;
            *coroutine = Some(Coroutine::new(self.stack_size, body));
        }
        coroutine.as_mut().map(f)
    }

    /// Abort and destroy the coroutine context, if one was ever created.
    pub(crate) fn destroy_coroutine(&self) {
        if let Some(mut coroutine) = self.coroutine.lock().take() {
            coroutine.abort();
        }
    }

    /// The reusable companion event for timed waits.
    pub(crate) fn timeout_event(self: &Arc<Self>) -> Arc<Event> {
        let mut slot = self.timeout_event.lock();
        match &*slot {
            Some(event) => event.clone(),
            None => {
                let event = Event::new(format!("{}_timeout", self.name));
                *slot = Some(event.clone());
                event
            }
        }
    }

    /// Register a static sensitivity fixed at spawn time.
    pub(crate) fn bind_static(self: &Arc<Self>, event: &Arc<Event>) {
        event.add_static_waiter(self);
        self.static_events.lock().push(event.clone());
    }

    /// Zero the pending counter of an outstanding all-of wait.
    pub(crate) fn zero_pending_count(&self) {
        match &mut *self.trigger.lock() {
            Trigger::AndList { pending, .. } | Trigger::AndListTimeout { pending, .. } => {
                *pending = 0;
            }
            _ => {}
        }
    }

    /// Drop the outstanding dynamic wait, releasing list and timeout
    /// ownership exactly once.
    pub(crate) fn clear_dynamic_wait(&self, sched: &Scheduler) {
        let old = std::mem::replace(&mut *self.trigger.lock(), Trigger::Static);
        match old {
            Trigger::Static => {}
            Trigger::Event(event) => event.remove_waiter(self),
            Trigger::OrList(events) | Trigger::AndList { events, .. } => {
                for event in &events {
                    event.remove_waiter(self);
                }
            }
            Trigger::Timeout(timeout) => {
                timeout.cancel(sched);
                timeout.reset(sched);
            }
            Trigger::EventTimeout { event, timeout } => {
                event.remove_waiter(self);
                timeout.cancel(sched);
                timeout.reset(sched);
            }
            Trigger::OrListTimeout { events, timeout }
            | Trigger::AndListTimeout {
                events, timeout, ..
            } => {
                for event in &events {
                    event.remove_waiter(self);
                }
                timeout.cancel(sched);
                timeout.reset(sched);
            }
        }
    }

    /// Remove every trace of the process from the kernel's data structures.
    ///
    /// Sets the terminal status, drops wait registrations and static
    /// sensitivities, clears the pending signal, and notifies monitors.
    pub(crate) fn disconnect(&self, sched: &Scheduler) {
        self.set_status(Status::ZOMBIE);
        self.wait_cycles.store(0, Ordering::Release);
        self.clear_dynamic_wait(sched);
        for event in self.static_events.lock().drain(..) {
            event.remove_static_waiter(self);
        }
        *self.signal.lock() = None;
        *self.entry.lock() = None;
        self.signal_monitors(sched, MonitorEvent::Terminated);
    }

    pub(crate) fn signal_monitors(&self, sched: &Scheduler, event: MonitorEvent) {
        let live: Vec<Arc<dyn StatusMonitor>> = {
            let mut monitors = self.monitors.lock();
            monitors.retain(|w| w.strong_count() > 0);
            monitors.iter().filter_map(Weak::upgrade).collect()
        };
        for monitor in live {
            monitor.signal(sched, self, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::coroutine::{Activation, Step};
    use crate::kernel::scheduler::{Scheduler, SpawnOptions};

    fn idle_process(sched: &Scheduler, name: &str) -> Arc<Process> {
        sched
            .spawn(name, SpawnOptions::default(), |_: &mut Activation<'_>| {
                Step::Done
            })
            .expect("spawn failed")
    }

    #[test]
    fn test_process_id_uniqueness() {
        let id1 = ProcessId::new();
        let id2 = ProcessId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_new_process_is_normal() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");
        assert_eq!(p.status(), Status::empty());
        assert!(!p.is_zombie());
        assert!(!p.is_queued());
    }

    #[test]
    fn test_disable_enable_restores_status() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");

        p.disable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::DISABLED);

        p.enable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::empty());

        // Pairing holds on a combined status as well.
        p.suspend(&sched, Scope::SelfOnly);
        let before = p.status();
        p.disable(&sched, Scope::SelfOnly);
        p.enable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), before);
    }

    #[test]
    fn test_suspend_resume_bit_algebra() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");

        p.suspend(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::SUSPENDED);

        p.disable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::SUSPENDED | Status::DISABLED);

        // Resume on a combined status only clears the suspended bit.
        p.resume(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::DISABLED);

        p.enable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::empty());
    }

    #[test]
    fn test_disable_while_queued_keeps_current_pass() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");
        sched.enqueue(&p);

        p.disable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::DISABLED | Status::READY_TO_RUN);
        assert!(p.is_queued());
    }

    #[test]
    fn test_enable_requeues_granted_wake() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");

        p.disable(&sched, Scope::SelfOnly);
        p.or_status(Status::READY_TO_RUN);

        p.enable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::empty());
        assert!(p.is_queued());
    }

    #[test]
    fn test_kill_before_start_unlinks() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");

        p.kill(&sched, Scope::SelfOnly);
        assert!(p.is_zombie());

        // Idempotent on a zombie.
        p.kill(&sched, Scope::SelfOnly);
        assert!(p.is_zombie());
    }

    #[test]
    fn test_zombie_ignores_state_operations() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");
        p.kill(&sched, Scope::SelfOnly);

        p.disable(&sched, Scope::SelfOnly);
        p.suspend(&sched, Scope::SelfOnly);
        p.resume(&sched, Scope::SelfOnly);
        p.enable(&sched, Scope::SelfOnly);
        assert_eq!(p.status(), Status::ZOMBIE);
    }

    #[test]
    fn test_hierarchy_operations_recurse() {
        let sched = Scheduler::new();
        let parent = idle_process(&sched, "parent");
        let child = idle_process(&sched, "child");
        parent.adopt(&child);

        parent.disable(&sched, Scope::WithDescendants);
        assert_eq!(parent.status(), Status::DISABLED);
        assert_eq!(child.status(), Status::DISABLED);

        parent.enable(&sched, Scope::SelfOnly);
        assert_eq!(parent.status(), Status::empty());
        assert_eq!(child.status(), Status::DISABLED);

        parent.enable(&sched, Scope::WithDescendants);
        assert_eq!(child.status(), Status::empty());
    }

    #[test]
    fn test_children_prunes_dropped_processes() {
        let sched = Scheduler::new();
        let parent = idle_process(&sched, "parent");
        let child = Process::new(
            "orphan".into(),
            crate::kernel::coroutine::DEFAULT_STACK_SIZE,
            false,
            None,
            Box::new(|_: &mut Activation<'_>| Step::Done),
        );
        parent.adopt(&child);
        assert_eq!(parent.children().len(), 1);

        drop(child);
        assert!(parent.children().is_empty());
    }

    #[test]
    fn test_timeout_event_is_reused() {
        let sched = Scheduler::new();
        let p = idle_process(&sched, "p");
        let t1 = p.timeout_event();
        let t2 = p.timeout_event();
        assert_eq!(t1.id(), t2.id());
    }
}
