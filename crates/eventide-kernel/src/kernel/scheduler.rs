//! Cooperative scheduler and delta-cycle driver
//!
//! Exactly one process body executes at any instant. The scheduler owns the
//! FIFO runnable queue, drives evaluation passes and delta boundaries, and
//! hosts the dispatch loop that consumes out-of-band control signals. A
//! preempted process (kill, async reset, injected exception) runs
//! immediately and synchronously, ahead of everything still queued.

use crate::error::KernelError;
use crate::kernel::coroutine::{Activation, ExceptionPayload, ProcessBody, Step, WaitFor};
use crate::kernel::event::{Event, EventId};
use crate::kernel::process::{ControlSignal, Process, ProcessId, Status};
use crate::kernel::trigger::Trigger;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options applied when spawning a process.
pub struct SpawnOptions {
    /// Stack reservation forwarded to the coroutine context.
    pub stack_size: usize,

    /// Do not seed the process into the first evaluation pass; it waits for
    /// its static sensitivity instead.
    pub dont_initialize: bool,

    /// Static sensitivity list, fixed for the process's lifetime.
    pub sensitive_to: Vec<Arc<Event>>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            stack_size: crate::kernel::coroutine::DEFAULT_STACK_SIZE,
            dont_initialize: false,
            sensitive_to: Vec::new(),
        }
    }
}

/// How one full activation of a process ended.
enum Exit {
    /// The process suspended; it lives on.
    Suspended,
    /// The body requested termination.
    Halted,
    /// The body ran to completion.
    Finished,
    /// A kill signal was consumed.
    Killed,
    /// The body failed or an injected exception went unobserved.
    Errored(KernelError),
}

/// A delta notification still counting down to its firing.
struct DeltaEntry {
    event: Arc<Event>,
    countdown: u64,
}

/// The cooperative scheduler.
///
/// Ordering guarantees: processes made runnable within one pass execute in
/// FIFO push order; preempted processes run immediately, bypassing the
/// queue, synchronous with the injecting call.
pub struct Scheduler {
    /// Processes eligible to run in the current evaluation pass
    runnable: Mutex<VecDeque<Arc<Process>>>,

    /// Innermost process currently being dispatched
    current: Mutex<Option<Arc<Process>>>,

    /// Ownership root for every spawned process
    processes: RwLock<FxHashMap<ProcessId, Arc<Process>>>,

    /// Processes spawned before the simulation started
    pending_init: Mutex<Vec<Arc<Process>>>,

    /// Delta notifications counting down
    delta: Mutex<Vec<DeltaEntry>>,

    /// Whether the simulation has started
    running: AtomicBool,

    /// First per-process failure recorded during the run
    error: Mutex<Option<String>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            runnable: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            processes: RwLock::new(FxHashMap::default()),
            pending_init: Mutex::new(Vec::new()),
            delta: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    // =========================================================================
    // Spawning and lifecycle
    // =========================================================================

    /// Spawn a new process.
    ///
    /// Before the simulation starts the process is parked until
    /// [`initialize`](Self::initialize) seeds the first pass. After start,
    /// spawning is only legal from inside a running process, which becomes
    /// the structural parent of the new process.
    pub fn spawn(
        &self,
        name: impl Into<String>,
        options: SpawnOptions,
        body: impl ProcessBody + 'static,
    ) -> Result<Arc<Process>, KernelError> {
        let parent = self.current();
        if self.is_running() && parent.is_none() {
            log::error!("rejected top-level spawn after simulation start");
            return Err(KernelError::SpawnAfterStart);
        }
        let process = Process::new(
            name.into(),
            options.stack_size,
            options.dont_initialize,
            parent.as_ref().map(Arc::downgrade),
            Box::new(body),
        );
        for event in &options.sensitive_to {
            process.bind_static(event);
        }
        if let Some(parent) = &parent {
            parent.adopt(&process);
        }
        self.processes.write().insert(process.id(), process.clone());
        if self.is_running() {
            if !process.dont_initialize() {
                self.enqueue(&process);
            }
        } else {
            self.pending_init.lock().push(process.clone());
        }
        log::debug!("spawned process {}", process.name());
        Ok(process)
    }

    /// Mark the simulation as started and seed the first evaluation pass.
    pub fn initialize(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        for process in self.pending_init.lock().drain(..) {
            if !process.dont_initialize() && !process.is_zombie() {
                self.enqueue(&process);
            }
        }
    }

    /// Run until no pass, delta notification, or countdown can make
    /// progress. Returns the number of delta boundaries crossed.
    pub fn run(&self) -> u64 {
        self.initialize();
        let mut deltas = 0;
        loop {
            self.eval_pass();
            if !self.advance_delta() {
                break;
            }
            deltas += 1;
        }
        deltas
    }

    /// Drain the runnable queue, dispatching in FIFO order.
    ///
    /// Processes made runnable while the pass runs join the same pass.
    pub fn eval_pass(&self) {
        while let Some(process) = self.pop_runnable() {
            self.dispatch(&process);
        }
    }

    /// Cross one delta boundary, firing due notifications.
    ///
    /// Returns false once the simulation is quiescent.
    pub fn advance_delta(&self) -> bool {
        let due: Vec<DeltaEntry> = {
            let mut delta = self.delta.lock();
            for entry in delta.iter_mut() {
                entry.countdown -= 1;
            }
            let (due, keep): (Vec<_>, Vec<_>) =
                delta.drain(..).partition(|entry| entry.countdown == 0);
            *delta = keep;
            due
        };
        for entry in &due {
            entry.event.notify(self);
        }
        !due.is_empty() || !self.runnable.lock().is_empty() || !self.delta.lock().is_empty()
    }

    /// Whether the simulation has started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The innermost process currently being dispatched.
    pub fn current(&self) -> Option<Arc<Process>> {
        self.current.lock().clone()
    }

    pub(crate) fn is_current(&self, process: &Process) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|p| p.id() == process.id())
    }

    /// Look up a process by ID.
    pub fn process(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&id).cloned()
    }

    /// Number of spawned processes, zombies included.
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// First per-process failure recorded during the run, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn set_error(&self, message: String) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(message);
        }
    }

    // =========================================================================
    // Runnable queue
    // =========================================================================

    /// Append a process to the runnable queue.
    ///
    /// Zombies and already-queued processes are ignored, so a wake can never
    /// double-schedule.
    pub fn enqueue(&self, process: &Arc<Process>) {
        if process.is_zombie() || process.is_queued() {
            return;
        }
        process.set_queued(true);
        self.runnable.lock().push_back(process.clone());
    }

    /// Remove a process from the runnable queue, if present.
    pub fn dequeue(&self, process: &Arc<Process>) {
        self.runnable.lock().retain(|p| p.id() != process.id());
        process.set_queued(false);
    }

    fn pop_runnable(&self) -> Option<Arc<Process>> {
        let process = self.runnable.lock().pop_front();
        if let Some(process) = &process {
            process.set_queued(false);
        }
        process
    }

    // =========================================================================
    // Delta notifications
    // =========================================================================

    /// Schedule `event` to fire after `after` delta boundaries (at least
    /// one). A later request for the same event replaces the earlier one.
    pub(crate) fn schedule_delta(&self, event: Arc<Event>, after: u64) {
        let mut delta = self.delta.lock();
        delta.retain(|entry| entry.event.id() != event.id());
        delta.push(DeltaEntry {
            event,
            countdown: after.max(1),
        });
    }

    pub(crate) fn cancel_delta(&self, id: EventId) {
        self.delta.lock().retain(|entry| entry.event.id() != id);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run the process's coroutine out of turn, ahead of the queue.
    ///
    /// Synchronous: the caller resumes only after the target suspends or
    /// dies. A preemption aimed at a process that is already somewhere on
    /// the dispatch stack returns immediately; the pending signal is
    /// consumed at that body's next checkpoint. Before the simulation starts
    /// there is nothing to run and the signal stays pending.
    pub fn preempt_with(&self, process: &Arc<Process>) {
        if !self.is_running() || process.is_on_stack() {
            return;
        }
        self.dequeue(process);
        self.dispatch(process);
    }

    /// Drive one activation of a process and react to its outcome.
    pub(crate) fn dispatch(&self, process: &Arc<Process>) {
        if process.is_zombie() {
            return;
        }
        log::trace!("dispatching process {}", process.name());
        process.consume_run_grant();
        process.mark_on_stack(true);
        let prev = self.current.lock().replace(process.clone());

        let exit = self.run_activation(process);
        match exit {
            Exit::Suspended => {}
            Exit::Halted => {
                log::info!("terminating process {}", process.name());
                self.finalize(process);
            }
            Exit::Finished | Exit::Killed => self.finalize(process),
            Exit::Errored(error) => {
                log::error!("process {} failed: {}", process.name(), error);
                self.set_error(format!("process {}: {}", process.name(), error));
                self.finalize(process);
            }
        }

        *self.current.lock() = prev;
        process.mark_on_stack(false);
    }

    /// The coroutine entry loop.
    ///
    /// Pending signals are consumed at two checkpoints: before the body runs
    /// and immediately after a step during which the body signalled itself.
    /// A reset rewinds the body and continues in the same activation.
    fn run_activation(&self, process: &Arc<Process>) -> Exit {
        let mut thrown: Option<ExceptionPayload> = None;
        loop {
            match process.take_signal() {
                Some(ControlSignal::Kill) => return Exit::Killed,
                Some(ControlSignal::SyncReset) | Some(ControlSignal::AsyncReset) => {
                    process.clear_dynamic_wait(self);
                    if process.with_coroutine(|coro| coro.rewind()).is_none() {
                        return Exit::Finished;
                    }
                }
                Some(ControlSignal::UserException(payload)) => {
                    process.clear_dynamic_wait(self);
                    thrown = Some(payload);
                }
                None => {}
            }

            let step = {
                let mut act = Activation {
                    sched: self,
                    process,
                    thrown: thrown.take(),
                };
                let step = process.with_coroutine(|coro| coro.resume(&mut act));
                thrown = act.thrown;
                match step {
                    Some(step) => step,
                    None => return Exit::Finished,
                }
            };

            // A kill, async reset, or exception the body aimed at itself
            // takes effect before its requested step does.
            if process.has_preempting_signal() {
                continue;
            }
            if thrown.is_some() {
                return Exit::Errored(KernelError::UncaughtException);
            }

            return match step {
                Step::Wait(wait) => match self.register_wait(process, wait) {
                    Ok(()) => Exit::Suspended,
                    Err(error) => Exit::Errored(error),
                },
                Step::Yield => {
                    let status = process.status();
                    if status == Status::empty() {
                        self.enqueue(process);
                    } else {
                        // Keep the right to continue for when the block lifts.
                        process.or_status(Status::READY_TO_RUN);
                    }
                    Exit::Suspended
                }
                Step::Halt => Exit::Halted,
                Step::Done => Exit::Finished,
                Step::Fault(error) => Exit::Errored(error),
            };
        }
    }

    /// Install the dynamic wait a body suspended on.
    fn register_wait(&self, process: &Arc<Process>, wait: WaitFor) -> Result<(), KernelError> {
        process.timed_out.store(false, Ordering::Release);
        let trigger = match wait {
            WaitFor::Static => Trigger::Static,
            WaitFor::StaticCycles(n) => {
                process.wait_cycles.store(n.saturating_sub(1), Ordering::Release);
                Trigger::Static
            }
            WaitFor::Event(event) => {
                event.add_waiter(process);
                Trigger::Event(event)
            }
            WaitFor::AnyOf(events) => {
                if events.is_empty() {
                    return Err(KernelError::EmptyEventList);
                }
                for event in &events {
                    event.add_waiter(process);
                }
                Trigger::OrList(events)
            }
            WaitFor::AllOf(events) => {
                if events.is_empty() {
                    return Err(KernelError::EmptyEventList);
                }
                for event in &events {
                    event.add_waiter(process);
                }
                Trigger::AndList {
                    pending: events.len(),
                    events,
                }
            }
            WaitFor::Timeout(after) => {
                let timeout = process.timeout_event();
                self.schedule_delta(timeout.clone(), after);
                timeout.add_waiter(process);
                Trigger::Timeout(timeout)
            }
            WaitFor::EventTimeout(event, after) => {
                let timeout = process.timeout_event();
                self.schedule_delta(timeout.clone(), after);
                timeout.add_waiter(process);
                event.add_waiter(process);
                Trigger::EventTimeout { event, timeout }
            }
            WaitFor::AnyOfTimeout(events, after) => {
                if events.is_empty() {
                    return Err(KernelError::EmptyEventList);
                }
                let timeout = process.timeout_event();
                self.schedule_delta(timeout.clone(), after);
                timeout.add_waiter(process);
                for event in &events {
                    event.add_waiter(process);
                }
                Trigger::OrListTimeout { events, timeout }
            }
            WaitFor::AllOfTimeout(events, after) => {
                if events.is_empty() {
                    return Err(KernelError::EmptyEventList);
                }
                let timeout = process.timeout_event();
                self.schedule_delta(timeout.clone(), after);
                timeout.add_waiter(process);
                for event in &events {
                    event.add_waiter(process);
                }
                Trigger::AndListTimeout {
                    pending: events.len(),
                    events,
                    timeout,
                }
            }
        };
        *process.trigger.lock() = trigger;
        Ok(())
    }

    /// Tear a finished process out of every kernel structure.
    fn finalize(&self, process: &Arc<Process>) {
        process.disconnect(self);
        // A wake that re-armed just before exit leaves a stale queue entry.
        self.dequeue(process);
        process.destroy_coroutine();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
