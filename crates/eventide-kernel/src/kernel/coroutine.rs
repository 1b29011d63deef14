//! Resumable execution contexts for simulated processes
//!
//! A process body is not an OS thread. It is a resumable state machine the
//! scheduler drives one activation at a time: each activation runs until the
//! body hands back a [`Step`], and the body itself keeps whatever state it
//! needs to continue later. The [`Coroutine`] wrapper pins that contract
//! down as an explicit lifecycle, so aborting a process is a deterministic
//! hand-off back to the scheduler rather than a non-local jump out of a
//! stack frame.

use crate::error::KernelError;
use crate::kernel::event::Event;
use crate::kernel::process::{Process, Scope};
use crate::kernel::scheduler::Scheduler;
use std::any::Any;
use std::sync::Arc;

/// Payload carried by an injected user exception.
///
/// Payloads are shared so the same exception can be delivered to a whole
/// subtree of processes.
pub type ExceptionPayload = Arc<dyn Any + Send + Sync>;

/// Default stack reservation for a process, in bytes.
///
/// Bodies run on the caller's stack, so this is a modeling knob carried in
/// spawn options rather than an allocation size.
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Wait condition a process body can suspend on.
///
/// Timeouts are measured in delta cycles of the driving scheduler; a
/// timeout of zero still crosses one delta boundary.
#[derive(Clone)]
pub enum WaitFor {
    /// Park on the static sensitivity list only.
    Static,

    /// Park until the nth firing of the static sensitivity.
    StaticCycles(u32),

    /// A single event.
    Event(Arc<Event>),

    /// Every event in the list must fire once.
    AllOf(Vec<Arc<Event>>),

    /// Any one event in the list fires.
    AnyOf(Vec<Arc<Event>>),

    /// A bare timeout.
    Timeout(u64),

    /// A single event raced against a timeout.
    EventTimeout(Arc<Event>, u64),

    /// An any-of list raced against a timeout.
    AnyOfTimeout(Vec<Arc<Event>>, u64),

    /// An all-of list raced against a timeout.
    AllOfTimeout(Vec<Arc<Event>>, u64),
}

/// What one activation of a process body produced.
pub enum Step {
    /// Suspend until the wait condition resolves.
    Wait(WaitFor),

    /// Give up the remainder of this activation without registering a wait.
    ///
    /// A runnable process goes back to the queue; a blocked one keeps its
    /// right to continue and is re-queued when the block lifts.
    Yield,

    /// The body requests termination.
    Halt,

    /// The body ran to completion.
    Done,

    /// Unrecoverable failure inside the body.
    Fault(KernelError),
}

/// A resumable process body.
///
/// `run` is invoked once per activation and must return promptly with the
/// next [`Step`]; suspension points are expressed by returning, never by
/// blocking the calling thread. Bodies must not re-enter the scheduler's
/// drive loop from inside `run`.
pub trait ProcessBody: Send {
    /// Run the next segment of the body.
    fn run(&mut self, act: &mut Activation<'_>) -> Step;

    /// Rewind the body to its entry point after a reset signal.
    fn reset(&mut self) {}
}

impl<F> ProcessBody for F
where
    F: FnMut(&mut Activation<'_>) -> Step + Send,
{
    fn run(&mut self, act: &mut Activation<'_>) -> Step {
        self(act)
    }
}

impl ProcessBody for Box<dyn ProcessBody> {
    fn run(&mut self, act: &mut Activation<'_>) -> Step {
        (**self).run(act)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Context handed to a process body for the duration of one activation.
pub struct Activation<'a> {
    pub(crate) sched: &'a Scheduler,
    pub(crate) process: &'a Arc<Process>,
    pub(crate) thrown: Option<ExceptionPayload>,
}

impl<'a> Activation<'a> {
    /// The scheduler driving this activation.
    pub fn scheduler(&self) -> &'a Scheduler {
        self.sched
    }

    /// The process being activated.
    pub fn process(&self) -> &'a Arc<Process> {
        self.process
    }

    /// Whether the last timed wait resolved by timing out rather than by a
    /// data event.
    pub fn timed_out(&self) -> bool {
        self.process.timed_out()
    }

    /// Take the exception injected into this process, if any.
    ///
    /// An injected exception left unconsumed when the body returns is
    /// treated as uncaught and terminates the process with an error.
    pub fn caught(&mut self) -> Option<ExceptionPayload> {
        self.thrown.take()
    }

    /// Suspend the running process itself.
    ///
    /// The returned step must be handed straight back to the scheduler so
    /// that no further statements execute in this activation.
    pub fn suspend_self(&mut self) -> Step {
        self.process.suspend(self.sched, Scope::SelfOnly);
        Step::Yield
    }
}

/// Lifecycle of a coroutine context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created, never activated.
    Prepared,
    /// An activation is in progress.
    Running,
    /// Between activations.
    Suspended,
    /// Torn down; no further activation is legal.
    Terminating,
}

/// A process body bound to its activation lifecycle.
pub struct Coroutine {
    state: CoroutineState,
    stack_size: usize,
    body: Box<dyn ProcessBody>,
}

impl Coroutine {
    pub(crate) fn new(stack_size: usize, body: Box<dyn ProcessBody>) -> Self {
        Self {
            state: CoroutineState::Prepared,
            stack_size,
            body,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoroutineState {
        self.state
    }

    /// Stack reservation this context was created with.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Drive one activation of the body.
    pub(crate) fn resume(&mut self, act: &mut Activation<'_>) -> Step {
        assert!(
            matches!(
                self.state,
                CoroutineState::Prepared | CoroutineState::Suspended
            ),
            "resumed a dead coroutine"
        );
        self.state = CoroutineState::Running;
        let step = self.body.run(act);
        if self.state == CoroutineState::Running {
            self.state = CoroutineState::Suspended;
        }
        step
    }

    /// Rewind the body to its entry point.
    pub(crate) fn rewind(&mut self) {
        self.body.reset();
    }

    /// Tear the context down from the outside.
    pub(crate) fn abort(&mut self) {
        assert!(
            self.state != CoroutineState::Terminating,
            "coroutine aborted twice"
        );
        self.state = CoroutineState::Terminating;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> Box<dyn ProcessBody> {
        Box::new(|_: &mut Activation<'_>| Step::Done)
    }

    #[test]
    fn test_coroutine_starts_prepared() {
        let coro = Coroutine::new(DEFAULT_STACK_SIZE, noop_body());
        assert_eq!(coro.state(), CoroutineState::Prepared);
        assert_eq!(coro.stack_size(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_coroutine_abort_transitions_to_terminating() {
        let mut coro = Coroutine::new(DEFAULT_STACK_SIZE, noop_body());
        coro.abort();
        assert_eq!(coro.state(), CoroutineState::Terminating);
    }

    #[test]
    #[should_panic(expected = "coroutine aborted twice")]
    fn test_coroutine_double_abort_panics() {
        let mut coro = Coroutine::new(DEFAULT_STACK_SIZE, noop_body());
        coro.abort();
        coro.abort();
    }
}
