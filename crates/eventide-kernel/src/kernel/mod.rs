//! The cooperative process kernel
//!
//! Simulated processes are resumable units of execution scheduled
//! cooperatively: exactly one runs at a time, suspension happens only at
//! explicit wait points, and out-of-band interventions (kill, reset,
//! exception injection) preempt the normal queue order.

mod coroutine;
mod event;
mod join;
mod process;
mod scheduler;
mod trigger;

pub use coroutine::{
    Activation, Coroutine, CoroutineState, ExceptionPayload, ProcessBody, Step, WaitFor,
    DEFAULT_STACK_SIZE,
};
pub use event::{Event, EventId};
pub use join::Join;
pub use process::{
    MonitorEvent, Process, ProcessId, ResetKind, Scope, Status, StatusMonitor,
};
pub use scheduler::{Scheduler, SpawnOptions};
pub use trigger::Directive;
