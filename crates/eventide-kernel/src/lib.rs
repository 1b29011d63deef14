//! Eventide simulation kernel
//!
//! A discrete-event simulation kernel built around cooperative processes:
//! - **Processes**: resumable bodies with an orthogonal status flag set and
//!   hierarchical control operations (`kernel::Process`)
//! - **Events**: notification points with static and dynamic waiter lists
//!   (`kernel::Event`)
//! - **Scheduler**: the FIFO runnable queue and delta-cycle driver, plus
//!   preemptive dispatch for out-of-band signals (`kernel::Scheduler`)
//!
//! # Example
//!
//! ```rust,ignore
//! use eventide_kernel::kernel::{Event, Scheduler, SpawnOptions, Step, WaitFor};
//!
//! let sched = Scheduler::new();
//! let tick = Event::new("tick");
//!
//! let mut waiting = false;
//! sched.spawn("consumer", SpawnOptions::default(), move |_act| {
//!     if !waiting {
//!         waiting = true;
//!         Step::Wait(WaitFor::Event(tick.clone()))
//!     } else {
//!         Step::Done
//!     }
//! })?;
//!
//! sched.run();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Kernel error types
pub mod error;

/// Processes, events, triggers, and the cooperative scheduler
pub mod kernel;

pub use error::KernelError;
pub use kernel::{
    Activation, Event, Process, ProcessBody, ResetKind, Scheduler, Scope, SpawnOptions, Status,
    Step, WaitFor,
};
