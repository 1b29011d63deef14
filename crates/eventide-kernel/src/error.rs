//! Kernel error types

use thiserror::Error;

/// Errors reported by the simulation kernel.
///
/// Control signals (kill, reset, injected exceptions) are deliberately not
/// represented here. They are control-flow events a process body is expected
/// to observe and react to, and they travel through the pending-signal slot
/// of a process instead of `Result` values.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A top-level process was spawned after the simulation started.
    ///
    /// Dynamic spawning from inside a running process is always allowed;
    /// only processes with no running parent are frozen at start time.
    #[error("cannot spawn a top-level process after simulation start")]
    SpawnAfterStart,

    /// A process requested a wait on an empty event list.
    #[error("wait requested on an empty event list")]
    EmptyEventList,

    /// An injected exception was never observed by the target process body.
    #[error("uncaught exception in process body")]
    UncaughtException,

    /// A process body failed with an unrecoverable error.
    #[error("process body fault: {0}")]
    Fault(String),
}
