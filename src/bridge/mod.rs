//! Out-of-process worker bridge.
//!
//! A session owns one long-lived worker and runs one task at a time over a
//! newline-delimited JSON protocol on the worker's stdin/stdout. Bulk array
//! data never travels over the pipe; it goes through shared-memory segments
//! referenced by name from the task script.
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────────┐
//!        │  SessionManager  │  embed once, query many
//!        └────────┬─────────┘
//!                 │ submit(script, inputs)
//!        ┌────────▼─────────┐        ┌──────────────┐
//!        │  WorkerSession   │◄──────►│  Heartbeat   │ (bootstrap only)
//!        └────────┬─────────┘        └──────────────┘
//!                 │ Worker trait
//!        ┌────────┴─────────┐
//!        │                  │
//!  ┌─────▼─────┐      ┌─────▼──────┐
//!  │   Proc    │      │ StubWorker │
//!  │ (python)  │      │ (in-proc)  │
//!  └───────────┘      └────────────┘
//! ```
//!
//! # Features
//!
//! - **Typed protocol**: requests and responses are tagged serde enums
//! - **Crash detection**: EOF, process exit and CRASH responses all end the task
//! - **Cancellation**: cooperative CANCEL with a grace period, then teardown
//! - **Deterministic stub**: the same tasks run in-process for tests

mod heartbeat;
mod ipc;
mod proc;
pub mod protocol;
mod session;
mod signals;
mod spawn;
mod stub;
pub mod value;
mod worker;

use std::fmt;

pub use heartbeat::Heartbeat;
pub use proc::Proc;
pub use protocol::{RequestKind, ResponseKind, Task, TaskStatus, WorkerRequest, WorkerResponse};
pub use session::{CancelToken, WorkerSession};
pub use signals::TerminationReason;
pub use spawn::{EnvironmentDescriptor, WORKER_MAIN, spawn_command, spawn_worker};
pub use stub::{StubFailure, StubWorker};
pub use value::{Inputs, Outputs, Value};
pub use worker::{ProgressEvent, ProgressSink, Received, Worker};

/// Lifecycle of a [`WorkerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker spawned, bootstrap not yet complete.
    Uninitialized,
    /// Bootstrap complete; tasks are accepted.
    Ready,
    /// Closed explicitly or after a fatal error.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
