//! The transport seam between a session and whatever runs its tasks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{WorkerRequest, WorkerResponse};
use crate::error::Result;

/// Result of waiting for the next worker message.
#[derive(Debug)]
pub enum Received {
    Response(WorkerResponse),
    /// Nothing arrived within the timeout.
    Pending,
    /// The worker is gone; the string says how it ended.
    Disconnected(String),
}

/// Something the session can send tasks to.
pub trait Worker: Send {
    fn send(&mut self, request: &WorkerRequest) -> Result<()>;

    /// Wait up to `timeout` for the next response.
    fn recv(&mut self, timeout: Duration) -> Result<Received>;

    /// Route worker-side diagnostics to `sink`.
    fn set_progress(&mut self, _sink: Option<ProgressSink>) {}

    /// Ask the worker to exit, escalating if it does not within `timeout`.
    fn shutdown(&mut self, timeout: Duration) -> Result<()>;

    /// Stop the worker immediately.
    fn kill(&mut self) -> Result<()>;
}

impl<W: Worker + ?Sized> Worker for Box<W> {
    fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        (**self).send(request)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Received> {
        (**self).recv(timeout)
    }

    fn set_progress(&mut self, sink: Option<ProgressSink>) {
        (**self).set_progress(sink)
    }

    fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        (**self).shutdown(timeout)
    }

    fn kill(&mut self) -> Result<()> {
        (**self).kill()
    }
}

/// Progress and diagnostics reported while a session works.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// UPDATE response from a running task.
    Update {
        task: String,
        message: Option<String>,
        current: Option<u64>,
        maximum: Option<u64>,
    },
    /// A line the worker wrote to stderr.
    Log(String),
    /// Periodic sign of life during a long operation.
    Heartbeat { label: String, elapsed: Duration },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update {
                message,
                current,
                maximum,
                ..
            } => {
                write!(f, "{}", message.as_deref().unwrap_or("working"))?;
                match (current, maximum) {
                    (Some(c), Some(m)) => write!(f, " ({}/{})", c, m),
                    (Some(c), None) => write!(f, " ({})", c),
                    _ => Ok(()),
                }
            }
            Self::Log(line) => write!(f, "{}", line),
            Self::Heartbeat { label, elapsed } => {
                write!(f, "{} still running after {}s", label, elapsed.as_secs())
            }
        }
    }
}

/// Callback receiving progress events. Called from worker threads.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
