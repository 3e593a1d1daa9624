//! One worker, one task at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::instrument;

use super::SessionState;
use super::heartbeat::Heartbeat;
use super::protocol::{ResponseKind, Task, TaskStatus, WorkerRequest};
use super::value::{Inputs, Outputs};
use super::worker::{ProgressEvent, ProgressSink, Received, Worker};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result, TaskFailureKind};
use crate::script::ScriptText;

/// Requests cancellation of the task currently in flight.
///
/// Cloneable and safe to trigger from any thread. The flag is cleared at the
/// start of every submit, so a cancel only affects the task that is running
/// when it is requested.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How the wait loop ended.
enum Ending {
    /// The task reached a terminal state through the protocol.
    Settled,
    /// The worker acknowledged a cancel or timeout.
    Canceled(String),
    /// The task was abandoned and the worker must not be reused.
    Teardown,
}

struct Limits {
    poll_interval: Duration,
    task_timeout: Option<Duration>,
    cancel_grace: Duration,
}

/// Owns one worker and runs tasks on it sequentially.
pub struct WorkerSession<W: Worker> {
    worker: Option<W>,
    state: SessionState,
    config: SessionConfig,
    cancel: CancelToken,
}

impl<W: Worker> WorkerSession<W> {
    /// Bootstrap `worker` and return a Ready session.
    ///
    /// Any bootstrap outcome other than Complete is an environment error and
    /// the worker is torn down.
    #[instrument(skip_all, fields(kind = %bootstrap.kind))]
    pub fn start(mut worker: W, bootstrap: ScriptText, config: SessionConfig) -> Result<Self> {
        worker.set_progress(config.progress.clone());
        let mut session = Self {
            worker: Some(worker),
            state: SessionState::Uninitialized,
            cancel: config.cancel.clone(),
            config,
        };

        let started = Instant::now();
        let mut heartbeat = match &session.config.progress {
            Some(sink) => Some(Heartbeat::start(
                session.config.heartbeat_interval,
                sink.clone(),
                "bootstrap",
            )?),
            None => None,
        };
        let result = session.run(Task::new(bootstrap, Inputs::new()), heartbeat.as_ref());
        if let Some(heartbeat) = heartbeat.as_mut() {
            heartbeat.stop();
        }

        match result {
            Ok(_) => {
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Worker ready");
                session.state = SessionState::Ready;
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker bootstrap failed");
                if let Err(close_err) = session.close() {
                    tracing::warn!(error = %close_err, "Failed to shut down worker");
                }
                Err(BridgeError::Environment(format!("worker bootstrap failed: {}", e)))
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Token that cancels whatever task is in flight.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The worker, while the session holds one.
    pub fn worker(&self) -> Option<&W> {
        self.worker.as_ref()
    }

    /// Run one task to a terminal state and return its outputs.
    #[instrument(skip_all, fields(kind = %script.kind))]
    pub fn submit(&mut self, script: ScriptText, inputs: Inputs) -> Result<Outputs> {
        if self.state != SessionState::Ready {
            return Err(BridgeError::NotReady(self.state));
        }
        self.cancel.reset();
        self.run(Task::new(script, inputs), None)
    }

    fn run(&mut self, mut task: Task, heartbeat: Option<&Heartbeat>) -> Result<Outputs> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(BridgeError::NotReady(self.state));
        };
        let limits = Limits {
            poll_interval: self.config.poll_interval,
            task_timeout: self.config.task_timeout,
            cancel_grace: self.config.cancel_grace,
        };
        let started = Instant::now();
        tracing::debug!(task = %task.id, "Submitting task");

        let ending = drive(
            worker,
            &mut task,
            &limits,
            &self.cancel,
            self.config.progress.as_ref(),
            heartbeat,
        );

        match ending {
            Ok(Ending::Settled) => {
                if task.status() == TaskStatus::Crashed {
                    self.teardown();
                }
            }
            Ok(Ending::Canceled(message)) => {
                tracing::info!(task = %task.id, "Task canceled");
                return Err(BridgeError::task(TaskFailureKind::Canceled, message));
            }
            Ok(Ending::Teardown) => self.teardown(),
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "Task aborted");
                self.teardown();
                return Err(e);
            }
        }

        tracing::debug!(
            task = %task.id,
            status = %task.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task finished"
        );
        task.into_result()
    }

    /// Kill the worker and close the session without the exit handshake.
    fn teardown(&mut self) {
        self.state = SessionState::Closed;
        if let Some(mut worker) = self.worker.take() {
            worker.set_progress(None);
            if let Err(e) = worker.kill() {
                tracing::warn!(error = %e, "Failed to kill worker");
            }
        }
    }

    /// Ask the worker to exit and close the session. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.state = SessionState::Closed;
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        tracing::debug!("Closing worker session");
        worker.set_progress(None);
        worker.shutdown(self.config.shutdown_timeout)
    }
}

impl<W: Worker> Drop for WorkerSession<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close worker session");
        }
    }
}

fn drive<W: Worker>(
    worker: &mut W,
    task: &mut Task,
    limits: &Limits,
    cancel: &CancelToken,
    progress: Option<&ProgressSink>,
    heartbeat: Option<&Heartbeat>,
) -> Result<Ending> {
    worker.send(&task.request())?;

    let started = Instant::now();
    let mut cancel_sent: Option<(Instant, String)> = None;

    loop {
        if cancel_sent.is_none() {
            let reason = if cancel.is_canceled() {
                Some("task canceled".to_string())
            } else {
                limits
                    .task_timeout
                    .filter(|limit| started.elapsed() >= *limit)
                    .map(|limit| {
                        format!("task exceeded its time limit of {}s", limit.as_secs_f64())
                    })
            };
            if let Some(reason) = reason {
                tracing::info!(task = %task.id, %reason, "Requesting cancellation");
                worker.send(&WorkerRequest::cancel(&task.id))?;
                cancel_sent = Some((Instant::now(), reason));
            }
        } else if let Some((sent, reason)) = &cancel_sent
            && sent.elapsed() >= limits.cancel_grace
        {
            tracing::warn!(
                task = %task.id,
                grace_ms = limits.cancel_grace.as_millis() as u64,
                "Worker did not acknowledge cancellation"
            );
            task.abandon(
                TaskStatus::Canceled,
                format!("{}; worker unresponsive, session closed", reason),
            );
            return Ok(Ending::Teardown);
        }

        let response = match worker.recv(limits.poll_interval)? {
            Received::Pending => continue,
            Received::Disconnected(how) => {
                tracing::warn!(task = %task.id, %how, "Worker disconnected");
                task.abandon(TaskStatus::Crashed, how);
                return Ok(Ending::Teardown);
            }
            Received::Response(response) => response,
        };

        if response.task != task.id {
            if let ResponseKind::Crash { error } = response.kind {
                task.abandon(TaskStatus::Crashed, error);
                return Ok(Ending::Teardown);
            }
            tracing::debug!(task = %response.task, "Ignoring response for another task");
            continue;
        }

        if let Some(heartbeat) = heartbeat {
            heartbeat.touch();
        }
        if let ResponseKind::Update {
            message,
            current,
            maximum,
        } = &response.kind
        {
            let event = ProgressEvent::Update {
                task: task.id.clone(),
                message: message.clone(),
                current: *current,
                maximum: *maximum,
            };
            tracing::debug!(target: "segbridge::worker", task = %task.id, "{}", event);
            if let Some(sink) = progress {
                sink(&event);
            }
        }

        task.apply(response.kind)?;
        if task.status().is_terminal() {
            break;
        }
    }

    match cancel_sent {
        Some((_, reason)) if task.status() != TaskStatus::Crashed => Ok(Ending::Canceled(reason)),
        _ => Ok(Ending::Settled),
    }
}
