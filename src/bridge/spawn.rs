//! Launching the Python worker process.
//!
//! The worker loop is compiled into the binary and passed to the
//! interpreter with `-c`, so nothing has to be installed into the
//! environment besides the model packages.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::proc::Proc;
use super::worker::{ProgressEvent, ProgressSink};
use crate::error::{BridgeError, Result};

/// Main loop executed by the worker interpreter.
pub const WORKER_MAIN: &str = include_str!("python/worker_main.py");

/// Environment variables that would let the host's Python setup leak into
/// an isolated worker.
const ISOLATION_REMOVED_VARS: &[&str] = &["PYTHONPATH", "PYTHONHOME", "PYTHONSTARTUP"];

/// Where and how to launch the worker interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    /// Prefix of the Python environment (the interpreter is `bin/python`).
    pub root: PathBuf,
    /// Run the interpreter isolated from user site-packages and `PYTHON*`
    /// variables.
    pub isolated: bool,
}

impl EnvironmentDescriptor {
    pub fn new(root: impl Into<PathBuf>, isolated: bool) -> Self {
        Self {
            root: root.into(),
            isolated,
        }
    }

    pub fn interpreter(&self) -> PathBuf {
        self.root.join("bin").join("python")
    }

    /// Check that the environment looks launchable.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(BridgeError::Environment(format!(
                "environment root {} does not exist",
                self.root.display()
            )));
        }
        let interpreter = self.interpreter();
        if !interpreter.is_file() {
            return Err(BridgeError::Environment(format!(
                "no interpreter at {}",
                interpreter.display()
            )));
        }
        Ok(())
    }

    /// The command that starts the worker loop.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.interpreter());
        cmd.arg("-u");
        if self.isolated {
            cmd.arg("-I");
            for var in ISOLATION_REMOVED_VARS {
                cmd.env_remove(var);
            }
        }
        cmd.arg("-c").arg(WORKER_MAIN);
        cmd.env("PYTHONIOENCODING", "utf-8");
        cmd.current_dir(&self.root);
        cmd
    }
}

/// Spawn the worker for `descriptor`.
pub fn spawn_worker(descriptor: &EnvironmentDescriptor) -> Result<Proc> {
    descriptor.validate()?;
    tracing::debug!(
        root = %descriptor.root.display(),
        isolated = descriptor.isolated,
        "Spawning worker"
    );
    spawn_command(descriptor.command()).map_err(|e| match e {
        BridgeError::Io(io) => BridgeError::Environment(format!(
            "failed to start {}: {}",
            descriptor.interpreter().display(),
            io
        )),
        other => other,
    })
}

/// Spawn any command speaking the worker protocol on stdin/stdout.
pub fn spawn_command(mut cmd: Command) -> Result<Proc> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let child = cmd.spawn()?;
    Proc::from_child(child)
}

/// Shared slot holding the current progress sink.
pub(crate) type SinkSlot = Arc<Mutex<Option<ProgressSink>>>;

/// Forward worker stderr lines to the debug log and the progress sink.
pub(crate) fn spawn_stderr_forwarder(
    stderr: ChildStderr,
    pid: i32,
    sink: SinkSlot,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("worker-{}-stderr", pid))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                tracing::debug!(target: "segbridge::worker", pid, "{}", line);
                let current = sink.lock().ok().and_then(|s| s.clone());
                if let Some(sink) = current {
                    sink(&ProgressEvent::Log(line));
                }
            }
        })?;
    Ok(handle)
}
