//! Process handle for the worker subprocess.
//!
//! Wraps a child process with line-based pipes on stdin/stdout and a thread
//! draining stderr.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{LineRead, LineReader, LineWriter, PipeFd};
use super::protocol::{WorkerRequest, WorkerResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{SinkSlot, spawn_stderr_forwarder};
use super::worker::{ProgressSink, Received, Worker};
use crate::error::{BridgeError, Result};

/// How long to wait for an exit status after the worker closed stdout.
const EOF_REAP_WINDOW: Duration = Duration::from_millis(500);

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    /// Set once the process has been reaped.
    exit: Option<TerminationReason>,
    stderr: Option<JoinHandle<()>>,
    progress: SinkSlot,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's pipes; stderr, if captured, is drained
    /// on a background thread.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Environment("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Environment("worker stdout not captured".into()))?;

        let progress: SinkSlot = Arc::new(Mutex::new(None));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_forwarder(stderr, pid.as_raw(), progress.clone()))
            .transpose()?;

        tracing::debug!(pid = pid.as_raw(), "Worker process started");
        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(OwnedFd::from(stdin))),
            reader: LineReader::new(PipeFd::new(OwnedFd::from(stdout))),
            exit: None,
            stderr,
            progress,
        })
    }

    /// How the process ended, once it has been reaped.
    pub fn exit_reason(&self) -> Option<&TerminationReason> {
        self.exit.as_ref()
    }

    /// Try to reap the process (non-blocking).
    fn try_wait(&mut self) -> Option<&TerminationReason> {
        if self.exit.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => self.reaped(analyze_wait_status(status)),
                Err(_) => self.reaped(TerminationReason::Unknown),
            }
        }
        self.exit.as_ref()
    }

    fn wait(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;
        self.reaped(analyze_wait_status(status));
        Ok(())
    }

    fn reaped(&mut self, reason: TerminationReason) {
        tracing::debug!(pid = self.pid.as_raw(), %reason, "Worker process reaped");
        self.exit = Some(reason);
        if let Some(handle) = self.stderr.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
            // Otherwise a grandchild still holds stderr; let the thread go.
        }
    }

    /// Poll for an exit status for up to `window`.
    fn wait_for_exit(&mut self, window: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.try_wait().is_some() {
                return true;
            }
            if start.elapsed() >= window {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn describe_exit(&self) -> String {
        match &self.exit {
            Some(reason) => format!("worker process {}", reason),
            None => "worker closed its output".to_string(),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| BridgeError::Io(std::io::Error::from(e)))
    }
}

impl Worker for Proc {
    fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer.write_line(&line).map_err(|e| {
            BridgeError::task(
                crate::error::TaskFailureKind::Crashed,
                format!("failed to send to worker: {}", e),
            )
        })
    }

    fn recv(&mut self, timeout: Duration) -> Result<Received> {
        let mut deadline = Instant::now() + timeout;
        let mut exited = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reader.read_line_timeout(remaining)? {
                LineRead::Line(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerResponse::from_worker_line(&line) {
                        Ok(response) => return Ok(Received::Response(response)),
                        Err(e) => {
                            tracing::debug!(
                                target: "segbridge::worker",
                                pid = self.pid.as_raw(),
                                error = %e,
                                "Skipping non-protocol stdout line: {}",
                                line
                            );
                        }
                    }
                }
                LineRead::TimedOut if exited => {
                    return Ok(Received::Disconnected(self.describe_exit()));
                }
                LineRead::TimedOut => {
                    if self.try_wait().is_none() {
                        return Ok(Received::Pending);
                    }
                    // It may have written its last lines after the poll.
                    exited = true;
                    deadline = Instant::now();
                }
                LineRead::Eof => {
                    self.wait_for_exit(EOF_REAP_WINDOW);
                    return Ok(Received::Disconnected(self.describe_exit()));
                }
            }
        }
    }

    fn set_progress(&mut self, sink: Option<ProgressSink>) {
        if let Ok(mut slot) = self.progress.lock() {
            *slot = sink;
        }
    }

    /// Gracefully stop the worker: send exit, wait, then SIGTERM, then SIGKILL.
    fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        let _ = self.send(&WorkerRequest::exit());
        if self.wait_for_exit(timeout) {
            return Ok(());
        }

        tracing::debug!(pid = self.pid.as_raw(), "Worker ignored exit request, sending SIGTERM");
        let _ = self.terminate();
        if self.wait_for_exit(Duration::from_millis(100)) {
            return Ok(());
        }

        self.kill()
    }

    /// Send SIGKILL to the process and wait for it to exit.
    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        tracing::debug!(pid = self.pid.as_raw(), "Killing worker");
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(BridgeError::Io(std::io::Error::from(e))),
        }
        self.wait()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate();
            if self.wait_for_exit(Duration::from_millis(10)) {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ResponseKind;
    use crate::bridge::spawn::spawn_command;
    use crate::bridge::worker::ProgressEvent;
    use std::process::Command;

    fn sh(script: &str) -> Proc {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        spawn_command(cmd).expect("Failed to spawn sh")
    }

    #[test]
    fn test_recv_skips_noise_and_parses_response() {
        let mut proc = sh(
            r#"echo 'starting up'; echo '{"task":"t1","responseType":"LAUNCH"}'; sleep 5"#,
        );
        let received = proc.recv(Duration::from_secs(5)).unwrap();
        match received {
            Received::Response(r) => {
                assert_eq!(r.task, "t1");
                assert_eq!(r.kind, ResponseKind::Launch);
            }
            other => panic!("Expected response, got {:?}", other),
        }
        proc.kill().unwrap();
        assert!(proc.exit_reason().is_some());
    }

    #[test]
    fn test_recv_pending_while_quiet() {
        let mut proc = sh("sleep 5");
        assert!(matches!(
            proc.recv(Duration::from_millis(30)).unwrap(),
            Received::Pending
        ));
        assert!(proc.try_wait().is_none());
    }

    #[test]
    fn test_recv_reports_exit_code() {
        let mut proc = sh("exit 3");
        match proc.recv(Duration::from_secs(5)).unwrap() {
            Received::Disconnected(msg) => assert!(msg.contains("code 3"), "{}", msg),
            other => panic!("Expected disconnect, got {:?}", other),
        }
        assert_eq!(proc.exit_reason(), Some(&TerminationReason::Exited(3)));
    }

    #[test]
    fn test_malformed_response_reaches_its_task() {
        let mut proc = sh(concat!(
            r#"echo '{"task":"t2","responseType":"COMPLETION","#,
            r#""outputs":{"contours_x":[null]}}'; sleep 5"#,
        ));
        match proc.recv(Duration::from_secs(5)).unwrap() {
            Received::Response(r) => {
                assert_eq!(r.task, "t2");
                assert!(matches!(r.kind, ResponseKind::Failure { .. }), "{:?}", r.kind);
            }
            other => panic!("Expected response, got {:?}", other),
        }
        proc.kill().unwrap();
    }

    #[test]
    fn test_last_line_before_exit_is_delivered() {
        let mut proc =
            sh(r#"echo '{"task":"t3","responseType":"COMPLETION","outputs":{}}'; exit 0"#);
        std::thread::sleep(Duration::from_millis(200));

        let mut seen = Vec::new();
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            match proc.recv(Duration::from_millis(20)).unwrap() {
                Received::Response(r) => seen.push(r.task),
                Received::Pending => continue,
                Received::Disconnected(msg) => {
                    assert!(msg.contains("code 0") || msg.contains("closed"), "{}", msg);
                    break;
                }
            }
        }
        assert_eq!(seen, ["t3"]);
    }

    #[test]
    fn test_shutdown_escalates() {
        // Ignores the exit request and SIGTERM.
        let mut proc = sh("trap '' TERM; while true; do sleep 1; done");
        proc.shutdown(Duration::from_millis(50)).unwrap();
        assert_eq!(
            proc.exit_reason(),
            Some(&TerminationReason::Signaled(Signal::SIGKILL))
        );
    }

    #[test]
    fn test_stderr_reaches_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let collected = lines.clone();
        let mut proc = sh("sleep 0.2; echo 'loading model' >&2; sleep 5");
        proc.set_progress(Some(Arc::new(move |event: &ProgressEvent| {
            collected.lock().unwrap().push(event.to_string());
        })));

        let start = Instant::now();
        while lines.lock().unwrap().is_empty() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(lines.lock().unwrap().as_slice(), ["loading model"]);
        proc.kill().unwrap();
    }
}
