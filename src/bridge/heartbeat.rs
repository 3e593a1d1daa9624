//! Heartbeat thread for long-running operations.
//!
//! Model construction can take minutes on first use. While it runs, the
//! heartbeat emits a progress event whenever a full interval passes without
//! any other progress, so callers can tell a slow worker from a stuck one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::worker::{ProgressEvent, ProgressSink};
use crate::error::Result;

struct Shared {
    shutdown: AtomicBool,
    last_activity: Mutex<Instant>,
}

/// Emits [`ProgressEvent::Heartbeat`] while an operation is quiet.
pub struct Heartbeat {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start beating every `interval` of silence.
    pub fn start(interval: Duration, sink: ProgressSink, label: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        let label = label.into();
        let shared_clone = shared.clone();

        let thread = thread::Builder::new()
            .name("segbridge-heartbeat".to_string())
            .spawn(move || heartbeat_loop(shared_clone, interval, sink, label))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Record that other progress was observed.
    pub fn touch(&self) {
        if let Ok(mut last) = self.shared.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeat_loop(shared: Arc<Shared>, interval: Duration, sink: ProgressSink, label: String) {
    tracing::trace!(%label, "Heartbeat started");
    let started = Instant::now();

    while !shared.shutdown.load(Ordering::Relaxed) {
        let since = shared
            .last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default();

        if since >= interval {
            let elapsed = started.elapsed();
            tracing::debug!(%label, elapsed_secs = elapsed.as_secs(), "Still working");
            sink(&ProgressEvent::Heartbeat {
                label: label.clone(),
                elapsed,
            });
            if let Ok(mut last) = shared.last_activity.lock() {
                *last = Instant::now();
            }
            thread::park_timeout(interval);
        } else {
            thread::park_timeout(interval - since);
        }
    }

    tracing::trace!(%label, "Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_sink() -> (ProgressSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sink: ProgressSink = Arc::new(move |event: &ProgressEvent| {
            if matches!(event, ProgressEvent::Heartbeat { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (sink, count)
    }

    #[test]
    fn test_beats_while_quiet() {
        let (sink, count) = counting_sink();
        let mut heartbeat = Heartbeat::start(Duration::from_millis(20), sink, "test").unwrap();
        thread::sleep(Duration::from_millis(150));
        heartbeat.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_touch_suppresses_beats() {
        let (sink, count) = counting_sink();
        let heartbeat = Heartbeat::start(Duration::from_millis(200), sink, "test").unwrap();
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(20));
            heartbeat.touch();
        }
        drop(heartbeat);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_is_prompt() {
        let (sink, _) = counting_sink();
        let mut heartbeat = Heartbeat::start(Duration::from_secs(60), sink, "test").unwrap();
        let start = Instant::now();
        heartbeat.stop();
        heartbeat.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
