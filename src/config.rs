//! Session configuration.
//!
//! # Environment Variables
//!
//! - `SEGBRIDGE_POLL_INTERVAL_MS` - How often a waiting submit checks for
//!   cancellation and worker death
//! - `SEGBRIDGE_TASK_TIMEOUT_SECS` - Abandon tasks running longer than this
//!   (`0` or unset = no limit)
//! - `SEGBRIDGE_CANCEL_GRACE_MS` - How long a canceled task may take to
//!   acknowledge before the worker is torn down
//! - `SEGBRIDGE_SHUTDOWN_TIMEOUT_MS` - How long `close()` waits before
//!   escalating to signals
//! - `SEGBRIDGE_HEARTBEAT_SECS` - Heartbeat interval during bootstrap
//! - `SEGBRIDGE_MIN_CONTOUR_SIZE` - Smallest region (in pixels) traced
//! - `SEGBRIDGE_NEGATIVES` - Mask-prompt negatives: `other-labels` or
//!   `include-background`

use std::fmt;
use std::time::Duration;

use crate::bridge::{CancelToken, ProgressSink};
use crate::contour::DEFAULT_MIN_CONTOUR_SIZE;
use crate::script::NegativePolicy;

/// Tunables for a worker session and its manager.
#[derive(Clone)]
pub struct SessionConfig {
    /// Wait granularity of a blocking submit (default: 50ms)
    pub poll_interval: Duration,
    /// Per-task time limit (default: none)
    pub task_timeout: Option<Duration>,
    /// Time a canceled task has to acknowledge (default: 2s)
    pub cancel_grace: Duration,
    /// Time `close()` waits for a voluntary exit (default: 2s)
    pub shutdown_timeout: Duration,
    /// Heartbeat interval during bootstrap (default: 10s)
    pub heartbeat_interval: Duration,
    /// Components smaller than this are not traced (default: 3)
    pub min_contour_size: usize,
    /// Negative prompts for mask queries (default: other labels)
    pub negative_policy: NegativePolicy,
    /// Receives task updates, worker stderr lines and heartbeats
    pub progress: Option<ProgressSink>,
    /// Cancels the task in flight, bootstrap included
    pub cancel: CancelToken,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            task_timeout: None,
            cancel_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            min_contour_size: DEFAULT_MIN_CONTOUR_SIZE,
            negative_policy: NegativePolicy::OtherLabels,
            progress: None,
            cancel: CancelToken::new(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("poll_interval", &self.poll_interval)
            .field("task_timeout", &self.task_timeout)
            .field("cancel_grace", &self.cancel_grace)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("min_contour_size", &self.min_contour_size)
            .field("negative_policy", &self.negative_policy)
            .field("progress", &self.progress.is_some())
            .field("canceled", &self.cancel.is_canceled())
            .finish()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_min_contour_size(mut self, size: usize) -> Self {
        self.min_contour_size = size;
        self
    }

    pub fn with_negative_policy(mut self, policy: NegativePolicy) -> Self {
        self.negative_policy = policy;
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Share `token` with the session, so it can be triggered before the
    /// session exists (from a signal handler, say).
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Apply `SEGBRIDGE_*` environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
                    None
                }
            }
        }

        if let Some(ms) = parsed::<u64>(&lookup, "SEGBRIDGE_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "SEGBRIDGE_TASK_TIMEOUT_SECS") {
            self.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = parsed::<u64>(&lookup, "SEGBRIDGE_CANCEL_GRACE_MS") {
            self.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "SEGBRIDGE_SHUTDOWN_TIMEOUT_MS") {
            self.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "SEGBRIDGE_HEARTBEAT_SECS") {
            self.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = parsed::<usize>(&lookup, "SEGBRIDGE_MIN_CONTOUR_SIZE") {
            self.min_contour_size = size;
        }
        if let Some(policy) = parsed::<NegativePolicy>(&lookup, "SEGBRIDGE_NEGATIVES") {
            self.negative_policy = policy;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.task_timeout, None);
        assert_eq!(config.cancel_grace, Duration::from_secs(2));
        assert_eq!(config.min_contour_size, 3);
        assert_eq!(config.negative_policy, NegativePolicy::OtherLabels);
        assert!(config.progress.is_none());
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_task_timeout(Some(Duration::from_secs(30)))
            .with_min_contour_size(10)
            .with_negative_policy(NegativePolicy::IncludeBackground);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.min_contour_size, 10);
        assert_eq!(config.negative_policy, NegativePolicy::IncludeBackground);
    }

    #[test]
    fn test_overrides() {
        let config = SessionConfig::default().with_overrides_from(lookup(&[
            ("SEGBRIDGE_POLL_INTERVAL_MS", "20"),
            ("SEGBRIDGE_TASK_TIMEOUT_SECS", "90"),
            ("SEGBRIDGE_CANCEL_GRACE_MS", "500"),
            ("SEGBRIDGE_SHUTDOWN_TIMEOUT_MS", "750"),
            ("SEGBRIDGE_HEARTBEAT_SECS", "3"),
            ("SEGBRIDGE_MIN_CONTOUR_SIZE", "8"),
            ("SEGBRIDGE_NEGATIVES", "include-background"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.cancel_grace, Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(750));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.min_contour_size, 8);
        assert_eq!(config.negative_policy, NegativePolicy::IncludeBackground);
    }

    #[test]
    fn test_zero_timeout_disables_and_garbage_is_ignored() {
        let config = SessionConfig::default()
            .with_task_timeout(Some(Duration::from_secs(5)))
            .with_overrides_from(lookup(&[
                ("SEGBRIDGE_TASK_TIMEOUT_SECS", "0"),
                ("SEGBRIDGE_MIN_CONTOUR_SIZE", "lots"),
            ]));
        assert_eq!(config.task_timeout, None);
        assert_eq!(config.min_contour_size, 3);
    }

    #[test]
    fn test_debug_hides_sink() {
        let sink = std::sync::Arc::new(|_: &crate::bridge::ProgressEvent| {});
        let config = SessionConfig::default().with_progress(sink);
        assert!(format!("{:?}", config).contains("progress: true"));
    }
}
