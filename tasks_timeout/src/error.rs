use std::io;
use thiserror::Error;

/// Failure raised when a timed invocation does not finish before its deadline.
///
/// Carries the configured timeout and the dump of tracked tasks taken at the
/// moment the deadline fired.
#[derive(Debug, Error)]
#[error("test timed out after {timeout_ms} ms")]
pub struct TimeoutExceeded {
    timeout_ms: u64,
    label: String,
    dump: String,
}

impl TimeoutExceeded {
    /// Builds the failure for a deadline of `timeout_ms`. The label and the dump
    /// are filled in by [`TimedInvoker`](crate::TimedInvoker) once the deadline fires.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            label: String::new(),
            dump: String::new(),
        }
    }

    pub(crate) fn with_report(mut self, label: &str, dump: String) -> Self {
        self.label = label.to_string();
        self.dump = dump;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Name of the method or lifecycle step that timed out.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tracked tasks that were running when the deadline fired.
    pub fn dump(&self) -> &str {
        &self.dump
    }
}

/// Everything the timeout layer itself can fail with.
///
/// Failures of the intercepted work are never wrapped in this type: panics are
/// resumed on the calling thread and returned values (including `Err`s) are passed
/// through untouched.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// An instance-registered timeout met a timeout annotation on the same target.
    #[error(
        "using a timeout annotation on `{method}` along with an instance-registered timeout is prohibited; \
         please use either the registered instance or the annotation, but not both"
    )]
    ConfigurationConflict { method: String },

    /// Annotation-driven interception found no annotation at all.
    #[error(
        "timeout was registered through an annotation, but none could be found for `{method}`; please report this"
    )]
    ResolutionInconsistency { method: String },

    #[error(transparent)]
    TimeoutExceeded(#[from] TimeoutExceeded),

    /// The worker or watchdog thread could not be started.
    #[error("unable to start the timeout worker: {0}")]
    WorkerSpawn(#[from] io::Error),
}

impl TimeoutError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::TimeoutExceeded(_))
    }
}
