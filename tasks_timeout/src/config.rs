/// One fully resolved timeout policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutConfig {
    timeout_ms: u64,
    cancel_on_timeout: bool,
}

impl TimeoutConfig {
    /// A timeout of `timeout_ms` milliseconds that leaves the work running on expiry.
    ///
    /// Panics if `timeout_ms` is zero.
    pub fn millis(timeout_ms: u64) -> Self {
        assert!(timeout_ms > 0, "timeout must be a positive number of milliseconds");
        Self {
            timeout_ms,
            cancel_on_timeout: false,
        }
    }

    /// Same as [`millis`](Self::millis) with whole seconds.
    pub fn seconds(secs: u32) -> Self {
        Self::millis(u64::from(secs) * 1000)
    }

    /// Whether the work (and every tracked task) is asked to stop once the deadline fires.
    pub fn cancel_on_timeout(mut self, cancel_on_timeout: bool) -> Self {
        self.cancel_on_timeout = cancel_on_timeout;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn cancels_on_timeout(&self) -> bool {
        self.cancel_on_timeout
    }
}

/// Timeout declared on a test method or a test class.
///
/// This is what `#[timeout(...)]` expands to; classes and methods described through
/// [`ClassInfo`](crate::ClassInfo) and [`MethodInfo`](crate::MethodInfo) carry it too.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutAnnotation {
    timeout_ms: u64,
    cancel_on_timeout: bool,
}

impl TimeoutAnnotation {
    /// Panics if `timeout_ms` is zero, at compile time in const contexts.
    pub const fn new(timeout_ms: u64) -> Self {
        assert!(timeout_ms > 0, "timeout must be a positive number of milliseconds");
        Self {
            timeout_ms,
            cancel_on_timeout: false,
        }
    }

    pub const fn cancel_on_timeout(mut self, cancel_on_timeout: bool) -> Self {
        self.cancel_on_timeout = cancel_on_timeout;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn cancels_on_timeout(&self) -> bool {
        self.cancel_on_timeout
    }
}

impl From<TimeoutAnnotation> for TimeoutConfig {
    fn from(annotation: TimeoutAnnotation) -> Self {
        TimeoutConfig::millis(annotation.timeout_ms).cancel_on_timeout(annotation.cancel_on_timeout)
    }
}

/// Where a resolved [`TimeoutConfig`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// Fixed when the [`TasksTimeout`](crate::TasksTimeout) instance was built.
    Registration,
    MethodAnnotation,
    /// Found on the test class or one of its enclosing classes. Only ever resolved
    /// for phases whose [`Policy`](crate::Policy) uses class annotations.
    ClassAnnotation,
    None,
}
