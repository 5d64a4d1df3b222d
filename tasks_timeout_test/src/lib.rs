use log::info;
use once_cell::sync::Lazy;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};
use tasks_timeout::{cancellation_requested, registry};

static FINISHED: Lazy<AtomicUsize> = Lazy::new(|| AtomicUsize::new(0));

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Number of [`hold_tracked`] calls that ran to the end.
pub fn finished_count() -> usize {
    FINISHED.load(Ordering::SeqCst)
}

/// Keeps a tracked task named `name` alive for `duration`, or until the timeout
/// asks it to stop. Returns whether it stopped early.
/// ```
/// extern crate tasks_timeout_test;
/// use tasks_timeout_test::hold_tracked;
/// use std::time::Duration;
/// fn main() {
///     assert!(!hold_tracked("doc", Duration::from_millis(10)));
/// }
/// ```
pub fn hold_tracked(name: &str, duration: Duration) -> bool {
    init();
    let guard = registry().enter(name);
    info!("Holding {} for {:?}", name, duration);
    let start = Instant::now();
    while start.elapsed() < duration {
        if cancellation_requested() || guard.is_cancelled() {
            info!("{} was cancelled", name);
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    FINISHED.fetch_add(1, Ordering::SeqCst);
    false
}
