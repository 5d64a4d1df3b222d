use crate::diagnostics::Diagnostics;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) fn init() {
    #[cfg(feature = "test_logging")]
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counts every call so tests can assert on side effects.
#[derive(Default)]
pub(crate) struct RecordingDiagnostics {
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    dumps: AtomicUsize,
    cancels: AtomicUsize,
}

impl RecordingDiagnostics {
    pub(crate) fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub(crate) fn dumps(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn activate(&self, _capture_creation_stack_traces: bool) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }

    fn dump(&self) -> String {
        format!("dump #{}", self.dumps.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn cancel_tracked(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}
