use crate::{
    diagnostics::Diagnostics,
    error::{TimeoutError, TimeoutExceeded},
};
#[cfg(feature = "async")]
use futures_channel::oneshot;
#[cfg(feature = "async")]
use futures_util::future::{self, Either};
#[cfg(feature = "logging")]
use log::debug;
use std::{
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};
#[cfg(feature = "async")]
use std::{future::Future, pin::Pin, time::Instant};

pub(crate) const WORKER_THREAD_NAME: &str = "Timeout test thread";
#[cfg(feature = "async")]
const WATCHDOG_THREAD_NAME: &str = "Timeout watchdog";

thread_local! {
    static CANCELLATION: RefCell<Option<Arc<AtomicBool>>> = RefCell::new(None);
}

/// Whether the timed work running on this thread has been asked to stop.
///
/// Threads cannot be stopped from the outside, so long-running synchronous work
/// that wants `cancel_on_timeout` to take effect should poll this. Always `false`
/// outside of a timed invocation.
pub fn cancellation_requested() -> bool {
    CANCELLATION.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    })
}

/// Races a unit of work against a deadline, dumping the tracked tasks when the
/// deadline wins.
#[derive(Clone)]
pub struct TimedInvoker {
    diagnostics: Arc<dyn Diagnostics>,
}

impl TimedInvoker {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self { diagnostics }
    }

    /// Runs `work` on a dedicated thread and waits at most `timeout_ms` for it.
    ///
    /// The work's value is returned as is and its panic is resumed on the calling
    /// thread. On expiry the failure built by `build_failure` is returned with the
    /// dump attached; the work is left running unless `cancel_on_timeout` is set.
    pub fn run<T, W, B>(
        &self,
        label: &str,
        timeout_ms: u64,
        cancel_on_timeout: bool,
        build_failure: B,
        work: W,
    ) -> Result<T, TimeoutError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        B: FnOnce(u64) -> TimeoutExceeded,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let flag = cancelled.clone();
        thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                CANCELLATION.with(|slot| *slot.borrow_mut() = Some(flag));
                let _ = started_tx.send(());
                let _ = done_tx.send(panic::catch_unwind(AssertUnwindSafe(work)));
            })?;

        // the deadline counts from the moment the work is actually running
        let _ = started_rx.recv();
        #[cfg(feature = "logging")]
        debug!("Running {:?} with a {} ms deadline", label, timeout_ms);

        let result = match done_rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let dump = self.diagnostics.dump();
                return Err(self.timed_out(label, timeout_ms, cancel_on_timeout, build_failure, dump, || {
                    if cancel_on_timeout {
                        cancelled.store(true, Ordering::SeqCst)
                    }
                }));
            }
            // the worker catches panics, so it always reports
            other => other.expect("timeout worker to report its result"),
        };
        match result {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Async counterpart of [`run`](Self::run).
    ///
    /// `work` is polled by whoever polls this future, so it keeps the caller's
    /// executor context. A watchdog thread takes the dump at the deadline. Work
    /// that blocks past the deadline is still reported as timed out once it yields.
    ///
    /// On expiry `work` is dropped when cancelling. Otherwise what is left of it is
    /// driven to completion on a detached thread, outside the caller's executor.
    #[cfg(feature = "async")]
    pub async fn run_async<F, B>(
        &self,
        label: &str,
        timeout_ms: u64,
        cancel_on_timeout: bool,
        build_failure: B,
        work: F,
    ) -> Result<F::Output, TimeoutError>
    where
        F: Future + Send + 'static,
        B: FnOnce(u64) -> TimeoutExceeded,
    {
        let (deadline_tx, deadline_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let watchdog = {
            let finished = finished.clone();
            let diagnostics = self.diagnostics.clone();
            let timeout = Duration::from_millis(timeout_ms);
            thread::Builder::new()
                .name(WATCHDOG_THREAD_NAME.to_string())
                .spawn(move || {
                    let start = Instant::now();
                    loop {
                        if finished.load(Ordering::Acquire) {
                            return;
                        }
                        let elapsed = start.elapsed();
                        if elapsed >= timeout {
                            // snapshot at the deadline, not when the caller gets to look
                            let _ = deadline_tx.send(diagnostics.dump());
                            return;
                        }
                        thread::park_timeout(timeout - elapsed);
                    }
                })?
        };
        // stands the watchdog down however this future ends, panics included
        let _stop = WatchdogStop {
            finished,
            watchdog: watchdog.thread().clone(),
        };

        #[cfg(feature = "logging")]
        debug!("Awaiting {:?} with a {} ms deadline", label, timeout_ms);

        match future::select(deadline_rx, Box::pin(work)).await {
            Either::Left((Ok(dump), work)) => {
                let cancel_work = move || {
                    if !cancel_on_timeout {
                        detach(work);
                    }
                };
                Err(self.timed_out(label, timeout_ms, cancel_on_timeout, build_failure, dump, cancel_work))
            }
            // the watchdog only stands down once this future is done with it
            Either::Left((Err(oneshot::Canceled), work)) => Ok(work.await),
            Either::Right((value, mut deadline_rx)) => match deadline_rx.try_recv() {
                Ok(Some(dump)) => {
                    drop(value);
                    Err(self.timed_out(label, timeout_ms, cancel_on_timeout, build_failure, dump, || {}))
                }
                _ => Ok(value),
            },
        }
    }

    fn timed_out<B>(
        &self,
        label: &str,
        timeout_ms: u64,
        cancel_on_timeout: bool,
        build_failure: B,
        dump: String,
        cancel_work: impl FnOnce(),
    ) -> TimeoutError
    where
        B: FnOnce(u64) -> TimeoutExceeded,
    {
        eprintln!("\nTest {} timed out after {}\n", label, describe_timeout(timeout_ms));
        eprintln!("{}", dump);

        let failure = build_failure(timeout_ms).with_report(label, dump);
        cancel_work();
        if cancel_on_timeout {
            #[cfg(feature = "logging")]
            debug!("Cancelling {:?} and every tracked task", label);
            self.diagnostics.cancel_tracked();
        }
        failure.into()
    }
}

#[cfg(feature = "async")]
struct WatchdogStop {
    finished: Arc<AtomicBool>,
    watchdog: thread::Thread,
}

#[cfg(feature = "async")]
impl Drop for WatchdogStop {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
        self.watchdog.unpark();
    }
}

/// Best-effort driver for async work that outlived its deadline without being cancelled.
#[cfg(feature = "async")]
fn detach<F>(work: Pin<Box<F>>)
where
    F: Future + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            // executor-bound work may panic away from its runtime; nobody waits for it
            let _ = panic::catch_unwind(AssertUnwindSafe(|| futures_executor::block_on(work)));
        });
    if let Err(_err) = spawned {
        #[cfg(feature = "logging")]
        debug!("Dropping timed out work, no thread to finish it on: {}", _err);
    }
}

fn describe_timeout(timeout_ms: u64) -> String {
    if timeout_ms % 1000 == 0 {
        format!("{} seconds", timeout_ms / 1000)
    } else {
        format!("{} milliseconds", timeout_ms)
    }
}
