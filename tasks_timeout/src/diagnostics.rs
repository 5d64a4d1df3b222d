//! Tracking of running tasks so a hung test can report what was still alive.
//!
//! Tasks are only recorded while the registry is active. Activation is counted, so
//! several sessions may hold it at once and tracking stops with the last one.

#[cfg(feature = "async")]
use futures_util::future::{Abortable, Aborted};
#[cfg(feature = "logging")]
use log::debug;
use once_cell::sync::Lazy;
use std::{
    backtrace::Backtrace,
    fmt::{self, Write as _},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
#[cfg(feature = "async")]
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// The diagnostics collaborator consulted by [`TasksTimeout`](crate::TasksTimeout).
pub trait Diagnostics: Send + Sync {
    fn activate(&self, capture_creation_stack_traces: bool);

    fn deactivate(&self);

    /// Textual snapshot of the tasks being tracked right now.
    fn dump(&self) -> String;

    /// Requests cancellation of every tracked task.
    fn cancel_tracked(&self) {}
}

/// Lifecycle state of a tracked task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Registered but not polled yet.
    Created,
    Running,
    /// Waiting to be woken.
    Suspended,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::Suspended => "SUSPENDED",
        })
    }
}

type Canceller = Arc<dyn Fn() + Send + Sync>;

struct TaskRecord {
    name: String,
    state: TaskState,
    created: Instant,
    creation_trace: Option<Backtrace>,
    cancel: Canceller,
}

static TASK_ID: AtomicU64 = AtomicU64::new(1);

static REGISTRY: Lazy<Arc<TaskRegistry>> = Lazy::new(|| Arc::new(TaskRegistry::new()));

/// The process-wide registry used by default.
pub fn registry() -> Arc<TaskRegistry> {
    REGISTRY.clone()
}

/// Concurrent table of the tasks currently alive.
pub struct TaskRegistry {
    tasks: scc::HashMap<u64, TaskRecord>,
    installs: AtomicUsize,
    capture_creation_stack_traces: AtomicBool,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: scc::HashMap::new(),
            installs: AtomicUsize::new(0),
            capture_creation_stack_traces: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.installs.load(Ordering::SeqCst) > 0
    }

    /// Number of tasks currently tracked.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registers the calling piece of work (typically a thread) as a running task.
    ///
    /// The task stays tracked until the returned guard is dropped. Nothing is
    /// recorded while the registry is inactive, but the guard still works.
    pub fn enter(self: &Arc<Self>, name: &str) -> TaskGuard {
        self.register(name, TaskState::Running, None)
    }

    /// Wraps `future` so it is tracked while it is alive and can be aborted by
    /// [`cancel_tracked`](Diagnostics::cancel_tracked).
    #[cfg(feature = "async")]
    pub fn track<F: Future>(self: &Arc<Self>, name: &str, future: F) -> Tracked<F> {
        let (abortable, handle) = futures_util::future::abortable(future);
        let abort: Canceller = Arc::new(move || handle.abort());
        let guard = self.register(name, TaskState::Created, Some(abort));
        Tracked {
            inner: Box::pin(abortable),
            guard: Some(guard),
        }
    }

    fn register(
        self: &Arc<Self>,
        name: &str,
        state: TaskState,
        abort: Option<Canceller>,
    ) -> TaskGuard {
        let cancelled = Arc::new(AtomicBool::new(false));
        if !self.is_active() {
            return TaskGuard {
                registry: self.clone(),
                id: None,
                cancelled,
            };
        }

        let id = TASK_ID.fetch_add(1, Ordering::SeqCst);
        let flag = cancelled.clone();
        let cancel: Canceller = Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
            if let Some(abort) = &abort {
                abort();
            }
        });
        let creation_trace = if self.capture_creation_stack_traces.load(Ordering::SeqCst) {
            Some(Backtrace::force_capture())
        } else {
            None
        };
        let record = TaskRecord {
            name: name.to_string(),
            state,
            created: Instant::now(),
            creation_trace,
            cancel,
        };
        // ids are unique, so the slot is always free
        let _ = self.tasks.insert(id, record);
        #[cfg(feature = "logging")]
        debug!("Tracking task {:?}#{}", name, id);

        TaskGuard {
            registry: self.clone(),
            id: Some(id),
            cancelled,
        }
    }

    fn set_state(&self, id: u64, state: TaskState) {
        self.tasks.update(&id, |_, record| record.state = state);
    }

    fn forget(&self, id: u64) {
        self.tasks.remove(&id);
    }
}

/// Creation traces are a registry-wide setting: they are captured while any current
/// activation asked for them, and the first activation after an idle period resets it.
impl Diagnostics for TaskRegistry {
    fn activate(&self, capture_creation_stack_traces: bool) {
        let previous = self.installs.fetch_add(1, Ordering::SeqCst);
        if previous == 0 || capture_creation_stack_traces {
            self.capture_creation_stack_traces
                .store(capture_creation_stack_traces, Ordering::SeqCst);
        }
        #[cfg(feature = "logging")]
        debug!("Task tracking activated ({} holder(s))", previous + 1);
    }

    fn deactivate(&self) {
        let previous = self
            .installs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.tasks.clear();
                #[cfg(feature = "logging")]
                debug!("Task tracking deactivated");
            }
            Ok(_) => {}
            Err(_) => {
                #[cfg(feature = "logging")]
                debug!("Ignoring deactivation of inactive task tracking");
            }
        }
    }

    fn dump(&self) -> String {
        if !self.is_active() {
            return "Tasks dump unavailable: task tracking is not active".to_string();
        }

        let mut entries = Vec::new();
        self.tasks.scan(|id, record| {
            let mut entry = format!(
                "Task {:?}#{}, state: {}, age: {:?}",
                record.name,
                id,
                record.state,
                record.created.elapsed()
            );
            if let Some(trace) = &record.creation_trace {
                entry.push_str("\n\tat creation:");
                for line in trace.to_string().lines() {
                    entry.push_str("\n\t");
                    entry.push_str(line);
                }
            }
            entries.push((*id, entry));
        });
        entries.sort_by_key(|(id, _)| *id);

        let mut out = format!("Tasks dump ({} running)", entries.len());
        for (_, entry) in entries {
            let _ = write!(out, "\n\n{}", entry);
        }
        out
    }

    fn cancel_tracked(&self) {
        let mut cancellers = Vec::new();
        self.tasks.scan(|_, record| cancellers.push(record.cancel.clone()));
        #[cfg(feature = "logging")]
        debug!("Cancelling {} tracked task(s)", cancellers.len());
        for cancel in cancellers {
            cancel();
        }
    }
}

/// Keeps a task tracked for as long as it lives.
pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    id: Option<u64>,
    cancelled: Arc<AtomicBool>,
}

impl TaskGuard {
    /// The id shown in dumps, `None` when the registry was inactive at creation.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Whether [`cancel_tracked`](Diagnostics::cancel_tracked) asked this task to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: TaskState) {
        if let Some(id) = self.id {
            self.registry.set_state(id, state);
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.registry.forget(id);
        }
    }
}

/// Tracks `future` in the process-wide registry. See [`TaskRegistry::track`].
#[cfg(feature = "async")]
pub fn track<F: Future>(name: &str, future: F) -> Tracked<F> {
    REGISTRY.track(name, future)
}

/// A future tracked by a [`TaskRegistry`]. Resolves to `Err(Aborted)` if it was
/// cancelled through the registry.
#[cfg(feature = "async")]
pub struct Tracked<F> {
    inner: Pin<Box<Abortable<F>>>,
    guard: Option<TaskGuard>,
}

#[cfg(feature = "async")]
impl<F: Future> Future for Tracked<F> {
    type Output = Result<F::Output, Aborted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(guard) = &this.guard {
            guard.set_state(TaskState::Running);
        }
        let poll = this.inner.as_mut().poll(cx);
        match &poll {
            Poll::Ready(_) => this.guard = None,
            Poll::Pending => {
                if let Some(guard) = &this.guard {
                    guard.set_state(TaskState::Suspended);
                }
            }
        }
        poll
    }
}
