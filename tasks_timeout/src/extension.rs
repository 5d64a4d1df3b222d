use crate::{
    activation::{ensure_activated, ActiveSession},
    config::TimeoutConfig,
    diagnostics::{registry, Diagnostics},
    error::{TimeoutError, TimeoutExceeded},
    metadata::{Invocation, InvocationContext},
    resolve::{resolve, Phase, Resolution},
    store::ExtensionStore,
    timed::TimedInvoker,
};
#[cfg(feature = "logging")]
use log::debug;
#[cfg(feature = "async")]
use std::future::Future;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

static INSTANCE_ID: AtomicU32 = AtomicU32::new(1);

/// Intercepts test and lifecycle invocations and applies at most one timeout to each.
///
/// An instance is either *registered* with a fixed [`TimeoutConfig`] or
/// *annotation-driven*, reading timeouts from the method and class being run.
/// Mixing both for the same invocation fails with
/// [`TimeoutError::ConfigurationConflict`].
///
/// ````
/// use tasks_timeout::{InvocationContext, MethodInfo, Phase, SessionStore, TasksTimeout};
///
/// let timeout = TasksTimeout::seconds(2);
/// let store = SessionStore::new();
/// let ctx = InvocationContext::new(MethodInfo::new("adds"));
/// let sum = timeout
///     .intercept(Phase::TestMethod, &ctx, &store, || 2 + 2)
///     .unwrap();
/// assert_eq!(sum, 4);
/// ````
pub struct TasksTimeout {
    id: u32,
    registration: Option<TimeoutConfig>,
    capture_creation_stack_traces: bool,
    diagnostics: Arc<dyn Diagnostics>,
}

impl TasksTimeout {
    /// An instance that applies `config` to every invocation it intercepts.
    pub fn registered(config: TimeoutConfig) -> Self {
        Self::build(Some(config))
    }

    /// Registered with a timeout of `timeout_ms` milliseconds that leaves work running.
    pub fn millis(timeout_ms: u64) -> Self {
        Self::registered(TimeoutConfig::millis(timeout_ms))
    }

    /// Registered with a timeout of whole seconds that leaves work running.
    pub fn seconds(secs: u32) -> Self {
        Self::registered(TimeoutConfig::seconds(secs))
    }

    /// An instance that reads its timeouts from [`TimeoutAnnotation`](crate::TimeoutAnnotation)s.
    pub fn annotated() -> Self {
        Self::build(None)
    }

    fn build(registration: Option<TimeoutConfig>) -> Self {
        Self {
            id: INSTANCE_ID.fetch_add(1, Ordering::SeqCst),
            registration,
            capture_creation_stack_traces: true,
            diagnostics: registry(),
        }
    }

    /// Whether tracked tasks record where they were created. On by default.
    pub fn creation_stack_traces(mut self, enabled: bool) -> Self {
        self.capture_creation_stack_traces = enabled;
        self
    }

    /// Replaces the process-wide [`TaskRegistry`](crate::TaskRegistry).
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn registration(&self) -> Option<TimeoutConfig> {
        self.registration
    }

    /// Resolves the timeout that applies to `ctx` in `phase`, without running anything.
    pub fn resolve(
        &self,
        phase: Phase,
        ctx: &InvocationContext,
    ) -> Result<Resolution, TimeoutError> {
        let resolution = resolve(self.registration, phase, ctx)?;
        #[cfg(feature = "logging")]
        debug!(
            "Timeout for {:?} ({:?}) resolved from {:?}",
            ctx.method().name(),
            phase,
            resolution.source()
        );
        Ok(resolution)
    }

    /// Hook for the construction of the test class: activates diagnostics for this
    /// instance's session the first time, then proceeds.
    pub fn intercept_construction<T>(
        &self,
        store: &dyn ExtensionStore,
        invocation: impl Invocation<T>,
    ) -> T {
        self.activate(store);
        invocation.proceed()
    }

    /// Hook for every other phase. Blocks until the invocation finishes or times out.
    pub fn intercept<T, I>(
        &self,
        phase: Phase,
        ctx: &InvocationContext,
        store: &dyn ExtensionStore,
        invocation: I,
    ) -> Result<T, TimeoutError>
    where
        T: Send + 'static,
        I: Invocation<T> + Send + 'static,
    {
        match self.resolve(phase, ctx)? {
            Resolution::ProceedUnmodified => Ok(invocation.proceed()),
            Resolution::Timed { config, .. } => {
                let lease = self.activate(store).lease();
                self.invoker().run(
                    ctx.method().name(),
                    config.timeout_ms(),
                    config.cancels_on_timeout(),
                    TimeoutExceeded::new,
                    move || {
                        let _lease = lease;
                        invocation.proceed()
                    },
                )
            }
        }
    }

    /// Async counterpart of [`intercept`](Self::intercept). The invocation is polled
    /// by the caller's executor, timed or not.
    #[cfg(feature = "async")]
    pub async fn intercept_async<F>(
        &self,
        phase: Phase,
        ctx: &InvocationContext,
        store: &dyn ExtensionStore,
        invocation: F,
    ) -> Result<F::Output, TimeoutError>
    where
        F: Future + Send + 'static,
    {
        match self.resolve(phase, ctx)? {
            Resolution::ProceedUnmodified => Ok(invocation.await),
            Resolution::Timed { config, .. } => {
                let lease = self.activate(store).lease();
                self.invoker()
                    .run_async(
                        ctx.method().name(),
                        config.timeout_ms(),
                        config.cancels_on_timeout(),
                        TimeoutExceeded::new,
                        async move {
                            let _lease = lease;
                            invocation.await
                        },
                    )
                    .await
            }
        }
    }

    fn activate(&self, store: &dyn ExtensionStore) -> Arc<ActiveSession> {
        ensure_activated(
            store,
            self.id,
            &self.diagnostics,
            self.capture_creation_stack_traces,
        )
    }

    fn invoker(&self) -> TimedInvoker {
        TimedInvoker::new(self.diagnostics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::TasksTimeout;
    use crate::{
        config::{TimeoutAnnotation, TimeoutConfig},
        error::TimeoutError,
        metadata::{ClassInfo, InvocationContext, MethodInfo},
        resolve::Phase,
        store::SessionStore,
        testing::{init, RecordingDiagnostics},
    };
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    };

    fn with_recording(timeout: TasksTimeout) -> (TasksTimeout, Arc<RecordingDiagnostics>) {
        init();
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        (timeout.with_diagnostics(diagnostics.clone()), diagnostics)
    }

    fn method_ctx(method: MethodInfo) -> InvocationContext {
        InvocationContext::new(method.declared_in(Arc::new(ClassInfo::new("Suite"))))
    }

    fn annotated_suite(timeout_ms: u64) -> Arc<ClassInfo> {
        Arc::new(ClassInfo::new("Suite").annotated(TimeoutAnnotation::new(timeout_ms)))
    }

    #[test]
    fn seconds_entry_point_converts_to_millis() {
        assert_eq!(
            TasksTimeout::seconds(2).registration(),
            Some(TimeoutConfig::millis(2000).cancel_on_timeout(false))
        );
        assert_eq!(TasksTimeout::annotated().registration(), None);
    }

    #[test]
    fn instances_get_distinct_ids() {
        assert_ne!(TasksTimeout::annotated().id, TasksTimeout::annotated().id);
    }

    #[test]
    fn unannotated_lifecycle_step_is_transparent() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::annotated());
        let store = SessionStore::new();
        let ctx = InvocationContext::new(MethodInfo::new("set_up").declared_in(annotated_suite(100)));
        let caller = thread::current().id();
        let ran_on = timeout
            .intercept(Phase::BeforeEach, &ctx, &store, move || thread::current().id())
            .unwrap();
        assert_eq!(ran_on, caller);
        assert_eq!(diagnostics.activations(), 0);

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = timeout.intercept(Phase::BeforeEach, &ctx, &store, || -> () {
                panic!("set up failed")
            });
        }));
        assert_eq!(res.unwrap_err().downcast_ref::<&str>(), Some(&"set up failed"));
    }

    #[test]
    fn class_annotation_binds_test_methods() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::annotated());
        let store = SessionStore::new();
        let ctx = InvocationContext::new(MethodInfo::new("hangs").declared_in(annotated_suite(100)));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let err = timeout
            .intercept(Phase::TestMethod, &ctx, &store, move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
            })
            .unwrap_err();
        let _ = release_tx.send(());
        match err {
            TimeoutError::TimeoutExceeded(failure) => {
                assert_eq!(failure.timeout_ms(), 100);
                assert_eq!(failure.label(), "hangs");
                assert_eq!(failure.dump(), "dump #1");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(diagnostics.activations(), 1);
    }

    #[test]
    fn method_annotation_wins_over_class() {
        let (timeout, _) = with_recording(TasksTimeout::annotated());
        let store = SessionStore::new();
        let ctx = InvocationContext::new(
            MethodInfo::new("quick")
                .annotated(TimeoutAnnotation::new(100))
                .declared_in(annotated_suite(5000)),
        );
        let err = timeout
            .intercept(Phase::TestMethod, &ctx, &store, || {
                thread::sleep(Duration::from_millis(1500))
            })
            .unwrap_err();
        match err {
            TimeoutError::TimeoutExceeded(failure) => assert_eq!(failure.timeout_ms(), 100),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn conflict_never_runs_the_work() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::millis(1000));
        let store = SessionStore::new();
        let ctx = method_ctx(MethodInfo::new("annotated").annotated(TimeoutAnnotation::new(10)));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let err = timeout
            .intercept(Phase::TestMethod, &ctx, &store, move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap_err();
        assert!(matches!(err, TimeoutError::ConfigurationConflict { .. }));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(diagnostics.activations(), 0);
    }

    #[test]
    fn missing_annotation_is_reported() {
        let (timeout, _) = with_recording(TasksTimeout::annotated());
        let store = SessionStore::new();
        let err = timeout
            .intercept(Phase::TestMethod, &method_ctx(MethodInfo::new("lost")), &store, || ())
            .unwrap_err();
        assert!(matches!(err, TimeoutError::ResolutionInconsistency { .. }));
    }

    #[test]
    fn registered_timeout_passes_results_through() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::seconds(5));
        let store = SessionStore::new();
        let ctx = method_ctx(MethodInfo::new("fallible"));
        let res = timeout
            .intercept(Phase::TestMethod, &ctx, &store, || "nope".parse::<u32>())
            .unwrap();
        assert!(res.is_err());
        assert_eq!(diagnostics.dumps(), 0);
    }

    #[test]
    fn activation_happens_once_per_session() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::seconds(5));
        let store = SessionStore::new();
        let ctx = method_ctx(MethodInfo::new("repeated"));
        for i in 0..5 {
            assert_eq!(timeout.intercept_construction(&store, move || i), i);
            assert_eq!(
                timeout.intercept(Phase::TestMethod, &ctx, &store, move || i * 2).unwrap(),
                i * 2
            );
        }
        assert_eq!(diagnostics.activations(), 1);
        assert_eq!(diagnostics.deactivations(), 0);
        store.close();
        assert_eq!(diagnostics.deactivations(), 1);
    }

    #[test]
    fn detached_work_keeps_the_session_alive() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::millis(20));
        let store = SessionStore::new();
        let ctx = method_ctx(MethodInfo::new("detached"));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let err = timeout
            .intercept(Phase::TestMethod, &ctx, &store, move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                let _ = done_tx.send(());
            })
            .unwrap_err();
        assert!(err.is_timeout());

        store.close();
        assert_eq!(diagnostics.deactivations(), 0);
        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        // the lease goes with the worker's closure, just after it reports
        let mut waited = Duration::ZERO;
        while diagnostics.deactivations() == 0 && waited < Duration::from_secs(10) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(diagnostics.deactivations(), 1);
    }

    #[test]
    fn separate_instances_activate_separately() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let store = SessionStore::new();
        for _ in 0..2 {
            let timeout = TasksTimeout::annotated().with_diagnostics(diagnostics.clone());
            timeout.intercept_construction(&store, || ());
            timeout.intercept_construction(&store, || ());
        }
        assert_eq!(diagnostics.activations(), 2);
        drop(store);
        assert_eq!(diagnostics.deactivations(), 2);
    }

    #[test]
    #[cfg(feature = "async")]
    fn async_interception_follows_the_same_rules() {
        let (timeout, diagnostics) = with_recording(TasksTimeout::annotated());
        let store = SessionStore::new();
        let annotated = method_ctx(MethodInfo::new("async_quick").annotated(TimeoutAnnotation::new(50)));

        let value = futures_executor::block_on(timeout.intercept_async(
            Phase::TestMethod,
            &annotated,
            &store,
            async { 5 },
        ))
        .unwrap();
        assert_eq!(value, 5);

        let err = futures_executor::block_on(timeout.intercept_async(
            Phase::TestMethod,
            &annotated,
            &store,
            futures_util::future::pending::<()>(),
        ))
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(diagnostics.activations(), 1);
        assert_eq!(diagnostics.dumps(), 1);
    }
}
