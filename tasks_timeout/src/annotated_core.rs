use crate::{
    config::TimeoutAnnotation,
    error::TimeoutError,
    extension::TasksTimeout,
    metadata::{ClassInfo, InvocationContext, MethodInfo},
    resolve::Phase,
    store::SessionStore,
};
#[cfg(feature = "async")]
use std::future::Future;
use std::{fmt, sync::Arc};

/// Models a module path as a chain of nested classes, innermost last.
fn module_class(module: &str) -> Option<Arc<ClassInfo>> {
    module.split("::").fold(None, |enclosing, segment| {
        let class = ClassInfo::new(segment);
        Some(Arc::new(match enclosing {
            Some(enclosing) => class.nested_in(enclosing),
            None => class,
        }))
    })
}

fn test_context(name: &str, module: &str, annotation: TimeoutAnnotation) -> InvocationContext {
    let method = MethodInfo::new(name).annotated(annotation);
    InvocationContext::new(match module_class(module) {
        Some(class) => method.declared_in(class),
        None => method,
    })
}

/// Fails the calling test, carrying the dump along when the deadline fired.
fn fail(err: TimeoutError) -> ! {
    match err {
        TimeoutError::TimeoutExceeded(exceeded) => panic!(
            "{} while running `{}`\n\n{}",
            exceeded,
            exceeded.label(),
            exceeded.dump()
        ),
        other => panic!("{}", other),
    }
}

#[doc(hidden)]
pub fn local_timeout_core<T, F>(
    name: &str,
    module: &str,
    annotation: TimeoutAnnotation,
    function: F,
) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let timeout = TasksTimeout::annotated();
    let store = SessionStore::new();
    timeout.intercept_construction(&store, || ());

    let ctx = test_context(name, module, annotation);
    match timeout.intercept(Phase::TestMethod, &ctx, &store, function) {
        Ok(value) => value,
        Err(err) => fail(err),
    }
}

/// For tests returning a `Result`. The error is reported on the worker thread, so
/// error types that cannot cross threads (such as `Box<dyn Error>`) still work.
#[doc(hidden)]
pub fn local_timeout_core_with_return<T, E, F>(
    name: &str,
    module: &str,
    annotation: TimeoutAnnotation,
    function: F,
) -> Result<T, E>
where
    T: Send + 'static,
    E: fmt::Debug + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let res = local_timeout_core(name, module, annotation, move || {
        function().map_err(|err| format!("{:?}", err))
    });
    match res {
        Ok(value) => Ok(value),
        Err(err) => panic!("Error: {}", err),
    }
}

#[doc(hidden)]
#[cfg(feature = "async")]
pub async fn local_async_timeout_core<F>(
    name: &str,
    module: &str,
    annotation: TimeoutAnnotation,
    fut: F,
) -> F::Output
where
    F: Future + Send + 'static,
{
    let timeout = TasksTimeout::annotated();
    let store = SessionStore::new();
    timeout.intercept_construction(&store, || ());

    let ctx = test_context(name, module, annotation);
    match timeout
        .intercept_async(Phase::TestMethod, &ctx, &store, fut)
        .await
    {
        Ok(value) => value,
        Err(err) => fail(err),
    }
}
