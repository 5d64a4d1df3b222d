#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unused_variables)]

//! # tasks_timeout
//! Per-test timeouts that, instead of letting a hung test block the run, print
//! what tracked tasks were still alive and fail the test.
//!
//! The simplest use is the [timeout](macro@timeout) attribute:
//! ````
//! #[test]
//! #[tasks_timeout::timeout(secs = 5)]
//! fn test_finishes_in_time() {
//!   // Do things
//! }
//! ````
//! Tasks show up in the dump when they are tracked, either as futures wrapped
//! with [`track`] or as threads holding a [`TaskGuard`] from [`TaskRegistry::enter`].
//!
//! For harnesses with their own lifecycle, [`TasksTimeout`] exposes the
//! interception hooks directly. An instance is either registered with one
//! [`TimeoutConfig`] for everything it intercepts, or annotation-driven and reads
//! [`TimeoutAnnotation`]s from the method and class being run. For each
//! invocation the method annotation wins over the class annotation, and class
//! annotations never apply to lifecycle steps such as [`Phase::BeforeEach`].
//! A registered instance meeting an annotation is an error.
//!
//! ````
//! use std::sync::Arc;
//! use tasks_timeout::{
//!     ClassInfo, InvocationContext, MethodInfo, Phase, SessionStore, TasksTimeout,
//!     TimeoutAnnotation,
//! };
//!
//! let class = Arc::new(ClassInfo::new("Suite").annotated(TimeoutAnnotation::new(1_000)));
//! let timeout = TasksTimeout::annotated();
//! let store = SessionStore::new();
//! timeout.intercept_construction(&store, || ());
//!
//! let set_up = InvocationContext::new(MethodInfo::new("set_up").declared_in(class.clone()));
//! timeout.intercept(Phase::BeforeEach, &set_up, &store, || ()).unwrap();
//!
//! let test = InvocationContext::new(MethodInfo::new("works").declared_in(class));
//! timeout.intercept(Phase::TestMethod, &test, &store, || ()).unwrap();
//! ````
//!
//! ## Feature flags
#![cfg_attr(
    feature = "docsrs",
    doc = document_features::document_features!()
)]

mod activation;
mod annotated_core;
mod config;
mod diagnostics;
mod error;
mod extension;
mod metadata;
mod resolve;
mod store;
mod timed;

#[cfg(test)]
mod testing;

pub use annotated_core::{local_timeout_core, local_timeout_core_with_return};
pub use config::{ConfigSource, TimeoutAnnotation, TimeoutConfig};
pub use diagnostics::{registry, Diagnostics, TaskGuard, TaskRegistry, TaskState};
pub use error::{TimeoutError, TimeoutExceeded};
pub use extension::TasksTimeout;
pub use metadata::{ClassInfo, Invocation, InvocationContext, MethodInfo};
pub use resolve::{resolve, Phase, Policy, Resolution};
pub use store::{CleanupAction, ExtensionStore, SessionStore, StoreValue};
pub use timed::{cancellation_requested, TimedInvoker};

#[cfg(feature = "async")]
pub use annotated_core::local_async_timeout_core;
#[cfg(feature = "async")]
pub use diagnostics::{track, Tracked};

/// Fails the test when it runs longer than the given timeout, after printing a
/// dump of the tasks still running.
///
/// ````
/// #[test]
/// #[tasks_timeout::timeout(100)]
/// fn test_in_milliseconds() {
///   // Do things
/// }
///
/// #[test]
/// #[tasks_timeout::timeout(secs = 2, cancel_on_timeout)]
/// fn test_in_seconds() {
///   // Do things, checking tasks_timeout::cancellation_requested() in long loops
/// }
/// ````
/// The timeout is given either as milliseconds (`100` or `ms = 100`) or as whole
/// seconds (`secs = 2`). With `cancel_on_timeout` the test and every tracked task
/// are asked to stop once the deadline passes; otherwise the test body is left
/// running in the background while the test is failed.
///
/// Works for `async` tests too, and for tests returning a `Result`.
pub use tasks_timeout_derive::timeout;
