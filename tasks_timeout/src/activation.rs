use crate::{diagnostics::Diagnostics, store::ExtensionStore};
#[cfg(feature = "logging")]
use log::debug;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// Marker stored once diagnostics have been activated for one instance's session.
///
/// The session itself holds one share, released by the store's cleanup action.
/// Timed work holds a [`SessionLease`] each, so work left running after a timeout
/// keeps diagnostics active until it finishes. Deactivation happens when the last
/// share goes, and only once.
pub(crate) struct ActiveSession {
    diagnostics: Arc<dyn Diagnostics>,
    #[cfg_attr(not(feature = "logging"), allow(dead_code))]
    owner: u32,
    holders: AtomicUsize,
    deactivated: AtomicBool,
}

impl ActiveSession {
    pub(crate) fn lease(self: &Arc<Self>) -> SessionLease {
        self.holders.fetch_add(1, Ordering::SeqCst);
        SessionLease(self.clone())
    }

    fn release(&self) {
        if self.holders.fetch_sub(1, Ordering::SeqCst) == 1
            && !self.deactivated.swap(true, Ordering::SeqCst)
        {
            #[cfg(feature = "logging")]
            debug!("Deactivating diagnostics for timeout instance {}", self.owner);
            self.diagnostics.deactivate();
        }
    }
}

/// One share of an [`ActiveSession`], released on drop.
pub(crate) struct SessionLease(Arc<ActiveSession>);

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub(crate) fn session_key(owner: u32) -> String {
    format!("tasks_timeout/{}/diagnostics", owner)
}

/// Activates `diagnostics` for `owner` unless its store slot already holds a session.
pub(crate) fn ensure_activated(
    store: &dyn ExtensionStore,
    owner: u32,
    diagnostics: &Arc<dyn Diagnostics>,
    capture_creation_stack_traces: bool,
) -> Arc<ActiveSession> {
    let key = session_key(owner);
    if let Some(session) = store
        .get(&key)
        .and_then(|value| value.downcast::<ActiveSession>().ok())
    {
        return session;
    }

    #[cfg(feature = "logging")]
    debug!("Activating diagnostics for timeout instance {}", owner);
    diagnostics.activate(capture_creation_stack_traces);
    let session = Arc::new(ActiveSession {
        diagnostics: diagnostics.clone(),
        owner,
        holders: AtomicUsize::new(1),
        deactivated: AtomicBool::new(false),
    });
    store.put(&key, session.clone());
    let closing = session.clone();
    store.register_cleanup(Box::new(move || closing.release()));
    session
}
