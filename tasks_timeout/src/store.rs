#[cfg(feature = "logging")]
use log::debug;
use parking_lot::Mutex;
use std::{any::Any, collections::HashMap, sync::Arc};

/// Value kept in an [`ExtensionStore`].
pub type StoreValue = Arc<dyn Any + Send + Sync>;

/// Action run by the host when the session owning a store ends.
pub type CleanupAction = Box<dyn FnOnce() + Send>;

/// Session-scoped key/value storage provided by the host framework.
pub trait ExtensionStore {
    fn get(&self, key: &str) -> Option<StoreValue>;

    fn put(&self, key: &str, value: StoreValue);

    /// Registers `action` to run once when the session ends.
    fn register_cleanup(&self, action: CleanupAction);
}

/// In-process [`ExtensionStore`] whose session ends on [`close`](Self::close) or drop.
///
/// Cleanup actions run in reverse registration order, at most once.
#[derive(Default)]
pub struct SessionStore {
    values: Mutex<HashMap<String, StoreValue>>,
    cleanups: Mutex<Vec<CleanupAction>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the session: runs the registered cleanups, then forgets every value.
    pub fn close(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        #[cfg(feature = "logging")]
        debug!("Closing session store with {} cleanup action(s)", cleanups.len());
        for action in cleanups.into_iter().rev() {
            action();
        }
        let values = std::mem::take(&mut *self.values.lock());
        drop(values);
    }
}

impl ExtensionStore for SessionStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: StoreValue) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn register_cleanup(&self, action: CleanupAction) {
        self.cleanups.lock().push(action);
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.close();
    }
}
