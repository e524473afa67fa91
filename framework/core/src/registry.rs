use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelHandle;

/// Process-local map from a logical key to the cancellation trigger for an
/// in-flight execution.
///
/// The key is stable across retries of the same logical unit (a PR number or
/// branch name), unlike the run id which changes on every retry. At most one
/// execution is registered per key per process. The registry is never shared
/// across processes; a cancellation that finds no entry here may still be
/// honoured by a different replica.
#[derive(Debug, Default, Clone)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the cancellation trigger for `key`, replacing any
    /// previous registration for the same key.
    ///
    /// The returned guard removes the entry when dropped, which is what
    /// guarantees deregistration on every exit path of an execution.
    pub fn register(&self, key: &str, handle: CancelHandle) -> RegistrationGuard {
        let previous = self.inner.lock().insert(key.to_string(), handle);
        if previous.is_some() {
            log::warn!("Replacing existing cancellation registration for {key}");
        }

        RegistrationGuard {
            registry: self.inner.clone(),
            key: key.to_string(),
        }
    }

    /// Trigger the cancellation registered under `key`, if any.
    ///
    /// Returns whether an entry was found. Absence is not an error: the run
    /// may already have finished, or it may be owned by another replica.
    pub fn cancel(&self, key: &str) -> bool {
        let guard = self.inner.lock();
        match guard.get(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }
}

/// Removes a registration when dropped.
#[must_use]
pub struct RegistrationGuard {
    registry: Arc<Mutex<HashMap<String, CancelHandle>>>,
    key: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}
