//! Observer registry — fan-out of die state changes.

use std::sync::{Arc, Mutex, PoisonError};

use pixels_dice_domain::die::DieSnapshot;

use crate::ports::Observer;

/// Set of observers interested in one die.
///
/// Registering the same observer twice delivers every change twice. Fan-out
/// iterates over a copy of the list, so observers may register or unregister
/// (themselves or others) while being notified.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.lock().push(observer);
    }

    /// Remove one registration of `observer`. Returns `false` if it was not
    /// registered.
    pub fn unregister(&self, observer: &Arc<dyn Observer>) -> bool {
        let mut observers = self.lock();
        match observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(index) => {
                observers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nobody is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Notify every observer of `snapshot`.
    ///
    /// Failing observers are logged and skipped. Returns how many observers
    /// handled the change successfully.
    pub fn notify_all(&self, snapshot: &DieSnapshot) -> usize {
        let observers = self.lock().clone();
        let mut delivered = 0;
        for observer in &observers {
            match observer.on_state_changed(snapshot) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(%err, die = %snapshot.id, "observer failed to handle state change");
                }
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Observer>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("len", &self.len())
            .finish()
    }
}
