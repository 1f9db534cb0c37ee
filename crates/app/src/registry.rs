//! Session registry — explicit ownership of every live [`DieSession`].
//!
//! Hosts create one session per configured die through the registry, look
//! sessions up by id, and shut them all down on exit.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use pixels_dice_domain::die::{ConnectionState, DieConfig};
use pixels_dice_domain::error::{NotFoundError, PixelsError};
use pixels_dice_domain::id::DieId;

use crate::ports::Transport;
use crate::session::DieSession;

/// Live sessions keyed by die id, all driven by the same transport.
pub struct SessionRegistry<T> {
    transport: Arc<T>,
    sessions: RwLock<HashMap<DieId, Arc<DieSession>>>,
}

impl<T: Transport> SessionRegistry<T> {
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a session for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PixelsError::AlreadyExists`] if a session with the same id is
    /// already registered.
    pub fn create(&self, config: DieConfig) -> Result<Arc<DieSession>, PixelsError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&config.id) {
            return Err(PixelsError::AlreadyExists {
                entity: "die",
                id: config.id.to_string(),
            });
        }

        let id = config.id.clone();
        tracing::info!(die = %id, name = %config.name, "registering die");
        let session = Arc::new(DieSession::spawn(config, Arc::clone(&self.transport)));
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, id: &DieId) -> Option<Arc<DieSession>> {
        self.read().get(id).cloned()
    }

    /// Ids of every registered die, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<DieId> {
        let mut ids: Vec<DieId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Connect the die registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PixelsError::NotFound`] for an unknown id. Transport
    /// failures are reported through the returned state instead.
    pub async fn connect(&self, id: &DieId) -> Result<ConnectionState, PixelsError> {
        Ok(self.require(id)?.connect().await)
    }

    /// Disconnect the die registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PixelsError::NotFound`] for an unknown id.
    pub async fn disconnect(&self, id: &DieId) -> Result<ConnectionState, PixelsError> {
        Ok(self.require(id)?.disconnect().await)
    }

    /// Unregister the die and shut its session down.
    ///
    /// # Errors
    ///
    /// Returns [`PixelsError::NotFound`] for an unknown id.
    pub async fn remove(&self, id: &DieId) -> Result<(), PixelsError> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        tracing::info!(die = %id, "unregistering die");
        session.shutdown().await;
        Ok(())
    }

    /// Shut every session down and empty the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<DieSession>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.shutdown().await;
        }
    }

    fn require(&self, id: &DieId) -> Result<Arc<DieSession>, PixelsError> {
        self.get(id).ok_or_else(|| not_found(id))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DieId, Arc<DieSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: &DieId) -> PixelsError {
    NotFoundError {
        entity: "die",
        id: id.to_string(),
    }
    .into()
}

impl<T> std::fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}
