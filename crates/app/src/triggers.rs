//! Trigger observer — turns state changes into [`TriggerFired`] events.
//!
//! A [`TriggerObserver`] remembers the last snapshot it saw and checks each
//! new one against its [`DieTrigger`]. Matches are sent on an unbounded
//! channel so the host can run automations outside the session worker.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use pixels_dice_domain::die::DieSnapshot;
use pixels_dice_domain::error::PixelsError;
use pixels_dice_domain::id::DieId;
use pixels_dice_domain::trigger::DieTrigger;

use crate::ports::Observer;
use crate::session::DieSession;

/// A trigger matched a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFired {
    pub die: DieId,
    pub trigger: DieTrigger,
    /// State right after the transition.
    pub snapshot: DieSnapshot,
}

pub struct TriggerObserver {
    trigger: DieTrigger,
    previous: Mutex<Option<DieSnapshot>>,
    fired: mpsc::UnboundedSender<TriggerFired>,
}

impl TriggerObserver {
    /// Build an observer and the receiving end of its firings.
    ///
    /// `previous` seeds the transition check; pass `None` when the current
    /// state is unknown.
    #[must_use]
    pub fn new(
        trigger: DieTrigger,
        previous: Option<DieSnapshot>,
    ) -> (Self, mpsc::UnboundedReceiver<TriggerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Self {
            trigger,
            previous: Mutex::new(previous),
            fired: tx,
        };
        (observer, rx)
    }

    /// Register a trigger on `session`, seeded with its current state.
    ///
    /// Keep the returned observer to [`DieSession::unregister`] it later.
    pub fn attach(
        session: &DieSession,
        trigger: DieTrigger,
    ) -> (Arc<dyn Observer>, mpsc::UnboundedReceiver<TriggerFired>) {
        let (observer, rx) = Self::new(trigger, Some(session.snapshot()));
        let observer: Arc<dyn Observer> = Arc::new(observer);
        session.register(Arc::clone(&observer));
        (observer, rx)
    }

    #[must_use]
    pub fn trigger(&self) -> &DieTrigger {
        &self.trigger
    }
}

impl Observer for TriggerObserver {
    fn on_state_changed(&self, snapshot: &DieSnapshot) -> Result<(), PixelsError> {
        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(snapshot.clone());

        if !self.trigger.matches(previous.as_ref(), snapshot) {
            return Ok(());
        }

        tracing::debug!(die = %snapshot.id, trigger = %self.trigger, "trigger fired");
        self.fired
            .send(TriggerFired {
                die: snapshot.id.clone(),
                trigger: self.trigger.clone(),
                snapshot: snapshot.clone(),
            })
            .map_err(|_| PixelsError::Observer("trigger receiver dropped".into()))
    }
}

impl std::fmt::Debug for TriggerObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerObserver")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}
