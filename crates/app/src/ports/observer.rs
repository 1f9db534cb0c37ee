//! Observer port — host-side units notified of die state changes.

use pixels_dice_domain::die::DieSnapshot;
use pixels_dice_domain::error::PixelsError;

/// Something interested in a die's state, e.g. one UI-visible attribute.
///
/// Called from the session worker after every state change, in the order the
/// changes were applied. Implementations must not block: hand heavy work off
/// to a task or channel.
pub trait Observer: Send + Sync {
    /// React to the new state.
    ///
    /// # Errors
    ///
    /// Any error is logged by the session; it never stops delivery to other
    /// observers.
    fn on_state_changed(&self, snapshot: &DieSnapshot) -> Result<(), PixelsError>;
}

impl<F> Observer for F
where
    F: Fn(&DieSnapshot) -> Result<(), PixelsError> + Send + Sync,
{
    fn on_state_changed(&self, snapshot: &DieSnapshot) -> Result<(), PixelsError> {
        self(snapshot)
    }
}
