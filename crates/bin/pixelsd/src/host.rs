//! Host wiring — one session per configured die, plus the policies the
//! session layer leaves to its host (state logging, autoconnect).

use std::sync::Arc;

use tokio::task::JoinSet;

use pixels_dice_app::ports::Transport;
use pixels_dice_app::registry::SessionRegistry;
use pixels_dice_domain::die::{ConnectionState, DieConfig, DieSnapshot};
use pixels_dice_domain::error::PixelsError;
use pixels_dice_domain::id::DieId;

pub struct Host<T> {
    registry: SessionRegistry<T>,
}

impl<T: Transport> Host<T> {
    /// Start a session for every die and attach the state logger.
    ///
    /// # Errors
    ///
    /// Returns [`PixelsError::AlreadyExists`] when two dice share an id.
    pub fn start(transport: Arc<T>, dice: Vec<DieConfig>) -> Result<Self, PixelsError> {
        let registry = SessionRegistry::new(transport);
        for config in dice {
            let session = registry.create(config)?;
            session.register(Arc::new(log_state_change));
        }
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &SessionRegistry<T> {
        &self.registry
    }

    /// Connect every die configured with `autoconnect`, concurrently.
    pub fn autoconnect(&self) -> JoinSet<(DieId, ConnectionState)> {
        let mut connects = JoinSet::new();
        for id in self.registry.ids() {
            let Some(session) = self.registry.get(&id) else {
                continue;
            };
            if !session.config().autoconnect {
                continue;
            }
            connects.spawn(async move { (id, session.connect().await) });
        }
        connects
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

#[allow(clippy::unnecessary_wraps)]
fn log_state_change(snapshot: &DieSnapshot) -> Result<(), PixelsError> {
    tracing::info!(
        die = %snapshot.id,
        connection = ?snapshot.connection,
        roll = ?snapshot.roll,
        face = ?snapshot.face,
        battery = ?snapshot.battery_level,
        rssi = ?snapshot.rssi,
        "die state changed"
    );
    Ok(())
}
