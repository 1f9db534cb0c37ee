//! BLE adapter error types.

use pixels_dice_domain::error::TransportError;

/// Errors specific to the BLE adapter.
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    /// No BLE adapter found on the host.
    #[error("no BLE adapter available")]
    NotAvailable,

    /// The peripheral refused the connection.
    #[error("GATT connection failed")]
    GattConnect(#[source] btleplug::Error),

    /// The peripheral did not accept the connection in time.
    #[error("GATT connection timed out")]
    ConnectTimeout,

    /// Service discovery finished without the requested characteristic.
    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// UUID that was looked up.
        uuid: uuid::Uuid,
    },

    /// Any other btleplug failure.
    #[error("BLE error")]
    Btle(#[from] btleplug::Error),
}

impl BleError {
    /// Convert into a [`TransportError`] for propagation across the port
    /// boundary.
    #[must_use]
    pub fn into_transport(self) -> TransportError {
        match self {
            Self::NotAvailable => TransportError::Unavailable,
            Self::GattConnect(err) => TransportError::ConnectFailed(Box::new(err)),
            Self::ConnectTimeout | Self::Btle(btleplug::Error::TimedOut(_)) => {
                TransportError::Timeout
            }
            Self::CharacteristicNotFound { uuid } => {
                TransportError::CharacteristicNotFound { uuid }
            }
            Self::Btle(btleplug::Error::NotConnected) => TransportError::NotConnected,
            Self::Btle(err) => TransportError::Io(Box::new(err)),
        }
    }
}

impl From<BleError> for TransportError {
    fn from(err: BleError) -> Self {
        err.into_transport()
    }
}
