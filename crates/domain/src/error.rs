//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts via `#[from]`.
//! Transport failures are not surfaced to callers of `connect`/`disconnect`;
//! the session maps them onto a [`ConnectionState`](crate::die::ConnectionState).

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error for registry, configuration and observer failures.
#[derive(Debug, thiserror::Error)]
pub enum PixelsError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A looked-up item does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// An item with the same identifier is already registered.
    #[error("{entity} with id {id} already exists")]
    AlreadyExists {
        /// Kind of item (e.g. `"Die"`).
        entity: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// A transport-level failure.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// An observer failed to handle a state change.
    #[error("observer failed")]
    Observer(#[source] BoxError),
}

/// Domain validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A die name must not be empty.
    #[error("name must not be empty")]
    EmptyName,

    /// A die identifier must not be empty.
    #[error("id must not be empty")]
    EmptyId,
}

/// A looked-up item does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    /// Kind of item (e.g. `"Die"`).
    pub entity: &'static str,
    /// The identifier that was looked up.
    pub id: String,
}

/// Failures reported by a BLE transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No BLE adapter is available on the host.
    #[error("no BLE adapter available")]
    Unavailable,

    /// The peripheral rejected or could not establish the connection.
    #[error("connection could not be established")]
    ConnectFailed(#[source] BoxError),

    /// The transport gave up waiting for the peripheral.
    #[error("transport operation timed out")]
    Timeout,

    /// The link is no longer connected.
    #[error("peripheral not connected")]
    NotConnected,

    /// The peripheral does not expose the requested characteristic.
    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// UUID that was looked up.
        uuid: uuid::Uuid,
    },

    /// Any other I/O failure in the underlying BLE stack.
    #[error("transport I/O error")]
    Io(#[source] BoxError),
}

impl TransportError {
    /// Whether this failure means the connection attempt itself was refused
    /// or timed out, as opposed to an unexpected error along the way.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::ConnectFailed(_) | Self::Timeout)
    }
}
