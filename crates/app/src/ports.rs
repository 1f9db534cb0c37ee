//! Port definitions — traits that adapters and hosts implement.
//!
//! Ports are the boundaries between the session manager and the outside world.
//! They are defined here (in `app`) so that both the session layer and the
//! adapter layer can depend on them without creating circular dependencies.

pub mod observer;
pub mod transport;

pub use observer::Observer;
pub use transport::{AdvertisementSubscription, FrameSink, SightingSink, Transport};
