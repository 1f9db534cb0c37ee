//! Transport port — the BLE central role a die session drives.
//!
//! An adapter (btleplug, virtual, …) implements [`Transport`]. The session
//! only ever talks to the die through it:
//!
//! 1. [`find_device`](Transport::find_device) — look up an advertising die by name
//! 2. [`open`](Transport::open) / [`is_connected`](Transport::is_connected) — establish a link
//! 3. [`subscribe`](Transport::subscribe) — receive notification frames through a [`FrameSink`]
//! 4. [`write`](Transport::write) / [`read`](Transport::read) — requests
//! 5. [`unsubscribe`](Transport::unsubscribe) / [`close`](Transport::close) — tear down
//!
//! Independently, [`watch_advertisements`](Transport::watch_advertisements)
//! reports every sighting of the die through a [`SightingSink`], connected
//! or not.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use pixels_dice_domain::die::Sighting;
use pixels_dice_domain::error::TransportError;

/// Handle returned by [`Transport::watch_advertisements`].
///
/// Cancelling consumes the handle, so a subscription can only be cancelled
/// once. Implementations should also stop delivery when dropped.
pub trait AdvertisementSubscription: Send + Sync + 'static {
    /// Stop delivering sightings.
    fn cancel(self);
}

/// A BLE central able to reach Pixels dice.
pub trait Transport: Send + Sync + 'static {
    /// A discovered, not yet connected peripheral.
    type Device: Send + Sync + 'static;
    /// An open connection to a peripheral.
    type Link: Send + Sync + 'static;
    /// Advertisement subscription handle.
    type Subscription: AdvertisementSubscription;

    /// Look up a die advertising `name` among currently known devices.
    fn find_device(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Self::Device>, TransportError>> + Send;

    /// Open a connection to `device`.
    ///
    /// Refusals and timeouts must be reported as
    /// [`TransportError::ConnectFailed`] / [`TransportError::Timeout`].
    fn open(
        &self,
        device: &Self::Device,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;

    /// Whether the link is still connected.
    fn is_connected(
        &self,
        link: &Self::Link,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Start delivering notifications of `characteristic` to `sink`, and
    /// report through [`FrameSink::link_lost`] if the peripheral drops the
    /// link afterwards.
    fn subscribe(
        &self,
        link: &Self::Link,
        characteristic: uuid::Uuid,
        sink: FrameSink,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop delivering notifications of `characteristic`.
    fn unsubscribe(
        &self,
        link: &Self::Link,
        characteristic: uuid::Uuid,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write `bytes` to `characteristic`.
    fn write(
        &self,
        link: &Self::Link,
        characteristic: uuid::Uuid,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Read the current value of `characteristic`.
    fn read(
        &self,
        link: &Self::Link,
        characteristic: uuid::Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Close the link, releasing the underlying connection.
    fn close(&self, link: Self::Link) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Report every advertisement of a die named `name` to `sink` until the
    /// returned subscription is cancelled.
    fn watch_advertisements(
        &self,
        name: &str,
        sink: SightingSink,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;

    /// The most recent sighting of `name` the adapter already knows about.
    ///
    /// The default implementation knows none.
    fn last_sighting(&self, _name: &str) -> impl Future<Output = Option<Sighting>> + Send {
        async { None }
    }
}

/// Destination for raw notification frames.
///
/// Cheap to clone and callable from any thread or task. [`push`](Self::push)
/// returns `false` once nobody is listening any more, so adapters can stop
/// pumping. Adapters call [`link_lost`](Self::link_lost) when the peripheral
/// drops the connection on its own.
#[derive(Clone)]
pub struct FrameSink {
    deliver: Arc<dyn Fn(Vec<u8>) -> bool + Send + Sync>,
    lost: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl FrameSink {
    /// Wrap a delivery function.
    pub fn new(deliver: impl Fn(Vec<u8>) -> bool + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
            lost: None,
        }
    }

    /// Run `lost` when the adapter reports the link gone.
    #[must_use]
    pub fn on_link_lost(mut self, lost: impl Fn() + Send + Sync + 'static) -> Self {
        self.lost = Some(Arc::new(lost));
        self
    }

    /// Hand one frame over. Returns `false` when the receiver is gone.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        (self.deliver)(frame)
    }

    /// Report that the peripheral disconnected without being asked to.
    pub fn link_lost(&self) {
        if let Some(lost) = &self.lost {
            lost();
        }
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").finish_non_exhaustive()
    }
}

/// Destination for advertisement sightings.
#[derive(Clone)]
pub struct SightingSink {
    deliver: Arc<dyn Fn(Sighting) -> bool + Send + Sync>,
}

impl SightingSink {
    /// Wrap a delivery function.
    pub fn new(deliver: impl Fn(Sighting) -> bool + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Hand one sighting over. Returns `false` when the receiver is gone.
    pub fn push(&self, sighting: Sighting) -> bool {
        (self.deliver)(sighting)
    }
}

impl fmt::Debug for SightingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SightingSink").finish_non_exhaustive()
    }
}
