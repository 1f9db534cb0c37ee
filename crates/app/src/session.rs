//! Die session — connection lifecycle, frame decoding and presence tracking
//! for one die.
//!
//! Each [`DieSession`] owns a worker task. The worker is the only place the
//! die's [`DieSnapshot`] and transport link are mutated:
//!
//! - control calls (`connect`, `disconnect`, battery requests) arrive on a
//!   command channel and are answered through oneshot replies;
//! - notification frames, link losses and advertisement sightings arrive on
//!   an inbound channel fed by the [`FrameSink`] / [`SightingSink`] handed to
//!   the transport;
//! - presence expires on a timer armed from the last sighting.
//!
//! Transport I/O is awaited inside the worker, so a frame can never observe a
//! half-finished `connect`, and every observer sees changes in the order they
//! were applied. Battery writes and reads are bounded by [`REQUEST_TIMEOUT`]
//! so a silent die cannot wedge the worker. Sinks only hold weak senders:
//! dropping the last [`DieSession`] stops the worker, which closes the link
//! and cancels the advertisement subscription.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use pixels_dice_domain::die::{ConnectionState, DieConfig, DieSnapshot, RollPhase, Sighting};
use pixels_dice_domain::protocol::{
    self, BATTERY_LEVEL_CHARACTERISTIC, Message, NOTIFY_CHARACTERISTIC, Request,
    WRITE_CHARACTERISTIC,
};
use pixels_dice_domain::time;

use crate::observer::ObserverRegistry;
use crate::ports::{AdvertisementSubscription, FrameSink, Observer, SightingSink, Transport};

/// Upper bound on one battery write or read.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound messages handled back to back before a queued command gets a turn.
const INBOUND_BATCH: usize = 64;

enum Command {
    Connect(oneshot::Sender<ConnectionState>),
    Disconnect(oneshot::Sender<ConnectionState>),
    RequestBattery(oneshot::Sender<bool>),
    ReadBattery(oneshot::Sender<Option<u8>>),
    SetAutoconnect(bool, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Inbound {
    Frame { epoch: u64, bytes: Vec<u8> },
    LinkLost { epoch: u64 },
    Sighting(Sighting),
}

/// Handle to one tracked die.
///
/// All methods are safe to call concurrently; the worker serialises them.
/// Transport failures never surface as errors: they end up in
/// [`DieSnapshot::connection`].
pub struct DieSession {
    config: DieConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<DieSnapshot>,
    observers: Arc<ObserverRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DieSession {
    /// Start a session for `config` on `transport`.
    ///
    /// The worker immediately starts watching advertisements for the die's
    /// name. `autoconnect` is only stored; nothing here connects on its own.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<T: Transport>(config: DieConfig, transport: Arc<T>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let snapshot = DieSnapshot::new(&config);
        let (state_tx, state_rx) = watch::channel(snapshot.clone());
        let observers = Arc::new(ObserverRegistry::new());

        let worker = Worker {
            config: config.clone(),
            transport,
            snapshot,
            link: None,
            epoch: 0,
            advertisements: None,
            presence_deadline: None,
            observers: Arc::clone(&observers),
            state: state_tx,
            inbound: inbound_tx,
        };
        let handle = tokio::spawn(worker.run(commands_rx, inbound_rx));

        tracing::debug!(die = %config.id, name = %config.name, "die session started");

        Self {
            config,
            commands: commands_tx,
            state: state_rx,
            observers,
            worker: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DieConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> DieSnapshot {
        self.state.borrow().clone()
    }

    /// Watch the state without registering an [`Observer`].
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DieSnapshot> {
        self.state.clone()
    }

    /// Whether the die was heard within its presence window.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.state.borrow().present
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    pub fn unregister(&self, observer: &Arc<dyn Observer>) -> bool {
        self.observers.unregister(observer)
    }

    /// Discover the die by name and connect to it.
    ///
    /// Emits `Connecting`, then exactly one final state: `Connected`,
    /// `NotFound`, `ConnectFailed` or `Error`. Once connected, a battery
    /// request is written before this returns.
    pub async fn connect(&self) -> ConnectionState {
        match self.request(Command::Connect).await {
            Some(state) => state,
            None => self.snapshot().connection,
        }
    }

    /// Tear down the notification subscription and close the link.
    ///
    /// A no-op (no emission) when nothing is connected.
    pub async fn disconnect(&self) -> ConnectionState {
        match self.request(Command::Disconnect).await {
            Some(state) => state,
            None => self.snapshot().connection,
        }
    }

    /// Ask the die to report its battery. Returns whether the request was
    /// written; the answer arrives later as a notification.
    pub async fn request_battery(&self) -> bool {
        self.request(Command::RequestBattery)
            .await
            .unwrap_or(false)
    }

    /// Read the standard battery level characteristic.
    ///
    /// Returns `None` when not connected or the read failed.
    pub async fn read_battery_level(&self) -> Option<u8> {
        self.request(Command::ReadBattery).await.flatten()
    }

    /// Store the autoconnect policy flag.
    pub async fn set_autoconnect(&self, autoconnect: bool) {
        self.request(|done| Command::SetAutoconnect(autoconnect, done))
            .await;
    }

    /// Close the link, cancel advertisement tracking and stop the worker.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.request(Command::Shutdown).await;
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(err) = handle.await {
            tracing::warn!(%err, die = %self.config.id, "die session worker ended abnormally");
        }
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).is_err() {
            tracing::debug!(die = %self.config.id, "die session already stopped");
            return None;
        }
        rx.await.ok()
    }
}

impl std::fmt::Debug for DieSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DieSession")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}

struct ActiveLink<L> {
    link: L,
    /// Subscription generation; frames from older generations are dropped.
    epoch: u64,
}

struct Worker<T: Transport> {
    config: DieConfig,
    transport: Arc<T>,
    snapshot: DieSnapshot,
    link: Option<ActiveLink<T::Link>>,
    epoch: u64,
    advertisements: Option<T::Subscription>,
    /// When `snapshot.present` runs out, if it is set.
    presence_deadline: Option<Instant>,
    observers: Arc<ObserverRegistry>,
    state: watch::Sender<DieSnapshot>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl<T: Transport> Worker<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        self.activate().await;

        let mut streak = 0;
        loop {
            if streak >= INBOUND_BATCH {
                streak = 0;
                match commands.try_recv() {
                    Ok(command) => {
                        if self.dispatch(command).await.is_break() {
                            return;
                        }
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }
            }

            let expiry = self.presence_deadline;
            tokio::select! {
                biased;
                Some(message) = inbound.recv() => {
                    streak += 1;
                    self.handle_inbound(message).await;
                }
                () = tokio::time::sleep_until(expiry.unwrap_or_else(Instant::now)), if expiry.is_some() => {
                    self.expire_presence();
                }
                command = commands.recv() => {
                    streak = 0;
                    let Some(command) = command else {
                        break;
                    };
                    if self.dispatch(command).await.is_break() {
                        return;
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn dispatch(&mut self, command: Command) -> ControlFlow<()> {
        if let Command::Shutdown(done) = command {
            self.teardown().await;
            let _ = done.send(());
            return ControlFlow::Break(());
        }
        self.handle_command(command).await;
        ControlFlow::Continue(())
    }

    async fn activate(&mut self) {
        if let Some(sighting) = self.transport.last_sighting(&self.config.name).await {
            self.record_sighting(&sighting);
            self.publish();
        }

        let sink = self.sighting_sink();
        match self
            .transport
            .watch_advertisements(&self.config.name, sink)
            .await
        {
            Ok(subscription) => self.advertisements = Some(subscription),
            Err(err) => {
                tracing::warn!(%err, die = %self.config.id, "failed to watch advertisements, presence will not update");
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(subscription) = self.advertisements.take() {
            subscription.cancel();
        }
        if self.link.is_some() {
            self.release_link().await;
            self.set_connection(ConnectionState::Disconnected);
        }
        tracing::debug!(die = %self.config.id, "die session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(done) => {
                let state = self.connect().await;
                let _ = done.send(state);
            }
            Command::Disconnect(done) => {
                let state = self.disconnect().await;
                let _ = done.send(state);
            }
            Command::RequestBattery(done) => {
                let sent = self.request_battery().await;
                let _ = done.send(sent);
            }
            Command::ReadBattery(done) => {
                let level = self.read_battery_level().await;
                let _ = done.send(level);
            }
            Command::SetAutoconnect(autoconnect, done) => {
                if self.snapshot.autoconnect != autoconnect {
                    self.snapshot.autoconnect = autoconnect;
                    self.publish();
                }
                let _ = done.send(());
            }
            Command::Shutdown(done) => {
                // handled by dispatch
                let _ = done.send(());
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame { epoch, bytes } => self.handle_frame(epoch, &bytes),
            Inbound::LinkLost { epoch } => self.handle_link_lost(epoch).await,
            Inbound::Sighting(sighting) => {
                tracing::trace!(die = %self.config.id, rssi = ?sighting.rssi, "die sighted");
                self.record_sighting(&sighting);
                self.publish();
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.link.as_ref().is_some_and(|active| active.epoch == epoch)
    }

    async fn handle_link_lost(&mut self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        tracing::warn!(die = %self.config.id, "die dropped the connection");
        self.release_link().await;
        self.set_connection(ConnectionState::Disconnected);
    }

    fn record_sighting(&mut self, sighting: &Sighting) {
        self.snapshot.record_sighting(sighting);
        self.snapshot
            .refresh_presence(time::now(), self.config.presence_window);
        self.arm_presence_expiry();
    }

    fn expire_presence(&mut self) {
        self.presence_deadline = None;
        if self
            .snapshot
            .refresh_presence(time::now(), self.config.presence_window)
        {
            tracing::info!(die = %self.config.id, "die no longer present");
            self.publish();
        }
        self.arm_presence_expiry();
    }

    fn arm_presence_expiry(&mut self) {
        self.presence_deadline = if self.snapshot.present {
            self.snapshot
                .presence_remaining(time::now(), self.config.presence_window)
                .map(|left| Instant::now() + left)
        } else {
            None
        };
    }

    fn handle_frame(&mut self, epoch: u64, bytes: &[u8]) {
        if !self.is_current(epoch) {
            tracing::debug!(die = %self.config.id, "dropping frame from a torn-down subscription");
            return;
        }

        let message = protocol::decode(bytes);
        match message {
            Message::RollState {
                phase: RollPhase::Unknown,
                ..
            } => {
                tracing::warn!(die = %self.config.id, frame = ?bytes, "received unknown roll state");
            }
            Message::RollState {
                phase,
                face: Some(face),
            } => {
                tracing::info!(die = %self.config.id, ?phase, face, "die landed");
            }
            Message::RollState { phase, face: None } => {
                tracing::debug!(die = %self.config.id, ?phase, "roll state changed");
            }
            Message::Battery { level, state } => {
                if state.is_none() {
                    tracing::warn!(die = %self.config.id, frame = ?bytes, "received unknown battery state");
                }
                tracing::debug!(die = %self.config.id, level, ?state, "battery report");
            }
            Message::Unhandled { tag } => {
                tracing::debug!(die = %self.config.id, tag, frame = ?bytes, "received unhandled message type");
            }
            Message::Malformed { len } => {
                tracing::warn!(die = %self.config.id, len, frame = ?bytes, "received malformed frame");
            }
        }

        if self.snapshot.apply(&message) {
            self.publish();
        }
    }

    async fn connect(&mut self) -> ConnectionState {
        tracing::info!(die = %self.config.id, name = %self.config.name, "connecting to die");
        self.set_connection(ConnectionState::Connecting);

        // connecting again while connected re-runs discovery on a fresh link
        self.release_link().await;

        match self.establish().await {
            Ok(active) => {
                self.link = Some(active);
                tracing::info!(die = %self.config.id, "connected, listening for rolls");
                self.set_connection(ConnectionState::Connected);
                self.request_battery().await;
                ConnectionState::Connected
            }
            Err(state) => {
                self.set_connection(state);
                state
            }
        }
    }

    async fn establish(&mut self) -> Result<ActiveLink<T::Link>, ConnectionState> {
        let device = match self.transport.find_device(&self.config.name).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::warn!(die = %self.config.id, name = %self.config.name, "could not find die, make sure it is on and nearby");
                return Err(ConnectionState::NotFound);
            }
            Err(err) => {
                tracing::error!(%err, die = %self.config.id, "device lookup failed");
                return Err(ConnectionState::Error);
            }
        };

        let link = match self.transport.open(&device).await {
            Ok(link) => link,
            Err(err) if err.is_connect_failure() => {
                tracing::warn!(%err, die = %self.config.id, "failed to connect to die");
                return Err(ConnectionState::ConnectFailed);
            }
            Err(err) => {
                tracing::error!(%err, die = %self.config.id, "error while connecting to die");
                return Err(ConnectionState::Error);
            }
        };

        match self.transport.is_connected(&link).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(die = %self.config.id, "transport reports die not connected after opening");
                self.close_quietly(link).await;
                return Err(ConnectionState::ConnectFailed);
            }
            Err(err) => {
                tracing::error!(%err, die = %self.config.id, "failed to check connection");
                self.close_quietly(link).await;
                return Err(ConnectionState::Error);
            }
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let sink = self.frame_sink(epoch);
        if let Err(err) = self
            .transport
            .subscribe(&link, NOTIFY_CHARACTERISTIC, sink)
            .await
        {
            tracing::error!(%err, die = %self.config.id, "failed to subscribe to notifications");
            self.close_quietly(link).await;
            return Err(ConnectionState::Error);
        }

        Ok(ActiveLink { link, epoch })
    }

    async fn disconnect(&mut self) -> ConnectionState {
        let Some(active) = self.link.as_ref() else {
            tracing::info!(die = %self.config.id, "die is not connected");
            return self.snapshot.connection;
        };

        match self.transport.is_connected(&active.link).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(die = %self.config.id, "die is not connected");
                return self.snapshot.connection;
            }
            Err(err) => {
                tracing::warn!(%err, die = %self.config.id, "failed to check connection, disconnecting anyway");
            }
        }

        self.release_link().await;
        tracing::info!(die = %self.config.id, "disconnected from die");
        self.set_connection(ConnectionState::Disconnected);
        ConnectionState::Disconnected
    }

    /// Unsubscribe and close the held link, if any. Failures are logged; the
    /// link is dropped either way.
    async fn release_link(&mut self) {
        let Some(active) = self.link.take() else {
            return;
        };
        if let Err(err) = self
            .transport
            .unsubscribe(&active.link, NOTIFY_CHARACTERISTIC)
            .await
        {
            tracing::warn!(%err, die = %self.config.id, "failed to stop notifications");
        }
        self.close_quietly(active.link).await;
    }

    async fn close_quietly(&self, link: T::Link) {
        if let Err(err) = self.transport.close(link).await {
            tracing::warn!(%err, die = %self.config.id, "failed to close connection");
        }
    }

    async fn request_battery(&self) -> bool {
        let Some(active) = self.link.as_ref() else {
            tracing::debug!(die = %self.config.id, "not connected, battery request skipped");
            return false;
        };
        let frame = Request::BatteryLevel.encode();
        let write = self
            .transport
            .write(&active.link, WRITE_CHARACTERISTIC, &frame);
        match tokio::time::timeout(REQUEST_TIMEOUT, write).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(%err, die = %self.config.id, "failed to request battery level");
                false
            }
            Err(_) => {
                tracing::warn!(die = %self.config.id, "battery request not acknowledged in time");
                false
            }
        }
    }

    async fn read_battery_level(&mut self) -> Option<u8> {
        let active = self.link.as_ref()?;
        let read = self
            .transport
            .read(&active.link, BATTERY_LEVEL_CHARACTERISTIC);
        let bytes = match tokio::time::timeout(REQUEST_TIMEOUT, read).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                tracing::warn!(%err, die = %self.config.id, "failed to read battery level");
                return None;
            }
            Err(_) => {
                tracing::warn!(die = %self.config.id, "battery level read timed out");
                return None;
            }
        };

        let Some(&level) = bytes.first() else {
            tracing::warn!(die = %self.config.id, "empty battery level value");
            return None;
        };
        let level = level.min(100);
        self.snapshot.battery_level = Some(level);
        self.publish();
        Some(level)
    }

    fn set_connection(&mut self, state: ConnectionState) {
        self.snapshot.set_connection(state);
        self.publish();
    }

    fn publish(&self) {
        self.state.send_replace(self.snapshot.clone());
        self.observers.notify_all(&self.snapshot);
    }

    fn frame_sink(&self, epoch: u64) -> FrameSink {
        let frames = self.inbound.downgrade();
        let losses = self.inbound.downgrade();
        FrameSink::new(move |bytes| {
            frames
                .upgrade()
                .is_some_and(|tx| tx.send(Inbound::Frame { epoch, bytes }).is_ok())
        })
        .on_link_lost(move || {
            if let Some(tx) = losses.upgrade() {
                let _ = tx.send(Inbound::LinkLost { epoch });
            }
        })
    }

    fn sighting_sink(&self) -> SightingSink {
        let inbound = self.inbound.downgrade();
        SightingSink::new(move |sighting| {
            inbound
                .upgrade()
                .is_some_and(|tx| tx.send(Inbound::Sighting(sighting)).is_ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use pixels_dice_domain::die::BatteryState;
    use pixels_dice_domain::error::{PixelsError, TransportError};

    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    enum OpenBehaviour {
        #[default]
        Succeed,
        Refuse,
        TimeOut,
        Explode,
    }

    /// Scriptable in-memory transport.
    #[derive(Default)]
    struct FakeTransport {
        devices: Mutex<Vec<String>>,
        open: Mutex<OpenBehaviour>,
        report_disconnected: AtomicBool,
        fail_find: AtomicBool,
        fail_subscribe: AtomicBool,
        fail_unsubscribe: AtomicBool,
        fail_close: AtomicBool,
        stall_writes: AtomicBool,
        opens: AtomicUsize,
        closes: AtomicUsize,
        unsubscribes: AtomicUsize,
        cancels: Arc<AtomicUsize>,
        writes: Mutex<Vec<(uuid::Uuid, Vec<u8>)>>,
        frames: Mutex<Option<FrameSink>>,
        sightings: Mutex<Option<SightingSink>>,
        battery_value: Mutex<Vec<u8>>,
        last_sighting: Mutex<Option<Sighting>>,
    }

    impl FakeTransport {
        fn with_die(name: &str) -> Self {
            let transport = Self::default();
            transport.devices.lock().unwrap().push(name.to_string());
            transport
        }

        fn push_frame(&self, frame: &[u8]) -> bool {
            let sink = self.frames.lock().unwrap().clone().unwrap();
            sink.push(frame.to_vec())
        }

        fn push_sighting(&self, rssi: i16) {
            let sink = self.sightings.lock().unwrap().clone().unwrap();
            sink.push(Sighting {
                rssi: Some(rssi),
                seen_at: time::now(),
            });
        }

        fn writes(&self) -> Vec<(uuid::Uuid, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }
    }

    struct FakeSubscription(Arc<AtomicUsize>);

    impl AdvertisementSubscription for FakeSubscription {
        fn cancel(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Transport for FakeTransport {
        type Device = String;
        type Link = String;
        type Subscription = FakeSubscription;

        async fn find_device(&self, name: &str) -> Result<Option<String>, TransportError> {
            if self.fail_find.load(Ordering::SeqCst) {
                return Err(TransportError::Unavailable);
            }
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.as_str() == name)
                .cloned())
        }

        async fn open(&self, device: &String) -> Result<String, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match *self.open.lock().unwrap() {
                OpenBehaviour::Succeed => Ok(device.clone()),
                OpenBehaviour::Refuse => Err(TransportError::ConnectFailed("refused".into())),
                OpenBehaviour::TimeOut => Err(TransportError::Timeout),
                OpenBehaviour::Explode => Err(TransportError::Io("adapter crashed".into())),
            }
        }

        async fn is_connected(&self, _link: &String) -> Result<bool, TransportError> {
            Ok(!self.report_disconnected.load(Ordering::SeqCst))
        }

        async fn subscribe(
            &self,
            _link: &String,
            characteristic: uuid::Uuid,
            sink: FrameSink,
        ) -> Result<(), TransportError> {
            assert_eq!(characteristic, NOTIFY_CHARACTERISTIC);
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(TransportError::Io("subscribe failed".into()));
            }
            *self.frames.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn unsubscribe(
            &self,
            _link: &String,
            _characteristic: uuid::Uuid,
        ) -> Result<(), TransportError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            if self.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            Ok(())
        }

        async fn write(
            &self,
            _link: &String,
            characteristic: uuid::Uuid,
            bytes: &[u8],
        ) -> Result<(), TransportError> {
            self.writes
                .lock()
                .unwrap()
                .push((characteristic, bytes.to_vec()));
            if self.stall_writes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn read(
            &self,
            _link: &String,
            characteristic: uuid::Uuid,
        ) -> Result<Vec<u8>, TransportError> {
            assert_eq!(characteristic, BATTERY_LEVEL_CHARACTERISTIC);
            Ok(self.battery_value.lock().unwrap().clone())
        }

        async fn close(&self, _link: String) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(TransportError::Io("close failed".into()));
            }
            Ok(())
        }

        async fn watch_advertisements(
            &self,
            _name: &str,
            sink: SightingSink,
        ) -> Result<FakeSubscription, TransportError> {
            *self.sightings.lock().unwrap() = Some(sink);
            Ok(FakeSubscription(Arc::clone(&self.cancels)))
        }

        async fn last_sighting(&self, _name: &str) -> Option<Sighting> {
            *self.last_sighting.lock().unwrap()
        }
    }

    fn start(transport: &Arc<FakeTransport>) -> (DieSession, mpsc::UnboundedReceiver<DieSnapshot>) {
        start_with(DieConfig::named("Die-A").unwrap(), transport)
    }

    fn start_with(
        config: DieConfig,
        transport: &Arc<FakeTransport>,
    ) -> (DieSession, mpsc::UnboundedReceiver<DieSnapshot>) {
        let session = DieSession::spawn(config, Arc::clone(transport));
        let (tx, rx) = mpsc::unbounded_channel();
        session.register(Arc::new(move |snap: &DieSnapshot| -> Result<(), PixelsError> {
            let _ = tx.send(snap.clone());
            Ok(())
        }));
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DieSnapshot>) -> Vec<DieSnapshot> {
        let mut out = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            out.push(snap);
        }
        out
    }

    fn connections(emitted: &[DieSnapshot]) -> Vec<ConnectionState> {
        emitted.iter().map(|s| s.connection).collect()
    }

    async fn connected() -> (
        Arc<FakeTransport>,
        DieSession,
        mpsc::UnboundedReceiver<DieSnapshot>,
    ) {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);
        assert_eq!(session.connect().await, ConnectionState::Connected);
        drain(&mut rx);
        (transport, session, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<DieSnapshot>) -> DieSnapshot {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    // ── connect ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn should_end_not_found_without_open_attempt() {
        let transport = Arc::new(FakeTransport::default());
        let (session, mut rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::NotFound);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
        assert_eq!(
            connections(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::NotFound]
        );
        assert_eq!(session.snapshot().connection, ConnectionState::NotFound);
    }

    #[tokio::test]
    async fn should_connect_and_request_battery_once() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::Connected);
        assert_eq!(
            connections(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(
            transport.writes(),
            vec![(WRITE_CHARACTERISTIC, vec![0x21])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_connect_and_disconnect_when_battery_write_never_completes() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        transport.stall_writes.store(true, Ordering::SeqCst);
        let (session, mut rx) = start(&transport);

        let (connect, disconnect) = tokio::time::timeout(Duration::from_secs(60), async {
            tokio::join!(session.connect(), session.disconnect())
        })
        .await
        .expect("stalled write should not wedge the session");

        assert_eq!(connect, ConnectionState::Connected);
        assert_eq!(disconnect, ConnectionState::Disconnected);
        assert_eq!(
            connections(&drain(&mut rx)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_publish_connected_before_battery_write_returns() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        transport.stall_writes.store(true, Ordering::SeqCst);
        let (session, mut rx) = start(&transport);
        let session = Arc::new(session);

        let connecting = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.connect().await }
        });
        assert_eq!(next(&mut rx).await.connection, ConnectionState::Connecting);
        assert_eq!(next(&mut rx).await.connection, ConnectionState::Connected);
        assert!(!transport.writes().is_empty());

        assert_eq!(connecting.await.unwrap(), ConnectionState::Connected);
        assert!(!session.request_battery().await);
        assert_eq!(session.snapshot().connection, ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_run_on_multi_thread_runtime() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);
        let session = Arc::new(session);

        let handle = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.connect().await }
        });
        assert_eq!(handle.await.unwrap(), ConnectionState::Connected);

        assert!(transport.push_frame(&[0x03, 0x01, 0x05]));
        let snap = loop {
            let snap = next(&mut rx).await;
            if snap.face.is_some() {
                break snap;
            }
        };
        assert_eq!(snap.face, Some(6));

        session.shutdown().await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_map_refused_and_timed_out_open_to_connect_failed() {
        for behaviour in [OpenBehaviour::Refuse, OpenBehaviour::TimeOut] {
            let transport = Arc::new(FakeTransport::with_die("Die-A"));
            *transport.open.lock().unwrap() = behaviour;
            let (session, mut rx) = start(&transport);

            assert_eq!(session.connect().await, ConnectionState::ConnectFailed);
            assert_eq!(
                connections(&drain(&mut rx)),
                vec![ConnectionState::Connecting, ConnectionState::ConnectFailed]
            );
            assert!(transport.writes().is_empty());
        }
    }

    #[tokio::test]
    async fn should_map_unexpected_open_failure_to_error() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        *transport.open.lock().unwrap() = OpenBehaviour::Explode;
        let (session, mut rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::Error);
        assert_eq!(
            connections(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::Error]
        );
    }

    #[tokio::test]
    async fn should_map_lookup_failure_to_error() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        transport.fail_find.store(true, Ordering::SeqCst);
        let (session, _rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::Error);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_close_link_when_transport_reports_not_connected() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        transport.report_disconnected.store(true, Ordering::SeqCst);
        let (session, _rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::ConnectFailed);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_close_link_when_subscribe_fails() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        transport.fail_subscribe.store(true, Ordering::SeqCst);
        let (session, mut rx) = start(&transport);

        assert_eq!(session.connect().await, ConnectionState::Error);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn should_release_previous_link_when_connecting_again() {
        let (transport, session, mut rx) = connected().await;

        assert_eq!(session.connect().await, ConnectionState::Connected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            connections(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    // ── disconnect ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn should_ignore_disconnect_without_link() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);

        assert_eq!(session.disconnect().await, ConnectionState::Disconnected);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_ignore_disconnect_when_transport_reports_not_connected() {
        let (transport, session, mut rx) = connected().await;
        transport.report_disconnected.store(true, Ordering::SeqCst);

        assert_eq!(session.disconnect().await, ConnectionState::Connected);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn should_disconnect_and_clear_face() {
        let (transport, session, mut rx) = connected().await;
        transport.push_frame(&[0x03, 0x01, 0x04]);
        assert_eq!(next(&mut rx).await.face, Some(5));

        assert_eq!(session.disconnect().await, ConnectionState::Disconnected);
        let emitted = drain(&mut rx);
        assert_eq!(connections(&emitted), vec![ConnectionState::Disconnected]);
        assert_eq!(emitted[0].face, None);
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_disconnect_even_when_cleanup_fails() {
        let (transport, session, mut rx) = connected().await;
        transport.push_frame(&[0x03, 0x05, 0x00]);
        next(&mut rx).await;
        transport.fail_unsubscribe.store(true, Ordering::SeqCst);
        transport.fail_close.store(true, Ordering::SeqCst);

        assert_eq!(session.disconnect().await, ConnectionState::Disconnected);
        let snap = session.snapshot();
        assert_eq!(snap.connection, ConnectionState::Disconnected);
        assert_eq!(snap.face, None);
        assert_eq!(connections(&drain(&mut rx)), vec![ConnectionState::Disconnected]);
    }

    #[tokio::test]
    async fn should_end_disconnected_when_disconnect_races_connect() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, _rx) = start(&transport);

        let (connect, disconnect) = tokio::join!(session.connect(), session.disconnect());
        assert_eq!(connect, ConnectionState::Connected);
        assert_eq!(disconnect, ConnectionState::Disconnected);
        assert_eq!(session.snapshot().connection, ConnectionState::Disconnected);
        assert_eq!(
            transport.opens.load(Ordering::SeqCst),
            transport.closes.load(Ordering::SeqCst)
        );
    }

    // ── notifications ───────────────────────────────────────────────────

    #[tokio::test]
    async fn should_apply_roll_frames() {
        let (transport, session, mut rx) = connected().await;

        transport.push_frame(&[0x03, 0x03, 0x00]);
        let rolling = next(&mut rx).await;
        assert_eq!(rolling.roll, RollPhase::Rolling);
        assert_eq!(rolling.face, None);

        transport.push_frame(&[0x03, 0x01, 0x04]);
        let rolled = next(&mut rx).await;
        assert_eq!(rolled.roll, RollPhase::Rolled);
        assert_eq!(rolled.face, Some(5));
        assert_eq!(session.snapshot().face, Some(5));
    }

    #[tokio::test]
    async fn should_apply_battery_frames() {
        let (transport, _session, mut rx) = connected().await;

        transport.push_frame(&[0x22, 87, 2]);
        let snap = next(&mut rx).await;
        assert_eq!(snap.battery_level, Some(87));
        assert_eq!(snap.battery_state, Some(BatteryState::Charging));

        transport.push_frame(&[0x22, 55, 42]);
        let snap = next(&mut rx).await;
        assert_eq!(snap.battery_level, Some(55));
        assert_eq!(snap.battery_state, Some(BatteryState::Charging));
    }

    #[tokio::test]
    async fn should_report_unknown_roll_code_without_face() {
        let (transport, _session, mut rx) = connected().await;

        transport.push_frame(&[0x03, 0x01, 0x02]);
        next(&mut rx).await;
        transport.push_frame(&[0x03, 0x66, 0x02]);
        let snap = next(&mut rx).await;
        assert_eq!(snap.roll, RollPhase::Unknown);
        assert_eq!(snap.face, None);
    }

    #[tokio::test]
    async fn should_not_emit_for_short_or_unhandled_frames() {
        let (transport, session, mut rx) = connected().await;
        let before = session.snapshot();

        transport.push_frame(&[0x03, 0x01]);
        transport.push_frame(&[0x7E, 0x00, 0x00]);
        // round trip through the worker so queued frames are processed first
        assert!(session.request_battery().await);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test]
    async fn should_drop_frames_after_disconnect() {
        let (transport, session, mut rx) = connected().await;
        let stale = transport.frames.lock().unwrap().clone().unwrap();
        session.disconnect().await;
        drain(&mut rx);

        stale.push(vec![0x03, 0x01, 0x04]);
        assert!(!session.request_battery().await);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.snapshot().face, None);
    }

    #[tokio::test]
    async fn should_drop_frames_from_previous_link_after_reconnect() {
        let (transport, session, mut rx) = connected().await;
        let stale = transport.frames.lock().unwrap().clone().unwrap();
        session.connect().await;
        drain(&mut rx);

        stale.push(vec![0x03, 0x01, 0x04]);
        session.request_battery().await;
        assert!(drain(&mut rx).is_empty());

        transport.push_frame(&[0x03, 0x01, 0x04]);
        assert_eq!(next(&mut rx).await.face, Some(5));
    }

    #[tokio::test]
    async fn should_disconnect_when_link_is_lost() {
        let (transport, session, mut rx) = connected().await;
        transport.push_frame(&[0x03, 0x01, 0x04]);
        next(&mut rx).await;

        let sink = transport.frames.lock().unwrap().clone().unwrap();
        sink.link_lost();
        let snap = next(&mut rx).await;
        assert_eq!(snap.connection, ConnectionState::Disconnected);
        assert_eq!(snap.face, None);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

        assert_eq!(session.disconnect().await, ConnectionState::Disconnected);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn should_ignore_link_lost_from_previous_link() {
        let (transport, session, mut rx) = connected().await;
        let stale = transport.frames.lock().unwrap().clone().unwrap();
        session.connect().await;
        drain(&mut rx);

        stale.link_lost();
        session.request_battery().await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.snapshot().connection, ConnectionState::Connected);
    }

    // ── presence ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn should_track_presence_while_disconnected() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);
        // first round trip guarantees the worker has activated
        session.request_battery().await;
        assert!(!session.is_present());

        transport.push_sighting(-61);
        let snap = next(&mut rx).await;
        assert_eq!(snap.rssi, Some(-61));
        assert!(snap.last_seen.is_some());
        assert_eq!(snap.connection, ConnectionState::Disconnected);
        assert!(session.is_present());
    }

    #[tokio::test]
    async fn should_seed_presence_from_last_known_sighting() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        *transport.last_sighting.lock().unwrap() = Some(Sighting {
            rssi: Some(-80),
            seen_at: time::now(),
        });
        let (session, _rx) = start(&transport);
        session.request_battery().await;

        assert_eq!(session.snapshot().rssi, Some(-80));
        assert!(session.is_present());
    }

    #[tokio::test]
    async fn should_emit_when_presence_window_runs_out() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let config = DieConfig::named("Die-A")
            .unwrap()
            .with_presence_window(Duration::from_millis(50));
        let (session, mut rx) = start_with(config, &transport);
        session.request_battery().await;

        transport.push_sighting(-61);
        assert!(next(&mut rx).await.present);
        assert!(session.is_present());

        let snap = next(&mut rx).await;
        assert!(!snap.present);
        assert_eq!(snap.rssi, Some(-61));
        assert!(!session.is_present());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn should_not_arm_expiry_for_stale_seed() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        *transport.last_sighting.lock().unwrap() = Some(Sighting {
            rssi: Some(-80),
            seen_at: time::now() - chrono::Duration::minutes(5),
        });
        let (session, mut rx) = start(&transport);
        session.request_battery().await;

        assert_eq!(session.snapshot().rssi, Some(-80));
        assert!(!session.is_present());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    // ── control surface extras ──────────────────────────────────────────

    #[tokio::test]
    async fn should_request_battery_only_when_connected() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, _rx) = start(&transport);
        assert!(!session.request_battery().await);

        session.connect().await;
        assert!(session.request_battery().await);
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn should_read_battery_level_characteristic() {
        let (transport, session, mut rx) = connected().await;
        *transport.battery_value.lock().unwrap() = vec![64];

        assert_eq!(session.read_battery_level().await, Some(64));
        assert_eq!(drain(&mut rx)[0].battery_level, Some(64));

        session.disconnect().await;
        assert_eq!(session.read_battery_level().await, None);
    }

    #[tokio::test]
    async fn should_store_autoconnect_without_connecting() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let (session, mut rx) = start(&transport);

        session.set_autoconnect(true).await;
        assert!(session.snapshot().autoconnect);
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);

        session.set_autoconnect(true).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn should_keep_notifying_when_an_observer_fails() {
        let transport = Arc::new(FakeTransport::default());
        let (session, mut rx) = start(&transport);
        session.register(Arc::new(|_: &DieSnapshot| -> Result<(), PixelsError> {
            Err(PixelsError::Observer("boom".into()))
        }));

        session.connect().await;
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn should_serve_commands_while_sightings_keep_arriving() {
        let transport = Arc::new(FakeTransport::with_die("Die-A"));
        let session = DieSession::spawn(DieConfig::named("Die-A").unwrap(), Arc::clone(&transport));
        session.request_battery().await;
        let sightings = transport.sightings.lock().unwrap().clone().unwrap();

        let flooding = Arc::new(AtomicBool::new(true));
        let flood = tokio::spawn({
            let flooding = Arc::clone(&flooding);
            async move {
                while flooding.load(Ordering::SeqCst) {
                    for _ in 0..1000 {
                        sightings.push(Sighting {
                            rssi: Some(-50),
                            seen_at: time::now(),
                        });
                    }
                    tokio::task::yield_now().await;
                }
            }
        });

        let served =
            tokio::time::timeout(Duration::from_secs(2), session.set_autoconnect(true)).await;
        flooding.store(false, Ordering::SeqCst);
        flood.await.unwrap();

        assert!(served.is_ok());
        assert!(session.snapshot().autoconnect);
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn should_release_everything_on_shutdown() {
        let (transport, session, _rx) = connected().await;

        session.shutdown().await;
        assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.snapshot().connection, ConnectionState::Disconnected);

        session.shutdown().await;
        assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(session.connect().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn should_release_everything_when_handle_is_dropped() {
        let (transport, session, _rx) = connected().await;
        let sightings = transport.sightings.lock().unwrap().clone().unwrap();

        drop(session);
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.cancels.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(!transport.push_frame(&[0x03, 0x01, 0x00]));
        assert!(!sightings.push(Sighting {
            rssi: None,
            seen_at: time::now(),
        }));
    }
}
