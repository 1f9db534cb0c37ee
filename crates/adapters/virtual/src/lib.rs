//! # pixels-dice-adapter-virtual
//!
//! Simulated [`Transport`] with virtual dice, for demos and end-to-end tests.
//!
//! ## Behaviour
//!
//! | Action | Effect |
//! |--------|--------|
//! | [`VirtualTransport::add_die`] | die becomes discoverable by name |
//! | [`VirtualTransport::advertise`] | sighting delivered to watchers of that name |
//! | [`VirtualDie::roll`] | rolling then on-face frames sent to the subscriber |
//! | battery request written | die answers with a battery frame |
//! | [`VirtualDie::refuse_connections`] | `open` fails as a refused connection |
//!
//! ## Dependency rule
//!
//! Depends on `pixels-dice-app` (port traits) and `pixels-dice-domain` only.

mod die;

pub use die::VirtualDie;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use pixels_dice_app::ports::{AdvertisementSubscription, FrameSink, SightingSink, Transport};
use pixels_dice_domain::die::Sighting;
use pixels_dice_domain::error::TransportError;
use pixels_dice_domain::protocol::{
    BATTERY_LEVEL_CHARACTERISTIC, NOTIFY_CHARACTERISTIC, Request, WRITE_CHARACTERISTIC,
};
use pixels_dice_domain::time;

/// An open connection to a virtual die.
#[derive(Debug)]
pub struct VirtualLink {
    die: Arc<VirtualDie>,
    generation: u64,
}

#[derive(Default)]
struct Advertisements {
    last_seen: HashMap<String, Sighting>,
    watchers: HashMap<u64, (String, SightingSink)>,
    next_id: u64,
}

/// Simulated BLE central.
#[derive(Default)]
pub struct VirtualTransport {
    dice: Mutex<HashMap<String, Arc<VirtualDie>>>,
    advertisements: Arc<Mutex<Advertisements>>,
}

impl VirtualTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a die named `name` (replacing any previous one) and return it.
    pub fn add_die(&self, name: &str) -> Arc<VirtualDie> {
        let die = Arc::new(VirtualDie::new(name));
        self.lock_dice()
            .insert(name.to_string(), Arc::clone(&die));
        tracing::debug!(%name, "virtual die added");
        die
    }

    #[must_use]
    pub fn die(&self, name: &str) -> Option<Arc<VirtualDie>> {
        self.lock_dice().get(name).cloned()
    }

    /// Make `name` advertise with `rssi`. Returns how many watchers received
    /// the sighting.
    pub fn advertise(&self, name: &str, rssi: Option<i16>) -> usize {
        let sighting = Sighting {
            rssi,
            seen_at: time::now(),
        };
        let sinks: Vec<(u64, SightingSink)> = {
            let mut ads = lock(&self.advertisements);
            ads.last_seen.insert(name.to_string(), sighting);
            ads.watchers
                .iter()
                .filter(|(_, (watched, _))| watched == name)
                .map(|(id, (_, sink))| (*id, sink.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in sinks {
            if sink.push(sighting) {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            let mut ads = lock(&self.advertisements);
            for id in closed {
                ads.watchers.remove(&id);
            }
        }
        delivered
    }

    /// Number of live advertisement subscriptions.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        lock(&self.advertisements).watchers.len()
    }

    /// Drive every die: advertise each powered die, and roll the connected
    /// ones onto a new face, once per `period`.
    pub fn spawn_demo(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut tick: u16 = 0;
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                tick = tick.wrapping_add(1);
                let dice: Vec<Arc<VirtualDie>> = transport.lock_dice().values().cloned().collect();
                for (offset, die) in (0u16..).zip(dice) {
                    if !die.is_powered() {
                        continue;
                    }
                    let rssi = i16::try_from(offset % 20).map_or(-75, |o| -55 - o);
                    transport.advertise(die.name(), Some(rssi));
                    if die.is_connected() {
                        die.roll(tick.wrapping_mul(7).wrapping_add(offset) % 20 + 1);
                    }
                }
            }
        })
    }

    fn lock_dice(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<VirtualDie>>> {
        self.dice.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(ads: &Mutex<Advertisements>) -> std::sync::MutexGuard<'_, Advertisements> {
    ads.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for VirtualTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTransport")
            .field("dice", &self.lock_dice().len())
            .finish_non_exhaustive()
    }
}

/// Advertisement subscription of the virtual transport.
#[derive(Debug)]
pub struct VirtualWatch {
    advertisements: Weak<Mutex<Advertisements>>,
    id: u64,
}

impl AdvertisementSubscription for VirtualWatch {
    fn cancel(self) {
        drop(self);
    }
}

impl Drop for VirtualWatch {
    fn drop(&mut self) {
        if let Some(ads) = self.advertisements.upgrade() {
            lock(&ads).watchers.remove(&self.id);
        }
    }
}

fn require_linked(link: &VirtualLink) -> Result<(), TransportError> {
    if link.die.is_linked(link.generation) {
        Ok(())
    } else {
        Err(TransportError::NotConnected)
    }
}

impl Transport for VirtualTransport {
    type Device = Arc<VirtualDie>;
    type Link = VirtualLink;
    type Subscription = VirtualWatch;

    async fn find_device(&self, name: &str) -> Result<Option<Arc<VirtualDie>>, TransportError> {
        Ok(self.die(name).filter(|die| die.is_powered()))
    }

    async fn open(&self, device: &Arc<VirtualDie>) -> Result<VirtualLink, TransportError> {
        let Some(generation) = device.accept() else {
            tracing::debug!(name = %device.name(), "virtual die refused connection");
            return Err(TransportError::ConnectFailed(
                format!("{} refused the connection", device.name()).into(),
            ));
        };
        Ok(VirtualLink {
            die: Arc::clone(device),
            generation,
        })
    }

    async fn is_connected(&self, link: &VirtualLink) -> Result<bool, TransportError> {
        Ok(link.die.is_linked(link.generation))
    }

    async fn subscribe(
        &self,
        link: &VirtualLink,
        characteristic: uuid::Uuid,
        sink: FrameSink,
    ) -> Result<(), TransportError> {
        if characteristic != NOTIFY_CHARACTERISTIC {
            return Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            });
        }
        if link.die.set_notify(link.generation, Some(sink)) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn unsubscribe(
        &self,
        link: &VirtualLink,
        characteristic: uuid::Uuid,
    ) -> Result<(), TransportError> {
        if characteristic != NOTIFY_CHARACTERISTIC {
            return Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            });
        }
        if link.die.set_notify(link.generation, None) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn write(
        &self,
        link: &VirtualLink,
        characteristic: uuid::Uuid,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        if characteristic != WRITE_CHARACTERISTIC {
            return Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            });
        }
        require_linked(link)?;
        link.die.record_write(bytes);
        match Request::decode(bytes) {
            Some(Request::BatteryLevel) => {
                link.die.report_battery();
            }
            None => {
                tracing::debug!(name = %link.die.name(), frame = ?bytes, "virtual die ignored request");
            }
        }
        Ok(())
    }

    async fn read(
        &self,
        link: &VirtualLink,
        characteristic: uuid::Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        if characteristic != BATTERY_LEVEL_CHARACTERISTIC {
            return Err(TransportError::CharacteristicNotFound {
                uuid: characteristic,
            });
        }
        require_linked(link)?;
        Ok(vec![link.die.battery_level()])
    }

    async fn close(&self, link: VirtualLink) -> Result<(), TransportError> {
        link.die.release(link.generation);
        Ok(())
    }

    async fn watch_advertisements(
        &self,
        name: &str,
        sink: SightingSink,
    ) -> Result<VirtualWatch, TransportError> {
        let mut ads = lock(&self.advertisements);
        let id = ads.next_id;
        ads.next_id += 1;
        ads.watchers.insert(id, (name.to_string(), sink));
        Ok(VirtualWatch {
            advertisements: Arc::downgrade(&self.advertisements),
            id,
        })
    }

    async fn last_sighting(&self, name: &str) -> Option<Sighting> {
        lock(&self.advertisements).last_seen.get(name).copied()
    }
}
