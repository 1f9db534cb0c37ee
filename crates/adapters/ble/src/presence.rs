//! Advertisement hub — remembers the last sighting of each advertised name
//! and fans sightings out to the sessions watching that name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use pixels_dice_app::ports::{AdvertisementSubscription, SightingSink};
use pixels_dice_domain::die::Sighting;

#[derive(Default)]
struct Inner {
    last_seen: HashMap<String, Sighting>,
    watchers: HashMap<u64, (String, SightingSink)>,
    next_id: u64,
}

/// Shared between the scan loop (writer) and the transport (watch/lookup).
#[derive(Default)]
pub(crate) struct AdvertisementHub {
    inner: Mutex<Inner>,
}

impl AdvertisementHub {
    /// Store `sighting` for `name` and deliver it to every watcher of that
    /// name. Watchers whose sink is closed are dropped.
    pub(crate) fn record(&self, name: &str, sighting: Sighting) {
        let sinks: Vec<(u64, SightingSink)> = {
            let mut inner = self.lock();
            inner.last_seen.insert(name.to_string(), sighting);
            inner
                .watchers
                .iter()
                .filter(|(_, (watched, _))| watched == name)
                .map(|(id, (_, sink))| (*id, sink.clone()))
                .collect()
        };

        // deliver outside the lock
        let closed: Vec<u64> = sinks
            .into_iter()
            .filter(|(_, sink)| !sink.push(sighting))
            .map(|(id, _)| id)
            .collect();

        if !closed.is_empty() {
            let mut inner = self.lock();
            for id in closed {
                inner.watchers.remove(&id);
            }
        }
    }

    pub(crate) fn last_sighting(&self, name: &str) -> Option<Sighting> {
        self.lock().last_seen.get(name).copied()
    }

    pub(crate) fn watch(self: &Arc<Self>, name: &str, sink: SightingSink) -> WatchHandle {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.watchers.insert(id, (name.to_string(), sink));
        WatchHandle {
            hub: Arc::downgrade(self),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    fn unwatch(&self, id: u64) {
        self.lock().watchers.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Advertisement subscription of the BLE transport. Dropping it stops
/// delivery as well.
#[derive(Debug)]
pub struct WatchHandle {
    hub: Weak<AdvertisementHub>,
    id: u64,
}

impl AdvertisementSubscription for WatchHandle {
    fn cancel(self) {
        drop(self);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unwatch(self.id);
        }
    }
}
