//! GATT helpers for connected dice.
//!
//! Characteristic lookup, the notification pumps that forward value
//! notifications from btleplug's stream into a session's [`FrameSink`], and
//! the registry that tells subscribed sessions when their peripheral drops.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use btleplug::api::{Characteristic, Peripheral as _, ValueNotification};
use btleplug::platform::Peripheral;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt as _};

use pixels_dice_app::ports::FrameSink;

use crate::error::BleError;

/// Find a GATT characteristic by UUID on a peripheral that has already
/// discovered its services.
///
/// # Errors
///
/// Returns [`BleError::CharacteristicNotFound`] if no characteristic with
/// the given UUID is present.
pub(crate) fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, BleError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(BleError::CharacteristicNotFound { uuid })
}

/// Forward notifications of `characteristic` to `sink` until the stream ends
/// or the sink reports its receiver is gone. Returns how many frames were
/// delivered.
pub(crate) async fn pump_notifications<S>(
    mut notifications: S,
    characteristic: uuid::Uuid,
    sink: FrameSink,
) -> usize
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut delivered = 0;
    while let Some(notification) = notifications.next().await {
        if notification.uuid != characteristic {
            continue;
        }
        if !sink.push(notification.value) {
            tracing::debug!(%characteristic, "frame sink closed, stopping notification pump");
            break;
        }
        delivered += 1;
    }
    delivered
}

/// Running notification pumps of one link, keyed by characteristic.
#[derive(Debug, Default)]
pub(crate) struct Pumps {
    tasks: Mutex<HashMap<uuid::Uuid, JoinHandle<()>>>,
}

impl Pumps {
    /// Track `task` for `characteristic`, aborting any pump it replaces.
    pub(crate) fn start(&self, characteristic: uuid::Uuid, task: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(characteristic, task) {
            previous.abort();
        }
    }

    /// Abort the pump of `characteristic`. Returns whether one was running.
    pub(crate) fn stop(&self, characteristic: uuid::Uuid) -> bool {
        match self.lock().remove(&characteristic) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn stop_all(&self) {
        for (_, task) in self.lock().drain() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<uuid::Uuid, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Frame sinks of subscribed peripherals, keyed by peripheral id.
#[derive(Debug)]
pub(crate) struct LinkWatch<K> {
    sinks: Mutex<HashMap<K, FrameSink>>,
}

impl<K> Default for LinkWatch<K> {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> LinkWatch<K> {
    pub(crate) fn track(&self, id: K, sink: FrameSink) {
        self.lock().insert(id, sink);
    }

    /// Stop watching `id` after a deliberate teardown.
    pub(crate) fn forget(&self, id: &K) -> bool {
        self.lock().remove(id).is_some()
    }

    /// The adapter reported `id` as disconnected: tell its session, once.
    pub(crate) fn lost(&self, id: &K) -> bool {
        let Some(sink) = self.lock().remove(id) else {
            return false;
        };
        sink.link_lost();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, FrameSink>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pixels_dice_domain::protocol::NOTIFY_CHARACTERISTIC;

    fn notification(uuid: uuid::Uuid, value: &[u8]) -> ValueNotification {
        ValueNotification {
            uuid,
            value: value.to_vec(),
        }
    }

    fn collecting_sink() -> (FrameSink, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&seen);
        let sink = FrameSink::new(move |frame| {
            store.lock().unwrap().push(frame);
            true
        });
        (sink, seen)
    }

    #[tokio::test]
    async fn should_forward_only_matching_characteristic() {
        let other = uuid::Uuid::from_u128(0x2a19);
        let stream = tokio_stream::iter(vec![
            notification(NOTIFY_CHARACTERISTIC, &[0x03, 0x01, 0x04]),
            notification(other, &[0x64]),
            notification(NOTIFY_CHARACTERISTIC, &[0x22, 0x50, 0x00]),
        ]);
        let (sink, seen) = collecting_sink();

        let delivered = pump_notifications(stream, NOTIFY_CHARACTERISTIC, sink).await;
        assert_eq!(delivered, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![0x03, 0x01, 0x04], vec![0x22, 0x50, 0x00]]
        );
    }

    #[tokio::test]
    async fn should_stop_when_sink_is_closed() {
        let stream = tokio_stream::iter(vec![
            notification(NOTIFY_CHARACTERISTIC, &[0x03, 0x01, 0x04]),
            notification(NOTIFY_CHARACTERISTIC, &[0x03, 0x01, 0x05]),
        ]);
        let sink = FrameSink::new(|_| false);

        assert_eq!(pump_notifications(stream, NOTIFY_CHARACTERISTIC, sink).await, 0);
    }

    #[test]
    fn should_report_lost_link_once() {
        let links = LinkWatch::default();
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lost);
        links.track(
            "die-a",
            FrameSink::new(|_| true).on_link_lost(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!links.lost(&"die-b"));
        assert!(links.lost(&"die-a"));
        assert!(!links.lost(&"die-a"));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_not_report_forgotten_link() {
        let links = LinkWatch::default();
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lost);
        links.track(
            "die-a",
            FrameSink::new(|_| true).on_link_lost(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(links.forget(&"die-a"));
        assert!(!links.lost(&"die-a"));
        assert_eq!(lost.load(Ordering::SeqCst), 0);
    }

    fn parked_task() -> (JoinHandle<()>, tokio::sync::oneshot::Receiver<()>) {
        let (alive, dropped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        (task, dropped)
    }

    #[tokio::test]
    async fn should_abort_replaced_and_stopped_pumps() {
        let pumps = Pumps::default();
        let (first, first_dropped) = parked_task();
        let (second, second_dropped) = parked_task();

        pumps.start(NOTIFY_CHARACTERISTIC, first);
        pumps.start(NOTIFY_CHARACTERISTIC, second);
        assert_eq!(pumps.len(), 1);
        assert!(first_dropped.await.is_err());

        assert!(pumps.stop(NOTIFY_CHARACTERISTIC));
        assert!(!pumps.stop(NOTIFY_CHARACTERISTIC));
        assert_eq!(pumps.len(), 0);
        assert!(second_dropped.await.is_err());
    }
}
