//! Scan loop — turns btleplug central events into die sightings.
//!
//! The loop runs for the lifetime of the transport. Every event that names a
//! peripheral is resolved to its properties; peripherals advertising a local
//! name are recorded in the [`AdvertisementHub`]. Disconnect events are
//! forwarded to the session subscribed to that peripheral, if any.

use std::pin::Pin;
use std::sync::Arc;

use btleplug::api::{Central, CentralEvent, Peripheral as _, PeripheralProperties};
use btleplug::platform::{Adapter, PeripheralId};
use tokio_stream::{Stream, StreamExt as _};

use pixels_dice_domain::die::Sighting;
use pixels_dice_domain::time;

use crate::gatt::LinkWatch;
use crate::presence::AdvertisementHub;

pub(crate) type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

pub(crate) async fn run(
    central: Adapter,
    mut events: EventStream,
    hub: Arc<AdvertisementHub>,
    links: Arc<LinkWatch<PeripheralId>>,
) {
    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            CentralEvent::DeviceDisconnected(id) => {
                if links.lost(&id) {
                    tracing::info!(?id, "connected die dropped the link");
                } else {
                    tracing::debug!(?id, "BLE peripheral disconnected");
                }
                continue;
            }
            _ => continue,
        };

        let Ok(peripheral) = central.peripheral(&id).await else {
            continue;
        };
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(%err, ?id, "failed to read peripheral properties");
                continue;
            }
        };

        if let Some((name, sighting)) = sighting_from(&props) {
            tracing::trace!(%name, rssi = ?sighting.rssi, "BLE device sighted");
            hub.record(&name, sighting);
        }
    }

    tracing::warn!("BLE event stream ended, presence tracking stopped");
}

/// Build a sighting from advertised properties. Peripherals without a local
/// name cannot be matched to a die and are skipped.
pub(crate) fn sighting_from(props: &PeripheralProperties) -> Option<(String, Sighting)> {
    let name = props.local_name.clone().filter(|name| !name.is_empty())?;
    Some((
        name,
        Sighting {
            rssi: props.rssi,
            seen_at: time::now(),
        },
    ))
}
