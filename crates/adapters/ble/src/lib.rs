//! # pixels-dice-adapter-ble
//!
//! btleplug-backed [`Transport`] for Pixels dice.
//!
//! ## How it works
//!
//! [`BleTransport::start`] picks the first BLE adapter on the host and starts
//! a continuous scan (optionally filtered on the Pixels service UUID). A
//! background loop records every named advertisement, which gives sessions
//! presence updates while they are not connected.
//!
//! Dice are looked up by their advertised local name. A connection is a
//! [`BleLink`]: the peripheral plus one notification pump per subscribed
//! characteristic. When the adapter reports a subscribed peripheral as
//! disconnected, its [`FrameSink`] is told the link is lost.
//!
//! ## Dependency rule
//!
//! Same as other adapters: depends on `pixels-dice-app` and
//! `pixels-dice-domain`.

mod config;
mod error;
mod gatt;
mod presence;
mod scanner;

pub use config::BleConfig;
pub use error::BleError;
pub use presence::WatchHandle;

use std::sync::Arc;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::task::JoinHandle;

use pixels_dice_app::ports::{FrameSink, SightingSink, Transport};
use pixels_dice_domain::die::Sighting;
use pixels_dice_domain::error::TransportError;
use pixels_dice_domain::protocol::PIXELS_SERVICE_UUID;

use crate::gatt::{LinkWatch, Pumps};
use crate::presence::AdvertisementHub;

/// An open connection to a die.
#[derive(Debug)]
pub struct BleLink {
    peripheral: Peripheral,
    pumps: Pumps,
}

/// Transport driving the host's first BLE adapter.
pub struct BleTransport {
    config: BleConfig,
    _manager: Manager,
    central: Adapter,
    hub: Arc<AdvertisementHub>,
    links: Arc<LinkWatch<PeripheralId>>,
    scan_task: JoinHandle<()>,
}

impl BleTransport {
    /// Open the first BLE adapter and start scanning.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::NotAvailable`] when the host has no BLE adapter,
    /// or [`BleError::Btle`] when the scan cannot be started.
    pub async fn start(config: BleConfig) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::NotAvailable)?;

        let events = central.events().await?;
        let filter = if config.scan_filter_service {
            ScanFilter {
                services: vec![PIXELS_SERVICE_UUID],
            }
        } else {
            ScanFilter::default()
        };
        central.start_scan(filter).await?;

        let hub = Arc::new(AdvertisementHub::default());
        let links = Arc::new(LinkWatch::default());
        let scan_task = tokio::spawn(scanner::run(
            central.clone(),
            events,
            Arc::clone(&hub),
            Arc::clone(&links),
        ));

        tracing::info!(
            filter_service = config.scan_filter_service,
            "BLE scan started"
        );

        Ok(Self {
            config,
            _manager: manager,
            central,
            hub,
            links,
            scan_task,
        })
    }

    /// Stop scanning. Sessions keep their links but stop receiving
    /// sightings.
    pub async fn stop(&self) {
        self.scan_task.abort();
        if let Err(err) = self.central.stop_scan().await {
            tracing::warn!(%err, "failed to stop BLE scan");
        }
        tracing::info!("BLE scan stopped");
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.scan_task.abort();
    }
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Transport for BleTransport {
    type Device = Peripheral;
    type Link = BleLink;
    type Subscription = WatchHandle;

    async fn find_device(&self, name: &str) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = self.central.peripherals().await.map_err(BleError::from)?;
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if props.local_name.as_deref() == Some(name) {
                tracing::debug!(%name, address = %props.address, "found die");
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn open(&self, device: &Peripheral) -> Result<BleLink, TransportError> {
        match tokio::time::timeout(self.config.connect_timeout(), device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BleError::GattConnect(err).into()),
            Err(_) => return Err(BleError::ConnectTimeout.into()),
        }

        if let Err(err) = device.discover_services().await {
            if let Err(disconnect_err) = device.disconnect().await {
                tracing::warn!(%disconnect_err, "failed to disconnect after service discovery error");
            }
            return Err(BleError::from(err).into());
        }

        Ok(BleLink {
            peripheral: device.clone(),
            pumps: Pumps::default(),
        })
    }

    async fn is_connected(&self, link: &BleLink) -> Result<bool, TransportError> {
        link.peripheral
            .is_connected()
            .await
            .map_err(|err| BleError::from(err).into())
    }

    async fn subscribe(
        &self,
        link: &BleLink,
        characteristic: uuid::Uuid,
        sink: FrameSink,
    ) -> Result<(), TransportError> {
        let target = gatt::find_characteristic(&link.peripheral, characteristic)?;
        let notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(BleError::from)?;
        link.peripheral
            .subscribe(&target)
            .await
            .map_err(BleError::from)?;

        self.links.track(link.peripheral.id(), sink.clone());
        let pump = tokio::spawn(async move {
            let delivered = gatt::pump_notifications(notifications, characteristic, sink).await;
            tracing::debug!(%characteristic, delivered, "notification pump finished");
        });
        link.pumps.start(characteristic, pump);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        link: &BleLink,
        characteristic: uuid::Uuid,
    ) -> Result<(), TransportError> {
        link.pumps.stop(characteristic);
        self.links.forget(&link.peripheral.id());
        let target = gatt::find_characteristic(&link.peripheral, characteristic)?;
        link.peripheral
            .unsubscribe(&target)
            .await
            .map_err(BleError::from)?;
        Ok(())
    }

    async fn write(
        &self,
        link: &BleLink,
        characteristic: uuid::Uuid,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let target = gatt::find_characteristic(&link.peripheral, characteristic)?;
        link.peripheral
            .write(&target, bytes, WriteType::WithResponse)
            .await
            .map_err(BleError::from)?;
        Ok(())
    }

    async fn read(
        &self,
        link: &BleLink,
        characteristic: uuid::Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let target = gatt::find_characteristic(&link.peripheral, characteristic)?;
        link.peripheral
            .read(&target)
            .await
            .map_err(|err| BleError::from(err).into())
    }

    async fn close(&self, link: BleLink) -> Result<(), TransportError> {
        link.pumps.stop_all();
        self.links.forget(&link.peripheral.id());
        link.peripheral
            .disconnect()
            .await
            .map_err(BleError::from)?;
        Ok(())
    }

    async fn watch_advertisements(
        &self,
        name: &str,
        sink: SightingSink,
    ) -> Result<WatchHandle, TransportError> {
        if self.scan_task.is_finished() {
            return Err(TransportError::Unavailable);
        }
        Ok(self.hub.watch(name, sink))
    }

    async fn last_sighting(&self, name: &str) -> Option<Sighting> {
        self.hub.last_sighting(name)
    }
}
