use crate::errors::{PrinterError, Result};
use crate::transport::{
    AdvertisedDevice, BleTransport, CharacteristicProperties, DeviceFilter, GattCharacteristic,
    GattService, WriteMode,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Operator-facing chooser used when discovery falls back to an unfiltered scan.
#[async_trait]
pub trait DevicePicker: Send + Sync {
    /// `None` when the operator dismisses the chooser.
    async fn pick(&self, candidates: &[AdvertisedDevice]) -> Option<AdvertisedDevice>;
}

/// [`BleTransport`] backed by btleplug, using the first Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    scan_window: Duration,
    picker: Box<dyn DevicePicker>,
    /// Peripherals seen by previous scans, keyed by platform id
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugTransport {
    pub async fn new(scan_window: Duration, picker: Box<dyn DevicePicker>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| PrinterError::TransportUnavailable(format!("Failed to create BLE manager: {}", e)))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| PrinterError::TransportUnavailable(format!("Failed to get BLE adapters: {}", e)))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| PrinterError::TransportUnavailable("No Bluetooth adapters found".to_string()))?;

        info!("Using Bluetooth adapter: {:?}", adapter);

        Ok(Self {
            adapter,
            scan_window,
            picker,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.lock().await.get(device_id) {
            return Ok(p.clone());
        }

        // Not seen by our own scans; the adapter may still know it from pairing
        for p in self.adapter.peripherals().await? {
            if p.id().to_string() == device_id {
                self.peripherals.lock().await.insert(device_id.to_string(), p.clone());
                return Ok(p);
            }
        }

        Err(PrinterError::Bluetooth(format!("Peripheral not found: {}", device_id)))
    }

    async fn describe(&self, peripheral: &Peripheral) -> Option<AdvertisedDevice> {
        let props = peripheral.properties().await.ok().flatten()?;
        Some(AdvertisedDevice {
            id: peripheral.id().to_string(),
            name: props.local_name,
            service_ids: props.services.into_iter().collect(),
        })
    }

    async fn remember(&self, peripheral: &Peripheral) {
        self.peripherals
            .lock()
            .await
            .insert(peripheral.id().to_string(), peripheral.clone());
    }

    /// Listen to adapter events until a peripheral satisfies `filter` or the window closes.
    async fn scan_for_first_match(&self, filter: &DeviceFilter) -> Result<Option<AdvertisedDevice>> {
        let mut events = self.adapter.events().await?;
        let deadline = tokio::time::Instant::now() + self.scan_window;

        // Already-known peripherals count too; CoreBluetooth does not re-announce them
        for p in self.adapter.peripherals().await? {
            if let Some(device) = self.describe(&p).await {
                if matches_filter(&device, filter) {
                    self.remember(&p).await;
                    return Ok(Some(device));
                }
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match tokio::time::timeout(remaining, events.next()).await {
                Ok(Some(CentralEvent::DeviceDiscovered(id))) | Ok(Some(CentralEvent::DeviceUpdated(id))) => {
                    let p = self.adapter.peripheral(&id).await?;
                    if let Some(device) = self.describe(&p).await {
                        if matches_filter(&device, filter) {
                            self.remember(&p).await;
                            return Ok(Some(device));
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return Ok(None),
            }
        }
    }

    async fn scan_and_pick(&self) -> Result<Option<AdvertisedDevice>> {
        tokio::time::sleep(self.scan_window).await;

        let mut candidates = Vec::new();
        for p in self.adapter.peripherals().await? {
            if let Some(device) = self.describe(&p).await {
                // Nameless advertisers are unusable in a chooser
                if device.name.is_some() {
                    self.remember(&p).await;
                    candidates.push(device);
                }
            }
        }

        debug!("Presenting {} candidates to the operator", candidates.len());
        Ok(self.picker.pick(&candidates).await)
    }

    fn find_characteristic(
        &self,
        peripheral: &Peripheral,
        characteristic: &GattCharacteristic,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| {
                PrinterError::Bluetooth(format!(
                    "Characteristic {} not present on service {}",
                    characteristic.uuid, characteristic.service_uuid
                ))
            })
    }
}

fn matches_filter(device: &AdvertisedDevice, filter: &DeviceFilter) -> bool {
    match filter {
        DeviceFilter::Service(id) => device.service_ids.contains(id),
        DeviceFilter::NamePrefix(prefix) => device
            .name
            .as_deref()
            .map_or(false, |n| n.to_lowercase().starts_with(&prefix.to_lowercase())),
        DeviceFilter::Any => true,
    }
}

fn to_gatt_characteristic(c: &Characteristic) -> GattCharacteristic {
    GattCharacteristic {
        uuid: c.uuid,
        service_uuid: c.service_uuid,
        properties: CharacteristicProperties {
            read: c.properties.contains(CharPropFlags::READ),
            write: c.properties.contains(CharPropFlags::WRITE),
            write_without_response: c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: c.properties.contains(CharPropFlags::NOTIFY),
        },
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Option<AdvertisedDevice>> {
        let scan_filter = match filter {
            DeviceFilter::Service(id) => ScanFilter { services: vec![*id] },
            _ => ScanFilter::default(),
        };

        self.adapter
            .start_scan(scan_filter)
            .await
            .map_err(|e| PrinterError::TransportUnavailable(format!("Failed to start BLE scan: {}", e)))?;

        let result = match filter {
            DeviceFilter::Any => self.scan_and_pick().await,
            _ => self.scan_for_first_match(filter).await,
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        result
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.connect().await.map_err(|e| PrinterError::TransportConnect {
            device: device_id.to_string(),
            reason: e.to_string(),
        })?;
        peripheral.discover_services().await?;
        info!("Connected to BLE peripheral: {}", device_id);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> Result<bool> {
        let peripheral = self.peripheral(device_id).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn services(&self, device_id: &str) -> Result<Vec<GattService>> {
        let peripheral = self.peripheral(device_id).await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                primary: s.primary,
            })
            .collect())
    }

    async fn characteristics(
        &self,
        device_id: &str,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>> {
        let peripheral = self.peripheral(device_id).await?;
        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.into_iter())
            .map(|c| to_gatt_characteristic(&c))
            .collect())
    }

    async fn probe_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Option<GattCharacteristic>> {
        let peripheral = self.peripheral(device_id).await?;
        Ok(peripheral
            .characteristics()
            .iter()
            .find(|c| c.service_uuid == service_id && c.uuid == characteristic_id)
            .map(to_gatt_characteristic))
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let target = self.find_characteristic(&peripheral, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&target, data, write_type).await?;
        Ok(())
    }

    async fn disconnect_events(&self, device_id: &str) -> Result<BoxStream<'static, ()>> {
        let events = self.adapter.events().await?;
        let watched = device_id.to_string();

        Ok(events
            .filter_map(move |event| {
                let hit = matches!(&event, CentralEvent::DeviceDisconnected(id) if id.to_string() == watched);
                async move { hit.then_some(()) }
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{GENERIC_PRINTER_SERVICE, ISSC_SERVICE};

    fn device(name: Option<&str>, services: &[Uuid]) -> AdvertisedDevice {
        AdvertisedDevice {
            id: "AA:BB".to_string(),
            name: name.map(str::to_string),
            service_ids: services.iter().copied().collect(),
        }
    }

    #[test]
    fn test_matches_service_filter() {
        let d = device(Some("XP-58"), &[GENERIC_PRINTER_SERVICE]);
        assert!(matches_filter(&d, &DeviceFilter::Service(GENERIC_PRINTER_SERVICE)));
        assert!(!matches_filter(&d, &DeviceFilter::Service(ISSC_SERVICE)));
    }

    #[test]
    fn test_matches_name_prefix_ignores_case() {
        let d = device(Some("xp-58IIH"), &[]);
        assert!(matches_filter(&d, &DeviceFilter::NamePrefix("XP-".into())));
        assert!(!matches_filter(&d, &DeviceFilter::NamePrefix("MTP".into())));
        assert!(!matches_filter(&device(None, &[]), &DeviceFilter::NamePrefix("XP-".into())));
    }

    #[test]
    fn test_any_filter_matches_everything() {
        assert!(matches_filter(&device(None, &[]), &DeviceFilter::Any));
    }
}
