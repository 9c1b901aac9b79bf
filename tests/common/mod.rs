// Common test utilities and fixtures

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use ticket_printer::errors::{PrinterError, Result};
use ticket_printer::identifiers::{Classification, GENERIC_PRINTER_SERVICE, GENERIC_PRINTER_WRITE};
use ticket_printer::transport::{
    AdvertisedDevice, BleTransport, CharacteristicProperties, DeviceFilter, GattCharacteristic,
    GattService, WriteMode,
};
use ticket_printer::{PrinterDevice, PrinterManager, PrinterServiceConfig};
use tokio::sync::{mpsc, RwLock};

/// A write that reached the fake printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub device_id: String,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

/// Scripted in-memory transport
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct FakeTransport {
    pub advertised: Arc<RwLock<Vec<AdvertisedDevice>>>,
    /// Filtered requests behave as if the operator dismissed the chooser
    pub cancel_filtered: Arc<RwLock<bool>>,
    /// Device id the operator picks from the unfiltered chooser
    pub manual_pick: Arc<RwLock<Option<String>>>,
    pub services: Arc<RwLock<Vec<GattService>>>,
    pub characteristics: Arc<RwLock<Vec<GattCharacteristic>>>,
    pub connected: Arc<RwLock<HashSet<String>>>,
    /// Ordered log of connect/disconnect calls, e.g. "connect:dev1"
    pub calls: Arc<RwLock<Vec<String>>>,
    pub writes: Arc<RwLock<Vec<RecordedWrite>>>,
    pub write_attempts: Arc<RwLock<usize>>,
    /// Fail this many upcoming writes
    pub failing_writes: Arc<RwLock<u32>>,
    pub always_fail_writes: Arc<RwLock<bool>>,
    /// Writes never resolve; the pipeline's timeout must fire
    pub stall_writes: Arc<RwLock<bool>>,
    /// Connects never resolve; the negotiator's timeout must fire
    pub stall_connect: Arc<RwLock<bool>>,
    disconnect_senders: Arc<RwLock<Vec<(String, mpsc::UnboundedSender<()>)>>>,
}

#[allow(dead_code)]
impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// One generic 0x18F0 printer service with a single writable characteristic.
    pub async fn with_printer_gatt(self) -> Self {
        *self.services.write().await = vec![GattService {
            uuid: GENERIC_PRINTER_SERVICE,
            primary: true,
        }];
        *self.characteristics.write().await = vec![writable_characteristic()];
        self
    }

    pub async fn advertise(&self, id: &str, name: &str) {
        self.advertised.write().await.push(AdvertisedDevice {
            id: id.to_string(),
            name: Some(name.to_string()),
            service_ids: BTreeSet::new(),
        });
    }

    pub async fn set_cancel_filtered(&self, cancel: bool) {
        *self.cancel_filtered.write().await = cancel;
    }

    pub async fn set_manual_pick(&self, id: Option<&str>) {
        *self.manual_pick.write().await = id.map(str::to_string);
    }

    pub async fn set_failing_writes(&self, count: u32) {
        *self.failing_writes.write().await = count;
    }

    pub async fn set_always_fail_writes(&self, fail: bool) {
        *self.always_fail_writes.write().await = fail;
    }

    pub async fn set_stall_writes(&self, stall: bool) {
        *self.stall_writes.write().await = stall;
    }

    pub async fn set_stall_connect(&self, stall: bool) {
        *self.stall_connect.write().await = stall;
    }

    pub async fn is_linked(&self, id: &str) -> bool {
        self.connected.read().await.contains(id)
    }

    /// Silent drop: the link is gone but no event is raised.
    pub async fn drop_link(&self, id: &str) {
        self.connected.write().await.remove(id);
    }

    /// Drop the link and raise an unsolicited disconnect event.
    pub async fn fire_disconnect(&self, id: &str) {
        self.drop_link(id).await;
        for (device, sender) in self.disconnect_senders.read().await.iter() {
            if device == id {
                let _ = sender.send(());
            }
        }
    }

    pub async fn get_calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }

    pub async fn get_writes(&self) -> Vec<RecordedWrite> {
        self.writes.read().await.clone()
    }

    pub async fn get_write_attempts(&self) -> usize {
        *self.write_attempts.read().await
    }

    async fn find(&self, filter: &DeviceFilter) -> Option<AdvertisedDevice> {
        let advertised = self.advertised.read().await;
        advertised
            .iter()
            .find(|d| match filter {
                DeviceFilter::Service(id) => d.service_ids.contains(id),
                DeviceFilter::NamePrefix(prefix) => d
                    .name
                    .as_deref()
                    .map_or(false, |n| n.to_lowercase().starts_with(&prefix.to_lowercase())),
                DeviceFilter::Any => false,
            })
            .cloned()
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Option<AdvertisedDevice>> {
        if let DeviceFilter::Any = filter {
            let pick = self.manual_pick.read().await.clone();
            let advertised = self.advertised.read().await;
            return match pick.and_then(|id| advertised.iter().find(|d| d.id == id).cloned()) {
                Some(device) => Ok(Some(device)),
                None => Err(PrinterError::DiscoveryCancelled),
            };
        }

        if *self.cancel_filtered.read().await {
            return Err(PrinterError::DiscoveryCancelled);
        }
        Ok(self.find(filter).await)
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        self.calls.write().await.push(format!("connect:{}", device_id));
        if *self.stall_connect.read().await {
            std::future::pending::<()>().await;
        }
        self.connected.write().await.insert(device_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.calls.write().await.push(format!("disconnect:{}", device_id));
        self.connected.write().await.remove(device_id);
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> Result<bool> {
        Ok(self.connected.read().await.contains(device_id))
    }

    async fn services(&self, _device_id: &str) -> Result<Vec<GattService>> {
        Ok(self.services.read().await.clone())
    }

    async fn characteristics(&self, _device_id: &str, service: &GattService) -> Result<Vec<GattCharacteristic>> {
        Ok(self
            .characteristics
            .read()
            .await
            .iter()
            .filter(|c| c.service_uuid == service.uuid)
            .cloned()
            .collect())
    }

    async fn probe_characteristic(
        &self,
        _device_id: &str,
        service_id: uuid::Uuid,
        characteristic_id: uuid::Uuid,
    ) -> Result<Option<GattCharacteristic>> {
        Ok(self
            .characteristics
            .read()
            .await
            .iter()
            .find(|c| c.service_uuid == service_id && c.uuid == characteristic_id)
            .cloned())
    }

    async fn write(
        &self,
        device_id: &str,
        _characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        *self.write_attempts.write().await += 1;

        if *self.stall_writes.read().await {
            std::future::pending::<()>().await;
        }
        if !self.connected.read().await.contains(device_id) {
            return Err(PrinterError::Bluetooth("GATT server disconnected".to_string()));
        }
        if *self.always_fail_writes.read().await {
            return Err(PrinterError::Bluetooth("Simulated write failure".to_string()));
        }
        {
            let mut failing = self.failing_writes.write().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(PrinterError::Bluetooth("Simulated write failure".to_string()));
            }
        }

        self.writes.write().await.push(RecordedWrite {
            device_id: device_id.to_string(),
            data: data.to_vec(),
            mode,
        });
        Ok(())
    }

    async fn disconnect_events(&self, device_id: &str) -> Result<BoxStream<'static, ()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.disconnect_senders.write().await.push((device_id.to_string(), tx));
        Ok(futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }
}

pub fn writable_characteristic() -> GattCharacteristic {
    GattCharacteristic {
        uuid: GENERIC_PRINTER_WRITE,
        service_uuid: GENERIC_PRINTER_SERVICE,
        properties: CharacteristicProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        },
    }
}

#[allow(dead_code)]
pub fn printer(id: &str, name: &str) -> PrinterDevice {
    PrinterDevice {
        id: id.to_string(),
        name: Some(name.to_string()),
        service_ids: BTreeSet::new(),
        classification: Classification::ThermalPrinter,
        brand: None,
    }
}

/// Manager already connected to "dev1" ("XP-58") through a fake transport.
#[allow(dead_code)]
pub async fn connected_manager(config: PrinterServiceConfig) -> (PrinterManager, FakeTransport) {
    let transport = FakeTransport::new().with_printer_gatt().await;
    let manager = PrinterManager::new(Arc::new(transport.clone()), &config);
    manager
        .connect(&printer("dev1", "XP-58"))
        .await
        .expect("fake printer should connect");
    (manager, transport)
}
