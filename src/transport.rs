//! Wireless transport capability surface.
//!
//! The connection manager depends only on [`BleTransport`]; the btleplug
//! backend lives in [`crate::bluetooth`] and tests substitute scripted fakes.

use crate::errors::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// What a device request should match on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Peripherals advertising this service
    Service(Uuid),
    /// Peripherals whose advertised name starts with this prefix
    NamePrefix(String),
    /// No filter: the operator picks from everything in range
    Any,
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::Service(id) => write!(f, "service {}", id),
            DeviceFilter::NamePrefix(prefix) => write!(f, "name prefix '{}'", prefix),
            DeviceFilter::Any => f.write_str("any device"),
        }
    }
}

/// A peripheral as reported by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub id: String,
    pub name: Option<String>,
    pub service_ids: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// Addressable GATT endpoint; identified by its service and its own uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl GattCharacteristic {
    /// Fire-and-forget when the characteristic allows it
    pub fn preferred_write_mode(&self) -> WriteMode {
        if self.properties.write_without_response {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Ask for one peripheral matching `filter`. `Ok(None)` means the operator
    /// dismissed the prompt or nothing matched; it is not an error.
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Option<AdvertisedDevice>>;

    async fn connect(&self, device_id: &str) -> Result<()>;

    async fn disconnect(&self, device_id: &str) -> Result<()>;

    async fn is_connected(&self, device_id: &str) -> Result<bool>;

    async fn services(&self, device_id: &str) -> Result<Vec<GattService>>;

    async fn characteristics(
        &self,
        device_id: &str,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>>;

    /// Look up one characteristic directly by its service and characteristic ids.
    async fn probe_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Option<GattCharacteristic>>;

    async fn write(
        &self,
        device_id: &str,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Stream yielding once per unsolicited disconnect of `device_id`.
    async fn disconnect_events(&self, device_id: &str) -> Result<BoxStream<'static, ()>>;
}
