use crate::errors::{PrinterError, Result};
use crate::identifiers::{detect_brand, Classification, IdentifierTables};
use crate::transport::{AdvertisedDevice, BleTransport, DeviceFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A discovered or connected printer candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterDevice {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub service_ids: BTreeSet<Uuid>,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
}

impl PrinterDevice {
    /// Advertised name, or the platform id for nameless peripherals
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Which discovery strategy produced a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ServiceFilter,
    NamePattern,
    Manual,
}

/// Finds printer candidates without the operator knowing any wire-level ids.
///
/// Strategies run in order and the first that yields anything wins:
/// known-service scans, then name-prefix scans, then an unfiltered chooser.
/// Operator cancellation counts as zero matches. When nothing is found, the
/// last transport failure is returned instead of an empty list.
pub struct DeviceDiscovery {
    transport: Arc<dyn BleTransport>,
    tables: IdentifierTables,
}

impl DeviceDiscovery {
    pub fn new(transport: Arc<dyn BleTransport>, tables: IdentifierTables) -> Self {
        Self { transport, tables }
    }

    #[tracing::instrument(skip(self))]
    pub async fn discover(&self) -> Result<Vec<PrinterDevice>> {
        let mut last_failure = None;
        for strategy in [Strategy::ServiceFilter, Strategy::NamePattern, Strategy::Manual] {
            let found = self.run_strategy(strategy, &mut last_failure).await?;
            if !found.is_empty() {
                info!("Discovery via {:?} found {} printer(s)", strategy, found.len());
                return Ok(found);
            }
            debug!("Discovery via {:?} found nothing", strategy);
        }

        if let Some(e) = last_failure {
            warn!("Printer discovery found nothing; last transport error: {}", e);
            return Err(e);
        }
        info!("Printer discovery complete: no devices found");
        Ok(Vec::new())
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        last_failure: &mut Option<PrinterError>,
    ) -> Result<Vec<PrinterDevice>> {
        let filters: Vec<DeviceFilter> = match strategy {
            Strategy::ServiceFilter => self.tables.services.iter().map(|id| DeviceFilter::Service(*id)).collect(),
            Strategy::NamePattern => self
                .tables
                .name_patterns
                .iter()
                .map(|p| DeviceFilter::NamePrefix(p.prefix.clone()))
                .collect(),
            Strategy::Manual => vec![DeviceFilter::Any],
        };

        let mut found: Vec<PrinterDevice> = Vec::new();

        for filter in filters {
            let Some(mut advertised) = self.request(&filter, last_failure).await? else {
                continue;
            };

            if found.iter().any(|d| d.id == advertised.id) {
                continue;
            }

            // A service-filter match proves the device exposes that service
            if let DeviceFilter::Service(id) = &filter {
                advertised.service_ids.insert(*id);
            }

            // Manual picks are kept unclassified; probing could hit the live printer
            let device = self.classify(advertised, strategy != Strategy::Manual).await;
            if device.classification == Classification::Unknown && strategy != Strategy::Manual {
                debug!("Discarding unclassified device {}", device.display_name());
                continue;
            }

            info!(
                "Discovered Bluetooth printer: {} ({}, {:?})",
                device.display_name(),
                device.id,
                device.classification
            );
            found.push(device);
        }

        Ok(found)
    }

    /// Cancellation and per-filter transport hiccups count as zero matches.
    /// Hiccups are kept in `last_failure` so an empty discovery can report them.
    async fn request(
        &self,
        filter: &DeviceFilter,
        last_failure: &mut Option<PrinterError>,
    ) -> Result<Option<AdvertisedDevice>> {
        match self.transport.request_device(filter).await {
            Ok(device) => Ok(device),
            Err(PrinterError::DiscoveryCancelled) => {
                debug!("Device request for {} cancelled", filter);
                Ok(None)
            }
            Err(e @ PrinterError::TransportUnavailable(_)) => Err(e),
            Err(e) => {
                warn!("Device request for {} failed: {}", filter, e);
                *last_failure = Some(e);
                Ok(None)
            }
        }
    }

    async fn classify(&self, mut advertised: AdvertisedDevice, probe: bool) -> PrinterDevice {
        let mut classification = self
            .tables
            .classify(advertised.name.as_deref(), &advertised.service_ids);

        if probe && classification == Classification::Unknown {
            let probed = self.probe_services(&advertised.id).await;
            advertised.service_ids.extend(probed);
            classification = self
                .tables
                .classify(advertised.name.as_deref(), &advertised.service_ids);
        }

        PrinterDevice {
            brand: advertised
                .name
                .as_deref()
                .and_then(detect_brand)
                .map(str::to_string),
            id: advertised.id,
            name: advertised.name,
            service_ids: advertised.service_ids,
            classification,
        }
    }

    /// Connect just long enough to list services. Never leaves the device connected.
    async fn probe_services(&self, device_id: &str) -> Vec<Uuid> {
        if let Err(e) = self.transport.connect(device_id).await {
            debug!("Service probe could not connect to {}: {}", device_id, e);
            return Vec::new();
        }

        let services = match self.transport.services(device_id).await {
            Ok(services) => services.into_iter().map(|s| s.uuid).collect(),
            Err(e) => {
                debug!("Service probe failed on {}: {}", device_id, e);
                Vec::new()
            }
        };

        if let Err(e) = self.transport.disconnect(device_id).await {
            warn!("Failed to disconnect {} after service probe: {}", device_id, e);
        }

        services
    }
}
