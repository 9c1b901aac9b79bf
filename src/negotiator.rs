use crate::discovery::PrinterDevice;
use crate::errors::{PrinterError, Result};
use crate::health::{watch_disconnects, HealthMonitor};
use crate::state::{Connection, PrinterState};
use crate::transport::{BleTransport, GattCharacteristic};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns a chosen device into a usable link: transport session plus one
/// writable characteristic, with background monitoring attached.
pub struct ConnectionNegotiator {
    transport: Arc<dyn BleTransport>,
    state: Arc<PrinterState>,
    write_pairs: Vec<(Uuid, Uuid)>,
    connect_timeout: Duration,
    health_interval: Duration,
}

impl ConnectionNegotiator {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        state: Arc<PrinterState>,
        write_pairs: Vec<(Uuid, Uuid)>,
        connect_timeout: Duration,
        health_interval: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            write_pairs,
            connect_timeout,
            health_interval,
        }
    }

    #[tracing::instrument(skip(self, device), fields(device = %device.display_name()))]
    pub async fn connect(&self, device: &PrinterDevice) -> Result<Connection> {
        // At most one live link
        if let Some(previous) = self.state.mark_disconnected("Switching printer", None).await {
            info!("Closing previous printer {}", previous.device.display_name());
            if let Err(e) = self.transport.disconnect(&previous.device.id).await {
                warn!("Failed to close previous printer session: {}", e);
            }
        }

        self.state.begin_connecting(device).await;

        let write_channel = match self.negotiate(device).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Connection to {} failed: {}", device.display_name(), e);
                self.state.abort_connecting(&device.id).await;
                return Err(e);
            }
        };

        let connection = Connection {
            device: device.clone(),
            write_channel,
        };

        let events = match self.transport.disconnect_events(&device.id).await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Disconnect notifications unavailable for {}: {}", device.id, e);
                None
            }
        };

        let background = CancellationToken::new();
        if !self.state.install(connection.clone(), background.clone()).await {
            self.close_quietly(&device.id).await;
            return Err(PrinterError::TransportConnect {
                device: device.id.clone(),
                reason: "connection attempt superseded".to_string(),
            });
        }

        if let Some(events) = events {
            watch_disconnects(events, self.state.clone(), device.id.clone(), background.clone());
        }
        HealthMonitor::new(
            self.transport.clone(),
            self.state.clone(),
            device.id.clone(),
            self.health_interval,
        )
        .start(background);

        Ok(connection)
    }

    async fn negotiate(&self, device: &PrinterDevice) -> Result<GattCharacteristic> {
        match tokio::time::timeout(self.connect_timeout, self.transport.connect(&device.id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e @ PrinterError::TransportConnect { .. })) => return Err(e),
            Ok(Err(e)) => {
                return Err(PrinterError::TransportConnect {
                    device: device.id.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                // The session may be half-open
                self.close_quietly(&device.id).await;
                return Err(PrinterError::TransportConnect {
                    device: device.id.clone(),
                    reason: PrinterError::Timeout {
                        operation: "connect",
                        after: self.connect_timeout,
                    }
                    .to_string(),
                });
            }
        }

        match self.select_write_channel(&device.id).await {
            Some(channel) => {
                debug!(
                    "Selected write characteristic {} ({:?})",
                    channel.uuid,
                    channel.preferred_write_mode()
                );
                Ok(channel)
            }
            None => {
                self.close_quietly(&device.id).await;
                Err(PrinterError::NoWritableCharacteristicFound(
                    device.display_name().to_string(),
                ))
            }
        }
    }

    /// First writable characteristic in service enumeration order, else the
    /// first known (service, characteristic) pair that resolves.
    async fn select_write_channel(&self, device_id: &str) -> Option<GattCharacteristic> {
        match self.transport.services(device_id).await {
            Ok(services) => {
                for service in &services {
                    let characteristics = match self.transport.characteristics(device_id, service).await {
                        Ok(characteristics) => characteristics,
                        Err(e) => {
                            debug!("Could not list characteristics of {}: {}", service.uuid, e);
                            continue;
                        }
                    };
                    if let Some(c) = characteristics.into_iter().find(|c| c.properties.is_writable()) {
                        return Some(c);
                    }
                }
            }
            Err(e) => debug!("Service enumeration failed on {}: {}", device_id, e),
        }

        for (service_id, characteristic_id) in &self.write_pairs {
            match self
                .transport
                .probe_characteristic(device_id, *service_id, *characteristic_id)
                .await
            {
                Ok(Some(c)) => {
                    info!("Using known write characteristic {} on {}", c.uuid, c.service_uuid);
                    return Some(c);
                }
                Ok(None) => {}
                Err(e) => debug!("Probe of {}/{} failed: {}", service_id, characteristic_id, e),
            }
        }

        None
    }

    async fn close_quietly(&self, device_id: &str) {
        if let Err(e) = self.transport.disconnect(device_id).await {
            debug!("Ignoring disconnect error for {}: {}", device_id, e);
        }
    }
}
