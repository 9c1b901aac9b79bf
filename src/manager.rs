use crate::config::PrinterServiceConfig;
use crate::discovery::{DeviceDiscovery, PrinterDevice};
use crate::errors::{PrinterError, Result};
use crate::identifiers::IdentifierTables;
use crate::negotiator::ConnectionNegotiator;
use crate::pipeline::PrintPipeline;
use crate::queue::{JobQueue, PrintJob};
use crate::state::{PrinterState, Subscription};
use crate::status::PrinterStatus;
use crate::telemetry::{TelemetryCollector, TelemetryEvent, TelemetryMetrics};
use crate::transport::BleTransport;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const OPERATOR_DISCONNECT_REASON: &str = "Printer disconnected";

/// Single entry point for the rest of the application.
///
/// Owns the one printer connection of this process. Discovery, negotiation,
/// printing and health monitoring all sit behind it.
pub struct PrinterManager {
    transport: Arc<dyn BleTransport>,
    state: Arc<PrinterState>,
    discovery: DeviceDiscovery,
    negotiator: ConnectionNegotiator,
    pipeline: PrintPipeline,
    /// Serializes connect attempts
    connecting: Mutex<()>,
}

impl PrinterManager {
    pub fn new(transport: Arc<dyn BleTransport>, config: &PrinterServiceConfig) -> Self {
        let tables = IdentifierTables::from_config(config);
        let state = Arc::new(PrinterState::new(JobQueue::new(), TelemetryCollector::new()));

        info!(
            "Printer manager ready ({:?} identifiers: {} services, {} name patterns)",
            config.identifier_profile,
            tables.services.len(),
            tables.name_patterns.len()
        );

        Self {
            negotiator: ConnectionNegotiator::new(
                transport.clone(),
                state.clone(),
                tables.write_pairs.clone(),
                config.connect_timeout(),
                config.health_check_interval(),
            ),
            discovery: DeviceDiscovery::new(transport.clone(), tables),
            pipeline: PrintPipeline::new(transport.clone(), state.clone(), config),
            transport,
            state,
            connecting: Mutex::new(()),
        }
    }

    /// Run discovery only, without connecting.
    pub async fn discover(&self) -> Result<Vec<PrinterDevice>> {
        self.state.set_scanning(true).await;
        let result = self.discovery.discover().await;
        self.state.set_scanning(false).await;
        result
    }

    /// Discover printers and connect to the first one. Returns its display name.
    #[tracing::instrument(skip(self))]
    pub async fn discover_and_connect(&self) -> Result<String> {
        let devices = self.discover().await?;
        let device = devices.into_iter().next().ok_or(PrinterError::NoPrinterFound)?;
        self.connect(&device).await
    }

    /// Connect to a known device, replacing any current connection.
    pub async fn connect(&self, device: &PrinterDevice) -> Result<String> {
        let _connecting = self.connecting.lock().await;
        let connection = self.negotiator.connect(device).await?;
        Ok(connection.device.display_name().to_string())
    }

    pub async fn print(&self, content: &str) -> Result<PrintJob> {
        self.pipeline.print(content).await
    }

    pub async fn status(&self) -> PrinterStatus {
        self.state.snapshot().await
    }

    /// Idempotent. Live jobs end `failed`; history is kept.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        match self.state.mark_disconnected(OPERATOR_DISCONNECT_REASON, None).await {
            Some(connection) => {
                if let Err(e) = self.transport.disconnect(&connection.device.id).await {
                    warn!("Failed to close printer session cleanly: {}", e);
                }
            }
            None => {
                self.state.queue().fail_live_jobs(OPERATOR_DISCONNECT_REASON).await;
            }
        }
    }

    /// Register a status listener, called after every state transition.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PrinterStatus) + Send + Sync + 'static,
    {
        self.state.subscribe(callback)
    }

    pub async fn jobs(&self) -> Vec<PrintJob> {
        self.state.queue().snapshot().await
    }

    pub async fn clear_jobs(&self) -> usize {
        self.state.queue().clear().await
    }

    pub async fn metrics(&self) -> TelemetryMetrics {
        self.state.telemetry().get_metrics().await
    }

    /// The last `limit` telemetry events with their unix timestamps, oldest first.
    pub async fn events(&self, limit: usize) -> Vec<(u64, TelemetryEvent)> {
        self.state.telemetry().get_event_history(limit).await
    }
}
