use crate::state::PrinterState;
use crate::transport::BleTransport;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const LINK_LOST_REASON: &str = "Printer connection lost";

/// Periodic liveness check for one connected device.
///
/// Runs until its cancellation token fires or it detects the link is gone,
/// in which case it drives the shared disconnect transition itself.
pub struct HealthMonitor {
    transport: Arc<dyn BleTransport>,
    state: Arc<PrinterState>,
    device_id: String,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        state: Arc<PrinterState>,
        device_id: String,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            device_id,
            interval,
        }
    }

    /// Start checking. Abort by cancelling `token`.
    pub fn start(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the link was just verified
            ticker.tick().await;

            info!(
                "Health monitor started for {} (every {:?})",
                self.device_id, self.interval
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Arm bodies are not raced; a cancel cannot interrupt a transition
                        if self.check_once().await {
                            break;
                        }
                    }
                }
            }

            debug!("Health monitor for {} stopped", self.device_id);
        })
    }

    /// One liveness probe. Returns true when it tore the connection down.
    pub async fn check_once(&self) -> bool {
        match self.state.active_connection().await {
            Some(conn) if conn.device.id == self.device_id => {}
            // Not ours anymore; someone else already transitioned
            _ => return false,
        }

        let alive = match self.transport.is_connected(&self.device_id).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Health check on {} failed: {}", self.device_id, e);
                false
            }
        };

        if alive {
            return false;
        }

        warn!("Health check: {} is no longer connected", self.device_id);
        self.state
            .mark_disconnected(LINK_LOST_REASON, Some(&self.device_id))
            .await
            .is_some()
    }
}

/// Forward unsolicited transport disconnect events into the shared transition.
pub fn watch_disconnects(
    mut events: BoxStream<'static, ()>,
    state: Arc<PrinterState>,
    device_id: String,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => {
                    if event.is_none() {
                        debug!("Disconnect event stream for {} ended", device_id);
                        break;
                    }
                    info!("Transport reported disconnect of {}", device_id);
                    state.mark_disconnected(LINK_LOST_REASON, Some(&device_id)).await;
                    break;
                }
            }
        }
    })
}
