//! Connection state shared by the manager, the health monitor and the
//! disconnect listener.
//!
//! Every involuntary or explicit teardown goes through
//! [`PrinterState::mark_disconnected`], which is safe to call redundantly.

use crate::discovery::PrinterDevice;
use crate::queue::JobQueue;
use crate::status::{ConnectionState, PrinterStatus};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use crate::transport::GattCharacteristic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A negotiated, usable printer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub device: PrinterDevice,
    pub write_channel: GattCharacteristic,
}

/// A write channel only exists while connected.
enum Link {
    Disconnected,
    Connecting(PrinterDevice),
    Connected {
        connection: Connection,
        /// Distinguishes this link from a later one to the same device
        session: u64,
        /// Cancels the health monitor and disconnect listener of this link
        background: CancellationToken,
    },
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting(_) => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
        }
    }

    fn device_id(&self) -> Option<&str> {
        match self {
            Link::Disconnected => None,
            Link::Connecting(device) => Some(&device.id),
            Link::Connected { connection, .. } => Some(&connection.device.id),
        }
    }
}

type StatusCallback = Arc<dyn Fn(&PrinterStatus) + Send + Sync>;

#[derive(Default)]
struct StatusListeners {
    next_id: AtomicU64,
    callbacks: StdMutex<Vec<(u64, StatusCallback)>>,
}

impl StatusListeners {
    fn add(&self, callback: StatusCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    fn remove(&self, id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&self, status: &PrinterStatus) {
        // Snapshot so a callback may subscribe/unsubscribe without deadlocking
        let callbacks: Vec<StatusCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(status);
        }
    }

    fn len(&self) -> usize {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Handle returned by [`PrinterState::subscribe`]; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<StatusListeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

pub struct PrinterState {
    link: Mutex<Link>,
    next_session: AtomicU64,
    scanning: AtomicBool,
    queue: JobQueue,
    telemetry: TelemetryCollector,
    listeners: Arc<StatusListeners>,
}

impl PrinterState {
    pub fn new(queue: JobQueue, telemetry: TelemetryCollector) -> Self {
        Self {
            link: Mutex::new(Link::Disconnected),
            next_session: AtomicU64::new(1),
            scanning: AtomicBool::new(false),
            queue,
            telemetry,
            listeners: Arc::new(StatusListeners::default()),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PrinterStatus) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(callback));
        debug!("Status listener {} subscribed ({} total)", id, self.listeners.len());
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub async fn snapshot(&self) -> PrinterStatus {
        let link = self.link.lock().await;
        self.status_of(&link).await
    }

    /// Status as of `link`; callers hold the link lock so a transition and
    /// the status it reports cannot drift apart.
    async fn status_of(&self, link: &Link) -> PrinterStatus {
        let state = link.state();
        PrinterStatus {
            connected: state == ConnectionState::Connected,
            state,
            device_name: match link {
                Link::Connected { connection, .. } => Some(connection.device.display_name().to_string()),
                _ => None,
            },
            is_scanning: self.scanning.load(Ordering::SeqCst),
            queue_length: self.queue.len().await,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.link.lock().await.state()
    }

    pub async fn active_connection(&self) -> Option<Connection> {
        self.active_session().await.map(|(_, connection)| connection)
    }

    /// The live connection together with its session number. A session
    /// number is never reused, even when the same device reconnects.
    pub async fn active_session(&self) -> Option<(u64, Connection)> {
        match &*self.link.lock().await {
            Link::Connected { connection, session, .. } => Some((*session, connection.clone())),
            _ => None,
        }
    }

    pub async fn set_scanning(&self, scanning: bool) {
        let status = {
            let link = self.link.lock().await;
            if self.scanning.swap(scanning, Ordering::SeqCst) == scanning {
                return;
            }
            self.status_of(&link).await
        };
        self.listeners.notify(&status);
    }

    pub async fn begin_connecting(&self, device: &PrinterDevice) {
        let (old, status) = {
            let mut link = self.link.lock().await;
            let old = link.state();
            *link = Link::Connecting(device.clone());
            (old, self.status_of(&link).await)
        };
        self.record_transition(Some(device.id.clone()), old, ConnectionState::Connecting)
            .await;
        self.listeners.notify(&status);
    }

    /// Promote a `Connecting` link for the same device to `Connected`.
    ///
    /// Returns false when the attempt was superseded (e.g. an explicit
    /// disconnect landed while negotiating); the caller must close the session.
    pub async fn install(&self, connection: Connection, background: CancellationToken) -> bool {
        let status = {
            let mut link = self.link.lock().await;
            match &*link {
                Link::Connecting(device) if device.id == connection.device.id => {}
                _ => {
                    warn!(
                        "Connection to {} superseded before it was installed",
                        connection.device.id
                    );
                    return false;
                }
            }
            info!(
                "Printer connected: {} (characteristic {} on service {})",
                connection.device.display_name(),
                connection.write_channel.uuid,
                connection.write_channel.service_uuid
            );
            let device_id = connection.device.id.clone();
            *link = Link::Connected {
                connection,
                session: self.next_session.fetch_add(1, Ordering::Relaxed),
                background,
            };
            let status = self.status_of(&link).await;
            drop(link);
            self.record_transition(Some(device_id), ConnectionState::Connecting, ConnectionState::Connected)
                .await;
            status
        };
        self.listeners.notify(&status);
        true
    }

    /// Revert a failed `Connecting` attempt for `device_id`.
    pub async fn abort_connecting(&self, device_id: &str) {
        let status = {
            let mut link = self.link.lock().await;
            if !matches!(&*link, Link::Connecting(device) if device.id == device_id) {
                return;
            }
            *link = Link::Disconnected;
            self.status_of(&link).await
        };
        self.record_transition(
            Some(device_id.to_string()),
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        )
        .await;
        self.listeners.notify(&status);
    }

    /// The single transition to `Disconnected`.
    ///
    /// Clears the link, stops its background tasks, fails every job still
    /// pending or printing and notifies listeners. `only_device` restricts the
    /// transition to a specific device so a stale monitor cannot tear down a
    /// newer link. No-op when already disconnected. Returns the connection
    /// that was torn down, if any.
    pub async fn mark_disconnected(&self, reason: &str, only_device: Option<&str>) -> Option<Connection> {
        let (old_state, device_id, torn_down, status) = {
            let mut link = self.link.lock().await;
            if matches!(*link, Link::Disconnected) {
                return None;
            }
            if let Some(expected) = only_device {
                if link.device_id() != Some(expected) {
                    return None;
                }
            }

            let old_state = link.state();
            let device_id = link.device_id().map(str::to_string);
            let torn_down = match std::mem::replace(&mut *link, Link::Disconnected) {
                Link::Connected {
                    connection,
                    background,
                    ..
                } => {
                    background.cancel();
                    Some(connection)
                }
                _ => None,
            };
            let status = self.status_of(&link).await;
            (old_state, device_id, torn_down, status)
        };

        info!("Printer {:?} disconnected: {}", device_id, reason);

        let swept = self.queue.fail_live_jobs(reason).await;
        if swept > 0 {
            self.telemetry
                .record_event(TelemetryEvent::JobsSwept {
                    count: swept,
                    reason: reason.to_string(),
                })
                .await;
        }
        self.record_transition(device_id, old_state, ConnectionState::Disconnected)
            .await;
        self.listeners.notify(&status);

        torn_down
    }

    async fn record_transition(&self, device_id: Option<String>, old_state: ConnectionState, new_state: ConnectionState) {
        self.telemetry
            .record_event(TelemetryEvent::ConnectionChanged {
                device_id,
                old_state,
                new_state,
            })
            .await;
    }
}
