use crate::status::ConnectionState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

const MAX_HISTORY: usize = 1000;
const MAX_DURATION_SAMPLES: usize = 1000;

/// Telemetry event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    PrintJobCompleted {
        job_id: String,
        device_id: String,
        duration_ms: u64,
        retry_count: u32,
    },
    PrintJobFailed {
        job_id: String,
        device_id: Option<String>,
        error: String,
        retry_count: u32,
    },
    ConnectionChanged {
        device_id: Option<String>,
        old_state: ConnectionState,
        new_state: ConnectionState,
    },
    /// In-flight jobs failed because the connection went away
    JobsSwept { count: usize, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    /// Retries spent across all finished jobs
    pub total_retries: u64,
    pub avg_print_duration_ms: u64,
    /// Success rate (0.0 - 1.0)
    pub success_rate: f64,
    pub connections: u64,
    pub disconnects: u64,
    pub last_update_ts: u64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self {
            total_jobs_completed: 0,
            total_jobs_failed: 0,
            total_retries: 0,
            avg_print_duration_ms: 0,
            success_rate: 1.0,
            connections: 0,
            disconnects: 0,
            last_update_ts: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Aggregates print and connection events into running metrics
#[derive(Clone)]
pub struct TelemetryCollector {
    metrics: Arc<RwLock<TelemetryMetrics>>,
    event_history: Arc<RwLock<VecDeque<(u64, TelemetryEvent)>>>,
    print_durations: Arc<RwLock<VecDeque<u64>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(TelemetryMetrics::default())),
            event_history: Arc::new(RwLock::new(VecDeque::new())),
            print_durations: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub async fn record_event(&self, event: TelemetryEvent) {
        let timestamp = unix_now();
        let mut metrics = self.metrics.write().await;

        match &event {
            TelemetryEvent::PrintJobCompleted {
                duration_ms,
                retry_count,
                ..
            } => {
                metrics.total_jobs_completed += 1;
                metrics.total_retries += u64::from(*retry_count);

                let mut durations = self.print_durations.write().await;
                durations.push_back(*duration_ms);
                if durations.len() > MAX_DURATION_SAMPLES {
                    durations.pop_front();
                }
                let sum: u64 = durations.iter().sum();
                metrics.avg_print_duration_ms = sum / durations.len() as u64;

                update_success_rate(&mut metrics);
                debug!(
                    "Print job completed - Total: {}, Avg duration: {}ms, Success rate: {:.2}%",
                    metrics.total_jobs_completed,
                    metrics.avg_print_duration_ms,
                    metrics.success_rate * 100.0
                );
            }
            TelemetryEvent::PrintJobFailed { retry_count, .. } => {
                metrics.total_jobs_failed += 1;
                metrics.total_retries += u64::from(*retry_count);
                update_success_rate(&mut metrics);
                debug!(
                    "Print job failed - Total failed: {}, Success rate: {:.2}%",
                    metrics.total_jobs_failed,
                    metrics.success_rate * 100.0
                );
            }
            TelemetryEvent::ConnectionChanged {
                device_id,
                old_state,
                new_state,
            } => {
                match new_state {
                    ConnectionState::Connected => metrics.connections += 1,
                    ConnectionState::Disconnected if *old_state == ConnectionState::Connected => {
                        metrics.disconnects += 1
                    }
                    _ => {}
                }
                debug!("Printer {:?}: {} → {}", device_id, old_state, new_state);
            }
            TelemetryEvent::JobsSwept { count, reason } => {
                debug!("{} job(s) swept: {}", count, reason);
            }
        }

        metrics.last_update_ts = timestamp;
        drop(metrics);

        let mut history = self.event_history.write().await;
        history.push_back((timestamp, event));
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    pub async fn get_metrics(&self) -> TelemetryMetrics {
        self.metrics.read().await.clone()
    }

    /// Last `limit` events, oldest first
    pub async fn get_event_history(&self, limit: usize) -> Vec<(u64, TelemetryEvent)> {
        let history = self.event_history.read().await;
        let start = history.len().saturating_sub(limit);
        history.iter().skip(start).cloned().collect()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn update_success_rate(metrics: &mut TelemetryMetrics) {
    let total = metrics.total_jobs_completed + metrics.total_jobs_failed;
    if total > 0 {
        metrics.success_rate = metrics.total_jobs_completed as f64 / total as f64;
    }
}
