use crate::config::PrinterServiceConfig;
use crate::errors::{PrinterError, Result};
use crate::escpos::{print_trailer, serialize_receipt};
use crate::queue::PrintJob;
use crate::state::{Connection, PrinterState};
use crate::status::JobStatus;
use crate::telemetry::TelemetryEvent;
use crate::transport::{BleTransport, WriteMode};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Split a payload into transport-sized writes. The last chunk may be short.
pub fn chunk_payload(payload: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(chunk_size.max(1))
}

/// Serializes receipts and pushes them over the active connection.
///
/// One `print` at a time; a failed attempt restarts from the first chunk
/// until the attempt budget is spent.
pub struct PrintPipeline {
    transport: Arc<dyn BleTransport>,
    state: Arc<PrinterState>,
    chunk_size: usize,
    chunk_delay: Duration,
    write_timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    in_flight: Mutex<()>,
}

impl PrintPipeline {
    pub fn new(transport: Arc<dyn BleTransport>, state: Arc<PrinterState>, config: &PrinterServiceConfig) -> Self {
        Self {
            transport,
            state,
            chunk_size: config.chunk_size,
            chunk_delay: config.chunk_delay(),
            write_timeout: config.write_timeout(),
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay(),
            in_flight: Mutex::new(()),
        }
    }

    /// Print `content` as one receipt. Returns the finished job record.
    ///
    /// The job is bound to the link it started on. If that link is torn
    /// down, the job fails even when another link is up by the next attempt.
    #[tracing::instrument(skip(self, content), fields(len = content.len()))]
    pub async fn print(&self, content: &str) -> Result<PrintJob> {
        let (session, connection) = self.state.active_session().await.ok_or(PrinterError::NotConnected)?;
        let _in_flight = self.in_flight.try_lock().map_err(|_| PrinterError::PrintInProgress)?;

        let queue = self.state.queue();
        let device_id = connection.device.id.clone();
        let mut record = PrintJob::new(content.to_string(), Some(device_id.clone()));
        let job_id = record.id.clone();
        queue.push(record.clone()).await;

        let started = Instant::now();
        let mut retry_count: u32 = 0;

        loop {
            // The link may have dropped or been replaced during the retry delay
            let connection = match self.state.active_session().await {
                Some((current, connection)) if current == session => connection,
                _ => {
                    warn!("Print job {} abandoned: connection to {} is gone", job_id, device_id);
                    self.finish_failed(&job_id, Some(device_id), &PrinterError::NotConnected, retry_count)
                        .await;
                    return Err(PrinterError::NotConnected);
                }
            };

            if retry_count > 0 {
                queue.set_status(&job_id, JobStatus::Pending).await;
            }
            let payload = serialize_receipt(content);
            queue.set_status(&job_id, JobStatus::Printing).await;

            match self.transmit(&connection, &payload).await {
                Ok(()) => {
                    let complete = |job: &mut PrintJob| {
                        job.status = JobStatus::Completed;
                        job.finished_at = Some(Utc::now());
                        job.error_message = None;
                    };
                    complete(&mut record);
                    record.retry_count = retry_count;
                    queue.update(&job_id, complete).await;

                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(
                        "Print job {} completed: {} bytes in {}ms (retries: {})",
                        job_id,
                        payload.len(),
                        duration_ms,
                        retry_count
                    );
                    self.state
                        .telemetry()
                        .record_event(TelemetryEvent::PrintJobCompleted {
                            job_id,
                            device_id: connection.device.id,
                            duration_ms,
                            retry_count,
                        })
                        .await;
                    return Ok(record);
                }
                Err(e) => {
                    retry_count += 1;
                    queue
                        .update(&job_id, |job| {
                            job.status = JobStatus::Failed;
                            job.retry_count = retry_count;
                            job.finished_at = Some(Utc::now());
                            job.error_message = Some(e.to_string());
                        })
                        .await;

                    if e.is_transient() && retry_count < self.max_attempts {
                        warn!(
                            "Print attempt {}/{} for {} failed, retrying in {:?}: {}",
                            retry_count, self.max_attempts, job_id, self.retry_delay, e
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }

                    warn!("Print job {} failed after {} attempts: {}", job_id, retry_count, e);
                    self.finish_failed(&job_id, Some(connection.device.id), &e, retry_count)
                        .await;
                    return Err(PrinterError::RetriesExhausted {
                        attempts: retry_count,
                        last: Box::new(e),
                    });
                }
            }
        }
    }

    async fn finish_failed(&self, job_id: &str, device_id: Option<String>, error: &PrinterError, retry_count: u32) {
        self.state
            .queue()
            .update(job_id, |job| {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
                job.error_message = Some(error.to_string());
            })
            .await;
        self.state
            .telemetry()
            .record_event(TelemetryEvent::PrintJobFailed {
                job_id: job_id.to_string(),
                device_id,
                error: error.to_string(),
                retry_count,
            })
            .await;
    }

    /// Send every chunk in order, pacing between them, then the cut trailer.
    async fn transmit(&self, connection: &Connection, payload: &[u8]) -> Result<()> {
        let mode = connection.write_channel.preferred_write_mode();
        let total = payload.len().div_ceil(self.chunk_size.max(1));

        for (index, chunk) in chunk_payload(payload, self.chunk_size).enumerate() {
            self.write(connection, chunk, mode)
                .await
                .map_err(|reason| PrinterError::ChunkWriteFailed { index, reason })?;

            if index + 1 < total {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        // Acknowledged so we know the cut landed
        self.write(connection, &print_trailer(), WriteMode::WithResponse)
            .await
            .map_err(PrinterError::TrailerWriteFailed)?;

        debug!("Sent {} bytes in {} chunks plus trailer", payload.len(), total);
        Ok(())
    }

    async fn write(&self, connection: &Connection, data: &[u8], mode: WriteMode) -> std::result::Result<(), String> {
        let write = self
            .transport
            .write(&connection.device.id, &connection.write_channel, data, mode);
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(PrinterError::Timeout {
                operation: "write",
                after: self.write_timeout,
            }
            .to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{connected_state, connection, device};
    use crate::transport::MockBleTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn pipeline(transport: MockBleTransport, state: Arc<PrinterState>) -> PrintPipeline {
        PrintPipeline::new(Arc::new(transport), state, &PrinterServiceConfig::default())
    }

    #[test]
    fn test_chunk_payload_sizes() {
        let payload: Vec<u8> = (0..45).collect();
        let sizes: Vec<usize> = chunk_payload(&payload, 20).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(chunk_payload(&[], 20).count(), 0);
    }

    #[tokio::test]
    async fn test_print_without_connection_fails_fast() {
        let mut transport = MockBleTransport::new();
        transport.expect_write().never();
        let state = Arc::new(PrinterState::new(Default::default(), Default::default()));

        let err = pipeline(transport, state.clone()).print("TICKET").await.unwrap_err();
        assert!(matches!(err, PrinterError::NotConnected));
        assert!(state.queue().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailer_uses_acknowledged_write() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_write()
            .withf(|_, _, data, mode| data == print_trailer().as_slice() && *mode == WriteMode::WithResponse)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_write()
            .withf(|_, _, data, mode| data.len() <= 20 && *mode == WriteMode::WithoutResponse)
            .returning(|_, _, _, _| Ok(()));

        let state = connected_state("dev1", CancellationToken::new()).await;
        let job = pipeline(transport, state).print("TICKET #1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_is_three_attempts() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_write()
            .times(3)
            .returning(|_, _, _, _| Err(PrinterError::Bluetooth("GATT error".into())));

        let state = connected_state("dev1", CancellationToken::new()).await;
        let err = pipeline(transport, state.clone()).print("TICKET").await.unwrap_err();

        match err {
            PrinterError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, PrinterError::ChunkWriteFailed { index: 0, .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        let jobs = state.queue().snapshot().await;
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].retry_count, 3);
        assert_eq!(state.telemetry().get_metrics().await.total_jobs_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trailer_retries_whole_job() {
        let trailer_failures = Arc::new(AtomicUsize::new(0));
        let failures = trailer_failures.clone();
        let mut transport = MockBleTransport::new();
        transport.expect_write().returning(move |_, _, _, mode| {
            if mode == WriteMode::WithResponse && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PrinterError::Bluetooth("no ack".into()));
            }
            Ok(())
        });

        let state = connected_state("dev1", CancellationToken::new()).await;
        let job = pipeline(transport, state).print("TICKET").await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(trailer_failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_link_is_gone() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_write()
            .times(1)
            .returning(|_, _, _, _| Err(PrinterError::Bluetooth("link lost".into())));

        let state = connected_state("dev1", CancellationToken::new()).await;
        let pipeline = Arc::new(pipeline(transport, state.clone()));
        let printing = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.print("TICKET").await })
        };

        // Drop the link while the pipeline waits out its retry delay
        tokio::time::sleep(Duration::from_millis(500)).await;
        state.mark_disconnected("link lost", None).await;

        let err = printing.await.unwrap().unwrap_err();
        assert!(matches!(err, PrinterError::NotConnected));
        assert_eq!(state.queue().snapshot().await[0].status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_does_not_resume_on_a_new_link() {
        let mut transport = MockBleTransport::new();
        transport
            .expect_write()
            .times(1)
            .returning(|_, _, _, _| Err(PrinterError::Bluetooth("link lost".into())));

        let state = connected_state("dev1", CancellationToken::new()).await;
        let pipeline = Arc::new(pipeline(transport, state.clone()));
        let printing = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.print("TICKET").await })
        };

        // Same printer comes back before the retry delay ends
        tokio::time::sleep(Duration::from_millis(500)).await;
        state.mark_disconnected("link lost", None).await;
        state.begin_connecting(&device("dev1")).await;
        state.install(connection("dev1"), CancellationToken::new()).await;

        let err = printing.await.unwrap().unwrap_err();
        assert!(matches!(err, PrinterError::NotConnected));

        let job = &state.queue().snapshot().await[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.device_id.as_deref(), Some("dev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_print_is_rejected() {
        let mut transport = MockBleTransport::new();
        transport.expect_write().returning(|_, _, _, _| Ok(()));

        let state = connected_state("dev1", CancellationToken::new()).await;
        let pipeline = Arc::new(pipeline(transport, state));
        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.print("FIRST TICKET").await })
        };
        // Let the first print reach its inter-chunk pause
        tokio::task::yield_now().await;

        let err = pipeline.print("SECOND").await.unwrap_err();
        assert!(matches!(err, PrinterError::PrintInProgress));
        assert!(first.await.unwrap().is_ok());
    }
}
