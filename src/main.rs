use anyhow::Context;
use async_trait::async_trait;
use std::io::{BufRead, Read, Write};
use std::path::Path;
use std::sync::Arc;
use ticket_printer::bluetooth::{BtleplugTransport, DevicePicker};
use ticket_printer::transport::AdvertisedDevice;
use ticket_printer::{PrinterManager, PrinterServiceConfig};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Numbered chooser on stderr/stdin for the unfiltered discovery fallback.
struct ConsoleDevicePicker;

#[async_trait]
impl DevicePicker for ConsoleDevicePicker {
    async fn pick(&self, candidates: &[AdvertisedDevice]) -> Option<AdvertisedDevice> {
        if candidates.is_empty() {
            return None;
        }
        let candidates = candidates.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = writeln!(stderr, "No known printer found. Nearby devices:");
            for (i, device) in candidates.iter().enumerate() {
                let _ = writeln!(
                    stderr,
                    "  [{}] {} ({})",
                    i + 1,
                    device.name.as_deref().unwrap_or("?"),
                    device.id
                );
            }
            let _ = write!(stderr, "Select a printer (empty to cancel): ");
            let _ = stderr.flush();

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok()?;
            let choice: usize = line.trim().parse().ok()?;
            candidates.get(choice.checked_sub(1)?).cloned()
        })
        .await
        .ok()
        .flatten()
    }
}

/// Console logging, plus a daily-rotated file when `log_dir` is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ticket-printer");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Receipt text from the file named on the command line, else stdin.
fn read_receipt(path: Option<String>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(&path).with_context(|| format!("Failed to read receipt file {}", path)),
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("Failed to read receipt from stdin")?;
            Ok(content)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PrinterServiceConfig::load_or_default().context("Failed to load printer config")?;
    let _log_guard = init_logging(config.log_dir.as_deref());

    info!("Ticket printer v{} starting", env!("CARGO_PKG_VERSION"));

    let receipt = read_receipt(std::env::args().nth(1))?;
    if receipt.trim().is_empty() {
        warn!("Receipt is empty; only formatting and cut will be sent");
    }

    let transport = BtleplugTransport::new(config.scan_window(), Box::new(ConsoleDevicePicker)).await?;
    let manager = PrinterManager::new(Arc::new(transport), &config);

    let _status_log = manager.subscribe(|status| {
        info!(
            "Printer status: {} (device: {}, scanning: {}, jobs: {})",
            status.state,
            status.device_name.as_deref().unwrap_or("-"),
            status.is_scanning,
            status.queue_length
        );
    });

    let device_name = manager
        .discover_and_connect()
        .await
        .context("Could not connect to a printer")?;
    info!("Printing on {}", device_name);

    let outcome = manager.print(&receipt).await;
    manager.disconnect().await;

    let job = outcome.context("Print failed")?;
    let metrics = manager.metrics().await;
    info!(
        "Job {} {} (retries: {}); session success rate {:.0}%",
        job.id,
        job.status,
        job.retry_count,
        metrics.success_rate * 100.0
    );

    Ok(())
}
