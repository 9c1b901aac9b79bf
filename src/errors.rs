use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrinterError {
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Device selection cancelled")]
    DiscoveryCancelled,

    #[error("No compatible printer found")]
    NoPrinterFound,

    #[error("Failed to connect to {device}: {reason}")]
    TransportConnect { device: String, reason: String },

    #[error("No writable characteristic found on {0}")]
    NoWritableCharacteristicFound(String),

    #[error("Printer not connected")]
    NotConnected,

    #[error("A print job is already in flight")]
    PrintInProgress,

    #[error("Chunk {index} write failed: {reason}")]
    ChunkWriteFailed { index: usize, reason: String },

    #[error("Trailer write failed: {0}")]
    TrailerWriteFailed(String),

    #[error("Print failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<PrinterError>,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<btleplug::Error> for PrinterError {
    fn from(e: btleplug::Error) -> Self {
        PrinterError::Bluetooth(e.to_string())
    }
}

impl PrinterError {
    /// Errors absorbed by the print retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PrinterError::ChunkWriteFailed { .. }
                | PrinterError::TrailerWriteFailed(_)
                | PrinterError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PrinterError>;
