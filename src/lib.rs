//! Bluetooth thermal printer connection manager.
//!
//! Finds a nearby ESC/POS printer, negotiates a writable GATT characteristic,
//! prints receipts in paced chunks with bounded retries and watches the link
//! for silent drops. [`PrinterManager`] is the entry point.

pub mod bluetooth;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod escpos;
pub mod health;
pub mod identifiers;
pub mod manager;
pub mod negotiator;
pub mod pipeline;
pub mod queue;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod transport;

pub use config::{IdentifierProfile, PrinterServiceConfig};
pub use discovery::PrinterDevice;
pub use errors::{PrinterError, Result};
pub use manager::PrinterManager;
pub use queue::PrintJob;
pub use state::Subscription;
pub use status::{ConnectionState, JobStatus, PrinterStatus};
pub use transport::BleTransport;
