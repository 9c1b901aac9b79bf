use crate::errors::{PrinterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Which set of known printer identifiers is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierProfile {
    /// Generic ESC/POS BLE modules (ISSC, Nordic UART, 0x18F0 family)
    #[default]
    Standard,
    /// Standard plus vendor-specific services and model prefixes
    Extended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterServiceConfig {
    /// Bytes per BLE write (conservative ATT MTU of 23 minus header)
    pub chunk_size: usize,
    /// Pause between chunks so the printer's receive buffer can drain
    pub chunk_delay_ms: u64,
    /// Total attempts per print, including the first
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How long a filtered scan listens before giving up
    pub scan_window_secs: u64,
    pub identifier_profile: IdentifierProfile,
    pub extra_name_patterns: Vec<String>,
    pub extra_service_ids: Vec<uuid::Uuid>,
    pub log_dir: Option<PathBuf>,
}

impl Default for PrinterServiceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            chunk_delay_ms: 50,
            max_attempts: 3,
            retry_delay_ms: 1000,
            health_check_interval_secs: 10,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 2_000,
            scan_window_secs: 5,
            identifier_profile: IdentifierProfile::Standard,
            extra_name_patterns: Vec::new(),
            extra_service_ids: Vec::new(),
            log_dir: None,
        }
    }
}

impl PrinterServiceConfig {
    /// Default location of the config file for this platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("ticket-printer"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        debug!("Loaded printer config from {}", path.display());
        Ok(config)
    }

    /// Load from the default path, falling back to defaults when no file exists.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PrinterError::Config("chunk_size must be greater than 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(PrinterError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.health_check_interval_secs == 0 {
            return Err(PrinterError::Config(
                "health_check_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_ble_printer_constants() {
        let config = PrinterServiceConfig::default();
        assert_eq!(config.chunk_size, 20);
        assert_eq!(config.chunk_delay(), Duration::from_millis(50));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"chunk_size": 64, "identifier_profile": "extended"}}"#).unwrap();

        let config = PrinterServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.identifier_profile, IdentifierProfile::Extended);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.write_timeout_ms, 2_000);
    }

    #[test]
    fn test_load_rejects_zero_chunk_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"chunk_size": 0}}"#).unwrap();

        let err = PrinterServiceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PrinterError::Config(_)));
    }

    #[test]
    fn test_load_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = PrinterServiceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PrinterError::Json(_)));
    }
}
