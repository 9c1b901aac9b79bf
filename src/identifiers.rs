//! Known BLE thermal printer identifiers.
//!
//! These tables are versioned data, not protocol: extend them as new printer
//! models turn up in the field. Order matters, since discovery and the
//! characteristic fallback both walk them front to back.

use crate::config::{IdentifierProfile, PrinterServiceConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Expand a 16-bit SIG-assigned id onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

pub const GENERIC_PRINTER_SERVICE: Uuid = uuid16(0x18F0);
pub const GENERIC_PRINTER_WRITE: Uuid = uuid16(0x2AF1);
pub const ISSC_SERVICE: Uuid = Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455);
pub const ISSC_WRITE: Uuid = Uuid::from_u128(0x49535343_8841_43F4_A8D4_ECBE34729BB3);
pub const E781_SERVICE: Uuid = Uuid::from_u128(0xE7810A71_73AE_499D_8C15_FAA9AEF0C3F2);
pub const E781_WRITE: Uuid = Uuid::from_u128(0xBEF8D6C9_9C21_4C9E_B632_BD58C1009F9F);
pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NORDIC_UART_RX: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const FF00_SERVICE: Uuid = uuid16(0xFF00);
pub const FF02_WRITE: Uuid = uuid16(0xFF02);
pub const FFE0_SERVICE: Uuid = uuid16(0xFFE0);
pub const FFE1_WRITE: Uuid = uuid16(0xFFE1);
pub const AE30_SERVICE: Uuid = uuid16(0xAE30);
pub const AE01_WRITE: Uuid = uuid16(0xAE01);
pub const FFF0_SERVICE: Uuid = uuid16(0xFFF0);
pub const FFF2_WRITE: Uuid = uuid16(0xFFF2);

const STANDARD_SERVICES: &[Uuid] = &[
    GENERIC_PRINTER_SERVICE,
    ISSC_SERVICE,
    E781_SERVICE,
    NORDIC_UART_SERVICE,
    FF00_SERVICE,
    FFE0_SERVICE,
];

const EXTENDED_SERVICES: &[Uuid] = &[AE30_SERVICE, FFF0_SERVICE];

const STANDARD_WRITE_PAIRS: &[(Uuid, Uuid)] = &[
    (GENERIC_PRINTER_SERVICE, GENERIC_PRINTER_WRITE),
    (ISSC_SERVICE, ISSC_WRITE),
    (E781_SERVICE, E781_WRITE),
    (NORDIC_UART_SERVICE, NORDIC_UART_RX),
    (FF00_SERVICE, FF02_WRITE),
    (FFE0_SERVICE, FFE1_WRITE),
];

const EXTENDED_WRITE_PAIRS: &[(Uuid, Uuid)] = &[(AE30_SERVICE, AE01_WRITE), (FFF0_SERVICE, FFF2_WRITE)];

/// Confidence tag for a discovered peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    ThermalPrinter,
    PosPrinter,
    Unknown,
}

/// Advertised-name prefixes. Model prefixes are strong evidence, generic words weaker.
const STANDARD_NAME_PATTERNS: &[(&str, Classification)] = &[
    ("XP-", Classification::ThermalPrinter),
    ("MTP", Classification::ThermalPrinter),
    ("MPT", Classification::ThermalPrinter),
    ("RPP", Classification::ThermalPrinter),
    ("PT-", Classification::ThermalPrinter),
    ("InnerPrinter", Classification::PosPrinter),
    ("BlueTooth Printer", Classification::PosPrinter),
    ("Printer", Classification::PosPrinter),
    ("POS", Classification::PosPrinter),
];

const EXTENDED_NAME_PATTERNS: &[(&str, Classification)] = &[
    ("TM-", Classification::ThermalPrinter),
    ("SM-", Classification::ThermalPrinter),
    ("TSP", Classification::ThermalPrinter),
    ("ZJ-", Classification::ThermalPrinter),
    ("GOOJPRT", Classification::ThermalPrinter),
    ("MX", Classification::ThermalPrinter),
    ("Thermal", Classification::PosPrinter),
];

/// Lowercase keyword -> brand
const BRAND_KEYWORDS: &[(&str, &str)] = &[
    ("xprinter", "Xprinter"),
    ("xp-", "Xprinter"),
    ("epson", "Epson"),
    ("tm-", "Epson"),
    ("star", "Star Micronics"),
    ("sm-", "Star Micronics"),
    ("tsp", "Star Micronics"),
    ("rongta", "Rongta"),
    ("rpp", "Rongta"),
    ("goojprt", "GOOJPRT"),
    ("zj-", "Zjiang"),
    ("citizen", "Citizen"),
    ("bixolon", "Bixolon"),
    ("sunmi", "Sunmi"),
    ("innerprinter", "Sunmi"),
];

/// Detect printer brand from an advertised name
pub fn detect_brand(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    BRAND_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, brand)| *brand)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    pub prefix: String,
    pub classification: Classification,
}

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        name.to_lowercase().starts_with(&self.prefix.to_lowercase())
    }
}

/// The identifier tables loaded for one manager instance.
#[derive(Debug, Clone)]
pub struct IdentifierTables {
    pub services: Vec<Uuid>,
    pub write_pairs: Vec<(Uuid, Uuid)>,
    pub name_patterns: Vec<NamePattern>,
}

impl IdentifierTables {
    pub fn for_profile(profile: IdentifierProfile) -> Self {
        let mut services = STANDARD_SERVICES.to_vec();
        let mut write_pairs = STANDARD_WRITE_PAIRS.to_vec();
        let mut patterns = STANDARD_NAME_PATTERNS.to_vec();

        if profile == IdentifierProfile::Extended {
            services.extend_from_slice(EXTENDED_SERVICES);
            write_pairs.extend_from_slice(EXTENDED_WRITE_PAIRS);
            // Vendor model prefixes go ahead of the generic words
            let generic_start = patterns
                .iter()
                .position(|(_, c)| *c == Classification::PosPrinter)
                .unwrap_or(patterns.len());
            for (offset, entry) in EXTENDED_NAME_PATTERNS.iter().enumerate() {
                patterns.insert(generic_start + offset, *entry);
            }
        }

        Self {
            services,
            write_pairs,
            name_patterns: patterns
                .into_iter()
                .map(|(prefix, classification)| NamePattern {
                    prefix: prefix.to_string(),
                    classification,
                })
                .collect(),
        }
    }

    pub fn from_config(config: &PrinterServiceConfig) -> Self {
        let mut tables = Self::for_profile(config.identifier_profile);
        for id in &config.extra_service_ids {
            if !tables.services.contains(id) {
                tables.services.push(*id);
            }
        }
        // Operator-supplied prefixes name specific models, so they rank first
        for (i, prefix) in config.extra_name_patterns.iter().enumerate() {
            tables.name_patterns.insert(
                i,
                NamePattern {
                    prefix: prefix.clone(),
                    classification: Classification::ThermalPrinter,
                },
            );
        }
        tables
    }

    pub fn is_known_service(&self, id: &Uuid) -> bool {
        self.services.contains(id)
    }

    pub fn classify_name(&self, name: &str) -> Classification {
        self.name_patterns
            .iter()
            .find(|p| p.matches(name))
            .map(|p| p.classification)
            .unwrap_or(Classification::Unknown)
    }

    /// Name evidence first, then any known printer service.
    pub fn classify<'a>(
        &self,
        name: Option<&str>,
        service_ids: impl IntoIterator<Item = &'a Uuid>,
    ) -> Classification {
        if let Some(name) = name {
            let by_name = self.classify_name(name);
            if by_name != Classification::Unknown {
                return by_name;
            }
        }
        if service_ids.into_iter().any(|id| self.is_known_service(id)) {
            Classification::ThermalPrinter
        } else {
            Classification::Unknown
        }
    }
}

impl Default for IdentifierTables {
    fn default() -> Self {
        Self::for_profile(IdentifierProfile::Standard)
    }
}
