use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::{format_byte_sequence, parse_byte_sequence};
use crate::error::Error;
use crate::snmp::Oid;
use crate::waste::{self, WasteCounter};

/// Register value that flags "maintenance required" on several models.
pub const MAINTENANCE_THRESHOLD: u8 = 94;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Password([u8; 2]);

impl Password {
    pub const fn new(first: u8, second: u8) -> Self {
        Self([first, second])
    }

    /// Candidate order for brute force: the high byte is sent first.
    pub const fn from_u16(value: u16) -> Self {
        let [high, low] = value.to_be_bytes();
        Self([high, low])
    }

    pub const fn bytes(self) -> [u8; 2] {
        self.0
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0[0], self.0[1])
    }
}

impl FromStr for Password {
    type Err = Error;

    /// Accepts the `first.second` form used in logs and on the command line.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = parse_byte_sequence("password", value)?;
        match bytes.as_slice() {
            [first, second] => Ok(Self([*first, *second])),
            other => Err(Error::invalid_parameter(
                "password",
                format!("expected two bytes, got {}", other.len()),
            )),
        }
    }
}

/// How the registers of a waste group combine into one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasteLayout {
    Pair { low: u8, high: u8 },
    /// SHOWN is `(shown_low, high)`, REAL is `(real_low, high)`.
    ShownReal { shown_low: u8, high: u8, real_low: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WasteGroup {
    oids: Vec<u8>,
    total: Option<f64>,
}

impl WasteGroup {
    pub fn new(oids: Vec<u8>, total: Option<f64>) -> Result<Self, Error> {
        if !(2..=3).contains(&oids.len()) {
            return Err(Error::invalid_parameter(
                "oids",
                format!("expected 2 or 3 registers, got {}", oids.len()),
            ));
        }
        for (index, oid) in oids.iter().enumerate() {
            if oids[..index].contains(oid) {
                return Err(Error::invalid_parameter(
                    "oids",
                    format!("register {oid} repeats within the group"),
                ));
            }
        }
        if let Some(total) = total {
            if !total.is_finite() || total <= 0.0 {
                return Err(Error::invalid_parameter(
                    "total",
                    format!("{total} is not a positive number"),
                ));
            }
        }
        Ok(Self { oids, total })
    }

    /// Builds a group whose full-scale total is derived from its registers
    /// read at a known percentage, typically 80 after a trial reset.
    /// `registers` holds one value per OID, in `oids` order.
    pub fn calibrated(oids: Vec<u8>, registers: &[u8], percentage: f64) -> Result<Self, Error> {
        let group = Self::new(oids, None)?;
        let raw = group.counter(registers)?.effective();
        let total = if raw == 0 {
            None
        } else {
            Some(waste::calibrate(raw, percentage)?)
        };
        Ok(Self { total, ..group })
    }

    /// Combines register values listed in `oids` order into this group's
    /// counter.
    pub fn counter(&self, registers: &[u8]) -> Result<WasteCounter, Error> {
        if registers.len() != self.oids.len() {
            return Err(Error::invalid_parameter(
                "registers",
                format!(
                    "expected {} values for {:?}, got {}",
                    self.oids.len(),
                    self.oids,
                    registers.len()
                ),
            ));
        }
        Ok(waste::counter(self.layout(), |oid| {
            self.oids
                .iter()
                .zip(registers)
                .find_map(|(known, value)| (*known == oid).then_some(*value))
                .unwrap_or_default()
        }))
    }

    pub fn oids(&self) -> &[u8] {
        &self.oids
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    pub fn layout(&self) -> WasteLayout {
        let (low, high) = (self.oids[0], self.oids[1]);
        match self.oids.get(2) {
            Some(&real_low) => WasteLayout::ShownReal {
                shown_low: low,
                high,
                real_low,
            },
            None => WasteLayout::Pair { low, high },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub password: Password,
    pub eeprom_link: Oid,
    pub eeprom_write: Vec<u8>,
    pub ink_levels: BTreeMap<String, u8>,
    /// Ink channel to byte offset in the status reply.
    pub ink_status: BTreeMap<String, u8>,
    pub waste_inks: Vec<WasteGroup>,
    pub maintenance_levels: Vec<u8>,
    pub unknown_oids: Vec<u8>,
}

impl ModelEntry {
    pub fn with_password(&self, password: Password) -> Self {
        Self {
            password,
            ..self.clone()
        }
    }

    pub fn to_record(&self) -> ModelRecord {
        ModelRecord {
            password: self.password.bytes(),
            eeprom_link: self.eeprom_link.to_string(),
            eeprom_write: format_byte_sequence(&self.eeprom_write),
            ink_levels: self.ink_levels.clone(),
            ink_status: self.ink_status.clone(),
            waste_inks: self
                .waste_inks
                .iter()
                .map(|group| WasteGroupRecord {
                    oids: group.oids.clone(),
                    total: group.total,
                })
                .collect(),
            maintenance_levels: self.maintenance_levels.clone(),
            unknown_oids: self.unknown_oids.clone(),
        }
    }
}

/// Persisted shape of a model entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub password: [u8; 2],
    pub eeprom_link: String,
    pub eeprom_write: String,
    pub ink_levels: BTreeMap<String, u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ink_status: BTreeMap<String, u8>,
    pub waste_inks: Vec<WasteGroupRecord>,
    pub maintenance_levels: Vec<u8>,
    #[serde(default)]
    pub unknown_oids: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasteGroupRecord {
    pub oids: Vec<u8>,
    pub total: Option<f64>,
}
