//! In-memory stand-in for a printer's SNMP agent.
//!
//! Answers the EEPROM command grammar from `address` against a 256-byte
//! register file gated by a password, plus any plain OIDs it was seeded with.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::address::{parse_read, parse_write};
use crate::error::TransportError;
use crate::model::{ModelEntry, Password};
use crate::snmp::{
    duration_ms, Oid, SnmpClient, SnmpFuture, SnmpRequest, SnmpResponse, SnmpValue, SnmpVarBind,
};

const REJECTED: &str = "@BDC PS\r\nNA;";

#[derive(Debug)]
pub struct EepromSimulator {
    link: Oid,
    password: Option<Password>,
    write_suffix: Vec<u8>,
    registers: Mutex<[u8; 256]>,
    values: HashMap<Oid, SnmpValue>,
    timeouts: HashSet<u8>,
    transient: Mutex<HashMap<u8, u32>>,
    attempts: AtomicU64,
}

impl EepromSimulator {
    /// A device that accepts `model`'s password and write suffix.
    pub fn new(model: &ModelEntry) -> Self {
        Self {
            link: model.eeprom_link.clone(),
            password: Some(model.password),
            write_suffix: model.eeprom_write.clone(),
            registers: Mutex::new([0; 256]),
            values: HashMap::new(),
            timeouts: HashSet::new(),
            transient: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    /// `None` models a unit that rejects every password.
    pub fn with_password(mut self, password: Option<Password>) -> Self {
        self.password = password;
        self
    }

    pub fn with_register(self, oid: u8, value: u8) -> Self {
        if let Ok(mut registers) = self.registers.lock() {
            registers[usize::from(oid)] = value;
        }
        self
    }

    pub fn with_value(mut self, oid: Oid, value: SnmpValue) -> Self {
        self.values.insert(oid, value);
        self
    }

    /// Every exchange touching EEPROM address `oid` times out.
    pub fn with_timeout_on(mut self, oid: u8) -> Self {
        self.timeouts.insert(oid);
        self
    }

    /// The next `count` exchanges touching `oid` time out.
    pub fn with_transient_failures(self, oid: u8, count: u32) -> Self {
        if let Ok(mut transient) = self.transient.lock() {
            transient.insert(oid, count);
        }
        self
    }

    pub fn register(&self, oid: u8) -> u8 {
        self.registers
            .lock()
            .map(|registers| registers[usize::from(oid)])
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &SnmpRequest, oid: &Oid) -> Result<SnmpValue, TransportError> {
        let address = request.address.to_string();
        let timeout = || TransportError::Timeout {
            address: address.clone(),
            timeout_ms: request.timeout.map_or(0, duration_ms),
        };

        if let Ok(read) = parse_read(&self.link, oid) {
            if self.drops(read.oid) {
                return Err(timeout());
            }
            if self.password != Some(read.password) {
                return Ok(SnmpValue::text(REJECTED));
            }
            let value = self.register(read.oid);
            return Ok(SnmpValue::text(format!(
                "@BDC PS\r\nEE:00{:02X}{:02X};",
                read.oid, value
            )));
        }

        if let Ok(write) = parse_write(&self.link, oid) {
            if self.drops(write.oid) {
                return Err(timeout());
            }
            if self.password != Some(write.password) || write.suffix != self.write_suffix {
                return Ok(SnmpValue::text(REJECTED));
            }
            if let Ok(mut registers) = self.registers.lock() {
                registers[usize::from(write.oid)] = write.value;
            }
            return Ok(SnmpValue::text("@BDC PS\r\nOK;"));
        }

        Ok(self
            .values
            .get(oid)
            .cloned()
            .unwrap_or_else(|| SnmpValue::Other("NoSuchObject".to_string())))
    }

    fn drops(&self, oid: u8) -> bool {
        if self.timeouts.contains(&oid) {
            return true;
        }
        if let Ok(mut transient) = self.transient.lock() {
            if let Some(remaining) = transient.get_mut(&oid) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        false
    }
}

impl SnmpClient for EepromSimulator {
    fn get<'a>(&'a self, request: SnmpRequest) -> SnmpFuture<'a> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let mut varbinds = Vec::with_capacity(request.oids.len());
            for oid in &request.oids {
                let value = self.respond(&request, oid)?;
                varbinds.push(SnmpVarBind {
                    oid: oid.clone(),
                    value,
                });
            }
            Ok(SnmpResponse {
                address: request.address.clone(),
                varbinds,
            })
        })
    }
}
