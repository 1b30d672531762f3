pub mod address;
pub mod brute_force;
pub mod config;
pub mod error;
pub mod model;
pub mod printer;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod snmp;
pub mod targets;
pub mod waste;

pub use address::{build_read, build_write, format_byte_sequence, parse_byte_sequence, EEPROM_LINK};
pub use brute_force::{BruteForceConfig, BruteForceOutcome, ExpectedPattern, PASSWORD_SPACE};
pub use config::ToolConfig;
pub use error::{Error, StorageAction, TransportError};
pub use model::{ModelEntry, Password, WasteGroup, WasteLayout, MAINTENANCE_THRESHOLD};
pub use printer::{
    MaintenanceReading, PrinterFacade, PrinterIdentity, ResetReport, StatsSnapshot, StatsWarning,
    WasteReading,
};
pub use registry::{ModelRegistry, RegistryLoad};
pub use session::{EepromSession, RetryPolicy};
pub use simulator::EepromSimulator;
pub use snmp::{
    MockSnmpClient, Oid, OidParseError, SnmpAddress, SnmpClient, SnmpConfig, SnmpFuture,
    SnmpRequest, SnmpResponse, SnmpValue, SnmpVarBind, SnmpVersion, UdpSnmpClient,
    DEFAULT_SNMP_PORT,
};
