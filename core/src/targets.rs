pub const SNMP: &str = "wasteink::snmp";
pub const SESSION: &str = "wasteink::session";
pub const BRUTE_FORCE: &str = "wasteink::brute_force";
pub const REGISTRY: &str = "wasteink::registry";
pub const PRINTER: &str = "wasteink::printer";
pub const APP: &str = "wasteink::app";
