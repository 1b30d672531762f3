use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snmp2::{AsyncSession, Error as Snmp2Error, Oid as Snmp2Oid, Value as Snmp2Value};

use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::targets;

pub const DEFAULT_SNMP_PORT: u16 = 161;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnmpAddress {
    pub host: String,
    #[serde(default = "default_snmp_port")]
    pub port: u16,
}

impl SnmpAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_SNMP_PORT)
    }
}

impl fmt::Display for SnmpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn default_snmp_port() -> u16 {
    DEFAULT_SNMP_PORT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[default]
    V1,
    V2c,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnmpConfig {
    pub community: String,
    pub timeout_ms: u64,
    pub version: SnmpVersion,
    pub port: u16,
}

impl SnmpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            community: "public".to_string(),
            timeout_ms: 2_000,
            version: SnmpVersion::V1,
            port: DEFAULT_SNMP_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnmpRequest {
    pub address: SnmpAddress,
    pub community: Option<String>,
    pub oids: Vec<Oid>,
    pub timeout: Option<Duration>,
}

impl SnmpRequest {
    pub fn new(address: SnmpAddress, oids: Vec<Oid>) -> Self {
        Self {
            address,
            community: None,
            oids,
            timeout: None,
        }
    }

    pub fn single(address: SnmpAddress, oid: Oid) -> Self {
        Self::new(address, vec![oid])
    }

    pub fn with_community(mut self, community: impl Into<String>) -> Self {
        self.community = Some(community.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SnmpResponse {
    pub address: SnmpAddress,
    pub varbinds: Vec<SnmpVarBind>,
}

impl SnmpResponse {
    pub fn single(address: SnmpAddress, oid: Oid, value: SnmpValue) -> Self {
        Self {
            address,
            varbinds: vec![SnmpVarBind { oid, value }],
        }
    }

    /// Value bound to `oid`, or the first value when the agent rewrote the OID.
    pub fn value_for(&self, oid: &Oid) -> Option<&SnmpValue> {
        self.varbinds
            .iter()
            .find(|varbind| varbind.oid == *oid)
            .or_else(|| self.varbinds.first())
            .map(|varbind| &varbind.value)
    }
}

#[derive(Debug, Clone)]
pub struct SnmpVarBind {
    pub oid: Oid,
    pub value: SnmpValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    pub fn from_slice(slice: &[u32]) -> Self {
        Self(slice.to_vec())
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl From<Vec<u32>> for Oid {
    fn from(value: Vec<u32>) -> Self {
        Self(value)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            first = false;
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidParseError {
    pub component: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid OID component: {}", self.component)
    }
}

impl std::error::Error for OidParseError {}

impl FromStr for Oid {
    type Err = OidParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = Vec::new();
        for part in value.split('.') {
            if part.is_empty() {
                continue;
            }
            let parsed = part.parse::<u32>().map_err(|_| OidParseError {
                component: part.to_string(),
            })?;
            parts.push(parsed);
        }

        if parts.is_empty() {
            return Err(OidParseError {
                component: value.to_string(),
            });
        }

        Ok(Oid(parts))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Null,
    Integer(i64),
    Unsigned32(u32),
    Counter32(u32),
    Counter64(u64),
    Timeticks(u32),
    OctetString(Vec<u8>),
    ObjectIdentifier(Oid),
    IpAddress([u8; 4]),
    Opaque(Vec<u8>),
    Other(String),
}

impl SnmpValue {
    pub fn text(value: impl Into<String>) -> Self {
        SnmpValue::OctetString(value.into().into_bytes())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SnmpValue::OctetString(bytes) | SnmpValue::Opaque(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text_lossy(&self) -> Option<String> {
        match self {
            SnmpValue::OctetString(bytes) | SnmpValue::Opaque(bytes) => {
                Some(String::from_utf8_lossy(bytes).to_string())
            }
            _ => None,
        }
    }

    /// `NoSuchObject`, `NoSuchInstance`, `EndOfMibView` and NULL carry no data.
    pub fn is_missing(&self) -> bool {
        matches!(self, SnmpValue::Null | SnmpValue::Other(_))
    }
}

impl fmt::Display for SnmpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpValue::Null => f.write_str("null"),
            SnmpValue::Integer(value) => write!(f, "{value}"),
            SnmpValue::Unsigned32(value) => write!(f, "{value}"),
            SnmpValue::Counter32(value) => write!(f, "{value}"),
            SnmpValue::Counter64(value) => write!(f, "{value}"),
            SnmpValue::Timeticks(value) => write!(f, "{value} ticks"),
            SnmpValue::OctetString(bytes) | SnmpValue::Opaque(bytes) => {
                f.write_str(&String::from_utf8_lossy(bytes))
            }
            SnmpValue::ObjectIdentifier(oid) => write!(f, "{oid}"),
            SnmpValue::IpAddress(bytes) => {
                write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
            }
            SnmpValue::Other(value) => f.write_str(value),
        }
    }
}

pub type SnmpFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SnmpResponse, TransportError>> + Send + 'a>>;

/// A single SNMP GET exchange. Implementations make exactly one attempt per
/// call; retry policy belongs to the caller.
pub trait SnmpClient: Send + Sync {
    fn get<'a>(&'a self, request: SnmpRequest) -> SnmpFuture<'a>;
}

impl<C: SnmpClient + ?Sized> SnmpClient for Arc<C> {
    fn get<'a>(&'a self, request: SnmpRequest) -> SnmpFuture<'a> {
        (**self).get(request)
    }
}

#[derive(Debug, Clone)]
pub struct UdpSnmpClient {
    config: SnmpConfig,
}

impl UdpSnmpClient {
    pub fn new(config: SnmpConfig) -> Self {
        Self { config }
    }

    pub async fn get(&self, request: SnmpRequest) -> Result<SnmpResponse, TransportError> {
        let SnmpRequest {
            address,
            community,
            oids,
            timeout,
        } = request;

        let community = community.unwrap_or_else(|| self.config.community.clone());
        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let address_label = address.to_string();

        debug!(
            target: targets::SNMP,
            address = %address_label,
            oids = oids.len(),
            timeout_ms = duration_ms(timeout),
            version = ?self.config.version,
            "SNMP GET"
        );

        for oid in &oids {
            trace!(target: targets::SNMP, address = %address_label, oid = %oid, "SNMP OID");
        }

        match async_get(address, community, oids, self.config.version, timeout).await {
            Ok(response) => {
                for varbind in &response.varbinds {
                    trace!(
                        target: targets::SNMP,
                        address = %address_label,
                        oid = %varbind.oid,
                        value = %varbind.value,
                        "SNMP value"
                    );
                }
                Ok(response)
            }
            Err(error) => {
                warn!(
                    target: targets::SNMP,
                    address = %address_label,
                    error = %error,
                    "SNMP GET failed"
                );
                Err(error)
            }
        }
    }
}

impl SnmpClient for UdpSnmpClient {
    fn get<'a>(&'a self, request: SnmpRequest) -> SnmpFuture<'a> {
        Box::pin(async move { UdpSnmpClient::get(self, request).await })
    }
}

/// Replays queued results in order and records every request it receives.
#[derive(Debug, Clone, Default)]
pub struct MockSnmpClient {
    queue: Arc<Mutex<VecDeque<Result<SnmpResponse, TransportError>>>>,
    requests: Arc<Mutex<Vec<SnmpRequest>>>,
}

impl MockSnmpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: SnmpResponse) {
        self.push_result(Ok(response));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push_result(Err(error));
    }

    pub fn requests(&self) -> Vec<SnmpRequest> {
        if let Ok(requests) = self.requests.lock() {
            return requests.clone();
        }
        Vec::new()
    }

    fn push_result(&self, result: Result<SnmpResponse, TransportError>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(result);
        }
    }

    fn pop_result(&self) -> Option<Result<SnmpResponse, TransportError>> {
        if let Ok(mut queue) = self.queue.lock() {
            return queue.pop_front();
        }
        None
    }
}

impl SnmpClient for MockSnmpClient {
    fn get<'a>(&'a self, request: SnmpRequest) -> SnmpFuture<'a> {
        let address = request.address.to_string();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        Box::pin(async move {
            if let Some(result) = self.pop_result() {
                return result;
            }

            Err(TransportError::Unreachable {
                address,
                details: "MockSnmpClient queue is empty".to_string(),
            })
        })
    }
}

async fn async_get(
    address: SnmpAddress,
    community: String,
    oids: Vec<Oid>,
    version: SnmpVersion,
    limit: Duration,
) -> Result<SnmpResponse, TransportError> {
    let address_label = address.to_string();
    let timeout_ms = duration_ms(limit);
    let mut session = open_session(&address, &community, version, limit).await?;
    let mut varbinds = Vec::new();

    for oid in &oids {
        let snmp_oid = to_snmp2_oid(&address, oid)?;
        let pdu = match timeout(limit, session.get(&snmp_oid)).await {
            Ok(Ok(pdu)) => pdu,
            Ok(Err(error)) => return Err(map_snmp2_error(&address, error)),
            Err(_) => {
                return Err(TransportError::Timeout {
                    address: address_label,
                    timeout_ms,
                });
            }
        };

        if pdu.error_status != 0 {
            return Err(TransportError::MalformedResponse {
                address: address_label,
                details: format!(
                    "error-status {} at index {}",
                    pdu.error_status, pdu.error_index
                ),
            });
        }

        varbinds.extend(map_snmp2_varbinds(&address_label, pdu));
    }

    Ok(SnmpResponse { address, varbinds })
}

async fn open_session(
    address: &SnmpAddress,
    community: &str,
    version: SnmpVersion,
    limit: Duration,
) -> Result<AsyncSession, TransportError> {
    let timeout_ms = duration_ms(limit);
    let target = format!("{}:{}", address.host, address.port);
    let opening = async {
        match version {
            SnmpVersion::V1 => {
                AsyncSession::new_v1(target.as_str(), community.as_bytes(), 0).await
            }
            SnmpVersion::V2c => {
                AsyncSession::new_v2c(target.as_str(), community.as_bytes(), 0).await
            }
        }
    };
    match timeout(limit, opening).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(error)) => Err(map_snmp2_io_error(address, timeout_ms, error)),
        Err(_) => Err(TransportError::Timeout {
            address: address.to_string(),
            timeout_ms,
        }),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

fn to_snmp2_oid(address: &SnmpAddress, oid: &Oid) -> Result<Snmp2Oid<'static>, TransportError> {
    let arcs: Vec<u64> = oid.as_slice().iter().map(|value| u64::from(*value)).collect();
    Snmp2Oid::from(arcs.as_slice()).map_err(|error| TransportError::MalformedResponse {
        address: address.to_string(),
        details: format!("Invalid OID {oid}: {error:?}"),
    })
}

fn map_snmp2_io_error(address: &SnmpAddress, timeout_ms: u64, error: io::Error) -> TransportError {
    if error.kind() == io::ErrorKind::TimedOut {
        TransportError::Timeout {
            address: address.to_string(),
            timeout_ms,
        }
    } else {
        TransportError::Unreachable {
            address: address.to_string(),
            details: error.to_string(),
        }
    }
}

fn map_snmp2_error(address: &SnmpAddress, error: Snmp2Error) -> TransportError {
    match error {
        Snmp2Error::CommunityMismatch => TransportError::Unreachable {
            address: address.to_string(),
            details: format!("{error}"),
        },
        other => TransportError::MalformedResponse {
            address: address.to_string(),
            details: other.to_string(),
        },
    }
}

fn map_snmp2_oid(address: &str, oid: &Snmp2Oid<'_>) -> Oid {
    let Some(iter) = oid.iter() else {
        warn!(
            target: targets::SNMP,
            address = %address,
            "Failed to parse SNMP OID"
        );
        return Oid(Vec::new());
    };

    let mut arcs = Vec::new();
    for arc in iter {
        match u32::try_from(arc) {
            Ok(value) => arcs.push(value),
            Err(_) => {
                warn!(
                    target: targets::SNMP,
                    address = %address,
                    arc = arc,
                    "SNMP OID component out of range"
                );
                return Oid(Vec::new());
            }
        }
    }

    Oid(arcs)
}

fn map_snmp2_value(address: &str, value: Snmp2Value<'_>) -> SnmpValue {
    match value {
        Snmp2Value::Null => SnmpValue::Null,
        Snmp2Value::Integer(value) => SnmpValue::Integer(value),
        Snmp2Value::OctetString(value) => SnmpValue::OctetString(value.to_vec()),
        Snmp2Value::ObjectIdentifier(value) => {
            SnmpValue::ObjectIdentifier(map_snmp2_oid(address, &value))
        }
        Snmp2Value::IpAddress(value) => SnmpValue::IpAddress(value),
        Snmp2Value::Counter32(value) => SnmpValue::Counter32(value),
        Snmp2Value::Unsigned32(value) => SnmpValue::Unsigned32(value),
        Snmp2Value::Timeticks(value) => SnmpValue::Timeticks(value),
        Snmp2Value::Counter64(value) => SnmpValue::Counter64(value),
        Snmp2Value::Opaque(value) => SnmpValue::Opaque(value.to_vec()),
        Snmp2Value::EndOfMibView => SnmpValue::Other("EndOfMibView".to_string()),
        Snmp2Value::NoSuchObject => SnmpValue::Other("NoSuchObject".to_string()),
        Snmp2Value::NoSuchInstance => SnmpValue::Other("NoSuchInstance".to_string()),
        Snmp2Value::Sequence(_) => SnmpValue::Other("Sequence".to_string()),
        Snmp2Value::Set(_) => SnmpValue::Other("Set".to_string()),
        Snmp2Value::Constructed(tag, _) => {
            SnmpValue::Other(format!("Constructed({tag})"))
        }
        Snmp2Value::GetRequest(_) => SnmpValue::Other("GetRequest".to_string()),
        Snmp2Value::GetNextRequest(_) => SnmpValue::Other("GetNextRequest".to_string()),
        Snmp2Value::GetBulkRequest(_) => SnmpValue::Other("GetBulkRequest".to_string()),
        Snmp2Value::Response(_) => SnmpValue::Other("Response".to_string()),
        Snmp2Value::SetRequest(_) => SnmpValue::Other("SetRequest".to_string()),
        Snmp2Value::InformRequest(_) => SnmpValue::Other("InformRequest".to_string()),
        Snmp2Value::Trap(_) => SnmpValue::Other("Trap".to_string()),
        Snmp2Value::Report(_) => SnmpValue::Other("Report".to_string()),
        Snmp2Value::Boolean(value) => SnmpValue::Other(format!("Boolean({value})")),
    }
}

fn map_snmp2_varbinds(address: &str, pdu: snmp2::Pdu<'_>) -> Vec<SnmpVarBind> {
    pdu.varbinds
        .map(|(oid, value)| SnmpVarBind {
            oid: map_snmp2_oid(address, &oid),
            value: map_snmp2_value(address, value),
        })
        .collect()
}
