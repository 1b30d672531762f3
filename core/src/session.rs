use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::address::{read_address, write_address};
use crate::error::{Error, TransportError};
use crate::model::{ModelEntry, Password};
use crate::snmp::{Oid, SnmpAddress, SnmpClient, SnmpRequest, SnmpResponse, SnmpValue};
use crate::targets;

static EEPROM_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"EE:([0-9A-F]{2})([0-9A-F]{2})([0-9A-F]{2})").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn single() -> Self {
        Self {
            attempts: 1,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 200,
        }
    }
}

/// Logical EEPROM access to one printer.
///
/// Every operation takes `&mut self`, so a session never has more than one
/// request in flight.
pub struct EepromSession<C> {
    pub(crate) client: Arc<C>,
    pub(crate) address: SnmpAddress,
    pub(crate) community: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) link: Oid,
    pub(crate) write_suffix: Vec<u8>,
    pub(crate) password: Password,
    retry: RetryPolicy,
    pub(crate) requests: u64,
}

impl<C: SnmpClient> EepromSession<C> {
    pub fn new(client: Arc<C>, address: SnmpAddress, model: &ModelEntry) -> Self {
        Self {
            client,
            address,
            community: None,
            timeout: None,
            link: model.eeprom_link.clone(),
            write_suffix: model.eeprom_write.clone(),
            password: model.password,
            retry: RetryPolicy::default(),
            requests: 0,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_community(mut self, community: impl Into<String>) -> Self {
        self.community = Some(community.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_password(mut self, password: Password) -> Self {
        self.password = password;
        self
    }

    pub fn password(&self) -> Password {
        self.password
    }

    pub fn address(&self) -> &SnmpAddress {
        &self.address
    }

    /// Total transport attempts issued through this session.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub async fn read(&mut self, oid: u8) -> Result<u8, Error> {
        let request_oid = read_address(&self.link, self.password, oid);
        let value = self
            .get_with_retries(request_oid, |response, address| {
                decode_record(response, address, oid)
            })
            .await?;
        trace!(
            target: targets::SESSION,
            address = %self.address,
            oid,
            value,
            "EEPROM read"
        );
        Ok(value)
    }

    /// Sent as a GET; the printer does not echo the value, so any well-formed
    /// response counts as accepted.
    pub async fn write(&mut self, oid: u8, value: u8) -> Result<(), Error> {
        let request_oid = write_address(&self.link, self.password, oid, value, &self.write_suffix);
        self.get_with_retries(request_oid, |response, address| {
            if response.varbinds.is_empty() {
                return Err(TransportError::MalformedResponse {
                    address: address.to_string(),
                    details: "write acknowledged without varbinds".to_string(),
                });
            }
            Ok(())
        })
        .await?;
        debug!(
            target: targets::SESSION,
            address = %self.address,
            oid,
            value,
            "EEPROM write accepted"
        );
        Ok(())
    }

    pub async fn read_many(&mut self, oids: &[u8]) -> Result<Vec<u8>, Error> {
        let mut values = Vec::with_capacity(oids.len());
        for oid in oids {
            values.push(self.read(*oid).await?);
        }
        Ok(values)
    }

    /// Reads every address in `range`; unreadable addresses are left out.
    pub async fn dump(&mut self, range: RangeInclusive<u8>) -> BTreeMap<u8, u8> {
        let mut values = BTreeMap::new();
        for oid in range {
            match self.read(oid).await {
                Ok(value) => {
                    values.insert(oid, value);
                }
                Err(error) => {
                    warn!(
                        target: targets::SESSION,
                        address = %self.address,
                        oid,
                        error = %error,
                        "EEPROM address skipped"
                    );
                }
            }
        }
        values
    }

    /// Plain SNMP GET outside the EEPROM command space.
    pub async fn query(&mut self, oid: &Oid) -> Result<SnmpValue, Error> {
        let wanted = oid.clone();
        self.get_with_retries(oid.clone(), move |response, address| {
            match response.value_for(&wanted) {
                Some(value) if !value.is_missing() => Ok(value.clone()),
                other => Err(TransportError::MalformedResponse {
                    address: address.to_string(),
                    details: format!("no value for {wanted}: {other:?}"),
                }),
            }
        })
        .await
    }

    pub(crate) fn request(&self, oid: Oid) -> SnmpRequest {
        build_request(&self.address, self.community.as_deref(), self.timeout, oid)
    }

    async fn get_with_retries<T>(
        &mut self,
        oid: Oid,
        decode: impl Fn(&SnmpResponse, &SnmpAddress) -> Result<T, TransportError>,
    ) -> Result<T, Error> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay()).await;
            }
            self.requests += 1;
            let request = self.request(oid.clone());
            let result = self
                .client
                .get(request)
                .await
                .and_then(|response| decode(&response, &self.address));

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    debug!(
                        target: targets::SESSION,
                        address = %self.address,
                        attempt,
                        attempts,
                        error = %error.technical_detail(),
                        "EEPROM exchange failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| TransportError::Unreachable {
            address: self.address.to_string(),
            details: "no attempt was made".to_string(),
        });
        warn!(
            target: targets::SESSION,
            address = %self.address,
            oid = %oid,
            attempts,
            error = %error,
            "Retry budget exhausted"
        );
        Err(error.into())
    }
}

pub(crate) fn build_request(
    address: &SnmpAddress,
    community: Option<&str>,
    timeout: Option<Duration>,
    oid: Oid,
) -> SnmpRequest {
    let mut request = SnmpRequest::single(address.clone(), oid);
    if let Some(community) = community {
        request = request.with_community(community);
    }
    if let Some(timeout) = timeout {
        request = request.with_timeout(timeout);
    }
    request
}

/// Extracts the value of `oid` from the `EE:` record in a read response.
pub fn decode_record(
    response: &SnmpResponse,
    address: &SnmpAddress,
    oid: u8,
) -> Result<u8, TransportError> {
    let malformed = |details: String| TransportError::MalformedResponse {
        address: address.to_string(),
        details,
    };

    let text = response
        .varbinds
        .first()
        .and_then(|varbind| varbind.value.as_text_lossy())
        .ok_or_else(|| malformed("response carries no text".to_string()))?;
    let captures = EEPROM_RECORD
        .captures(&text)
        .ok_or_else(|| malformed(format!("no EE record in {text:?}")))?;

    let echoed = u8::from_str_radix(&captures[2], 16)
        .map_err(|error| malformed(error.to_string()))?;
    if echoed != oid {
        return Err(malformed(format!(
            "response address {echoed} does not match requested {oid}"
        )));
    }
    u8::from_str_radix(&captures[3], 16).map_err(|error| malformed(error.to_string()))
}
