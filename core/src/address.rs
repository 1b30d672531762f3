//! EEPROM command addresses.
//!
//! The firmware treats a GET on a specially shaped OID below the vendor
//! EEPROM link as a command. Reads are
//! `{link}.124.124.7.0.{p0}.{p1}.65.190.160.{oid}.0` and writes are
//! `{link}.124.124.16.0.{p0}.{p1}.66.189.33.{oid}.0.{value}.{suffix}`; a write
//! is still sent as a GET, the value travels inside the OID. The ink status
//! reply lives at `{link}.115.116.1.0.1`.

use crate::error::Error;
use crate::model::{ModelEntry, Password};
use crate::snmp::Oid;

pub const EEPROM_LINK: &str = "1.3.6.1.4.1.1248.1.2.2.44.1.1.2.1";

const READ_MODE: [u32; 4] = [124, 124, 7, 0];
const READ_MARKER: [u32; 3] = [65, 190, 160];
const WRITE_MODE: [u32; 4] = [124, 124, 16, 0];
const WRITE_MARKER: [u32; 3] = [66, 189, 33];
const STATUS: [u32; 5] = [115, 116, 1, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAddress {
    pub password: Password,
    pub oid: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAddress {
    pub password: Password,
    pub oid: u8,
    pub value: u8,
    pub suffix: Vec<u8>,
}

pub fn build_read(model: &ModelEntry, oid: u8) -> Oid {
    read_address(&model.eeprom_link, model.password, oid)
}

pub fn build_write(model: &ModelEntry, oid: u8, value: u8) -> Oid {
    write_address(
        &model.eeprom_link,
        model.password,
        oid,
        value,
        &model.eeprom_write,
    )
}

/// Plain GET whose reply carries one ink level per catalogued byte offset.
pub fn status_address(link: &Oid) -> Oid {
    let mut arcs = link.as_slice().to_vec();
    arcs.extend_from_slice(&STATUS);
    Oid(arcs)
}

pub fn read_address(link: &Oid, password: Password, oid: u8) -> Oid {
    let mut arcs = link.as_slice().to_vec();
    arcs.extend_from_slice(&READ_MODE);
    arcs.extend(password.bytes().iter().map(|byte| u32::from(*byte)));
    arcs.extend_from_slice(&READ_MARKER);
    arcs.push(u32::from(oid));
    arcs.push(0);
    Oid(arcs)
}

pub fn write_address(link: &Oid, password: Password, oid: u8, value: u8, suffix: &[u8]) -> Oid {
    let mut arcs = link.as_slice().to_vec();
    arcs.extend_from_slice(&WRITE_MODE);
    arcs.extend(password.bytes().iter().map(|byte| u32::from(*byte)));
    arcs.extend_from_slice(&WRITE_MARKER);
    arcs.push(u32::from(oid));
    arcs.push(0);
    arcs.push(u32::from(value));
    arcs.extend(suffix.iter().map(|byte| u32::from(*byte)));
    Oid(arcs)
}

pub fn parse_read(link: &Oid, address: &Oid) -> Result<ReadAddress, Error> {
    let command = command_arcs(link, address)?;
    let (password, rest) = strip_mode(command, &READ_MODE, &READ_MARKER)?;
    match rest {
        [oid, 0] => Ok(ReadAddress {
            password,
            oid: byte("oid", *oid)?,
        }),
        _ => Err(Error::invalid_parameter(
            "address",
            format!("read command ends with {rest:?}, expected [oid, 0]"),
        )),
    }
}

pub fn parse_write(link: &Oid, address: &Oid) -> Result<WriteAddress, Error> {
    let command = command_arcs(link, address)?;
    let (password, rest) = strip_mode(command, &WRITE_MODE, &WRITE_MARKER)?;
    match rest {
        [oid, 0, value, suffix @ ..] => Ok(WriteAddress {
            password,
            oid: byte("oid", *oid)?,
            value: byte("value", *value)?,
            suffix: suffix
                .iter()
                .map(|arc| byte("eeprom_write", *arc))
                .collect::<Result<_, _>>()?,
        }),
        _ => Err(Error::invalid_parameter(
            "address",
            format!("write command ends with {rest:?}, expected [oid, 0, value, ..]"),
        )),
    }
}

/// Narrows a wider integer to an EEPROM byte.
pub fn byte(name: &str, value: impl TryInto<u8> + Copy + std::fmt::Display) -> Result<u8, Error> {
    value
        .try_into()
        .map_err(|_| Error::invalid_parameter(name, format!("{value} is outside 0..=255")))
}

/// Parses a dot-separated byte string such as `84.98.116.98`.
pub fn parse_byte_sequence(name: &str, value: &str) -> Result<Vec<u8>, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split('.')
        .map(|part| {
            let parsed: i64 = part.trim().parse().map_err(|_| {
                Error::invalid_parameter(name, format!("{part:?} is not a number"))
            })?;
            byte(name, parsed)
        })
        .collect()
}

pub fn format_byte_sequence(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn command_arcs<'a>(link: &Oid, address: &'a Oid) -> Result<&'a [u32], Error> {
    if !address.starts_with(link) {
        return Err(Error::invalid_parameter(
            "address",
            format!("{address} is not below EEPROM link {link}"),
        ));
    }
    Ok(&address.as_slice()[link.as_slice().len()..])
}

fn strip_mode<'a>(
    command: &'a [u32],
    mode: &[u32; 4],
    marker: &[u32; 3],
) -> Result<(Password, &'a [u32]), Error> {
    let header = mode.len() + 2 + marker.len();
    if command.len() < header || command[..mode.len()] != mode[..] {
        return Err(Error::invalid_parameter(
            "address",
            format!("command {command:?} does not start with mode {mode:?}"),
        ));
    }
    let password = Password::new(
        byte("password", command[mode.len()])?,
        byte("password", command[mode.len() + 1])?,
    );
    if command[mode.len() + 2..header] != marker[..] {
        return Err(Error::invalid_parameter(
            "address",
            format!("command {command:?} is missing marker {marker:?}"),
        ));
    }
    Ok((password, &command[header..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Oid {
        EEPROM_LINK.parse().expect("link")
    }

    #[test]
    fn read_address_matches_firmware_layout() {
        let address = read_address(&link(), Password::new(101, 0), 0x1C);
        assert_eq!(
            address.to_string(),
            "1.3.6.1.4.1.1248.1.2.2.44.1.1.2.1.124.124.7.0.101.0.65.190.160.28.0"
        );
    }

    #[test]
    fn write_address_embeds_value_and_suffix() {
        let suffix = parse_byte_sequence("eeprom_write", "84.98.116.98.111.114.118.98")
            .expect("suffix");
        let address = write_address(&link(), Password::new(101, 0), 20, 104, &suffix);
        assert_eq!(
            address.to_string(),
            "1.3.6.1.4.1.1248.1.2.2.44.1.1.2.1.124.124.16.0.101.0.66.189.33.20.0.104.84.98.116.98.111.114.118.98"
        );
    }

    #[test]
    fn model_addresses_parse_back() {
        let model = crate::registry::ModelRegistry::builtin()
            .expect("builtin")
            .lookup("EPSON WF-7525 Series")
            .expect("model")
            .clone();

        let read = parse_read(&model.eeprom_link, &build_read(&model, 60)).expect("parse read");
        assert_eq!(read, ReadAddress { password: model.password, oid: 60 });

        let write = build_write(&model, 20, 0);
        let parsed = parse_write(&model.eeprom_link, &write).expect("parse write");
        assert_eq!(parsed.password, Password::new(101, 0));
        assert_eq!((parsed.oid, parsed.value), (20, 0));
        assert_eq!(parsed.suffix, model.eeprom_write);

        let unlocked = model.with_password(Password::new(7, 9));
        let read = parse_read(&model.eeprom_link, &build_read(&unlocked, 5)).expect("parse read");
        assert_eq!(read.password, Password::new(7, 9));
    }

    #[test]
    fn status_address_is_neither_read_nor_write() {
        let status = status_address(&link());
        assert_eq!(status.to_string(), format!("{EEPROM_LINK}.115.116.1.0.1"));
        assert!(parse_read(&link(), &status).is_err());
        assert!(parse_write(&link(), &status).is_err());
    }

    #[test]
    fn read_components_are_recoverable() {
        for (p0, p1, oid) in [(0, 0, 0), (40, 0, 255), (255, 255, 17), (101, 0, 60)] {
            let password = Password::new(p0, p1);
            let parsed = parse_read(&link(), &read_address(&link(), password, oid))
                .expect("parse read");
            assert_eq!(parsed, ReadAddress { password, oid });
        }
    }

    #[test]
    fn write_components_are_recoverable() {
        let suffix = vec![84, 98, 116, 98, 111, 114, 118, 98];
        for (oid, value) in [(20, 0), (61, 94), (255, 255)] {
            let password = Password::new(27, 213);
            let address = write_address(&link(), password, oid, value, &suffix);
            let parsed = parse_write(&link(), &address).expect("parse write");
            assert_eq!(parsed.password, password);
            assert_eq!(parsed.oid, oid);
            assert_eq!(parsed.value, value);
            assert_eq!(parsed.suffix, suffix);
        }
    }

    #[test]
    fn read_parser_rejects_write_and_foreign_addresses() {
        let write = write_address(&link(), Password::new(1, 2), 3, 4, &[5]);
        assert!(matches!(
            parse_read(&link(), &write),
            Err(Error::InvalidParameter { .. })
        ));

        let foreign: Oid = "1.3.6.1.2.1.1.5.0".parse().expect("oid");
        assert!(matches!(
            parse_read(&link(), &foreign),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn out_of_range_bytes_are_invalid_parameters() {
        assert_eq!(byte("oid", 255u32).expect("in range"), 255);
        match byte("oid", 256u32) {
            Err(Error::InvalidParameter { name, .. }) => assert_eq!(name, "oid"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(byte("value", -1i64).is_err());
        assert!(parse_byte_sequence("eeprom_write", "84.300.1").is_err());
        assert!(parse_byte_sequence("eeprom_write", "84.x").is_err());

        let oversized = Oid(vec![
            1, 3, 6, 1, 4, 1, 1248, 1, 2, 2, 44, 1, 1, 2, 1, 124, 124, 7, 0, 101, 0, 65, 190,
            160, 300, 0,
        ]);
        assert!(parse_read(&link(), &oversized).is_err());
    }

    #[test]
    fn byte_sequence_formats_back() {
        let bytes = parse_byte_sequence("eeprom_write", "84.98.116").expect("bytes");
        assert_eq!(format_byte_sequence(&bytes), "84.98.116");
        assert!(parse_byte_sequence("eeprom_write", "").expect("empty").is_empty());
    }
}
