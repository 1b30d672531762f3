use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::address::{parse_byte_sequence, EEPROM_LINK};
use crate::error::{Error, StorageAction};
use crate::model::{ModelEntry, ModelRecord, Password, WasteGroup};
use crate::snmp::Oid;
use crate::targets;

const BUILTIN_MODELS: &str = include_str!("../data/models.json");

/// Immutable catalogue of model parameters. Adding a model produces a new
/// registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelEntry>,
}

/// Result of loading a registry source: every valid entry, plus one
/// `Error::Schema` per rejected entry.
#[derive(Debug)]
pub struct RegistryLoad {
    pub registry: ModelRegistry,
    pub errors: Vec<Error>,
}

impl ModelRegistry {
    pub fn load(source: &str) -> Result<RegistryLoad, Error> {
        let value: Value = serde_json::from_str(source).map_err(|source| Error::Json {
            action: StorageAction::Load,
            path: None,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<RegistryLoad, Error> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let source = std::fs::read_to_string(path).map_err(|source| Error::StorageIo {
            action: StorageAction::Load,
            path: Some(label.clone()),
            source,
        })?;
        let value: Value = serde_json::from_str(&source).map_err(|source| Error::Json {
            action: StorageAction::Load,
            path: Some(label),
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<RegistryLoad, Error> {
        let Value::Object(models) = value else {
            return Err(Error::schema(
                "*",
                "*",
                "registry must be an object keyed by model name",
            ));
        };

        let mut entries = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, entry) in models {
            match parse_entry(&name, &entry) {
                Ok(model) => {
                    debug!(target: targets::REGISTRY, model = %name, "Model loaded");
                    entries.insert(name, model);
                }
                Err(error) => {
                    warn!(
                        target: targets::REGISTRY,
                        model = %name,
                        error = %error.technical_detail(),
                        "Model rejected"
                    );
                    errors.push(error);
                }
            }
        }

        info!(
            target: targets::REGISTRY,
            loaded = entries.len(),
            rejected = errors.len(),
            "Model registry loaded"
        );

        Ok(RegistryLoad {
            registry: ModelRegistry { entries },
            errors,
        })
    }

    /// The catalogue shipped with the crate.
    pub fn builtin() -> Result<ModelRegistry, Error> {
        let loaded = Self::load(BUILTIN_MODELS)?;
        match loaded.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(loaded.registry),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<&ModelEntry, Error> {
        self.entries.get(name).ok_or_else(|| Error::UnknownModel {
            model: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new registry containing this one's entries plus `entry`, replacing
    /// any entry of the same name.
    pub fn with_entry(&self, entry: ModelEntry) -> ModelRegistry {
        let mut entries = self.entries.clone();
        entries.insert(entry.name.clone(), entry);
        ModelRegistry { entries }
    }

    pub fn to_json_pretty(&self) -> Result<String, Error> {
        let records: BTreeMap<&str, ModelRecord> = self
            .entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.to_record()))
            .collect();
        serde_json::to_string_pretty(&records).map_err(|source| Error::Json {
            action: StorageAction::Save,
            path: None,
            source,
        })
    }
}

fn parse_entry(name: &str, entry: &Value) -> Result<ModelEntry, Error> {
    let Value::Object(fields) = entry else {
        return Err(Error::schema(name, "*", "entry must be an object"));
    };

    let password: Vec<i64> = required(name, fields, "password")?;
    let password = match password[..] {
        [first, second] => Password::new(
            entry_byte(name, "password", first)?,
            entry_byte(name, "password", second)?,
        ),
        _ => {
            return Err(Error::schema(
                name,
                "password",
                format!("expected exactly 2 bytes, got {}", password.len()),
            ));
        }
    };

    let link: String = required(name, fields, "eeprom_link")?;
    let eeprom_link: Oid = link
        .parse()
        .map_err(|error| Error::schema(name, "eeprom_link", format!("{error}")))?;
    if link != EEPROM_LINK {
        warn!(
            target: targets::REGISTRY,
            model = %name,
            eeprom_link = %link,
            "Unusual EEPROM link"
        );
    }

    let write: String = required(name, fields, "eeprom_write")?;
    let eeprom_write = parse_byte_sequence("eeprom_write", &write)
        .map_err(|error| reframe(name, "eeprom_write", error))?;

    let ink_levels: BTreeMap<String, i64> = required(name, fields, "ink_levels")?;
    let ink_levels = ink_levels
        .into_iter()
        .map(|(channel, oid)| {
            let field = format!("ink_levels.{channel}");
            entry_byte(name, &field, oid).map(|oid| (channel, oid))
        })
        .collect::<Result<_, _>>()?;

    let ink_status: BTreeMap<String, i64> = match fields.get("ink_status") {
        Some(_) => required(name, fields, "ink_status")?,
        None => BTreeMap::new(),
    };
    let ink_status = ink_status
        .into_iter()
        .map(|(channel, offset)| {
            let field = format!("ink_status.{channel}");
            entry_byte(name, &field, offset).map(|offset| (channel, offset))
        })
        .collect::<Result<_, _>>()?;

    let groups: Vec<Map<String, Value>> = required(name, fields, "waste_inks")?;
    let waste_inks = groups
        .into_iter()
        .enumerate()
        .map(|(index, group)| {
            let field = format!("waste_inks[{index}]");
            let group: RawWasteGroup = required(name, &group, "oids")
                .and_then(|oids| {
                    required(name, &group, "total").map(|total| RawWasteGroup { oids, total })
                })
                .map_err(|error| reframe_schema(name, &field, error))?;
            let oids = byte_list(name, &field, &group.oids)?;
            WasteGroup::new(oids, group.total).map_err(|error| reframe(name, &field, error))
        })
        .collect::<Result<_, _>>()?;

    let maintenance: Vec<i64> = required(name, fields, "maintenance_levels")?;
    let maintenance_levels = byte_list(name, "maintenance_levels", &maintenance)?;

    let unknown: Vec<i64> = match fields.get("unknown_oids") {
        Some(_) => required(name, fields, "unknown_oids")?,
        None => Vec::new(),
    };
    let unknown_oids = byte_list(name, "unknown_oids", &unknown)?;

    Ok(ModelEntry {
        name: name.to_string(),
        password,
        eeprom_link,
        eeprom_write,
        ink_levels,
        ink_status,
        waste_inks,
        maintenance_levels,
        unknown_oids,
    })
}

struct RawWasteGroup {
    oids: Vec<i64>,
    total: Option<f64>,
}

fn required<T: DeserializeOwned>(
    model: &str,
    fields: &Map<String, Value>,
    field: &str,
) -> Result<T, Error> {
    let value = fields
        .get(field)
        .ok_or_else(|| Error::schema(model, field, "missing field"))?;
    serde_json::from_value(value.clone())
        .map_err(|error| Error::schema(model, field, error.to_string()))
}

fn entry_byte(model: &str, field: &str, value: i64) -> Result<u8, Error> {
    u8::try_from(value)
        .map_err(|_| Error::schema(model, field, format!("{value} is outside 0..=255")))
}

fn byte_list(model: &str, field: &str, values: &[i64]) -> Result<Vec<u8>, Error> {
    values
        .iter()
        .map(|value| entry_byte(model, field, *value))
        .collect()
}

/// Nests a sub-field error under `field`, e.g. `waste_inks[0].total`.
fn reframe_schema(model: &str, field: &str, error: Error) -> Error {
    match error {
        Error::Schema {
            field: inner,
            details,
            ..
        } => Error::schema(model, format!("{field}.{inner}"), details),
        other => other,
    }
}

fn reframe(model: &str, field: &str, error: Error) -> Error {
    match error {
        Error::InvalidParameter { details, .. } => Error::schema(model, field, details),
        other => other,
    }
}
