use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("SNMP timeout for {address}")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("SNMP agent unreachable at {address}")]
    Unreachable { address: String, details: String },
    #[error("Malformed SNMP response from {address}")]
    MalformedResponse { address: String, details: String },
}

impl TransportError {
    pub fn technical_detail(&self) -> String {
        match self {
            TransportError::Timeout {
                address,
                timeout_ms,
            } => format!("SNMP timeout after {timeout_ms}ms for {address}."),
            TransportError::Unreachable { address, details } => {
                format!("SNMP agent {address} unreachable: {details}")
            }
            TransportError::MalformedResponse { address, details } => {
                format!("Malformed response from {address}: {details}")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Invalid parameter {name}")]
    InvalidParameter { name: String, details: String },
    #[error("Schema error in model {model}, field {field}")]
    Schema {
        model: String,
        field: String,
        details: String,
    },
    #[error("Unknown model: {model}")]
    UnknownModel { model: String },
    #[error("No fields could be read from {address}")]
    MissingFields {
        address: String,
        missing: Vec<String>,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("JSON {action} error")]
    Json {
        action: StorageAction,
        path: Option<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("RON {action} error")]
    Ron {
        action: StorageAction,
        path: Option<String>,
        #[source]
        source: ron::Error,
    },
    #[error("Storage {action} error")]
    StorageIo {
        action: StorageAction,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAction {
    Load,
    Save,
}

impl fmt::Display for StorageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageAction::Load => f.write_str("load"),
            StorageAction::Save => f.write_str("save"),
        }
    }
}

impl Error {
    pub fn invalid_parameter(name: impl Into<String>, details: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            details: details.into(),
        }
    }

    pub fn schema(
        model: impl Into<String>,
        field: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Error::Schema {
            model: model.into(),
            field: field.into(),
            details: details.into(),
        }
    }

    pub fn user_summary(&self) -> String {
        match self {
            Error::Transport(TransportError::Timeout { address, .. }) => {
                format!("SNMP request timed out for {address}.")
            }
            Error::Transport(TransportError::Unreachable { address, .. }) => {
                format!("Printer at {address} is unreachable.")
            }
            Error::Transport(TransportError::MalformedResponse { address, .. }) => {
                format!("Printer at {address} sent an unexpected response.")
            }
            Error::InvalidParameter { name, .. } => format!("Invalid value for {name}."),
            Error::Schema { model, field, .. } => {
                format!("Model {model} has an invalid {field} entry.")
            }
            Error::UnknownModel { model } => format!("Unknown printer model: {model}."),
            Error::MissingFields { address, .. } => {
                format!("Nothing could be read from {address}.")
            }
            Error::Cancelled => "Operation cancelled.".to_string(),
            Error::Json { action, .. } => format!("Failed to {action} JSON data."),
            Error::Ron { action, .. } => format!("Failed to {action} configuration data."),
            Error::StorageIo { action, .. } => format!("Failed to {action} file."),
        }
    }

    pub fn technical_detail(&self) -> String {
        match self {
            Error::Transport(error) => error.technical_detail(),
            Error::InvalidParameter { name, details } => {
                format!("Invalid parameter {name}: {details}.")
            }
            Error::Schema {
                model,
                field,
                details,
            } => format!("Schema error in {model}.{field}: {details}."),
            Error::UnknownModel { model } => format!("Model {model} is not in the registry."),
            Error::MissingFields { address, missing } => {
                format!("No fields read from {address}; missing {}.", missing.join(", "))
            }
            Error::Cancelled => "Operation cancelled before completion.".to_string(),
            Error::Json {
                action,
                path,
                source,
            } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("JSON {action} error.{path} {source}")
            }
            Error::Ron {
                action,
                path,
                source,
            } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("RON {action} error.{path} {source}")
            }
            Error::StorageIo {
                action,
                path,
                source,
            } => {
                let path = path
                    .as_ref()
                    .map(|value| format!(" path={value}."))
                    .unwrap_or_default();
                format!("Storage {action} error.{path} {source}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_render_address() {
        let error = Error::from(TransportError::Timeout {
            address: "10.0.0.7:161".to_string(),
            timeout_ms: 500,
        });
        assert_eq!(error.user_summary(), "SNMP request timed out for 10.0.0.7:161.");
        assert!(error.technical_detail().contains("500ms"));
    }

    #[test]
    fn schema_error_names_model_and_field() {
        let error = Error::schema("XP-205", "password", "expected 2 bytes");
        assert_eq!(error.to_string(), "Schema error in model XP-205, field password");
        assert_eq!(
            error.technical_detail(),
            "Schema error in XP-205.password: expected 2 bytes."
        );
    }
}
