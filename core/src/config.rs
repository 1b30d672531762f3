use std::fs;
use std::path::{Path, PathBuf};

use ron::ser::{to_string_pretty, PrettyConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::brute_force::BruteForceConfig;
use crate::error::{Error, StorageAction};
use crate::session::RetryPolicy;
use crate::snmp::SnmpConfig;
use crate::targets;

/// Settings for the command-line tool, stored as RON. Missing sections fall
/// back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub snmp: SnmpConfig,
    pub retry: RetryPolicy,
    pub brute_force: BruteForceConfig,
    /// Model catalogue to use instead of the bundled one.
    pub registry_path: Option<PathBuf>,
    /// `EnvFilter` directive, e.g. `info` or `wasteink::session=trace`.
    pub log_filter: Option<String>,
}

impl ToolConfig {
    pub fn from_ron(source: &str) -> Result<Self, Error> {
        ron::de::from_str(source).map_err(|error| Error::Ron {
            action: StorageAction::Load,
            path: None,
            source: error.code,
        })
    }

    pub fn to_ron(&self) -> Result<String, Error> {
        to_string_pretty(self, PrettyConfig::new()).map_err(|source| Error::Ron {
            action: StorageAction::Save,
            path: None,
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| Error::StorageIo {
            action: StorageAction::Load,
            path: Some(label.clone()),
            source,
        })?;
        let config = ron::de::from_str(&contents).map_err(|error| {
            warn!(
                target: targets::APP,
                path = %label,
                line = error.position.line,
                column = error.position.col,
                "Config parse failed"
            );
            Error::Ron {
                action: StorageAction::Load,
                path: Some(label.clone()),
                source: error.code,
            }
        })?;
        debug!(target: targets::APP, path = %label, "Config loaded");
        Ok(config)
    }

    /// Reads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(target: targets::APP, path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let contents = self.to_ron().map_err(|error| match error {
            Error::Ron { action, source, .. } => Error::Ron {
                action,
                path: Some(label.clone()),
                source,
            },
            other => other,
        })?;
        fs::write(path, contents).map_err(|source| Error::StorageIo {
            action: StorageAction::Save,
            path: Some(label),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snmp::SnmpVersion;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ToolConfig::from_ron("()").expect("config"), ToolConfig::default());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = ToolConfig::from_ron(
            r#"(
                snmp: (community: "private", version: V2c),
                brute_force: (workers: 4),
                log_filter: Some("debug"),
            )"#,
        )
        .expect("config");

        assert_eq!(config.snmp.community, "private");
        assert_eq!(config.snmp.version, SnmpVersion::V2c);
        assert_eq!(config.snmp.port, 161);
        assert_eq!(config.brute_force.workers, 4);
        assert_eq!(config.brute_force.timeout_ms, Some(500));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_malformed_document() {
        match ToolConfig::from_ron("(snmp: 12)") {
            Err(Error::Ron { action, .. }) => assert_eq!(action, StorageAction::Load),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn saves_and_loads_file() {
        let path = std::env::temp_dir().join(format!("wasteink-config-{}.ron", std::process::id()));
        let mut config = ToolConfig::default();
        config.retry.attempts = 5;
        config.registry_path = Some(PathBuf::from("/etc/wasteink/models.json"));

        config.save(&path).expect("save");
        let loaded = ToolConfig::load(&path).expect("load");
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let path = std::env::temp_dir().join("wasteink-config-does-not-exist.ron");
        assert_eq!(
            ToolConfig::load_or_default(&path).expect("config"),
            ToolConfig::default()
        );
        assert!(matches!(
            ToolConfig::load(&path),
            Err(Error::StorageIo { action: StorageAction::Load, .. })
        ));
    }
}
