//! Engine configuration.
//!
//! Loaded once at startup from an optional JSON file. Every section falls back
//! to defaults so a partial file only needs the values it changes.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::database::DatabaseBackend;
use crate::device::DeviceModel;
use crate::mapping::{Hl7Mappings, StorageMappings};
use crate::value::{FieldValue, PatientRecord};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerSettings,
    pub lab: LabSettings,
    pub outbound: OutboundSettings,
    pub device: DeviceSettings,
    pub database: DatabaseSettings,
    pub mappings: MappingSettings,
    pub default_patient: PatientRecord,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound for one connection's receive buffer
    pub max_frame_bytes: usize,
    pub dispatch_timeout_secs: u64,
    pub audit_capacity: usize,
    /// Answer unsupported message types with `AR` instead of staying silent
    pub reject_unsupported_messages: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            max_frame_bytes: 1024 * 1024,
            dispatch_timeout_secs: 10,
            audit_capacity: 100,
            reject_unsupported_messages: false,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Codes identifying test panels and the finished state in the result store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabSettings {
    pub cbc_test_code: String,
    pub hgb_test_code: String,
    pub finished_state: String,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            cbc_test_code: "56".to_string(),
            hgb_test_code: "50".to_string(),
            finished_state: "0".to_string(),
        }
    }
}

/// Identity and value translation used when rendering outbound messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundSettings {
    pub application_name: String,
    pub application_version: String,
    /// Stored display value -> HL7 code
    pub value_codes: BTreeMap<String, String>,
}

impl Default for OutboundSettings {
    fn default() -> Self {
        let value_codes = [
            ("Male", "M"),
            ("Female", "F"),
            ("Years", "1"),
            ("Mons.", "2"),
            ("Days", "3"),
            ("Hours", "4"),
        ]
        .into_iter()
        .map(|(display, code)| (display.to_string(), code.to_string()))
        .collect();

        Self {
            application_name: "HealthMesh".to_string(),
            application_version: "1.0.0".to_string(),
            value_codes,
        }
    }
}

impl OutboundSettings {
    /// HL7 text for a stored value, translated through `value_codes` when listed
    pub fn translate(&self, value: &FieldValue) -> String {
        let text = value.to_string();
        match self.value_codes.get(text.trim()) {
            Some(code) => code.clone(),
            None => text,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub model: DeviceModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: DatabaseBackend,
    pub path: PathBuf,
    pub create_missing_tables: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            path: PathBuf::from("lab.db"),
            create_missing_tables: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    pub storage: StorageMappings,
    pub hl7: Hl7Mappings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Daily rolling log files are written here when set
    pub directory: Option<PathBuf>,
    pub file_name: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_name: "lab-hl7.log".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            lab: LabSettings::default(),
            outbound: OutboundSettings::default(),
            device: DeviceSettings::default(),
            database: DatabaseSettings::default(),
            mappings: MappingSettings::default(),
            default_patient: default_patient(),
            logging: LoggingSettings::default(),
        }
    }
}

fn default_patient() -> PatientRecord {
    let mut patient = PatientRecord::new();
    patient.insert("NAME".into(), FieldValue::from("Patient Not in DB"));
    patient.insert("SEX".into(), FieldValue::from("M"));
    patient.insert("AGE".into(), FieldValue::Integer(30));
    patient.insert("AGE_UNIT".into(), FieldValue::Integer(1));
    patient
}

impl EngineConfig {
    /// Load from a JSON file, or use defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let config: EngineConfig = serde_json::from_str(&text)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => EngineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.server.host.parse::<IpAddr>().is_err() {
            return invalid("server.host", "not an IP address");
        }
        if self.server.port == 0 {
            return invalid("server.port", "must be between 1 and 65535");
        }
        if self.server.max_frame_bytes == 0 {
            return invalid("server.max_frame_bytes", "must be positive");
        }
        if self.server.dispatch_timeout_secs == 0 {
            return invalid("server.dispatch_timeout_secs", "must be positive");
        }
        if self.server.audit_capacity == 0 {
            return invalid("server.audit_capacity", "must be positive");
        }
        if self.lab.cbc_test_code.trim().is_empty() || self.lab.hgb_test_code.trim().is_empty() {
            return invalid("lab", "test codes must not be empty");
        }
        if self.lab.cbc_test_code.trim() == self.lab.hgb_test_code.trim() {
            return invalid("lab", "CBC and HGB test codes must differ");
        }
        if self.outbound.application_name.contains('|') {
            return invalid("outbound.application_name", "must not contain '|'");
        }
        for procedure in &self.mappings.storage.procedures {
            if procedure.statement.trim().is_empty() {
                return invalid("mappings.storage.procedures", "procedure without statement");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.server.address(), "0.0.0.0:4000");
        assert_eq!(config.server.dispatch_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_patient["NAME"], FieldValue::from("Patient Not in DB"));
        assert_eq!(config.device.model, DeviceModel::GenruiKt60);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"port": 2575}}, "lab": {{"cbc_test_code": "CBC"}}}}"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 2575);
        assert_eq!(config.server.audit_capacity, 100);
        assert_eq!(config.lab.cbc_test_code, "CBC");
        assert_eq!(config.lab.hgb_test_code, "50");
        assert_eq!(config.default_patient["AGE"], FieldValue::Integer(30));
        assert!(config.mappings.storage.procedure("GetPatientInfo").is_some());
    }

    #[test]
    fn rejects_bad_host() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"host": "localhost:4000"}}}}"#).unwrap();

        let err = EngineConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "server.host", .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/lab.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn value_codes_translate_display_values() {
        let outbound = OutboundSettings::default();
        assert_eq!(outbound.translate(&FieldValue::from("Female")), "F");
        assert_eq!(outbound.translate(&FieldValue::from("Years")), "1");
        assert_eq!(outbound.translate(&FieldValue::Integer(42)), "42");
    }
}
