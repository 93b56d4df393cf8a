//! Storage abstraction.
//!
//! Callers exchange [`GenericRecord`]s keyed by generic names only. Each
//! backend translates them to its own tables and columns through the mapping
//! tables in [`crate::mapping`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DatabaseSettings;
use crate::mapping::StorageMappings;
use crate::value::{FieldValue, GenericRecord, PatientRecord};

pub mod sqlite;

pub use sqlite::SqliteAdapter;

#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The store cannot be reached or opened
    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Database is not connected")]
    NotConnected,

    #[error("Statement failed: {source} (statement: {statement}; params: {params})")]
    Query {
        statement: String,
        params: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown procedure '{0}'")]
    UnknownProcedure(String),

    #[error("No mapping for {0}")]
    MissingMapping(String),

    #[error("No rows affected in {table} for patient {patient_id}")]
    NoRowsAffected { table: String, patient_id: String },
}

/// Pending test for a patient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRequestState {
    pub test_code: FieldValue,
    pub result_state: FieldValue,
}

/// Generic patient and result operations over one storage target
pub trait DatabaseAdapter: Send + Sync {
    fn connect(&self) -> Result<(), DatabaseError>;

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn check_result_exists(&self, patient_id: &str) -> Result<bool, DatabaseError>;

    /// Request date of the patient's latest stored result, restricted to
    /// `request_date` when given. Updates select rows by this date.
    fn find_result_date(
        &self,
        patient_id: &str,
        request_date: Option<&str>,
    ) -> Result<Option<String>, DatabaseError>;

    fn save_cbc_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError>;

    fn update_cbc_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError>;

    fn save_hgb_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError>;

    fn update_hgb_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError>;

    fn get_patient_info(&self, patient_id: &str) -> Result<Option<PatientRecord>, DatabaseError>;

    fn get_patient_test_request(
        &self,
        patient_id: &str,
    ) -> Result<Option<TestRequestState>, DatabaseError>;

    /// Run a named procedure. Declared parameters missing from `params` are
    /// passed as null.
    fn execute_procedure(
        &self,
        name: &str,
        params: &GenericRecord,
    ) -> Result<Vec<GenericRecord>, DatabaseError>;
}

/// Registry of storage backends selectable by configuration name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    #[default]
    Sqlite,
}

impl DatabaseBackend {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseBackend::Sqlite => "sqlite",
        }
    }

    /// Construct the adapter. Connecting is left to the caller.
    pub fn build(
        &self,
        settings: &DatabaseSettings,
        mappings: &StorageMappings,
    ) -> Arc<dyn DatabaseAdapter> {
        match self {
            DatabaseBackend::Sqlite => Arc::new(SqliteAdapter::new(
                settings.path.clone(),
                mappings.clone(),
                settings.create_missing_tables,
            )),
        }
    }
}

impl fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(DatabaseBackend::Sqlite),
            other => Err(format!("Unknown database backend '{other}'")),
        }
    }
}
