use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection, OptionalExtension, Statement};
use tracing::{debug, error, info, warn};

use super::{DatabaseAdapter, DatabaseError, TestRequestState};
use crate::mapping::{KeyMap, RecordMapping, StorageMappings, PATIENT_ID, REQ_DATE, RESULT_STATE, TEST_CODE};
use crate::value::{FieldValue, GenericRecord, PatientRecord};

const MEMORY_PATH: &str = ":memory:";

/// Key maps built once from the mapping tables
#[derive(Debug)]
struct RecordKeys {
    cbc: KeyMap,
    hgb: KeyMap,
    patient_info: KeyMap,
    patient_test: KeyMap,
    procedures: BTreeMap<String, KeyMap>,
}

impl RecordKeys {
    fn new(mappings: &StorageMappings) -> Self {
        Self {
            cbc: KeyMap::new(&mappings.cbc_result.columns),
            hgb: KeyMap::new(&mappings.hgb_result.columns),
            patient_info: KeyMap::new(&mappings.patient_info.columns),
            patient_test: KeyMap::new(&mappings.patient_test.columns),
            procedures: mappings
                .procedures
                .iter()
                .map(|p| (p.name.clone(), KeyMap::new(&p.columns)))
                .collect(),
        }
    }
}

/// SQLite result store
pub struct SqliteAdapter {
    path: PathBuf,
    create_missing_tables: bool,
    connection: Mutex<Option<Connection>>,
    mappings: StorageMappings,
    keys: RecordKeys,
}

impl SqliteAdapter {
    pub fn new(path: PathBuf, mappings: StorageMappings, create_missing_tables: bool) -> Self {
        let keys = RecordKeys::new(&mappings);
        Self {
            path,
            create_missing_tables,
            connection: Mutex::new(None),
            mappings,
            keys,
        }
    }

    /// Private in-memory database, mainly for tests
    pub fn in_memory(mappings: StorageMappings) -> Self {
        Self::new(PathBuf::from(MEMORY_PATH), mappings, true)
    }

    /// Run a batch of SQL against the open connection
    pub fn execute_script(&self, sql: &str) -> Result<(), DatabaseError> {
        self.with_connection(|conn| Ok(conn.execute_batch(sql)?))
    }

    fn open(&self) -> Result<Connection, DatabaseError> {
        let opened = if self.path == Path::new(MEMORY_PATH) {
            Connection::open_in_memory()
        } else {
            Connection::open(&self.path)
        };
        let conn = opened.map_err(|e| {
            DatabaseError::Connection(format!("{}: {}", self.path.display(), e))
        })?;

        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        if self.create_missing_tables {
            self.create_tables(&conn)?;
        }
        Ok(conn)
    }

    fn create_tables(&self, conn: &Connection) -> Result<(), DatabaseError> {
        for (table, columns) in self.mappings.tables() {
            let columns: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote(&table),
                columns.join(", ")
            );
            debug!("{}", sql);
            conn.execute_batch(&sql)?;
        }
        Ok(())
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let mut guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(DatabaseError::NotConnected)?;
        f(conn)
    }

    fn insert_result(
        &self,
        mapping: &RecordMapping,
        keys: &KeyMap,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        let mut record = results.clone();
        record.insert(PATIENT_ID.to_string(), FieldValue::from(patient_id));
        record.insert(REQ_DATE.to_string(), FieldValue::from(request_date));

        let pairs = keys.to_storage_pairs(&record, &mapping.table);
        let columns: Vec<String> = pairs.iter().map(|(column, _)| quote(column)).collect();
        let placeholders: Vec<String> = (1..=pairs.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&mapping.table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<&FieldValue> = pairs.iter().map(|(_, value)| *value).collect();

        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&sql, params_from_iter(values.iter()))
                .map_err(|e| query_error(&sql, &values, e))?;
            tx.commit()?;
            Ok(())
        })?;
        info!(table = %mapping.table, %patient_id, "Inserted result row");
        Ok(())
    }

    fn update_result(
        &self,
        mapping: &RecordMapping,
        keys: &KeyMap,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        let id_column = mapping
            .condition(PATIENT_ID)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} condition", PATIENT_ID)))?;
        let date_column = keys
            .storage(REQ_DATE)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} column", REQ_DATE)))?;

        let mut record = results.clone();
        record.remove(PATIENT_ID);
        record.remove(REQ_DATE);
        let pairs = keys.to_storage_pairs(&record, &mapping.table);
        if pairs.is_empty() {
            return Err(DatabaseError::MissingMapping(format!(
                "any result value in {}",
                mapping.table
            )));
        }

        let assignments: Vec<String> = pairs
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", quote(column), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{} AND {} = ?{}",
            quote(&mapping.table),
            assignments.join(", "),
            quote(id_column),
            pairs.len() + 1,
            quote(date_column),
            pairs.len() + 2
        );
        let patient = FieldValue::from(patient_id);
        let date = FieldValue::from(request_date);
        let mut values: Vec<&FieldValue> = pairs.iter().map(|(_, value)| *value).collect();
        values.push(&patient);
        values.push(&date);

        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let changed = tx
                .execute(&sql, params_from_iter(values.iter()))
                .map_err(|e| query_error(&sql, &values, e))?;
            if changed == 0 {
                // dropping the transaction rolls it back
                warn!(table = %mapping.table, %patient_id, request_date, "Update matched no rows");
                return Err(DatabaseError::NoRowsAffected {
                    table: mapping.table.clone(),
                    patient_id: patient_id.to_string(),
                });
            }
            tx.commit()?;
            Ok(())
        })?;
        info!(table = %mapping.table, %patient_id, "Updated result row");
        Ok(())
    }

    /// First row matching the patient condition of a record mapping
    fn select_by_patient(
        &self,
        mapping: &RecordMapping,
        keys: &KeyMap,
        patient_id: &str,
    ) -> Result<Option<GenericRecord>, DatabaseError> {
        let id_column = mapping
            .condition(PATIENT_ID)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} condition", PATIENT_ID)))?;
        if keys.is_empty() {
            return Err(DatabaseError::MissingMapping(format!("columns of {}", mapping.table)));
        }
        let columns: Vec<String> = keys.storage_columns().map(quote).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid DESC LIMIT 1",
            columns.join(", "),
            quote(&mapping.table),
            quote(id_column)
        );
        let patient = FieldValue::from(patient_id);

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(|e| query_error(&sql, &[&patient], e))?;
            let mut rows = read_rows(&mut stmt, &[&patient], keys)
                .map_err(|e| query_error(&sql, &[&patient], e))?;
            Ok(if rows.is_empty() {
                None
            } else {
                Some(rows.remove(0))
            })
        })
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn connect(&self) -> Result<(), DatabaseError> {
        let mut guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }
        let conn = self.open().map_err(|e| {
            error!("Cannot open database {}: {}", self.path.display(), e);
            match e {
                DatabaseError::Connection(_) => e,
                other => DatabaseError::Connection(other.to_string()),
            }
        })?;
        *guard = Some(conn);
        info!("Connected to SQLite database {}", self.path.display());
        Ok(())
    }

    fn disconnect(&self) {
        let mut guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = guard.take() {
            match conn.close() {
                Ok(()) => info!("Disconnected from SQLite database {}", self.path.display()),
                Err((_, e)) => warn!("Error while closing database: {}", e),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn check_result_exists(&self, patient_id: &str) -> Result<bool, DatabaseError> {
        let mapping = &self.mappings.result_exists;
        let id_column = mapping
            .condition(PATIENT_ID)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} condition", PATIENT_ID)))?;
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
            quote(&mapping.table),
            quote(id_column)
        );
        let patient = FieldValue::from(patient_id);

        self.with_connection(|conn| {
            let found = conn
                .query_row(&sql, [&patient], |_| Ok(()))
                .optional()
                .map_err(|e| query_error(&sql, &[&patient], e))?;
            Ok(found.is_some())
        })
    }

    fn find_result_date(
        &self,
        patient_id: &str,
        request_date: Option<&str>,
    ) -> Result<Option<String>, DatabaseError> {
        let mapping = &self.mappings.result_exists;
        let id_column = mapping
            .condition(PATIENT_ID)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} condition", PATIENT_ID)))?;
        let date_column = mapping
            .columns
            .get(REQ_DATE)
            .ok_or_else(|| DatabaseError::MissingMapping(format!("{} column", REQ_DATE)))?;

        let mut sql = format!(
            "SELECT {date} FROM {} WHERE {} = ?1 AND {date} IS NOT NULL",
            quote(&mapping.table),
            quote(id_column),
            date = quote(date_column)
        );
        let patient = FieldValue::from(patient_id);
        let date = request_date.map(FieldValue::from);
        let mut values: Vec<&FieldValue> = vec![&patient];
        if let Some(date) = &date {
            sql.push_str(&format!(" AND {} = ?2", quote(date_column)));
            values.push(date);
        }
        sql.push_str(" ORDER BY rowid DESC LIMIT 1");

        self.with_connection(|conn| {
            let found = conn
                .query_row(&sql, params_from_iter(values.iter()), |row| {
                    row.get::<_, FieldValue>(0)
                })
                .optional()
                .map_err(|e| query_error(&sql, &values, e))?;
            Ok(found.map(|date| date.to_string()))
        })
    }

    fn save_cbc_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        self.insert_result(&self.mappings.cbc_result, &self.keys.cbc, patient_id, results, request_date)
    }

    fn update_cbc_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        self.update_result(&self.mappings.cbc_result, &self.keys.cbc, patient_id, results, request_date)
    }

    fn save_hgb_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        self.insert_result(&self.mappings.hgb_result, &self.keys.hgb, patient_id, results, request_date)
    }

    fn update_hgb_result(
        &self,
        patient_id: &str,
        results: &GenericRecord,
        request_date: &str,
    ) -> Result<(), DatabaseError> {
        self.update_result(&self.mappings.hgb_result, &self.keys.hgb, patient_id, results, request_date)
    }

    fn get_patient_info(&self, patient_id: &str) -> Result<Option<PatientRecord>, DatabaseError> {
        let record =
            self.select_by_patient(&self.mappings.patient_info, &self.keys.patient_info, patient_id)?;
        if record.is_none() {
            debug!(%patient_id, "No patient info");
        }
        Ok(record)
    }

    fn get_patient_test_request(
        &self,
        patient_id: &str,
    ) -> Result<Option<TestRequestState>, DatabaseError> {
        if self.keys.patient_test.storage(TEST_CODE).is_none() {
            return Err(DatabaseError::MissingMapping(format!("{} column", TEST_CODE)));
        }
        if self.keys.patient_test.storage(RESULT_STATE).is_none() {
            return Err(DatabaseError::MissingMapping(format!("{} column", RESULT_STATE)));
        }
        let record =
            self.select_by_patient(&self.mappings.patient_test, &self.keys.patient_test, patient_id)?;
        Ok(record.map(|mut record| TestRequestState {
            test_code: record.remove(TEST_CODE).unwrap_or(FieldValue::Null),
            result_state: record.remove(RESULT_STATE).unwrap_or(FieldValue::Null),
        }))
    }

    fn execute_procedure(
        &self,
        name: &str,
        params: &GenericRecord,
    ) -> Result<Vec<GenericRecord>, DatabaseError> {
        let procedure = self
            .mappings
            .procedure(name)
            .ok_or_else(|| DatabaseError::UnknownProcedure(name.to_string()))?;
        let keys = self
            .keys
            .procedures
            .get(name)
            .ok_or_else(|| DatabaseError::UnknownProcedure(name.to_string()))?;

        for key in params.keys() {
            if !procedure.parameters.iter().any(|p| p.eq_ignore_ascii_case(key)) {
                warn!("Parameter '{}' is not declared by {}, ignored", key, name);
            }
        }
        let values: Vec<FieldValue> = procedure
            .parameters
            .iter()
            .map(|declared| {
                params
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(declared))
                    .map(|(_, value)| value.clone())
                    .unwrap_or(FieldValue::Null)
            })
            .collect();
        let refs: Vec<&FieldValue> = values.iter().collect();
        let sql = procedure.statement.as_str();

        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql).map_err(|e| query_error(sql, &refs, e))?;
            read_rows(&mut stmt, &refs, keys).map_err(|e| query_error(sql, &refs, e))
        })?;
        debug!("{} returned {} rows", name, rows.len());
        Ok(rows)
    }
}

fn read_rows(
    stmt: &mut Statement<'_>,
    params: &[&FieldValue],
    keys: &KeyMap,
) -> rusqlite::Result<Vec<GenericRecord>> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut pairs = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            pairs.push((column.clone(), row.get::<_, FieldValue>(index)?));
        }
        records.push(keys.to_generic_record(pairs));
    }
    Ok(records)
}

fn query_error(statement: &str, params: &[&FieldValue], source: rusqlite::Error) -> DatabaseError {
    let params = format!("{:?}", params);
    error!(%statement, %params, "Statement failed: {}", source);
    DatabaseError::Query {
        statement: statement.to_string(),
        params,
        source,
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
