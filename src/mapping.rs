//! Declarative field mapping tables.
//!
//! Two families of tables live here:
//!
//! * storage mappings, which translate generic keys (`WBC`, `NAME`, ...) to
//!   table and column names of the result store, and
//! * HL7 locator mappings, which say where in a message a generic value sits.
//!
//! Both are plain data, loaded once with the configuration and never mutated.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::value::{FieldValue, GenericRecord};
use crate::Message;

/// Generic key of the patient identifier in every table
pub const PATIENT_ID: &str = "PATIENT_ID";
/// Generic key of the request date in result and patient tables
pub const REQ_DATE: &str = "REQ_DATE";
pub const TEST_CODE: &str = "TEST_CODE";
pub const RESULT_STATE: &str = "RESULT_STATE";

/// Storage layout of one record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMapping {
    pub table: String,
    /// Generic key -> column
    pub columns: BTreeMap<String, String>,
    /// Generic key -> column used to select rows
    pub conditions: BTreeMap<String, String>,
}

impl RecordMapping {
    fn new(table: &str, columns: &[(&str, &str)], conditions: &[(&str, &str)]) -> Self {
        let owned = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        Self {
            table: table.to_string(),
            columns: owned(columns),
            conditions: owned(conditions),
        }
    }

    /// Condition column for a generic key
    pub fn condition(&self, key: &str) -> Option<&str> {
        self.conditions.get(key).map(String::as_str)
    }
}

/// A named, parameterised query with an ordered generic parameter list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureMapping {
    pub name: String,
    /// Statement using positional `?1..?N` placeholders in `parameters` order
    pub statement: String,
    pub parameters: Vec<String>,
    /// Generic key -> output column
    pub columns: BTreeMap<String, String>,
}

/// All storage mapping tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageMappings {
    pub result_exists: RecordMapping,
    pub cbc_result: RecordMapping,
    pub hgb_result: RecordMapping,
    pub patient_info: RecordMapping,
    pub patient_test: RecordMapping,
    pub procedures: Vec<ProcedureMapping>,
}

impl Default for StorageMappings {
    fn default() -> Self {
        let cbc_columns: &[(&str, &str)] = &[
            (PATIENT_ID, "patientid"),
            (REQ_DATE, "requestdate"),
            ("HGB", "hgb"),
            ("RBC", "rbc"),
            ("HCT", "hct"),
            ("PLT", "plt"),
            ("HGB%", "hgbper"),
            ("MCV", "mcv"),
            ("MCH", "mch"),
            ("MCHC", "mchc"),
            ("PCT", "pct"),
            ("MPV", "mpv"),
            ("WBC", "wbc"),
            ("NEUTROPHIL", "neut"),
            ("LYMPHOCYTE", "lymph"),
            ("MONOCYTE", "mono"),
            ("EOSINOPHIL", "eosino"),
            ("BASOPHIL", "baso"),
            ("LYM#", "lymphabs"),
            ("MON#", "monoabs"),
            ("NEUT#", "neutabs"),
            ("EOS#", "eosinoabs"),
            ("BASO#", "basoabs"),
            ("OTHERCELL", "othercell"),
            ("RDW", "rdw"),
            ("PDW", "pdw"),
            ("SEGMENT", "seg"),
            ("BAND", "bandx"),
            ("COMMENT", "comment"),
            ("JUVENILE", "juvenile"),
            ("MYELOCYTES", "myelocytes"),
            ("PROMYELOCYTE", "promyelocyte"),
            ("BLAST", "blast"),
            ("NRBCWBC", "nrbcwbc"),
        ];
        let patient_columns: &[(&str, &str)] = &[
            ("NAME", "patientnamear"),
            ("SEX", "patientsex"),
            ("AGE", "patientage"),
            ("AGE_UNIT", "patientageunit"),
            (REQ_DATE, "requestdate"),
        ];
        let by_patient: &[(&str, &str)] = &[(PATIENT_ID, "patientid")];

        let cbc_result = RecordMapping::new("cbc", cbc_columns, by_patient);

        let mut search_columns = RecordMapping::new("patientinfo", patient_columns, &[]).columns;
        search_columns.insert(PATIENT_ID.to_string(), "patientid".to_string());
        search_columns.insert(TEST_CODE.to_string(), "testcode".to_string());
        search_columns.insert(RESULT_STATE.to_string(), "resultfinsh".to_string());

        Self {
            result_exists: RecordMapping::new(
                "cbc",
                &[(PATIENT_ID, "patientid"), (REQ_DATE, "requestdate")],
                by_patient,
            ),
            hgb_result: RecordMapping::new(
                "cbc",
                &[
                    (PATIENT_ID, "patientid"),
                    (REQ_DATE, "requestdate"),
                    ("HGB", "hgb"),
                    ("HCT", "hct"),
                    ("MCHC", "mchc"),
                ],
                by_patient,
            ),
            patient_info: RecordMapping::new("patientinfo", patient_columns, by_patient),
            patient_test: RecordMapping::new(
                "patienttest",
                &[(TEST_CODE, "testcode"), (RESULT_STATE, "resultfinsh")],
                by_patient,
            ),
            procedures: vec![
                ProcedureMapping {
                    name: "GetPatientInfo".to_string(),
                    statement: "SELECT p.patientid AS patientid, p.patientnamear AS patientnamear, \
                                p.patientsex AS patientsex, p.patientage AS patientage, \
                                p.patientageunit AS patientageunit, p.requestdate AS requestdate, \
                                t.testcode AS testcode, t.resultfinsh AS resultfinsh \
                                FROM patientinfo p LEFT JOIN patienttest t ON t.patientid = p.patientid \
                                WHERE (?1 IS NULL OR p.patientid = ?1) \
                                AND (?2 IS NULL OR p.patientnamear LIKE '%' || ?2 || '%') \
                                AND (?3 IS NULL OR p.requestdate >= ?3) \
                                AND (?4 IS NULL OR p.requestdate <= ?4) \
                                AND (?5 IS NULL OR t.resultfinsh = ?5) \
                                ORDER BY p.requestdate DESC"
                        .to_string(),
                    parameters: vec![
                        PATIENT_ID.to_string(),
                        "PATIENT_NAME".to_string(),
                        "START_DATE".to_string(),
                        "END_DATE".to_string(),
                        "RESULT_FINISHED".to_string(),
                    ],
                    columns: search_columns,
                },
                ProcedureMapping {
                    name: "GetPatientCBCResult".to_string(),
                    statement: "SELECT * FROM cbc WHERE patientid = ?1 ORDER BY requestdate DESC"
                        .to_string(),
                    parameters: vec![PATIENT_ID.to_string()],
                    columns: cbc_result.columns.clone(),
                },
            ],
            cbc_result,
        }
    }
}

impl StorageMappings {
    /// Every table referenced by a record mapping with the union of its columns
    pub fn tables(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in [
            &self.result_exists,
            &self.cbc_result,
            &self.hgb_result,
            &self.patient_info,
            &self.patient_test,
        ] {
            tables
                .entry(record.table.clone())
                .or_default()
                .extend(record.columns.values().chain(record.conditions.values()).cloned());
        }
        tables
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureMapping> {
        self.procedures.iter().find(|p| p.name == name)
    }
}

/// Bidirectional generic <-> storage key map, built once per record type
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    to_storage: BTreeMap<String, String>,
    to_generic: BTreeMap<String, String>,
}

impl KeyMap {
    pub fn new(columns: &BTreeMap<String, String>) -> Self {
        Self {
            to_storage: columns
                .iter()
                .map(|(generic, column)| (generic.to_ascii_uppercase(), column.clone()))
                .collect(),
            // SQL identifiers compare case-insensitively
            to_generic: columns
                .iter()
                .map(|(generic, column)| (column.to_ascii_lowercase(), generic.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_storage.is_empty()
    }

    pub fn storage(&self, generic: &str) -> Option<&str> {
        self.to_storage
            .get(&generic.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn generic(&self, storage: &str) -> Option<&str> {
        self.to_generic
            .get(&storage.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Storage columns in generic-key order
    pub fn storage_columns(&self) -> impl Iterator<Item = &str> {
        self.to_storage.values().map(String::as_str)
    }

    /// Translate a generic record to `(column, value)` pairs.
    ///
    /// Keys without a column are dropped with a warning.
    pub fn to_storage_pairs<'a>(
        &self,
        record: &'a GenericRecord,
        context: &str,
    ) -> Vec<(String, &'a FieldValue)> {
        record
            .iter()
            .filter_map(|(key, value)| match self.storage(key) {
                Some(column) => Some((column.to_string(), value)),
                None => {
                    warn!("Generic key '{}' has no {} column, skipping", key, context);
                    None
                }
            })
            .collect()
    }

    /// Translate `(column, value)` pairs read from storage to a generic record.
    ///
    /// Columns without a generic key are not exposed.
    pub fn to_generic_record(&self, row: Vec<(String, FieldValue)>) -> GenericRecord {
        row.into_iter()
            .filter_map(|(column, value)| match self.generic(&column) {
                Some(key) => Some((key.to_string(), value)),
                None => {
                    debug!("Column '{}' is not mapped, not exposed", column);
                    None
                }
            })
            .collect()
    }
}

/// Where one value lives inside an HL7 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hl7Locator {
    pub segment: String,
    /// Zero-based occurrence among segments of this type
    #[serde(default)]
    pub occurrence: usize,
    /// HL7 field number
    pub field: usize,
    /// Optional component number; the whole field when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<usize>,
}

impl Hl7Locator {
    pub fn new(segment: &str, occurrence: usize, field: usize) -> Self {
        Self {
            segment: segment.to_string(),
            occurrence,
            field,
            component: None,
        }
    }

    pub fn with_component(mut self, component: usize) -> Self {
        self.component = Some(component);
        self
    }

    pub fn resolve<'m>(&self, message: &'m Message) -> Option<&'m str> {
        let segment = message
            .segments
            .iter()
            .filter(|s| s.name == self.segment)
            .nth(self.occurrence)?;
        match self.component {
            Some(component) => segment.component(self.field, component),
            None => segment.value(self.field),
        }
    }
}

/// Source of a generic value when building a record from a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hl7Source {
    Locator(Hl7Locator),
    /// Filled from data already held in storage
    Storage,
    /// Entered by hand, never sent by the analyzer
    Manual,
}

/// HL7 layout of one record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hl7RecordMapping {
    pub fields: BTreeMap<String, Hl7Source>,
    pub conditions: BTreeMap<String, Hl7Locator>,
}

/// Values resolved from a message through an [`Hl7RecordMapping`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRecord {
    pub values: GenericRecord,
    pub conditions: GenericRecord,
}

impl Hl7RecordMapping {
    /// Build the generic record for a message.
    ///
    /// Located values are numerically coerced. Values that cannot be found are
    /// left out of the record.
    pub fn resolve(
        &self,
        message: &Message,
        storage: Option<&GenericRecord>,
        manual: Option<&GenericRecord>,
    ) -> ResolvedRecord {
        let mut resolved = ResolvedRecord::default();

        for (key, source) in &self.fields {
            let value = match source {
                Hl7Source::Locator(locator) => match locator.resolve(message) {
                    Some(raw) => Some(FieldValue::coerce(raw)),
                    None => {
                        warn!(
                            "No value for '{}' at {}[{}]-{}",
                            key, locator.segment, locator.occurrence, locator.field
                        );
                        None
                    }
                },
                Hl7Source::Storage => storage.and_then(|data| data.get(key)).cloned(),
                Hl7Source::Manual => manual.and_then(|data| data.get(key)).cloned(),
            };
            if let Some(value) = value {
                resolved.values.insert(key.clone(), value);
            }
        }

        for (key, locator) in &self.conditions {
            if let Some(raw) = locator.resolve(message) {
                resolved
                    .conditions
                    .insert(key.clone(), FieldValue::Text(raw.to_string()));
            }
        }

        resolved
    }
}

/// All HL7 locator tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hl7Mappings {
    pub cbc_result: Hl7RecordMapping,
    pub hgb_result: Hl7RecordMapping,
    /// Places to look for the patient identifier, tried in order
    pub patient_id: Vec<Hl7Locator>,
}

impl Default for Hl7Mappings {
    fn default() -> Self {
        let pid = Hl7Locator::new("PID", 0, 3).with_component(1);
        let obx = |occurrence: usize| Hl7Source::Locator(Hl7Locator::new("OBX", occurrence, 5));

        let mut cbc_fields: BTreeMap<String, Hl7Source> = [
            ("WBC", 0),
            ("LYMPHOCYTE", 4),
            ("MONOCYTE", 5),
            ("NEUTROPHIL", 6),
            ("RBC", 7),
            ("HGB", 8),
            ("HCT", 9),
            ("MCV", 10),
            ("MCH", 11),
            ("MCHC", 12),
            ("RDW", 13),
            ("PLT", 15),
            ("MPV", 16),
            ("PDW", 17),
            ("PCT", 18),
        ]
        .into_iter()
        .map(|(key, occurrence)| (key.to_string(), obx(occurrence)))
        .collect();
        cbc_fields.insert(REQ_DATE.to_string(), Hl7Source::Storage);
        for manual in [
            "HGB%", "EOSINOPHIL", "BASOPHIL", "OTHERCELL", "SEGMENT", "BAND", "COMMENT",
            "JUVENILE", "MYELOCYTES", "PROMYELOCYTE", "BLAST", "NRBCWBC",
        ] {
            cbc_fields.insert(manual.to_string(), Hl7Source::Manual);
        }

        let hgb_fields = [("HGB", 8), ("HCT", 9), ("MCHC", 12)]
            .into_iter()
            .map(|(key, occurrence)| (key.to_string(), obx(occurrence)))
            .chain([(REQ_DATE.to_string(), Hl7Source::Storage)])
            .collect();

        let conditions: BTreeMap<String, Hl7Locator> =
            [(PATIENT_ID.to_string(), pid.clone())].into_iter().collect();

        Self {
            cbc_result: Hl7RecordMapping {
                fields: cbc_fields,
                conditions: conditions.clone(),
            },
            hgb_result: Hl7RecordMapping {
                fields: hgb_fields,
                conditions,
            },
            patient_id: vec![pid, Hl7Locator::new("ORC", 0, 3).with_component(1)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_map_is_bidirectional_and_case_tolerant() {
        let mappings = StorageMappings::default();
        let keys = KeyMap::new(&mappings.cbc_result.columns);

        assert_eq!(keys.storage("WBC"), Some("wbc"));
        assert_eq!(keys.storage("hgb%"), Some("hgbper"));
        assert_eq!(keys.generic("NEUT"), Some("NEUTROPHIL"));
        assert_eq!(keys.generic("unknown"), None);
    }

    #[test]
    fn unmapped_generic_keys_are_dropped() {
        let keys = KeyMap::new(&StorageMappings::default().hgb_result.columns);
        let mut record = GenericRecord::new();
        record.insert("HGB".into(), FieldValue::Real(13.1));
        record.insert("LYM#".into(), FieldValue::Real(2.0));

        let pairs = keys.to_storage_pairs(&record, "HGB result");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "hgb");
    }

    #[test]
    fn tables_union_columns_per_table() {
        let tables = StorageMappings::default().tables();
        assert_eq!(tables.len(), 3);
        assert!(tables["cbc"].contains("hgbper"));
        assert!(tables["cbc"].contains("lymphabs"));
        assert!(tables["patientinfo"].contains("patientid"));
        assert!(tables["patienttest"].contains("resultfinsh"));
    }

    #[test]
    fn hl7_mapping_resolves_by_occurrence() {
        let mut raw = String::from("MSH|^~\\&|KT60|Lab|||20230101||ORU^R01|1|P|2.3.1\r");
        raw.push_str("PID|1||P77^^^MRN\r");
        for i in 0..19 {
            raw.push_str(&format!("OBX|{}|NM|X{}||{}.5\r", i + 1, i, i));
        }
        let message = Message::parse(&raw).unwrap();

        let mut storage = GenericRecord::new();
        storage.insert(REQ_DATE.into(), "2023-01-01 08:00:00".into());

        let resolved = Hl7Mappings::default()
            .cbc_result
            .resolve(&message, Some(&storage), None);

        assert_eq!(resolved.values["WBC"], FieldValue::Real(0.5));
        assert_eq!(resolved.values["HGB"], FieldValue::Real(8.5));
        assert_eq!(resolved.values["PCT"], FieldValue::Real(18.5));
        assert_eq!(resolved.values[REQ_DATE], FieldValue::Text("2023-01-01 08:00:00".into()));
        assert!(!resolved.values.contains_key("COMMENT"));
        assert_eq!(resolved.conditions[PATIENT_ID], FieldValue::Text("P77".into()));
    }

    #[test]
    fn hl7_source_serializes_like_config() {
        let json = serde_json::to_string(&Hl7Source::Storage).unwrap();
        assert_eq!(json, "\"storage\"");
        let parsed: Hl7Source =
            serde_json::from_str(r#"{"locator":{"segment":"OBX","occurrence":2,"field":5}}"#)
                .unwrap();
        assert_eq!(parsed, Hl7Source::Locator(Hl7Locator::new("OBX", 2, 5)));
    }
}
