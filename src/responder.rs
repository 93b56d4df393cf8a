//! Message-type state machine.
//!
//! Decides what to answer for one parsed message and performs the storage side
//! effects of result messages. Every failure on a handled branch turns into an
//! `AE` acknowledgement carrying the error text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, LabSettings};
use crate::database::{DatabaseAdapter, DatabaseError};
use crate::device::{AckCode, DeviceAdapter};
use crate::mapping::{PATIENT_ID, REQ_DATE};
use crate::value::PatientRecord;
use crate::{HL7Error, Message};

/// Storage format of request dates
const REQUEST_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("No active test request for patient ID {0}")]
    NoActiveRequest(String),

    #[error("Test for patient {patient_id} not ready for results (state: {state})")]
    NotFinished { patient_id: String, state: String },

    #[error("Unknown test code '{0}' in system for patient")]
    UnknownTestCode(String),

    #[error("Missing patient ID in message")]
    MissingPatientId,

    #[error("Missing result data in message")]
    MissingResults,

    #[error("Server error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cannot render response: {0}")]
    Render(#[from] HL7Error),
}

/// Outcome of responding to one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Framed outbound message, `None` when nothing is sent back
    pub message: Option<String>,
    /// Sender identity from MSH-3/MSH-4
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Panel {
    Cbc,
    Hgb,
}

pub struct Responder {
    lab: LabSettings,
    default_patient: PatientRecord,
    reject_unsupported: bool,
    locks: PatientLocks,
}

impl Responder {
    pub fn new(lab: LabSettings, default_patient: PatientRecord, reject_unsupported: bool) -> Self {
        Self {
            lab,
            default_patient,
            reject_unsupported,
            locks: PatientLocks::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.lab.clone(),
            config.default_patient.clone(),
            config.server.reject_unsupported_messages,
        )
    }

    pub fn respond(
        &self,
        message: &Message,
        device: &dyn DeviceAdapter,
        database: &dyn DatabaseAdapter,
    ) -> Response {
        let sender = device.device_identifier(message);
        let message_type = device.message_type(message);
        let control_id = message.control_id.as_str();
        info!(
            %message_type,
            sender = sender.as_deref().unwrap_or("unknown"),
            control_id,
            "Processing message"
        );

        let response = match message_type.as_str() {
            "ORU^R01" => Some(self.handle_result(message, device, database)),
            "ORM^O01" => Some(self.handle_order(message, device, database)),
            ack if ack == "ACK" || ack.starts_with("ACK^") => {
                info!(control_id, "Acknowledgement received, no response needed");
                None
            }
            other if self.reject_unsupported => {
                warn!(control_id, "Rejecting unsupported message type {}", other);
                let text = format!("Unsupported message type: {other}");
                Some(device.create_ack_message(control_id, AckCode::AR, Some(&text)))
            }
            other => {
                info!(control_id, "Unhandled message type {}, no response", other);
                None
            }
        };

        Response {
            message: response,
            sender,
        }
    }

    fn handle_result(
        &self,
        message: &Message,
        device: &dyn DeviceAdapter,
        database: &dyn DatabaseAdapter,
    ) -> String {
        let control_id = message.control_id.as_str();
        match self.store_result(message, device, database) {
            Ok(()) => device.create_ack_message(control_id, AckCode::AA, None),
            Err(e) => {
                warn!(control_id, "Result not accepted: {}", e);
                device.create_ack_message(control_id, AckCode::AE, Some(&e.to_string()))
            }
        }
    }

    fn store_result(
        &self,
        message: &Message,
        device: &dyn DeviceAdapter,
        database: &dyn DatabaseAdapter,
    ) -> Result<(), ResponseError> {
        let results = device.extract_result_data(message);
        let patient_id = results
            .patient_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ResponseError::MissingPatientId)?;
        if results.analytes.is_empty() {
            return Err(ResponseError::MissingResults);
        }

        // check-then-write must not interleave for one patient
        let lock = self.locks.get(&patient_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let request = database
            .get_patient_test_request(&patient_id)?
            .ok_or_else(|| ResponseError::NoActiveRequest(patient_id.clone()))?;

        if !request.result_state.matches_code(&self.lab.finished_state) {
            return Err(ResponseError::NotFinished {
                patient_id,
                state: request.result_state.as_code(),
            });
        }

        let panel = if request.test_code.matches_code(&self.lab.cbc_test_code) {
            Panel::Cbc
        } else if request.test_code.matches_code(&self.lab.hgb_test_code) {
            Panel::Hgb
        } else {
            return Err(ResponseError::UnknownTestCode(request.test_code.as_code()));
        };

        let requested = match database.get_patient_info(&patient_id)? {
            Some(info) => info
                .get(REQ_DATE)
                .filter(|date| !date.is_null())
                .map(|date| date.to_string()),
            None => {
                warn!(%patient_id, "No patient info found");
                None
            }
        };

        // the row to update is the one stored under the same request date
        let stored = database.find_result_date(&patient_id, requested.as_deref())?;
        let exists = stored.is_some();
        let request_date = match (requested, stored) {
            (Some(date), _) => date,
            (None, Some(date)) => {
                debug!(%patient_id, request_date = %date, "Updating latest stored result");
                date
            }
            (None, None) => {
                warn!(%patient_id, "No request date known, using current time");
                chrono::Local::now().format(REQUEST_DATE_FORMAT).to_string()
            }
        };

        let analytes = &results.analytes;
        match (panel, exists) {
            (Panel::Cbc, false) => database.save_cbc_result(&patient_id, analytes, &request_date)?,
            (Panel::Cbc, true) => database.update_cbc_result(&patient_id, analytes, &request_date)?,
            (Panel::Hgb, false) => database.save_hgb_result(&patient_id, analytes, &request_date)?,
            (Panel::Hgb, true) => database.update_hgb_result(&patient_id, analytes, &request_date)?,
        }
        info!(
            %patient_id,
            panel = ?panel,
            updated = exists,
            "Result stored"
        );
        Ok(())
    }

    fn handle_order(
        &self,
        message: &Message,
        device: &dyn DeviceAdapter,
        database: &dyn DatabaseAdapter,
    ) -> String {
        let control_id = message.control_id.as_str();
        match self.order_response(message, device, database) {
            Ok(response) => response,
            Err(e) => {
                warn!(control_id, "Order request failed: {}", e);
                device.create_ack_message(control_id, AckCode::AE, Some(&e.to_string()))
            }
        }
    }

    fn order_response(
        &self,
        message: &Message,
        device: &dyn DeviceAdapter,
        database: &dyn DatabaseAdapter,
    ) -> Result<String, ResponseError> {
        let query = device
            .extract_order_info(message)
            .filter(|query| !query.patient_id.trim().is_empty())
            .ok_or(ResponseError::MissingPatientId)?;

        let mut patient = match database.get_patient_info(&query.patient_id)? {
            Some(patient) => patient,
            None => {
                warn!(patient_id = %query.patient_id, "Patient not found, using default patient");
                self.default_patient.clone()
            }
        };
        patient.insert(PATIENT_ID.to_string(), query.patient_id.as_str().into());

        Ok(device.create_order_response_message(&message.control_id, &patient)?)
    }
}

/// One mutex per patient ID, dropped again once nobody holds it
#[derive(Debug, Default)]
pub struct PatientLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PatientLocks {
    pub fn get(&self, patient_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(patient_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboundSettings;
    use crate::database::TestRequestState;
    use crate::device::GenruiKt60Adapter;
    use crate::value::{FieldValue, GenericRecord};

    const CBC_MESSAGE: &str = "MSH|^~\\&|GenruiKT60|GenruiFacility|LIS|LIS|20230101120000||ORU^R01|MSGID001|P|2.3.1\r\
PID|1||PATID12345^^^MRN||Doe^John\r\
OBR|1|||CBC^Complete Blood Count\r\
OBX|1|NM|GENRUI-WBC^WBC^Genrui|1|9.5|10*9/L|4.0-10.0|N|||F\r";

    const ORDER_MESSAGE: &str = "MSH|^~\\&|GenruiKT60|GenruiFacility|LIS|LIS|20230101120000||ORM^O01|ORD42|P|2.3.1\r\
PID|1||PATID12345\r\
ORC|RF|S1\r\
OBX|1|IS|08001^Take Mode^99MRC||O\r";

    #[derive(Debug, Clone, PartialEq)]
    struct Write {
        op: &'static str,
        patient_id: String,
        results: GenericRecord,
        request_date: String,
    }

    #[derive(Default)]
    struct RecordingDatabase {
        requests: HashMap<String, TestRequestState>,
        patients: HashMap<String, PatientRecord>,
        /// Patient ID -> request dates of stored results, oldest first
        stored: Mutex<HashMap<String, Vec<String>>>,
        writes: Mutex<Vec<Write>>,
        broken: bool,
    }

    impl RecordingDatabase {
        fn with_request(mut self, patient_id: &str, code: i64, state: i64) -> Self {
            self.requests.insert(
                patient_id.to_string(),
                TestRequestState {
                    test_code: FieldValue::Integer(code),
                    result_state: FieldValue::Integer(state),
                },
            );
            self
        }

        fn with_patient(mut self, patient_id: &str, patient: PatientRecord) -> Self {
            self.patients.insert(patient_id.to_string(), patient);
            self
        }

        fn writes(&self) -> Vec<Write> {
            self.writes.lock().unwrap().clone()
        }

        fn with_stored(self, patient_id: &str, date: &str) -> Self {
            self.stored
                .lock()
                .unwrap()
                .entry(patient_id.to_string())
                .or_default()
                .push(date.to_string());
            self
        }

        fn record(&self, op: &'static str, patient_id: &str, results: &GenericRecord, date: &str) {
            if op.starts_with("save") {
                self.stored
                    .lock()
                    .unwrap()
                    .entry(patient_id.to_string())
                    .or_default()
                    .push(date.to_string());
            }
            self.writes.lock().unwrap().push(Write {
                op,
                patient_id: patient_id.to_string(),
                results: results.clone(),
                request_date: date.to_string(),
            });
        }

        fn check(&self) -> Result<(), DatabaseError> {
            if self.broken {
                Err(DatabaseError::Connection("server|gone".into()))
            } else {
                Ok(())
            }
        }
    }

    impl DatabaseAdapter for RecordingDatabase {
        fn connect(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn check_result_exists(&self, patient_id: &str) -> Result<bool, DatabaseError> {
            self.check()?;
            Ok(self.stored.lock().unwrap().contains_key(patient_id))
        }

        fn find_result_date(
            &self,
            patient_id: &str,
            request_date: Option<&str>,
        ) -> Result<Option<String>, DatabaseError> {
            self.check()?;
            let stored = self.stored.lock().unwrap();
            let dates = stored.get(patient_id).map(Vec::as_slice).unwrap_or_default();
            Ok(match request_date {
                Some(date) => dates.iter().find(|d| *d == date).cloned(),
                None => dates.last().cloned(),
            })
        }

        fn save_cbc_result(&self, id: &str, r: &GenericRecord, d: &str) -> Result<(), DatabaseError> {
            self.record("save_cbc", id, r, d);
            Ok(())
        }

        fn update_cbc_result(&self, id: &str, r: &GenericRecord, d: &str) -> Result<(), DatabaseError> {
            self.record("update_cbc", id, r, d);
            Ok(())
        }

        fn save_hgb_result(&self, id: &str, r: &GenericRecord, d: &str) -> Result<(), DatabaseError> {
            self.record("save_hgb", id, r, d);
            Ok(())
        }

        fn update_hgb_result(&self, id: &str, r: &GenericRecord, d: &str) -> Result<(), DatabaseError> {
            self.record("update_hgb", id, r, d);
            Ok(())
        }

        fn get_patient_info(&self, patient_id: &str) -> Result<Option<PatientRecord>, DatabaseError> {
            self.check()?;
            Ok(self.patients.get(patient_id).cloned())
        }

        fn get_patient_test_request(
            &self,
            patient_id: &str,
        ) -> Result<Option<TestRequestState>, DatabaseError> {
            self.check()?;
            Ok(self.requests.get(patient_id).cloned())
        }

        fn execute_procedure(
            &self,
            name: &str,
            _params: &GenericRecord,
        ) -> Result<Vec<GenericRecord>, DatabaseError> {
            Err(DatabaseError::UnknownProcedure(name.to_string()))
        }
    }

    fn responder() -> Responder {
        Responder::from_config(&EngineConfig::default())
    }

    fn device() -> GenruiKt60Adapter {
        GenruiKt60Adapter::new(OutboundSettings::default())
    }

    fn msa(response: &Response) -> (String, String, Option<String>) {
        let message = Message::parse(response.message.as_deref().unwrap()).unwrap();
        let msa = message.get_segment("MSA").unwrap();
        (
            msa.value(1).unwrap().to_string(),
            msa.value(2).unwrap().to_string(),
            msa.value(3).map(str::to_string),
        )
    }

    fn patient(name: &str) -> PatientRecord {
        let mut patient = PatientRecord::new();
        patient.insert("NAME".into(), name.into());
        patient.insert("SEX".into(), "Female".into());
        patient.insert("AGE".into(), FieldValue::Integer(52));
        patient.insert("AGE_UNIT".into(), "Years".into());
        patient.insert(REQ_DATE.into(), "2023-01-01 07:45:00".into());
        patient
    }

    #[test]
    fn cbc_result_is_inserted_and_accepted() {
        let database = RecordingDatabase::default()
            .with_request("PATID12345", 56, 0)
            .with_patient("PATID12345", patient("Doe, Jane"));
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        assert_eq!(msa(&response), ("AA".into(), "MSGID001".into(), None));
        assert_eq!(response.sender.as_deref(), Some("GenruiKT60^GenruiFacility"));
        let writes = database.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, "save_cbc");
        assert_eq!(writes[0].patient_id, "PATID12345");
        assert_eq!(writes[0].results["WBC"], FieldValue::Real(9.5));
        assert_eq!(writes[0].request_date, "2023-01-01 07:45:00");
    }

    #[test]
    fn repeated_result_updates_instead_of_inserting() {
        let database = RecordingDatabase::default().with_request("PATID12345", 56, 0);
        let message = Message::parse(CBC_MESSAGE).unwrap();
        let responder = responder();

        responder.respond(&message, &device(), &database);
        let second = responder.respond(&message, &device(), &database);

        assert_eq!(msa(&second).0, "AA");
        let writes = database.writes();
        let ops: Vec<&str> = writes.iter().map(|w| w.op).collect();
        assert_eq!(ops, vec!["save_cbc", "update_cbc"]);
        // without patient info the update reuses the stored row's date
        assert_eq!(writes[1].request_date, writes[0].request_date);
    }

    #[test]
    fn new_request_date_inserts_beside_older_results() {
        let database = RecordingDatabase::default()
            .with_request("PATID12345", 56, 0)
            .with_patient("PATID12345", patient("Doe, Jane"))
            .with_stored("PATID12345", "2022-06-01 09:00:00");
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        assert_eq!(msa(&response).0, "AA");
        let writes = database.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, "save_cbc");
        assert_eq!(writes[0].request_date, "2023-01-01 07:45:00");
    }

    mod sqlite {
        use super::*;
        use crate::database::SqliteAdapter;
        use crate::mapping::StorageMappings;

        fn database(seed: &str) -> SqliteAdapter {
            let database = SqliteAdapter::in_memory(StorageMappings::default());
            database.connect().unwrap();
            database
                .execute_script(
                    "INSERT INTO patienttest (patientid, testcode, resultfinsh) VALUES ('PATID12345', 56, 0);",
                )
                .unwrap();
            database.execute_script(seed).unwrap();
            database
        }

        fn stored_rows(database: &SqliteAdapter) -> Vec<GenericRecord> {
            let mut params = GenericRecord::new();
            params.insert(PATIENT_ID.into(), "PATID12345".into());
            database
                .execute_procedure("GetPatientCBCResult", &params)
                .unwrap()
        }

        #[test]
        fn repeat_without_patient_info_updates_the_stored_row() {
            let database = database("");
            let message = Message::parse(CBC_MESSAGE).unwrap();
            let responder = responder();

            let first = responder.respond(&message, &device(), &database);
            std::thread::sleep(std::time::Duration::from_millis(1100));
            let repeat = Message::parse(&CBC_MESSAGE.replace("|9.5|", "|7.5|")).unwrap();
            let second = responder.respond(&repeat, &device(), &database);

            assert_eq!(msa(&first), ("AA".into(), "MSGID001".into(), None));
            assert_eq!(msa(&second), ("AA".into(), "MSGID001".into(), None));
            let rows = stored_rows(&database);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["WBC"], FieldValue::Real(7.5));
        }

        #[test]
        fn returning_patient_gets_a_new_row() {
            let database = database(
                "INSERT INTO cbc (patientid, requestdate, wbc) VALUES ('PATID12345', '2022-06-01 09:00:00', 4.1);
                 INSERT INTO patientinfo (patientid, patientnamear, requestdate)
                     VALUES ('PATID12345', 'Doe, John', '2023-01-01 07:45:00');",
            );
            let message = Message::parse(CBC_MESSAGE).unwrap();
            let responder = responder();

            let first = responder.respond(&message, &device(), &database);
            let second = responder.respond(&message, &device(), &database);

            assert_eq!(msa(&first).0, "AA");
            assert_eq!(msa(&second).0, "AA");
            let rows = stored_rows(&database);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0][REQ_DATE], FieldValue::Text("2023-01-01 07:45:00".into()));
            assert_eq!(rows[0]["WBC"], FieldValue::Real(9.5));
            assert_eq!(rows[1]["WBC"], FieldValue::Real(4.1));
        }
    }

    #[test]
    fn hgb_request_uses_hgb_storage() {
        let database = RecordingDatabase::default().with_request("PATID12345", 50, 0);
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        assert_eq!(msa(&response).0, "AA");
        assert_eq!(database.writes()[0].op, "save_hgb");
    }

    #[test]
    fn no_active_request_is_rejected_without_writes() {
        let database = RecordingDatabase::default();
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        let (code, id, text) = msa(&response);
        assert_eq!(code, "AE");
        assert_eq!(id, "MSGID001");
        assert!(text.unwrap().contains("No active test request"));
        assert!(database.writes().is_empty());
    }

    #[test]
    fn unfinished_and_unknown_tests_are_errors() {
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let pending = RecordingDatabase::default().with_request("PATID12345", 56, 1);
        let response = responder().respond(&message, &device(), &pending);
        assert_eq!(msa(&response).0, "AE");
        assert!(msa(&response).2.unwrap().contains("not ready"));

        let unknown = RecordingDatabase::default().with_request("PATID12345", 99, 0);
        let response = responder().respond(&message, &device(), &unknown);
        assert!(msa(&response).2.unwrap().contains("Unknown test code '99'"));

        assert!(pending.writes().is_empty());
        assert!(unknown.writes().is_empty());
    }

    #[test]
    fn storage_failure_becomes_escaped_ae() {
        let database = RecordingDatabase {
            broken: true,
            ..RecordingDatabase::default()
        };
        let message = Message::parse(CBC_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        let (code, _, text) = msa(&response);
        assert_eq!(code, "AE");
        assert!(text.unwrap().contains("server\\F\\gone"));
    }

    #[test]
    fn order_for_known_patient_renders_demographics() {
        let database =
            RecordingDatabase::default().with_patient("PATID12345", patient("Doe, Jane"));
        let message = Message::parse(ORDER_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        let orr = Message::parse(response.message.as_deref().unwrap()).unwrap();
        assert_eq!(orr.message_type, "ORR^O02");
        assert_eq!(orr.get_segment("MSA").unwrap().value(2), Some("ORD42"));
        let pid = orr.get_segment("PID").unwrap();
        assert_eq!(pid.value(3), Some("PATID12345"));
        assert_eq!(pid.value(5), Some("Doe^Jane"));
        assert_eq!(pid.value(8), Some("F"));
        assert_eq!(orr.get_segments("OBX")[2].value(5), Some("52"));
    }

    #[test]
    fn order_for_unknown_patient_uses_default_with_requested_id() {
        let database = RecordingDatabase::default();
        let message = Message::parse(ORDER_MESSAGE).unwrap();

        let response = responder().respond(&message, &device(), &database);

        let orr = Message::parse(response.message.as_deref().unwrap()).unwrap();
        let pid = orr.get_segment("PID").unwrap();
        assert_eq!(pid.value(3), Some("PATID12345"));
        assert_eq!(pid.value(5), Some("Patient Not in DB"));
        assert_eq!(pid.value(8), Some("M"));
        assert_eq!(orr.get_segment("ORC").unwrap().value(2), Some("PATID12345"));
        assert_eq!(orr.get_segments("OBX")[2].value(5), Some("30"));
    }

    #[test]
    fn order_without_patient_id_is_ae() {
        let message = Message::parse(
            "MSH|^~\\&|GenruiKT60|F|||1||ORM^O01|ORD1|P|2.3.1\rORC|RF\rOBX|1|IS|X||1",
        )
        .unwrap();
        let response = responder().respond(&message, &device(), &RecordingDatabase::default());
        let (code, id, text) = msa(&response);
        assert_eq!((code.as_str(), id.as_str()), ("AE", "ORD1"));
        assert_eq!(text.as_deref(), Some("Missing patient ID in message"));
    }

    #[test]
    fn acks_and_unknown_types_are_silent() {
        let database = RecordingDatabase::default();
        let ack = Message::parse("MSH|^~\\&|GenruiKT60|F|||1||ACK^O02|9|P|2.3.1\rMSA|AA|1").unwrap();
        let response = responder().respond(&ack, &device(), &database);
        assert_eq!(response.message, None);
        assert_eq!(response.sender.as_deref(), Some("GenruiKT60^F"));

        let adt = Message::parse("MSH|^~\\&|GenruiKT60|F|||1||ADT^A01|10|P|2.3.1").unwrap();
        assert_eq!(responder().respond(&adt, &device(), &database).message, None);
    }

    #[test]
    fn unknown_types_can_be_rejected() {
        let responder = Responder::new(LabSettings::default(), PatientRecord::new(), true);
        let adt = Message::parse("MSH|^~\\&|GenruiKT60|F|||1||ADT^A01|10|P|2.3.1").unwrap();

        let response = responder.respond(&adt, &device(), &RecordingDatabase::default());

        let (code, id, text) = msa(&response);
        assert_eq!((code.as_str(), id.as_str()), ("AR", "10"));
        assert!(text.unwrap().contains("ADT\\S\\A01"));
    }

    #[test]
    fn patient_locks_are_shared_and_pruned() {
        let locks = PatientLocks::default();
        let first = locks.get("P1");
        let second = locks.get("P1");
        assert!(Arc::ptr_eq(&first, &second));
        drop(first);
        drop(second);

        let _other = locks.get("P2");
        assert_eq!(locks.len(), 1);
    }
}
