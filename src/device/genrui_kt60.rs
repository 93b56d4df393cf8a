use tracing::{debug, info, warn};

use super::{infer_panel, panel_from_obr, render_ack, render_order_response};
use super::{AckCode, DeviceAdapter, DeviceModel, ResultSet};
use crate::config::OutboundSettings;
use crate::value::{FieldValue, GenericRecord, PatientRecord};
use crate::{HL7Error, Message};

/// OBX-3.1 observation code -> generic analyte name
const ANALYTE_CODES: &[(&str, &str)] = &[
    ("GENRUI-WBC", "WBC"),
    ("GENRUI-LYM%", "LYMPHOCYTE"),
    ("GENRUI-MON%", "MONOCYTE"),
    ("GENRUI-NEUT%", "NEUTROPHIL"),
    ("GENRUI-EOS%", "EOSINOPHIL"),
    ("GENRUI-BASO%", "BASOPHIL"),
    ("GENRUI-LYM#", "LYM#"),
    ("GENRUI-MON#", "MON#"),
    ("GENRUI-NEUT#", "NEUT#"),
    ("GENRUI-EOS#", "EOS#"),
    ("GENRUI-BASO#", "BASO#"),
    ("GENRUI-RBC", "RBC"),
    ("GENRUI-HGB", "HGB"),
    ("GENRUI-HCT", "HCT"),
    ("GENRUI-MCV", "MCV"),
    ("GENRUI-MCH", "MCH"),
    ("GENRUI-MCHC", "MCHC"),
    ("GENRUI-RDW-CV", "RDW"),
    ("GENRUI-PLT", "PLT"),
    ("GENRUI-MPV", "MPV"),
    ("GENRUI-PDW", "PDW"),
    ("GENRUI-PCT", "PCT"),
];

/// Genrui KT-60 hematology analyzer, results identified by observation code
#[derive(Debug, Clone)]
pub struct GenruiKt60Adapter {
    settings: OutboundSettings,
}

impl GenruiKt60Adapter {
    pub fn new(settings: OutboundSettings) -> Self {
        Self { settings }
    }

    fn analyte_name(code: &str) -> Option<&'static str> {
        ANALYTE_CODES
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, name)| *name)
    }
}

impl DeviceAdapter for GenruiKt60Adapter {
    fn model(&self) -> DeviceModel {
        DeviceModel::GenruiKt60
    }

    fn extract_result_data(&self, message: &Message) -> ResultSet {
        let patient_id = self.patient_id(message);
        let mut panel = panel_from_obr(message);
        if let Some(panel) = &panel {
            debug!("Panel '{}' from OBR-4", panel);
        }

        let observations = message.observations();
        let unidentified = message.get_segments("OBX").len() - observations.len();
        if unidentified > 0 {
            warn!("{} OBX segments without observation identifier skipped", unidentified);
        }

        let mut analytes = GenericRecord::new();
        for observation in &observations {
            let code = observation.identifier.as_str();
            let Some(name) = Self::analyte_name(code) else {
                warn!(
                    "Unmapped OBX identifier: {} ({}), value {}",
                    code,
                    observation.text.as_deref().unwrap_or("N/A"),
                    observation.value.as_deref().unwrap_or("")
                );
                continue;
            };
            match observation.value.as_deref() {
                Some(raw) => {
                    analytes.insert(name.to_string(), FieldValue::coerce(raw));
                }
                None => warn!("OBX {} has no value", code),
            }
        }

        if analytes.is_empty() {
            warn!(
                patient_id = patient_id.as_deref().unwrap_or(""),
                "No results extracted, check OBX codes"
            );
        } else if panel.is_none() {
            panel = infer_panel(&analytes);
        }

        info!(
            patient_id = patient_id.as_deref().unwrap_or(""),
            panel = panel.as_deref().unwrap_or(""),
            count = analytes.len(),
            "Extracted result data"
        );
        ResultSet {
            panel,
            patient_id,
            analytes,
        }
    }

    fn create_ack_message(&self, control_id: &str, code: AckCode, error_text: Option<&str>) -> String {
        render_ack(&self.settings, control_id, code, error_text)
    }

    fn create_order_response_message(
        &self,
        control_id: &str,
        patient: &PatientRecord,
    ) -> Result<String, HL7Error> {
        render_order_response(&self.settings, control_id, patient)
    }
}
