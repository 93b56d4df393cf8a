use tracing::{info, warn};

use super::{infer_panel, panel_from_obr, render_ack, render_order_response};
use super::{AckCode, DeviceAdapter, DeviceModel, ResultSet};
use crate::config::OutboundSettings;
use crate::mapping::{Hl7Mappings, PATIENT_ID};
use crate::value::PatientRecord;
use crate::{HL7Error, Message};

/// Genrui KT-60 firmware that sends results in a fixed OBX order.
///
/// Analytes are located by OBX occurrence through the HL7 locator tables
/// instead of by observation code.
#[derive(Debug, Clone)]
pub struct GenruiKt60IndexedAdapter {
    settings: OutboundSettings,
    hl7: Hl7Mappings,
}

impl GenruiKt60IndexedAdapter {
    pub fn new(settings: OutboundSettings, hl7: Hl7Mappings) -> Self {
        Self { settings, hl7 }
    }
}

impl DeviceAdapter for GenruiKt60IndexedAdapter {
    fn model(&self) -> DeviceModel {
        DeviceModel::GenruiKt60Indexed
    }

    fn patient_id(&self, message: &Message) -> Option<String> {
        self.hl7
            .patient_id
            .iter()
            .find_map(|locator| locator.resolve(message))
            .map(str::to_string)
    }

    fn extract_result_data(&self, message: &Message) -> ResultSet {
        let obr_panel = panel_from_obr(message);
        let mapping = match obr_panel.as_deref() {
            Some("HGB") => &self.hl7.hgb_result,
            _ => &self.hl7.cbc_result,
        };

        let mut resolved = mapping.resolve(message, None, None);
        let patient_id = resolved
            .conditions
            .remove(PATIENT_ID)
            .map(|id| id.to_string())
            .or_else(|| self.patient_id(message));

        let analytes = resolved.values;
        if analytes.is_empty() {
            warn!("No OBX values found at the configured positions");
        }
        let panel = obr_panel.or_else(|| infer_panel(&analytes));

        info!(
            patient_id = patient_id.as_deref().unwrap_or(""),
            panel = panel.as_deref().unwrap_or(""),
            count = analytes.len(),
            "Extracted indexed result data"
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
