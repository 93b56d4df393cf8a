//! Device adapters isolate one instrument's HL7 dialect.
//!
//! Each instrument model implements [`DeviceAdapter`] once: how results and
//! order queries are extracted and how acknowledgements and order responses are
//! rendered. The active model is chosen by name from [`DeviceModel`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OutboundSettings;
use crate::mapping::Hl7Mappings;
use crate::mllp::wrap_in_mllp;
use crate::value::{FieldValue, GenericRecord, PatientRecord};
use crate::{escape_text, hl7_timestamp, Delimiters, HL7Error, Message, SEGMENT_SEPARATOR};

mod genrui_kt60;
mod genrui_kt60_indexed;

pub use genrui_kt60::GenruiKt60Adapter;
pub use genrui_kt60_indexed::GenruiKt60IndexedAdapter;

/// HL7 acknowledgement code (MSA-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    /// Application Accept
    AA,
    /// Application Error
    AE,
    /// Application Reject
    AR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Results extracted from an ORU message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub panel: Option<String>,
    pub patient_id: Option<String>,
    /// Generic analyte name -> value
    pub analytes: GenericRecord,
}

/// Information request extracted from an ORM message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderQuery {
    pub patient_id: String,
    pub placer_order: Option<String>,
}

/// One instrument model's HL7 dialect
pub trait DeviceAdapter: Send + Sync {
    fn model(&self) -> DeviceModel;

    /// Decode raw frame bytes into a message
    fn parse_message(&self, raw: &[u8]) -> Result<Message, HL7Error> {
        Message::from_bytes(raw)
    }

    /// MSH-9 as `TYPE^TRIGGER`
    fn message_type(&self, message: &Message) -> String {
        message.message_type.clone()
    }

    /// PID-3.1, falling back to ORC-3.1 for order messages
    fn patient_id(&self, message: &Message) -> Option<String> {
        message
            .get_segment("PID")
            .and_then(|pid| pid.component(3, 1))
            .or_else(|| message.get_segment("ORC").and_then(|orc| orc.component(3, 1)))
            .map(str::to_string)
    }

    /// `sending-application^sending-facility` from MSH-3/MSH-4
    fn device_identifier(&self, message: &Message) -> Option<String> {
        message.envelope().sender_identity()
    }

    fn extract_order_info(&self, message: &Message) -> Option<OrderQuery> {
        let patient_id = self.patient_id(message)?;
        let placer_order = message
            .get_segment("ORC")
            .and_then(|orc| orc.component(2, 1))
            .map(str::to_string);
        Some(OrderQuery {
            patient_id,
            placer_order,
        })
    }

    fn extract_result_data(&self, message: &Message) -> ResultSet;

    /// Framed ACK for the given control ID
    fn create_ack_message(&self, control_id: &str, code: AckCode, error_text: Option<&str>) -> String;

    /// Framed ORR^O02 rendering a generic patient record
    fn create_order_response_message(
        &self,
        control_id: &str,
        patient: &PatientRecord,
    ) -> Result<String, HL7Error>;
}

/// Registry of instrument models selectable by configuration name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceModel {
    #[default]
    GenruiKt60,
    GenruiKt60Indexed,
}

impl DeviceModel {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceModel::GenruiKt60 => "genrui_kt60",
            DeviceModel::GenruiKt60Indexed => "genrui_kt60_indexed",
        }
    }

    pub fn build(&self, outbound: &OutboundSettings, hl7: &Hl7Mappings) -> Arc<dyn DeviceAdapter> {
        info!("Using device adapter {}", self.name());
        match self {
            DeviceModel::GenruiKt60 => Arc::new(GenruiKt60Adapter::new(outbound.clone())),
            DeviceModel::GenruiKt60Indexed => {
                Arc::new(GenruiKt60IndexedAdapter::new(outbound.clone(), hl7.clone()))
            }
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "genrui_kt60" => Ok(DeviceModel::GenruiKt60),
            "genrui_kt60_indexed" => Ok(DeviceModel::GenruiKt60Indexed),
            other => Err(format!("Unknown device model '{other}'")),
        }
    }
}

/// Panel code from OBR-4.1
///
/// Codes mentioning CBC or HGB map to those panels; anything else is kept as is.
pub(crate) fn panel_from_obr(message: &Message) -> Option<String> {
    let service = message.get_segment("OBR")?.component(4, 1)?;
    let upper = service.to_ascii_uppercase();
    Some(if upper.contains("CBC") {
        "CBC".to_string()
    } else if upper.contains("HGB") {
        "HGB".to_string()
    } else {
        service.to_string()
    })
}

/// Panel guessed from the analytes that were reported
pub(crate) fn infer_panel(analytes: &GenericRecord) -> Option<String> {
    if analytes.is_empty() {
        return None;
    }
    let panel = match (analytes.contains_key("HGB"), analytes.contains_key("WBC")) {
        (true, true) => "CBC",
        (true, false) => "HGB",
        _ => "UNKNOWN_PANEL",
    };
    info!("Inferred panel '{}' from reported analytes", panel);
    Some(panel.to_string())
}

/// Outbound MSH segment for this engine
pub(crate) fn outbound_msh(
    settings: &OutboundSettings,
    message_type: &str,
    control_id: &str,
) -> String {
    format!(
        "MSH|{}|{}|{}|||{}||{}|{}|P|2.3.1|||||CHA|UTF-8|||",
        Delimiters::default().encoding_characters(),
        settings.application_name,
        settings.application_version,
        hl7_timestamp(),
        message_type,
        control_id
    )
}

/// Control ID for a generated message: timestamp, tail of the trigger ID, suffix
pub(crate) fn response_control_id(original: &str, suffix: &str) -> String {
    let tail_start = original
        .char_indices()
        .rev()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}{}{}", hl7_timestamp(), &original[tail_start..], suffix)
}

/// Frame a list of segments as one outbound message
pub(crate) fn frame_segments(segments: &[String]) -> String {
    let mut body = segments.join(&SEGMENT_SEPARATOR.to_string());
    body.push(SEGMENT_SEPARATOR);
    wrap_in_mllp(&body)
}

/// ACK rendering shared by the Genrui profiles
pub(crate) fn render_ack(
    settings: &OutboundSettings,
    control_id: &str,
    code: AckCode,
    error_text: Option<&str>,
) -> String {
    let delimiters = Delimiters::default();
    let msh = outbound_msh(settings, "ACK", &response_control_id(control_id, "ACK"));
    let mut msa = format!("MSA|{}|{}", code, escape_text(control_id, &delimiters));
    match error_text {
        Some(text) if code != AckCode::AA => {
            msa.push('|');
            msa.push_str(&escape_text(text, &delimiters));
        }
        _ => {}
    }
    info!(control_id, %code, "Created ACK message");
    frame_segments(&[msh, msa])
}

/// ORR^O02 rendering shared by the Genrui profiles
///
/// The analyzer expects fixed Blood Mode and Test Mode OBX segments ahead of
/// the patient age.
pub(crate) fn render_order_response(
    settings: &OutboundSettings,
    control_id: &str,
    patient: &PatientRecord,
) -> Result<String, HL7Error> {
    let delimiters = Delimiters::default();
    let text = |key: &str| -> Option<String> {
        patient
            .get(key)
            .filter(|value| !value.is_null())
            .map(|value| escape_text(&settings.translate(value), &delimiters))
    };

    let patient_id = text("PATIENT_ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HL7Error::MissingField("PATIENT_ID".to_string()))?;
    let name = match patient.get("NAME") {
        Some(FieldValue::Text(name)) => hl7_name(name, &delimiters),
        Some(other) if !other.is_null() => escape_text(&other.to_string(), &delimiters),
        _ => {
            warn!(%patient_id, "Patient record has no name");
            String::new()
        }
    };
    let sex = text("SEX").unwrap_or_else(|| "U".to_string());
    let age = text("AGE").unwrap_or_else(|| "0".to_string());
    let age_unit = text("AGE_UNIT").unwrap_or_default();

    let segments = vec![
        outbound_msh(settings, "ORR^O02", &response_control_id(control_id, "ORR")),
        format!("MSA|AA|{}", escape_text(control_id, &delimiters)),
        format!("PID|1||{patient_id}|{name}|{name}|||{sex}|||||||||||||||||||||||"),
        format!("ORC|AF|{patient_id}"),
        "OBR|1|||||||||||||||||||||||||||Genrui".to_string(),
        "OBX|2|IS|^Blood Mode^||WH||||||F|||||||".to_string(),
        "OBX|3|IS|^Test Mode^||CBC||||||F|||||||".to_string(),
        format!("OBX|5|IS|^Age^||{age}|{age_unit}|||||F|||||||"),
    ];
    info!(control_id, %patient_id, "Created ORR^O02 message");
    Ok(frame_segments(&segments))
}

/// `Last, First` becomes `Last^First`; other names are escaped as one component
fn hl7_name(name: &str, delimiters: &Delimiters) -> String {
    match name.split_once(',') {
        Some((last, first)) => format!(
            "{}{}{}",
            escape_text(last.trim(), delimiters),
            delimiters.component,
            escape_text(first.trim(), delimiters)
        ),
        None => escape_text(name.trim(), delimiters),
    }
}
