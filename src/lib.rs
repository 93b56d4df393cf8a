use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;


pub mod audit;
pub mod config;
pub mod database;
pub mod device;
pub mod dispatch;
pub mod mapping;
pub mod mllp;
pub mod responder;
pub mod validation;
pub mod value;

#[derive(Debug, Error)]
pub enum HL7Error {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message structure: {0}")]
    InvalidStructure(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// HL7 segment separator
pub const SEGMENT_SEPARATOR: char = '\r';

/// Constants for HL7 message delimiters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub subcomponent: char,
    pub repetition: char,
    pub escape: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            subcomponent: '&',
            repetition: '~',
            escape: '\\',
        }
    }
}

impl Delimiters {
    /// Read the separators declared by an MSH segment (MSH-1 and MSH-2).
    ///
    /// Encoding characters that are not declared fall back to the HL7 defaults.
    pub fn from_msh(line: &str) -> Result<Self, HL7Error> {
        let mut chars = line.chars().skip(3);
        let field = chars.next().ok_or_else(|| {
            HL7Error::InvalidStructure("MSH segment has no field separator".to_string())
        })?;
        let encoding: Vec<char> = chars.take_while(|&c| c != field).collect();

        let defaults = Self::default();
        Ok(Self {
            field,
            component: encoding.first().copied().unwrap_or(defaults.component),
            repetition: encoding.get(1).copied().unwrap_or(defaults.repetition),
            escape: encoding.get(2).copied().unwrap_or(defaults.escape),
            subcomponent: encoding.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }

    /// The MSH-2 encoding characters in their canonical order
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }
}

/// Represents a complete HL7 message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub segments: Vec<Segment>,
    pub delimiters: Delimiters,
    /// MSH-9 as `TYPE^TRIGGER` (or just `TYPE` when no trigger is sent)
    pub message_type: String,
    /// MSH-10
    pub control_id: String,
    /// MSH-12
    pub version: Option<String>,
}

/// Represents a segment in an HL7 message
///
/// Fields are stored so that `field(n)` follows HL7 numbering. For MSH the
/// field separator itself is MSH-1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub fields: Vec<Field>,
}

/// Represents a field in an HL7 segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub value: String,
    pub repetitions: Vec<Repetition>,
}

/// One occurrence of a repeating field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repetition {
    pub components: Vec<Component>,
}

/// Represents a component in an HL7 field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub value: String,
    pub subcomponents: Vec<String>,
}

/// Routing metadata taken from the MSH segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_type: String,
    pub control_id: String,
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
}

impl MessageEnvelope {
    /// `application^facility`, or whichever of the two is present
    pub fn sender_identity(&self) -> Option<String> {
        match (&self.sending_application, &self.sending_facility) {
            (Some(app), Some(facility)) => Some(format!("{app}^{facility}")),
            (Some(app), None) => Some(app.clone()),
            (None, Some(facility)) => Some(facility.clone()),
            (None, None) => None,
        }
    }
}

/// An OBX segment viewed as an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub set_id: Option<String>,
    pub value_type: Option<String>,
    pub identifier: String,
    pub text: Option<String>,
    pub value: Option<String>,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub abnormal_flags: Option<String>,
}

impl Observation {
    /// Build from an OBX segment. Returns `None` when OBX-3.1 is empty.
    pub fn from_segment(obx: &Segment) -> Option<Self> {
        let identifier = obx.component(3, 1)?.to_string();
        let owned = |value: Option<&str>| value.map(str::to_string);

        Some(Observation {
            set_id: owned(obx.value(1)),
            value_type: owned(obx.value(2)),
            identifier,
            text: owned(obx.component(3, 2)),
            value: owned(obx.value(5)),
            units: owned(obx.component(6, 1)),
            reference_range: owned(obx.value(7)),
            abnormal_flags: owned(obx.value(8)),
        })
    }
}

impl Message {
    /// Parse an HL7 message from a string
    ///
    /// MLLP framing bytes around the message are ignored, and segments may be
    /// separated by `\r`, `\n` or `\r\n`.
    pub fn parse(input: &str) -> Result<Self, HL7Error> {
        let body = strip_framing(input);
        let lines: Vec<&str> = body
            .split(['\r', '\n'])
            .filter(|line| !line.trim().is_empty())
            .collect();

        let msh = lines
            .first()
            .ok_or_else(|| HL7Error::InvalidStructure("Empty message".to_string()))?;

        if !msh.starts_with("MSH") {
            return Err(HL7Error::InvalidStructure(
                "Missing MSH segment".to_string(),
            ));
        }

        let delimiters = Delimiters::from_msh(msh)?;
        let mut segments = Vec::with_capacity(lines.len());
        for line in &lines {
            match parse_segment(line, &delimiters) {
                Ok(segment) => segments.push(segment),
                Err(e) => warn!("Skipping unreadable segment: {}", e),
            }
        }

        let msh_segment = segments
            .first()
            .filter(|s| s.name == "MSH")
            .ok_or_else(|| HL7Error::InvalidStructure("Missing MSH segment".to_string()))?;

        let message_type = extract_message_type(msh_segment)
            .ok_or_else(|| HL7Error::MissingField("Message type (MSH.9)".to_string()))?;
        let control_id = msh_segment.value(10).unwrap_or_default().to_string();
        let version = msh_segment.component(12, 1).map(str::to_string);

        Ok(Message {
            segments,
            delimiters,
            message_type,
            control_id,
            version,
        })
    }

    /// Parse raw bytes, replacing invalid UTF-8 instead of rejecting the message
    pub fn from_bytes(raw: &[u8]) -> Result<Self, HL7Error> {
        Self::parse(&String::from_utf8_lossy(raw))
    }

    /// Get a specific segment by name
    pub fn get_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Get all segments with a specific name
    pub fn get_segments(&self, name: &str) -> Vec<&Segment> {
        self.segments.iter().filter(|s| s.name == name).collect()
    }

    /// Check whether a segment type occurs at least once
    pub fn has_segment(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name == name)
    }

    pub fn envelope(&self) -> MessageEnvelope {
        let msh = self.get_segment("MSH");
        let owned = |index: usize| msh.and_then(|s| s.value(index)).map(str::to_string);

        MessageEnvelope {
            message_type: self.message_type.clone(),
            control_id: self.control_id.clone(),
            sending_application: owned(3),
            sending_facility: owned(4),
        }
    }

    /// All OBX segments that carry an observation identifier, in message order
    pub fn observations(&self) -> Vec<Observation> {
        self.get_segments("OBX")
            .into_iter()
            .filter_map(Observation::from_segment)
            .collect()
    }

    /// Check if this is an ORU message
    pub fn is_oru(&self) -> bool {
        self.message_type.starts_with("ORU")
    }

    /// Check if this is an ORM message
    pub fn is_orm(&self) -> bool {
        self.message_type.starts_with("ORM")
    }

    /// Check if this is an acknowledgement
    pub fn is_ack(&self) -> bool {
        self.message_type.starts_with("ACK")
    }
}

impl Segment {
    /// Field by HL7 position (1-based)
    pub fn field(&self, index: usize) -> Option<&Field> {
        index.checked_sub(1).and_then(|i| self.fields.get(i))
    }

    /// Raw text of a field, `None` when absent or empty
    pub fn value(&self, index: usize) -> Option<&str> {
        self.field(index)
            .map(|f| f.value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Component of the first repetition of a field (both 1-based)
    pub fn component(&self, field: usize, component: usize) -> Option<&str> {
        self.field(field).and_then(|f| f.component(component))
    }
}

impl Field {
    fn literal(value: &str) -> Self {
        Field {
            value: value.to_string(),
            repetitions: vec![Repetition {
                components: vec![Component {
                    value: value.to_string(),
                    subcomponents: vec![],
                }],
            }],
        }
    }

    /// Component of the first repetition (1-based), `None` when empty
    pub fn component(&self, index: usize) -> Option<&str> {
        let index = index.checked_sub(1)?;
        self.repetitions
            .first()
            .and_then(|r| r.components.get(index))
            .map(|c| c.value.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Parse a segment from a string
fn parse_segment(input: &str, delimiters: &Delimiters) -> Result<Segment, HL7Error> {
    let mut parts = input.split(delimiters.field);

    let name = parts
        .next()
        .map(str::trim)
        .filter(|n| n.len() == 3 && n.chars().all(|c| c.is_ascii_alphanumeric()))
        .ok_or_else(|| HL7Error::ParseError(format!("Invalid segment name in '{input}'")))?
        .to_string();

    let mut fields = Vec::new();
    if name == "MSH" {
        // MSH-1 is the separator itself and MSH-2 must not be split
        fields.push(Field::literal(&delimiters.field.to_string()));
        if let Some(encoding) = parts.next() {
            fields.push(Field::literal(encoding));
        }
    }
    fields.extend(parts.map(|f| parse_field(f, delimiters)));

    Ok(Segment { name, fields })
}

/// Parse a field from a string
fn parse_field(input: &str, delimiters: &Delimiters) -> Field {
    let repetitions = input
        .split(delimiters.repetition)
        .map(|r| Repetition {
            components: r
                .split(delimiters.component)
                .map(|c| parse_component(c, delimiters))
                .collect(),
        })
        .collect();

    Field {
        value: input.to_string(),
        repetitions,
    }
}

/// Parse a component from a string
fn parse_component(input: &str, delimiters: &Delimiters) -> Component {
    let subcomponents = if input.contains(delimiters.subcomponent) {
        input
            .split(delimiters.subcomponent)
            .map(|s| s.to_string())
            .collect()
    } else {
        vec![]
    };

    Component {
        value: input.to_string(),
        subcomponents,
    }
}

/// Extract the message type from the MSH segment
fn extract_message_type(msh: &Segment) -> Option<String> {
    let code = msh.component(9, 1)?;
    Some(match msh.component(9, 2) {
        Some(trigger) => format!("{code}^{trigger}"),
        None => code.to_string(),
    })
}

/// Remove MLLP framing bytes and surrounding whitespace
pub fn strip_framing(input: &str) -> &str {
    input.trim_matches(|c: char| {
        c == mllp::MLLP_START_BLOCK as char || c == mllp::MLLP_END_BLOCK as char || c.is_whitespace()
    })
}

/// Escape free text so it can sit inside a single HL7 field
pub fn escape_text(text: &str, delimiters: &Delimiters) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        let code = match c {
            c if c == delimiters.escape => Some('E'),
            c if c == delimiters.field => Some('F'),
            c if c == delimiters.component => Some('S'),
            c if c == delimiters.subcomponent => Some('T'),
            c if c == delimiters.repetition => Some('R'),
            _ => None,
        };
        match code {
            Some(code) => {
                escaped.push(delimiters.escape);
                escaped.push(code);
                escaped.push(delimiters.escape);
            }
            None if c == '\r' || c == '\n' => escaped.push(' '),
            None => escaped.push(c),
        }
    }
    escaped
}

/// Current local time in HL7 TS format
pub fn hl7_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}
