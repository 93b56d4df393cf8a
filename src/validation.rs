//! Required-segment checks per message type.
//!
//! This is a presence check only, not field-level conformance. A failed check
//! is logged and left to the caller to act on.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Segments that must be present for a message type, `None` for unknown types
pub fn required_segments(message_type: &str) -> Option<&'static [&'static str]> {
    if message_type.starts_with("ORM") {
        Some(&["ORC", "OBX"])
    } else if message_type.starts_with("ORU^R01") {
        Some(&["PID", "OBR", "OBX"])
    } else if message_type.starts_with("ACK") {
        Some(&["MSA"])
    } else if message_type.starts_with("ORR^O02") {
        Some(&["MSA", "PID", "ORC", "OBR", "OBX"])
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub message_type: String,
    pub direction: Direction,
    /// `false` when no rules exist for the message type
    pub known_type: bool,
    pub missing: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.known_type && self.missing.is_empty()
    }
}

/// Check a message against the required-segment table without logging
pub fn check(message: &Message, direction: Direction) -> ValidationReport {
    let required = required_segments(&message.message_type);
    let missing = required
        .unwrap_or_default()
        .iter()
        .filter(|name| !message.has_segment(name))
        .map(|name| name.to_string())
        .collect();

    ValidationReport {
        message_type: message.message_type.clone(),
        direction,
        known_type: required.is_some(),
        missing,
    }
}

/// Validate a message and log the outcome
pub fn validate(message: &Message, direction: Direction) -> bool {
    let report = check(message, direction);
    if !report.known_type {
        warn!(
            message_type = %report.message_type,
            %direction,
            "No validation rules for message type"
        );
    } else if !report.missing.is_empty() {
        warn!(
            message_type = %report.message_type,
            %direction,
            control_id = %message.control_id,
            "Missing required segments: {}",
            report.missing.join(", ")
        );
    } else {
        debug!(message_type = %report.message_type, %direction, "Message is structurally valid");
    }
    report.is_valid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oru_requires_pid_obr_obx() {
        let message =
            Message::parse("MSH|^~\\&|A|B|||20230101||ORU^R01|1|P|2.3.1\rPID|1||X\rOBX|1|NM|WBC||5").unwrap();
        let report = check(&message, Direction::Inbound);
        assert!(!report.is_valid());
        assert_eq!(report.missing, vec!["OBR".to_string()]);
    }

    #[test]
    fn orm_prefix_matches_any_trigger() {
        assert_eq!(required_segments("ORM^O01"), Some(&["ORC", "OBX"][..]));
        assert_eq!(required_segments("ORM"), Some(&["ORC", "OBX"][..]));
        assert_eq!(required_segments("ADT^A01"), None);
    }

    #[test]
    fn ack_is_valid_with_msa() {
        let message = Message::parse("MSH|^~\\&|A|B|||20230101||ACK|1|P|2.3.1\rMSA|AA|1").unwrap();
        assert!(validate(&message, Direction::Inbound));
    }

    #[test]
    fn unknown_type_is_not_valid() {
        let message = Message::parse("MSH|^~\\&|A|B|||20230101||ADT^A01|1|P|2.3.1").unwrap();
        let report = check(&message, Direction::Inbound);
        assert!(!report.known_type);
        assert!(!report.is_valid());
    }
}
