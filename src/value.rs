//! Generic scalar values exchanged between the device side and storage.
//!
//! Business logic only ever sees [`GenericRecord`]s keyed by generic field
//! names such as `NAME`, `WBC` or `REQ_DATE`.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// Record keyed by generic field names
pub type GenericRecord = BTreeMap<String, FieldValue>;

/// Patient demographics keyed by generic names (`NAME`, `SEX`, `AGE`, ...)
pub type PatientRecord = GenericRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    /// Coerce analyzer text to a number when it reads as one.
    ///
    /// Values with a decimal point become `Real`, other numerics `Integer`,
    /// anything else stays text.
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.contains('.') {
            if let Ok(real) = trimmed.parse::<f64>() {
                if real.is_finite() {
                    return FieldValue::Real(real);
                }
            }
        } else if let Ok(integer) = trimmed.parse::<i64>() {
            return FieldValue::Integer(integer);
        }
        FieldValue::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Canonical text used to compare stored codes with configured ones
    pub fn as_code(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Real(r) if r.fract() == 0.0 && r.abs() < 1e15 => format!("{}", *r as i64),
            FieldValue::Real(r) => r.to_string(),
            FieldValue::Text(t) => match t.trim() {
                "true" | "True" | "TRUE" => "1".to_string(),
                "false" | "False" | "FALSE" => "0".to_string(),
                other => other.to_string(),
            },
        }
    }

    /// Whether this value denotes the given configured code
    pub fn matches_code(&self, code: &str) -> bool {
        !self.is_null() && self.as_code() == code.trim()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Real(r) => write!(f, "{r}"),
            FieldValue::Text(t) => f.write_str(t),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            FieldValue::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
        })
    }
}

impl FromSql for FieldValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(r) => FieldValue::Real(r),
            ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => FieldValue::Text(String::from_utf8_lossy(b).into_owned()),
        })
    }
}
