use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::position::Offset;
use crate::timestamp::parse_modification_time;

/// Enumeration of reasons a stream payload cannot become a `ChangeEvent`.
/// None of these can succeed on replay, so the record is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload is not a JSON object: {0}")]
    InvalidPayload(String),
    #[error("payload is missing the primary key field {0}")]
    MissingPrimaryKey(String),
    #[error("primary key field {0} must be an integer or a string")]
    InvalidPrimaryKey(String),
    #[error("payload is missing the modification time field {0}")]
    MissingModificationTime(String),
    #[error("could not parse modification time field {field}: {value}")]
    InvalidModificationTime { field: String, value: String },
}

/// Identity of a logical row in the target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl PrimaryKey {
    /// A string holding an integer in canonical form is the same key as that
    /// integer, so `"1"` and `1` collapse to one row whatever the column type.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(PrimaryKey::Int),
            Value::String(s) => Some(
                s.parse::<i64>()
                    .ok()
                    .filter(|i| i.to_string() == *s)
                    .map_or_else(|| PrimaryKey::Text(s.clone()), PrimaryKey::Int),
            ),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PrimaryKey::Int(i) => Value::from(*i),
            PrimaryKey::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Int(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::Text(value.to_owned())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{i}"),
            PrimaryKey::Text(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Upsert,
    /// The table store decides what a delete means for the target table.
    Delete,
}

/// A single change to one logical row, as read from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub primary_key: PrimaryKey,
    pub modification_time: DateTime<Utc>,
    pub kind: ChangeKind,
    /// The full payload, including the key and modification time fields.
    pub fields: Map<String, Value>,
    pub offset: Offset,
}

impl ChangeEvent {
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// Describes which payload fields carry the key, time and delete marker.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    primary_key_field: String,
    modification_time_field: String,
    delete_marker: Option<(String, Value)>,
}

impl EventDecoder {
    pub fn new(primary_key_field: &str, modification_time_field: &str) -> Self {
        Self {
            primary_key_field: primary_key_field.to_owned(),
            modification_time_field: modification_time_field.to_owned(),
            delete_marker: None,
        }
    }

    /// Treat payloads where `field == value` as delete markers.
    pub fn with_delete_marker(mut self, field: &str, value: Value) -> Self {
        self.delete_marker = Some((field.to_owned(), value));
        self
    }

    pub fn decode(&self, payload: &[u8], offset: Offset) -> Result<ChangeEvent, ParseError> {
        let fields = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => return Err(ParseError::InvalidPayload(format!("found {other}"))),
            Err(e) => return Err(ParseError::InvalidPayload(e.to_string())),
        };
        self.decode_fields(fields, offset)
    }

    pub fn decode_fields(
        &self,
        fields: Map<String, Value>,
        offset: Offset,
    ) -> Result<ChangeEvent, ParseError> {
        let primary_key = match fields.get(&self.primary_key_field) {
            None | Some(Value::Null) => {
                return Err(ParseError::MissingPrimaryKey(
                    self.primary_key_field.clone(),
                ))
            }
            Some(value) => PrimaryKey::from_value(value)
                .ok_or_else(|| ParseError::InvalidPrimaryKey(self.primary_key_field.clone()))?,
        };

        let modification_time = match fields.get(&self.modification_time_field) {
            None | Some(Value::Null) => {
                return Err(ParseError::MissingModificationTime(
                    self.modification_time_field.clone(),
                ))
            }
            Some(value) => parse_modification_time(value).ok_or_else(|| {
                ParseError::InvalidModificationTime {
                    field: self.modification_time_field.clone(),
                    value: value.to_string(),
                }
            })?,
        };

        let kind = match &self.delete_marker {
            Some((field, marker)) if fields.get(field) == Some(marker) => ChangeKind::Delete,
            _ => ChangeKind::Upsert,
        };

        Ok(ChangeEvent {
            primary_key,
            modification_time,
            kind,
            fields,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> EventDecoder {
        EventDecoder::new("id", "m_time").with_delete_marker("op", json!("D"))
    }

    #[test]
    fn test_decode_upsert() {
        let payload = br#"{"id": 7, "m_time": "2024-01-01 00:00:05", "name": "a"}"#;
        let event = decoder().decode(payload, Offset::new(0, 12)).unwrap();

        assert_eq!(event.primary_key, PrimaryKey::Int(7));
        assert_eq!(event.kind, ChangeKind::Upsert);
        assert_eq!(event.fields.get("name"), Some(&json!("a")));
        assert_eq!(event.offset, Offset::new(0, 12));
    }

    #[test]
    fn test_decode_delete_marker() {
        let payload = br#"{"id": "k-1", "m_time": 1700000000, "op": "D"}"#;
        let event = decoder().decode(payload, Offset::new(1, 0)).unwrap();

        assert_eq!(event.primary_key, PrimaryKey::Text("k-1".to_string()));
        assert!(event.is_delete());
    }

    #[test]
    fn test_integer_strings_share_the_integer_key() {
        let d = decoder();
        let quoted = d
            .decode(br#"{"id": "1", "m_time": 1}"#, Offset::new(0, 0))
            .unwrap();
        let bare = d
            .decode(br#"{"id": 1, "m_time": 2}"#, Offset::new(0, 1))
            .unwrap();

        assert_eq!(quoted.primary_key, bare.primary_key);
        assert_eq!(
            PrimaryKey::from_value(&json!("007")),
            Some(PrimaryKey::Text("007".to_string()))
        );
        assert_eq!(
            PrimaryKey::from_value(&json!("-12")),
            Some(PrimaryKey::Int(-12))
        );
    }

    #[test]
    fn test_decode_errors() {
        let d = decoder();
        let at = Offset::new(0, 0);

        assert!(matches!(
            d.decode(b"[1, 2]", at),
            Err(ParseError::InvalidPayload(_))
        ));
        assert_eq!(
            d.decode(br#"{"m_time": 1}"#, at),
            Err(ParseError::MissingPrimaryKey("id".to_string()))
        );
        assert_eq!(
            d.decode(br#"{"id": 1.5, "m_time": 1}"#, at),
            Err(ParseError::InvalidPrimaryKey("id".to_string()))
        );
        assert_eq!(
            d.decode(br#"{"id": 1}"#, at),
            Err(ParseError::MissingModificationTime("m_time".to_string()))
        );
        assert!(matches!(
            d.decode(br#"{"id": 1, "m_time": "yesterday"}"#, at),
            Err(ParseError::InvalidModificationTime { .. })
        ));
    }

    #[test]
    fn test_primary_key_ordering_is_total() {
        let mut keys = vec![
            PrimaryKey::from("b"),
            PrimaryKey::from(2),
            PrimaryKey::from("a"),
            PrimaryKey::from(1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PrimaryKey::Int(1),
                PrimaryKey::Int(2),
                PrimaryKey::Text("a".to_string()),
                PrimaryKey::Text("b".to_string()),
            ]
        );
    }
}
