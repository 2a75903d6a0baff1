//! The on-disk record codec: one `(key, value)` pair per line, encoded as a
//! single-member JSON object `{"<key>": "<value>"}`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serializes this record as a JSON object line, without the trailing
    /// newline.
    pub fn encode(&self) -> String {
        let object = BTreeMap::from([(self.key.as_str(), self.value.as_str())]);
        serde_json::to_string(&object).expect("a single-member string map always serializes")
    }

    /// Parses one line (without its trailing newline) back into a record.
    ///
    /// Fails with [`Error::InvalidRecord`] if the line isn't valid JSON,
    /// doesn't decode to an object, has zero or more than one member, or the
    /// member's value isn't a JSON string.
    pub fn decode(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::InvalidRecord(format!("not valid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidRecord("record is not a JSON object".into()))?;
        if object.len() != 1 {
            return Err(Error::InvalidRecord(format!(
                "record must have exactly one member, found {}",
                object.len()
            )));
        }
        let (key, value) = object.iter().next().expect("checked len == 1 above");
        let value = value
            .as_str()
            .ok_or_else(|| Error::InvalidRecord(format!("value for key `{key}` is not a string")))?;
        Ok(Record::new(key.clone(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let record = Record::new("k1", "v1");
        let encoded = record.encode();
        assert_eq!(Record::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn rejects_multi_member_objects() {
        assert!(Record::decode(r#"{"k1":"v1","k2":"v2"}"#).is_err());
    }

    #[test]
    fn rejects_empty_objects() {
        assert!(Record::decode("{}").is_err());
    }

    #[test]
    fn rejects_non_string_values() {
        assert!(Record::decode(r#"{"k1":1}"#).is_err());
    }

    #[test]
    fn rejects_non_objects() {
        assert!(Record::decode(r#""just a string""#).is_err());
        assert!(Record::decode("not json at all").is_err());
    }
}
