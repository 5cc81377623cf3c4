//! Record codec: overlays reserved metadata onto user payloads and parses it back.
//!
//! A block line is a single JSON object, newline-terminated. The reserved fields `id`, `_oid`,
//! `_rid`, `_seq` are merged into the same object as the caller's payload via
//! `#[serde(flatten)]`, rather than nested under a sub-key, so that `Envelope<T>` round-trips
//! through `T: Serialize + DeserializeOwned` with no hand-written object merging.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// A record identifier: the data model allows either a string or an integer `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    String(String),
    Int(i64),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::String(s) => write!(f, "{s}"),
            RecordId::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::String(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::String(s)
    }
}

impl From<i64> for RecordId {
    fn from(i: i64) -> Self {
        RecordId::Int(i)
    }
}

/// The operation tag carried by every line. `3`/`4` are reserved for future relationship
/// operations and must round-trip untouched if encountered; they carry no index semantics here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oid {
    Set,
    Delete,
    Reserved(i64),
}

impl Oid {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            Oid::Set => 1,
            Oid::Delete => 2,
            Oid::Reserved(n) => n,
        }
    }

    fn from_i64(n: i64) -> Self {
        match n {
            1 => Oid::Set,
            2 => Oid::Delete,
            other => Oid::Reserved(other),
        }
    }
}

/// Envelope written to / read from a single block line: reserved metadata plus a flattened
/// user payload `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: RecordId,
    #[serde(rename = "_oid")]
    oid_raw: i64,
    #[serde(rename = "_rid")]
    pub rid: u64,
    #[serde(rename = "_seq")]
    pub seq: u64,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(id: RecordId, oid: Oid, rid: u64, seq: u64, payload: T) -> Self {
        Self {
            id,
            oid_raw: oid.as_i64(),
            rid,
            seq,
            payload,
        }
    }

    pub fn oid(&self) -> Oid {
        Oid::from_i64(self.oid_raw)
    }
}

/// A tombstone line: no user fields beyond `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: RecordId,
    #[serde(rename = "_oid")]
    oid_raw: i64,
    #[serde(rename = "_rid")]
    pub rid: u64,
    #[serde(rename = "_seq")]
    pub seq: u64,
}

impl Tombstone {
    pub fn new(id: RecordId, rid: u64, seq: u64) -> Self {
        Self {
            id,
            oid_raw: Oid::Delete.as_i64(),
            rid,
            seq,
        }
    }
}

/// Metadata parsed out of a single line, regardless of payload type. Used during recovery and
/// compaction, where the payload type is not known statically.
#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub id: RecordId,
    pub oid: Oid,
    pub rid: u64,
    pub seq: u64,
    /// The raw line text, without the trailing newline, exactly as it should be re-appended.
    pub raw: String,
}

/// Serializes a `set` record: the caller's payload with reserved fields overlaid.
pub fn encode_set<T: Serialize>(
    id: &RecordId,
    seq: u64,
    rid: u64,
    payload: &T,
) -> Result<String, CodecError> {
    let envelope = Envelope::new(id.clone(), Oid::Set, rid, seq, payload);
    serde_json::to_string(&envelope).map_err(|e| CodecError::InvalidRecord {
        bid: String::new(),
        line_no: 0,
        cause: format!("failed to serialize: {e}"),
    })
}

/// Serializes a tombstone (`delete`) record.
pub fn encode_delete(id: &RecordId, seq: u64, rid: u64) -> Result<String, CodecError> {
    let tombstone = Tombstone::new(id.clone(), rid, seq);
    serde_json::to_string(&tombstone).map_err(|e| CodecError::InvalidRecord {
        bid: String::new(),
        line_no: 0,
        cause: format!("failed to serialize: {e}"),
    })
}

/// Parses and validates a single block line, without committing to a payload type.
///
/// Fails with [`CodecError::EmptyLine`] on an empty line, and [`CodecError::InvalidRecord`] if
/// JSON parsing fails or any reserved field is missing or has the wrong primitive type.
pub fn parse_line(bid: &str, line_no: u64, line: &str) -> Result<ParsedLine, CodecError> {
    if line.is_empty() {
        return Err(CodecError::EmptyLine {
            bid: bid.to_string(),
            line_no,
        });
    }

    let value: Value = serde_json::from_str(line).map_err(|e| CodecError::InvalidRecord {
        bid: bid.to_string(),
        line_no,
        cause: format!("malformed JSON: {e}"),
    })?;

    let object = value.as_object().ok_or_else(|| CodecError::InvalidRecord {
        bid: bid.to_string(),
        line_no,
        cause: "line is not a JSON object".to_string(),
    })?;

    let id = parse_id(object, bid, line_no)?;
    let oid_raw = parse_required_integer(object, "_oid", bid, line_no)?;
    let rid = parse_required_integer(object, "_rid", bid, line_no)? as u64;
    let seq = parse_required_integer(object, "_seq", bid, line_no)? as u64;

    Ok(ParsedLine {
        id,
        oid: Oid::from_i64(oid_raw),
        rid,
        seq,
        raw: line.to_string(),
    })
}

fn parse_id(object: &Map<String, Value>, bid: &str, line_no: u64) -> Result<RecordId, CodecError> {
    match object.get("id") {
        Some(Value::String(s)) => Ok(RecordId::String(s.clone())),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(RecordId::Int)
            .ok_or_else(|| CodecError::InvalidRecord {
                bid: bid.to_string(),
                line_no,
                cause: "'id' is not an integer-valued number".to_string(),
            }),
        Some(_) => Err(CodecError::InvalidRecord {
            bid: bid.to_string(),
            line_no,
            cause: "'id' must be a string or integer".to_string(),
        }),
        None => Err(CodecError::InvalidRecord {
            bid: bid.to_string(),
            line_no,
            cause: "missing 'id'".to_string(),
        }),
    }
}

fn parse_required_integer(
    object: &Map<String, Value>,
    field: &str,
    bid: &str,
    line_no: u64,
) -> Result<i64, CodecError> {
    match object.get(field) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| CodecError::InvalidRecord {
            bid: bid.to_string(),
            line_no,
            cause: format!("'{field}' is not an integer"),
        }),
        Some(_) => Err(CodecError::InvalidRecord {
            bid: bid.to_string(),
            line_no,
            cause: format!("'{field}' must be an integer"),
        }),
        None => Err(CodecError::InvalidRecord {
            bid: bid.to_string(),
            line_no,
            cause: format!("missing '{field}'"),
        }),
    }
}

/// Projects the configured `cached_fields` out of a raw, already-validated line.
///
/// Missing fields are silently omitted; returns `None` if no fields were configured.
pub fn project_cache(raw: &str, fields: &[String]) -> Option<Map<String, Value>> {
    if fields.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let mut projected = Map::new();
    for field in fields {
        if let Some(v) = object.get(field) {
            projected.insert(field.clone(), v.clone());
        }
    }
    Some(projected)
}

/// Byte length of a line plus its trailing newline, as it would occupy on disk. UTF-8 byte
/// length, not character count, since block `size` is a byte count.
pub fn line_disk_size(raw: &str) -> u64 {
    raw.len() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_line() {
        let err = parse_line("b1.block", 3, "").unwrap_err();
        assert!(matches!(err, CodecError::EmptyLine { line_no: 3, .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_line("b1.block", 1, "{not json").unwrap_err();
        assert!(matches!(err, CodecError::InvalidRecord { .. }));
    }

    #[test]
    fn rejects_missing_reserved_fields() {
        let err = parse_line("b1.block", 1, r#"{"id":"k"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidRecord { .. }));
    }

    #[test]
    fn rejects_non_integer_seq() {
        let line = r#"{"id":"k","_oid":1,"_rid":1,"_seq":"nope"}"#;
        let err = parse_line("b1.block", 1, line).unwrap_err();
        assert!(matches!(err, CodecError::InvalidRecord { .. }));
    }

    #[test]
    fn accepts_integer_id() {
        let line = r#"{"id":42,"_oid":1,"_rid":1,"_seq":1,"name":"lemon"}"#;
        let parsed = parse_line("b1.block", 1, line).unwrap();
        assert_eq!(parsed.id, RecordId::Int(42));
        assert_eq!(parsed.oid, Oid::Set);
    }

    #[test]
    fn round_trips_set_envelope() {
        let payload = json!({ "name": "lemon" });
        let line = encode_set(&RecordId::from("1"), 1, 1, &payload).unwrap();
        let parsed = parse_line("b1.block", 1, &line).unwrap();
        assert_eq!(parsed.id, RecordId::from("1"));
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.rid, 1);
        assert_eq!(parsed.oid, Oid::Set);

        let envelope: Envelope<serde_json::Value> = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.payload["name"], "lemon");
    }

    #[test]
    fn cache_projection_omits_missing_fields() {
        let line = r#"{"id":"1","_oid":1,"_rid":1,"_seq":1,"name":"lemon"}"#;
        let fields = vec!["name".to_string(), "missing".to_string()];
        let projected = project_cache(line, &fields).unwrap();
        assert_eq!(projected.get("name").unwrap(), "lemon");
        assert!(!projected.contains_key("missing"));
    }

    #[test]
    fn cache_projection_none_when_no_fields_configured() {
        let line = r#"{"id":"1","_oid":1,"_rid":1,"_seq":1}"#;
        assert!(project_cache(line, &[]).is_none());
    }

    #[test]
    fn unknown_oid_round_trips_untouched() {
        let line = r#"{"id":"1","_oid":3,"_rid":1,"_seq":1}"#;
        let parsed = parse_line("b1.block", 1, line).unwrap();
        assert_eq!(parsed.oid, Oid::Reserved(3));
        assert_eq!(parsed.raw, line);
    }
}
