//! Oplog entry types
//!
//! An entry is immutable once fetched. Its position in the log is its `OpTime`;
//! entries from one sync source arrive in non-decreasing `OpTime` order.

use super::codec::{self, CodecError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::io::Read;

/// Logical clock component of an `OpTime`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

/// Position of an entry in the replicated log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub timestamp: Timestamp,
    pub term: i64,
}

impl OpTime {
    pub fn new(secs: u32, inc: u32, term: i64) -> Self {
        OpTime {
            timestamp: Timestamp { secs, inc },
            term,
        }
    }

    /// The position before any entry
    pub fn null() -> Self {
        OpTime {
            timestamp: Timestamp::default(),
            term: -1,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::null()
    }
}

// Term first: a new term always sorts after every entry of an older one.
impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.term
            .cmp(&other.term)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ts: {}|{}, t: {})",
            self.timestamp.secs, self.timestamp.inc, self.term
        )
    }
}

/// What an entry does to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
    Command = 4,
    Noop = 5,
}

impl OperationKind {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OperationKind::Insert),
            2 => Some(OperationKind::Update),
            3 => Some(OperationKind::Delete),
            4 => Some(OperationKind::Command),
            5 => Some(OperationKind::Noop),
            _ => None,
        }
    }

    /// Whether entries of this kind target a single document
    pub fn is_crud(&self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::Update | OperationKind::Delete
        )
    }
}

/// Grouping key for parallel apply: entries sharing a key apply serially
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictKey {
    pub namespace: String,
    /// Canonical JSON encoding of the document `_id`
    pub id: String,
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// One replicated change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_time: OpTime,
    /// `db.collection`, or `db.$cmd` for commands
    pub namespace: String,
    pub kind: OperationKind,
    pub payload: Value,
}

impl OplogEntry {
    pub fn new(op_time: OpTime, namespace: impl Into<String>, kind: OperationKind, payload: Value) -> Self {
        OplogEntry {
            op_time,
            namespace: namespace.into(),
            kind,
            payload,
        }
    }

    /// Insert of a full document (must carry `_id`)
    pub fn insert(op_time: OpTime, namespace: impl Into<String>, document: Value) -> Self {
        Self::new(op_time, namespace, OperationKind::Insert, document)
    }

    /// `$set` update of the document with the given `_id`
    pub fn update(op_time: OpTime, namespace: impl Into<String>, id: Value, set: Value) -> Self {
        Self::new(
            op_time,
            namespace,
            OperationKind::Update,
            serde_json::json!({ "_id": id, "$set": set }),
        )
    }

    pub fn delete(op_time: OpTime, namespace: impl Into<String>, id: Value) -> Self {
        Self::new(
            op_time,
            namespace,
            OperationKind::Delete,
            serde_json::json!({ "_id": id }),
        )
    }

    /// Database command, e.g. `{"create": "users"}` against `db`
    pub fn command(op_time: OpTime, db: &str, command: Value) -> Self {
        Self::new(op_time, format!("{}.$cmd", db), OperationKind::Command, command)
    }

    pub fn noop(op_time: OpTime) -> Self {
        Self::new(op_time, "", OperationKind::Noop, Value::Null)
    }

    /// `_id` of the targeted document, for CRUD entries
    pub fn document_id(&self) -> Option<&Value> {
        if self.kind.is_crud() {
            self.payload.get("_id")
        } else {
            None
        }
    }

    /// Conflict key (namespace + document identity); `None` for commands and noops
    pub fn conflict_key(&self) -> Option<ConflictKey> {
        self.document_id().map(|id| ConflictKey {
            namespace: self.namespace.clone(),
            id: canonical_id(id),
        })
    }

    /// Database part of the namespace
    pub fn database(&self) -> &str {
        self.namespace
            .split_once('.')
            .map(|(db, _)| db)
            .unwrap_or(&self.namespace)
    }

    /// Approximate in-memory size, used for buffer and batch accounting
    pub fn size_bytes(&self) -> usize {
        // op_time + kind
        17 + self.namespace.len() + value_size(&self.payload)
    }

    /// Serialize into a checksummed record
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut body = BytesMut::with_capacity(29 + self.namespace.len() + payload.len());

        body.put_u32_le(self.op_time.timestamp.secs);
        body.put_u32_le(self.op_time.timestamp.inc);
        body.put_i64_le(self.op_time.term);
        body.put_u8(self.kind as u8);
        body.put_u32_le(self.namespace.len() as u32);
        body.put_slice(self.namespace.as_bytes());
        body.put_u32_le(payload.len() as u32);
        body.put_slice(&payload);

        codec::encode_frame(&body)
    }

    /// Deserialize from a checksummed record, returning the bytes consumed
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), CodecError> {
        let (body, consumed) = codec::decode_frame(data)?;
        Ok((Self::decode_body(body)?, consumed))
    }

    /// Read the next record from a stream; `Ok(None)` on clean end of stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>, CodecError> {
        match codec::read_frame(reader)? {
            Some(body) => Ok(Some(Self::decode_body(&body)?)),
            None => Ok(None),
        }
    }

    fn decode_body(mut body: &[u8]) -> Result<Self, CodecError> {
        if body.remaining() < 21 {
            return Err(CodecError::Truncated);
        }
        let secs = body.get_u32_le();
        let inc = body.get_u32_le();
        let term = body.get_i64_le();
        let kind_byte = body.get_u8();
        let kind = OperationKind::from_u8(kind_byte).ok_or(CodecError::InvalidKind(kind_byte))?;

        let ns_len = body.get_u32_le() as usize;
        if body.remaining() < ns_len + 4 {
            return Err(CodecError::Truncated);
        }
        let namespace = std::str::from_utf8(&body[..ns_len])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        body.advance(ns_len);

        let payload_len = body.get_u32_le() as usize;
        if body.remaining() < payload_len {
            return Err(CodecError::Truncated);
        }
        let payload = serde_json::from_slice(&body[..payload_len])?;

        Ok(OplogEntry {
            op_time: OpTime::new(secs, inc, term),
            namespace,
            kind,
            payload,
        })
    }
}

/// Canonical text form of a document id: its JSON encoding, so `1` and
/// `"1"` stay distinct
pub fn canonical_id(id: &Value) -> String {
    id.to_string()
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum::<usize>() + 4,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>() + 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_optime_orders_by_term_then_timestamp() {
        let a = OpTime::new(100, 1, 1);
        let b = OpTime::new(5, 1, 2);
        let c = OpTime::new(100, 2, 1);
        assert!(a < b);
        assert!(a < c);
        assert!(OpTime::null() < a);
    }

    #[test]
    fn test_conflict_key_uses_namespace_and_id() {
        let insert = OplogEntry::insert(OpTime::new(1, 1, 1), "app.users", json!({"_id": "d", "v": 1}));
        let update = OplogEntry::update(OpTime::new(1, 2, 1), "app.users", json!("d"), json!({"v": 2}));
        let other_ns = OplogEntry::insert(OpTime::new(1, 3, 1), "app.orders", json!({"_id": "d"}));

        assert_eq!(insert.conflict_key(), update.conflict_key());
        assert_ne!(insert.conflict_key(), other_ns.conflict_key());
    }

    #[test]
    fn test_commands_have_no_conflict_key() {
        let cmd = OplogEntry::command(OpTime::new(1, 1, 1), "app", json!({"create": "users"}));
        assert_eq!(cmd.namespace, "app.$cmd");
        assert_eq!(cmd.database(), "app");
        assert!(cmd.conflict_key().is_none());
        assert!(OplogEntry::noop(OpTime::new(1, 2, 1)).conflict_key().is_none());
    }

    #[test]
    fn test_numeric_and_string_ids_differ() {
        let a = OplogEntry::insert(OpTime::new(1, 1, 1), "app.c", json!({"_id": 1}));
        let b = OplogEntry::insert(OpTime::new(1, 2, 1), "app.c", json!({"_id": "1"}));
        assert_ne!(a.conflict_key(), b.conflict_key());
        assert_eq!(canonical_id(&json!(1)), "1");
        assert_eq!(canonical_id(&json!("1")), "\"1\"");
    }

    #[test]
    fn test_record_roundtrip() {
        let entry = OplogEntry::update(OpTime::new(7, 3, 2), "app.users", json!({"k": 1}), json!({"name": "x"}));
        let bytes = entry.to_bytes();
        let (decoded, consumed) = OplogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_checksum_validation() {
        let entry = OplogEntry::insert(OpTime::new(1, 1, 1), "app.users", json!({"_id": 1}));
        let mut bytes = entry.to_bytes();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        assert!(matches!(
            OplogEntry::from_bytes(&bytes),
            Err(CodecError::Checksum { .. })
        ));
    }
}
