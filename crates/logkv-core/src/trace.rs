//! Trace tags for correlated lookups
//!
//! A trace tag is a string, integer or float pulled out of a record's
//! payload and filed under a named secondary index. Each variant has a
//! stable byte tag used both for ordering across variants and for its
//! serialized form.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{LogKvError, LogKvResult};

/// Byte tag of `TraceValue::Str`
pub const TAG_STR: u8 = 1;
/// Byte tag of `TraceValue::Int`
pub const TAG_INT: u8 = 2;
/// Byte tag of `TraceValue::Float`
pub const TAG_FLOAT: u8 = 3;

/// A secondary-index value.
///
/// Serializes as the bytes of `to_bytes`, so encoded snapshots carry the
/// stable tag rather than a variant position.
#[derive(Debug, Clone)]
pub enum TraceValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl TraceValue {
    /// Stable byte tag of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            TraceValue::Str(_) => TAG_STR,
            TraceValue::Int(_) => TAG_INT,
            TraceValue::Float(_) => TAG_FLOAT,
        }
    }

    /// `[tag][value]`; integers and floats are 8 bytes big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            TraceValue::Str(s) => out.extend_from_slice(s.as_bytes()),
            TraceValue::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            TraceValue::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        }
        out
    }

    /// Inverse of `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> LogKvResult<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| LogKvError::SnapshotCorrupted("empty trace value".into()))?;
        match tag {
            TAG_STR => String::from_utf8(body.to_vec())
                .map(TraceValue::Str)
                .map_err(|e| LogKvError::SnapshotCorrupted(format!("trace string: {}", e))),
            TAG_INT => Ok(TraceValue::Int(i64::from_be_bytes(fixed8(body)?))),
            TAG_FLOAT => Ok(TraceValue::Float(f64::from_bits(u64::from_be_bytes(fixed8(body)?)))),
            other => Err(LogKvError::SnapshotCorrupted(format!("unknown trace tag {}", other))),
        }
    }
}

fn fixed8(body: &[u8]) -> LogKvResult<[u8; 8]> {
    body.try_into()
        .map_err(|_| LogKvError::SnapshotCorrupted(format!("expected 8 value bytes, got {}", body.len())))
}

impl Serialize for TraceValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for TraceValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(TraceValueVisitor)
    }
}

struct TraceValueVisitor;

impl<'de> Visitor<'de> for TraceValueVisitor {
    type Value = TraceValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tagged trace value bytes")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<TraceValue, E> {
        TraceValue::from_bytes(bytes).map_err(E::custom)
    }

    // Self-describing formats (e.g. JSON) hand bytes over as a sequence
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<TraceValue, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(9).min(64));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        self.visit_bytes(&bytes)
    }
}

impl PartialEq for TraceValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TraceValue {}

impl PartialOrd for TraceValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TraceValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TraceValue::Str(a), TraceValue::Str(b)) => a.cmp(b),
            (TraceValue::Int(a), TraceValue::Int(b)) => a.cmp(b),
            (TraceValue::Float(a), TraceValue::Float(b)) => a.total_cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl Hash for TraceValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            TraceValue::Str(s) => s.hash(state),
            TraceValue::Int(i) => i.hash(state),
            TraceValue::Float(f) => f.to_bits().hash(state),
        }
    }
}

impl fmt::Display for TraceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceValue::Str(s) => f.write_str(s),
            TraceValue::Int(i) => write!(f, "{}", i),
            TraceValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for TraceValue {
    fn from(s: &str) -> Self {
        TraceValue::Str(s.to_string())
    }
}

impl From<String> for TraceValue {
    fn from(s: String) -> Self {
        TraceValue::Str(s)
    }
}

impl From<i64> for TraceValue {
    fn from(i: i64) -> Self {
        TraceValue::Int(i)
    }
}

impl From<f64> for TraceValue {
    fn from(f: f64) -> Self {
        TraceValue::Float(f)
    }
}

/// Pulls secondary-index entries out of a payload.
pub trait TraceExtractor: Send + Sync {
    /// `(index name, value)` for every index the payload belongs to.
    fn extract(&self, payload: &[u8]) -> Vec<(String, TraceValue)>;
}

/// Never tags anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrace;

impl TraceExtractor for NoTrace {
    fn extract(&self, _payload: &[u8]) -> Vec<(String, TraceValue)> {
        Vec::new()
    }
}

/// Reads top-level fields of a JSON object payload. Each field is its own
/// index, named after the field.
#[derive(Debug, Clone)]
pub struct JsonFieldExtractor {
    fields: Vec<String>,
}

impl JsonFieldExtractor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { fields: fields.into_iter().map(Into::into).collect() }
    }
}

impl TraceExtractor for JsonFieldExtractor {
    fn extract(&self, payload: &[u8]) -> Vec<(String, TraceValue)> {
        let Ok(doc) = serde_json::from_slice::<serde_json::Value>(payload) else {
            return Vec::new();
        };
        let mut tags = Vec::new();
        for field in &self.fields {
            let value = match doc.get(field) {
                Some(serde_json::Value::String(s)) => TraceValue::Str(s.clone()),
                Some(serde_json::Value::Number(n)) => match n.as_i64() {
                    Some(i) => TraceValue::Int(i),
                    None => match n.as_f64() {
                        Some(f) => TraceValue::Float(f),
                        None => continue,
                    },
                },
                _ => continue,
            };
            tags.push((field.clone(), value));
        }
        tags
    }
}
