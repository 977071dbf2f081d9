use crate::catalog::types::Value;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Byte string whose lexicographic order matches `Value` order segment by
/// segment. Every segment encoding is prefix-free, which keeps composite
/// keys ordered even when a segment is bit-inverted for descending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_values(values: &[Value]) -> Self {
        let mut key = Self::new();
        for value in values {
            key.append(value, SortDirection::Ascending);
        }
        key
    }

    pub fn append(&mut self, value: &Value, direction: SortDirection) {
        let start = self.bytes.len();
        encode_value(value, &mut self.bytes);
        if direction == SortDirection::Descending {
            invert(&mut self.bytes[start..]);
        }
    }

    /// Fixed-width unsigned segment, used for tie-breaking counters.
    pub fn append_counter(&mut self, counter: u64, direction: SortDirection) {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(&counter.to_be_bytes());
        if direction == SortDirection::Descending {
            invert(&mut self.bytes[start..]);
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn invert(bytes: &mut [u8]) {
    for b in bytes {
        *b = !*b;
    }
}

fn encode_value(v: &Value, out: &mut SmallVec<[u8; 64]>) {
    match v {
        Value::Null => out.push(0x05),
        Value::Boolean(b) => {
            out.push(0x10);
            out.push(u8::from(*b));
        }
        Value::Integer(i) => {
            out.push(0x11);
            let shifted = (*i as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Timestamp(ts) => {
            out.push(0x12);
            let shifted = (*ts as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Float(f) => {
            out.push(0x13);
            // Same total order as f64::total_cmp.
            let bits = f.to_bits();
            let mapped = if (bits >> 63) == 1 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&mapped.to_be_bytes());
        }
        Value::Text(s) => {
            out.push(0x14);
            append_escaped(s.as_bytes(), out);
        }
        Value::Json(s) => {
            out.push(0x15);
            append_escaped(s.as_bytes(), out);
        }
        Value::Blob(b) => {
            out.push(0x16);
            append_escaped(b, out);
        }
    }
}

fn append_escaped(bytes: &[u8], out: &mut SmallVec<[u8; 64]>) {
    for byte in bytes {
        if *byte == 0 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(*byte);
        }
    }
    // Two-byte terminator keeps the encoding prefix-free.
    out.extend_from_slice(&[0x00, 0x01]);
}
