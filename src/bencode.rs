// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Bencode value model and codec.
//!
//! The session formats are bencode end to end: the metainfo document, the
//! per-download state blobs, and the keyed field files all use the same
//! recursive value type. Every node carries a small flag set; the serializer
//! takes a `skip_mask` and omits any node whose flags intersect it, which is
//! how the store keeps session-private subtrees out of the immutable
//! metainfo document.

use std::collections::BTreeMap;
use thiserror::Error;

/// Nesting limit for the decoder. Session documents are a handful of levels
/// deep; anything past this is garbage or hostile input.
const MAX_DEPTH: usize = 128;

/// Decoding errors. The store treats all of these as "corrupt blob" and
/// recovers with an empty value, but the codec reports precisely.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid prefix byte 0x{0:02x}")]
    InvalidPrefix(u8),

    #[error("invalid integer")]
    InvalidInt,

    #[error("invalid byte string length")]
    InvalidLength,

    #[error("dictionary key is not a byte string")]
    InvalidMapKey,

    #[error("nesting too deep")]
    TooDeep,

    #[error("trailing data after document")]
    TrailingData,
}

/// The payload of a [`Value`].
///
/// Map keys compare and serialize as raw byte strings; `BTreeMap` keeps them
/// in the lexicographic order bencode requires on output.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Kind {
    #[default]
    None,
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<Vec<u8>, Value>),
}

/// A bencode value plus its per-node flag set.
///
/// Flags are serialization annotations, not data: equality ignores them and
/// the decoder always produces nodes with an empty flag set.
#[derive(Debug, Clone, Default)]
pub struct Value {
    kind: Kind,
    flags: u32,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Value {
    /// Marks a node that belongs to the session store. Emitting the
    /// metainfo document with this flag in the skip mask strips the
    /// store-private subtrees from it.
    pub const FLAG_SESSION_DATA: u32 = 0x1;

    pub fn none() -> Self {
        Self::default()
    }

    pub fn int(v: i64) -> Self {
        Self { kind: Kind::Int(v), flags: 0 }
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self { kind: Kind::Bytes(b.into()), flags: 0 }
    }

    /// Byte-string value from UTF-8 text.
    pub fn string(s: &str) -> Self {
        Self::bytes(s.as_bytes().to_vec())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self { kind: Kind::List(items), flags: 0 }
    }

    /// Empty ordered-key map.
    pub fn map() -> Self {
        Self { kind: Kind::Map(BTreeMap::new()), flags: 0 }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, Kind::None)
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, Kind::Map(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            Kind::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            Kind::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte-string payload as UTF-8 text, if it is both a byte string and
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match &self.kind {
            Kind::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.kind {
            Kind::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match &self.kind {
            Kind::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<Vec<u8>, Value>> {
        match &mut self.kind {
            Kind::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up `key` in a map value. `None` for non-maps and missing keys.
    pub fn get_key(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key.as_bytes()))
    }

    pub fn get_key_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.as_map_mut().and_then(|m| m.get_mut(key.as_bytes()))
    }

    /// Insert or replace `key` in a map value. Ignored on non-maps.
    pub fn insert_key(&mut self, key: &str, value: Value) {
        if let Some(entries) = self.as_map_mut() {
            entries.insert(key.as_bytes().to_vec(), value);
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.get_key(key).is_some()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Add `flags` to this node's flag set.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    /// Whether this node survives serialization under `skip_mask`.
    fn emits(&self, skip_mask: u32) -> bool {
        self.flags & skip_mask == 0 && !self.is_none()
    }

    /// Serialize to bencode. Any node whose flags intersect `skip_mask` is
    /// omitted from its parent: maps drop the key, lists drop the element,
    /// and a skipped top-level node yields empty output. `None` nodes are
    /// omitted the same way.
    pub fn encode(&self, skip_mask: u32) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(skip_mask, &mut out);
        out
    }

    pub fn encode_into(&self, skip_mask: u32, out: &mut Vec<u8>) {
        if !self.emits(skip_mask) {
            return;
        }
        match &self.kind {
            Kind::None => {}
            Kind::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Kind::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Kind::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(skip_mask, out);
                }
                out.push(b'e');
            }
            Kind::Map(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    if !value.emits(skip_mask) {
                        continue;
                    }
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(skip_mask, out);
                }
                out.push(b'e');
            }
        }
    }

    /// Parse exactly one bencode document. Trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
        let (value, pos) = decode_value(data, 0, 0)?;
        if pos != data.len() {
            return Err(BencodeError::TrailingData);
        }
        Ok(value)
    }
}

fn decode_value(data: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::TooDeep);
    }
    if pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    match data[pos] {
        b'i' => {
            let (v, next) = decode_int(data, pos)?;
            Ok((Value::int(v), next))
        }
        b'l' => {
            let mut items = Vec::new();
            let mut i = pos + 1;
            while i < data.len() && data[i] != b'e' {
                let (value, next) = decode_value(data, i, depth + 1)?;
                items.push(value);
                i = next;
            }
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEof);
            }
            Ok((Value::list(items), i + 1))
        }
        b'd' => {
            let mut entries = BTreeMap::new();
            let mut i = pos + 1;
            while i < data.len() && data[i] != b'e' {
                if !data[i].is_ascii_digit() {
                    return Err(BencodeError::InvalidMapKey);
                }
                let (key, next) = decode_bytes(data, i)?;
                let (value, next) = decode_value(data, next, depth + 1)?;
                entries.insert(key, value);
                i = next;
            }
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEof);
            }
            Ok((Value { kind: Kind::Map(entries), flags: 0 }, i + 1))
        }
        b'0'..=b'9' => {
            let (bytes, next) = decode_bytes(data, pos)?;
            Ok((Value::bytes(bytes), next))
        }
        other => Err(BencodeError::InvalidPrefix(other)),
    }
}

fn decode_int(data: &[u8], pos: usize) -> Result<(i64, usize), BencodeError> {
    let mut i = pos + 1;
    while i < data.len() && data[i] != b'e' {
        i += 1;
    }
    if i >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let digits = &data[pos + 1..i];
    if digits.is_empty() {
        return Err(BencodeError::InvalidInt);
    }
    // Canonical form only: no leading zeros, no negative zero.
    if (digits.len() > 1 && digits[0] == b'0')
        || (digits.len() > 1 && digits[0] == b'-' && digits[1] == b'0')
    {
        return Err(BencodeError::InvalidInt);
    }
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInt)?;
    let value = text.parse::<i64>().map_err(|_| BencodeError::InvalidInt)?;
    Ok((value, i + 1))
}

fn decode_bytes(data: &[u8], pos: usize) -> Result<(Vec<u8>, usize), BencodeError> {
    let mut i = pos;
    while i < data.len() && data[i].is_ascii_digit() {
        i += 1;
    }
    if i == pos || i >= data.len() || data[i] != b':' {
        return Err(BencodeError::InvalidLength);
    }
    let digits = &data[pos..i];
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(BencodeError::InvalidLength);
    }
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
    let len = text.parse::<usize>().map_err(|_| BencodeError::InvalidLength)?;
    let start = i + 1;
    let end = start.checked_add(len).ok_or(BencodeError::InvalidLength)?;
    if end > data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    Ok((data[start..end].to_vec(), end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> Value {
        let mut m = Value::map();
        m.insert_key("bar", Value::int(42));
        m.insert_key("foo", Value::list(vec![Value::string("hi")]));
        m
    }

    #[test]
    fn roundtrip_map() {
        let value = sample_map();
        let encoded = value.encode(0);
        let decoded = Value::decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn encodes_map_keys_sorted() {
        let mut m = Value::map();
        m.insert_key("zzz", Value::int(1));
        m.insert_key("aaa", Value::int(2));
        assert_eq!(m.encode(0), b"d3:aaai2e3:zzzi1ee");
    }

    #[test]
    fn encode_primitives() {
        assert_eq!(Value::int(42).encode(0), b"i42e");
        assert_eq!(Value::int(-1).encode(0), b"i-1e");
        assert_eq!(Value::string("spam").encode(0), b"4:spam");
        assert_eq!(Value::string("").encode(0), b"0:");
        assert_eq!(
            Value::list(vec![Value::string("spam"), Value::int(42)]).encode(0),
            b"l4:spami42ee"
        );
    }

    #[test]
    fn rejects_noncanonical_integers() {
        assert_eq!(Value::decode(b"i-0e"), Err(BencodeError::InvalidInt));
        assert_eq!(Value::decode(b"i01e"), Err(BencodeError::InvalidInt));
        assert_eq!(Value::decode(b"ie"), Err(BencodeError::InvalidInt));
    }

    #[test]
    fn rejects_trailing_data() {
        assert_eq!(Value::decode(b"i1ee"), Err(BencodeError::TrailingData));
    }

    #[test]
    fn rejects_invalid_map_key_type() {
        assert_eq!(Value::decode(b"di1e1:ae"), Err(BencodeError::InvalidMapKey));
    }

    #[test]
    fn rejects_invalid_lengths() {
        assert_eq!(Value::decode(b"03:abc"), Err(BencodeError::InvalidLength));
        assert_eq!(Value::decode(b"4:abc"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert_eq!(Value::decode(b"l4:spam"), Err(BencodeError::UnexpectedEof));
        assert_eq!(Value::decode(b"d3:foo"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_runaway_nesting() {
        let mut doc: Vec<u8> = Vec::new();
        doc.extend(std::iter::repeat(b'l').take(MAX_DEPTH + 2));
        assert_eq!(Value::decode(&doc), Err(BencodeError::TooDeep));
    }

    #[test]
    fn skip_mask_drops_flagged_map_entries() {
        let mut m = sample_map();
        m.get_key_mut("foo").unwrap().set_flags(Value::FLAG_SESSION_DATA);
        assert_eq!(m.encode(Value::FLAG_SESSION_DATA), b"d3:bari42ee");
        // Without the mask the flagged node is still emitted.
        assert_eq!(m.encode(0), b"d3:bari42e3:fool2:hiee");
    }

    #[test]
    fn skip_mask_drops_flagged_list_elements() {
        let mut l = Value::list(vec![Value::int(1), Value::int(2), Value::int(3)]);
        l.as_list_mut().unwrap()[1].set_flags(Value::FLAG_SESSION_DATA);
        assert_eq!(l.encode(Value::FLAG_SESSION_DATA), b"li1ei3ee");
    }

    #[test]
    fn skip_mask_on_root_yields_empty_output() {
        let mut m = sample_map();
        m.set_flags(Value::FLAG_SESSION_DATA);
        assert!(m.encode(Value::FLAG_SESSION_DATA).is_empty());
    }

    #[test]
    fn none_values_are_omitted() {
        let mut m = Value::map();
        m.insert_key("keep", Value::int(7));
        m.insert_key("gone", Value::none());
        assert_eq!(m.encode(0), b"d4:keepi7ee");
        assert_eq!(
            Value::list(vec![Value::none(), Value::int(7)]).encode(0),
            b"li7ee"
        );
    }

    #[test]
    fn equality_ignores_flags() {
        let mut a = sample_map();
        let b = sample_map();
        a.set_flags(Value::FLAG_SESSION_DATA);
        assert_eq!(a, b);
    }

    #[test]
    fn flags_accumulate_and_clear() {
        let mut v = Value::int(1);
        v.set_flags(0x1);
        v.set_flags(0x4);
        assert_eq!(v.flags(), 0x5);
        v.clear_flags(0x1);
        assert_eq!(v.flags(), 0x4);
    }

    #[test]
    fn decode_produces_unflagged_nodes() {
        let mut m = sample_map();
        m.get_key_mut("bar").unwrap().set_flags(Value::FLAG_SESSION_DATA);
        let decoded = Value::decode(&m.encode(0)).unwrap();
        assert_eq!(decoded.get_key("bar").unwrap().flags(), 0);
    }
}
