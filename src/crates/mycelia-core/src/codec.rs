//! Self-describing binary codec for arguments and results
//!
//! Values cross the wire as MessagePack with extension tags. The model is
//! deliberately small: everything a handler receives or returns is a
//! [`Value`], and application-defined structures serialize as ordered
//! positional maps keyed by declaration index (see
//! [`params`](crate::params)).
//!
//! Reserved extension tags:
//!
//! | tag | payload                                  |
//! |-----|------------------------------------------|
//! | 0   | UUID, 16 bytes                           |
//! | 1   | duration, seconds as a packed double     |
//! | 2   | single dependency reference, 16-byte UUID|
//! | 3   | tuple of dependency references           |
//!
//! Tags 2 and 3 are placeholders the executor substitutes with dependency
//! graph results before a handler runs. Unknown tags survive a
//! decode/encode round trip untouched.

use std::time::Duration;

use rmp::decode::{Bytes, RmpRead};
use rmp::Marker;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Extension tag for UUID values
pub const TAG_UUID: i8 = 0;
/// Extension tag for durations (seconds as a double)
pub const TAG_DURATION: i8 = 1;
/// Extension tag for a single dependency reference
pub const TAG_DEPENDENCY: i8 = 2;
/// Extension tag for a tuple of dependency references
pub const TAG_DEPENDENCIES: i8 = 3;

/// A decoded MessagePack value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Map entries in encounter order; non-string keys are permitted
    Map(Vec<(Value, Value)>),
    /// Extension-tagged payload
    Ext(i8, Vec<u8>),
}

impl Value {
    /// Wrap a UUID as an extension value (tag 0)
    pub fn uuid(id: Uuid) -> Self {
        Value::Ext(TAG_UUID, id.as_bytes().to_vec())
    }

    /// Wrap a duration as an extension value (tag 1)
    pub fn duration(value: Duration) -> Self {
        let mut payload = Vec::with_capacity(9);
        rmp::encode::write_f64(&mut payload, value.as_secs_f64())
            .expect("writing to a Vec cannot fail");
        Value::Ext(TAG_DURATION, payload)
    }

    /// Wrap a dependency reference (tag 2)
    pub fn dependency(id: Uuid) -> Self {
        Value::Ext(TAG_DEPENDENCY, id.as_bytes().to_vec())
    }

    /// Wrap a tuple of dependency references (tag 3)
    pub fn dependencies(ids: &[Uuid]) -> Self {
        let mut payload = Vec::with_capacity(ids.len() * 16);
        for id in ids {
            payload.extend_from_slice(id.as_bytes());
        }
        Value::Ext(TAG_DEPENDENCIES, payload)
    }

    pub fn as_uuid(&self) -> Result<Uuid> {
        match self {
            Value::Ext(TAG_UUID, payload) => uuid_from_payload(payload),
            other => Err(Error::Codec(format!("expected a UUID, got {other:?}"))),
        }
    }

    pub fn as_duration(&self) -> Result<Duration> {
        match self {
            Value::Ext(TAG_DURATION, payload) => {
                let mut reader = Bytes::new(payload);
                let seconds = rmp::decode::read_f64(&mut reader)
                    .map_err(|error| Error::Codec(format!("bad duration payload: {error:?}")))?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(Error::Codec(format!("bad duration value: {seconds}")));
                }
                Ok(Duration::from_secs_f64(seconds))
            }
            other => Err(Error::Codec(format!("expected a duration, got {other:?}"))),
        }
    }

    pub fn as_dependency(&self) -> Result<Uuid> {
        match self {
            Value::Ext(TAG_DEPENDENCY, payload) => uuid_from_payload(payload),
            other => Err(Error::Codec(format!(
                "expected a dependency reference, got {other:?}"
            ))),
        }
    }

    pub fn as_dependencies(&self) -> Result<Vec<Uuid>> {
        match self {
            Value::Ext(TAG_DEPENDENCIES, payload) => {
                if payload.len() % 16 != 0 {
                    return Err(Error::Codec(format!(
                        "dependency tuple payload has {} bytes, expected a multiple of 16",
                        payload.len()
                    )));
                }
                payload.chunks_exact(16).map(uuid_from_payload).collect()
            }
            other => Err(Error::Codec(format!(
                "expected dependency references, got {other:?}"
            ))),
        }
    }
}

fn uuid_from_payload(payload: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(payload)
        .map_err(|_| Error::Codec(format!("expected 16 bytes of UUID, got {}", payload.len())))
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::uuid(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::duration(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

/// Encode a value to its binary form
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Decode a binary payload back to a value
///
/// Trailing bytes after a complete value are rejected.
pub fn decode(payload: &[u8]) -> Result<Value> {
    let mut reader = Bytes::new(payload);
    let value = read_value(&mut reader)?;
    if !reader.remaining_slice().is_empty() {
        return Err(Error::Codec(format!(
            "{} trailing bytes after value",
            reader.remaining_slice().len()
        )));
    }
    Ok(value)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Nil => rmp::encode::write_nil(out).map_err(codec_error)?,
        Value::Bool(value) => rmp::encode::write_bool(out, *value).map_err(codec_error)?,
        Value::Int(value) => {
            rmp::encode::write_sint(out, *value).map_err(codec_error)?;
        }
        Value::Float(value) => rmp::encode::write_f64(out, *value).map_err(codec_error)?,
        Value::Str(value) => rmp::encode::write_str(out, value).map_err(codec_error)?,
        Value::Bytes(value) => rmp::encode::write_bin(out, value).map_err(codec_error)?,
        Value::Array(values) => {
            rmp::encode::write_array_len(out, values.len() as u32).map_err(codec_error)?;
            for value in values {
                write_value(out, value)?;
            }
        }
        Value::Map(entries) => {
            rmp::encode::write_map_len(out, entries.len() as u32).map_err(codec_error)?;
            for (key, value) in entries {
                write_value(out, key)?;
                write_value(out, value)?;
            }
        }
        Value::Ext(tag, payload) => {
            rmp::encode::write_ext_meta(out, payload.len() as u32, *tag).map_err(codec_error)?;
            out.extend_from_slice(payload);
        }
    }
    Ok(())
}

fn read_value(reader: &mut Bytes<'_>) -> Result<Value> {
    let marker = rmp::decode::read_marker(reader)
        .map_err(|_| Error::Codec("truncated value".into()))?;

    let value = match marker {
        Marker::Null => Value::Nil,
        Marker::True => Value::Bool(true),
        Marker::False => Value::Bool(false),
        Marker::FixPos(value) => Value::Int(i64::from(value)),
        Marker::FixNeg(value) => Value::Int(i64::from(value)),
        Marker::U8 => Value::Int(i64::from(read_be::<1>(reader)?[0])),
        Marker::U16 => Value::Int(i64::from(u16::from_be_bytes(read_be::<2>(reader)?))),
        Marker::U32 => Value::Int(i64::from(u32::from_be_bytes(read_be::<4>(reader)?))),
        Marker::U64 => {
            let value = u64::from_be_bytes(read_be::<8>(reader)?);
            Value::Int(
                i64::try_from(value)
                    .map_err(|_| Error::Codec(format!("integer out of range: {value}")))?,
            )
        }
        Marker::I8 => Value::Int(i64::from(read_be::<1>(reader)?[0] as i8)),
        Marker::I16 => Value::Int(i64::from(i16::from_be_bytes(read_be::<2>(reader)?))),
        Marker::I32 => Value::Int(i64::from(i32::from_be_bytes(read_be::<4>(reader)?))),
        Marker::I64 => Value::Int(i64::from_be_bytes(read_be::<8>(reader)?)),
        Marker::F32 => Value::Float(f64::from(f32::from_be_bytes(read_be::<4>(reader)?))),
        Marker::F64 => Value::Float(f64::from_be_bytes(read_be::<8>(reader)?)),
        Marker::FixStr(length) => read_str(reader, length as usize)?,
        Marker::Str8 => {
            let length = read_be::<1>(reader)?[0] as usize;
            read_str(reader, length)?
        }
        Marker::Str16 => {
            let length = u16::from_be_bytes(read_be::<2>(reader)?) as usize;
            read_str(reader, length)?
        }
        Marker::Str32 => {
            let length = u32::from_be_bytes(read_be::<4>(reader)?) as usize;
            read_str(reader, length)?
        }
        Marker::Bin8 => {
            let length = read_be::<1>(reader)?[0] as usize;
            Value::Bytes(read_payload(reader, length)?)
        }
        Marker::Bin16 => {
            let length = u16::from_be_bytes(read_be::<2>(reader)?) as usize;
            Value::Bytes(read_payload(reader, length)?)
        }
        Marker::Bin32 => {
            let length = u32::from_be_bytes(read_be::<4>(reader)?) as usize;
            Value::Bytes(read_payload(reader, length)?)
        }
        Marker::FixArray(length) => read_array(reader, length as usize)?,
        Marker::Array16 => {
            let length = u16::from_be_bytes(read_be::<2>(reader)?) as usize;
            read_array(reader, length)?
        }
        Marker::Array32 => {
            let length = u32::from_be_bytes(read_be::<4>(reader)?) as usize;
            read_array(reader, length)?
        }
        Marker::FixMap(length) => read_map(reader, length as usize)?,
        Marker::Map16 => {
            let length = u16::from_be_bytes(read_be::<2>(reader)?) as usize;
            read_map(reader, length)?
        }
        Marker::Map32 => {
            let length = u32::from_be_bytes(read_be::<4>(reader)?) as usize;
            read_map(reader, length)?
        }
        Marker::FixExt1 => read_ext(reader, 1)?,
        Marker::FixExt2 => read_ext(reader, 2)?,
        Marker::FixExt4 => read_ext(reader, 4)?,
        Marker::FixExt8 => read_ext(reader, 8)?,
        Marker::FixExt16 => read_ext(reader, 16)?,
        Marker::Ext8 => {
            let length = read_be::<1>(reader)?[0] as usize;
            read_ext(reader, length)?
        }
        Marker::Ext16 => {
            let length = u16::from_be_bytes(read_be::<2>(reader)?) as usize;
            read_ext(reader, length)?
        }
        Marker::Ext32 => {
            let length = u32::from_be_bytes(read_be::<4>(reader)?) as usize;
            read_ext(reader, length)?
        }
        Marker::Reserved => return Err(Error::Codec("reserved marker".into())),
    };

    Ok(value)
}

fn read_be<const N: usize>(reader: &mut Bytes<'_>) -> Result<[u8; N]> {
    let mut buffer = [0u8; N];
    reader
        .read_exact_buf(&mut buffer)
        .map_err(|_| Error::Codec("truncated value".into()))?;
    Ok(buffer)
}

fn read_payload(reader: &mut Bytes<'_>, length: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; length];
    reader
        .read_exact_buf(&mut buffer)
        .map_err(|_| Error::Codec("truncated value".into()))?;
    Ok(buffer)
}

fn read_str(reader: &mut Bytes<'_>, length: usize) -> Result<Value> {
    let payload = read_payload(reader, length)?;
    String::from_utf8(payload)
        .map(Value::Str)
        .map_err(|error| Error::Codec(format!("invalid utf-8 in string: {error}")))
}

fn read_array(reader: &mut Bytes<'_>, length: usize) -> Result<Value> {
    let mut values = Vec::with_capacity(length.min(1024));
    for _ in 0..length {
        values.push(read_value(reader)?);
    }
    Ok(Value::Array(values))
}

fn read_map(reader: &mut Bytes<'_>, length: usize) -> Result<Value> {
    let mut entries = Vec::with_capacity(length.min(1024));
    for _ in 0..length {
        let key = read_value(reader)?;
        let value = read_value(reader)?;
        entries.push((key, value));
    }
    Ok(Value::Map(entries))
}

fn read_ext(reader: &mut Bytes<'_>, length: usize) -> Result<Value> {
    let tag = read_be::<1>(reader)?[0] as i8;
    Ok(Value::Ext(tag, read_payload(reader, length)?))
}

fn codec_error<E: std::fmt::Display>(error: E) -> Error {
    Error::Codec(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: Value) -> Value {
        decode(&encode(&value).unwrap()).unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(127),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Str("hello".into()),
            Value::Bytes(vec![0, 1, 2, 255]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn containers_roundtrip() {
        let value = Value::Map(vec![
            (Value::Int(0), Value::Array(vec![Value::Int(1), Value::Nil])),
            (Value::Str("key".into()), Value::Bytes(vec![9])),
        ]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn uuid_tag_roundtrips() {
        let id = Uuid::new_v4();
        let value = roundtrip(Value::uuid(id));
        assert_eq!(value.as_uuid().unwrap(), id);
    }

    #[test]
    fn duration_tag_roundtrips() {
        let value = roundtrip(Value::duration(Duration::from_millis(1500)));
        assert_eq!(value.as_duration().unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn dependency_tags_roundtrip() {
        let single = Uuid::new_v4();
        assert_eq!(roundtrip(Value::dependency(single)).as_dependency().unwrap(), single);

        let many = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(
            roundtrip(Value::dependencies(&many)).as_dependencies().unwrap(),
            many
        );
    }

    #[test]
    fn unknown_ext_tags_pass_through() {
        let value = Value::Ext(42, vec![1, 2, 3]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut payload = encode(&Value::Int(1)).unwrap();
        payload.push(0xc0);
        assert!(decode(&payload).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = encode(&Value::Str("truncate me".into())).unwrap();
        assert!(decode(&payload[..payload.len() - 1]).is_err());
    }

    #[test]
    fn mismatched_tag_extraction_fails() {
        assert!(Value::Int(1).as_uuid().is_err());
        assert!(Value::uuid(Uuid::new_v4()).as_duration().is_err());
        assert!(Value::Ext(TAG_DEPENDENCIES, vec![1, 2, 3]).as_dependencies().is_err());
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_filter("NaN breaks equality", |f| !f.is_nan()).prop_map(Value::Float),
            ".{0,32}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
            (any::<i8>(), proptest::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(tag, payload)| Value::Ext(tag, payload)),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(value in value_strategy()) {
            prop_assert_eq!(roundtrip(value.clone()), value);
        }
    }
}
