//! Dynamically typed postgres values.
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, elem_oid, oid},
    row::DecodeError,
    types::{TypeRegistry, array, time as pg_time},
};

/// One decoded column or parameter value.
///
/// The variant is driven by the column oid, not the other way around, see the
/// conversion table in [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// `bytea`
    Bytes(Bytes),
    /// `text`, `varchar`, `bpchar`, `name` and `"char"`
    Text(ByteStr),
    Date(PgDate),
    /// `timestamp` and `timestamptz`, both as an utc instant
    Timestamp(PgTimestamp),
    Point(PgPoint),
    Uuid(uuid::Uuid),
    /// `json` and `jsonb`
    Json(serde_json::Value),
    /// N dimensional arrays nest, `int4[][]` decodes as `Array` of `Array` of `I32`
    Array(Vec<Value>),
}

/// `date`, including the special values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgDate {
    Finite(time::Date),
    PosInfinity,
    NegInfinity,
}

/// `timestamp`/`timestamptz`, including the special values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTimestamp {
    Finite(time::UtcDateTime),
    PosInfinity,
    NegInfinity,
}

/// `point`, a geometric pair of float8.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PgPoint {
    pub x: f64,
    pub y: f64,
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Oid used when the parameter type was not prespecified nor described.
    pub(crate) fn natural_oid(&self) -> Oid {
        match self {
            Value::Null => 0,
            Value::Bool(_) => oid::BOOL,
            Value::I16(_) => oid::INT2,
            Value::I32(_) => oid::INT4,
            Value::I64(_) => oid::INT8,
            Value::F32(_) => oid::FLOAT4,
            Value::F64(_) => oid::FLOAT8,
            Value::Bytes(_) => oid::BYTEA,
            Value::Text(_) => oid::TEXT,
            Value::Date(_) => oid::DATE,
            Value::Timestamp(_) => oid::TIMESTAMPTZ,
            Value::Point(_) => oid::POINT,
            Value::Uuid(_) => oid::UUID,
            Value::Json(_) => oid::JSONB,
            Value::Array(_) => 0,
        }
    }
}

// ===== Decoding =====

/// Decode one wire value of type `oid`.
///
/// A registered reader takes priority for its oid; otherwise oids at or above
/// the user cutoff decode as [`Value::Null`]. Unrecognized builtin oids decode
/// as `Null` in binary format, and pass through as [`Value::Text`] in text
/// format since the server already rendered them readable.
pub(crate) fn decode(
    oid: Oid,
    format: PgFormat,
    value: &Bytes,
    registry: &TypeRegistry,
) -> Result<Value, DecodeError> {
    if let Some(reader) = registry.get(oid) {
        return reader(value, format);
    }
    if TypeRegistry::is_user_oid(oid) {
        return Ok(Value::Null);
    }
    if let Some(elem) = elem_oid(oid) {
        return match format {
            PgFormat::Binary => array::decode_binary(value.clone(), elem, registry),
            PgFormat::Text => array::decode_text(utf8(value)?, elem, registry),
        };
    }
    match format {
        PgFormat::Binary => decode_scalar_binary(oid, value),
        PgFormat::Text => decode_scalar_text(oid, utf8(value)?),
    }
}

fn utf8(value: &Bytes) -> Result<ByteStr, DecodeError> {
    ByteStr::from_utf8(value.clone()).map_err(Into::into)
}

fn be<const N: usize>(value: &[u8]) -> Result<[u8; N], DecodeError> {
    value
        .try_into()
        .map_err(|_| DecodeError::invalid(format!("expected {N} byte value, got {}", value.len())))
}

pub(crate) fn decode_scalar_binary(type_oid: Oid, value: &Bytes) -> Result<Value, DecodeError> {
    use oid::*;
    Ok(match type_oid {
        BOOL => Value::Bool(*value.first().ok_or(DecodeError::invalid("empty bool"))? != 0),
        INT2 => Value::I16(i16::from_be_bytes(be(value)?)),
        INT4 => Value::I32(i32::from_be_bytes(be(value)?)),
        INT8 => Value::I64(i64::from_be_bytes(be(value)?)),
        OID => Value::I64(u32::from_be_bytes(be(value)?) as i64),
        FLOAT4 => Value::F32(f32::from_be_bytes(be(value)?)),
        FLOAT8 => Value::F64(f64::from_be_bytes(be(value)?)),
        CHAR | NAME | TEXT | BPCHAR | VARCHAR => Value::Text(utf8(value)?),
        BYTEA => Value::Bytes(value.clone()),
        DATE => Value::Date(pg_time::decode_date_binary(i32::from_be_bytes(be(value)?))?),
        TIMESTAMP | TIMESTAMPTZ => {
            Value::Timestamp(pg_time::decode_timestamp_binary(i64::from_be_bytes(be(value)?)))
        }
        POINT => {
            let value: [u8; 16] = be(value)?;
            Value::Point(PgPoint {
                x: f64::from_be_bytes(value[..8].try_into().unwrap()),
                y: f64::from_be_bytes(value[8..].try_into().unwrap()),
            })
        }
        UUID => Value::Uuid(
            uuid::Uuid::from_slice(value)
                .map_err(|_| DecodeError::invalid("uuid must be 16 bytes"))?,
        ),
        JSON => Value::Json(serde_json::from_slice(value)?),
        JSONB => match value.split_first() {
            // any version other than 1 decodes as null
            Some((1, json)) => Value::Json(serde_json::from_slice(json)?),
            _ => Value::Null,
        },
        _ => Value::Null,
    })
}

pub(crate) fn decode_scalar_text(type_oid: Oid, value: ByteStr) -> Result<Value, DecodeError> {
    use oid::*;
    macro_rules! parse {
        ($what:literal) => {
            value
                .parse()
                .map_err(|_| DecodeError::invalid(concat!("malformed ", $what)))?
        };
    }
    Ok(match type_oid {
        BOOL => Value::Bool(matches!(&*value, "t" | "true")),
        INT2 => Value::I16(parse!("int2")),
        INT4 => Value::I32(parse!("int4")),
        INT8 | OID => Value::I64(parse!("int8")),
        FLOAT4 => Value::F32(parse!("float4")),
        FLOAT8 => Value::F64(parse!("float8")),
        BYTEA => Value::Bytes(decode_bytea_text(&value)?),
        DATE => Value::Date(pg_time::parse_date_text(&value)?),
        TIMESTAMP | TIMESTAMPTZ => Value::Timestamp(pg_time::parse_timestamp_text(&value)?),
        POINT => {
            let inner = value
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .and_then(|v| v.split_once(','))
                .ok_or(DecodeError::invalid("malformed point"))?;
            Value::Point(PgPoint {
                x: inner.0.trim().parse().map_err(|_| DecodeError::invalid("malformed point"))?,
                y: inner.1.trim().parse().map_err(|_| DecodeError::invalid("malformed point"))?,
            })
        }
        UUID => Value::Uuid(
            uuid::Uuid::parse_str(&value).map_err(|_| DecodeError::invalid("malformed uuid"))?,
        ),
        JSON | JSONB => Value::Json(serde_json::from_str(&value)?),
        // the server already rendered it readable
        _ => Value::Text(value),
    })
}

/// `bytea` text output, `\x` followed by hex.
fn decode_bytea_text(value: &str) -> Result<Bytes, DecodeError> {
    let hex = value
        .strip_prefix("\\x")
        .ok_or(DecodeError::invalid("bytea text without \\x prefix"))?;
    if hex.len() % 2 != 0 {
        return Err(DecodeError::invalid("odd length bytea hex"));
    }
    let mut out = BytesMut::with_capacity(hex.len() / 2);
    let digit = |b: u8| -> Result<u8, DecodeError> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(DecodeError::invalid("malformed bytea hex")),
        }
    };
    for pair in hex.as_bytes().chunks_exact(2) {
        out.put_u8(digit(pair[0])? << 4 | digit(pair[1])?);
    }
    Ok(out.freeze())
}

// ===== Encoding =====

/// An error when a parameter cannot be encoded as the requested type.
pub struct EncodeError {
    reason: Cow<'static, str>,
}

impl EncodeError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    fn mismatch(value: &Value, oid: Oid) -> Self {
        Self::new(format!("cannot encode {value:?} as oid {oid}"))
    }
}

impl std::error::Error for EncodeError { }

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Encode one parameter value as type `oid`, `None` is NULL.
pub(crate) fn encode(
    value: &Value,
    oid: Oid,
    format: PgFormat,
) -> Result<Option<Bytes>, EncodeError> {
    if value.is_null() {
        return Ok(None);
    }
    let oid = match oid {
        0 => value.natural_oid(),
        oid => oid,
    };
    match format {
        PgFormat::Binary => {
            let mut buf = BytesMut::new();
            encode_binary(value, oid, &mut buf)?;
            Ok(Some(buf.freeze()))
        }
        PgFormat::Text => Ok(Some(Bytes::from(encode_text(value, oid)?.into_bytes()))),
    }
}

macro_rules! int {
    ($value:ident, $oid:ident as $ty:ty) => {
        match *$value {
            Value::I16(v) => <$ty>::try_from(v as i64),
            Value::I32(v) => <$ty>::try_from(v as i64),
            Value::I64(v) => <$ty>::try_from(v),
            _ => return Err(EncodeError::mismatch($value, $oid)),
        }
        .map_err(|_| EncodeError::new(concat!("integer out of range for ", stringify!($ty))))?
    };
}

pub(crate) fn encode_binary(
    value: &Value,
    type_oid: Oid,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    use oid::*;

    if let Some(elem) = elem_oid(type_oid) {
        return match value {
            Value::Array(items) => array::encode_binary(items, elem, buf),
            _ => Err(EncodeError::mismatch(value, type_oid)),
        };
    }

    match type_oid {
        BOOL => match value {
            Value::Bool(v) => buf.put_u8(*v as u8),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        INT2 => buf.put_i16(int!(value, type_oid as i16)),
        INT4 => buf.put_i32(int!(value, type_oid as i32)),
        INT8 => buf.put_i64(int!(value, type_oid as i64)),
        OID => buf.put_u32(int!(value, type_oid as u32)),
        FLOAT4 => match *value {
            Value::F32(v) => buf.put_f32(v),
            Value::F64(v) => buf.put_f32(v as f32),
            Value::I16(v) => buf.put_f32(v.into()),
            Value::I32(v) => buf.put_f32(v as f32),
            Value::I64(v) => buf.put_f32(v as f32),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        FLOAT8 => match *value {
            Value::F32(v) => buf.put_f64(v.into()),
            Value::F64(v) => buf.put_f64(v),
            Value::I16(v) => buf.put_f64(v.into()),
            Value::I32(v) => buf.put_f64(v.into()),
            Value::I64(v) => buf.put_f64(v as f64),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        // caller provided buffers pass through unchanged for the text family and bytea
        CHAR | NAME | TEXT | BPCHAR | VARCHAR => match value {
            Value::Text(v) => buf.put(v.as_str().as_bytes()),
            Value::Bytes(v) => buf.put(&v[..]),
            other => buf.put(encode_text(other, type_oid)?.as_bytes()),
        },
        BYTEA => match value {
            Value::Bytes(v) => buf.put(&v[..]),
            Value::Text(v) => buf.put(v.as_str().as_bytes()),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        DATE => match value {
            Value::Date(v) => buf.put_i32(pg_time::encode_date_binary(v)),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        TIMESTAMP | TIMESTAMPTZ => match value {
            Value::Timestamp(v) => buf.put_i64(pg_time::encode_timestamp_binary(v)),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        POINT => match value {
            Value::Point(PgPoint { x, y }) => {
                buf.put_f64(*x);
                buf.put_f64(*y);
            }
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        UUID => match value {
            Value::Uuid(v) => buf.put(&v.as_bytes()[..]),
            Value::Text(v) => {
                let uuid = uuid::Uuid::parse_str(v)
                    .map_err(|_| EncodeError::new(format!("invalid UUID {:?}", v.as_str())))?;
                buf.put(&uuid.as_bytes()[..]);
            }
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        JSON => match value {
            Value::Json(v) => buf.put(serde_json::to_vec(v).expect("serializing serde_json::Value").as_slice()),
            Value::Text(v) => buf.put(v.as_str().as_bytes()),
            _ => return Err(EncodeError::mismatch(value, type_oid)),
        },
        JSONB => {
            // jsonb version prefix
            buf.put_u8(1);
            match value {
                Value::Json(v) => {
                    buf.put(serde_json::to_vec(v).expect("serializing serde_json::Value").as_slice())
                }
                Value::Text(v) => buf.put(v.as_str().as_bytes()),
                _ => return Err(EncodeError::mismatch(value, type_oid)),
            }
        }
        _ => return Err(EncodeError::new(format!("no binary encoding for oid {type_oid}"))),
    }
    Ok(())
}

/// Render one value in postgres text format.
pub(crate) fn encode_text(value: &Value, type_oid: Oid) -> Result<String, EncodeError> {
    if let Some(elem) = elem_oid(type_oid) {
        return match value {
            Value::Array(items) => array::encode_text(items, elem),
            _ => Err(EncodeError::mismatch(value, type_oid)),
        };
    }
    Ok(match value {
        Value::Null => "null".into(),
        Value::Bool(v) => String::from(if *v { "t" } else { "f" }),
        Value::I16(v) => itoa::Buffer::new().format(*v).into(),
        Value::I32(v) => itoa::Buffer::new().format(*v).into(),
        Value::I64(v) => itoa::Buffer::new().format(*v).into(),
        Value::F32(v) => format!("{v}"),
        Value::F64(v) => format!("{v}"),
        Value::Bytes(v) => {
            let mut out = String::with_capacity(2 + v.len() * 2);
            out.push_str("\\x");
            for b in v {
                out.push_str(&format!("{b:02x}"));
            }
            out
        }
        Value::Text(v) => v.as_str().into(),
        Value::Date(v) => pg_time::format_date(v),
        Value::Timestamp(v) => pg_time::format_timestamp(v, type_oid == oid::TIMESTAMPTZ),
        Value::Point(PgPoint { x, y }) => format!("({x},{y})"),
        Value::Uuid(v) => v.to_string(),
        Value::Json(v) => serde_json::to_string(v).expect("serializing serde_json::Value"),
        Value::Array(_) => return Err(EncodeError::mismatch(value, type_oid)),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::TypeRegistry;

    fn roundtrip(value: Value, oid: Oid) -> Value {
        let registry = TypeRegistry::default();
        let bytes = encode(&value, oid, PgFormat::Binary).unwrap().unwrap();
        decode(oid, PgFormat::Binary, &bytes, &registry).unwrap()
    }

    #[test]
    fn binary_scalars_roundtrip() {
        assert_eq!(roundtrip(Value::Bool(true), oid::BOOL), Value::Bool(true));
        assert_eq!(roundtrip(Value::I16(-7), oid::INT2), Value::I16(-7));
        assert_eq!(roundtrip(Value::I32(1 << 20), oid::INT4), Value::I32(1 << 20));
        assert_eq!(roundtrip(Value::I64(i64::MIN), oid::INT8), Value::I64(i64::MIN));
        assert_eq!(roundtrip(Value::F64(1.5), oid::FLOAT8), Value::F64(1.5));
        assert_eq!(
            roundtrip(Value::Text("héllo".into()), oid::TEXT),
            Value::Text("héllo".into()),
        );
        assert_eq!(
            roundtrip(Value::Bytes(Bytes::from_static(&[0, 1, 255])), oid::BYTEA),
            Value::Bytes(Bytes::from_static(&[0, 1, 255])),
        );
        assert_eq!(
            roundtrip(
                Value::Point(PgPoint { x: -1.25, y: 3.5 }),
                oid::POINT,
            ),
            Value::Point(PgPoint { x: -1.25, y: 3.5 }),
        );
    }

    #[test]
    fn int_widening_and_overflow() {
        // small value fits a wider column
        assert_eq!(roundtrip(Value::I16(9), oid::INT8), Value::I64(9));
        assert_eq!(roundtrip(Value::I64(9), oid::INT2), Value::I16(9));
        // out of range is an encode error, not a wrap
        encode(&Value::I32(70_000), oid::INT2, PgFormat::Binary).unwrap_err();
    }

    #[test]
    fn uuid_binary_and_text() {
        let uuid = uuid::Uuid::from_bytes([
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88,
            0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00,
        ]);
        assert_eq!(roundtrip(Value::Uuid(uuid), oid::UUID), Value::Uuid(uuid));
        assert_eq!(
            encode_text(&Value::Uuid(uuid), oid::UUID).unwrap(),
            "11223344-5566-7788-99aa-bbccddeeff00",
        );
        // invalid uuid strings fail at encode time
        encode(
            &Value::Text("not-a-uuid".into()),
            oid::UUID,
            PgFormat::Binary,
        )
        .unwrap_err();
    }

    #[test]
    fn jsonb_version_byte() {
        let registry = TypeRegistry::default();
        let value = Value::Json(serde_json::json!({"a": [1, 2]}));
        let bytes = encode(&value, oid::JSONB, PgFormat::Binary).unwrap().unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(decode(oid::JSONB, PgFormat::Binary, &bytes, &registry).unwrap(), value);

        // unknown jsonb version decodes as null
        let unversioned = Bytes::from_static(b"\x02{}");
        assert_eq!(
            decode(oid::JSONB, PgFormat::Binary, &unversioned, &registry).unwrap(),
            Value::Null,
        );
    }

    #[test]
    fn user_oid_without_reader_is_null() {
        let registry = TypeRegistry::default();
        let bytes = Bytes::from_static(b"anything");
        assert_eq!(
            decode(20000, PgFormat::Binary, &bytes, &registry).unwrap(),
            Value::Null,
        );
    }

    #[test]
    fn registered_reader_takes_priority() {
        let mut registry = TypeRegistry::default();
        registry.register(20000, |raw, _| {
            Ok(Value::I64(raw.len() as i64))
        });
        let bytes = Bytes::from_static(b"anything");
        assert_eq!(
            decode(20000, PgFormat::Binary, &bytes, &registry).unwrap(),
            Value::I64(8),
        );
    }

    #[test]
    fn text_format_decoding() {
        let registry = TypeRegistry::default();
        let decode_text = |oid, s: &'static str| {
            decode(oid, PgFormat::Text, &Bytes::from_static(s.as_bytes()), &registry).unwrap()
        };
        assert_eq!(decode_text(oid::BOOL, "t"), Value::Bool(true));
        assert_eq!(decode_text(oid::INT4, "-42"), Value::I32(-42));
        assert_eq!(decode_text(oid::FLOAT8, "1.25"), Value::F64(1.25));
        assert_eq!(
            decode_text(oid::BYTEA, "\\x00ff10"),
            Value::Bytes(Bytes::from_static(&[0x00, 0xff, 0x10])),
        );
        assert_eq!(
            decode_text(oid::POINT, "(1.5,-2)"),
            Value::Point(PgPoint { x: 1.5, y: -2.0 }),
        );
        // unknown oids pass through as text
        assert_eq!(decode_text(24, "pg_sleep"), Value::Text("pg_sleep".into()));
    }
}
