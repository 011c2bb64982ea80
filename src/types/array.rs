//! Postgres array codec.
//!
//! Binary layout is `[ndim][has_nulls][elem_oid]` then `[size][lower_bound]`
//! per dimension, then elements in row major order as `[len][bytes]` with
//! `-1` marking NULL. Text layout is the `{...}` literal grammar.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::TypeRegistry;
use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat},
    row::DecodeError,
    value::{self, EncodeError, Value},
};

pub(crate) fn decode_binary(
    mut body: Bytes,
    elem: Oid,
    registry: &TypeRegistry,
) -> Result<Value, DecodeError> {
    if body.remaining() < 12 {
        return Err(DecodeError::invalid("array header truncated"));
    }
    let ndim = body.get_i32();
    let _has_nulls = body.get_i32();
    let wire_elem = body.get_u32();
    // a described array column already knows its element type, but the wire
    // header is authoritative for anonymous arrays
    let elem = if wire_elem != 0 { wire_elem } else { elem };

    if ndim == 0 {
        return Ok(Value::Array(Vec::new()));
    }
    if !(1..=6).contains(&ndim) {
        return Err(DecodeError::invalid("array dimension out of range"));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        if body.remaining() < 8 {
            return Err(DecodeError::invalid("array dimension truncated"));
        }
        let size = body.get_i32();
        let _lower_bound = body.get_i32();
        if size < 0 {
            return Err(DecodeError::invalid("negative array dimension"));
        }
        dims.push(size as usize);
    }

    build(&dims, elem, registry, &mut body)
}

fn build(
    dims: &[usize],
    elem: Oid,
    registry: &TypeRegistry,
    body: &mut Bytes,
) -> Result<Value, DecodeError> {
    let (&size, rest) = dims.split_first().expect("dimension checked nonzero");
    let mut out = Vec::with_capacity(size);
    for _ in 0..size {
        if rest.is_empty() {
            if body.remaining() < 4 {
                return Err(DecodeError::invalid("array element truncated"));
            }
            let len = body.get_i32();
            out.push(match len {
                -1 => Value::Null,
                len if len >= 0 && body.remaining() >= len as usize => {
                    let raw = body.split_to(len as usize);
                    value::decode(elem, PgFormat::Binary, &raw, registry)?
                }
                _ => return Err(DecodeError::invalid("array element truncated")),
            });
        } else {
            out.push(build(rest, elem, registry, body)?);
        }
    }
    Ok(Value::Array(out))
}

/// Dimension sizes of a nested array value, checking it is rectangular.
fn dimensions(items: &[Value]) -> Result<Vec<usize>, EncodeError> {
    let mut dims = vec![items.len()];
    let mut level = items;
    while let Some(Value::Array(first)) = level.first() {
        for item in level {
            match item {
                Value::Array(a) if a.len() == first.len() => { }
                _ => return Err(EncodeError::new("array is not rectangular")),
            }
        }
        dims.push(first.len());
        level = first.as_slice();
    }
    if dims.len() > 6 {
        return Err(EncodeError::new("array has too many dimensions"));
    }
    Ok(dims)
}

pub(crate) fn encode_binary(
    items: &[Value],
    elem: Oid,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let dims = dimensions(items)?;

    buf.put_i32(dims.len() as i32);
    // has_nulls is set unconditionally, the server does not rely on it
    buf.put_i32(1);
    buf.put_u32(elem);
    for &size in &dims {
        let size = i32::try_from(size)
            .map_err(|_| EncodeError::new("array dimension too large for protocol"))?;
        buf.put_i32(size);
        // lower bound
        buf.put_i32(1);
    }

    encode_elements(items, dims.len(), elem, buf)
}

fn encode_elements(
    items: &[Value],
    depth: usize,
    elem: Oid,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    for item in items {
        match (depth > 1, item) {
            (true, Value::Array(inner)) => encode_elements(inner, depth - 1, elem, buf)?,
            (true, _) => return Err(EncodeError::new("array is not rectangular")),
            (false, Value::Null) => buf.put_i32(-1),
            (false, item) => {
                let offset = buf.len();
                buf.put_i32(0);
                value::encode_binary(item, elem, buf)?;
                let len = (buf.len() - offset - 4) as i32;
                (&mut buf[offset..]).put_i32(len);
            }
        }
    }
    Ok(())
}

/// Render the `{...}` text literal.
pub(crate) fn encode_text(items: &[Value], elem: Oid) -> Result<String, EncodeError> {
    let mut out = String::new();
    encode_text_into(items, elem, &mut out)?;
    Ok(out)
}

fn encode_text_into(items: &[Value], elem: Oid, out: &mut String) -> Result<(), EncodeError> {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i != 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("null"),
            Value::Array(inner) => encode_text_into(inner, elem, out)?,
            item => {
                let text = value::encode_text(item, elem)?;
                if needs_quoting(&text) {
                    out.push('"');
                    for c in text.chars() {
                        if matches!(c, '\\' | '"') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
    out.push('}');
    Ok(())
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || text.eq_ignore_ascii_case("null")
        || text
            .chars()
            .any(|c| matches!(c, '\\' | '"' | ',' | '{' | '}' | ' '))
}

/// Parse the `{...}` text literal.
pub(crate) fn decode_text(
    body: ByteStr,
    elem: Oid,
    registry: &TypeRegistry,
) -> Result<Value, DecodeError> {
    let trimmed = body.trim();
    let mut chars = trimmed.char_indices().peekable();
    let value = parse_text(trimmed, &mut chars, elem, registry)?;
    match chars.next() {
        None => Ok(value),
        Some(_) => Err(DecodeError::invalid("trailing content after array literal")),
    }
}

type Chars<'s> = std::iter::Peekable<std::str::CharIndices<'s>>;

fn parse_text(
    body: &str,
    chars: &mut Chars,
    elem: Oid,
    registry: &TypeRegistry,
) -> Result<Value, DecodeError> {
    match chars.next() {
        Some((_, '{')) => { }
        _ => return Err(DecodeError::invalid("array literal must start with '{'")),
    }

    let mut out = Vec::new();

    if let Some((_, '}')) = chars.peek() {
        chars.next();
        return Ok(Value::Array(out));
    }

    loop {
        match chars.peek() {
            Some((_, '{')) => out.push(parse_text(body, chars, elem, registry)?),
            Some((_, '"')) => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\\')) => match chars.next() {
                            Some((_, c)) => text.push(c),
                            None => return Err(DecodeError::invalid("unterminated array string")),
                        },
                        Some((_, '"')) => break,
                        Some((_, c)) => text.push(c),
                        None => return Err(DecodeError::invalid("unterminated array string")),
                    }
                }
                out.push(decode_element(text, elem, registry)?);
            }
            Some(&(start, _)) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if matches!(c, ',' | '}') {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let text = &body[start..end];
                if text.eq_ignore_ascii_case("null") {
                    out.push(Value::Null);
                } else {
                    out.push(decode_element(text, elem, registry)?);
                }
            }
            None => return Err(DecodeError::invalid("unterminated array literal")),
        }

        match chars.next() {
            Some((_, ',')) => continue,
            Some((_, '}')) => return Ok(Value::Array(out)),
            _ => return Err(DecodeError::invalid("malformed array literal")),
        }
    }
}

fn decode_element(
    text: impl Into<String>,
    elem: Oid,
    registry: &TypeRegistry,
) -> Result<Value, DecodeError> {
    let raw = Bytes::from(text.into().into_bytes());
    value::decode(elem, PgFormat::Text, &raw, registry)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    fn int_array(items: &[Value]) -> Bytes {
        let mut buf = BytesMut::new();
        encode_binary(items, oid::INT4, &mut buf).unwrap();
        buf.freeze()
    }

    fn ints(items: &[i32]) -> Value {
        Value::Array(items.iter().copied().map(Value::I32).collect())
    }

    #[test]
    fn three_dimensions_roundtrip() {
        // {{{1,2},{3,4}},{{5,6},{7,8}}}
        let value = Value::Array(vec![
            Value::Array(vec![ints(&[1, 2]), ints(&[3, 4])]),
            Value::Array(vec![ints(&[5, 6]), ints(&[7, 8])]),
        ]);
        let Value::Array(items) = &value else { unreachable!() };

        let body = int_array(items);
        // ndim 3, 3 dimension descriptors, 8 elements
        assert_eq!((&body[..4]).get_i32(), 3);
        assert_eq!(body.len(), 12 + 3 * 8 + 8 * (4 + 4));

        let registry = TypeRegistry::default();
        let decoded = decode_binary(body, oid::INT4, &registry).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn empty_and_null_elements() {
        let registry = TypeRegistry::default();

        let body = int_array(&[]);
        // postgres writes ndim 0 for empty arrays; ours writes one empty
        // dimension, both must decode to an empty array
        assert_eq!(
            decode_binary(body, oid::INT4, &registry).unwrap(),
            Value::Array(Vec::new()),
        );
        let mut zero_dim = BytesMut::new();
        zero_dim.put_i32(0);
        zero_dim.put_i32(0);
        zero_dim.put_u32(oid::INT4);
        assert_eq!(
            decode_binary(zero_dim.freeze(), oid::INT4, &registry).unwrap(),
            Value::Array(Vec::new()),
        );

        let with_null = [Value::I32(1), Value::Null, Value::I32(3)];
        let decoded = decode_binary(int_array(&with_null), oid::INT4, &registry).unwrap();
        assert_eq!(decoded, Value::Array(with_null.to_vec()));
    }

    #[test]
    fn ragged_array_rejected() {
        let ragged = [ints(&[1, 2]), ints(&[3])];
        encode_binary(&ragged, oid::INT4, &mut BytesMut::new()).unwrap_err();
    }

    #[test]
    fn text_literal_three_dimensions() {
        let registry = TypeRegistry::default();
        let decoded = decode_text(
            "{{{1,2},{3,4}},{{5,6},{7,8}}}".into(),
            oid::INT4,
            &registry,
        )
        .unwrap();
        assert_eq!(
            decoded,
            Value::Array(vec![
                Value::Array(vec![ints(&[1, 2]), ints(&[3, 4])]),
                Value::Array(vec![ints(&[5, 6]), ints(&[7, 8])]),
            ]),
        );
    }

    #[test]
    fn text_literal_escapes() {
        let registry = TypeRegistry::default();
        let value = Value::Array(vec![
            Value::Text("plain".into()),
            Value::Text("with \"quotes\" and \\slash".into()),
            Value::Text("with,comma".into()),
            Value::Null,
        ]);
        let Value::Array(items) = &value else { unreachable!() };

        let text = encode_text(items, oid::TEXT).unwrap();
        assert_eq!(
            text,
            r#"{plain,"with \"quotes\" and \\slash","with,comma",null}"#,
        );
        assert_eq!(decode_text(text.into(), oid::TEXT, &registry).unwrap(), value);
    }

    #[test]
    fn text_literal_quoted_null_is_a_string() {
        let registry = TypeRegistry::default();
        let decoded = decode_text(r#"{null,"null"}"#.into(), oid::TEXT, &registry).unwrap();
        assert_eq!(
            decoded,
            Value::Array(vec![Value::Null, Value::Text("null".into())]),
        );
    }
}
