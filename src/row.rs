//! Postgres row operation.
//!
//! - [`RowDescription`] and [`ColumnDesc`]
//! - [`Row`] and [`Column`]
//! - [`FromRow`] and [`Decode`]
//! - [`Index`] and [`DecodeError`]
use bytes::{Buf, Bytes};
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    common::{ByteStr, unit_error},
    postgres::{Oid, PgFormat, ProtocolError, elem_oid, nul_str},
    types::TypeRegistry,
    value::{self, Value},
};

unit_error! {
    /// An error when [`fetch_one`][crate::query::Query::fetch_one] yields no row.
    pub struct RowNotFound("row not found");
}

/// Column name rewrite applied to every row description.
pub type NameTransform = dyn Fn(&str) -> String + Send + Sync;

/// One column of a [`RowDescription`].
#[derive(Debug, Clone)]
pub struct ColumnDesc {
    pub(crate) name: ByteStr,
    /// oid as sent on the wire
    pub(crate) oid: Oid,
    /// element oid for array columns, same as `oid` otherwise
    pub(crate) elem: Oid,
    pub(crate) is_array: bool,
    /// a caller registered reader will decode this column
    pub(crate) custom: bool,
    pub(crate) format: PgFormat,
}

impl ColumnDesc {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The element oid for array columns, same as [`oid`][ColumnDesc::oid]
    /// otherwise.
    pub fn element_oid(&self) -> Oid {
        self.elem
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    /// Whether a caller registered reader decodes this column.
    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }
}

/// The column layout of one query's rows.
pub struct RowDescription {
    columns: Vec<ColumnDesc>,
    registry: Arc<TypeRegistry>,
}

impl RowDescription {
    /// Parse a `RowDescription` message body.
    pub(crate) fn parse(
        mut body: Bytes,
        registry: Arc<TypeRegistry>,
        transform: Option<&NameTransform>,
    ) -> Result<Self, ProtocolError> {
        if body.remaining() < 2 {
            return Err(ProtocolError::new("RowDescription body truncated"));
        }
        let field_len = body.get_u16();
        let mut columns = Vec::with_capacity(field_len as usize);

        for _ in 0..field_len {
            let name = nul_str(&mut body)?;
            if body.remaining() < 18 {
                return Err(ProtocolError::new("RowDescription body truncated"));
            }
            let _table_oid = body.get_u32();
            let _attr_num = body.get_i16();
            let oid = body.get_u32();
            let _type_size = body.get_i16();
            let _type_modifier = body.get_i32();
            let format = PgFormat::from_code(body.get_u16());

            let name = match transform {
                Some(transform) => ByteStr::from(transform(&name)),
                None => name,
            };
            let (elem, is_array) = match elem_oid(oid) {
                Some(elem) => (elem, true),
                None => (oid, false),
            };
            let custom = registry.is_registered(oid) || registry.is_registered(elem);

            columns.push(ColumnDesc { name, oid, elem, is_array, custom, format });
        }

        Ok(Self { columns, registry })
    }

    /// The zero column description used for `NoData` statements.
    pub(crate) fn no_data(registry: Arc<TypeRegistry>) -> Self {
        Self { columns: Vec::new(), registry }
    }

    /// Override the format codes.
    ///
    /// A `RowDescription` from the statement variant of Describe always
    /// carries format zero; the actual format is chosen later at `Bind`.
    pub(crate) fn set_formats(&mut self, format: PgFormat) {
        for column in &mut self.columns {
            column.format = format;
        }
    }

    pub(crate) fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if rows carry no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name())
    }

    /// Find a column position by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| &c.name == name)
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }
}

impl Clone for RowDescription {
    fn clone(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl fmt::Debug for RowDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.columns).finish()
    }
}

/// Postgres row.
///
/// Cloning is cheap, the column values stay shared slices of the frame they
/// arrived in.
#[derive(Clone)]
pub struct Row {
    desc: Arc<RowDescription>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(desc: Arc<RowDescription>, values: Vec<Option<Bytes>>) -> Self {
        Self { desc, values }
    }

    /// Parse a `DataRow` message body against its row description.
    pub(crate) fn decode_datarow(
        desc: &Arc<RowDescription>,
        mut body: Bytes,
    ) -> Result<Self, ProtocolError> {
        if body.remaining() < 2 {
            return Err(ProtocolError::new("DataRow body truncated"));
        }
        let field_len = body.get_u16();
        if field_len as usize != desc.len() {
            return Err(ProtocolError::new(
                "RowDescription len missmatch with DataRow len",
            ));
        }

        let mut values = Vec::with_capacity(field_len as usize);
        for _ in 0..field_len {
            if body.remaining() < 4 {
                return Err(ProtocolError::new("DataRow body truncated"));
            }
            let len = body.get_i32();
            values.push(match len {
                -1 => None,
                len if len >= 0 && body.remaining() >= len as usize => {
                    Some(body.split_to(len as usize))
                }
                _ => return Err(ProtocolError::new("DataRow body truncated")),
            });
        }

        Ok(Self { desc: desc.clone(), values })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// The row's column layout.
    pub fn description(&self) -> &RowDescription {
        &self.desc
    }

    fn column<I: Index>(&self, idx: I) -> Result<Column, DecodeError> {
        let nth = idx.position(&self.desc)?;
        Ok(Column {
            desc: self.desc.columns[nth].clone(),
            registry: self.desc.registry().clone(),
            value: self.values[nth].clone(),
        })
    }

    /// Dynamically decode a column by position or name.
    pub fn value<I: Index>(&self, idx: I) -> Result<Value, DecodeError> {
        self.try_get(idx)
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.column(idx)?)
    }

    /// Dynamically decode every column, in order.
    pub fn values(&self) -> Result<Vec<Value>, DecodeError> {
        (0..self.len()).map(|i| self.value(i)).collect()
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (desc, value) in self.desc.columns().iter().zip(&self.values) {
            dbg.key(&desc.name());
            match value {
                None => dbg.value(&format_args!("NULL")),
                Some(value) => dbg.value(&crate::common::Lossy(value)),
            };
        }
        dbg.finish()
    }
}

/// Postgres column.
#[derive(Debug, Clone)]
pub struct Column {
    desc: ColumnDesc,
    registry: Arc<TypeRegistry>,
    value: Option<Bytes>,
}

impl Column {
    /// Returns column [`Oid`].
    pub fn oid(&self) -> Oid {
        self.desc.oid
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        self.desc.name()
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Extract the inner bytes as slice.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Consume self into the inner [`Bytes`].
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Try consume self into the inner [`Bytes`].
    ///
    /// Return [`DecodeError::Null`] if value is `NULL`.
    pub fn try_into_value(self) -> Result<Bytes, DecodeError> {
        self.value.ok_or(DecodeError::Null)
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);

/// A type that can be constructed from [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

impl Decode for () {
    fn decode(_: Column) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl Decode for Value {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match &column.value {
            None => Ok(Value::Null),
            Some(raw) => value::decode(
                column.desc.oid,
                column.desc.format,
                raw,
                &column.registry,
            ),
        }
    }
}

// keep the common conversions; everything else goes through `Value`
impl Decode for bool {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::Bool(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

macro_rules! decode_int {
    ($ty:ty) => {
        impl Decode for $ty {
            fn decode(column: Column) -> Result<Self, DecodeError> {
                let out = match Value::decode(column)? {
                    Value::I16(v) => <$ty>::try_from(v as i64),
                    Value::I32(v) => <$ty>::try_from(v as i64),
                    Value::I64(v) => <$ty>::try_from(v),
                    Value::Null => return Err(DecodeError::Null),
                    _ => return Err(DecodeError::OidMismatch),
                };
                out.map_err(|_| DecodeError::invalid("integer out of range"))
            }
        }
    };
}

decode_int!(i16);
decode_int!(i32);
decode_int!(i64);

impl Decode for f32 {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::F32(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

impl Decode for f64 {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::F64(v) => Ok(v),
            Value::F32(v) => Ok(v.into()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

impl Decode for String {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::Text(v) => Ok(v.as_str().into()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

impl Decode for Bytes {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::Bytes(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

impl Decode for uuid::Uuid {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match Value::decode(column)? {
            Value::Uuid(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(DecodeError::OidMismatch),
        }
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError> {
        match self < desc.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, desc: &RowDescription) -> Result<usize, DecodeError> {
        desc.position(self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Oid requested missmatch.
    OidMismatch,
    /// Row is null.
    Null,
    /// Failed to deserialize using `serde_json`.
    Json(serde_json::error::Error),
    /// Malformed wire value.
    Invalid(Cow<'static,str>),
}

impl DecodeError {
    pub(crate) fn invalid(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Invalid(reason.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::OidMismatch => write!(f, "data type missmatch"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Json(e) => write!(f, "{e}"),
            Self::Invalid(reason) => write!(f, "{reason}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));
from!(<serde_json::error::Error>e => Self::Json(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::postgres::oid;

    /// Build a `RowDescription` message body.
    pub(crate) fn description(columns: &[(&str, Oid)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(columns.len() as u16);
        for (name, oid) in columns {
            buf.put(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0); // table oid
            buf.put_i16(0); // attribute number
            buf.put_u32(*oid);
            buf.put_i16(-1); // type size
            buf.put_i32(-1); // type modifier
            buf.put_u16(1); // binary
        }
        buf.freeze()
    }

    /// Build a `DataRow` message body.
    pub(crate) fn datarow(values: &[Option<&[u8]>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put(*value);
                }
                None => buf.put_i32(-1),
            }
        }
        buf.freeze()
    }

    fn parse(columns: &[(&str, Oid)]) -> Arc<RowDescription> {
        Arc::new(
            RowDescription::parse(
                description(columns),
                Arc::new(TypeRegistry::default()),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn description_layout() {
        let desc = parse(&[("id", oid::INT4), ("tags", oid::TEXT_ARRAY)]);
        assert_eq!(desc.len(), 2);
        assert_eq!(desc.names().collect::<Vec<_>>(), ["id", "tags"]);
        assert_eq!(desc.position("tags"), Some(1));
        assert_eq!(desc.position("nope"), None);

        let tags = &desc.columns()[1];
        assert!(tags.is_array);
        assert_eq!(tags.elem, oid::TEXT);
        assert_eq!(tags.oid, oid::TEXT_ARRAY);
    }

    #[test]
    fn name_transform_applies() {
        let body = description(&[("user_id", oid::INT4)]);
        let transform = |name: &str| name.replace('_', "-");
        let desc = RowDescription::parse(
            body,
            Arc::new(TypeRegistry::default()),
            Some(&transform),
        )
        .unwrap();
        assert_eq!(desc.names().collect::<Vec<_>>(), ["user-id"]);
    }

    #[test]
    fn row_access() {
        let desc = parse(&[("id", oid::INT4), ("name", oid::TEXT)]);
        let row = Row::decode_datarow(
            &desc,
            datarow(&[Some(&[0, 0, 0, 42]), Some(b"esther")]),
        )
        .unwrap();

        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 42);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "esther");
        assert_eq!(row.value("id").unwrap(), Value::I32(42));
        assert_eq!(
            row.decode::<(i32, String)>().unwrap(),
            (42, String::from("esther")),
        );
    }

    #[test]
    fn null_handling() {
        let desc = parse(&[("id", oid::INT4)]);
        let row = Row::decode_datarow(&desc, datarow(&[None])).unwrap();
        assert_eq!(row.value(0).unwrap(), Value::Null);
        assert_eq!(row.try_get::<_, Option<i32>>(0).unwrap(), None);
        assert!(matches!(
            row.try_get::<_, i32>(0).unwrap_err(),
            DecodeError::Null,
        ));
        assert!(matches!(
            row.try_get::<_, i32>(3).unwrap_err(),
            DecodeError::IndexOutOfBounds(3),
        ));
    }

    #[test]
    fn datarow_length_mismatch() {
        let desc = parse(&[("id", oid::INT4)]);
        Row::decode_datarow(&desc, datarow(&[Some(&[0, 0, 0, 1]), None])).unwrap_err();
    }
}
