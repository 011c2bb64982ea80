//! Query parameter encoding.
use bytes::{Buf, Bytes};

use crate::{
    postgres::{Oid, PgFormat, PgType},
    value::{self, Value},
};

const INLINE_LEN: usize = 15;

/// Borrowed, inline, or shared parameter bytes.
pub(crate) enum ValueRef<'a> {
    Slice(&'a [u8]),
    Inline {
        offset: usize,
        value: [u8; INLINE_LEN],
    },
    Bytes(Bytes),
}

impl ValueRef<'_> {
    pub fn inline(slice: &[u8]) -> ValueRef<'static> {
        let len = slice.len();
        assert!(len < INLINE_LEN, "inline slice is too large");
        let mut value = [0u8; INLINE_LEN];
        value[INLINE_LEN - len..].copy_from_slice(slice);
        ValueRef::Inline { offset: INLINE_LEN - len, value }
    }

    fn to_bytes(&self) -> Bytes {
        match self {
            ValueRef::Slice(items) => Bytes::copy_from_slice(items),
            ValueRef::Inline { offset, value } => Bytes::copy_from_slice(&value[*offset..]),
            ValueRef::Bytes(bytes) => bytes.clone(),
        }
    }

    fn into_owned(self) -> ValueRef<'static> {
        match self {
            ValueRef::Slice(items) => ValueRef::Bytes(Bytes::copy_from_slice(items)),
            ValueRef::Inline { offset, value } => ValueRef::Inline { offset, value },
            ValueRef::Bytes(bytes) => ValueRef::Bytes(bytes),
        }
    }
}

impl Buf for ValueRef<'_> {
    fn remaining(&self) -> usize {
        match self {
            ValueRef::Slice(items) => Buf::remaining(items),
            ValueRef::Inline { offset, .. } => INLINE_LEN - offset,
            ValueRef::Bytes(bytes) => Buf::remaining(bytes),
        }
    }

    fn chunk(&self) -> &[u8] {
        match self {
            ValueRef::Slice(items) => Buf::chunk(items),
            ValueRef::Inline { offset, value } => &value[*offset..],
            ValueRef::Bytes(bytes) => Buf::chunk(bytes),
        }
    }

    fn advance(&mut self, cnt: usize) {
        match self {
            ValueRef::Slice(items) => Buf::advance(items, cnt),
            ValueRef::Inline { offset, .. } => *offset += cnt,
            ValueRef::Bytes(bytes) => Buf::advance(bytes, cnt),
        }
    }
}

impl std::fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&crate::common::Lossy(self.chunk()), f)
    }
}

/// A parameter already encoded in binary format, carrying its own oid.
pub struct Encoded<'q> {
    value: ValueRef<'q>,
    is_null: bool,
    oid: Oid,
}

impl<'q> Encoded<'q> {
    /// Create [`Encoded`] from borrowed slice.
    pub fn from_slice(slice: &'q [u8], oid: Oid) -> Encoded<'q> {
        Encoded {
            value: ValueRef::Slice(slice),
            is_null: false,
            oid,
        }
    }

    /// Create heap allocated [`Encoded`] by copying given slice.
    pub fn copy_from_slice(slice: &[u8], oid: Oid) -> Encoded<'static> {
        Encoded {
            value: ValueRef::Bytes(Bytes::copy_from_slice(slice)),
            is_null: false,
            oid,
        }
    }

    /// Create [`Encoded`] `NULL`.
    pub fn null() -> Encoded<'static> {
        Encoded {
            value: ValueRef::Slice(&[]),
            is_null: true,
            oid: 0,
        }
    }

    /// Returns this type `oid`, or `0` for `NULL`.
    pub fn oid(&self) -> Oid {
        match self.is_null {
            true => 0,
            false => self.oid,
        }
    }
}

impl std::fmt::Debug for Encoded<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Encoded")
            .field(if self.is_null { &"NULL" } else { &self.value })
            .field(&self.oid)
            .finish()
    }
}

/// One query parameter.
///
/// [`Typed`][Param::Typed] parameters carry their binary encoding and oid up
/// front. [`Dynamic`][Param::Dynamic] parameters are [`Value`]s whose encoding
/// is deferred until the parameter oids are learned from
/// `ParameterDescription`, so `$1::int8` can receive a plain integer without
/// the caller spelling the width.
#[derive(Debug)]
pub enum Param<'q> {
    Typed(Encoded<'q>),
    Dynamic(Value),
}

impl Param<'_> {
    /// Oid to prespecify in `Parse`, `0` leaves the type to the server.
    pub(crate) fn declared_oid(&self) -> Oid {
        match self {
            Param::Typed(e) => e.oid(),
            Param::Dynamic(_) => 0,
        }
    }

    pub(crate) fn into_owned(self) -> Param<'static> {
        match self {
            Param::Typed(e) => Param::Typed(Encoded {
                value: e.value.into_owned(),
                is_null: e.is_null,
                oid: e.oid,
            }),
            Param::Dynamic(v) => Param::Dynamic(v),
        }
    }

    /// Produce the wire bytes for `Bind`, `None` for NULL.
    ///
    /// `oid` is the parameter type the statement was described with; typed
    /// parameters ignore it, their bytes pass through unchanged.
    pub(crate) fn encode(
        &self,
        oid: Oid,
        format: PgFormat,
    ) -> Result<Option<Bytes>, value::EncodeError> {
        match self {
            Param::Typed(e) => match e.is_null {
                true => Ok(None),
                false => Ok(Some(e.value.to_bytes())),
            },
            Param::Dynamic(v) => value::encode(v, oid, format),
        }
    }
}

/// Value that can be bound to a sql parameter.
pub trait Encode<'q> {
    /// Encode the value.
    fn encode(self) -> Param<'q>;
}

macro_rules! encode {
    (<$lf:tt,$ty:ty>$pat:tt => $body:expr) => {
        impl<$lf> Encode<$lf> for &$lf $ty {
            fn encode($pat) -> Param<$lf> {
                Param::Typed(Encoded {
                    value: $body,
                    oid: <$ty>::OID,
                    is_null: false,
                })
            }
        }
    };
    (<$ty:ty>$pat:tt => $body:expr) => {
        impl Encode<'static> for $ty {
            fn encode($pat) -> Param<'static> {
                Param::Typed(Encoded {
                    value: $body,
                    oid: <$ty>::OID,
                    is_null: false,
                })
            }
        }
    };
}

encode!(<bool>self => ValueRef::inline(&[self as u8]));
encode!(<i16>self => ValueRef::inline(&self.to_be_bytes()));
encode!(<i32>self => ValueRef::inline(&self.to_be_bytes()));
encode!(<i64>self => ValueRef::inline(&self.to_be_bytes()));
encode!(<f32>self => ValueRef::inline(&self.to_be_bytes()));
encode!(<f64>self => ValueRef::inline(&self.to_be_bytes()));
encode!(<'a,str>self => ValueRef::Slice(self.as_bytes()));
encode!(<'a,String>self => ValueRef::Slice(self.as_bytes()));
encode!(<'a,[u8]>self => ValueRef::Slice(self));
encode!(<bytes::Bytes>self => ValueRef::Bytes(self));

impl Encode<'static> for String {
    fn encode(self) -> Param<'static> {
        Param::Typed(Encoded {
            value: ValueRef::Bytes(Bytes::from(self.into_bytes())),
            oid: String::OID,
            is_null: false,
        })
    }
}

impl Encode<'static> for uuid::Uuid {
    fn encode(self) -> Param<'static> {
        Param::Typed(Encoded::copy_from_slice(self.as_bytes(), uuid::Uuid::OID))
    }
}

impl Encode<'static> for Value {
    fn encode(self) -> Param<'static> {
        Param::Dynamic(self)
    }
}

impl<'q, T: Encode<'q>> Encode<'q> for Option<T> {
    fn encode(self) -> Param<'q> {
        match self {
            Some(value) => value.encode(),
            None => Param::Typed(Encoded::null()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    #[test]
    fn typed_scalars() {
        let Param::Typed(p) = 7i32.encode() else { panic!() };
        assert_eq!(p.oid(), oid::INT4);
        assert_eq!(p.value.chunk(), [0, 0, 0, 7]);

        let Param::Typed(p) = "foo".encode() else { panic!() };
        assert_eq!(p.oid(), oid::TEXT);
        assert_eq!(p.value.chunk(), b"foo");

        let Param::Typed(p) = Option::<i32>::None.encode() else { panic!() };
        assert_eq!(p.oid(), 0);
        assert!(p.is_null);
    }

    #[test]
    fn owned_param_outlives_source() {
        let sql = String::from("borrowed");
        let param = sql.as_str().encode();
        let owned: Param<'static> = param.into_owned();
        drop(sql);
        assert_eq!(
            owned.encode(oid::TEXT, PgFormat::Binary).unwrap().unwrap(),
            Bytes::from_static(b"borrowed"),
        );
    }
}
