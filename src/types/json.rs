use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    encode::{Encode, Encoded, Param},
    postgres::{PgType, oid},
    row::{Column, DecodeError},
};

/// Decode and Encode postgres json value.
///
/// # Panics
///
/// Note that when performing [`Encode`], if [`Serialize`] implementation decide
/// to fail, it will panics.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<T> PgType for Json<T> {
    /// jsonb, Binary JSON
    const OID: crate::postgres::Oid = oid::JSONB;
}

impl<T> crate::row::Decode for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let json = column.oid() == oid::JSON;
        let jsonb = column.oid() == oid::JSONB;
        if !json && !jsonb {
            return Err(DecodeError::OidMismatch);
        }
        let value = column.try_into_value()?;
        let value = match jsonb {
            true => match value.split_first() {
                // any jsonb version other than 1 decodes as null
                Some((1, json)) => json,
                _ => return Err(DecodeError::Null),
            },
            false => &value[..],
        };
        serde_json::from_slice(value).map(Json).map_err(Into::into)
    }
}

impl<T: Serialize> Encode<'static> for Json<T> {
    fn encode(self) -> Param<'static> {
        let mut raw = vec![1u8];
        serde_json::to_writer(&mut raw, &self.0).unwrap();
        Param::Typed(Encoded::copy_from_slice(&raw, Self::OID))
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        postgres::{Oid, oid},
        row::{
            Row, RowDescription,
            test::{datarow, description},
        },
        types::TypeRegistry,
    };

    fn row(oid: Oid, value: &[u8]) -> Row {
        let desc = Arc::new(
            RowDescription::parse(
                description(&[("doc", oid)]),
                Arc::new(TypeRegistry::default()),
                None,
            )
            .unwrap(),
        );
        Row::decode_datarow(&desc, datarow(&[Some(value)])).unwrap()
    }

    #[test]
    fn jsonb_version_is_checked() {
        let Json(doc): Json<serde_json::Value> =
            row(oid::JSONB, b"\x01{\"a\":1}").try_get(0).unwrap();
        assert_eq!(doc, serde_json::json!({"a": 1}));

        // any other version decodes as null
        row(oid::JSONB, b"\x02{\"a\":1}")
            .try_get::<_, Json<serde_json::Value>>(0)
            .unwrap_err();

        // plain json carries no version prefix
        let Json(doc): Json<serde_json::Value> =
            row(oid::JSON, b"{\"a\":1}").try_get(0).unwrap();
        assert_eq!(doc, serde_json::json!({"a": 1}));
    }
}
