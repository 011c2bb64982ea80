use super::Oid;

/// A type that have corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

/// Builtin type oids from the `pg_type` catalog.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const JSON: Oid = 114;
    pub const POINT: Oid = 600;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const UUID: Oid = 2950;
    pub const JSONB: Oid = 3802;

    pub const JSON_ARRAY: Oid = 199;
    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const CHAR_ARRAY: Oid = 1002;
    pub const NAME_ARRAY: Oid = 1003;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const BPCHAR_ARRAY: Oid = 1014;
    pub const VARCHAR_ARRAY: Oid = 1015;
    pub const INT8_ARRAY: Oid = 1016;
    pub const POINT_ARRAY: Oid = 1017;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const OID_ARRAY: Oid = 1028;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const DATE_ARRAY: Oid = 1182;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const UUID_ARRAY: Oid = 2951;
    pub const JSONB_ARRAY: Oid = 3807;
}

/// Map an array oid to its element oid.
pub const fn elem_oid(array: Oid) -> Option<Oid> {
    use oid::*;
    Some(match array {
        JSON_ARRAY => JSON,
        BOOL_ARRAY => BOOL,
        BYTEA_ARRAY => BYTEA,
        CHAR_ARRAY => CHAR,
        NAME_ARRAY => NAME,
        INT2_ARRAY => INT2,
        INT4_ARRAY => INT4,
        TEXT_ARRAY => TEXT,
        BPCHAR_ARRAY => BPCHAR,
        VARCHAR_ARRAY => VARCHAR,
        INT8_ARRAY => INT8,
        POINT_ARRAY => POINT,
        FLOAT4_ARRAY => FLOAT4,
        FLOAT8_ARRAY => FLOAT8,
        OID_ARRAY => OID,
        TIMESTAMP_ARRAY => TIMESTAMP,
        DATE_ARRAY => DATE,
        TIMESTAMPTZ_ARRAY => TIMESTAMPTZ,
        UUID_ARRAY => UUID,
        JSONB_ARRAY => JSONB,
        _ => return None,
    })
}

macro_rules! pg_type {
    ($ty:ty, $oid:expr $(, $doc:literal)? ) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;
        }
    };
}

pg_type!(bool, oid::BOOL);
pg_type!(i16, oid::INT2, "`int2` -32 thousand to 32 thousand, 2-byte storage");
pg_type!(i32, oid::INT4, "`int4` -2 billion to 2 billion integer, 4-byte storage");
pg_type!(i64, oid::INT8, "`int8` ~18 digit integer, 8-byte storage");
pg_type!(f32, oid::FLOAT4, "`float4` single-precision floating point number, 4-byte storage");
pg_type!(f64, oid::FLOAT8, "`float8` double-precision floating point number, 8-byte storage");
pg_type!(str, oid::TEXT, "`text` variable-length string, no limit specified");
pg_type!(String, oid::TEXT, "`text` variable-length string, no limit specified");
pg_type!([u8], oid::BYTEA, "`bytea` variable-length string, binary values escaped");
pg_type!(bytes::Bytes, oid::BYTEA, "`bytea` variable-length string, binary values escaped");
pg_type!(uuid::Uuid, oid::UUID);

impl PgType for time::Date {
    /// date
    const OID: Oid = oid::DATE;
}

impl PgType for time::PrimitiveDateTime {
    /// date and time
    const OID: Oid = oid::TIMESTAMP;
}

impl PgType for time::UtcDateTime {
    /// date and time with timezone
    const OID: Oid = oid::TIMESTAMPTZ;
}
