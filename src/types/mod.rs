//! Type integration: the per-oid reader registry and codecs for external types.
//!
//! - [`TypeRegistry`] for caller supplied readers
//! - [`Json`] wrapper for [`serde`] types
//! - [`time`][::time] date and timestamp codecs
use std::collections::HashMap;

use bytes::Bytes;

use crate::{
    postgres::{Oid, PgFormat, USER_OID_CUTOFF},
    row::DecodeError,
    value::Value,
};

pub(crate) mod array;
pub(crate) mod time;

mod json;
pub use json::Json;

/// A caller supplied decoder for one oid.
///
/// Receives the raw column bytes and the wire format the column used.
pub type TypeReader =
    dyn Fn(&Bytes, PgFormat) -> Result<Value, DecodeError> + Send + Sync + 'static;

/// Per-oid custom readers.
///
/// A registered reader takes priority over the builtin decoding for its oid,
/// and is the only way a user defined type (oid at or above 16384) decodes as
/// anything other than [`Value::Null`].
#[derive(Default)]
pub struct TypeRegistry {
    readers: HashMap<Oid, Box<TypeReader>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader for `oid`.
    ///
    /// Replaces a previous reader for the same oid.
    pub fn register<F>(&mut self, oid: Oid, reader: F)
    where
        F: Fn(&Bytes, PgFormat) -> Result<Value, DecodeError> + Send + Sync + 'static,
    {
        self.readers.insert(oid, Box::new(reader));
    }

    pub(crate) fn get(&self, oid: Oid) -> Option<&TypeReader> {
        self.readers.get(&oid).map(|e| &**e)
    }

    /// Returns `true` if values of `oid` decode through a registered reader.
    pub fn is_registered(&self, oid: Oid) -> bool {
        self.readers.contains_key(&oid)
    }

    /// Returns `true` if `oid` identifies a user defined type.
    pub const fn is_user_oid(oid: Oid) -> bool {
        oid >= USER_OID_CUTOFF
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("readers", &self.readers.keys())
            .finish()
    }
}
