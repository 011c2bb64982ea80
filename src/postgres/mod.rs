//! Postgres wire protocol.
//!
//! <https://www.postgresql.org/docs/current/protocol.html>
use bytes::{Buf, Bytes};
use std::borrow::Cow;

use crate::common::ByteStr;

pub mod frontend;
pub mod backend;
mod pg_type;

pub use backend::{BackendMessage, BackendProtocol};
pub use frontend::FrontendProtocol;
pub use pg_type::{PgType, elem_oid, oid};

/// Split a nul terminated string off the front of a message body.
///
/// Backend strings live inside an already framed message, so a missing
/// terminator or non utf8 content means the frame is corrupt, not short.
pub(crate) fn nul_str(body: &mut Bytes) -> Result<ByteStr, ProtocolError> {
    let Some(end) = body.iter().position(|b| *b == b'\0') else {
        return Err(ProtocolError::new("backend string is not nul terminated"));
    };
    let string = body.split_to(end);
    body.advance(1); // nul
    ByteStr::from_utf8(string).map_err(|err| ProtocolError::new(err.to_string()))
}

/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// Oids at or above this are user defined types, composite types, enums, and
/// the like. Without a registered reader they decode as null.
pub const USER_OID_CUTOFF: Oid = 16384;

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PgFormat {
    Text,
    #[default]
    Binary,
}

impl PgFormat {
    pub const fn format_code(self) -> u16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Binary,
            _ => Self::Text,
        }
    }
}

/// An error when a backend message cannot be interpreted.
pub struct ProtocolError {
    reason: Cow<'static, str>,
}

impl ProtocolError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    pub(crate) fn unknown(msgtype: u8) -> Self {
        Self::new(format!(
            "unknown message type {:?}(0x{msgtype:02x})",
            char::from(msgtype),
        ))
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> Self {
        Self::new(format!(
            "expected {} message, found {}",
            BackendMessage::message_name(expect),
            BackendMessage::message_name(found),
        ))
    }

    pub(crate) fn unexpected_phase(msgtype: u8, phase: &str) -> Self {
        Self::new(format!(
            "unexpected {} message in {phase}",
            BackendMessage::message_name(msgtype),
        ))
    }
}

impl std::error::Error for ProtocolError { }

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}
