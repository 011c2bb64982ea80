//! `pgpipe` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io, str::Utf8Error, time::Duration};

use crate::{
    postgres::{ProtocolError, backend::ErrorResponse},
    row::{DecodeError, RowNotFound},
    sasl::SaslError,
    value::EncodeError,
};

/// A specialized [`Result`] type for `pgpipe` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgpipe` library.
///
/// A backtrace is captured at construction, which for query failures is the
/// submission site.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The structured server error, when the server rejected a query.
    pub fn as_db(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn timeout(elapsed: Duration) -> Self {
        TimeoutError { ms: elapsed.as_millis() }.into()
    }

    pub(crate) fn config(reason: impl Into<Cow<'static, str>>) -> Self {
        ConfigError { reason: reason.into() }.into()
    }
}

/// All possible error kind from `pgpipe` library.
pub enum ErrorKind {
    /// Invalid url, ssl mode, or parameter encoding.
    Config(ConfigError),
    /// The byte stream deviates from the protocol.
    Protocol(ProtocolError),
    /// The underlying socket failed.
    Io(io::Error),
    /// The server reported an error.
    Database(DatabaseError),
    /// The connect timeout elapsed.
    Timeout(TimeoutError),
    /// A column value failed to decode.
    Decode(DecodeError),
    Utf8(Utf8Error),
    /// `fetch_one` on a query that returned no row.
    RowNotFound(RowNotFound),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<TimeoutError>e => ErrorKind::Timeout(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<SaslError>e => ErrorKind::Protocol(ProtocolError::new(e.to_string())));
from!(<EncodeError>e => ErrorKind::Config(ConfigError { reason: e.to_string().into() }));

impl From<ErrorResponse> for Error {
    fn from(err: ErrorResponse) -> Self {
        DatabaseError::parse(&err).into()
    }
}

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Invalid configuration or parameter.
pub struct ConfigError {
    pub(crate) reason: Cow<'static, str>,
}

impl std::error::Error for ConfigError { }

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The connect timeout elapsed.
pub struct TimeoutError {
    ms: u128,
}

impl std::error::Error for TimeoutError { }

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeout after {} ms", self.ms)
    }
}

impl fmt::Debug for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A structured error reported by the server.
#[derive(Clone)]
pub struct DatabaseError {
    severity: String,
    code: String,
    message: String,
    detail: Option<String>,
}

impl DatabaseError {
    /// Extract the identified fields from an `ErrorResponse`.
    ///
    /// `V` is the non localized severity, newer servers always send it;
    /// `S` is the fallback.
    pub(crate) fn parse(err: &ErrorResponse) -> Self {
        let mut severity = None;
        let mut localized_severity = None;
        let mut code = None;
        let mut message = None;
        let mut detail = None;

        for (field, value) in err.fields() {
            match field {
                b'S' => localized_severity = Some(value),
                b'V' => severity = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'D' => detail = Some(value),
                _ => { }
            }
        }

        Self {
            severity: severity.or(localized_severity).unwrap_or("ERROR").into(),
            code: code.unwrap_or("XX000").into(),
            message: message.unwrap_or("(no message)").into(),
            detail: detail.map(Into::into),
        }
    }

    /// `ERROR`, `FATAL`, or `PANIC`.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseError")
            .field("severity", &self.severity)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("detail", &self.detail)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn database_error_fields() {
        let raw = ErrorResponse::new(Bytes::from_static(
            b"SFEHLER\0VERROR\0C22012\0Mdivision by zero\0\0",
        ));
        let err = DatabaseError::parse(&raw);
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "22012");
        assert_eq!(err.message(), "division by zero");
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn timeout_message() {
        let err = Error::timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("Timeout after 250 ms"), "{err}");
        assert!(matches!(err.kind(), ErrorKind::Timeout(_)));
    }

    #[test]
    fn detail_is_appended() {
        let raw = ErrorResponse::new(Bytes::from_static(
            b"SERROR\0C23505\0Mduplicate key\0DKey (id)=(1) already exists.\0\0",
        ));
        let err = DatabaseError::parse(&raw);
        assert_eq!(err.to_string(), "duplicate key: Key (id)=(1) already exists.");
        // severity falls back to S when V is absent
        assert_eq!(err.severity(), "ERROR");
    }
}
