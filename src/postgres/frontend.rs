//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, Bytes, BytesMut};

use super::{Oid, PgFormat};

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "frontend message body size not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message.
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Size of the main body.
    ///
    /// Note that this is **only** the size of main body as oppose of actual postgres message which
    /// include the length itself.
    fn size_hint(&self) -> u32;

    /// Write the main body of the message.
    ///
    /// The length of body written must be equal to the
    /// length returned by [`size_hint`][FrontendProtocol::size_hint].
    fn encode(self, buf: impl BufMut);
}

/// Write a string and its nul terminator.
fn put_str(buf: &mut impl BufMut, string: &str) {
    buf.put(string.as_bytes());
    buf.put_u8(b'\0');
}

/// Size of a string plus its nul terminator.
fn str_size(string: &str) -> u32 {
    size(string.len()) + 1
}

/// Lengths are `usize` in rust while the wire wants `u32`; overflow is a
/// caller bug, not io, so panic instead of wrapping.
fn size(len: usize) -> u32 {
    len.try_into().expect("message size too large for protocol")
}

/// Same as [`size`] for the `u16` field counts.
fn count(len: usize) -> u16 {
    len.try_into().expect("field count too large for protocol")
}

macro_rules! size_of {
    ($self:tt.$field:ident) => {
        u32::try_from(size_of_val(&$self.$field)).expect("data type size too large for postgres")
    };
}

/// Postgres Startup frontend message.
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Additional run-time parameters applied at backend start,
    /// `client_encoding` and friends.
    pub options: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_u32(0);

        // Int32(196608)
        // The protocol version number.
        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_u32(196_608);

        // The protocol version number is followed by one or more pairs of parameter name and value strings.

        put_str(buf, "user");
        put_str(buf, self.user);

        if let Some(db) = self.database {
            put_str(buf, "database");
            put_str(buf, db);
        }

        // Parameter names beginning with _pq_. are reserved for use as protocol extensions,
        // while others are treated as run-time parameters to be set at backend start time.
        // Such settings will be applied during backend start and will act as session defaults.
        for (name, value) in self.options {
            put_str(buf, name);
            put_str(buf, value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_u32(size(written_buf.len()));
    }
}

/// Postgres SSLRequest preamble.
///
/// Like [`Startup`], this is sent before the regular message framing is in
/// effect, and the server answers with a single byte, not a message.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    /// `1234` in the most significant 16 bits, `5679` in the least.
    pub const CODE: u32 = 80877103;

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_u32(8);
        buf.put_u32(Self::CODE);
    }
}

/// Identifies the message as a password response.
///
/// Also used for GSSAPI, SSPI and SASL response messages. The exact message
/// type can be deduced from the context.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested).
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        str_size(self.password)
    }

    fn encode(self, mut buf: impl BufMut) {
        put_str(&mut buf, self.password);
    }
}

/// Initial SASL response, carrying the selected mechanism name.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Client Response".
    pub response: &'a str,
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        str_size(self.mechanism) + 4 + size(self.response.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        put_str(&mut buf, self.mechanism);
        // Length of SASL mechanism specific "Initial Client Response" that follows,
        // or -1 if there is no Initial Response.
        buf.put_i32(self.response.len() as i32);
        buf.put(self.response.as_bytes());
    }
}

/// SASL response which is not the initial one.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a str,
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        size(self.data.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put(self.data.as_bytes());
    }
}

/// Identifies the message as a Parse command.
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Object ids of the parameter data types.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the
    /// query string, only the number that the frontend wants to prespecify types for.
    ///
    /// Placing a zero is equivalent to leaving the type unspecified.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> u32 {
        str_size(self.prepare_name)
            + str_size(self.sql)
            + 2
            + 4 * size(self.oids.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        put_str(&mut buf, self.prepare_name);
        put_str(&mut buf, self.sql);
        buf.put_u16(count(self.oids.len()));
        for &oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,

    /// The parameter format codes.
    ///
    /// This can be empty to indicate that there are no parameters or that the parameters
    /// all use the default format (text); or one, in which case the specified format code
    /// is applied to all parameters; or it can equal the actual number of parameters.
    pub param_formats: &'a [PgFormat],

    /// The parameter values, already encoded in the format indicated by the
    /// associated format code. `None` is a NULL parameter, written as length -1
    /// with no value bytes following.
    pub params: &'a [Option<Bytes>],

    /// The result-column format codes, same one/empty/exact rule as
    /// [`param_formats`][Bind::param_formats].
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> u32 {
        str_size(self.portal_name)
            + str_size(self.stmt_name)
            + 2
            + 2 * size(self.param_formats.len())
            + 2
            + self
                .params
                .iter()
                .fold(0u32, |acc, p| {
                    acc + 4 + p.as_ref().map(|b| size(b.len())).unwrap_or(0)
                })
            + 2
            + 2 * size(self.result_formats.len())
    }

    fn encode(self, mut buf: impl BufMut) {
        put_str(&mut buf, self.portal_name);
        put_str(&mut buf, self.stmt_name);

        buf.put_u16(count(self.param_formats.len()));
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(count(self.params.len()));
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put(&value[..]);
                }
                // -1 indicates a NULL parameter value, no value bytes follow
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(count(self.result_formats.len()));
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        size_of!(self.kind) + str_size(self.name)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        put_str(&mut buf, self.name);
    }
}

/// Identifies the message as a Execute command.
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        str_size(self.portal_name) + size_of!(self.max_row)
    }

    fn encode(self, mut buf: impl BufMut) {
        put_str(&mut buf, self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command.
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        size_of!(self.variant) + str_size(self.name)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        put_str(&mut buf, self.name);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> u32 { 0 }

            fn encode(self, _: impl BufMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Sync command.
    struct Sync, b'S';

    /// Identifies the message as a Flush command.
    struct Flush, b'H';

    /// Identifies the message as a termination.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn framing_prefix() {
        let mut buf = BytesMut::new();
        write(Sync, &mut buf);
        assert_eq!(&buf[..], b"S\x00\x00\x00\x04");

        buf.clear();
        write(Execute { portal_name: "", max_row: 0 }, &mut buf);
        assert_eq!(&buf[..], b"E\x00\x00\x00\x09\x00\x00\x00\x00\x00");
    }

    #[test]
    fn startup_layout() {
        let mut buf = BytesMut::new();
        Startup {
            user: "postgres",
            database: Some("db"),
            options: &[("client_encoding", "UTF8")],
        }
        .write(&mut buf);

        use bytes::Buf;
        let total = (&buf[..]).get_u32();
        assert_eq!(total as usize, buf.len());
        assert_eq!((&buf[4..]).get_u32(), 196_608);
        assert_eq!(buf.last(), Some(&0));
        let body = &buf[8..];
        let expect = b"user\0postgres\0database\0db\0client_encoding\0UTF8\0\0";
        assert_eq!(body, expect);
    }

    #[test]
    fn ssl_request_magic() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        // 1234 and 5679 in the two 16 bit halves
        assert_eq!(&buf[..], b"\x00\x00\x00\x08\x04\xd2\x16\x2f");
    }

    #[test]
    fn bind_null_and_value() {
        let mut buf = BytesMut::new();
        write(
            Bind {
                portal_name: "",
                stmt_name: "tsp_1",
                param_formats: &[PgFormat::Binary],
                params: &[None, Some(Bytes::from_static(&[0, 0, 0, 7]))],
                result_formats: &[PgFormat::Binary],
            },
            &mut buf,
        );

        let expect: &[u8] = &[
            b'B', 0, 0, 0, 33, // len
            0, b't', b's', b'p', b'_', b'1', 0, // portal + stmt
            0, 1, 0, 1, // one param format, binary
            0, 2, // two params
            0xff, 0xff, 0xff, 0xff, // NULL
            0, 0, 0, 4, 0, 0, 0, 7, // int4 7
            0, 1, 0, 1, // one result format, binary
        ];
        assert_eq!(&buf[..], expect);
    }
}
