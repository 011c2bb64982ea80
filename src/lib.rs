//! Single-connection pipelined Postgres client.
//!
//! The whole crate runs the extended-query flow over one socket: every query
//! is a `Parse`/`Bind`/`Describe`/`Execute`/`Sync` cycle, and any number of
//! cycles can be in flight at once. Responses are correlated back to the
//! query that caused them, a failing query unwinds only itself, and row data
//! streams to the caller as a lazy asynchronous sequence.
//!
//! # Examples
//!
//! Simple query:
//!
//! ```no_run
//! use pgpipe::Connection;
//!
//! # async fn app() -> pgpipe::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let res = pgpipe::query("SELECT 420, $1", &mut conn)
//!     .bind("Foo")
//!     .fetch_one::<(i32, String)>()
//!     .await?;
//!
//! assert_eq!(res.0, 420);
//! assert_eq!(res.1.as_str(), "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Pipelining, three queries on the wire before any response is read:
//!
//! ```no_run
//! use pgpipe::{Connection, query};
//!
//! # async fn app() -> pgpipe::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let a = query("SELECT 1", &mut conn).submit()?;
//! let b = query("SELECT $1::int", &mut conn).bind(2).submit()?;
//! let c = query("SELECT 3", &mut conn).submit()?;
//!
//! for handle in [a, b, c] {
//!     let output = handle.finish(&mut conn).await?;
//!     println!("{:?} -> {} rows", output.status, output.rows.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod io;
mod net;

// Protocol
pub mod postgres;
mod sasl;

// Encoding
pub mod encode;
pub mod value;
pub mod types;

// Component
mod statement;
pub mod sql;
pub mod row;

// Operation
pub mod transport;
mod phase;
pub mod fetch;
pub mod query;

// Connection
pub mod connection;

mod error;

pub use encode::Encode;
pub use row::{Decode, DecodeError, FromRow, Row};
pub use sql::SqlExt;
pub use value::{PgDate, PgPoint, PgTimestamp, Value};

pub use fetch::{QueryHandle, QueryOutput, RowResult, RowStream};
pub use statement::Statement;
pub use types::TypeRegistry;

pub use connection::{
    ByteSink, Config, Connection, Notification, SinkColumn, SslMode, TransactionStatus,
};
#[doc(inline)]
pub use query::query;

pub use error::{ConfigError, DatabaseError, Error, ErrorKind, Result, TimeoutError};
pub use postgres::PgFormat;
