//! Query API types.
use std::io::Write;

use crate::{
    Result,
    connection::{ByteSink, Connection, SinkColumn},
    encode::{Encode, Param},
    fetch::{self, QueryHandle, QueryOutput, RowResult, RowStream},
    postgres::PgFormat,
    row::{FromRow, RowNotFound},
    sql::Sql,
    statement::Statement,
};

/// Everything the connection needs to put one query on the wire.
pub(crate) struct QuerySpec<'q, 'val> {
    pub sql: &'q str,
    pub persistent: bool,
    pub params: Vec<Param<'val>>,
    pub result_format: PgFormat,
    pub param_format: PgFormat,
    pub sinks: Vec<(SinkColumn, ByteSink)>,
}

/// Entrypoint of the query API.
///
/// ```no_run
/// # async fn app(conn: &mut pgpipe::Connection) -> pgpipe::Result<()> {
/// let res = pgpipe::query("SELECT 420, $1", conn)
///     .bind("Foo")
///     .fetch_one::<(i32, String)>()
///     .await?;
///
/// assert_eq!(res.0, 420);
/// assert_eq!(res.1.as_str(), "Foo");
/// # Ok(())
/// # }
/// ```
#[inline]
pub fn query<'c, 'val, SQL: Sql>(sql: SQL, conn: &'c mut Connection) -> Query<'c, 'val, SQL> {
    Query {
        conn,
        sql,
        params: Vec::new(),
        result_format: PgFormat::Binary,
        param_format: PgFormat::Binary,
        sinks: Vec::new(),
    }
}

/// The query API.
#[must_use = "queries do nothing unless fetched or submitted"]
pub struct Query<'c, 'val, SQL> {
    conn: &'c mut Connection,
    sql: SQL,
    params: Vec<Param<'val>>,
    result_format: PgFormat,
    param_format: PgFormat,
    sinks: Vec<(SinkColumn, ByteSink)>,
}

impl<'c, 'val, SQL: Sql> Query<'c, 'val, SQL> {
    /// Bind query parameter.
    #[inline]
    pub fn bind<V: Encode<'val>>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    /// Request result columns in the given format, default binary.
    pub fn format(mut self, format: PgFormat) -> Self {
        self.result_format = format;
        self
    }

    /// Send parameters in the given format, default binary.
    pub fn param_format(mut self, format: PgFormat) -> Self {
        self.param_format = format;
        self
    }

    /// Stream a `bytea` result column into `sink` instead of buffering it.
    ///
    /// The column's row slot decodes as null; the bytes go to the sink as
    /// they arrive, so memory stays bounded no matter the value size.
    pub fn sink<C, W>(mut self, column: C, sink: W) -> Self
    where
        C: Into<SinkColumn>,
        W: Write + Send + 'static,
    {
        self.sinks.push((column.into(), Box::new(sink)));
        self
    }

    /// Put the query on the wire without awaiting anything.
    ///
    /// This is the pipelining entrypoint: submit any number of queries back
    /// to back, then [`finish`][QueryHandle::finish] their handles in order.
    pub fn submit(self) -> Result<QueryHandle> {
        let Query { conn, sql, params, result_format, param_format, sinks } = self;
        conn.submit(QuerySpec {
            sql: sql.sql(),
            persistent: sql.persistent(),
            params,
            result_format,
            param_format,
            sinks,
        })
    }

    /// Fetch rows lazily, as a [`Stream`][futures_core::Stream].
    pub fn fetch(self) -> Result<RowStream<'c>> {
        let Query { conn, sql, params, result_format, param_format, sinks } = self;
        let handle = conn.submit(QuerySpec {
            sql: sql.sql(),
            persistent: sql.persistent(),
            params,
            result_format,
            param_format,
            sinks,
        })?;
        Ok(handle.stream(conn))
    }

    /// Run to completion and return `{names, rows, status}`.
    pub async fn collect(self) -> Result<QueryOutput> {
        self.fetch()?.finish().await
    }

    /// Fetch all rows into [`Vec`].
    pub async fn fetch_all<R: FromRow>(self) -> Result<Vec<R>> {
        fetch::fetch_all(self.fetch()?).await
    }

    /// Fetch one row.
    pub async fn fetch_one<R: FromRow>(self) -> Result<R> {
        match fetch::fetch_optional(self.fetch()?).await? {
            Some(row) => Ok(row),
            None => Err(RowNotFound.into()),
        }
    }

    /// Optionally fetch one row.
    pub async fn fetch_optional<R: FromRow>(self) -> Result<Option<R>> {
        fetch::fetch_optional(self.fetch()?).await
    }

    /// Execute statement and return number of rows affected.
    pub async fn execute(self) -> Result<RowResult> {
        fetch::execute(self.fetch()?).await
    }
}

impl<SQL> std::fmt::Debug for Query<'_, '_, SQL> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("params", &self.params)
            .field("result_format", &self.result_format)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Prepare a statement for repeated execution.
    ///
    /// The statement keeps its server side name until
    /// [`close`][Statement::close].
    pub async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.prepare_as(sql, None).await
    }

    /// [`prepare`][Connection::prepare] under an explicit statement name.
    pub async fn prepare_as(&mut self, sql: &str, name: Option<&str>) -> Result<Statement> {
        let (handle, name) = self.submit_prepare(sql, name)?;
        let handle = handle.finish_unchecked(self).await?;
        Ok(Statement {
            name,
            param_oids: handle.param_oids().to_vec(),
            desc: handle.desc().cloned(),
        })
    }
}

impl Statement {
    /// Start an execution of this statement.
    pub fn query<'s, 'c, 'val>(&'s self, conn: &'c mut Connection) -> Portal<'s, 'c, 'val> {
        Portal {
            stmt: self,
            conn,
            params: Vec::new(),
            portal: None,
            result_format: PgFormat::Binary,
            param_format: PgFormat::Binary,
            sinks: Vec::new(),
        }
    }

    /// Release the server side statement.
    pub async fn close(&self, conn: &mut Connection) -> Result<()> {
        let handle = conn.submit_close(self)?;
        handle.finish_unchecked(conn).await?;
        Ok(())
    }
}

/// One execution of a prepared [`Statement`].
#[must_use = "queries do nothing unless fetched or submitted"]
pub struct Portal<'s, 'c, 'val> {
    stmt: &'s Statement,
    conn: &'c mut Connection,
    params: Vec<Param<'val>>,
    portal: Option<String>,
    result_format: PgFormat,
    param_format: PgFormat,
    sinks: Vec<(SinkColumn, ByteSink)>,
}

impl<'c, 'val> Portal<'_, 'c, 'val> {
    /// Bind query parameter.
    #[inline]
    pub fn bind<V: Encode<'val>>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    /// Bind the destination portal by name instead of the unnamed portal.
    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.portal = Some(portal.into());
        self
    }

    /// Request result columns in the given format, default binary.
    pub fn format(mut self, format: PgFormat) -> Self {
        self.result_format = format;
        self
    }

    /// Stream a `bytea` result column into `sink`, see
    /// [`Query::sink`][Query::sink].
    pub fn sink<C, W>(mut self, column: C, sink: W) -> Self
    where
        C: Into<SinkColumn>,
        W: Write + Send + 'static,
    {
        self.sinks.push((column.into(), Box::new(sink)));
        self
    }

    /// Put the execution on the wire without awaiting anything.
    pub fn submit(self) -> Result<QueryHandle> {
        let Portal { stmt, conn, params, portal, result_format, param_format, sinks } = self;
        conn.submit_execute(
            stmt,
            params,
            portal.as_deref(),
            result_format,
            param_format,
            sinks,
        )
    }

    /// Fetch rows lazily, as a [`Stream`][futures_core::Stream].
    pub fn fetch(self) -> Result<RowStream<'c>> {
        let Portal { stmt, conn, params, portal, result_format, param_format, sinks } = self;
        let handle = conn.submit_execute(
            stmt,
            params,
            portal.as_deref(),
            result_format,
            param_format,
            sinks,
        )?;
        Ok(handle.stream(conn))
    }

    /// Run to completion and return `{names, rows, status}`.
    pub async fn collect(self) -> Result<QueryOutput> {
        self.fetch()?.finish().await
    }

    /// Fetch all rows into [`Vec`].
    pub async fn fetch_all<R: FromRow>(self) -> Result<Vec<R>> {
        fetch::fetch_all(self.fetch()?).await
    }

    /// Fetch one row.
    pub async fn fetch_one<R: FromRow>(self) -> Result<R> {
        match fetch::fetch_optional(self.fetch()?).await? {
            Some(row) => Ok(row),
            None => Err(RowNotFound.into()),
        }
    }

    /// Execute and return number of rows affected.
    pub async fn execute(self) -> Result<RowResult> {
        fetch::execute(self.fetch()?).await
    }
}

impl std::fmt::Debug for Portal<'_, '_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("statement", &self.stmt.name())
            .field("portal", &self.portal)
            .finish_non_exhaustive()
    }
}
