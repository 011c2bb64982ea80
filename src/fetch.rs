//! Query result surfaces.
//!
//! [`QueryHandle`] is the pipelined half: it does not borrow the connection,
//! so many can be outstanding. [`RowStream`] attaches a handle to the
//! connection and drives the protocol lazily, one row at a time.
use futures_core::Stream;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};

use crate::{
    Error, Result,
    common::ByteStr,
    connection::{Connection, RequestId},
    postgres::{Oid, ProtocolError},
    row::{FromRow, Row, RowDescription},
};

/// One event on a request's channel, from the connection to the handle.
///
/// `Names` fires at most once, `Row` any number of times, and exactly one of
/// `Done`/`Fail` ends the request.
pub(crate) enum RowEvent {
    Names(Arc<RowDescription>),
    Params(Vec<Oid>),
    Row(Row),
    Done(Option<ByteStr>),
    Fail(Error),
}

/// Query result with its rows affected.
#[derive(Debug)]
pub struct RowResult {
    pub rows_affected: u64,
}

/// The complete result of one query.
#[derive(Debug)]
pub struct QueryOutput {
    /// Result column names, after the configured name transform.
    pub names: Vec<String>,
    /// Every row, in arrival order.
    pub rows: Vec<Row>,
    /// The command tag, `None` for an empty query string.
    pub status: Option<String>,
}

impl QueryOutput {
    /// Number of rows the command affected, parsed from the command tag.
    pub fn rows_affected(&self) -> u64 {
        match &self.status {
            Some(tag) => crate::postgres::backend::CommandComplete {
                tag: ByteStr::copy_from_str(tag),
            }
            .rows_affected(),
            None => 0,
        }
    }
}

/// An in flight query, correlated by the connection.
///
/// Rows arriving while other work drives the connection are buffered here, so
/// submitting several queries back to back and finishing them in any order
/// loses nothing.
pub struct QueryHandle {
    #[allow(unused)] // correlation id, kept for diagnostics
    id: RequestId,
    events: UnboundedReceiver<RowEvent>,
    desc: Option<Arc<RowDescription>>,
    param_oids: Vec<Oid>,
    rows: Vec<Row>,
    status: Option<ByteStr>,
    done: bool,
    error: Option<Error>,
}

impl QueryHandle {
    pub(crate) fn channel(id: RequestId) -> (UnboundedSender<RowEvent>, Self) {
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        (
            tx,
            Self {
                id,
                events,
                desc: None,
                param_oids: Vec::new(),
                rows: Vec::new(),
                status: None,
                done: false,
                error: None,
            },
        )
    }

    /// Move every event that already arrived into the local buffers.
    fn drain(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(RowEvent::Names(desc)) => self.desc = Some(desc),
                Ok(RowEvent::Params(oids)) => self.param_oids = oids,
                Ok(RowEvent::Row(row)) => self.rows.push(row),
                Ok(RowEvent::Done(status)) => {
                    self.status = status;
                    self.done = true;
                }
                Ok(RowEvent::Fail(error)) => {
                    self.error = Some(error);
                    self.done = true;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    if !self.done {
                        // the connection dropped the request without a verdict
                        self.error = Some(
                            ProtocolError::new("request abandoned by the connection").into(),
                        );
                        self.done = true;
                    }
                    return;
                }
            }
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub(crate) fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    pub(crate) fn desc(&self) -> Option<&Arc<RowDescription>> {
        self.desc.as_ref()
    }

    /// Attach to the connection and consume rows lazily.
    pub fn stream(self, conn: &mut Connection) -> RowStream<'_> {
        RowStream { conn, handle: self, cursor: 0 }
    }

    /// Drive the connection until this query completes.
    pub async fn finish(self, conn: &mut Connection) -> Result<QueryOutput> {
        let mut stream = self.stream(conn);
        while stream.next().await?.is_some() { }
        stream.into_output()
    }

    /// Drive the connection until this query completes, ignoring its rows.
    pub(crate) async fn finish_unchecked(self, conn: &mut Connection) -> Result<Self> {
        let mut stream = self.stream(conn);
        while stream.next().await?.is_some() { }
        Ok(stream.handle)
    }

    fn into_output(mut self) -> Result<QueryOutput> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        Ok(QueryOutput {
            names: match &self.desc {
                Some(desc) => desc.names().map(String::from).collect(),
                None => Vec::new(),
            },
            rows: self.rows,
            status: self.status.as_ref().map(|tag| tag.as_str().into()),
        })
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("rows", &self.rows.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Lazy row stream for one query.
///
/// Polling it drives the connection, which also makes progress for every
/// other query submitted before this one; their rows land in their own
/// handles. Dropping the stream mid query does not cancel anything, the
/// remaining rows are drained off the socket and discarded.
#[must_use = "streams do nothing unless polled"]
pub struct RowStream<'c> {
    conn: &'c mut Connection,
    handle: QueryHandle,
    cursor: usize,
}

impl RowStream<'_> {
    /// Same as the [`Stream`] implementation without pinning ceremony.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        std::future::poll_fn(|cx| self.poll_row(cx)).await
    }

    fn poll_row(&mut self, cx: &mut Context) -> Poll<Result<Option<Row>>> {
        loop {
            self.handle.drain();

            if let Some(row) = self.handle.rows.get(self.cursor) {
                self.cursor += 1;
                return Poll::Ready(Ok(Some(row.clone())));
            }
            if let Some(error) = self.handle.take_error() {
                return Poll::Ready(Err(error));
            }
            if self.handle.done {
                return Poll::Ready(Ok(None));
            }

            if let Err(err) = ready!(self.conn.poll_pump(cx)) {
                return Poll::Ready(Err(err));
            }
        }
    }

    /// The complete output once the stream is exhausted.
    ///
    /// Rows already streamed are included; a completed stream can be
    /// re-iterated through [`QueryOutput::rows`] and yields the same rows.
    pub fn into_output(self) -> Result<QueryOutput> {
        self.handle.into_output()
    }

    /// Drain the remaining rows and return the complete output.
    pub async fn finish(mut self) -> Result<QueryOutput> {
        while self.next().await?.is_some() { }
        self.into_output()
    }
}

impl Stream for RowStream<'_> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match ready!(me.poll_row(cx)) {
            Ok(Some(row)) => Poll::Ready(Some(Ok(row))),
            Ok(None) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("handle", &self.handle)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Collect helpers shared by [`Query`][crate::query::Query] and
/// [`Statement`][crate::statement::Statement] execution.
pub(crate) async fn fetch_all<R: FromRow>(stream: RowStream<'_>) -> Result<Vec<R>> {
    let mut stream = stream;
    let mut output = Vec::new();
    while let Some(row) = stream.next().await? {
        output.push(row.decode()?);
    }
    Ok(output)
}

pub(crate) async fn fetch_optional<R: FromRow>(stream: RowStream<'_>) -> Result<Option<R>> {
    let mut stream = stream;
    let mut output = None;
    while let Some(row) = stream.next().await? {
        if output.is_none() {
            output = Some(row.decode()?);
        }
    }
    Ok(output)
}

pub(crate) async fn execute(stream: RowStream<'_>) -> Result<RowResult> {
    let output = stream.finish().await?;
    Ok(RowResult { rows_affected: output.rows_affected() })
}
