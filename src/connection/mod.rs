//! Postgres Connection
use bytes::{Buf, Bytes, BytesMut};
use lru::LruCache;
use std::{
    collections::{HashMap, VecDeque},
    hash::{DefaultHasher, Hash, Hasher},
    io::{self, Write},
    num::NonZeroUsize,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    Error, Result,
    common::{ByteStr, debug, verbose, warning},
    encode::Param,
    error::DatabaseError,
    fetch::{QueryHandle, RowEvent},
    io::{WriteBuf, poll_read, poll_write_all},
    net::Socket,
    phase::{self, StartupResponse},
    postgres::{
        BackendProtocol, FrontendProtocol, Oid, PgFormat, ProtocolError, backend, frontend,
        oid,
    },
    query::QuerySpec,
    row::{NameTransform, Row, RowDescription},
    statement::{ObjectName, Statement},
    transport::{PgTransport, PgTransportExt},
    types::TypeRegistry,
};

mod config;

pub use config::{Config, SslMode};

/// A notification delivered by `LISTEN`/`NOTIFY`.
pub type Notification = backend::NotificationResponse;

const DEFAULT_BUF_CAPACITY: usize = 1024;
const DEFAULT_PREPARED_STMT_CACHE: NonZeroUsize = NonZeroUsize::new(24).unwrap();

pub(crate) type RequestId = u64;

/// Backend transaction status from the latest `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    /// In a failed transaction block, queries are rejected until the block ends.
    InError,
}

/// Where the bytes of one `bytea` column should stream to.
pub enum SinkColumn {
    Index(usize),
    Name(String),
}

impl From<usize> for SinkColumn {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl From<&str> for SinkColumn {
    fn from(value: &str) -> Self {
        Self::Name(value.into())
    }
}

/// Writable sink receiving streamed `bytea` bytes.
pub type ByteSink = Box<dyn Write + Send>;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

/// Stages of in flight extended-query cycles, in backend response order.
///
/// Every frontend message which provokes a response pushes its stage here at
/// submission; every backend message consumes the head. Responses on one
/// connection arrive strictly in submission order, so a mismatch is a protocol
/// violation, not a race.
#[derive(Debug)]
enum PendingStage {
    /// `ParseComplete`
    Parse { req: RequestId },
    /// `ParameterDescription`
    ParamDescription { req: RequestId },
    /// `RowDescription` or `NoData`
    Describe { req: RequestId },
    /// `BindComplete`
    Bind { req: RequestId },
    /// `DataRow`* then `CommandComplete` or `EmptyQueryResponse`
    Execute { req: RequestId },
    /// `CloseComplete`; `None` is an internal close (statement cache eviction)
    Close { req: Option<RequestId> },
    /// `ReadyForQuery`
    Sync { req: Option<RequestId> },
}

impl PendingStage {
    fn req(&self) -> Option<RequestId> {
        match *self {
            Self::Parse { req }
            | Self::ParamDescription { req }
            | Self::Describe { req }
            | Self::Bind { req }
            | Self::Execute { req } => Some(req),
            Self::Close { req } | Self::Sync { req } => req,
        }
    }
}

/// Book keeping for one submitted request.
struct RequestState {
    events: UnboundedSender<RowEvent>,
    desc: Option<Arc<RowDescription>>,
    param_oids: Vec<Oid>,
    deferred: Option<DeferredBind>,
    result_format: PgFormat,
    param_format: PgFormat,
    sinks: Vec<(SinkColumn, ByteSink)>,
    /// per result column, index into `sinks`
    resolved_sinks: Vec<Option<usize>>,
    /// `Done` or `Fail` already delivered
    done: bool,
    /// swallow the rest of this request's data
    failed: bool,
}

impl RequestState {
    fn new(
        events: UnboundedSender<RowEvent>,
        result_format: PgFormat,
        param_format: PgFormat,
        sinks: Vec<(SinkColumn, ByteSink)>,
    ) -> Self {
        Self {
            events,
            desc: None,
            param_oids: Vec::new(),
            deferred: None,
            result_format,
            param_format,
            sinks,
            resolved_sinks: Vec::new(),
            done: false,
            failed: false,
        }
    }

    fn has_sinks(&self) -> bool {
        !self.resolved_sinks.is_empty() && self.resolved_sinks.iter().any(Option::is_some)
    }

    fn send(&self, event: RowEvent) {
        // a dropped handle means drain and discard
        let _ = self.events.send(event);
    }

    fn finish(&mut self, status: Option<ByteStr>) {
        if !self.done {
            self.done = true;
            self.send(RowEvent::Done(status));
        }
    }

    fn fail(&mut self, error: Error) {
        self.deferred = None;
        self.failed = true;
        if !self.done {
            self.done = true;
            self.send(RowEvent::Fail(error));
        }
    }
}

/// Bind deferred until `ParameterDescription` teaches us the parameter oids.
struct DeferredBind {
    statement: ObjectName,
    params: Vec<Param<'static>>,
    /// close the statement in the same cycle
    one_shot: bool,
    /// cache the statement under this sql hash once learned
    cache_key: Option<u64>,
}

#[derive(Clone)]
struct CachedStatement {
    name: ObjectName,
    param_oids: Vec<Oid>,
    desc: Arc<RowDescription>,
}

/// A `DataRow` being consumed incrementally across socket reads.
///
/// Entered whenever the owning request streams `bytea` columns into sinks;
/// sink column bytes leave the read buffer in chunks, so the peak memory is
/// the largest non-sink column, not the row.
struct PartialRow {
    req: RequestId,
    /// message body bytes not yet consumed
    remaining: usize,
    cols: Option<u16>,
    col: u16,
    state: ColState,
    values: Vec<Option<Bytes>>,
    /// sink io failed mid row; drain the rest and fail the request
    sink_error: Option<io::Error>,
}

enum ColState {
    /// waiting for the 4 byte column length
    Len,
    /// accumulating a regular column
    Buffer { len: usize },
    /// streaming a sink column
    Stream { remaining: usize, sink: usize },
}

impl PartialRow {
    fn new(req: RequestId, remaining: usize) -> Self {
        Self {
            req,
            remaining,
            cols: None,
            col: 0,
            state: ColState::Len,
            values: Vec::new(),
            sink_error: None,
        }
    }
}

/// Postgres Connection.
///
/// # Pipelining
///
/// Every query is submitted in extended-query form and correlated through a
/// queue of [`PendingStage`]s. Multiple queries may be submitted back to back
/// before any response is read; responses are routed to each query's
/// [`QueryHandle`] in submission order, and a failing query unwinds only its
/// own cycle, later queries are still delivered.
///
/// # Features
///
/// Connection cache a prepared statement per sql string. To opt out, use
/// [`once`][crate::sql::SqlExt::once] when querying.
///
/// Connection handle `NoticeResponse` message. If a `notice` callback is
/// registered it is invoked, otherwise the notice is logged.
///
/// # Runtime
///
/// All io is driven by polling the futures and streams this connection hands
/// out. Nothing progresses while none of them is awaited.
pub struct Connection {
    // io
    socket: Socket,
    read_buf: BytesMut,
    write_buf: WriteBuf,

    // session
    parameters: HashMap<String, String>,
    process_id: u32,
    secret_key: u32,
    tx_status: TransactionStatus,
    encrypted: bool,
    connected_at: Instant,

    // configuration carried past connect
    statement_prefix: ByteStr,
    name_transform: Option<Arc<NameTransform>>,
    registry: Arc<TypeRegistry>,

    // pipeline
    pending: VecDeque<PendingStage>,
    requests: HashMap<RequestId, RequestState>,
    next_request_id: RequestId,
    next_statement_id: u32,
    /// between `ErrorResponse` and the recovering `ReadyForQuery`
    errored: bool,
    /// fatal failure, every operation reports this
    dead: Option<String>,
    partial: Option<PartialRow>,

    stmts: LruCache<u64, CachedStatement>,

    // observability callbacks
    on_error: Option<Callback<DatabaseError>>,
    on_notice: Option<Callback<backend::NoticeResponse>>,
    on_notification: Option<Callback<Notification>>,
}

impl Connection {
    /// Connect to postgres server via environment variables.
    ///
    /// See [`Config::from_env`] for more details.
    pub fn connect_env() -> impl Future<Output = Result<Connection>> {
        Self::connect_with(Config::from_env())
    }

    /// Connect to postgres server via url.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect to postgres server with provided config.
    pub async fn connect_with(config: Config) -> Result<Self> {
        config.validate()?;
        match config.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, Self::handshake(&config)).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(timeout)),
            },
            None => Self::handshake(&config).await,
        }
    }

    async fn handshake(config: &Config) -> Result<Self> {
        let socket = if config.host == "localhost" {
            let path = format!("/run/postgresql/.s.PGSQL.{}", config.port);
            match Socket::connect_socket(&path).await {
                Ok(ok) => ok,
                Err(_) => Socket::connect_tcp(&config.host, config.port, config.keep_alive).await?,
            }
        } else {
            Socket::connect_tcp(&config.host, config.port, config.keep_alive).await?
        };

        let socket = Self::negotiate_tls(socket, config).await?;

        let mut me = Self {
            encrypted: socket.is_encrypted(),
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: WriteBuf::new(),
            parameters: HashMap::new(),
            process_id: 0,
            secret_key: 0,
            tx_status: TransactionStatus::Idle,
            connected_at: Instant::now(),
            statement_prefix: config.statement_prefix.clone(),
            name_transform: config.name_transform.clone(),
            registry: config.types.clone(),
            pending: VecDeque::new(),
            requests: HashMap::new(),
            next_request_id: 1,
            next_statement_id: 0,
            errored: false,
            dead: None,
            partial: None,
            stmts: LruCache::new(DEFAULT_PREPARED_STMT_CACHE),
            on_error: None,
            on_notice: None,
            on_notification: None,
        };

        let StartupResponse { backend_key_data, parameters } =
            phase::startup(config, &mut me).await?;

        me.process_id = backend_key_data.process_id;
        me.secret_key = backend_key_data.secret_key;
        for param in parameters {
            me.parameters
                .insert(param.name.as_str().into(), param.value.as_str().into());
        }

        Ok(me)
    }

    /// SSLRequest preamble, and the TLS handshake when the server supports it.
    async fn negotiate_tls(mut socket: Socket, config: &Config) -> Result<Socket> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        if matches!(config.ssl, SslMode::Disable) {
            return Ok(socket);
        }
        if !socket.supports_tls() {
            // unix sockets are local, there is nothing to encrypt
            return Ok(socket);
        }

        let mut request = BytesMut::with_capacity(8);
        frontend::SslRequest.write(&mut request);
        socket.write_all(&request).await?;
        socket.flush().await?;

        match socket.read_u8().await? {
            b'S' => {
                #[cfg(feature = "ssl")]
                {
                    let connector = match &config.ssl_connector {
                        Some(connector) => connector.clone(),
                        None => openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())
                            .map_err(io::Error::other)?
                            .build(),
                    };
                    Ok(socket.upgrade_tls(&config.host, &connector).await?)
                }
                #[cfg(not(feature = "ssl"))]
                {
                    // Config::validate rejects ssl modes without the feature
                    unreachable!("ssl negotiation without the `ssl` feature")
                }
            }
            b'N' => match config.ssl {
                SslMode::Require => {
                    Err(ProtocolError::new("Server does not support SSL connections").into())
                }
                _ => Ok(socket),
            },
            code => Err(ProtocolError::new(format!(
                "unexpected SSLRequest response 0x{code:02x}",
            ))
            .into()),
        }
    }

    /// Close connection cleanly.
    ///
    /// Sends `Terminate` and shuts the socket down. The server closing its
    /// side first during an intentional end is not an error.
    pub async fn close(mut self) -> Result<()> {
        self.send(frontend::Terminate);
        self.flush().await?;
        match self.socket.shutdown().await {
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(()),
            result => result.map_err(Into::into),
        }
    }
}

/// Session state accessors.
impl Connection {
    /// Run-time parameters accumulated from `ParameterStatus`.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// One run-time parameter, `server_version` and friends.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Transaction status from the latest `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// The process ID of the backend.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Cancellation secret for this backend.
    ///
    /// Cancelling requires a second connection carrying a `CancelRequest`
    /// with this key, which is outside this crate's scope.
    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    /// Whether the connection negotiated TLS.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Get the [`Instant`] value of when the socket is connected to postgres server.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Observe every `DatabaseError` the server reports.
    ///
    /// The error still rejects its owning query; this callback is for
    /// observability and does not consume it.
    pub fn on_error<F: FnMut(&DatabaseError) + Send + 'static>(&mut self, callback: F) {
        self.on_error = Some(Box::new(callback));
    }

    /// Observe `NoticeResponse` messages.
    pub fn on_notice<F: FnMut(&backend::NoticeResponse) + Send + 'static>(&mut self, callback: F) {
        self.on_notice = Some(Box::new(callback));
    }

    /// Observe `LISTEN`/`NOTIFY` notifications.
    pub fn on_notification<F: FnMut(&Notification) + Send + 'static>(&mut self, callback: F) {
        self.on_notification = Some(Box::new(callback));
    }
}

/// Submission: encode a request's messages and register its stages.
impl Connection {
    fn ensure_alive(&self) -> Result<()> {
        match &self.dead {
            Some(reason) => Err(io::Error::new(io::ErrorKind::NotConnected, reason.clone()).into()),
            None => Ok(()),
        }
    }

    fn new_request(
        &mut self,
        result_format: PgFormat,
        param_format: PgFormat,
        sinks: Vec<(SinkColumn, ByteSink)>,
    ) -> (RequestId, QueryHandle) {
        let req = self.next_request_id;
        self.next_request_id += 1;
        let (tx, handle) = QueryHandle::channel(req);
        self.requests
            .insert(req, RequestState::new(tx, result_format, param_format, sinks));
        (req, handle)
    }

    /// Submit one query without waiting for any response.
    ///
    /// The returned handle does not borrow the connection, so any number of
    /// queries can be submitted back to back and resolved afterwards.
    pub(crate) fn submit(&mut self, spec: QuerySpec<'_, '_>) -> Result<QueryHandle> {
        self.ensure_alive()?;

        let QuerySpec { sql, persistent, params, result_format, param_format, sinks } = spec;
        let (req, handle) = self.new_request(result_format, param_format, sinks);

        if params.is_empty() {
            // unparameterised single cycle flow on the unnamed statement
            self.send(frontend::Parse { prepare_name: "", sql, oids: &[] });
            self.send(frontend::Bind {
                portal_name: "",
                stmt_name: "",
                param_formats: &[],
                params: &[],
                result_formats: &[result_format],
            });
            self.send(frontend::Describe { kind: b'P', name: "" });
            self.send(frontend::Execute { portal_name: "", max_row: 0 });
            self.send(frontend::Close { variant: b'S', name: "" });
            self.send(frontend::Sync);

            self.pending.push_back(PendingStage::Parse { req });
            self.pending.push_back(PendingStage::Bind { req });
            self.pending.push_back(PendingStage::Describe { req });
            self.pending.push_back(PendingStage::Execute { req });
            self.pending.push_back(PendingStage::Close { req: Some(req) });
            self.pending.push_back(PendingStage::Sync { req: Some(req) });

            return Ok(handle);
        }

        let sqlid = {
            let mut buf = DefaultHasher::new();
            sql.trim().hash(&mut buf);
            buf.finish()
        };

        if persistent {
            if let Some(cached) = self.stmts.get(&sqlid).cloned() {
                verbose!("statement cache hit: {}", cached.name);
                let request = self.requests.get_mut(&req).expect("registered above");
                request.param_oids = cached.param_oids.clone();
                return match self.bind_execute(req, &cached.name, &cached.param_oids, &params, Some(cached.desc), false) {
                    Ok(()) => Ok(handle),
                    Err(err) => {
                        // nothing went on the wire, the request dies in place
                        self.requests.remove(&req);
                        Err(err)
                    }
                };
            }
        }

        // parameterised two cycle flow: learn the parameter oids first,
        // the bind is issued when the description arrives
        let name = ObjectName::next(&self.statement_prefix, &mut self.next_statement_id);
        let declared: Vec<Oid> = params.iter().map(Param::declared_oid).collect();

        self.send(frontend::Parse { prepare_name: name.as_str(), sql, oids: &declared });
        self.send(frontend::Describe { kind: b'S', name: name.as_str() });
        self.send(frontend::Sync);

        self.pending.push_back(PendingStage::Parse { req });
        self.pending.push_back(PendingStage::ParamDescription { req });
        self.pending.push_back(PendingStage::Describe { req });
        self.pending.push_back(PendingStage::Sync { req: Some(req) });

        let request = self.requests.get_mut(&req).expect("registered above");
        request.deferred = Some(DeferredBind {
            statement: name,
            params: params.into_iter().map(Param::into_owned).collect(),
            one_shot: !persistent,
            cache_key: persistent.then_some(sqlid),
        });

        Ok(handle)
    }

    /// Submit a `Parse`/`Describe` cycle for an explicit prepared statement.
    pub(crate) fn submit_prepare(
        &mut self,
        sql: &str,
        name: Option<&str>,
    ) -> Result<(QueryHandle, ObjectName)> {
        self.ensure_alive()?;

        let name = match name {
            Some(name) => ObjectName::named(name),
            None => ObjectName::next(&self.statement_prefix, &mut self.next_statement_id),
        };
        let (req, handle) = self.new_request(PgFormat::Binary, PgFormat::Binary, Vec::new());

        self.send(frontend::Parse { prepare_name: name.as_str(), sql, oids: &[] });
        self.send(frontend::Describe { kind: b'S', name: name.as_str() });
        self.send(frontend::Sync);

        self.pending.push_back(PendingStage::Parse { req });
        self.pending.push_back(PendingStage::ParamDescription { req });
        self.pending.push_back(PendingStage::Describe { req });
        self.pending.push_back(PendingStage::Sync { req: Some(req) });

        Ok((handle, name))
    }

    /// Submit a `Bind`/`Execute` cycle against an already prepared statement.
    pub(crate) fn submit_execute(
        &mut self,
        statement: &Statement,
        params: Vec<Param<'_>>,
        portal: Option<&str>,
        result_format: PgFormat,
        param_format: PgFormat,
        sinks: Vec<(SinkColumn, ByteSink)>,
    ) -> Result<QueryHandle> {
        self.ensure_alive()?;

        let (req, handle) = self.new_request(result_format, param_format, sinks);
        let desc = statement.desc.clone();
        let request = self.requests.get_mut(&req).expect("registered above");
        request.param_oids = statement.param_oids.clone();

        let portal = portal.unwrap_or("");
        let mut encoded = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let oid = statement.param_oids.get(i).copied().unwrap_or(0);
            match param.encode(oid, param_format) {
                Ok(value) => encoded.push(value),
                Err(err) => {
                    self.requests.remove(&req);
                    return Err(Error::from(err).context("binding parameters"));
                }
            }
        }

        self.send(frontend::Bind {
            portal_name: portal,
            stmt_name: statement.name.as_str(),
            param_formats: &[param_format],
            params: &encoded,
            result_formats: &[result_format],
        });
        self.send(frontend::Execute { portal_name: portal, max_row: 0 });
        self.send(frontend::Sync);

        self.pending.push_back(PendingStage::Bind { req });
        self.pending.push_back(PendingStage::Execute { req });
        self.pending.push_back(PendingStage::Sync { req: Some(req) });

        // the row layout is known since prepare time
        if let Some(desc) = desc {
            self.install_desc(req, rebind_format(&desc, result_format))?;
        } else {
            let request = self.requests.get_mut(&req).expect("registered above");
            let desc = Arc::new(RowDescription::no_data(self.registry.clone()));
            request.desc = Some(desc.clone());
            request.send(RowEvent::Names(desc));
        }

        Ok(handle)
    }

    /// Submit a `Close('S')` cycle for an explicit prepared statement.
    pub(crate) fn submit_close(&mut self, statement: &Statement) -> Result<QueryHandle> {
        self.ensure_alive()?;

        let (req, handle) = self.new_request(PgFormat::Binary, PgFormat::Binary, Vec::new());

        self.send(frontend::Close { variant: b'S', name: statement.name.as_str() });
        self.send(frontend::Sync);

        self.pending.push_back(PendingStage::Close { req: Some(req) });
        self.pending.push_back(PendingStage::Sync { req: Some(req) });

        Ok(handle)
    }

    /// Issue the deferred `Bind`/`Execute` once the description is known.
    fn issue_deferred(&mut self, req: RequestId) -> Result<()> {
        let Some(request) = self.requests.get_mut(&req) else { return Ok(()) };
        let Some(deferred) = request.deferred.take() else { return Ok(()) };
        let DeferredBind { statement, params, one_shot, cache_key } = deferred;

        let learned = request.param_oids.clone();
        let desc = request.desc.clone();
        let result = self.bind_execute(req, &statement, &learned, &params, None, one_shot);

        match result {
            Ok(()) => {
                if let (Some(key), Some(desc)) = (cache_key, desc) {
                    self.cache_statement(key, CachedStatement {
                        name: statement,
                        param_oids: learned,
                        desc,
                    });
                }
                Ok(())
            }
            Err(err) => {
                // parameter encoding failed after parse went out; reject the
                // request and still reclaim the statement
                if let Some(request) = self.requests.get_mut(&req) {
                    request.fail(err);
                }
                if one_shot {
                    self.send(frontend::Close { variant: b'S', name: statement.as_str() });
                    self.send(frontend::Sync);
                    self.pending.push_back(PendingStage::Close { req: None });
                    self.pending.push_back(PendingStage::Sync { req: None });
                }
                Ok(())
            }
        }
    }

    /// Encode `Bind`, `Execute`, optionally `Close`, and `Sync` for `req`.
    fn bind_execute(
        &mut self,
        req: RequestId,
        statement: &ObjectName,
        param_oids: &[Oid],
        params: &[Param<'_>],
        cached_desc: Option<Arc<RowDescription>>,
        close: bool,
    ) -> Result<()> {
        let request = self.requests.get_mut(&req).expect("request registered");
        let result_format = request.result_format;
        let param_format = request.param_format;

        let mut encoded = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let oid = param_oids.get(i).copied().unwrap_or(0);
            let value = param
                .encode(oid, param_format)
                .map_err(|err| Error::from(err).context("binding parameters"))?;
            encoded.push(value);
        }

        self.send(frontend::Bind {
            portal_name: "",
            stmt_name: statement.as_str(),
            param_formats: &[param_format],
            params: &encoded,
            result_formats: &[result_format],
        });
        self.send(frontend::Execute { portal_name: "", max_row: 0 });
        if close {
            self.send(frontend::Close { variant: b'S', name: statement.as_str() });
        }
        self.send(frontend::Sync);

        self.pending.push_back(PendingStage::Bind { req });
        self.pending.push_back(PendingStage::Execute { req });
        if close {
            self.pending.push_back(PendingStage::Close { req: Some(req) });
        }
        self.pending.push_back(PendingStage::Sync { req: Some(req) });

        if let Some(desc) = cached_desc {
            self.install_desc(req, rebind_format(&desc, result_format))?;
        }

        Ok(())
    }

    fn cache_statement(&mut self, key: u64, cached: CachedStatement) {
        verbose!("statement added: {}", cached.name);

        if let Some((_key, old)) = self.stmts.push(key, cached) {
            verbose!("statement removed: {}", old.name);

            self.send(frontend::Close { variant: b'S', name: old.name.as_str() });
            self.send(frontend::Sync);
            self.pending.push_back(PendingStage::Close { req: None });
            self.pending.push_back(PendingStage::Sync { req: None });
        }
    }

    /// Install a row description for `req` and resolve its sinks.
    fn install_desc(&mut self, req: RequestId, desc: Arc<RowDescription>) -> Result<()> {
        let Some(request) = self.requests.get_mut(&req) else { return Ok(()) };

        request.resolved_sinks = vec![None; desc.len()];
        let mut sink_error = None;
        for (i, (key, _)) in request.sinks.iter().enumerate() {
            let col = match key {
                SinkColumn::Index(n) => (*n < desc.len()).then_some(*n),
                SinkColumn::Name(name) => desc.position(name),
            };
            let Some(col) = col else {
                sink_error = Some("sink column not found in result");
                continue;
            };
            let column = &desc.columns()[col];
            if column.oid() != oid::BYTEA || column.is_array() {
                sink_error = Some("sink column is not bytea");
                continue;
            }
            request.resolved_sinks[col] = Some(i);
        }

        request.desc = Some(desc.clone());
        request.send(RowEvent::Names(desc));

        if let Some(reason) = sink_error {
            request.fail(ProtocolError::new(reason).into());
        }
        Ok(())
    }
}

/// The receive path: framing, correlation, and error unwinding.
impl Connection {
    /// Make one step of protocol progress.
    ///
    /// Flushes buffered frontend messages, then consumes and routes one
    /// backend message (or one chunk of a streaming row). Fatal errors poison
    /// the connection and fail every in flight request in pipeline order.
    pub(crate) fn poll_pump(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if let Some(reason) = &self.dead {
            let reason = reason.clone();
            return Poll::Ready(Err(
                io::Error::new(io::ErrorKind::NotConnected, reason).into(),
            ));
        }

        let result = ready!(self.poll_pump_inner(cx));
        if let Err(err) = &result {
            self.fail_all(&err.to_string());
        }
        Poll::Ready(result)
    }

    fn poll_pump_inner(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx))?;
        }

        if self.partial.is_some() {
            return self.poll_partial(cx);
        }

        loop {
            let Some(mut header) = self.read_buf.get(..5) else {
                self.read_buf.reserve(1024);
                ready!(self.poll_read_more(cx))?;
                continue;
            };

            let msgtype = header.get_u8();
            let len = header.get_i32() as usize;

            // a sink request consumes its rows incrementally so the frame
            // never has to be buffered whole
            if msgtype == backend::DataRow::MSGTYPE && !self.errored {
                if let Some(&PendingStage::Execute { req }) = self.pending.front() {
                    let streams = self.requests.get(&req).is_some_and(RequestState::has_sinks);
                    if streams {
                        self.read_buf.advance(5);
                        self.partial = Some(PartialRow::new(req, len - 4));
                        return self.poll_partial(cx);
                    }
                }
            }

            if self.read_buf.len() - 1/*msgtype*/ < len {
                self.read_buf.reserve(1 + len);
                ready!(self.poll_read_more(cx))?;
                continue;
            }

            self.read_buf.advance(5);
            let body = self.read_buf.split_to(len - 4).freeze();

            self.dispatch(msgtype, body)?;
            return Poll::Ready(Ok(()));
        }
    }

    fn poll_read_more(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        let n = ready!(poll_read(&mut self.socket, &mut self.read_buf, cx))?;
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Poll::Ready(Ok(()))
    }

    /// Resume consuming a streaming `DataRow`.
    fn poll_partial(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        let mut partial = self.partial.take().expect("partial row in progress");

        loop {
            // column count prefix
            let Some(cols) = partial.cols else {
                if self.read_buf.len() < 2 {
                    self.read_buf.reserve(64);
                    match self.poll_read_more(cx) {
                        Poll::Ready(Ok(())) => continue,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                        Poll::Pending => {
                            self.partial = Some(partial);
                            return Poll::Pending;
                        }
                    }
                }
                let cols = (&self.read_buf[..]).get_u16();
                self.read_buf.advance(2);
                let Some(remaining) = partial.remaining.checked_sub(2) else {
                    return Poll::Ready(Err(ProtocolError::new("DataRow shorter than its header").into()));
                };
                partial.remaining = remaining;
                partial.cols = Some(cols);
                partial.values = Vec::with_capacity(cols as usize);
                continue;
            };

            if partial.col == cols {
                return Poll::Ready(self.finish_partial(partial));
            }

            match partial.state {
                ColState::Len => {
                    if self.read_buf.len() < 4 {
                        self.read_buf.reserve(64);
                        match self.poll_read_more(cx) {
                            Poll::Ready(Ok(())) => continue,
                            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                            Poll::Pending => {
                                self.partial = Some(partial);
                                return Poll::Pending;
                            }
                        }
                    }
                    let len = (&self.read_buf[..]).get_i32();
                    self.read_buf.advance(4);
                    let Some(remaining) = partial.remaining.checked_sub(4) else {
                        return Poll::Ready(Err(ProtocolError::new("DataRow shorter than its header").into()));
                    };
                    partial.remaining = remaining;

                    if len == -1 {
                        partial.values.push(None);
                        partial.col += 1;
                        continue;
                    }
                    let len = len as usize;
                    if len > partial.remaining {
                        return Poll::Ready(Err(ProtocolError::new(
                            "DataRow column longer than its message",
                        )
                        .into()));
                    }

                    let sink = self
                        .requests
                        .get(&partial.req)
                        .and_then(|r| r.resolved_sinks.get(partial.col as usize))
                        .copied()
                        .flatten();
                    partial.state = match sink {
                        Some(sink) => ColState::Stream { remaining: len, sink },
                        None => ColState::Buffer { len },
                    };
                }
                ColState::Buffer { len } => {
                    if self.read_buf.len() < len {
                        self.read_buf.reserve(len);
                        match self.poll_read_more(cx) {
                            Poll::Ready(Ok(())) => continue,
                            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                            Poll::Pending => {
                                self.partial = Some(partial);
                                return Poll::Pending;
                            }
                        }
                    }
                    partial.values.push(Some(self.read_buf.split_to(len).freeze()));
                    partial.remaining -= len;
                    partial.col += 1;
                    partial.state = ColState::Len;
                }
                ColState::Stream { remaining, sink } => {
                    if remaining == 0 {
                        // the sink column's logical value lives in the sink
                        partial.values.push(None);
                        partial.col += 1;
                        partial.state = ColState::Len;
                        continue;
                    }
                    if self.read_buf.is_empty() {
                        self.read_buf.reserve(8 * 1024);
                        match self.poll_read_more(cx) {
                            Poll::Ready(Ok(())) => continue,
                            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                            Poll::Pending => {
                                self.partial = Some(partial);
                                return Poll::Pending;
                            }
                        }
                    }
                    let take = remaining.min(self.read_buf.len());
                    let failed = self
                        .requests
                        .get(&partial.req)
                        .is_none_or(|request| request.failed);
                    if !failed && partial.sink_error.is_none() {
                        let request = self.requests.get_mut(&partial.req).expect("checked above");
                        if let Err(err) = request.sinks[sink].1.write_all(&self.read_buf[..take]) {
                            partial.sink_error = Some(err);
                        }
                    }
                    self.read_buf.advance(take);
                    partial.remaining -= take;
                    partial.state = ColState::Stream { remaining: remaining - take, sink };
                }
            }
        }
    }

    fn finish_partial(&mut self, partial: PartialRow) -> Result<()> {
        if partial.remaining != 0 {
            return Err(ProtocolError::new("DataRow length does not match its columns").into());
        }

        let PartialRow { req, values, sink_error, .. } = partial;
        let Some(request) = self.requests.get_mut(&req) else { return Ok(()) };

        if let Some(err) = sink_error {
            request.fail(err.into());
            return Ok(());
        }
        if request.failed {
            return Ok(());
        }
        let Some(desc) = request.desc.clone() else {
            return Err(ProtocolError::new("DataRow before RowDescription").into());
        };
        request.send(RowEvent::Row(Row::new(desc, values)));
        Ok(())
    }

    /// Route one backend message to the owning request.
    fn dispatch(&mut self, msgtype: u8, body: Bytes) -> Result<()> {
        verbose!("(B){}", backend::BackendMessage::message_name(msgtype));

        // connection wide messages, valid at any point
        match msgtype {
            backend::ParameterStatus::MSGTYPE => {
                let status = backend::ParameterStatus::decode(msgtype, body)?;
                self.parameters
                    .insert(status.name.as_str().into(), status.value.as_str().into());
                return Ok(());
            }
            backend::NoticeResponse::MSGTYPE => {
                let notice = backend::NoticeResponse::new(body);
                match &mut self.on_notice {
                    Some(callback) => callback(&notice),
                    None => warning!("{notice}"),
                }
                return Ok(());
            }
            backend::NotificationResponse::MSGTYPE => {
                let notification = backend::NotificationResponse::decode(msgtype, body)?;
                match &mut self.on_notification {
                    Some(callback) => callback(&notification),
                    None => debug!(
                        "unobserved notification on {:?}: {:?}",
                        notification.channel, notification.payload,
                    ),
                }
                return Ok(());
            }
            backend::ErrorResponse::MSGTYPE => {
                self.unwind_error(backend::ErrorResponse::new(body));
                return Ok(());
            }
            backend::ReadyForQuery::MSGTYPE => {
                let ready = backend::ReadyForQuery::decode(msgtype, body)?;
                self.tx_status = match ready.tx_status {
                    b'T' => TransactionStatus::InTransaction,
                    b'E' => TransactionStatus::InError,
                    _ => TransactionStatus::Idle,
                };
                self.errored = false;

                match self.pending.pop_front() {
                    Some(PendingStage::Sync { req }) => {
                        if let Some(req) = req {
                            // a deferred bind appends a second cycle for the
                            // same request; its first sync completes nothing
                            let referenced =
                                self.pending.iter().any(|stage| stage.req() == Some(req));
                            if !referenced {
                                if let Some(request) = self.requests.get_mut(&req) {
                                    // prepare and close cycles have no Execute
                                    // stage, completion is the sync itself
                                    request.finish(None);
                                }
                                self.reap(req);
                            }
                        }
                        return Ok(());
                    }
                    other => {
                        return Err(ProtocolError::new(format!(
                            "ReadyForQuery while pipeline expected {other:?}",
                        ))
                        .into());
                    }
                }
            }
            _ => { }
        }

        // the server discards everything else until the Sync after an error
        if self.errored {
            return Ok(());
        }

        macro_rules! expect_stage {
            ($variant:ident) => {
                match self.pending.pop_front() {
                    Some(PendingStage::$variant { req }) => req,
                    other => {
                        return Err(ProtocolError::new(format!(
                            concat!(
                                "unexpected ",
                                stringify!($variant),
                                " response while pipeline expected {:?}",
                            ),
                            other,
                        ))
                        .into());
                    }
                }
            };
        }

        match msgtype {
            backend::ParseComplete::MSGTYPE => {
                let _req = expect_stage!(Parse);
            }
            backend::ParameterDescription::MSGTYPE => {
                let req = expect_stage!(ParamDescription);
                let description = backend::ParameterDescription::decode(msgtype, body)?;
                let oids = description.collect_oids();
                if let Some(request) = self.requests.get_mut(&req) {
                    request.param_oids = oids.clone();
                    request.send(RowEvent::Params(oids));
                }
            }
            backend::RowDescription::MSGTYPE => {
                let req = expect_stage!(Describe);
                let desc = RowDescription::parse(
                    body,
                    self.registry.clone(),
                    self.name_transform.as_deref(),
                )?;
                let statement_describe =
                    self.requests.get(&req).is_some_and(|r| r.deferred.is_some());
                let mut desc = desc;
                if statement_describe {
                    // format codes are unknown at statement describe time
                    let format = self
                        .requests
                        .get(&req)
                        .map(|r| r.result_format)
                        .unwrap_or_default();
                    desc.set_formats(format);
                }
                self.install_desc(req, Arc::new(desc))?;
                self.issue_deferred(req)?;
            }
            backend::NoData::MSGTYPE => {
                let req = expect_stage!(Describe);
                let desc = Arc::new(RowDescription::no_data(self.registry.clone()));
                self.install_desc(req, desc)?;
                self.issue_deferred(req)?;
            }
            backend::BindComplete::MSGTYPE => {
                let _req = expect_stage!(Bind);
            }
            backend::DataRow::MSGTYPE => {
                // not popped; the execute phase ends at CommandComplete
                let Some(&PendingStage::Execute { req }) = self.pending.front() else {
                    return Err(ProtocolError::new(format!(
                        "unexpected DataRow while pipeline expected {:?}",
                        self.pending.front(),
                    ))
                    .into());
                };
                let Some(request) = self.requests.get_mut(&req) else { return Ok(()) };
                if request.failed {
                    return Ok(());
                }
                let Some(desc) = request.desc.clone() else {
                    return Err(ProtocolError::new("DataRow before RowDescription").into());
                };
                let row = Row::decode_datarow(&desc, body)?;
                request.send(RowEvent::Row(row));
            }
            backend::CommandComplete::MSGTYPE => {
                let req = expect_stage!(Execute);
                let complete = backend::CommandComplete::decode(msgtype, body)?;
                if let Some(request) = self.requests.get_mut(&req) {
                    flush_sinks(request);
                    request.finish(Some(complete.tag));
                }
            }
            backend::EmptyQueryResponse::MSGTYPE => {
                let req = expect_stage!(Execute);
                if let Some(request) = self.requests.get_mut(&req) {
                    request.finish(None);
                }
            }
            backend::CloseComplete::MSGTYPE => {
                let _req = expect_stage!(Close);
            }
            backend::PortalSuspended::MSGTYPE => {
                // every Execute goes out with no row limit
                return Err(ProtocolError::new("PortalSuspended without a row limit").into());
            }
            _ => {
                // forward compatible: unknown messages are logged and skipped
                warning!(
                    "ignoring unknown backend message {:?}(0x{msgtype:02x})",
                    char::from(msgtype),
                );
            }
        }

        Ok(())
    }

    /// `ErrorResponse` mid pipeline: the current cycle up to its `Sync` is
    /// dead, the owning request gets the error, everything after is intact.
    fn unwind_error(&mut self, raw: backend::ErrorResponse) {
        let error = DatabaseError::parse(&raw);

        if let Some(callback) = &mut self.on_error {
            callback(&error);
        }

        let mut owner = None;
        while let Some(stage) = self.pending.front() {
            if matches!(stage, PendingStage::Sync { .. }) {
                break;
            }
            let stage = self.pending.pop_front().expect("peeked above");
            owner = owner.or(stage.req());
        }
        // a cycle whose data stages all completed, e.g. a failing Close
        if owner.is_none() {
            if let Some(PendingStage::Sync { req }) = self.pending.front() {
                owner = *req;
            }
        }

        match owner.and_then(|req| self.requests.get_mut(&req)) {
            Some(request) => request.fail(error.into()),
            None => warning!("server error outside any request: {error}"),
        }

        self.partial = None;
        self.errored = true;
    }

    /// Drop a completed request once no stage references it anymore.
    fn reap(&mut self, req: RequestId) {
        let done = self.requests.get(&req).is_none_or(|r| r.done);
        let referenced = self.pending.iter().any(|stage| stage.req() == Some(req));
        if done && !referenced {
            self.requests.remove(&req);
        }
    }

    /// Poison the connection and fail every in flight request, in pipeline order.
    fn fail_all(&mut self, reason: &str) {
        self.dead = Some(reason.to_string());
        self.partial = None;

        let mut order: Vec<RequestId> = Vec::new();
        for stage in &self.pending {
            if let Some(req) = stage.req() {
                if !order.contains(&req) {
                    order.push(req);
                }
            }
        }
        self.pending.clear();

        for req in order {
            if let Some(mut request) = self.requests.remove(&req) {
                request.fail(
                    io::Error::new(io::ErrorKind::BrokenPipe, reason.to_string()).into(),
                );
            }
        }
        self.requests.clear();
    }
}

fn flush_sinks(request: &mut RequestState) {
    for (_, sink) in &mut request.sinks {
        if let Err(err) = sink.flush() {
            request.failed = true;
            if !request.done {
                request.done = true;
                let _ = request.events.send(RowEvent::Fail(err.into()));
            }
            return;
        }
    }
}

/// Rebind a statement description to the format execution asked for.
fn rebind_format(desc: &Arc<RowDescription>, format: PgFormat) -> Arc<RowDescription> {
    let mut copy = RowDescription::clone(desc);
    copy.set_formats(format);
    Arc::new(copy)
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("socket", &self.socket)
            .field("process_id", &self.process_id)
            .field("tx_status", &self.tx_status)
            .field("encrypted", &self.encrypted)
            .field("in_flight", &self.requests.len())
            .field("pending", &self.pending)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        ready!(poll_write_all(&mut self.socket, &mut *self.write_buf, cx))?;
        self.write_buf.reset();
        Poll::Ready(Ok(()))
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx)?);
        }

        loop {
            let Some(mut header) = self.read_buf.get(..5) else {
                self.read_buf.reserve(1024);
                ready!(self.poll_read_more(cx))?;
                continue;
            };

            let msgtype = header.get_u8();
            let len = header.get_i32() as usize;

            if self.read_buf.len() - 1/*msgtype*/ < len {
                self.read_buf.reserve(1 + len);
                ready!(self.poll_read_more(cx))?;
                continue;
            }

            self.read_buf.advance(5);
            let body = self.read_buf.split_to(len - 4).freeze();

            match msgtype {
                backend::ErrorResponse::MSGTYPE => {
                    Err(backend::ErrorResponse::new(body))?;
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = backend::NoticeResponse::new(body);
                    match &mut self.on_notice {
                        Some(callback) => callback(&notice),
                        None => warning!("{notice}"),
                    }
                    continue;
                }
                _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
            }
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        verbose!("(F){:?}", char::from(F::MSGTYPE));
        self.write_buf.reserve(5 + message.size_hint() as usize);
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        verbose!("(F)Startup");
        startup.write(&mut self.write_buf);
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{
        ErrorKind,
        query::query,
        row::test::{datarow, description},
        sasl,
        sql::SqlExt,
        value::Value,
    };

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    impl Connection {
        fn test_pair_sized(buffer: usize) -> (Connection, DuplexStream) {
            let (client, server) = tokio::io::duplex(buffer);
            let conn = Connection {
                socket: Socket::duplex(client),
                read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
                write_buf: WriteBuf::new(),
                parameters: HashMap::new(),
                process_id: 0,
                secret_key: 0,
                tx_status: TransactionStatus::Idle,
                encrypted: false,
                connected_at: Instant::now(),
                statement_prefix: "tsp_".into(),
                name_transform: None,
                registry: Arc::new(TypeRegistry::default()),
                pending: VecDeque::new(),
                requests: HashMap::new(),
                next_request_id: 1,
                next_statement_id: 0,
                errored: false,
                dead: None,
                partial: None,
                stmts: LruCache::new(DEFAULT_PREPARED_STMT_CACHE),
                on_error: None,
                on_notice: None,
                on_notification: None,
            };
            (conn, server)
        }

        fn test_pair() -> (Connection, DuplexStream) {
            Self::test_pair_sized(1 << 16)
        }
    }

    fn frame(msgtype: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + body.len());
        out.push(msgtype);
        out.extend((body.len() as u32 + 4).to_be_bytes());
        out.extend(body);
        out
    }

    fn ready_idle() -> Vec<u8> {
        frame(b'Z', b"I")
    }

    fn command_complete(tag: &str) -> Vec<u8> {
        let mut body = Vec::from(tag.as_bytes());
        body.push(0);
        frame(b'C', &body)
    }

    fn error_response(code: &str, message: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(b"SERROR\0VERROR\0C");
        body.extend(code.as_bytes());
        body.push(0);
        body.push(b'M');
        body.extend(message.as_bytes());
        body.push(0);
        body.push(0);
        frame(b'E', &body)
    }

    fn parameter_description(oids: &[Oid]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend((oids.len() as u16).to_be_bytes());
        for oid in oids {
            body.extend(oid.to_be_bytes());
        }
        frame(b't', &body)
    }

    /// Read frontend frames off the wire until the cycle's `Sync`.
    async fn read_cycle(server: &mut DuplexStream) -> Vec<u8> {
        let mut types = Vec::new();
        loop {
            let msgtype = server.read_u8().await.unwrap();
            let len = server.read_i32().await.unwrap() as usize;
            let mut body = vec![0u8; len - 4];
            server.read_exact(&mut body).await.unwrap();
            types.push(msgtype);
            if msgtype == b'S' {
                return types;
            }
        }
    }

    /// The full response script of a one row `select`.
    fn select_one_response(name: &str, oid: Oid, value: &[u8]) -> Vec<u8> {
        let mut script = Vec::new();
        script.extend(frame(b'1', b"")); // ParseComplete
        script.extend(frame(b'2', b"")); // BindComplete
        script.extend(frame(b'T', &description(&[(name, oid)])));
        script.extend(frame(b'D', &datarow(&[Some(value)])));
        script.extend(command_complete("SELECT 1"));
        script.extend(frame(b'3', b"")); // CloseComplete
        script.extend(ready_idle());
        script
    }

    #[test]
    fn unparameterised_single_cycle() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let output = query("select 1", &mut conn).collect().await.unwrap();
                assert_eq!(output.names, ["?column?"]);
                assert_eq!(output.rows.len(), 1);
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(1));
                assert_eq!(output.status.as_deref(), Some("SELECT 1"));
                assert_eq!(output.rows_affected(), 1);
                assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
            };
            let server = async {
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'B', b'D', b'E', b'C', b'S']);
                let script = select_one_response("?column?", oid::INT4, &1i32.to_be_bytes());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    #[test]
    fn parameterised_deferred_bind_and_statement_cache() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                // dynamic parameter, its width comes from ParameterDescription
                let output = query("select $1::int as i", &mut conn)
                    .bind(Value::I64(2))
                    .collect()
                    .await
                    .unwrap();
                assert_eq!(output.names, ["i"]);
                assert_eq!(output.rows[0].value("i").unwrap(), Value::I32(2));

                // same sql again binds straight against the cached statement
                let output = query("select $1::int as i", &mut conn)
                    .bind(7i32)
                    .collect()
                    .await
                    .unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(7));
            };
            let server = async {
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'D', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(parameter_description(&[oid::INT4]));
                script.extend(frame(b'T', &description(&[("i", oid::INT4)])));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();

                // the deferred bind turns into a second cycle
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'B', b'E', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'2', b""));
                script.extend(frame(b'D', &datarow(&[Some(&2i32.to_be_bytes())])));
                script.extend(command_complete("SELECT 1"));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();

                // cache hit: no Parse, no Describe
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'B', b'E', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'2', b""));
                script.extend(frame(b'D', &datarow(&[Some(&7i32.to_be_bytes())])));
                script.extend(command_complete("SELECT 1"));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// {Q1=valid, Q2=invalid, Q3=valid} pipelined back to back;
    /// Q1 and Q3 resolve, Q2 rejects, the connection stays usable.
    #[test]
    fn pipeline_isolates_failures() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let q1 = query("select 1", &mut conn).submit().unwrap();
                let q2 = query("select 1 / 0 as j", &mut conn).submit().unwrap();
                let q3 = query("select 3", &mut conn).submit().unwrap();

                let output = q1.finish(&mut conn).await.unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(1));

                let err = q2.finish(&mut conn).await.unwrap_err();
                let db = err.as_db().expect("server error");
                assert_eq!(db.code(), "22012");
                assert!(db.message().contains("division by zero"));

                let output = q3.finish(&mut conn).await.unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(3));
                assert_eq!(output.status.as_deref(), Some("SELECT 1"));
            };
            let server = async {
                // all three cycles are on the wire before any response
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'B', b'D', b'E', b'C', b'S']);
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'B', b'D', b'E', b'C', b'S']);
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'B', b'D', b'E', b'C', b'S']);

                let mut script = select_one_response("?column?", oid::INT4, &1i32.to_be_bytes());
                // Q2 dies at execute; the server discards until Sync
                script.extend(error_response("22012", "division by zero"));
                script.extend(ready_idle());
                // Q3 unaffected
                script.extend(select_one_response("?column?", oid::INT4, &3i32.to_be_bytes()));
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// Empty query text resolves `{names: [], rows: [], status: None}`.
    #[test]
    fn empty_query_response() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let output = query("", &mut conn).collect().await.unwrap();
                assert!(output.names.is_empty());
                assert!(output.rows.is_empty());
                assert_eq!(output.status, None);
            };
            let server = async {
                read_cycle(&mut server).await;
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(frame(b'2', b""));
                script.extend(frame(b'n', b"")); // NoData
                script.extend(frame(b'I', b"")); // EmptyQueryResponse
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// A 2^22 byte `bytea` split across many reads streams into
    /// the caller's sink without the connection buffering the value.
    #[test]
    fn bytea_streams_into_sink() {
        use std::sync::Mutex;

        #[derive(Clone, Default)]
        struct SharedSink(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        rt().block_on(async {
            // a small duplex buffer forces the row across many reads
            let (mut conn, mut server) = Connection::test_pair_sized(8 * 1024);
            let payload: Vec<u8> = (0u32..1 << 22).map(|i| (i * 31 % 251) as u8).collect();

            let sink = SharedSink::default();
            let out = sink.clone();

            let client = async {
                let output = query("select body, 9 as n from blob", &mut conn)
                    .sink("body", sink)
                    .collect()
                    .await
                    .unwrap();
                assert_eq!(output.rows.len(), 1);
                // the sink column's slot is null, the bytes went to the sink
                assert_eq!(output.rows[0].value("body").unwrap(), Value::Null);
                assert_eq!(output.rows[0].value("n").unwrap(), Value::I32(9));
                // the read buffer never held the value
                assert!(conn.read_buf.capacity() < 64 * 1024);
            };
            let server = async {
                read_cycle(&mut server).await;
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(frame(b'2', b""));
                script.extend(frame(
                    b'T',
                    &description(&[("body", oid::BYTEA), ("n", oid::INT4)]),
                ));
                script.extend(frame(
                    b'D',
                    &datarow(&[Some(&payload), Some(&9i32.to_be_bytes())]),
                ));
                script.extend(command_complete("SELECT 1"));
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);

            assert_eq!(out.0.lock().unwrap().as_slice(), payload.as_slice());
        });
    }

    #[test]
    fn notifications_and_parameter_status_interleave() {
        use std::sync::{Arc as StdArc, Mutex};

        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();
            let seen = StdArc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            conn.on_notification(move |n| {
                sink.lock()
                    .unwrap()
                    .push((n.channel.as_str().to_owned(), n.payload.as_str().to_owned()));
            });

            let client = async {
                let output = query("listen foo", &mut conn).collect().await.unwrap();
                assert_eq!(output.status.as_deref(), Some("LISTEN"));
            };
            let server = async {
                read_cycle(&mut server).await;
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(frame(b'2', b""));
                script.extend(frame(b'n', b""));
                // async messages may interleave anywhere
                script.extend(frame(b'S', b"application_name\0blaster\0"));
                let mut notify = Vec::new();
                notify.extend(77u32.to_be_bytes());
                notify.extend(b"foo\0bar\0");
                script.extend(frame(b'A', &notify));
                script.extend(command_complete("LISTEN"));
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);

            assert_eq!(
                seen.lock().unwrap().as_slice(),
                [("foo".to_owned(), "bar".to_owned())],
            );
            assert_eq!(conn.parameter("application_name"), Some("blaster"));
        });
    }

    /// Dropping a result stream does not cancel the query, the remaining rows
    /// drain off the socket and later queries still work.
    #[test]
    fn dropped_handle_drains() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let q1 = query("select 1", &mut conn).submit().unwrap();
                drop(q1);
                let output = query("select 3", &mut conn).collect().await.unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(3));
            };
            let server = async {
                read_cycle(&mut server).await;
                read_cycle(&mut server).await;
                let mut script = select_one_response("a", oid::INT4, &1i32.to_be_bytes());
                script.extend(select_one_response("b", oid::INT4, &3i32.to_be_bytes()));
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    #[test]
    fn prepare_execute_close() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let stmt = conn.prepare("select $1::int as i").await.unwrap();
                assert_eq!(stmt.param_oids(), [oid::INT4]);
                assert_eq!(stmt.column_names(), ["i"]);

                let rows = stmt
                    .query(&mut conn)
                    .bind(1i32)
                    .fetch_all::<(i32,)>()
                    .await
                    .unwrap();
                assert_eq!(rows[0].0, 1);

                let rows = stmt
                    .query(&mut conn)
                    .bind(2i32)
                    .fetch_all::<(i32,)>()
                    .await
                    .unwrap();
                assert_eq!(rows[0].0, 2);

                stmt.close(&mut conn).await.unwrap();
            };
            let server = async {
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'D', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(parameter_description(&[oid::INT4]));
                script.extend(frame(b'T', &description(&[("i", oid::INT4)])));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();

                for value in [1i32, 2] {
                    let cycle = read_cycle(&mut server).await;
                    assert_eq!(cycle, [b'B', b'E', b'S']);
                    let mut script = Vec::new();
                    script.extend(frame(b'2', b""));
                    script.extend(frame(b'D', &datarow(&[Some(&value.to_be_bytes())])));
                    script.extend(command_complete("SELECT 1"));
                    script.extend(ready_idle());
                    server.write_all(&script).await.unwrap();
                }

                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'C', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// A one-shot (non persistent) parameterised query closes its statement
    /// inside the second cycle instead of caching it.
    #[test]
    fn one_shot_closes_statement() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let output = query("select $1::int".once(), &mut conn)
                    .bind(5i32)
                    .collect()
                    .await
                    .unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(5));
            };
            let server = async {
                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'P', b'D', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(parameter_description(&[oid::INT4]));
                script.extend(frame(b'T', &description(&[("int4", oid::INT4)])));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();

                let cycle = read_cycle(&mut server).await;
                assert_eq!(cycle, [b'B', b'E', b'C', b'S']);
                let mut script = Vec::new();
                script.extend(frame(b'2', b""));
                script.extend(frame(b'D', &datarow(&[Some(&5i32.to_be_bytes())])));
                script.extend(command_complete("SELECT 1"));
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// Socket loss mid pipeline fails every pending request, and the
    /// connection refuses further work.
    #[test]
    fn socket_loss_fails_pending_in_order() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let q1 = query("select 1", &mut conn).submit().unwrap();
                let q2 = query("select 2", &mut conn).submit().unwrap();

                let err = q1.finish(&mut conn).await.unwrap_err();
                assert!(matches!(err.kind(), ErrorKind::Io(_)), "{err:?}");
                let err = q2.finish(&mut conn).await.unwrap_err();
                assert!(matches!(err.kind(), ErrorKind::Io(_)), "{err:?}");

                let err = query("select 3", &mut conn).submit().unwrap_err();
                assert!(matches!(err.kind(), ErrorKind::Io(_)), "{err:?}");
            };
            let server = async {
                read_cycle(&mut server).await;
                read_cycle(&mut server).await;
                drop(server);
            };

            tokio::join!(client, server);
        });
    }

    /// Startup over the wire: md5 challenge, parameter capture, key data.
    #[test]
    fn startup_md5_challenge() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();
            let config = Config::new().user("postgres").password("hunter2");

            let client = async {
                let response = phase::startup(&config, &mut conn).await.unwrap();
                assert_eq!(response.backend_key_data.process_id, 42);
                assert_eq!(response.backend_key_data.secret_key, 117);
                assert_eq!(response.parameters.len(), 1);
            };
            let server = async {
                // startup message has no type byte
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                assert_eq!(&body[..4], 196_608u32.to_be_bytes());
                let body = String::from_utf8(body[4..].to_vec()).unwrap();
                assert!(body.contains("user\0postgres\0"));
                assert!(body.contains("client_encoding\0UTF8\0"));
                assert!(body.contains("extra_float_digits\02\0"));

                let salt = [9u8, 8, 7, 6];
                let mut challenge = Vec::new();
                challenge.extend(5u32.to_be_bytes());
                challenge.extend(salt);
                server.write_all(&frame(b'R', &challenge)).await.unwrap();

                // PasswordMessage
                let msgtype = server.read_u8().await.unwrap();
                assert_eq!(msgtype, b'p');
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                assert_eq!(body.pop(), Some(0));
                assert_eq!(
                    String::from_utf8(body).unwrap(),
                    sasl::md5_password("postgres", "hunter2", salt),
                );

                let mut script = Vec::new();
                script.extend(frame(b'R', &0u32.to_be_bytes())); // AuthenticationOk
                script.extend(frame(b'S', b"server_version\017.2\0"));
                let mut key_data = Vec::new();
                key_data.extend(42u32.to_be_bytes());
                key_data.extend(117u32.to_be_bytes());
                script.extend(frame(b'K', &key_data));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// Startup over the wire: the full SCRAM-SHA-256 exchange, with the
    /// server side recomputed here from RFC 5802.
    #[test]
    fn startup_scram_exchange() {
        use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
        use hmac::{Hmac, Mac};
        use sha2::{Digest, Sha256};

        fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
            Hmac::<Sha256>::new_from_slice(key)
                .unwrap()
                .chain_update(data)
                .finalize()
                .into_bytes()
                .into()
        }

        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();
            let config = Config::new().user("postgres").password("pencil");

            let client = async {
                let response = phase::startup(&config, &mut conn).await.unwrap();
                assert_eq!(response.backend_key_data.process_id, 7);
            };
            let server = async {
                // startup message
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();

                let mut request = Vec::new();
                request.extend(10u32.to_be_bytes());
                request.extend(b"SCRAM-SHA-256\0\0");
                server.write_all(&frame(b'R', &request)).await.unwrap();

                // SASLInitialResponse: mechanism, length, client first message
                assert_eq!(server.read_u8().await.unwrap(), b'p');
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                let nul = body.iter().position(|b| *b == 0).unwrap();
                assert_eq!(&body[..nul], b"SCRAM-SHA-256");
                let first = String::from_utf8(body[nul + 1 + 4..].to_vec()).unwrap();
                let client_nonce = first.strip_prefix("n,,n=*,r=").unwrap().to_owned();

                let salt = b"0123456789abcdef";
                let server_nonce = format!("{client_nonce}EXTENSION");
                let server_first =
                    format!("r={server_nonce},s={},i=1", BASE64.encode(salt));
                let mut challenge = Vec::new();
                challenge.extend(11u32.to_be_bytes());
                challenge.extend(server_first.as_bytes());
                server.write_all(&frame(b'R', &challenge)).await.unwrap();

                // SASLResponse: channel binding, nonce echo, proof
                assert_eq!(server.read_u8().await.unwrap(), b'p');
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                let finale = String::from_utf8(body).unwrap();
                let proof = finale
                    .strip_prefix(&format!("c=biws,r={server_nonce},p="))
                    .unwrap();
                let proof = BASE64.decode(proof).unwrap();

                // Hi with one iteration is a single hmac block
                let mut salted_input = salt.to_vec();
                salted_input.extend([0, 0, 0, 1]);
                let salted = hmac(b"pencil", &salted_input);
                let client_key = hmac(&salted, b"Client Key");
                let stored_key = Sha256::digest(client_key);
                let auth_message = format!(
                    "n=*,r={client_nonce},{server_first},c=biws,r={server_nonce}",
                );
                let client_signature = hmac(&stored_key, auth_message.as_bytes());
                let expected: Vec<u8> = client_key
                    .iter()
                    .zip(client_signature)
                    .map(|(k, s)| k ^ s)
                    .collect();
                assert_eq!(proof, expected, "client proof mismatch");

                let server_key = hmac(&salted, b"Server Key");
                let signature = BASE64.encode(hmac(&server_key, auth_message.as_bytes()));
                let mut outcome = Vec::new();
                outcome.extend(12u32.to_be_bytes());
                outcome.extend(format!("v={signature}").as_bytes());
                server.write_all(&frame(b'R', &outcome)).await.unwrap();

                let mut script = Vec::new();
                script.extend(frame(b'R', &0u32.to_be_bytes()));
                let mut key_data = Vec::new();
                key_data.extend(7u32.to_be_bytes());
                key_data.extend(13u32.to_be_bytes());
                script.extend(frame(b'K', &key_data));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// An authentication failure during startup is fatal.
    #[test]
    fn startup_error_is_fatal() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();
            let config = Config::new().user("postgres");

            let client = async {
                let err = phase::startup(&config, &mut conn).await.unwrap_err();
                let db = err.as_db().expect("server error");
                assert_eq!(db.code(), "28P01");
            };
            let server = async {
                let len = server.read_i32().await.unwrap() as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                let script = error_response("28P01", "password authentication failed");
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }

    /// Text format results decode through the text codecs.
    #[test]
    fn text_format_results() {
        rt().block_on(async {
            let (mut conn, mut server) = Connection::test_pair();

            let client = async {
                let output = query("select 1", &mut conn)
                    .format(PgFormat::Text)
                    .collect()
                    .await
                    .unwrap();
                assert_eq!(output.rows[0].value(0).unwrap(), Value::I32(1));
            };
            let server = async {
                read_cycle(&mut server).await;
                let mut script = Vec::new();
                script.extend(frame(b'1', b""));
                script.extend(frame(b'2', b""));
                // format code 0 in the portal description
                let mut desc = Vec::new();
                desc.extend(1u16.to_be_bytes());
                desc.extend(b"a\0");
                desc.extend(0u32.to_be_bytes());
                desc.extend(0u16.to_be_bytes());
                desc.extend(oid::INT4.to_be_bytes());
                desc.extend((-1i16).to_be_bytes());
                desc.extend((-1i32).to_be_bytes());
                desc.extend(0u16.to_be_bytes());
                script.extend(frame(b'T', &desc));
                script.extend(frame(b'D', &datarow(&[Some(b"1")])));
                script.extend(command_complete("SELECT 1"));
                script.extend(frame(b'3', b""));
                script.extend(ready_idle());
                server.write_all(&script).await.unwrap();
            };

            tokio::join!(client, server);
        });
    }
}
