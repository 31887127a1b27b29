use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use tessera_cql::frame::request::batch::BATCH_STATEMENTS_LIMIT;
use tessera_cql::frame::response::authenticate::Authenticate;
use tessera_cql::frame::response::Error;
use tessera_cql::frame::segment::{self, FrameAccumulator, MAX_PAYLOAD_SIZE};
use tessera_cql::frame::types::SerialConsistency;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::authentication::AuthenticatorProvider;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::Consistency;
use crate::transport::errors::{BadKeyspaceName, BadQuery, DbError, QueryError};
use crate::transport::prepared_cache::{PreparedEntry, PreparedStatementCache};
use crate::transport::query_result::QueryResult;
use crate::transport::Compression;

use tessera_cql::frame::{
    self,
    request::{self, batch as frame_batch, execute, query, register, SerializableRequest},
    response::{event::Event, result, NonErrorResponse, Response, ResponseOpcode},
    server_event_type::EventType,
    value::{BatchValues, SerializedValues, ValueList},
    FrameParams, ProtocolVersion, SerializedRequest,
};

const LOCAL_SCHEMA_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

// A caller that hits its deadline walks away, but the server still owes a
// response on that stream; until it arrives the id cannot be reused. Such
// "abandoned" streams are swept periodically, and a connection hoarding
// stale ones is clearly stuck and gets recycled by its pool.
const ABANDONED_STREAM_AGE_LIMIT: Duration = Duration::from_secs(2);
const ABANDONED_STREAM_COUNT_LIMIT: usize = 512;
const ABANDONED_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) struct Connection {
    _io_task: RemoteHandle<()>,

    host_id: Option<Uuid>,
    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ConnectionFeatures,
    current_keyspace: StdMutex<Option<VerifiedKeyspaceName>>,
    handle: Arc<ConnectionHandle>,
}

/// Framing in effect on the socket after the handshake.
#[derive(Debug, Copy, Clone)]
pub(crate) enum FramingMode {
    /// One classic frame after another, protocol 3/4.
    Legacy,
    /// Protocol 5 checksummed segments. Compression, when negotiated,
    /// happens here rather than per frame body.
    Modern { compression: Option<Compression> },
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ConnectionFeatures {
    pub(crate) protocol_version: ProtocolVersion,
    /// Compression negotiated with the server, if any.
    pub(crate) compression: Option<Compression>,
    pub(crate) framing: FramingMode,
}

// A monotonic ticket distinguishing requests over the connection's
// lifetime; unlike stream ids, tickets are never reused, so a stale
// abandonment notice can not hit a recycled stream.
type RequestTicket = u64;

/// What a suspended caller is waiting on.
#[derive(Debug)]
struct Completion {
    tx: oneshot::Sender<Result<RawResponse, QueryError>>,
    ticket: RequestTicket,
}

#[derive(Debug)]
struct RawResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

struct OutboundRequest {
    frame: SerializedRequest,
    completion: Completion,
}

/// The caller-side face of the I/O task.
struct ConnectionHandle {
    outbound: mpsc::Sender<OutboundRequest>,
    ticket_counter: AtomicU64,
    // Unbounded so that a Drop impl can push into it without awaiting.
    abandoned_tx: mpsc::UnboundedSender<RequestTicket>,
}

impl ConnectionHandle {
    async fn request(&self, frame: SerializedRequest) -> Result<RawResponse, QueryError> {
        let ticket = self.ticket_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Until defused, dropping the guard tells the I/O task that nobody
        // is waiting on this ticket anymore.
        let guard = AbandonGuard {
            armed: true,
            ticket,
            channel: &self.abandoned_tx,
        };

        self.outbound
            .send(OutboundRequest {
                frame,
                completion: Completion { tx, ticket },
            })
            .await
            .map_err(|_| connection_broken())?;

        let response = rx.await.map_err(|_| connection_broken())?;

        guard.defuse();
        response
    }
}

fn connection_broken() -> QueryError {
    QueryError::IoError(Arc::new(std::io::Error::new(
        ErrorKind::Other,
        "Connection broken",
    )))
}

struct AbandonGuard<'a> {
    armed: bool,
    ticket: RequestTicket,
    channel: &'a mpsc::UnboundedSender<RequestTicket>,
}

impl AbandonGuard<'_> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.channel.send(self.ticket);
        }
    }
}

/// Hands out stream ids. Fresh ids come from a rising counter until the
/// whole positive range has been visited once; afterwards the allocator
/// runs on returned ids, oldest first, so a just-freed id stays out of
/// circulation as long as possible.
struct StreamIdRing {
    next_fresh: i32,
    returned: VecDeque<i16>,
}

impl StreamIdRing {
    fn new() -> Self {
        Self {
            next_fresh: 0,
            returned: VecDeque::new(),
        }
    }

    fn acquire(&mut self) -> Option<i16> {
        if self.next_fresh <= i16::MAX as i32 {
            let id = self.next_fresh as i16;
            self.next_fresh += 1;
            return Some(id);
        }
        self.returned.pop_front()
    }

    fn release(&mut self, id: i16) {
        self.returned.push_back(id);
    }
}

/// Everything the I/O task tracks about requests in flight: who waits on
/// which stream, which tickets map to which streams, and which streams
/// belong to callers that already gave up.
struct InFlightRegistry {
    ids: StreamIdRing,
    waiting: HashMap<i16, Completion>,
    stream_of: HashMap<RequestTicket, i16>,
    abandoned_since: HashMap<i16, Instant>,
}

enum Delivery {
    /// Somebody is waiting; hand them the response.
    Deliver(Completion),
    /// The caller is gone; drop the response, the stream is free again.
    Discard,
    /// Nothing was ever sent on this stream.
    Unsolicited,
}

impl InFlightRegistry {
    fn new() -> Self {
        Self {
            ids: StreamIdRing::new(),
            waiting: HashMap::new(),
            stream_of: HashMap::new(),
            abandoned_since: HashMap::new(),
        }
    }

    // On success the returned stream id stays blocked until the response
    // arrives or the caller abandons the request.
    fn begin(&mut self, completion: Completion) -> Result<i16, Completion> {
        let Some(stream) = self.ids.acquire() else {
            return Err(completion);
        };
        self.stream_of.insert(completion.ticket, stream);
        self.waiting.insert(stream, completion);
        Ok(stream)
    }

    fn abandon(&mut self, ticket: RequestTicket) {
        if let Some(stream) = self.stream_of.remove(&ticket) {
            trace!("Caller abandoned stream {}", stream);
            self.waiting.remove(&stream);
            self.abandoned_since.insert(stream, Instant::now());
        }
    }

    fn accept_response(&mut self, stream: i16) -> Delivery {
        if self.abandoned_since.remove(&stream).is_some() {
            // The overdue response finally came; only now may the id
            // circulate again.
            self.ids.release(stream);
            return Delivery::Discard;
        }
        match self.waiting.remove(&stream) {
            Some(completion) => {
                self.stream_of.remove(&completion.ticket);
                self.ids.release(stream);
                Delivery::Deliver(completion)
            }
            None => Delivery::Unsolicited,
        }
    }

    // Linear over the abandoned set, which is empty on a healthy
    // connection and swept only a few times a minute.
    fn stale_abandoned_count(&self, age_limit: Duration) -> usize {
        let now = Instant::now();
        self.abandoned_since
            .values()
            .filter(|since| now.duration_since(**since) > age_limit)
            .count()
    }

    fn drain_waiting(self) -> impl Iterator<Item = Completion> {
        self.waiting.into_values()
    }
}

pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

// A QueryResponse in which response can not be Response::Error
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(self) -> Result<NonErrorQueryResponse, QueryError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        self.into_non_error_query_response()?.into_query_result()
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&result::SchemaChange> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        let (rows, paging_state, col_specs, serialized_size) = match self.response {
            NonErrorResponse::Result(result::Result::Rows(rs)) => (
                Some(rs.rows),
                rs.metadata.paging_state,
                rs.metadata.col_specs,
                rs.serialized_size,
            ),
            NonErrorResponse::Result(_) => (None, None, vec![], 0),
            _ => {
                return Err(QueryError::ProtocolError(
                    "Unexpected server response, expected Result or Error",
                ))
            }
        };

        Ok(QueryResult {
            rows,
            warnings: self.warnings,
            tracing_id: self.tracing_id,
            paging_state,
            col_specs,
            serialized_size,
        })
    }
}

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    /// `None` means autodetection: try 5, then 4, then 3.
    pub(crate) protocol_version: Option<ProtocolVersion>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) write_timeout: Option<Duration>,
    // should be Some only in control connections
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) default_consistency: Consistency,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) throw_on_overload: bool,
    pub(crate) enable_write_coalescing: bool,

    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            protocol_version: None,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(5),
            write_timeout: None,
            event_sender: None,
            default_consistency: Default::default(),
            authenticator: None,
            throw_on_overload: false,
            enable_write_coalescing: true,

            keepalive_interval: None,
            keepalive_timeout: None,
        }
    }
}

// Used to listen for a fatal error on the connection
pub(crate) type ErrorReceiver = tokio::sync::oneshot::Receiver<QueryError>;

impl Connection {
    // Takes over a stream on which the handshake has already completed
    // and starts the I/O task for it.
    fn start_io(
        host_id: Option<Uuid>,
        addr: SocketAddr,
        stream: TcpStream,
        config: ConnectionConfig,
        features: ConnectionFeatures,
    ) -> (Self, ErrorReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel();
        let (abandoned_tx, abandoned_rx) = mpsc::unbounded_channel();

        let handle = Arc::new(ConnectionHandle {
            outbound: outbound_tx,
            ticket_counter: AtomicU64::new(0),
            abandoned_tx,
        });

        let (io_future, _io_task) = Self::run_io(
            config.clone(),
            features,
            stream,
            outbound_rx,
            fatal_tx,
            abandoned_rx,
            handle.clone(),
        )
        .remote_handle();
        tokio::task::spawn(io_future);

        let connection = Connection {
            _io_task,
            host_id,
            config,
            features,
            current_keyspace: StdMutex::new(None),
            connect_address: addr,
            handle,
        };

        (connection, fatal_rx)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) async fn prepare(&self, query: &Query) -> Result<PreparedStatement, QueryError> {
        let query_response = self
            .send_request(
                &request::Prepare {
                    query: &query.contents,
                },
                true,
                query.config.tracing,
            )
            .await?;

        let mut prepared_statement = match query_response.response {
            Response::Error(err) => return Err(err.into()),
            Response::Result(result::Result::Prepared(p)) => PreparedStatement::new(
                p.id,
                p.result_metadata_id,
                p.prepared_metadata,
                query.contents.clone(),
                query.get_page_size(),
                query.config.clone(),
            ),
            _ => {
                return Err(QueryError::ProtocolError(
                    "PREPARE: Unexpected server response",
                ))
            }
        };

        if let Some(tracing_id) = query_response.tracing_id {
            prepared_statement.prepare_tracing_ids.push(tracing_id);
        }
        Ok(prepared_statement)
    }

    // Prepares the statement on this connection and returns the per-host
    // cache entry for it. Used through the prepared-statement cache.
    pub(crate) async fn prepare_entry(&self, statement: &str) -> Result<PreparedEntry, QueryError> {
        let prepared = self.prepare(&Query::new(statement)).await?;
        Ok(PreparedEntry::new(
            prepared.get_id().clone(),
            prepared.get_result_metadata_id(),
        ))
    }

    pub(crate) async fn reprepare(
        &self,
        query: impl Into<Query>,
        previous_prepared: &PreparedStatement,
    ) -> Result<(), QueryError> {
        let reprepare_query: Query = query.into();
        let reprepared = self.prepare(&reprepare_query).await?;
        // A repreparation must yield the same id - it's a hash
        // of the statement contents.
        if reprepared.get_id() != previous_prepared.get_id() {
            Err(QueryError::ProtocolError(
                "Prepared statement id changed after repreparation",
            ))
        } else {
            Ok(())
        }
    }

    pub(crate) async fn query_single_page(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        let query: Query = query.into();

        // This method is only used for driver-internal queries.
        let consistency = query
            .config
            .determine_consistency(self.config.default_consistency);
        let serial_consistency = query.config.serial_consistency;

        self.query_with_consistency(&query, &values, consistency, serial_consistency, None)
            .await?
            .into_query_result()
    }

    pub(crate) async fn query(
        &self,
        query: &Query,
        values: impl ValueList,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        // This method is only used for driver-internal queries.
        self.query_with_consistency(
            query,
            values,
            query
                .config
                .determine_consistency(self.config.default_consistency),
            query.config.serial_consistency,
            paging_state,
        )
        .await
    }

    pub(crate) async fn query_with_consistency(
        &self,
        query: &Query,
        values: impl ValueList,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        let serialized_values = values.serialized()?;

        let query_frame = query::Query {
            contents: Cow::Borrowed(&query.contents),
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                values: serialized_values,
                page_size: query.get_page_size(),
                paging_state,
                skip_metadata: false,
                timestamp: query.get_timestamp(),
            },
        };

        self.send_request(&query_frame, true, query.config.tracing)
            .await
    }

    pub(crate) async fn execute_with_consistency(
        &self,
        prepared_statement: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        let make_execute_frame = |metadata_id: Option<Bytes>| execute::Execute {
            id: prepared_statement.get_id().clone(),
            result_metadata_id: metadata_id,
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: prepared_statement.get_page_size(),
                timestamp: prepared_statement.get_timestamp(),
                skip_metadata: false,
                paging_state: paging_state.clone(),
            },
        };

        let metadata_id = self.effective_metadata_id(prepared_statement.get_result_metadata_id());
        let execute_frame = make_execute_frame(metadata_id);

        let query_response = self
            .send_request(&execute_frame, true, prepared_statement.config.tracing)
            .await?;

        match &query_response.response {
            Response::Error(Error {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    "Connection::execute: got DbError::Unprepared - repreparing statement with id {:?}",
                    statement_id
                );
                // Repreparation is done on the same connection to preserve
                // ordering with the retried EXECUTE.
                self.reprepare(prepared_statement.get_statement(), prepared_statement)
                    .await?;
                let metadata_id =
                    self.effective_metadata_id(prepared_statement.get_result_metadata_id());
                let execute_frame = make_execute_frame(metadata_id);
                let query_response = self
                    .send_request(&execute_frame, true, prepared_statement.config.tracing)
                    .await?;
                self.absorb_new_metadata_id(&query_response, |new_id| {
                    prepared_statement.update_result_metadata_id(new_id)
                });
                Ok(query_response)
            }
            _ => {
                self.absorb_new_metadata_id(&query_response, |new_id| {
                    prepared_statement.update_result_metadata_id(new_id)
                });
                Ok(query_response)
            }
        }
    }

    /// Executes a prepared statement, resolving the per-host statement id
    /// through the prepared cache with single-flight semantics. UNPREPARED
    /// responses invalidate the entry and re-prepare on this connection.
    pub(crate) async fn execute_cached(
        &self,
        cache: &PreparedStatementCache,
        prepared_statement: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        let host_id = match self.host_id {
            Some(host_id) => host_id,
            // Connections outside any pool (control connection) bypass
            // the cache.
            None => {
                return self
                    .execute_with_consistency(
                        prepared_statement,
                        values,
                        consistency,
                        serial_consistency,
                        paging_state,
                    )
                    .await
            }
        };

        let key = cache.key(
            host_id,
            self.keyspace_name().as_deref(),
            prepared_statement.get_statement(),
        );

        let entry = cache
            .get_or_prepare(key.clone(), || {
                self.prepare_entry(prepared_statement.get_statement())
            })
            .await?;

        // The id is a hash of the statement text, so every host must agree.
        if entry.id() != prepared_statement.get_id() {
            return Err(QueryError::ProtocolError(
                "Prepared statement ids differ between hosts, they should all be equal",
            ));
        }

        let make_execute_frame = |metadata_id: Option<Bytes>| execute::Execute {
            id: entry.id().clone(),
            result_metadata_id: metadata_id,
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: prepared_statement.get_page_size(),
                timestamp: prepared_statement.get_timestamp(),
                skip_metadata: false,
                paging_state: paging_state.clone(),
            },
        };

        let metadata_id = self.effective_metadata_id(entry.result_metadata_id());
        let query_response = self
            .send_request(
                &make_execute_frame(metadata_id),
                true,
                prepared_statement.config.tracing,
            )
            .await?;

        let query_response = match &query_response.response {
            Response::Error(Error {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    "Connection::execute_cached: got DbError::Unprepared - repreparing statement with id {:?}",
                    statement_id
                );
                cache.invalidate(&key);
                let entry = cache
                    .get_or_prepare(key.clone(), || {
                        self.prepare_entry(prepared_statement.get_statement())
                    })
                    .await?;
                if entry.id() != prepared_statement.get_id() {
                    return Err(QueryError::ProtocolError(
                        "Prepared statement id changed after repreparation",
                    ));
                }

                let metadata_id = self.effective_metadata_id(entry.result_metadata_id());
                self.send_request(
                    &make_execute_frame(metadata_id),
                    true,
                    prepared_statement.config.tracing,
                )
                .await?
            }
            _ => query_response,
        };

        // Metadata_changed: converge the cache entry even for callers
        // holding a stale view of the statement.
        self.absorb_new_metadata_id(&query_response, |new_id| {
            cache.update_result_metadata(&key, new_id.clone());
            prepared_statement.update_result_metadata_id(new_id);
        });

        Ok(query_response)
    }

    // On protocol 5 an EXECUTE must carry a metadata id; a statement prepared
    // on an older connection may not have one, in which case an empty id is
    // sent and the server replies with Metadata_changed.
    fn effective_metadata_id(&self, metadata_id: Option<Bytes>) -> Option<Bytes> {
        if self.features.protocol_version >= ProtocolVersion::V5 {
            metadata_id.or_else(|| Some(Bytes::new()))
        } else {
            None
        }
    }

    fn absorb_new_metadata_id(&self, query_response: &QueryResponse, apply: impl FnOnce(Bytes)) {
        if let Response::Result(result::Result::Rows(rows)) = &query_response.response {
            if let Some(new_id) = &rows.metadata.new_metadata_id {
                apply(new_id.clone());
            }
        }
    }

    pub(crate) async fn batch_with_consistency(
        &self,
        batch: &Batch,
        values: impl BatchValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResult, QueryError> {
        // Validated client-side; the wire field is 16 bits.
        if batch.statements.len() > BATCH_STATEMENTS_LIMIT {
            return Err(QueryError::BadQuery(
                BadQuery::TooManyQueriesInBatchStatement(batch.statements.len()),
            ));
        }

        let batch_frame = frame_batch::Batch {
            statements: Cow::Borrowed(&batch.statements),
            values,
            batch_type: batch.get_type(),
            consistency,
            serial_consistency,
            timestamp: batch.get_timestamp(),
        };

        loop {
            let query_response = self
                .send_request(&batch_frame, true, batch.config.tracing)
                .await?;

            return match query_response.response {
                Response::Error(err) => match err.error {
                    DbError::Unprepared { statement_id } => {
                        debug!("Connection::batch: got DbError::Unprepared - repreparing statement with id {:?}", statement_id);
                        let prepared_statement = batch.statements.iter().find_map(|s| match s {
                            BatchStatement::PreparedStatement(s) if *s.get_id() == statement_id => {
                                Some(s)
                            }
                            _ => None,
                        });
                        if let Some(p) = prepared_statement {
                            self.reprepare(p.get_statement(), p).await?;
                            continue;
                        } else {
                            return Err(QueryError::ProtocolError(
                                "The server returned a prepared statement id that did not exist in the batch",
                            ));
                        }
                    }
                    _ => Err(err.into()),
                },
                Response::Result(_) => Ok(query_response.into_query_result()?),
                _ => Err(QueryError::ProtocolError(
                    "BATCH: Unexpected server response",
                )),
            };
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        // Sending "USE " + keyspace_name is the only way to set a keyspace;
        // it cannot be passed as a bound value.
        let query: Query = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let query_response = self.query(&query, (), None).await?;

        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if set_keyspace.keyspace_name.to_lowercase()
                    != keyspace_name.as_str().to_lowercase()
                {
                    return Err(QueryError::ProtocolError(
                        "USE <keyspace_name> returned response with different keyspace name",
                    ));
                }

                *self.current_keyspace.lock().unwrap() = Some(keyspace_name.clone());
                Ok(())
            }
            Response::Error(err) => Err(err.into()),
            _ => Err(QueryError::ProtocolError(
                "USE <keyspace_name> returned unexpected response",
            )),
        }
    }

    pub(crate) fn keyspace_name(&self) -> Option<String> {
        self.current_keyspace
            .lock()
            .unwrap()
            .as_ref()
            .map(|ks| ks.as_str().to_owned())
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, QueryError> {
        let (version_id,): (Uuid,) = self
            .query_single_page(LOCAL_SCHEMA_VERSION, &[] as &[i32])
            .await?
            .single_row_typed()
            .map_err(|_| QueryError::ProtocolError("Could not read schema version"))?;
        Ok(version_id)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, QueryError> {
        let compression = if compress {
            self.features.compression
        } else {
            None
        };

        let frame = SerializedRequest::make(
            request,
            self.features.protocol_version,
            compression,
            tracing,
        )?;

        let raw = self.handle.request(frame).await?;

        Self::decode_response(raw, self.features.protocol_version, self.features.compression)
    }

    fn decode_response(
        raw: RawResponse,
        version: ProtocolVersion,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, QueryError> {
        let body_with_ext =
            frame::parse_response_body_extensions(raw.params.flags, compression, raw.body)?;

        for warning in &body_with_ext.warnings {
            warn!(
                warning = warning.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(version, raw.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
        })
    }

    async fn run_io(
        config: ConnectionConfig,
        features: ConnectionFeatures,
        stream: TcpStream,
        outbound_rx: mpsc::Receiver<OutboundRequest>,
        fatal_tx: tokio::sync::oneshot::Sender<QueryError>,
        abandoned_rx: mpsc::UnboundedReceiver<RequestTicket>,
        handle: Arc<ConnectionHandle>,
    ) {
        let (read_half, write_half) = split(stream);

        // Shared by the futures below, which all run on this one task and
        // never hold the lock across an await; a std mutex only exists to
        // satisfy the borrow checker, at no real synchronization cost.
        let registry = StdMutex::new(InFlightRegistry::new());

        let reading = Self::read_loop(
            BufReader::with_capacity(8192, read_half),
            &registry,
            &config,
            features,
        );
        let writing = Self::write_loop(
            BufWriter::with_capacity(8192, write_half),
            &registry,
            outbound_rx,
            features.framing,
            config.enable_write_coalescing,
            config.write_timeout,
        );
        let reaping = Self::reap_abandoned(&registry, abandoned_rx);
        let probing = Self::heartbeat_loop(
            handle,
            features.protocol_version,
            config.keepalive_interval,
            config.keepalive_timeout,
        );

        let error = match futures::try_join!(reading, writing, reaping, probing) {
            // The connection was dropped and the queues closed; nothing
            // to report.
            Ok(_) => return,
            Err(error) => error,
        };

        // Whoever is still suspended gets the fatal error...
        let registry = registry.into_inner().unwrap();
        for completion in registry.drain_waiting() {
            let _ = completion.tx.send(Err(error.clone()));
        }
        // ...and so does the pool, which then replaces this connection.
        let _ = fatal_tx.send(error);
    }

    async fn read_loop(
        mut source: (impl AsyncRead + Unpin),
        registry: &StdMutex<InFlightRegistry>,
        config: &ConnectionConfig,
        features: ConnectionFeatures,
    ) -> Result<(), QueryError> {
        let mut reassembly = FrameAccumulator::new();
        let mut decoded_frames: VecDeque<Bytes> = VecDeque::new();

        loop {
            let (params, opcode, body) = match features.framing {
                FramingMode::Legacy => {
                    frame::read_response_frame(&mut source, features.protocol_version).await?
                }
                FramingMode::Modern { compression } => loop {
                    if let Some(whole_frame) = decoded_frames.pop_front() {
                        break frame::parse_response_frame(whole_frame, features.protocol_version)?;
                    }
                    let seg = segment::read_segment(&mut source, compression).await?;
                    decoded_frames.extend(reassembly.feed(seg)?);
                },
            };

            // Stream -1 carries server-pushed events; no other negative
            // stream is ever assigned by servers.
            if params.stream == -1 {
                if let Some(event_sender) = config.event_sender.as_ref() {
                    Self::forward_event(
                        RawResponse {
                            params,
                            opcode,
                            body,
                        },
                        features,
                        event_sender,
                    )
                    .await?;
                }
                continue;
            }
            if params.stream < -1 {
                continue;
            }

            let delivery = registry.lock().unwrap().accept_response(params.stream);
            match delivery {
                Delivery::Deliver(completion) => {
                    // A dropped receiver is fine: the caller raced its own
                    // abandonment notice and stopped listening.
                    let _ = completion.tx.send(Ok(RawResponse {
                        params,
                        opcode,
                        body,
                    }));
                }
                Delivery::Discard => {}
                Delivery::Unsolicited => {
                    debug!("Response on stream {} which nothing was sent on", params.stream);
                    return Err(QueryError::ProtocolError(
                        "Received response on an unused stream",
                    ));
                }
            }
        }
    }

    async fn write_loop(
        mut sink: (impl AsyncWrite + Unpin),
        registry: &StdMutex<InFlightRegistry>,
        mut outbound_rx: mpsc::Receiver<OutboundRequest>,
        framing: FramingMode,
        coalesce_writes: bool,
        write_timeout: Option<Duration>,
    ) -> Result<(), QueryError> {
        // When the Connection is dropped the sender side closes, recv()
        // yields None and the whole I/O task winds down.
        while let Some(first) = outbound_rx.recv().await {
            // Gather everything already queued into one write. Yielding
            // once gives concurrent requesters a brief chance to add to
            // the batch, trading a hair of latency for fewer syscalls.
            let mut batch = vec![first];
            let mut yielded = false;
            loop {
                match outbound_rx.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) if coalesce_writes && !yielded => {
                        yielded = true;
                        tokio::task::yield_now().await;
                    }
                    Err(_) => break,
                }
            }

            let mut wire_bytes: Vec<u8> = Vec::new();
            // Frames waiting to share one self-contained segment.
            let mut segment_batch: Vec<u8> = Vec::new();
            let mut request_count = 0;

            for outbound in batch {
                let OutboundRequest {
                    mut frame,
                    completion,
                } = outbound;

                let stream = match registry.lock().unwrap().begin(completion) {
                    Ok(stream) => stream,
                    Err(completion) => {
                        // All 2^15 streams busy; this caller fails fast and
                        // its pool will pick a sibling connection.
                        let _ = completion.tx.send(Err(QueryError::UnableToAllocStreamId));
                        continue;
                    }
                };
                frame.set_stream(stream);
                request_count += 1;

                let frame_bytes = frame.get_data();
                match framing {
                    FramingMode::Legacy => wire_bytes.extend_from_slice(frame_bytes),
                    FramingMode::Modern { compression } => {
                        if frame_bytes.len() > MAX_PAYLOAD_SIZE {
                            // An oversized frame gets its own run of segments.
                            flush_segment_batch(&mut segment_batch, compression, &mut wire_bytes)?;
                            segment::encode_frame(frame_bytes, compression, &mut wire_bytes)?;
                        } else {
                            if segment_batch.len() + frame_bytes.len() > MAX_PAYLOAD_SIZE {
                                flush_segment_batch(
                                    &mut segment_batch,
                                    compression,
                                    &mut wire_bytes,
                                )?;
                            }
                            segment_batch.extend_from_slice(frame_bytes);
                        }
                    }
                }
            }

            if let FramingMode::Modern { compression } = framing {
                flush_segment_batch(&mut segment_batch, compression, &mut wire_bytes)?;
            }

            trace!("Writing {} requests; {} bytes", request_count, wire_bytes.len());

            let write_everything = async {
                sink.write_all(&wire_bytes).await?;
                sink.flush().await
            };
            match write_timeout {
                Some(limit) => tokio::time::timeout(limit, write_everything)
                    .await
                    .map_err(|_| {
                        QueryError::IoError(Arc::new(std::io::Error::new(
                            ErrorKind::TimedOut,
                            "Write to the socket timed out",
                        )))
                    })??,
                None => write_everything.await?,
            }
        }

        Ok(())
    }

    // Collects abandonment notices and periodically checks whether the
    // connection is drowning in streams nobody will ever read.
    async fn reap_abandoned(
        registry: &StdMutex<InFlightRegistry>,
        mut abandoned_rx: mpsc::UnboundedReceiver<RequestTicket>,
    ) -> Result<(), QueryError> {
        let mut sweep = tokio::time::interval(ABANDONED_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                notice = abandoned_rx.recv() => {
                    match notice {
                        Some(ticket) => registry.lock().unwrap().abandon(ticket),
                        None => return Ok(()),
                    }
                }
                _ = sweep.tick() => {
                    let stale = registry
                        .lock()
                        .unwrap()
                        .stale_abandoned_count(ABANDONED_STREAM_AGE_LIMIT);
                    if stale > ABANDONED_STREAM_COUNT_LIMIT {
                        warn!("{} streams are stuck waiting for responses nobody wants", stale);
                        return Err(QueryError::TooManyOrphanedStreamIds(stale as u16));
                    }
                }
            }
        }
    }

    // Sends an OPTIONS probe every keepalive interval; a missing or
    // overdue SUPPORTED reply condemns the connection.
    async fn heartbeat_loop(
        handle: Arc<ConnectionHandle>,
        version: ProtocolVersion,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
    ) -> Result<(), QueryError> {
        let Some(interval) = keepalive_interval else {
            return Ok(());
        };

        loop {
            tokio::time::sleep(interval).await;

            let probe = async {
                let frame = SerializedRequest::make(&request::Options, version, None, false)?;
                let response = handle.request(frame).await?;
                match response.opcode {
                    ResponseOpcode::Supported => Ok(()),
                    _ => Err(QueryError::ProtocolError(
                        "Unexpected response to a keepalive OPTIONS request",
                    )),
                }
            };

            let outcome = match keepalive_timeout {
                Some(limit) => tokio::time::timeout(limit, probe).await.unwrap_or_else(|_| {
                    Err(QueryError::IoError(Arc::new(std::io::Error::new(
                        ErrorKind::TimedOut,
                        "No response to a keepalive request in time",
                    ))))
                }),
                None => probe.await,
            };

            if let Err(error) = outcome {
                warn!("Keepalive request failed: {}", error);
                return Err(error);
            }
        }
    }

    async fn forward_event(
        raw: RawResponse,
        features: ConnectionFeatures,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), QueryError> {
        let response =
            Self::decode_response(raw, features.protocol_version, features.compression)?.response;
        let event = match response {
            Response::Event(event) => event,
            other => {
                warn!("Expected an Event frame on stream -1, got {:?}", other);
                return Ok(());
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| connection_broken())
    }
}

fn flush_segment_batch(
    segment_batch: &mut Vec<u8>,
    compression: Option<Compression>,
    out: &mut Vec<u8>,
) -> Result<(), QueryError> {
    if !segment_batch.is_empty() {
        segment::encode_segment(segment_batch, true, compression, out)?;
        segment_batch.clear();
    }
    Ok(())
}

/// Opens a connection and performs the handshake: OPTIONS/SUPPORTED
/// negotiation, STARTUP, the optional SASL exchange and event
/// registration. With no protocol version pinned in the config,
/// unsupported-version rejections cause a downgrade and another attempt.
pub(crate) async fn open_connection(
    host_id: Option<Uuid>,
    addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), QueryError> {
    let autodetect = config.protocol_version.is_none();
    let mut version = config.protocol_version.unwrap_or(ProtocolVersion::V5);

    loop {
        match try_open_connection(host_id, addr, &config, version).await {
            Err(err) if autodetect && is_protocol_version_rejection(&err) => {
                match version.try_downgrade() {
                    Some(lower) => {
                        debug!(
                            "Server at {} rejected protocol version {}, retrying with {}",
                            addr, version, lower
                        );
                        version = lower;
                    }
                    None => return Err(err),
                }
            }
            other => return other,
        }
    }
}

fn is_protocol_version_rejection(err: &QueryError) -> bool {
    match err {
        QueryError::DbError(DbError::ProtocolError, _) => true,
        QueryError::InvalidMessage(msg) => msg.contains("protocol version"),
        _ => false,
    }
}

async fn try_open_connection(
    host_id: Option<Uuid>,
    addr: SocketAddr,
    config: &ConnectionConfig,
    version: ProtocolVersion,
) -> Result<(Connection, ErrorReceiver), QueryError> {
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
    {
        Ok(stream) => stream?,
        Err(_) => return Err(QueryError::TimeoutError),
    };
    stream.set_nodelay(config.tcp_nodelay)?;
    let mut stream = stream;

    // The handshake happens on the raw stream, before the I/O task is
    // spawned, so that the framing mode is already fixed when it starts.
    let mut handshaker = Handshaker::new(&mut stream, version);

    let options_result = handshaker.request(&request::Options).await?;

    let mut supported = match options_result {
        Response::Supported(supported) => supported,
        Response::Error(Error { error, reason }) => return Err(QueryError::DbError(error, reason)),
        _ => {
            return Err(QueryError::ProtocolError(
                "Wrong response to OPTIONS message was received",
            ));
        }
    };

    let supported_compression = supported.options.remove("COMPRESSION").unwrap_or_default();

    let mut compression = None;
    if let Some(requested) = config.compression {
        let compression_str = requested.to_string();
        if supported_compression.iter().any(|c| c == &compression_str)
            && requested.is_allowed_on(version)
        {
            // Compression is reported to be supported by the server,
            // request it from the server
            compression = Some(requested);
        }
        // Otherwise fall back to no compression.
    }

    let mut options = HashMap::new();
    options.insert("CQL_VERSION".to_string(), "4.0.0".to_string());
    options.insert(
        "DRIVER_NAME".to_string(),
        "tessera-rust-driver".to_string(),
    );
    options.insert(
        "DRIVER_VERSION".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Some(compression) = compression {
        options.insert("COMPRESSION".to_string(), compression.to_string());
    }
    if config.throw_on_overload {
        options.insert("THROW_ON_OVERLOAD".to_string(), "1".to_string());
    }

    let startup_result = handshaker.request(&request::Startup { options }).await?;

    // Protocol 5 switches to the segment layer right after the server's
    // response to STARTUP; the SASL exchange already uses it.
    if version.uses_segment_framing() {
        handshaker.enable_modern_framing(compression);
    }

    match startup_result {
        Response::Ready => {}
        Response::Authenticate(authenticate) => {
            perform_authenticate(&mut handshaker, config, &authenticate).await?;
        }
        Response::Error(Error { error, reason }) => return Err(QueryError::DbError(error, reason)),
        _ => {
            return Err(QueryError::ProtocolError(
                "Unexpected response to STARTUP message",
            ))
        }
    }

    if config.event_sender.is_some() {
        let register_frame = register::Register {
            event_types_to_register_for: vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
        };
        match handshaker.request(&register_frame).await? {
            Response::Ready => {}
            Response::Error(err) => return Err(err.into()),
            _ => {
                return Err(QueryError::ProtocolError(
                    "Unexpected response to REGISTER message",
                ))
            }
        }
    }

    let features = ConnectionFeatures {
        protocol_version: version,
        compression,
        framing: handshaker.framing(),
    };

    Ok(Connection::start_io(
        host_id,
        addr,
        stream,
        config.clone(),
        features,
    ))
}

async fn perform_authenticate(
    handshaker: &mut Handshaker<'_>,
    config: &ConnectionConfig,
    authenticate: &Authenticate,
) -> Result<(), QueryError> {
    let authenticator = &authenticate.authenticator_name as &str;

    match &config.authenticator {
        Some(authenticator_provider) => {
            let (mut response, mut auth_session) = authenticator_provider
                .start_authentication_session(authenticator)
                .await
                .map_err(QueryError::InvalidMessage)?;

            loop {
                match handshaker
                    .request(&request::AuthResponse { response })
                    .await?
                {
                    Response::AuthChallenge(challenge) => {
                        response = auth_session
                            .evaluate_challenge(challenge.authenticate_message.as_deref())
                            .await
                            .map_err(QueryError::InvalidMessage)?;
                    }
                    Response::AuthSuccess(success) => {
                        auth_session
                            .success(success.success_message.as_deref())
                            .await
                            .map_err(QueryError::InvalidMessage)?;
                        break;
                    }
                    Response::Error(err) => {
                        return Err(err.into());
                    }
                    _ => {
                        return Err(QueryError::ProtocolError(
                            "Unexpected response to AUTH_RESPONSE message",
                        ))
                    }
                }
            }
        }
        None => return Err(QueryError::InvalidMessage(
            "Authentication is required. You can use SessionBuilder::user(\"user\", \"pass\") to provide credentials \
                    or SessionBuilder::authenticator_provider to provide a custom authenticator".to_string(),
        )),
    }

    Ok(())
}

// Drives request/response exchanges on the raw stream during the handshake.
struct Handshaker<'a> {
    stream: &'a mut TcpStream,
    version: ProtocolVersion,
    framing: FramingMode,
    reassembly: FrameAccumulator,
    decoded_frames: VecDeque<Bytes>,
}

impl<'a> Handshaker<'a> {
    fn new(stream: &'a mut TcpStream, version: ProtocolVersion) -> Self {
        Self {
            stream,
            version,
            framing: FramingMode::Legacy,
            reassembly: FrameAccumulator::new(),
            decoded_frames: VecDeque::new(),
        }
    }

    fn enable_modern_framing(&mut self, compression: Option<Compression>) {
        self.framing = FramingMode::Modern { compression };
    }

    fn framing(&self) -> FramingMode {
        self.framing
    }

    async fn request(&mut self, req: &impl SerializableRequest) -> Result<Response, QueryError> {
        // Handshake frames are never compressed at the frame level.
        let mut frame = SerializedRequest::make(req, self.version, None, false)?;
        frame.set_stream(0);

        match self.framing {
            FramingMode::Legacy => self.stream.write_all(frame.get_data()).await?,
            FramingMode::Modern { compression } => {
                let mut out = Vec::new();
                segment::encode_frame(frame.get_data(), compression, &mut out)?;
                self.stream.write_all(&out).await?;
            }
        }
        self.stream.flush().await?;

        loop {
            let (params, opcode, body) = match self.framing {
                FramingMode::Legacy => {
                    frame::read_response_frame(&mut self.stream, self.version).await?
                }
                FramingMode::Modern { compression } => loop {
                    if let Some(whole_frame) = self.decoded_frames.pop_front() {
                        break frame::parse_response_frame(whole_frame, self.version)?;
                    }
                    let seg = segment::read_segment(&mut self.stream, compression).await?;
                    self.decoded_frames.extend(self.reassembly.feed(seg)?);
                },
            };

            // Events may start arriving right after REGISTER is processed.
            // They can be dropped - a metadata refresh follows connection
            // setup anyway.
            if params.stream < 0 {
                continue;
            }

            let body_with_ext = frame::parse_response_body_extensions(params.flags, None, body)?;
            return Ok(Response::deserialize(
                self.version,
                opcode,
                &mut &*body_with_ext.body,
            )?);
        }
    }
}

/// A keyspace name that passed the syntactic rules, so that it can be
/// safely spliced into a USE statement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<str>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    // The server caps keyspace names at 48 characters, all of them
    // alphanumeric or underscores.
    pub(crate) fn new(name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        if name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let char_count = name.chars().count();
        if char_count > 48 {
            return Err(BadKeyspaceName::TooLong(name, char_count));
        }

        if let Some(forbidden) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
        {
            return Err(BadKeyspaceName::IllegalCharacter(name, forbidden));
        }

        Ok(VerifiedKeyspaceName {
            name: name.into(),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion_pair() -> (Completion, oneshot::Receiver<Result<RawResponse, QueryError>>) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx, ticket: 0 }, rx)
    }

    #[test]
    fn stream_ids_prefer_never_used_ids() {
        let mut ring = StreamIdRing::new();
        assert_eq!(ring.acquire(), Some(0));
        assert_eq!(ring.acquire(), Some(1));

        // A freed id stays parked while unused ids remain.
        ring.release(0);
        assert_eq!(ring.acquire(), Some(2));
    }

    #[test]
    fn stream_ids_recycle_in_release_order_once_exhausted() {
        let mut ring = StreamIdRing::new();
        for expected in 0..=i16::MAX {
            assert_eq!(ring.acquire(), Some(expected));
        }
        assert_eq!(ring.acquire(), None);

        ring.release(5);
        ring.release(9);
        assert_eq!(ring.acquire(), Some(5));
        assert_eq!(ring.acquire(), Some(9));
        assert_eq!(ring.acquire(), None);
    }

    #[test]
    fn registry_delivers_to_the_waiting_caller() {
        let mut registry = InFlightRegistry::new();
        let (completion, _rx) = completion_pair();
        let stream = registry.begin(completion).unwrap();

        assert!(matches!(
            registry.accept_response(stream),
            Delivery::Deliver(_)
        ));
        // The stream is free again; a duplicate response is unsolicited.
        assert!(matches!(
            registry.accept_response(stream),
            Delivery::Unsolicited
        ));
    }

    #[test]
    fn abandoned_stream_discards_its_late_response() {
        let mut registry = InFlightRegistry::new();
        let (completion, _rx) = completion_pair();
        let ticket = completion.ticket;
        let stream = registry.begin(completion).unwrap();

        registry.abandon(ticket);
        assert_eq!(registry.stale_abandoned_count(Duration::ZERO), 1);

        // The late response frees the id without anyone to deliver to.
        assert!(matches!(registry.accept_response(stream), Delivery::Discard));
        assert_eq!(registry.stale_abandoned_count(Duration::ZERO), 0);
        assert_eq!(registry.ids.acquire(), Some(stream));
    }

    #[test]
    fn fresh_abandonments_are_not_stale_yet() {
        let mut registry = InFlightRegistry::new();
        let (completion, _rx) = completion_pair();
        let ticket = completion.ticket;
        registry.begin(completion).unwrap();
        registry.abandon(ticket);

        assert_eq!(registry.stale_abandoned_count(Duration::from_secs(3600)), 0);
    }

    #[test]
    fn keyspace_names_are_validated() {
        assert!(VerifiedKeyspaceName::new("tracking_2024".to_string(), false).is_ok());
        assert!(matches!(
            VerifiedKeyspaceName::new(String::new(), false),
            Err(BadKeyspaceName::Empty)
        ));
        assert!(matches!(
            VerifiedKeyspaceName::new("k".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        ));
        assert!(matches!(
            VerifiedKeyspaceName::new("no spaces allowed".to_string(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, ' '))
        ));
    }
}
