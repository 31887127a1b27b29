//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to perform queries.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use itertools::Itertools;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::authentication::AuthenticatorProvider;
use crate::routing::partitioner::PartitionerName;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::{Consistency, SerialConsistency, StatementConfig};
use crate::transport::cluster::{Cluster, ClusterData};
use crate::transport::connection::{Connection, NonErrorQueryResponse, VerifiedKeyspaceName};
use crate::transport::connection_pool::PoolConfig;
use crate::transport::errors::{BadQuery, NewSessionError, QueryError};
use crate::transport::iterator::{PreparedIteratorConfig, RowIterator, RowIteratorConfig};
use crate::transport::load_balancing::{
    LoadBalancingPolicy, RoundRobinPolicy, Statement, TokenAwarePolicy,
};
use crate::transport::metrics::Metrics;
use crate::transport::prepared_cache::{
    PreparedStatementCache, RoutingInfoCache, RoutingKeyInfo,
};
use crate::transport::query_result::QueryResult;
use crate::transport::retry_policy::{
    enforce_idempotency_gate, DefaultRetryPolicy, QueryInfo, RetryDecision, RetryPolicy,
    RetrySession,
};
use crate::transport::speculative_execution::{self, SpeculativeExecutionPolicy};
use crate::transport::Compression;
use tessera_cql::frame::request::batch::BATCH_STATEMENTS_LIMIT;
use tessera_cql::frame::response::result;
use tessera_cql::frame::response::NonErrorResponse;
use tessera_cql::frame::value::{BatchValues, BatchValuesIterator, SerializedValues, ValueList};
use tessera_cql::frame::ProtocolVersion;

pub(crate) use crate::transport::connection::QueryResponse;

/// Address of a node, either a resolved socket address or a hostname
/// to be resolved on connection.
#[derive(Debug, Clone)]
pub enum KnownNode {
    Hostname(String),
    Address(SocketAddr),
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](crate::transport::session_builder::SessionBuilder).
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup.
    /// The session will connect to these nodes to retrieve information about
    /// other nodes in the cluster. Each node can be a hostname or an IP address.
    pub known_nodes: Vec<KnownNode>,

    /// The port used for nodes given as hostnames without an explicit port,
    /// and for peers discovered without an explicit native port.
    pub port: u16,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by the database server, the session will fall
    /// back to no compression.
    pub compression: Option<Compression>,

    /// The native protocol version to use. `None` means auto-detection:
    /// the highest supported version is tried first, downgrading when the
    /// server rejects it.
    pub protocol_version: Option<ProtocolVersion>,

    pub tcp_nodelay: bool,

    /// Keyspace to be used on all connections.\
    /// Each connection will send `"USE <keyspace_name>"` before sending any
    /// requests. This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,
    pub keyspace_case_sensitive: bool,

    /// Consistency used for queries which do not specify their own.
    pub default_consistency: Consistency,
    /// Serial consistency used for conditional queries which do not specify
    /// their own.
    pub default_serial_consistency: Option<SerialConsistency>,

    /// Client-side timeout for all requests; `None` means no timeout.
    pub request_timeout: Option<Duration>,

    /// Timeout for establishing a single TCP connection.
    pub connect_timeout: Duration,

    /// Timeout for a single write to the socket; a connection whose write
    /// exceeds it is treated as broken.
    pub write_timeout: Option<Duration>,

    /// Backoff between attempts to reopen connections to a node.
    pub reconnect_interval: Duration,

    /// How many connections the driver opens to every node.
    pub num_conns_per_host: usize,

    /// Bound on the per-host prepared statement cache.
    pub max_prepared_stmts: usize,

    /// Bound on the routing info cache used to route unprepared statements.
    pub max_routing_key_info: usize,

    /// The default policy deciding on retries, overridable per statement.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// When set, idempotent statements may be raced with speculative
    /// executions on further nodes.
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    /// The policy yielding candidate nodes for each query.
    pub host_selection_policy: Arc<dyn LoadBalancingPolicy>,

    /// Provider of the SASL authentication exchange.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Disables registering for schema change events on the control
    /// connection. Topology and status events are always registered for.
    pub disable_schema_events: bool,

    /// If true, full schema metadata (tables, columns, types, functions)
    /// is fetched with every metadata refresh.
    pub fetch_schema_metadata: bool,

    /// Interval of sending heartbeat OPTIONS requests on idle connections.
    /// If `None`, heartbeats are never sent.
    pub keepalive_interval: Option<Duration>,

    /// A connection which does not respond to a heartbeat within this time
    /// is closed. No effect without `keepalive_interval`.
    pub keepalive_timeout: Option<Duration>,

    /// Asks the server to reject requests instead of queueing them when
    /// it is overloaded.
    pub throw_on_overload: bool,

    /// Interval between metadata refreshes not triggered by events.
    pub cluster_metadata_refresh_interval: Duration,

    /// If true, the driver reschedules the socket-writing task before
    /// flushing, giving it a chance to coalesce more requests into a
    /// single syscall.
    pub enable_write_coalescing: bool,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration.
    /// # Default configuration
    /// * Compression: None
    /// * Host selection policy: Token-aware Round-robin
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            port: 9042,
            compression: None,
            protocol_version: None,
            tcp_nodelay: true,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            default_consistency: Consistency::default(),
            default_serial_consistency: Some(SerialConsistency::Serial),
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            write_timeout: None,
            reconnect_interval: Duration::from_secs(1),
            num_conns_per_host: 2,
            max_prepared_stmts: 1000,
            max_routing_key_info: 1000,
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            host_selection_policy: Arc::new(TokenAwarePolicy::new(Box::new(
                RoundRobinPolicy::new(),
            ))),
            authenticator: None,
            disable_schema_events: false,
            fetch_schema_metadata: true,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            throw_on_overload: false,
            cluster_metadata_refresh_interval: Duration::from_secs(60),
            enable_write_coalescing: true,
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, the config's `port` is used.
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of known database servers with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    /// Adds a list of known database servers with IP addresses
    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl std::borrow::Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }
}

/// Creates a default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub use crate::transport::query_result::IntoTypedRows;

pub(crate) enum RunQueryResult<ResT> {
    IgnoredWriteError,
    Completed(ResT),
}

/// `Session` manages connections to the cluster and allows to perform queries
pub struct Session {
    cluster: Cluster,
    config: SessionConfig,
    metrics: Arc<Metrics>,
    prepared_cache: Arc<PreparedStatementCache>,
    routing_info_cache: Arc<RoutingInfoCache>,
    keyspace_name: ArcSwapOption<String>,
}

/// Represents a CQL session, which can be used to communicate
/// with the database
impl Session {
    /// Establishes a CQL session with the database.
    ///
    /// Usually it's easier to use
    /// [SessionBuilder](crate::transport::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        // Ensure there is at least one known node
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let mut initial_peers = Vec::with_capacity(config.known_nodes.len());
        for node in &config.known_nodes {
            match node {
                KnownNode::Hostname(hostname) => {
                    initial_peers.extend(resolve_hostname(hostname, config.port).await?);
                }
                KnownNode::Address(address) => initial_peers.push(*address),
            }
        }

        let connection_config = crate::transport::connection::ConnectionConfig {
            compression: config.compression,
            protocol_version: config.protocol_version,
            tcp_nodelay: config.tcp_nodelay,
            connect_timeout: config.connect_timeout,
            write_timeout: config.write_timeout,
            event_sender: None,
            default_consistency: config.default_consistency,
            authenticator: config.authenticator.clone(),
            throw_on_overload: config.throw_on_overload,
            enable_write_coalescing: config.enable_write_coalescing,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
        };

        let pool_config = PoolConfig {
            connection_config,
            pool_size: config.num_conns_per_host,
            reconnect_interval: config.reconnect_interval,
        };

        let cluster = Cluster::new(
            initial_peers,
            pool_config,
            config.fetch_schema_metadata,
            config.disable_schema_events,
            config.cluster_metadata_refresh_interval,
        )
        .await?;

        let session = Session {
            cluster,
            metrics: Arc::new(Metrics::new()),
            prepared_cache: Arc::new(PreparedStatementCache::new(config.max_prepared_stmts)),
            routing_info_cache: Arc::new(RoutingInfoCache::new(config.max_routing_key_info)),
            keyspace_name: ArcSwapOption::default(), // will be set by use_keyspace
            config,
        };

        if let Some(keyspace_name) = session.config.used_keyspace.clone() {
            session
                .use_keyspace(keyspace_name, session.config.keyspace_case_sensitive)
                .await?;
        }

        Ok(session)
    }

    /// Sends a query to the database and receives a response.\
    /// Returns only a single page of results; to receive multiple pages use
    /// [query_iter](Session::query_iter).
    ///
    /// This is the easiest way to make a query, but performance is worse
    /// than that of prepared queries.
    pub async fn query(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        self.query_paged(query, values, None).await
    }

    /// Queries the database with a custom paging state.
    ///
    /// # Arguments
    ///
    /// * `query` - query to be performed
    /// * `values` - values bound to the query
    /// * `paging_state` - previously received paging state or None
    pub async fn query_paged(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, QueryError> {
        let query: Query = query.into();
        let serialized_values = values.serialized()?.into_owned();

        let statement_info = self
            .routing_info_for_unprepared(&query.contents, &serialized_values)
            .await;

        let consistency = query.config.determine_consistency(self.config.default_consistency);
        let serial_consistency = query
            .config
            .serial_consistency
            .or(self.config.default_serial_consistency);

        let values_ref = &serialized_values;
        let paging_state_ref = &paging_state;
        let query_ref = &query;

        let run_query_result = self
            .run_query(
                statement_info,
                &query.config,
                |node| async move { node.random_connection().await },
                |connection: Arc<Connection>, consistency: Consistency| {
                    async move {
                        connection
                            .query_with_consistency(
                                query_ref,
                                values_ref,
                                consistency,
                                serial_consistency,
                                paging_state_ref.clone(),
                            )
                            .await
                            .and_then(QueryResponse::into_non_error_query_response)
                    }
                },
                consistency,
            )
            .await?;

        let response = match run_query_result {
            RunQueryResult::IgnoredWriteError => NonErrorQueryResponse {
                response: NonErrorResponse::Result(result::Result::Void),
                tracing_id: None,
                warnings: Vec::new(),
            },
            RunQueryResult::Completed(response) => response,
        };

        self.handle_set_keyspace_response(&response).await?;

        response.into_query_result()
    }

    /// Runs a query with paging.\
    /// Returns an async iterator (stream) over all received rows.\
    /// Page size can be specified in the [Query] passed to the function.
    pub async fn query_iter(
        &self,
        query: impl Into<Query>,
        values: impl ValueList,
    ) -> Result<RowIterator, QueryError> {
        let query: Query = query.into();
        let serialized_values = values.serialized()?.into_owned();

        let statement_info = self
            .routing_info_for_unprepared(&query.contents, &serialized_values)
            .await;

        RowIterator::new_for_query(
            query,
            serialized_values,
            statement_info,
            self.row_iterator_config(),
        )
        .await
    }

    /// Prepares a statement on the server side and returns a prepared
    /// statement, which can later be used to perform more efficient queries.
    ///
    /// Prepared queries are much faster than simple queries:
    /// * The database doesn't need to parse the query
    /// * They are properly load balanced using token aware routing
    ///
    /// > ***Warning***\
    /// > For token-aware load balancing to work properly, all partition key
    /// > values must be sent as bound values.
    pub async fn prepare(&self, query: impl Into<Query>) -> Result<PreparedStatement, QueryError> {
        let query = query.into();
        let query_ref = &query;

        let cluster_data = self.get_cluster_data();
        let connections_iter = cluster_data.iter_working_connections()?;

        // Prepare statements on all connections concurrently
        let handles = connections_iter.map(|c| async move { c.prepare(query_ref).await });
        let mut results = join_all(handles).await.into_iter();

        // If at least one prepare was successful, `prepare()` returns Ok.
        // Find the first result that is Ok, or Err if all failed.
        let first_ok: Result<PreparedStatement, QueryError> =
            results.by_ref().find_or_first(Result::is_ok).unwrap();
        let mut prepared: PreparedStatement = first_ok?;

        // Validate prepared ids equality
        for statement in results.flatten() {
            if prepared.get_id() != statement.get_id() {
                return Err(QueryError::ProtocolError(
                    "Prepared statement ids differ, all should be equal",
                ));
            }

            // Collect all tracing ids from prepare() queries in the final result
            prepared
                .prepare_tracing_ids
                .extend(statement.prepare_tracing_ids);
        }

        prepared.set_partitioner_name(self.pick_partitioner_for(&prepared, &cluster_data));

        Ok(prepared)
    }

    // A table can override the cluster-wide partitioner.
    fn pick_partitioner_for(
        &self,
        prepared: &PreparedStatement,
        cluster_data: &ClusterData,
    ) -> PartitionerName {
        let table_override = (|| {
            let keyspace = prepared.get_keyspace_name()?;
            let table = prepared.get_table_name()?;
            let partitioner = cluster_data
                .keyspaces
                .get(keyspace)?
                .tables
                .get(table)?
                .partitioner
                .as_deref()?;
            PartitionerName::from_str(partitioner)
        })();

        table_override.unwrap_or(*cluster_data.partitioner_name())
    }

    /// Execute a prepared statement. Requires a [PreparedStatement]
    /// generated using [`Session::prepare`].\
    /// Returns only a single page of results; to receive multiple pages use
    /// [execute_iter](Session::execute_iter).
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: impl ValueList,
    ) -> Result<QueryResult, QueryError> {
        self.execute_paged(prepared, values, None).await
    }

    /// Executes a previously prepared statement with a previously received
    /// paging state.
    pub async fn execute_paged(
        &self,
        prepared: &PreparedStatement,
        values: impl ValueList,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, QueryError> {
        let serialized_values = values.serialized()?.into_owned();
        let values_ref = &serialized_values;
        let paging_state_ref = &paging_state;

        let token = prepared.calculate_token(&serialized_values)?;

        let statement_info = Statement {
            token: token.clone(),
            keyspace: prepared
                .get_keyspace_name()
                .map(ToOwned::to_owned)
                .or_else(|| self.keyspace_name.load_full().map(|ks| (*ks).clone())),
        };

        let consistency = prepared
            .config
            .determine_consistency(self.config.default_consistency);
        let serial_consistency = prepared
            .config
            .serial_consistency
            .or(self.config.default_serial_consistency);

        let cache = &self.prepared_cache;

        let run_query_result: RunQueryResult<NonErrorQueryResponse> = self
            .run_query(
                statement_info,
                &prepared.config,
                |node| {
                    let token = token.clone();
                    async move {
                        match token {
                            Some(token) => node.connection_for_token(&token).await,
                            None => node.random_connection().await,
                        }
                    }
                },
                |connection: Arc<Connection>, consistency: Consistency| async move {
                    connection
                        .execute_cached(
                            cache,
                            prepared,
                            values_ref,
                            consistency,
                            serial_consistency,
                            paging_state_ref.clone(),
                        )
                        .await
                        .and_then(QueryResponse::into_non_error_query_response)
                },
                consistency,
            )
            .await?;

        let response = match run_query_result {
            RunQueryResult::IgnoredWriteError => NonErrorQueryResponse {
                response: NonErrorResponse::Result(result::Result::Void),
                tracing_id: None,
                warnings: Vec::new(),
            },
            RunQueryResult::Completed(response) => response,
        };

        self.handle_set_keyspace_response(&response).await?;

        response.into_query_result()
    }

    /// Runs a prepared query with paging.\
    /// Returns an async iterator (stream) over all received rows.
    pub async fn execute_iter(
        &self,
        prepared: impl Into<PreparedStatement>,
        values: impl ValueList,
    ) -> Result<RowIterator, QueryError> {
        let prepared = prepared.into();
        let serialized_values = values.serialized()?.into_owned();

        let token = prepared.calculate_token(&serialized_values)?;
        let statement_info = Statement {
            token,
            keyspace: prepared.get_keyspace_name().map(ToOwned::to_owned),
        };

        RowIterator::new_for_prepared_statement(PreparedIteratorConfig {
            prepared,
            values: serialized_values,
            statement_info,
            cache: self.prepared_cache.clone(),
            common: self.row_iterator_config(),
        })
        .await
    }

    /// Performs a batch request.\
    /// Batches contain DML statements (INSERT/UPDATE/DELETE); they are
    /// executed as one unit on the server.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: impl BatchValues,
    ) -> Result<QueryResult, QueryError> {
        // Shorter path for a misconstructed batch: caught before any
        // policy or network work happens.
        if batch.statements.len() > BATCH_STATEMENTS_LIMIT {
            return Err(QueryError::BadQuery(
                BadQuery::TooManyQueriesInBatchStatement(batch.statements.len()),
            ));
        }

        // Extract the token for the load balancer from the first statement.
        let statement_info = match batch.statements.first() {
            Some(BatchStatement::PreparedStatement(ps)) => {
                let token = values
                    .batch_values_iter()
                    .next_serialized()
                    .transpose()?
                    .map(|sv| ps.calculate_token(&sv))
                    .transpose()?
                    .flatten();
                Statement {
                    token,
                    keyspace: ps.get_keyspace_name().map(ToOwned::to_owned),
                }
            }
            _ => Statement::default(),
        };

        let consistency = batch
            .config
            .determine_consistency(self.config.default_consistency);
        let serial_consistency = batch
            .config
            .serial_consistency
            .or(self.config.default_serial_consistency);

        let values_ref = &values;

        let run_query_result = self
            .run_query(
                statement_info,
                &batch.config,
                |node| async move { node.random_connection().await },
                |connection: Arc<Connection>, consistency: Consistency| async move {
                    connection
                        .batch_with_consistency(
                            batch,
                            values_ref,
                            consistency,
                            serial_consistency,
                        )
                        .await
                },
                consistency,
            )
            .await?;

        match run_query_result {
            RunQueryResult::IgnoredWriteError => Ok(QueryResult::default()),
            RunQueryResult::Completed(result) => Ok(result),
        }
    }

    /// Sends `USE <keyspace_name>` request on all connections.\
    /// This allows to write `SELECT * FROM table` instead of
    /// `SELECT * FROM keyspace.table`.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), QueryError> {
        let keyspace_name = keyspace_name.into();
        self.keyspace_name
            .store(Some(Arc::new(keyspace_name.clone())));

        self.cluster
            .use_keyspace(VerifiedKeyspaceName::new(keyspace_name, case_sensitive)?)
            .await?;

        Ok(())
    }

    /// Manually trigger a metadata refresh\
    /// The driver will fetch the current node list and the schema.
    ///
    /// Normally this is not needed: the driver should automatically detect
    /// all cluster changes through the server event channels.
    pub async fn refresh_metadata(&self) -> Result<(), QueryError> {
        self.cluster.refresh_metadata().await
    }

    /// Access metrics collected by the driver\
    /// Driver collects various metrics like number of queries or retries.
    pub fn get_metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Access cluster data collected by the driver\
    /// Driver collects various information about the network topology and
    /// the cluster schema.
    pub fn get_cluster_data(&self) -> Arc<ClusterData> {
        self.cluster.get_data()
    }

    /// Fetches the schema version from every reachable node and returns it
    /// when they all agree.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, QueryError> {
        let cluster_data = self.get_cluster_data();
        let connections_iter = cluster_data.iter_working_connections()?;

        let handles = connections_iter.map(|c| async move { c.fetch_schema_version().await });
        let versions = futures::future::try_join_all(handles).await?;

        let local_version: Uuid = versions[0];
        let in_agreement = versions.into_iter().all(|v| v == local_version);
        Ok(in_agreement.then_some(local_version))
    }

    /// Waits until all nodes agree on one schema version, or the timeout
    /// elapses.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, QueryError> {
        const SCHEMA_AGREEMENT_INTERVAL: Duration = Duration::from_millis(200);
        const SCHEMA_AGREEMENT_TIMEOUT: Duration = Duration::from_secs(60);

        let waiter = async {
            loop {
                if let Some(agreed_version) = self.check_schema_agreement().await? {
                    return Ok(agreed_version);
                }
                tokio::time::sleep(SCHEMA_AGREEMENT_INTERVAL).await;
            }
        };

        timeout(SCHEMA_AGREEMENT_TIMEOUT, waiter)
            .await
            .unwrap_or(Err(QueryError::ClientTimeout(
                "schema agreement not reached in time".to_owned(),
            )))
    }

    fn row_iterator_config(&self) -> RowIteratorConfig {
        RowIteratorConfig {
            policy: self.config.host_selection_policy.clone(),
            retry_policy: self.config.retry_policy.clone(),
            default_consistency: self.config.default_consistency,
            cluster_data: self.cluster.get_data(),
            metrics: self.metrics.clone(),
        }
    }

    async fn handle_set_keyspace_response(
        &self,
        response: &NonErrorQueryResponse,
    ) -> Result<(), QueryError> {
        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(
                "Detected USE KEYSPACE query, setting session's keyspace to {}",
                set_keyspace.keyspace_name
            );
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }

        Ok(())
    }

    // Computes routing information for an unprepared statement with bound
    // values. The needed partition key layout is learned by preparing the
    // statement once (single-flight) and cached under a bound.
    async fn routing_info_for_unprepared(
        &self,
        statement_text: &str,
        serialized_values: &SerializedValues,
    ) -> Statement {
        let keyspace = self.keyspace_name.load_full().map(|ks| (*ks).clone());

        if serialized_values.is_empty() {
            return Statement {
                token: None,
                keyspace,
            };
        }

        let key = self
            .routing_info_cache
            .key(keyspace.as_deref(), statement_text);

        let cluster = self.cluster.get_data();
        let routing_info = self
            .routing_info_cache
            .get_or_fetch(key, || async {
                let connection = cluster
                    .iter_working_connections()?
                    .next()
                    .expect("iter_working_connections returns nonempty iterator or errors");
                let prepared = connection.prepare(&Query::new(statement_text)).await?;
                Ok(RoutingKeyInfo {
                    pk_indexes: prepared.get_prepared_metadata().pk_indexes.clone(),
                    partitioner: self.pick_partitioner_for(&prepared, &cluster),
                    keyspace: prepared.get_keyspace_name().map(ToOwned::to_owned),
                })
            })
            .await;

        match routing_info {
            Ok(info) => {
                let token = crate::routing::compute_routing_key(&info.pk_indexes, serialized_values)
                    .ok()
                    .flatten()
                    .map(|routing_key| info.partitioner.hash(&routing_key));
                Statement {
                    token,
                    keyspace: info.keyspace.clone().or(keyspace),
                }
            }
            Err(err) => {
                // Routing info is an optimization; execute without it.
                trace!("Could not compute routing info: {}", err);
                Statement {
                    token: None,
                    keyspace,
                }
            }
        }
    }

    // The per-query state machine: iterate over the policy's plan,
    // retrying per the retry policy, optionally racing speculative
    // executions, within the configured request deadline.
    async fn run_query<'a, ConnFut, QueryFut, ResT>(
        &'a self,
        statement_info: Statement,
        statement_config: &'a StatementConfig,
        choose_connection: impl Fn(Arc<crate::transport::node::Node>) -> ConnFut,
        do_query: impl Fn(Arc<Connection>, Consistency) -> QueryFut,
        consistency: Consistency,
    ) -> Result<RunQueryResult<ResT>, QueryError>
    where
        ConnFut: Future<Output = Result<Arc<Connection>, QueryError>>,
        QueryFut: Future<Output = Result<ResT, QueryError>>,
        ResT: NonErrorResult,
    {
        let runner = async {
            let cluster_data = self.cluster.get_data();
            let policy = &self.config.host_selection_policy;

            let retry_policy = statement_config
                .retry_policy
                .as_ref()
                .unwrap_or(&self.config.retry_policy);

            let speculative_policy = statement_config
                .speculative_execution_policy
                .as_ref()
                .or(self.config.speculative_execution_policy.as_ref());

            match speculative_policy {
                // Only idempotent statements are raced speculatively: a
                // losing attempt may still have been applied by the server.
                Some(speculative) if statement_config.is_idempotent => {
                    let query_plan = policy.plan(&statement_info, &cluster_data);

                    // One plan feeds every concurrent attempt.
                    let shared_query_plan = ConcurrentPlan {
                        iter: std::sync::Mutex::new(query_plan),
                    };

                    let execute_query_generator = |_is_speculative: bool| {
                        self.execute_query(
                            &shared_query_plan,
                            &choose_connection,
                            &do_query,
                            ExecuteQueryContext {
                                is_idempotent: statement_config.is_idempotent,
                                consistency,
                                retry_session: retry_policy.new_session(),
                            },
                        )
                    };

                    let context = speculative_execution::Context {
                        metrics: self.metrics.clone(),
                    };

                    speculative_execution::execute(
                        speculative.as_ref(),
                        &context,
                        execute_query_generator,
                    )
                    .await
                }
                _ => {
                    let query_plan = policy.plan(&statement_info, &cluster_data);
                    self.execute_query(
                        query_plan,
                        &choose_connection,
                        &do_query,
                        ExecuteQueryContext {
                            is_idempotent: statement_config.is_idempotent,
                            consistency,
                            retry_session: retry_policy.new_session(),
                        },
                    )
                    .await
                    .unwrap_or(Err(QueryError::ProtocolError(
                        "Empty query plan - driver bug!",
                    )))
                }
            }
        };

        let effective_timeout = statement_config
            .request_timeout
            .or(self.config.request_timeout);
        match effective_timeout {
            Some(request_timeout) => timeout(request_timeout, runner)
                .await
                .unwrap_or_else(|_| {
                    Err(QueryError::ClientTimeout(format!(
                        "Request took longer than {}ms",
                        request_timeout.as_millis()
                    )))
                }),
            None => runner.await,
        }
    }

    async fn execute_query<ConnFut, QueryFut, ResT>(
        &self,
        query_plan: impl IntoIterator<Item = Arc<crate::transport::node::Node>>,
        choose_connection: impl Fn(Arc<crate::transport::node::Node>) -> ConnFut,
        do_query: impl Fn(Arc<Connection>, Consistency) -> QueryFut,
        mut context: ExecuteQueryContext,
    ) -> Option<Result<RunQueryResult<ResT>, QueryError>>
    where
        ConnFut: Future<Output = Result<Arc<Connection>, QueryError>>,
        QueryFut: Future<Output = Result<ResT, QueryError>>,
        ResT: NonErrorResult,
    {
        let mut last_error: Option<QueryError> = None;
        let mut current_consistency: Consistency = context.consistency;

        'plan: for node in query_plan {
            trace!(node = %node.address, "Executing query");
            'retry_on_node: loop {
                let connection: Arc<Connection> = match choose_connection(node.clone()).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        trace!(error = %e, "Choosing connection failed");
                        // No request was sent, so the failure metrics stay
                        // untouched; just move down the plan.
                        last_error = Some(e);
                        continue 'plan;
                    }
                };

                self.metrics.inc_total_nonpaged_queries();
                let query_start = std::time::Instant::now();

                trace!(connection = %connection.get_connect_address(), "Sending");
                let query_result: Result<ResT, QueryError> =
                    do_query(connection, current_consistency).await;

                let elapsed = query_start.elapsed();
                node.note_request_latency(elapsed);
                last_error = match query_result {
                    Ok(response) => {
                        trace!("Query succeeded");
                        let _ = self.metrics.log_query_latency(elapsed.as_millis() as u64);
                        return Some(Ok(RunQueryResult::Completed(response)));
                    }
                    Err(e) => {
                        trace!(last_error = %e, "Query failed");
                        self.metrics.inc_failed_nonpaged_queries();
                        Some(e)
                    }
                };

                let the_error: &QueryError = last_error.as_ref().unwrap();
                // Use the retry policy to decide what to do next
                let query_info = QueryInfo {
                    error: the_error,
                    is_idempotent: context.is_idempotent,
                    consistency: context.consistency,
                };

                let retry_decision = context.retry_session.decide_should_retry(query_info);
                // A retry that could double-apply a non-idempotent statement
                // is overridden to a rethrow, whatever the policy said.
                let retry_decision =
                    enforce_idempotency_gate(retry_decision, the_error, context.is_idempotent);
                trace!(retry_decision = ?retry_decision);
                match retry_decision {
                    RetryDecision::RetrySameNode(new_cl) => {
                        self.metrics.inc_retries_num();
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'retry_on_node;
                    }
                    RetryDecision::RetryNextNode(new_cl) => {
                        self.metrics.inc_retries_num();
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'plan;
                    }
                    RetryDecision::DontRetry => break 'plan,

                    RetryDecision::IgnoreWriteError => {
                        warn!("Ignoring error per retry policy: {}", the_error);
                        return Some(Ok(RunQueryResult::IgnoredWriteError));
                    }
                };
            }
        }

        last_error.map(Result::Err)
    }
}

// The executor judges an attempt solely by its Result; a success type
// that can still carry a server error would sneak past the retry logic.
// Only types that cannot hold an error may instantiate ResT, which this
// marker trait enforces.
pub(crate) trait NonErrorResult {}

impl NonErrorResult for Uuid {}
impl NonErrorResult for QueryResult {}
impl NonErrorResult for NonErrorQueryResponse {}

struct ExecuteQueryContext {
    is_idempotent: bool,
    consistency: Consistency,
    retry_session: Box<dyn RetrySession>,
}

// Speculative attempts must not revisit nodes the initial attempt
// already tried (and vice versa), so all of them pull from one plan
// behind a mutex.
struct ConcurrentPlan<I>
where
    I: Iterator<Item = Arc<crate::transport::node::Node>>,
{
    iter: std::sync::Mutex<I>,
}

impl<I> Iterator for &ConcurrentPlan<I>
where
    I: Iterator<Item = Arc<crate::transport::node::Node>>,
{
    type Item = Arc<crate::transport::node::Node>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.lock().unwrap().next()
    }
}

// Resolves the given hostname, appending the default port when absent.
async fn resolve_hostname(
    hostname: &str,
    default_port: u16,
) -> Result<Vec<SocketAddr>, NewSessionError> {
    let addresses: Vec<SocketAddr> = match lookup_host(hostname).await {
        Ok(addresses) => addresses.collect(),
        // The hostname most likely came without a port
        Err(_) => lookup_host((hostname, default_port))
            .await
            .map_err(|_| NewSessionError::FailedToResolveAddress(hostname.to_string()))?
            .collect(),
    };

    if addresses.is_empty() {
        return Err(NewSessionError::FailedToResolveAddress(
            hostname.to_string(),
        ));
    }

    Ok(addresses)
}
